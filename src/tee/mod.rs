//! TEE (Trusted Execution Environment) — establishing trust in an enclave
//!
//! - **Keys**: X25519 public keys, freshness nonces, ephemeral key pairs
//! - **Enclave**: measurements, the quote verification capability, a simulated platform
//! - **Attestation**: verifying a report against an allow-list and a challenge
//! - **Session**: key agreement over the attested key

pub mod attestation;
pub mod enclave;
pub mod keys;
pub mod session;

pub use attestation::{
    AttestationError, AttestationReport, AttestationVerifier, Challenge, EnclaveIdentity,
    MeasurementAllowList, ReportData,
};
pub use enclave::{
    Measurement, QuoteBody, QuoteVerifier, SimulatedEnclave, SimulatedPlatform,
    SimulatedQuoteVerifier, TeeError,
};
pub use keys::{EphemeralKeyPair, FreshnessNonce, PublicKey};
pub use session::{
    ClientIdentity, PeerIdentity, Session, SessionError, SessionEstablisher, SessionSnapshot,
};
