//! enclave-mail — trusted channels between hosts and enclaves
//!
//! A remote party verifies an enclave's attestation report, derives a session from
//! the attested key and exchanges authenticated, ordered mail with it. On top of
//! mail, or directly in-process, a call bridge lets either side invoke functions
//! on the other with nested, re-entrant calls.

pub mod call;
pub mod config;
pub mod encoding;
pub mod mail;
pub mod registry;
pub mod storage;
pub mod tee;

#[cfg(test)]
mod proptests;

pub use call::{connect_direct, connect_mail, CallBridge, CallContext, CallError, HandlerError, Side};
pub use config::{BridgeConfig, ConfigError};
pub use mail::{
    LoopbackHub, Mail, MailChannel, MailCodec, MailEnvelope, MailRouter, MinSizePolicy, Transport,
};
pub use registry::SessionRegistry;
pub use storage::{SealingKey, SessionStore, StoreError};
pub use tee::{
    AttestationError, AttestationReport, AttestationVerifier, EnclaveIdentity, EphemeralKeyPair,
    Measurement, MeasurementAllowList, PeerIdentity, QuoteVerifier, SessionEstablisher,
};
