//! Remote Attestation — verify enclave identity before trusting its key
//!
//! Protocol:
//! 1. Verifier issues a [`Challenge`] carrying a fresh nonce
//! 2. Enclave answers with an [`AttestationReport`] whose report data embeds its
//!    public key and the challenge nonce
//! 3. Verifier checks the quote with the trust infrastructure, checks the
//!    measurement against an allow-list and the nonce against its challenge
//!
//! Report data layout (64 bytes):
//!
//! | bytes    | content                           |
//! |----------|-----------------------------------|
//! | `0..32`  | enclave X25519 public key         |
//! | `32..64` | freshness nonce from the verifier |

use super::enclave::{Measurement, QuoteVerifier, REPORT_DATA_SIZE};
use super::keys::{FreshnessNonce, PublicKey, NONCE_SIZE, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The 64 bytes of enclave-supplied data bound into a report
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportData(#[serde(with = "crate::encoding::hex_array")] [u8; REPORT_DATA_SIZE]);

impl ReportData {
    pub fn new(public_key: &PublicKey, nonce: &FreshnessNonce) -> Self {
        let mut bytes = [0u8; REPORT_DATA_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(public_key.as_bytes());
        bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE].copy_from_slice(nonce.as_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; REPORT_DATA_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_DATA_SIZE] {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&self.0[..PUBLIC_KEY_SIZE]);
        PublicKey::from_bytes(key)
    }

    pub fn nonce(&self) -> FreshnessNonce {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&self.0[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE]);
        FreshnessNonce::from_bytes(nonce)
    }
}

impl std::fmt::Debug for ReportData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportData")
            .field("public_key", &self.public_key())
            .field("nonce", &self.nonce())
            .finish()
    }
}

/// Hardware-signed evidence binding an enclave measurement to its report data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationReport {
    pub measurement: Measurement,
    pub report_data: ReportData,
    /// Opaque vendor blob, checked by the [`QuoteVerifier`]
    #[serde(with = "crate::encoding::hex_vec")]
    pub quote: Vec<u8>,
}

/// Identity of an enclave that passed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    pub measurement: Measurement,
    pub public_key: PublicKey,
    /// Nonce the report was produced for
    pub nonce: FreshnessNonce,
}

/// Set of enclave measurements the caller is willing to trust.
///
/// An empty list trusts nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementAllowList {
    measurements: BTreeSet<Measurement>,
}

impl MeasurementAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, measurement: Measurement) -> bool {
        self.measurements.insert(measurement)
    }

    pub fn remove(&mut self, measurement: &Measurement) -> bool {
        self.measurements.remove(measurement)
    }

    pub fn contains(&self, measurement: &Measurement) -> bool {
        self.measurements.contains(measurement)
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.measurements.iter()
    }
}

impl FromIterator<Measurement> for MeasurementAllowList {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        Self {
            measurements: iter.into_iter().collect(),
        }
    }
}

/// A verifier-generated nonce for one verification attempt.
///
/// Consumed by [`AttestationVerifier::verify`], so it cannot be used twice.
#[derive(Debug)]
pub struct Challenge {
    nonce: FreshnessNonce,
}

impl Challenge {
    /// The nonce to send to the enclave
    pub fn nonce(&self) -> &FreshnessNonce {
        &self.nonce
    }
}

/// Checks attestation reports on behalf of a party that wants to trust an enclave
pub struct AttestationVerifier<V> {
    quote_verifier: V,
}

impl<V: QuoteVerifier> AttestationVerifier<V> {
    pub fn new(quote_verifier: V) -> Self {
        Self { quote_verifier }
    }

    /// Start a verification attempt
    pub fn challenge(&self) -> Challenge {
        Challenge {
            nonce: FreshnessNonce::random(),
        }
    }

    /// Verify a report produced in answer to `challenge`.
    ///
    /// A failure is terminal for this attempt; start over with a new challenge.
    pub fn verify(
        &self,
        report: &AttestationReport,
        expected: &MeasurementAllowList,
        challenge: Challenge,
    ) -> Result<EnclaveIdentity, AttestationError> {
        let result = self.check(report, expected, &challenge);
        match &result {
            Ok(identity) => log::info!(
                "Attestation verified: measurement={:?}, key={:?}",
                identity.measurement,
                identity.public_key
            ),
            Err(e) => log::warn!(
                "Attestation rejected: measurement={:?}: {}",
                report.measurement,
                e
            ),
        }
        result
    }

    fn check(
        &self,
        report: &AttestationReport,
        expected: &MeasurementAllowList,
        challenge: &Challenge,
    ) -> Result<EnclaveIdentity, AttestationError> {
        // 1. The trust infrastructure must vouch for the quote
        let body = self
            .quote_verifier
            .verify_quote(&report.quote)
            .map_err(|e| AttestationError::BadSignature(e.to_string()))?;

        // 2. The plain fields must be the ones the quote covers
        if body.measurement != report.measurement || body.report_data != report.report_data {
            return Err(AttestationError::BadSignature(
                "report fields differ from the signed quote".into(),
            ));
        }

        // 3. Measurement must be allow-listed
        if !expected.contains(&body.measurement) {
            return Err(AttestationError::MeasurementMismatch(body.measurement));
        }

        // 4. The report must have been produced for this challenge
        let nonce = body.report_data.nonce();
        if nonce != challenge.nonce {
            return Err(AttestationError::StaleReport);
        }

        Ok(EnclaveIdentity {
            measurement: body.measurement,
            public_key: body.report_data.public_key(),
            nonce,
        })
    }
}

/// Attestation failures, always surfaced to the initiating caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestationError {
    #[error("Quote signature invalid: {0}")]
    BadSignature(String),

    #[error("Measurement {0} is not in the allow-list")]
    MeasurementMismatch(Measurement),

    #[error("Report was not produced for this challenge")]
    StaleReport,
}
