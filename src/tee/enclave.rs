//! Enclave identity and the simulated attestation platform
//!
//! Real quote generation and verification belong to the hardware vendor's trust
//! infrastructure. This module models that infrastructure as the [`QuoteVerifier`]
//! capability and ships a software simulation of it:
//! - [`SimulatedPlatform`] holds a platform key and "signs" quotes with HMAC-SHA256
//! - [`SimulatedEnclave`] has a measurement and answers attestation challenges
//! - [`SimulatedQuoteVerifier`] checks quotes produced by the same platform
//!
//! The simulation is NOT hardware-secured. It exists for development and tests.

use super::attestation::{AttestationReport, ReportData};
use super::keys::{EphemeralKeyPair, FreshnessNonce};
use chrono::{DateTime, Utc};
use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroizing;

pub const MEASUREMENT_SIZE: usize = 32;
pub const REPORT_DATA_SIZE: usize = 64;

const QUOTE_MAC_SIZE: usize = 32;
// One SHA256 block, the natural HMAC key size
const PLATFORM_KEY_SIZE: usize = 64;
const SIMULATED_QUOTE_SIZE: usize = MEASUREMENT_SIZE + REPORT_DATA_SIZE + QUOTE_MAC_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Hash identifying exactly which code runs inside an enclave (MRENCLAVE)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Measurement([u8; MEASUREMENT_SIZE]);

impl Measurement {
    pub fn from_bytes(bytes: [u8; MEASUREMENT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MEASUREMENT_SIZE] {
        &self.0
    }

    /// Measure enclave code the way the simulated platform does: SHA256 over the image
    pub fn of_code(code: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(b"enclave-mail-mrenclave-v1");
        h.update(code);
        Self(h.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, TeeError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| TeeError::InvalidMeasurement(format!("{}: {}", s, e)))?;
        let arr: [u8; MEASUREMENT_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            TeeError::InvalidMeasurement(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Measurement({}..)", hex::encode(&self.0[..6]))
    }
}

impl From<Measurement> for String {
    fn from(m: Measurement) -> Self {
        m.to_string()
    }
}

impl TryFrom<String> for Measurement {
    type Error = TeeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Measurement::from_hex(&s)
    }
}

/// Body of a quote once the trust infrastructure has vouched for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteBody {
    pub measurement: Measurement,
    pub report_data: ReportData,
}

/// Quote validation provided by the vendor's trust infrastructure
pub trait QuoteVerifier: Send + Sync {
    fn verify_quote(&self, quote: &[u8]) -> Result<QuoteBody, TeeError>;
}

impl<V: QuoteVerifier + ?Sized> QuoteVerifier for Arc<V> {
    fn verify_quote(&self, quote: &[u8]) -> Result<QuoteBody, TeeError> {
        (**self).verify_quote(quote)
    }
}

/// Software stand-in for the platform's quoting infrastructure
#[derive(Clone)]
pub struct SimulatedPlatform {
    key: Arc<Zeroizing<[u8; PLATFORM_KEY_SIZE]>>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; PLATFORM_KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key: Arc::new(key) }
    }

    /// Quote layout: measurement (32) || report data (64) || HMAC-SHA256 tag (32)
    pub fn quote(&self, measurement: &Measurement, report_data: &ReportData) -> Vec<u8> {
        let mut quote = Vec::with_capacity(SIMULATED_QUOTE_SIZE);
        quote.extend_from_slice(measurement.as_bytes());
        quote.extend_from_slice(report_data.as_bytes());
        let tag = self.mac(&quote).finalize().into_bytes();
        quote.extend_from_slice(&tag);
        quote
    }

    pub fn verifier(&self) -> SimulatedQuoteVerifier {
        SimulatedQuoteVerifier {
            platform: self.clone(),
        }
    }

    fn mac(&self, signed: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&self.key[..]));
        mac.update(b"enclave-mail-simulated-quote-v1");
        mac.update(signed);
        mac
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies quotes produced by one [`SimulatedPlatform`]
#[derive(Clone)]
pub struct SimulatedQuoteVerifier {
    platform: SimulatedPlatform,
}

impl QuoteVerifier for SimulatedQuoteVerifier {
    fn verify_quote(&self, quote: &[u8]) -> Result<QuoteBody, TeeError> {
        if quote.len() != SIMULATED_QUOTE_SIZE {
            return Err(TeeError::InvalidQuote(format!(
                "expected {} bytes, got {}",
                SIMULATED_QUOTE_SIZE,
                quote.len()
            )));
        }
        let (signed, tag) = quote.split_at(MEASUREMENT_SIZE + REPORT_DATA_SIZE);
        self.platform
            .mac(signed)
            .verify_slice(tag)
            .map_err(|_| TeeError::InvalidQuote("platform signature mismatch".into()))?;

        let mut measurement = [0u8; MEASUREMENT_SIZE];
        measurement.copy_from_slice(&signed[..MEASUREMENT_SIZE]);
        let mut report_data = [0u8; REPORT_DATA_SIZE];
        report_data.copy_from_slice(&signed[MEASUREMENT_SIZE..]);

        Ok(QuoteBody {
            measurement: Measurement(measurement),
            report_data: ReportData::from_bytes(report_data),
        })
    }
}

/// An in-process enclave instance running on a [`SimulatedPlatform`]
pub struct SimulatedEnclave {
    /// Unique identifier
    pub id: String,
    measurement: Measurement,
    platform: SimulatedPlatform,
    created_at: DateTime<Utc>,
}

impl SimulatedEnclave {
    /// Load an enclave image; its measurement is derived from the code bytes
    pub fn load(platform: &SimulatedPlatform, code: &[u8]) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let measurement = Measurement::of_code(code);

        log::info!(
            "Simulated enclave loaded: id={}, measurement={:?}",
            &id[..8],
            measurement
        );

        Self {
            id,
            measurement,
            platform: platform.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn summary(&self) -> String {
        format!(
            "Enclave {} | measurement {:?} | loaded {}",
            &self.id[..8],
            self.measurement,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Answer a verifier's challenge.
    ///
    /// Generates a key pair bound to the challenge nonce and returns a report whose
    /// report data carries that public key and the nonce. The key pair stays inside
    /// the enclave and is used to establish the session.
    pub fn attest(&self, challenge: &FreshnessNonce) -> (AttestationReport, EphemeralKeyPair) {
        let keys = EphemeralKeyPair::for_challenge(*challenge);
        let report_data = ReportData::new(&keys.public_key(), challenge);
        let quote = self.platform.quote(&self.measurement, &report_data);

        log::debug!("Enclave {} produced attestation report", &self.id[..8]);

        (
            AttestationReport {
                measurement: self.measurement,
                report_data,
                quote,
            },
            keys,
        )
    }
}

/// Errors from the enclave platform layer
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),
}
