//! Body padding
//!
//! The encrypted plaintext is `body_len:u32 | body | zeros`. How far a body is
//! padded is decided by a [`MinSizePolicy`], so an observer of the ciphertext
//! learns less about the real body length.

use super::envelope::EnvelopeError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_AVERAGE_WINDOW: usize = 20;
/// Largest minimum size a policy may pad to; longer bodies are sealed unpadded
pub const MAX_PADDED_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_AVERAGE_WINDOW: usize = 10_000;
const LEN_PREFIX: usize = 4;

/// How large the padded body must be at minimum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MinSizePolicy {
    /// Every body padded to at least `size` bytes
    Fixed { size: usize },
    /// Pad to the largest body sealed so far
    LargestSeen,
    /// Pad to the mean length of the last `window` bodies
    MovingAverage { window: usize },
}

impl MinSizePolicy {
    /// Reject parameters outside the supported bounds
    pub fn check(&self) -> Result<(), String> {
        match *self {
            MinSizePolicy::Fixed { size } if size > MAX_PADDED_SIZE => Err(format!(
                "fixed padding size {} exceeds {} bytes",
                size, MAX_PADDED_SIZE
            )),
            MinSizePolicy::MovingAverage { window } if window == 0 || window > MAX_AVERAGE_WINDOW => {
                Err(format!(
                    "padding window must be between 1 and {}, got {}",
                    MAX_AVERAGE_WINDOW, window
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for MinSizePolicy {
    fn default() -> Self {
        MinSizePolicy::MovingAverage {
            window: DEFAULT_AVERAGE_WINDOW,
        }
    }
}

/// Running state of a [`MinSizePolicy`] for one sending endpoint
#[derive(Debug, Clone)]
pub struct PaddingTracker {
    policy: MinSizePolicy,
    largest: usize,
    recent: VecDeque<usize>,
    recent_sum: usize,
}

impl PaddingTracker {
    pub fn new(policy: MinSizePolicy) -> Self {
        Self {
            policy,
            largest: 0,
            recent: VecDeque::new(),
            recent_sum: 0,
        }
    }

    pub fn policy(&self) -> &MinSizePolicy {
        &self.policy
    }

    /// Record a body of `body_len` bytes and return the size to pad it to
    pub fn padded_len(&mut self, body_len: usize) -> usize {
        let min = match self.policy {
            MinSizePolicy::Fixed { size } => size,
            MinSizePolicy::LargestSeen => {
                self.largest = self.largest.max(body_len);
                self.largest
            }
            MinSizePolicy::MovingAverage { window } => {
                let window = window.clamp(1, MAX_AVERAGE_WINDOW);
                self.recent.push_back(body_len);
                self.recent_sum += body_len;
                while self.recent.len() > window {
                    if let Some(old) = self.recent.pop_front() {
                        self.recent_sum -= old;
                    }
                }
                self.recent_sum / self.recent.len()
            }
        };
        min.min(MAX_PADDED_SIZE).max(body_len)
    }
}

impl Default for PaddingTracker {
    fn default() -> Self {
        Self::new(MinSizePolicy::default())
    }
}

pub(crate) fn pad(body: &[u8], padded_len: usize) -> Vec<u8> {
    let padded_len = padded_len.max(body.len());
    let mut out = Vec::with_capacity(LEN_PREFIX + padded_len);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out.resize(LEN_PREFIX + padded_len, 0);
    out
}

pub(crate) fn unpad(mut plaintext: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
    if plaintext.len() < LEN_PREFIX {
        return Err(EnvelopeError::Malformed("missing body length".into()));
    }
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(&plaintext[..LEN_PREFIX]);
    let body_len = u32::from_be_bytes(len) as usize;
    let available = plaintext.len() - LEN_PREFIX;
    if body_len > available {
        return Err(EnvelopeError::Malformed(format!(
            "body length {} exceeds {} decrypted bytes",
            body_len, available
        )));
    }
    if plaintext[LEN_PREFIX + body_len..].iter().any(|&b| b != 0) {
        return Err(EnvelopeError::Malformed("non-zero padding".into()));
    }
    plaintext.truncate(LEN_PREFIX + body_len);
    plaintext.drain(..LEN_PREFIX);
    Ok(plaintext)
}
