//! Mail envelope and its binary wire format
//!
//! All integers are big endian:
//!
//! ```text
//! version:u8 | sender_pk:32 | seq:u64 | topic_len:u16 | topic | ad_len:u16 | ad |
//! ct_len:u32 | ciphertext | tag:16
//! ```
//!
//! Everything up to and including `ad` is the envelope header. It travels in the
//! clear and is bound to the ciphertext as AEAD associated data, so a router can
//! read the sender, sequence number and topic without being able to alter them.

use crate::tee::keys::{PublicKey, PUBLIC_KEY_SIZE};

pub const ENVELOPE_VERSION: u8 = 1;
pub const TAG_SIZE: usize = 16;
pub const MAX_TOPIC_LEN: usize = 256;
pub const MAX_ASSOCIATED_DATA_LEN: usize = u16::MAX as usize;

/// One sealed message as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEnvelope {
    pub sender_public_key: PublicKey,
    pub sequence_number: u64,
    pub topic: String,
    /// Authenticated but not encrypted
    pub associated_data: Vec<u8>,
    pub encrypted_body: Vec<u8>,
    pub auth_tag: [u8; TAG_SIZE],
}

impl MailEnvelope {
    /// Header bytes authenticated by the AEAD tag
    pub fn header(&self) -> Vec<u8> {
        encode_header(
            &self.sender_public_key,
            self.sequence_number,
            &self.topic,
            &self.associated_data,
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header();
        out.reserve(4 + self.encrypted_body.len() + TAG_SIZE);
        out.extend_from_slice(&(self.encrypted_body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.encrypted_body);
        out.extend_from_slice(&self.auth_tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Malformed(format!(
                "unsupported version {}",
                version
            )));
        }

        let sender_public_key = PublicKey::from_slice(r.take(PUBLIC_KEY_SIZE)?)
            .ok_or_else(|| EnvelopeError::Malformed("sender key".into()))?;
        let sequence_number = r.u64()?;

        let topic_len = r.u16()? as usize;
        let topic = std::str::from_utf8(r.take(topic_len)?)
            .map_err(|_| EnvelopeError::Malformed("topic is not UTF-8".into()))?
            .to_string();
        validate_topic(&topic).map_err(EnvelopeError::Malformed)?;

        let ad_len = r.u16()? as usize;
        let associated_data = r.take(ad_len)?.to_vec();

        let ct_len = r.u32()? as usize;
        let encrypted_body = r.take(ct_len)?.to_vec();

        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(r.take(TAG_SIZE)?);

        if !r.is_empty() {
            return Err(EnvelopeError::Malformed(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }

        Ok(Self {
            sender_public_key,
            sequence_number,
            topic,
            associated_data,
            encrypted_body,
            auth_tag,
        })
    }
}

pub(crate) fn encode_header(
    sender: &PublicKey,
    sequence_number: u64,
    topic: &str,
    associated_data: &[u8],
) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(1 + PUBLIC_KEY_SIZE + 8 + 2 + topic.len() + 2 + associated_data.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(&sequence_number.to_be_bytes());
    out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(&(associated_data.len() as u16).to_be_bytes());
    out.extend_from_slice(associated_data);
    out
}

/// A topic is 1 to 256 bytes of ASCII letters, digits, `-`, `_` and `.`
pub fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic is empty".into());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!(
            "topic is {} bytes, limit is {}",
            topic.len(),
            MAX_TOPIC_LEN
        ));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("topic contains {:?}", c));
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        if self.remaining() < n {
            return Err(EnvelopeError::Malformed(format!(
                "truncated at byte {}: need {}, have {}",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(b))
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, EnvelopeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Per-envelope failures on the receive path.
///
/// The offending envelope is dropped; the channel stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope authentication failed")]
    AuthenticationFailed,

    #[error("Sequence number {seq} rejected, already accepted up to {highest}")]
    SequenceRejected { seq: u64, highest: u64 },
}
