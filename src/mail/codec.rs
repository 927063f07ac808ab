//! MailCodec — AES-256-GCM sealing of mail bodies under a session
//!
//! The 96-bit GCM nonce is four zero bytes followed by the big-endian sequence
//! number. Each direction has its own key, so a nonce never repeats under a key as
//! long as the sender's counter never wraps, which [`Session`] guarantees.

use super::envelope::{
    encode_header, validate_topic, EnvelopeError, MailEnvelope, MAX_ASSOCIATED_DATA_LEN, TAG_SIZE,
};
use super::padding::{pad, unpad, MinSizePolicy, PaddingTracker};
use crate::tee::session::{Session, SessionKey};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use zeroize::Zeroize;

// Body length prefix plus padding must fit the u32 ciphertext length field
const MAX_BODY_LEN: usize = u32::MAX as usize - 4;

/// Seals and opens envelopes. Holds the padding state of the sending side.
#[derive(Debug, Default)]
pub struct MailCodec {
    padding: PaddingTracker,
}

impl MailCodec {
    pub fn new(policy: MinSizePolicy) -> Self {
        Self {
            padding: PaddingTracker::new(policy),
        }
    }

    pub fn padding_policy(&self) -> &MinSizePolicy {
        self.padding.policy()
    }

    /// Encrypt `body` for the session's peer, consuming one local sequence number
    pub fn seal(
        &mut self,
        session: &mut Session,
        topic: &str,
        associated_data: &[u8],
        body: &[u8],
    ) -> Result<MailEnvelope, MailError> {
        validate_topic(topic).map_err(MailError::InvalidTopic)?;
        if associated_data.len() > MAX_ASSOCIATED_DATA_LEN {
            return Err(MailError::AssociatedDataTooLarge(associated_data.len()));
        }
        if body.len() > MAX_BODY_LEN {
            return Err(MailError::BodyTooLarge(body.len()));
        }
        if session.local_seq() == u64::MAX {
            return Err(MailError::SequenceExhausted);
        }

        let padded_len = self.padding.padded_len(body.len()).min(MAX_BODY_LEN);
        let mut buffer = pad(body, padded_len);

        let sender = session.local_public_key();
        let seq = session.local_seq();
        let header = encode_header(&sender, seq, topic, associated_data);

        let tag = cipher(session.send_key())
            .encrypt_in_place_detached(&nonce_for(seq), &header, &mut buffer)
            .map_err(|_| MailError::Encryption)?;

        // Only consume the sequence number once the envelope exists
        session.next_local_seq().ok_or(MailError::SequenceExhausted)?;

        let mut auth_tag = [0u8; TAG_SIZE];
        auth_tag.copy_from_slice(&tag);

        Ok(MailEnvelope {
            sender_public_key: sender,
            sequence_number: seq,
            topic: topic.to_string(),
            associated_data: associated_data.to_vec(),
            encrypted_body: buffer,
            auth_tag,
        })
    }

    /// Authenticate and decrypt an envelope from the session's peer.
    ///
    /// The session is updated only when the envelope is accepted.
    pub fn open(
        &self,
        session: &mut Session,
        envelope: &MailEnvelope,
    ) -> Result<Vec<u8>, EnvelopeError> {
        if envelope.sender_public_key != session.peer().public_key() {
            return Err(EnvelopeError::AuthenticationFailed);
        }

        let mut buffer = envelope.encrypted_body.clone();
        let decrypted = cipher(session.recv_key()).decrypt_in_place_detached(
            &nonce_for(envelope.sequence_number),
            &envelope.header(),
            &mut buffer,
            Tag::from_slice(&envelope.auth_tag),
        );
        if decrypted.is_err() {
            return Err(EnvelopeError::AuthenticationFailed);
        }

        if !session.is_fresh(envelope.sequence_number) {
            buffer.zeroize();
            return Err(EnvelopeError::SequenceRejected {
                seq: envelope.sequence_number,
                highest: session.peer_seq().unwrap_or_default(),
            });
        }

        let body = unpad(buffer)?;
        session.accept_peer_seq(envelope.sequence_number);
        Ok(body)
    }
}

fn cipher(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn nonce_for(seq: u64) -> Nonce<U12> {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    Nonce::clone_from_slice(&nonce)
}

/// Failures on the send path, returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Associated data of {0} bytes exceeds the 65535 byte limit")]
    AssociatedDataTooLarge(usize),

    #[error("Body of {0} bytes is too large to seal")]
    BodyTooLarge(usize),

    #[error("Local sequence numbers exhausted, establish a new session")]
    SequenceExhausted,

    #[error("Encryption failed")]
    Encryption,
}
