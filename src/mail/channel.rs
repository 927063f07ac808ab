//! MailChannel — per-peer session state machine
//!
//! ```text
//! Unestablished --establish--> Established --close--> Closed
//! ```
//!
//! A channel owns one [`Session`] and the [`MailCodec`] used with it. Envelopes
//! that fail authentication, arrive out of sequence or cannot be parsed are
//! dropped one at a time and reported to an [`EnvelopeObserver`]; they never
//! close the channel. Closing is explicit and drops the key material.

use super::codec::{MailCodec, MailError};
use super::envelope::{EnvelopeError, MailEnvelope};
use super::padding::MinSizePolicy;
use crate::tee::keys::{EphemeralKeyPair, PublicKey};
use crate::tee::session::{PeerIdentity, Session, SessionError, SessionEstablisher, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// No session yet
    Unestablished,
    /// Session derived, mail may flow
    Established,
    /// Closed for good, keys dropped
    Closed,
}

/// A decrypted delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub sender_public_key: PublicKey,
    pub sequence_number: u64,
    pub topic: String,
    pub associated_data: Vec<u8>,
    pub body: Vec<u8>,
}

/// Receives every envelope a channel drops
pub trait EnvelopeObserver: Send + Sync {
    fn envelope_dropped(&self, channel_id: &str, error: &EnvelopeError);
}

/// Default observer: one `warn` line per dropped envelope
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl EnvelopeObserver for LogObserver {
    fn envelope_dropped(&self, channel_id: &str, error: &EnvelopeError) {
        log::warn!(
            "Channel {} dropped envelope: {}",
            &channel_id[..8.min(channel_id.len())],
            error
        );
    }
}

/// Counters exposed so an outside policy can decide when a peer misbehaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub sealed: u64,
    pub opened: u64,
    pub authentication_failures: u64,
    pub sequence_rejections: u64,
    pub malformed: u64,
}

impl ChannelStats {
    pub fn dropped(&self) -> u64 {
        self.authentication_failures + self.sequence_rejections + self.malformed
    }

    fn record_drop(&mut self, error: &EnvelopeError) {
        match error {
            EnvelopeError::AuthenticationFailed => self.authentication_failures += 1,
            EnvelopeError::SequenceRejected { .. } => self.sequence_rejections += 1,
            EnvelopeError::Malformed(_) => self.malformed += 1,
        }
    }
}

struct ChannelInner {
    state: ChannelState,
    session: Option<Session>,
    codec: MailCodec,
    stats: ChannelStats,
    established_at: Option<DateTime<Utc>>,
}

/// An encrypted, ordered mail channel with one peer
pub struct MailChannel {
    /// Channel identifier
    pub channel_id: String,
    inner: Mutex<ChannelInner>,
    // Held across seal and transport hand-off so envelopes leave in sequence order
    send_order: Mutex<()>,
    observer: Arc<dyn EnvelopeObserver>,
}

impl MailChannel {
    /// Create an unestablished channel
    pub fn new(padding: MinSizePolicy) -> Self {
        Self::with_inner(ChannelInner {
            state: ChannelState::Unestablished,
            session: None,
            codec: MailCodec::new(padding),
            stats: ChannelStats::default(),
            established_at: None,
        })
    }

    /// Resume an established channel from a snapshot
    pub fn restore(snapshot: &SessionSnapshot, padding: MinSizePolicy) -> Self {
        let channel = Self::with_inner(ChannelInner {
            state: ChannelState::Established,
            session: Some(Session::restore(snapshot)),
            codec: MailCodec::new(padding),
            stats: ChannelStats::default(),
            established_at: Some(Utc::now()),
        });
        log::info!(
            "Mail channel {} restored: local_seq={}, peer_seq={:?}",
            &channel.channel_id[..8],
            snapshot.local_seq,
            snapshot.peer_seq
        );
        channel
    }

    fn with_inner(inner: ChannelInner) -> Self {
        Self {
            channel_id: uuid::Uuid::new_v4().to_string(),
            inner: Mutex::new(inner),
            send_order: Mutex::new(()),
            observer: Arc::new(LogObserver),
        }
    }

    /// Replace the default [`LogObserver`]
    pub fn with_observer(mut self, observer: Arc<dyn EnvelopeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Derive the session with `peer`. Only valid once, from `Unestablished`.
    pub fn establish(
        &self,
        local: &EphemeralKeyPair,
        peer: &PeerIdentity,
    ) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Unestablished => {}
            ChannelState::Established => return Err(ChannelError::AlreadyEstablished),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }

        let session = SessionEstablisher::new().establish(local, peer)?;
        inner.session = Some(session);
        inner.state = ChannelState::Established;
        inner.established_at = Some(Utc::now());

        log::info!(
            "Mail channel {} established: peer={:?}",
            &self.channel_id[..8],
            peer.public_key()
        );
        Ok(())
    }

    /// Seal a body for the peer
    pub fn seal(
        &self,
        topic: &str,
        associated_data: &[u8],
        body: &[u8],
    ) -> Result<MailEnvelope, ChannelError> {
        let mut inner = self.lock();
        let ChannelInner {
            state,
            session,
            codec,
            stats,
            ..
        } = &mut *inner;
        let session = established(*state, session)?;
        let envelope = codec.seal(session, topic, associated_data, body)?;
        stats.sealed += 1;

        log::debug!(
            "Channel {} sealed seq={} topic={}",
            &self.channel_id[..8],
            envelope.sequence_number,
            envelope.topic
        );
        Ok(envelope)
    }

    /// Open an envelope from the peer.
    ///
    /// `Ok(None)` means the envelope was dropped and reported to the observer.
    pub fn receive(&self, envelope: &MailEnvelope) -> Result<Option<Mail>, ChannelError> {
        let result = {
            let mut inner = self.lock();
            let ChannelInner {
                state,
                session,
                codec,
                stats,
                ..
            } = &mut *inner;
            let session = established(*state, session)?;
            let result = codec.open(session, envelope);
            match &result {
                Ok(_) => stats.opened += 1,
                Err(e) => stats.record_drop(e),
            }
            result
        };

        match result {
            Ok(body) => Ok(Some(Mail {
                sender_public_key: envelope.sender_public_key,
                sequence_number: envelope.sequence_number,
                topic: envelope.topic.clone(),
                associated_data: envelope.associated_data.clone(),
                body,
            })),
            Err(e) => {
                self.observer.envelope_dropped(&self.channel_id, &e);
                Ok(None)
            }
        }
    }

    /// Parse and open a serialized envelope
    pub fn receive_bytes(&self, bytes: &[u8]) -> Result<Option<Mail>, ChannelError> {
        match MailEnvelope::from_bytes(bytes) {
            Ok(envelope) => self.receive(&envelope),
            Err(e) => {
                {
                    let mut inner = self.lock();
                    established(inner.state, &mut inner.session)?;
                    inner.stats.record_drop(&e);
                }
                self.observer.envelope_dropped(&self.channel_id, &e);
                Ok(None)
            }
        }
    }

    /// Close the channel. Terminal; the session keys are zeroized.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Closed {
            return;
        }
        inner.session = None;
        inner.state = ChannelState::Closed;
        log::info!("Mail channel {} closed", &self.channel_id[..8]);
    }

    /// Copy out the session for sealed persistence
    pub fn snapshot(&self) -> Result<SessionSnapshot, ChannelError> {
        let mut inner = self.lock();
        let state = inner.state;
        let snapshot = established(state, &mut inner.session)?.snapshot();
        Ok(snapshot)
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn is_established(&self) -> bool {
        self.state() == ChannelState::Established
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.lock().session.as_ref().map(|s| *s.peer())
    }

    pub fn local_public_key(&self) -> Option<PublicKey> {
        self.lock().session.as_ref().map(|s| s.local_public_key())
    }

    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.lock().established_at
    }

    /// Get channel summary
    pub fn summary(&self) -> String {
        let inner = self.lock();
        format!(
            "Channel {} | state={:?} | sealed={} | opened={} | dropped={}",
            &self.channel_id[..8],
            inner.state,
            inner.stats.sealed,
            inner.stats.opened,
            inner.stats.dropped(),
        )
    }

    pub(crate) fn send_guard(&self) -> MutexGuard<'_, ()> {
        self.send_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailChannel")
            .field("channel_id", &self.channel_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn established(
    state: ChannelState,
    session: &mut Option<Session>,
) -> Result<&mut Session, ChannelError> {
    match (state, session.as_mut()) {
        (ChannelState::Established, Some(session)) => Ok(session),
        (ChannelState::Closed, _) => Err(ChannelError::Closed),
        _ => Err(ChannelError::NotEstablished),
    }
}

/// Channel failures returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel not established")]
    NotEstablished,

    #[error("Channel already established")]
    AlreadyEstablished,

    #[error("Channel closed")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Mail(#[from] MailError),
}

#[cfg(test)]
pub(crate) fn channel_pair() -> (MailChannel, MailChannel) {
    use crate::tee::session::ClientIdentity;

    let host_keys = EphemeralKeyPair::generate();
    let enclave_keys = EphemeralKeyPair::generate();
    let host = MailChannel::new(MinSizePolicy::default());
    let enclave = MailChannel::new(MinSizePolicy::default());
    host.establish(
        &host_keys,
        &PeerIdentity::Client(ClientIdentity {
            public_key: enclave_keys.public_key(),
            nonce: *enclave_keys.nonce(),
        }),
    )
    .unwrap();
    enclave
        .establish(
            &enclave_keys,
            &PeerIdentity::Client(ClientIdentity {
                public_key: host_keys.public_key(),
                nonce: *host_keys.nonce(),
            }),
        )
        .unwrap();
    (host, enclave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EnvelopeError>>);

    impl EnvelopeObserver for Recorder {
        fn envelope_dropped(&self, _channel_id: &str, error: &EnvelopeError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn test_state_machine() {
        let channel = MailChannel::new(MinSizePolicy::default());
        assert_eq!(channel.state(), ChannelState::Unestablished);
        assert_eq!(
            channel.seal("t", b"", b"x").unwrap_err(),
            ChannelError::NotEstablished
        );

        let (host, _enclave) = channel_pair();
        assert!(host.is_established());
        let keys = EphemeralKeyPair::generate();
        let peer = host.peer().unwrap();
        assert_eq!(
            host.establish(&keys, &peer).unwrap_err(),
            ChannelError::AlreadyEstablished
        );

        host.close();
        assert_eq!(host.state(), ChannelState::Closed);
        assert_eq!(host.seal("t", b"", b"x").unwrap_err(), ChannelError::Closed);
        assert!(host.peer().is_none());
        assert_eq!(
            host.establish(&keys, &peer).unwrap_err(),
            ChannelError::Closed
        );
    }

    #[test]
    fn test_mail_delivery() {
        let (host, enclave) = channel_pair();
        let env = host.seal("jobs", b"meta", b"payload").unwrap();
        let mail = enclave.receive_bytes(&env.to_bytes()).unwrap().unwrap();
        assert_eq!(mail.topic, "jobs");
        assert_eq!(mail.associated_data, b"meta");
        assert_eq!(mail.body, b"payload");
        assert_eq!(mail.sender_public_key, host.local_public_key().unwrap());
        assert_eq!(host.stats().sealed, 1);
        assert_eq!(enclave.stats().opened, 1);
    }

    #[test]
    fn test_bad_envelopes_do_not_close_channel() {
        let recorder = Arc::new(Recorder::default());
        let (host, enclave) = channel_pair();
        let enclave = enclave.with_observer(recorder.clone());

        let first = host.seal("t", b"", b"1").unwrap();
        let second = host.seal("t", b"", b"2").unwrap();
        assert!(enclave.receive(&second).unwrap().is_some());

        // replay, stale, garbage, forged
        assert!(enclave.receive(&second).unwrap().is_none());
        assert!(enclave.receive(&first).unwrap().is_none());
        assert!(enclave.receive_bytes(b"garbage").unwrap().is_none());
        let mut forged = host.seal("t", b"", b"3").unwrap();
        forged.auth_tag[0] ^= 0xff;
        assert!(enclave.receive(&forged).unwrap().is_none());

        let stats = enclave.stats();
        assert_eq!(stats.sequence_rejections, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.authentication_failures, 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 4);
        assert!(enclave.is_established());

        let next = host.seal("t", b"", b"4").unwrap();
        assert_eq!(enclave.receive(&next).unwrap().unwrap().body, b"4");
    }

    #[test]
    fn test_receive_on_closed_channel() {
        let (host, enclave) = channel_pair();
        let env = host.seal("t", b"", b"late").unwrap();
        enclave.close();
        assert_eq!(enclave.receive(&env), Err(ChannelError::Closed));
        assert_eq!(enclave.receive_bytes(b"x"), Err(ChannelError::Closed));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let (host, enclave) = channel_pair();
        let env = host.seal("t", b"", b"before").unwrap();
        enclave.receive(&env).unwrap().unwrap();

        let snapshot = enclave.snapshot().unwrap();
        enclave.close();
        let resumed = MailChannel::restore(&snapshot, MinSizePolicy::default());

        // Replay is still detected after the restart
        assert!(resumed.receive(&env).unwrap().is_none());
        let env2 = host.seal("t", b"", b"after").unwrap();
        assert_eq!(resumed.receive(&env2).unwrap().unwrap().body, b"after");
    }
}
