//! Session establishment from an attested key
//!
//! Both parties run X25519 between their local secret and the peer's public key,
//! then HKDF-SHA256 over the shared secret salted with a transcript hash of both
//! public keys and both freshness nonces. The transcript orders the two parties by
//! public key, so each side computes the same session key without agreeing on
//! roles first.
//!
//! The session key is split into one key per direction. Each side seals with
//! `local -> peer` and opens with `peer -> local`, so both may count sequence
//! numbers from zero without ever reusing an AEAD nonce under the same key.

use super::attestation::EnclaveIdentity;
use super::keys::{EphemeralKeyPair, FreshnessNonce, PublicKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SESSION_KEY_SIZE: usize = 32;

const TRANSCRIPT_LABEL: &[u8] = b"enclave-mail transcript v1";
const SESSION_INFO: &[u8] = b"enclave-mail session v1";
const DIRECTION_INFO: &[u8] = b"enclave-mail direction v1";
const SESSION_ID_LABEL: &[u8] = b"enclave-mail session id v1";

/// Symmetric key material, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// The unattested party on the enclave side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub public_key: PublicKey,
    pub nonce: FreshnessNonce,
}

/// Who is on the other end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerIdentity {
    /// An enclave whose report passed verification
    Enclave(EnclaveIdentity),
    /// A host or remote client talking to us from outside the enclave
    Client(ClientIdentity),
}

impl PeerIdentity {
    pub fn public_key(&self) -> PublicKey {
        match self {
            PeerIdentity::Enclave(id) => id.public_key,
            PeerIdentity::Client(id) => id.public_key,
        }
    }

    pub fn nonce(&self) -> FreshnessNonce {
        match self {
            PeerIdentity::Enclave(id) => id.nonce,
            PeerIdentity::Client(id) => id.nonce,
        }
    }
}

impl From<EnclaveIdentity> for PeerIdentity {
    fn from(identity: EnclaveIdentity) -> Self {
        PeerIdentity::Enclave(identity)
    }
}

impl From<ClientIdentity> for PeerIdentity {
    fn from(identity: ClientIdentity) -> Self {
        PeerIdentity::Client(identity)
    }
}

/// Shared state for one ordered pair of communicating parties.
///
/// Owned by a single channel endpoint; callers sharing it across threads must lock.
#[derive(Debug)]
pub struct Session {
    session_key: SessionKey,
    send_key: SessionKey,
    recv_key: SessionKey,
    local_public_key: PublicKey,
    peer: PeerIdentity,
    local_seq: u64,
    peer_seq: Option<u64>,
}

impl Session {
    fn from_parts(
        session_key: SessionKey,
        local_public_key: PublicKey,
        peer: PeerIdentity,
        local_seq: u64,
        peer_seq: Option<u64>,
    ) -> Self {
        let peer_key = peer.public_key();
        let send_key = direction_key(&session_key, &local_public_key, &peer_key);
        let recv_key = direction_key(&session_key, &peer_key, &local_public_key);
        Self {
            session_key,
            send_key,
            recv_key,
            local_public_key,
            peer,
            local_seq,
            peer_seq,
        }
    }

    /// Sequence number the next sealed envelope will carry
    pub fn local_seq(&self) -> u64 {
        self.local_seq
    }

    /// Highest sequence number accepted from the peer, if any
    pub fn peer_seq(&self) -> Option<u64> {
        self.peer_seq
    }

    pub fn local_public_key(&self) -> PublicKey {
        self.local_public_key
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub(crate) fn send_key(&self) -> &SessionKey {
        &self.send_key
    }

    pub(crate) fn recv_key(&self) -> &SessionKey {
        &self.recv_key
    }

    /// Take the next local sequence number. `None` once the counter is spent.
    pub(crate) fn next_local_seq(&mut self) -> Option<u64> {
        if self.local_seq == u64::MAX {
            return None;
        }
        let seq = self.local_seq;
        self.local_seq += 1;
        Some(seq)
    }

    /// Whether `seq` is beyond everything accepted so far
    pub(crate) fn is_fresh(&self, seq: u64) -> bool {
        self.peer_seq.map_or(true, |highest| seq > highest)
    }

    pub(crate) fn accept_peer_seq(&mut self, seq: u64) {
        debug_assert!(self.is_fresh(seq));
        self.peer_seq = Some(seq);
    }

    /// Copy out everything needed to resume this session after a restart.
    ///
    /// The snapshot holds the session key; hand it to a sealing store, never to disk.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_key: *self.session_key.as_bytes(),
            local_public_key: self.local_public_key,
            peer: self.peer,
            local_seq: self.local_seq,
            peer_seq: self.peer_seq,
        }
    }

    /// Rebuild a session from a snapshot. Counters resume exactly where they were.
    pub fn restore(snapshot: &SessionSnapshot) -> Self {
        Self::from_parts(
            SessionKey(snapshot.session_key),
            snapshot.local_public_key,
            snapshot.peer,
            snapshot.local_seq,
            snapshot.peer_seq,
        )
    }

    #[cfg(test)]
    pub(crate) fn session_key_bytes(&self) -> [u8; SESSION_KEY_SIZE] {
        *self.session_key.as_bytes()
    }

    #[cfg(test)]
    pub(crate) fn set_local_seq(&mut self, seq: u64) {
        self.local_seq = seq;
    }
}

/// Serializable session state {session key, counters, peer}.
///
/// The key is zeroized when the snapshot is dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(with = "crate::encoding::hex_array")]
    session_key: [u8; SESSION_KEY_SIZE],
    pub local_public_key: PublicKey,
    pub peer: PeerIdentity,
    pub local_seq: u64,
    pub peer_seq: Option<u64>,
}

impl SessionSnapshot {
    /// Public identifier of the session this snapshot belongs to.
    ///
    /// A one-way hash of the session key: equal for every snapshot of one session,
    /// different after re-establishment.
    pub fn session_id(&self) -> String {
        let mut h = Sha256::new();
        h.update(SESSION_ID_LABEL);
        h.update(self.session_key);
        hex::encode(h.finalize())
    }
}

impl Drop for SessionSnapshot {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

impl std::fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("peer", &self.peer)
            .field("local_seq", &self.local_seq)
            .field("peer_seq", &self.peer_seq)
            .finish_non_exhaustive()
    }
}

/// Derives sessions from a local ephemeral key pair and an identified peer
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionEstablisher;

impl SessionEstablisher {
    pub fn new() -> Self {
        Self
    }

    /// Agree on a session with `peer`. Failure is fatal to this attempt only.
    pub fn establish(
        &self,
        local: &EphemeralKeyPair,
        peer: &PeerIdentity,
    ) -> Result<Session, SessionError> {
        let local_key = local.public_key();
        let peer_key = peer.public_key();
        if local_key == peer_key {
            return Err(SessionError::KeyAgreementFailed(
                "peer presented our own public key".into(),
            ));
        }

        let shared = local.diffie_hellman(&peer_key);
        if !shared.was_contributory() {
            return Err(SessionError::KeyAgreementFailed(
                "peer public key is a low-order point".into(),
            ));
        }

        let transcript = transcript_hash(
            (&local_key, local.nonce()),
            (&peer_key, &peer.nonce()),
        );
        let hk = Hkdf::<Sha256>::new(Some(&transcript), shared.as_bytes());
        let mut okm = [0u8; SESSION_KEY_SIZE];
        hk.expand(SESSION_INFO, &mut okm)
            .map_err(|e| SessionError::KeyAgreementFailed(e.to_string()))?;
        let session_key = SessionKey(okm);
        okm.zeroize();

        log::info!(
            "Session established: local={:?}, peer={:?}",
            local_key,
            peer_key
        );

        Ok(Session::from_parts(session_key, local_key, *peer, 0, None))
    }
}

/// SHA256 over both (public key, nonce) pairs, smaller public key first
fn transcript_hash(
    a: (&PublicKey, &FreshnessNonce),
    b: (&PublicKey, &FreshnessNonce),
) -> [u8; 32] {
    let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    let mut h = Sha256::new();
    h.update(TRANSCRIPT_LABEL);
    h.update(first.0.as_bytes());
    h.update(first.1.as_bytes());
    h.update(second.0.as_bytes());
    h.update(second.1.as_bytes());
    h.finalize().into()
}

fn direction_key(session_key: &SessionKey, sender: &PublicKey, receiver: &PublicKey) -> SessionKey {
    let mut out = [0u8; SESSION_KEY_SIZE];
    // Neither step can fail with a 32-byte PRK and 32-byte output
    if let Ok(hk) = Hkdf::<Sha256>::from_prk(session_key.as_bytes()) {
        let info = [DIRECTION_INFO, sender.as_bytes(), receiver.as_bytes()].concat();
        let _ = hk.expand(&info, &mut out);
    }
    let key = SessionKey(out);
    out.zeroize();
    key
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Key agreement failed: {0}")]
    KeyAgreementFailed(String),
}

/// Host verifies the enclave and both sides derive their sessions
#[cfg(test)]
pub(crate) fn paired_sessions() -> (Session, Session) {
    use crate::tee::attestation::{AttestationVerifier, MeasurementAllowList};
    use crate::tee::enclave::{SimulatedEnclave, SimulatedPlatform};

    let platform = SimulatedPlatform::new();
    let enclave = SimulatedEnclave::load(&platform, b"session-test");
    let verifier = AttestationVerifier::new(platform.verifier());
    let allowed: MeasurementAllowList = [*enclave.measurement()].into_iter().collect();

    let challenge = verifier.challenge();
    let (report, enclave_keys) = enclave.attest(challenge.nonce());
    let identity = verifier.verify(&report, &allowed, challenge).unwrap();

    let host_keys = EphemeralKeyPair::generate();
    let establisher = SessionEstablisher::new();
    let host = establisher
        .establish(&host_keys, &PeerIdentity::Enclave(identity))
        .unwrap();
    let client = ClientIdentity {
        public_key: host_keys.public_key(),
        nonce: *host_keys.nonce(),
    };
    let enclave_side = establisher
        .establish(&enclave_keys, &PeerIdentity::Client(client))
        .unwrap();
    (host, enclave_side)
}
