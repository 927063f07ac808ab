//! Caller-owned cache of established channels, keyed by peer name
//!
//! Nothing is cached implicitly: whoever verifies a peer and establishes a channel
//! inserts it here, and evicts it when the peer is no longer trusted.

use crate::mail::channel::MailChannel;
use crate::tee::attestation::MeasurementAllowList;
use crate::tee::session::PeerIdentity;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    channels: RwLock<HashMap<String, Arc<MailChannel>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for `peer`, returning the channel it replaced.
    ///
    /// A replaced channel is closed.
    pub fn insert(&self, peer: &str, channel: Arc<MailChannel>) -> Option<Arc<MailChannel>> {
        let previous = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string(), channel);
        if let Some(old) = &previous {
            old.close();
            log::info!("Replaced channel for peer '{}'", peer);
        }
        previous
    }

    pub fn lookup(&self, peer: &str) -> Option<Arc<MailChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    /// Remove and close the channel for `peer`
    pub fn evict(&self, peer: &str) -> Option<Arc<MailChannel>> {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if let Some(channel) = &removed {
            channel.close();
            log::info!("Evicted channel for peer '{}'", peer);
        }
        removed
    }

    /// Evict every enclave peer whose measurement is not in `allowed`.
    ///
    /// Client peers carry no measurement and are kept. Returns the evicted peer names.
    pub fn retain_allowed(&self, allowed: &MeasurementAllowList) -> Vec<String> {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let revoked: Vec<String> = channels
            .iter()
            .filter(|(_, channel)| match channel.peer() {
                Some(PeerIdentity::Enclave(id)) => !allowed.contains(&id.measurement),
                Some(PeerIdentity::Client(_)) | None => false,
            })
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in &revoked {
            if let Some(channel) = channels.remove(peer) {
                channel.close();
                log::warn!("Peer '{}' no longer allow-listed, channel closed", peer);
            }
        }
        revoked
    }

    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::channel::{channel_pair, ChannelState};
    use crate::mail::padding::MinSizePolicy;
    use crate::tee::attestation::{AttestationVerifier, EnclaveIdentity};
    use crate::tee::enclave::{Measurement, SimulatedEnclave, SimulatedPlatform};
    use crate::tee::keys::EphemeralKeyPair;

    fn enclave_channel(code: &[u8]) -> (Arc<MailChannel>, EnclaveIdentity) {
        let platform = SimulatedPlatform::new();
        let enclave = SimulatedEnclave::load(&platform, code);
        let verifier = AttestationVerifier::new(platform.verifier());
        let allowed = [*enclave.measurement()].into_iter().collect();
        let challenge = verifier.challenge();
        let (report, _) = enclave.attest(challenge.nonce());
        let identity = verifier.verify(&report, &allowed, challenge).unwrap();

        let channel = MailChannel::new(MinSizePolicy::default());
        channel
            .establish(&EphemeralKeyPair::generate(), &PeerIdentity::Enclave(identity))
            .unwrap();
        (Arc::new(channel), identity)
    }

    #[test]
    fn test_insert_lookup_evict() {
        let registry = SessionRegistry::new();
        let (host, _) = channel_pair();
        let host = Arc::new(host);
        assert!(registry.insert("enclave-a", host.clone()).is_none());
        assert!(Arc::ptr_eq(&registry.lookup("enclave-a").unwrap(), &host));
        assert!(registry.lookup("nobody").is_none());

        let evicted = registry.evict("enclave-a").unwrap();
        assert_eq!(evicted.state(), ChannelState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_replaces_and_closes() {
        let registry = SessionRegistry::new();
        let (first, _) = channel_pair();
        let (second, _) = channel_pair();
        let first = Arc::new(first);
        registry.insert("peer", first.clone());
        registry.insert("peer", Arc::new(second));
        assert_eq!(first.state(), ChannelState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_retain_allowed_evicts_revoked_measurements() {
        let registry = SessionRegistry::new();
        let (good, good_id) = enclave_channel(b"good-enclave");
        let (bad, _) = enclave_channel(b"revoked-enclave");
        let (client, _) = channel_pair();
        registry.insert("good", good.clone());
        registry.insert("bad", bad.clone());
        registry.insert("client", Arc::new(client));

        let allowed: MeasurementAllowList = [good_id.measurement].into_iter().collect();
        let evicted = registry.retain_allowed(&allowed);

        assert_eq!(evicted, vec!["bad".to_string()]);
        assert_eq!(registry.peers(), vec!["client".to_string(), "good".to_string()]);
        assert_eq!(bad.state(), ChannelState::Closed);
        assert!(good.is_established());
        assert_ne!(good_id.measurement, Measurement::of_code(b"revoked-enclave"));
    }
}
