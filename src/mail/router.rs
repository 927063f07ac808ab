//! Routing between the byte transport and mail channels
//!
//! Outbound: look up the peer's channel, seal, hand the bytes to a [`Transport`].
//! Inbound: `on_bytes(peer, bytes)` opens the envelope on that peer's channel and
//! dispatches the mail to the handler registered for its topic.
//!
//! Transports are external. [`LoopbackHub`] connects routers inside one process
//! and delivers synchronously on the sending thread.

use super::channel::{ChannelError, Mail};
use super::envelope::validate_topic;
use crate::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Outbound byte delivery to a named peer
pub trait Transport: Send + Sync {
    fn send(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer disconnected: {0}")]
    Disconnected(String),
}

/// Consumer of mail on one topic
pub trait MailHandler: Send + Sync {
    fn on_mail(&self, peer: &str, mail: Mail);
}

impl<F> MailHandler for F
where
    F: Fn(&str, Mail) + Send + Sync,
{
    fn on_mail(&self, peer: &str, mail: Mail) {
        self(peer, mail)
    }
}

pub struct MailRouter {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<String, Arc<dyn MailHandler>>>,
}

impl MailRouter {
    pub fn new(registry: Arc<SessionRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route mail on `topic` to `handler`, replacing any previous handler
    pub fn register(&self, topic: &str, handler: Arc<dyn MailHandler>) -> Result<(), RouterError> {
        validate_topic(topic).map_err(RouterError::InvalidTopic)?;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), handler);
        log::debug!("Handler registered for topic '{}'", topic);
        Ok(())
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    /// Seal and send mail to `peer`. Returns the envelope's sequence number.
    pub fn send(
        &self,
        peer: &str,
        topic: &str,
        associated_data: &[u8],
        body: &[u8],
    ) -> Result<u64, RouterError> {
        let channel = self
            .registry
            .lookup(peer)
            .ok_or_else(|| RouterError::UnknownPeer(peer.to_string()))?;

        let _order = channel.send_guard();
        let envelope = channel.seal(topic, associated_data, body)?;
        self.transport.send(peer, &envelope.to_bytes())?;
        Ok(envelope.sequence_number)
    }

    /// Inbound bytes from `peer`.
    ///
    /// Dropped envelopes are reported by the channel and yield `Ok(())`.
    pub fn on_bytes(&self, peer: &str, bytes: &[u8]) -> Result<(), RouterError> {
        let channel = self
            .registry
            .lookup(peer)
            .ok_or_else(|| RouterError::UnknownPeer(peer.to_string()))?;

        let Some(mail) = channel.receive_bytes(bytes)? else {
            return Ok(());
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mail.topic)
            .cloned();
        match handler {
            Some(handler) => {
                handler.on_mail(peer, mail);
                Ok(())
            }
            None => {
                log::warn!(
                    "No handler for topic '{}' from peer '{}', mail seq={} discarded",
                    mail.topic,
                    peer,
                    mail.sequence_number
                );
                Err(RouterError::NoHandler(mail.topic))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("No channel for peer '{0}'")]
    UnknownPeer(String),

    #[error("No handler for topic '{0}'")]
    NoHandler(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// In-process switchboard connecting named routers
#[derive(Default)]
pub struct LoopbackHub {
    routers: RwLock<HashMap<String, Weak<MailRouter>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the endpoint called `name`
    pub fn transport(self: &Arc<Self>, name: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            hub: self.clone(),
            local: name.to_string(),
        })
    }

    /// Make `router` reachable under `name`
    pub fn attach(&self, name: &str, router: &Arc<MailRouter>) {
        self.routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::downgrade(router));
    }

    pub fn detach(&self, name: &str) {
        self.routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn router(&self, name: &str) -> Result<Arc<MailRouter>, TransportError> {
        let routers = self.routers.read().unwrap_or_else(PoisonError::into_inner);
        let weak = routers
            .get(name)
            .ok_or_else(|| TransportError::UnknownPeer(name.to_string()))?;
        weak.upgrade()
            .ok_or_else(|| TransportError::Disconnected(name.to_string()))
    }
}

/// [`Transport`] delivering straight into another router attached to the same hub
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local: String,
}

impl Transport for LoopbackTransport {
    fn send(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let router = self.hub.router(peer)?;
        // Receive-side failures belong to the receiver, not to the sender
        if let Err(e) = router.on_bytes(&self.local, bytes) {
            log::warn!("Loopback delivery {} -> {} failed: {}", self.local, peer, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::channel::channel_pair;
    use std::sync::Mutex;

    fn connected() -> (Arc<LoopbackHub>, Arc<MailRouter>, Arc<MailRouter>) {
        let hub = LoopbackHub::new();
        let (host_ch, enclave_ch) = channel_pair();

        let host_reg = Arc::new(SessionRegistry::new());
        host_reg.insert("enclave", Arc::new(host_ch));
        let enclave_reg = Arc::new(SessionRegistry::new());
        enclave_reg.insert("host", Arc::new(enclave_ch));

        let host = Arc::new(MailRouter::new(host_reg, hub.transport("host")));
        let enclave = Arc::new(MailRouter::new(enclave_reg, hub.transport("enclave")));
        hub.attach("host", &host);
        hub.attach("enclave", &enclave);
        (hub, host, enclave)
    }

    #[test]
    fn test_dispatch_by_topic() {
        let (_hub, host, enclave) = connected();
        let inbox: Arc<Mutex<Vec<(String, Mail)>>> = Arc::default();
        let sink = inbox.clone();
        enclave
            .register(
                "jobs",
                Arc::new(move |peer: &str, mail: Mail| {
                    sink.lock().unwrap().push((peer.to_string(), mail));
                }),
            )
            .unwrap();

        assert_eq!(host.send("enclave", "jobs", b"", b"first").unwrap(), 0);
        assert_eq!(host.send("enclave", "jobs", b"", b"second").unwrap(), 1);

        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].0, "host");
        assert_eq!(inbox[1].1.body, b"second");
    }

    #[test]
    fn test_unknown_topic_and_peer() {
        let (_hub, host, enclave) = connected();
        assert_eq!(
            host.send("nobody", "jobs", b"", b"x"),
            Err(RouterError::UnknownPeer("nobody".into()))
        );

        let channel = host.registry().lookup("enclave").unwrap();
        let env = channel.seal("unrouted", b"", b"x").unwrap();
        assert_eq!(
            enclave.on_bytes("host", &env.to_bytes()),
            Err(RouterError::NoHandler("unrouted".into()))
        );
        assert!(enclave.register("bad topic", Arc::new(|_: &str, _: Mail| {})).is_err());
    }

    #[test]
    fn test_replayed_bytes_dropped_quietly() {
        let (_hub, host, enclave) = connected();
        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        enclave
            .register("t", Arc::new(move |_: &str, _: Mail| *c.lock().unwrap() += 1))
            .unwrap();

        let env = host
            .registry()
            .lookup("enclave")
            .unwrap()
            .seal("t", b"", b"once")
            .unwrap();
        let bytes = env.to_bytes();
        enclave.on_bytes("host", &bytes).unwrap();
        enclave.on_bytes("host", &bytes).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_detached_peer() {
        let (hub, host, _enclave) = connected();
        hub.detach("enclave");
        assert!(matches!(
            host.send("enclave", "t", b"", b"x"),
            Err(RouterError::Transport(TransportError::UnknownPeer(_)))
        ));
    }
}
