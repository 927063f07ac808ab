//! Links carrying frames between two bridges
//!
//! - [`DirectLink`]: same process, frames handed over on the calling thread
//! - [`MailLink`]: frames sealed as mail on [`CALL_TOPIC`] and sent through a
//!   [`MailRouter`]; [`CallMailHandler`] feeds the other end's inbound frames
//!   back into its bridge

use super::bridge::{CallBridge, CallError};
use super::frame::Frame;
use crate::mail::channel::Mail;
use crate::mail::router::{MailHandler, MailRouter, RouterError};
use std::sync::{Arc, Weak};

/// Reserved mail topic for call frames
pub const CALL_TOPIC: &str = "enclave-call";

pub trait FrameLink: Send + Sync {
    fn send_frame(&self, frame: Frame) -> Result<(), CallError>;

    /// Whether the peer runs delivered calls before `send_frame` returns
    fn is_inline(&self) -> bool;
}

/// In-process link to a peer bridge
pub struct DirectLink {
    peer: Weak<CallBridge>,
}

impl DirectLink {
    pub fn new(peer: &Arc<CallBridge>) -> Self {
        Self {
            peer: Arc::downgrade(peer),
        }
    }
}

impl FrameLink for DirectLink {
    fn send_frame(&self, frame: Frame) -> Result<(), CallError> {
        let peer = self.peer.upgrade().ok_or(CallError::ChannelClosed)?;
        // Frames cross the boundary as bytes, never as shared objects
        let bytes = frame.encode()?;
        peer.on_frame(Frame::decode(&bytes)?)
    }

    fn is_inline(&self) -> bool {
        true
    }
}

/// Connect two bridges with direct links in both directions
pub fn connect_direct(host: &Arc<CallBridge>, enclave: &Arc<CallBridge>) {
    host.attach(Arc::new(DirectLink::new(enclave)));
    enclave.attach(Arc::new(DirectLink::new(host)));
}

/// Sends frames as mail to one peer
pub struct MailLink {
    router: Arc<MailRouter>,
    peer: String,
}

impl MailLink {
    pub fn new(router: Arc<MailRouter>, peer: &str) -> Self {
        Self {
            router,
            peer: peer.to_string(),
        }
    }
}

impl FrameLink for MailLink {
    fn send_frame(&self, frame: Frame) -> Result<(), CallError> {
        let bytes = frame.encode()?;
        self.router
            .send(&self.peer, CALL_TOPIC, b"", &bytes)
            .map(|_| ())
            .map_err(|e| {
                log::warn!("Call frame to '{}' not sent: {}", self.peer, e);
                CallError::ChannelClosed
            })
    }

    fn is_inline(&self) -> bool {
        false
    }
}

/// Router handler for [`CALL_TOPIC`], delivering frames into a bridge
pub struct CallMailHandler {
    bridge: Weak<CallBridge>,
}

impl CallMailHandler {
    pub fn new(bridge: &Arc<CallBridge>) -> Self {
        Self {
            bridge: Arc::downgrade(bridge),
        }
    }
}

impl MailHandler for CallMailHandler {
    fn on_mail(&self, peer: &str, mail: Mail) {
        let Some(bridge) = self.bridge.upgrade() else {
            log::warn!("Call frame from '{}' for a dropped bridge", peer);
            return;
        };
        let result = Frame::decode(&mail.body).and_then(|frame| bridge.on_frame(frame));
        if let Err(e) = result {
            log::warn!(
                "Call frame from '{}' seq={} rejected: {}",
                peer,
                mail.sequence_number,
                e
            );
        }
    }
}

/// Carry `bridge`'s calls to `peer` as mail through `router`
pub fn connect_mail(
    bridge: &Arc<CallBridge>,
    router: &Arc<MailRouter>,
    peer: &str,
) -> Result<(), RouterError> {
    router.register(CALL_TOPIC, Arc::new(CallMailHandler::new(bridge)))?;
    bridge.attach(Arc::new(MailLink::new(router.clone(), peer)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::bridge::{HandlerError, Side};
    use crate::mail::channel::channel_pair;
    use crate::mail::router::LoopbackHub;
    use crate::registry::SessionRegistry;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    struct MailPair {
        _hub: Arc<LoopbackHub>,
        _routers: (Arc<MailRouter>, Arc<MailRouter>),
        host: Arc<CallBridge>,
        enclave: Arc<CallBridge>,
    }

    fn mail_pair() -> MailPair {
        let hub = LoopbackHub::new();
        let (host_ch, enclave_ch) = channel_pair();

        let host_reg = Arc::new(SessionRegistry::new());
        host_reg.insert("enclave", Arc::new(host_ch));
        let enclave_reg = Arc::new(SessionRegistry::new());
        enclave_reg.insert("host", Arc::new(enclave_ch));

        let host_router = Arc::new(MailRouter::new(host_reg, hub.transport("host")));
        let enclave_router = Arc::new(MailRouter::new(enclave_reg, hub.transport("enclave")));
        hub.attach("host", &host_router);
        hub.attach("enclave", &enclave_router);

        let host = CallBridge::new(Side::Host);
        let enclave = CallBridge::new(Side::Enclave);
        connect_mail(&host, &host_router, "enclave").unwrap();
        connect_mail(&enclave, &enclave_router, "host").unwrap();

        MailPair {
            _hub: hub,
            _routers: (host_router, enclave_router),
            host,
            enclave,
        }
    }

    #[test]
    fn test_call_over_mail() {
        let p = mail_pair();
        p.enclave
            .register("double", |_, payload| Ok(Some(payload.iter().map(|b| b * 2).collect())));
        assert_eq!(p.host.invoke("double", &[1, 2, 3]).unwrap(), Some(vec![2, 4, 6]));
        assert_eq!(
            p.host.invoke("missing", b""),
            Err(CallError::NoHandler("missing".into()))
        );
    }

    #[test]
    fn test_nested_calls_over_mail() {
        let p = mail_pair();
        p.host.register("lookup", |_, key| {
            Ok(Some(format!("value-of-{}", String::from_utf8_lossy(key)).into_bytes()))
        });
        p.enclave.register("resolve", |ctx, keys| {
            let mut out = Vec::new();
            for key in keys.split(|b| *b == b',') {
                out.extend(ctx.invoke("lookup", key)?.unwrap_or_default());
                out.push(b';');
            }
            Ok(Some(out))
        });

        let out = p.host.invoke("resolve", b"a,b").unwrap().unwrap();
        assert_eq!(out, b"value-of-a;value-of-b;");
    }

    #[test]
    fn test_enclave_initiated_chain() {
        let p = mail_pair();
        p.host.register("time", |_, _| Ok(Some(b"noon".to_vec())));
        p.enclave.register("ask_time", |ctx, _| ctx.invoke("time", b"").map_err(HandlerError::from));

        // Enclave starts its own chain towards the host
        assert_eq!(p.enclave.invoke("time", b"").unwrap(), Some(b"noon".to_vec()));
        assert_eq!(p.host.invoke("ask_time", b"").unwrap(), Some(b"noon".to_vec()));
    }

    #[test]
    fn test_gate_over_mail() {
        let p = mail_pair();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        p.enclave.register("work", move |_, payload| {
            e.lock().unwrap().push(payload[0]);
            thread::sleep(Duration::from_millis(10));
            e.lock().unwrap().push(payload[0]);
            Ok(None)
        });

        let workers: Vec<_> = (0..3u8)
            .map(|i| {
                let host = p.host.clone();
                thread::spawn(move || host.invoke("work", &[i]).unwrap())
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 6);
        for pair in events.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_closed_channel_fails_call() {
        let p = mail_pair();
        p.enclave.register("f", |_, _| Ok(None));
        p._routers.0.registry().lookup("enclave").unwrap().close();
        assert_eq!(p.host.invoke("f", b""), Err(CallError::ChannelClosed));
    }
}
