//! CallBridge — synchronous calls between host and enclave
//!
//! A bridge on each side holds the handlers that side exposes and a [`FrameLink`]
//! to its peer. `invoke` sends a `Call` frame and blocks until the matching
//! `Return` comes back. While it waits, the other side may call back into this
//! one on the same chain; those nested calls are run by the waiting thread, so a
//! chain of calls can bounce between the two sides to any depth.
//!
//! Delivery depends on the link:
//! - inline links (direct, in-process) run an incoming call on the thread that
//!   delivered it, like an ECALL or OCALL
//! - queued links (mail) hand a nested call to the thread already waiting on its
//!   chain, and start a worker thread for a chain seen for the first time
//!
//! Enclave-side bridges pass every incoming call through a [`ChainGate`].
//!
//! A handler that calls [`CallBridge::invoke`] on its own bridge stays on the chain
//! it is handling, exactly as [`CallContext::invoke`] would.

use super::frame::{CallFrame, CallOutcome, ChainId, Frame, ReturnFrame};
use super::gate::ChainGate;
use super::link::FrameLink;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};

/// A function exposed to the other side
pub type Handler =
    Arc<dyn Fn(&CallContext<'_>, &[u8]) -> Result<Option<Vec<u8>>, HandlerError> + Send + Sync>;

thread_local! {
    /// Calls being handled on this thread, innermost last: (bridge address, chain, call id)
    static HANDLING: RefCell<Vec<(usize, ChainId, u64)>> = const { RefCell::new(Vec::new()) };
}

/// Which side of the enclave boundary a bridge lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Enclave,
}

/// Passed to a running handler; issues calls nested in the current one
pub struct CallContext<'a> {
    bridge: &'a CallBridge,
    chain_id: ChainId,
    call_id: u64,
    parent: Option<u64>,
}

impl CallContext<'_> {
    /// Call `function_tag` on the other side, nested in the call being handled
    pub fn invoke(&self, function_tag: &str, payload: &[u8]) -> Result<Option<Vec<u8>>, CallError> {
        self.bridge
            .call_on_chain(self.chain_id, Some(self.call_id), function_tag, payload)
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Id the caller gave the call being handled
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Id of the call the caller was itself handling when it made this one
    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn side(&self) -> Side {
        self.bridge.side
    }
}

#[derive(Default)]
struct MailboxState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Frames waiting for the threads blocked on one chain
#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl Mailbox {
    fn push(&self, frame: Frame) {
        self.lock().frames.push_back(frame);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Next frame for the waiter on `call_id`: its own return, or any nested call.
    ///
    /// Returns for other calls stay queued for their own waiters.
    fn next_for(&self, call_id: u64) -> Option<Frame> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = Self::take(&mut state, call_id) {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn try_next_for(&self, call_id: u64) -> Option<Frame> {
        Self::take(&mut self.lock(), call_id)
    }

    fn take(state: &mut MailboxState, call_id: u64) -> Option<Frame> {
        let pos = state.frames.iter().position(|f| match f {
            Frame::Return(r) => r.call_id == call_id,
            Frame::Call(_) => true,
        })?;
        state.frames.remove(pos)
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ChainSlot {
    mailbox: Arc<Mailbox>,
    waiters: usize,
}

/// Keeps a chain's mailbox registered while a call on it is outstanding
struct ChainEntry<'a> {
    bridge: &'a CallBridge,
    chain_id: ChainId,
    mailbox: Arc<Mailbox>,
}

impl Drop for ChainEntry<'_> {
    fn drop(&mut self) {
        let mut chains = self.bridge.chains();
        if let Some(slot) = chains.get_mut(&self.chain_id) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                chains.remove(&self.chain_id);
            }
        }
    }
}

pub struct CallBridge {
    side: Side,
    handlers: RwLock<HashMap<String, Handler>>,
    link: RwLock<Option<Arc<dyn FrameLink>>>,
    next_call_id: AtomicU64,
    chains: Mutex<HashMap<ChainId, ChainSlot>>,
    gate: Option<ChainGate>,
    me: Weak<CallBridge>,
}

impl CallBridge {
    /// Bridge for `side`; enclave bridges get an entry gate
    pub fn new(side: Side) -> Arc<Self> {
        Self::with_gate(side, side == Side::Enclave)
    }

    pub fn with_gate(side: Side, gated: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            side,
            handlers: RwLock::new(HashMap::new()),
            link: RwLock::new(None),
            next_call_id: AtomicU64::new(0),
            chains: Mutex::new(HashMap::new()),
            gate: gated.then(ChainGate::new),
            me: me.clone(),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }

    /// Expose `handler` to the other side under `function_tag`
    pub fn register<F>(&self, function_tag: &str, handler: F)
    where
        F: Fn(&CallContext<'_>, &[u8]) -> Result<Option<Vec<u8>>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function_tag.to_string(), Arc::new(handler));
    }

    pub fn unregister(&self, function_tag: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(function_tag)
            .is_some()
    }

    pub fn has_handler(&self, function_tag: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(function_tag)
    }

    /// Connect to the peer through `link`, replacing any previous link
    pub fn attach(&self, link: Arc<dyn FrameLink>) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
        log::info!("{:?} bridge attached", self.side);
    }

    /// Drop the link. Callers still waiting get `ChannelClosed`.
    pub fn detach(&self) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = None;
        for slot in self.chains().values() {
            slot.mailbox.close();
        }
        log::info!("{:?} bridge detached", self.side);
    }

    /// Call `function_tag` on the other side and wait for its result.
    ///
    /// Starts a new chain, unless this thread is running a handler of this bridge:
    /// then the call is nested in the one being handled.
    pub fn invoke(&self, function_tag: &str, payload: &[u8]) -> Result<Option<Vec<u8>>, CallError> {
        match self.current_call() {
            Some((chain_id, call_id)) => {
                self.call_on_chain(chain_id, Some(call_id), function_tag, payload)
            }
            None => self.call_on_chain(ChainId::new(), None, function_tag, payload),
        }
    }

    /// Entry point for frames arriving from the peer
    pub fn on_frame(&self, frame: Frame) -> Result<(), CallError> {
        let link = self.link()?;
        log::debug!(
            "{:?} bridge received {} frame call_id={} chain={:?}",
            self.side,
            match frame {
                Frame::Call(_) => "call",
                Frame::Return(_) => "return",
            },
            frame.call_id(),
            frame.chain_id()
        );

        match frame {
            Frame::Return(ret) => match self.mailbox(ret.chain_id) {
                Some(mailbox) => {
                    mailbox.push(Frame::Return(ret));
                    Ok(())
                }
                None => {
                    log::warn!(
                        "{:?} bridge: return for call_id={} on idle chain {:?}",
                        self.side,
                        ret.call_id,
                        ret.chain_id
                    );
                    Err(CallError::Protocol(format!(
                        "no call waiting on chain {}",
                        ret.chain_id
                    )))
                }
            },
            Frame::Call(call) if link.is_inline() => self.execute(call, link.as_ref()),
            Frame::Call(call) => {
                if let Some(mailbox) = self.mailbox(call.chain_id) {
                    mailbox.push(Frame::Call(call));
                    return Ok(());
                }
                self.spawn_worker(call, link)
            }
        }
    }

    // --- Internal helpers ---

    pub(crate) fn call_on_chain(
        &self,
        chain_id: ChainId,
        parent: Option<u64>,
        function_tag: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, CallError> {
        let link = self.link()?;
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let entry = self.enter_chain(chain_id);

        log::debug!(
            "{:?} bridge calling '{}' call_id={} chain={:?} parent={:?}",
            self.side,
            function_tag,
            call_id,
            chain_id,
            parent
        );

        link.send_frame(Frame::Call(CallFrame {
            call_id,
            chain_id,
            parent,
            function_tag: function_tag.to_string(),
            payload: payload.to_vec(),
        }))?;

        if link.is_inline() {
            // The peer ran the call, and everything nested in it, before send_frame returned
            return match entry.mailbox.try_next_for(call_id) {
                Some(Frame::Return(ret)) => ret.outcome.into_result(),
                Some(Frame::Call(call)) => Err(CallError::Protocol(format!(
                    "queued call {} on an inline link",
                    call.call_id
                ))),
                None => Err(CallError::Protocol(format!(
                    "no return for call {}",
                    call_id
                ))),
            };
        }

        loop {
            match entry.mailbox.next_for(call_id) {
                Some(Frame::Return(ret)) => return ret.outcome.into_result(),
                Some(Frame::Call(nested)) => self.execute(nested, link.as_ref())?,
                None => return Err(CallError::ChannelClosed),
            }
        }
    }

    /// Run an incoming call and send its return
    fn execute(&self, call: CallFrame, link: &dyn FrameLink) -> Result<(), CallError> {
        let _turn = self.gate.as_ref().map(|gate| gate.enter(call.chain_id));
        let outcome = self.dispatch(&call);
        link.send_frame(Frame::Return(ReturnFrame {
            call_id: call.call_id,
            chain_id: call.chain_id,
            outcome,
        }))
    }

    fn dispatch(&self, call: &CallFrame) -> CallOutcome {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&call.function_tag)
            .cloned();
        let Some(handler) = handler else {
            log::warn!(
                "{:?} bridge has no handler for '{}'",
                self.side,
                call.function_tag
            );
            return CallOutcome::NoHandler {
                function_tag: call.function_tag.clone(),
            };
        };

        let ctx = CallContext {
            bridge: self,
            chain_id: call.chain_id,
            call_id: call.call_id,
            parent: call.parent,
        };
        let address = self.address();
        HANDLING.with(|h| h.borrow_mut().push((address, call.chain_id, call.call_id)));
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, &call.payload)));
        HANDLING.with(|h| h.borrow_mut().pop());

        match result {
            Ok(Ok(value)) => CallOutcome::Value { value },
            Ok(Err(e)) => {
                log::warn!(
                    "Handler '{}' failed: {}: {}",
                    call.function_tag,
                    e.kind,
                    e.message
                );
                CallOutcome::HandlerThrew {
                    kind: e.kind,
                    message: e.message,
                }
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                log::warn!("Handler '{}' panicked: {}", call.function_tag, message);
                CallOutcome::HandlerThrew {
                    kind: "panic".into(),
                    message,
                }
            }
        }
    }

    /// First call seen on a chain over a queued link: serve it on its own thread
    fn spawn_worker(&self, call: CallFrame, link: Arc<dyn FrameLink>) -> Result<(), CallError> {
        let bridge = self.me.upgrade().ok_or(CallError::ChannelClosed)?;
        let call_id = call.call_id;
        let chain_id = call.chain_id;
        let spawned = std::thread::Builder::new()
            .name(format!("call-{}", &chain_id.to_string()[..8]))
            .spawn(move || {
                if let Err(e) = bridge.execute(call, link.as_ref()) {
                    log::warn!("{:?} bridge worker failed: {}", bridge.side, e);
                }
            });

        if let Err(e) = spawned {
            log::error!("Could not start call worker: {}", e);
            let link = self.link()?;
            link.send_frame(Frame::Return(ReturnFrame {
                call_id,
                chain_id,
                outcome: CallOutcome::HandlerThrew {
                    kind: "worker_unavailable".into(),
                    message: e.to_string(),
                },
            }))?;
        }
        Ok(())
    }

    /// Innermost call this thread is handling for this bridge
    fn current_call(&self) -> Option<(ChainId, u64)> {
        let address = self.address();
        HANDLING.with(|h| {
            h.borrow()
                .iter()
                .rev()
                .find(|(bridge, _, _)| *bridge == address)
                .map(|&(_, chain_id, call_id)| (chain_id, call_id))
        })
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn enter_chain(&self, chain_id: ChainId) -> ChainEntry<'_> {
        let mut chains = self.chains();
        let slot = chains.entry(chain_id).or_insert_with(|| ChainSlot {
            mailbox: Arc::new(Mailbox::default()),
            waiters: 0,
        });
        slot.waiters += 1;
        ChainEntry {
            bridge: self,
            chain_id,
            mailbox: slot.mailbox.clone(),
        }
    }

    fn mailbox(&self, chain_id: ChainId) -> Option<Arc<Mailbox>> {
        self.chains()
            .get(&chain_id)
            .map(|slot| slot.mailbox.clone())
    }

    fn link(&self) -> Result<Arc<dyn FrameLink>, CallError> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CallError::ChannelClosed)
    }

    fn chains(&self) -> MutexGuard<'_, HashMap<ChainId, ChainSlot>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Failures seen by the caller of `invoke`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("No handler registered for '{0}'")]
    NoHandler(String),

    #[error("Handler threw {kind}: {message}")]
    HandlerThrew { kind: String, message: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failure reported by a handler. Only `kind` and `message` cross the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Lets handlers use `?` on nested calls; the inner failure is passed on as-is
impl From<CallError> for HandlerError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::HandlerThrew { kind, message } => Self { kind, message },
            CallError::NoHandler(tag) => Self::new("no_handler", tag),
            CallError::ChannelClosed => Self::new("channel_closed", "channel closed"),
            CallError::Protocol(message) => Self::new("protocol", message),
        }
    }
}
