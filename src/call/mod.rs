//! EnclaveCall — synchronous, re-entrant calls across the enclave boundary
//!
//! - **Frame**: call and return frames, JSON encoded
//! - **Gate**: one chain inside the enclave at a time, re-entrant per chain
//! - **Bridge**: handler registry, invoke/return matching, nested call servicing
//! - **Link**: direct in-process links and mail-carried links

pub mod bridge;
pub mod frame;
pub mod gate;
pub mod link;

pub use bridge::{CallBridge, CallContext, CallError, Handler, HandlerError, Side};
pub use frame::{CallFrame, CallOutcome, ChainId, Frame, ReturnFrame};
pub use gate::{ChainGate, GateGuard};
pub use link::{
    connect_direct, connect_mail, CallMailHandler, DirectLink, FrameLink, MailLink, CALL_TOPIC,
};
