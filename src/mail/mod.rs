//! Mail — authenticated, ordered, replay-resistant messages over a session
//!
//! - **Envelope**: binary wire format with a cleartext, authenticated header
//! - **Padding**: minimum-size policies hiding body lengths
//! - **Codec**: AES-256-GCM seal/open bound to a session's sequence counters
//! - **Channel**: per-peer state machine with drop reporting
//! - **Router**: topic dispatch and the byte transport boundary

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod padding;
pub mod router;

pub use channel::{
    ChannelError, ChannelState, ChannelStats, EnvelopeObserver, LogObserver, Mail, MailChannel,
};
pub use codec::{MailCodec, MailError};
pub use envelope::{validate_topic, EnvelopeError, MailEnvelope, ENVELOPE_VERSION, TAG_SIZE};
pub use padding::{MinSizePolicy, PaddingTracker};
pub use router::{
    LoopbackHub, LoopbackTransport, MailHandler, MailRouter, RouterError, Transport,
    TransportError,
};
