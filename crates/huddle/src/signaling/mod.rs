//! Room signaling: the envelope wire format and the polled broadcast channel that
//! carries it.

mod channel;
mod dedupe;
mod envelope;

pub use channel::{ChannelOptions, SignalingChannel};
pub use dedupe::RecentlySeen;
pub use envelope::{EnvelopeKind, IceCandidatePayload, ParticipantMetadata, SignalingEnvelope};

/// Anything that can broadcast envelopes to the room.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: SignalingEnvelope);
}
