//! Realtime gateway for the chat sync client.
//!
//! Wire frames, the transport seam, an in-memory transport for tests and
//! local runs, and the connection supervisor that drives a session over it.

/// Inbound and outbound wire frames.
pub mod frame;
/// In-process transport pair.
pub mod memory;
/// Outbound frame queue owned by the supervisor.
pub mod outbound;
/// Session actor: connect, identify, heartbeat, resume, reconnect.
pub mod supervisor;
/// Transport and connector traits.
pub mod transport;

pub use frame::{
    AUTH_FAILURE_REASONS, FrameError, InboundFrame, OutboundFrame, ResumeRequest, SequencedFrame,
};
pub use memory::{MemoryConnector, MemoryPeer, MemoryServer, MemoryTransport};
pub use outbound::{OutboundQueue, QueueError};
pub use supervisor::{ConnectionSupervisor, SupervisorHandle};
pub use transport::{Connector, Transport, TransportError};
