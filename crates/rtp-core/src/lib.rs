//! # RTP core library for the voxbridge project
//!
//! `rtp-core` owns the media plane of a call:
//!
//! - **Packet codec**: RFC 3550 fixed-header parsing and serialization
//! - **Port pool**: the process-wide set of UDP ports available to calls
//! - **Outbound queue**: the bounded FIFO feeding a call's paced sender
//! - **Session tasks**: the receive loop (with NAT re-learning of the remote
//!   endpoint) and the anti-drift paced send loop
//!
//! One [`session::RtpReceiver`] / [`session::RtpSender`] pair exists per
//! call, both sharing the call's bound socket and stop signal.

pub mod error;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod session;

pub use error::{Error, Result};
pub use packet::{RtpHeader, RtpPacket, RTP_MIN_HEADER_SIZE, RTP_VERSION};
pub use pool::{BoundPort, PortPool, PortPoolConfig};
pub use queue::OutboundQueue;
pub use session::{RtpReceiver, RtpSender, RtpSenderConfig, RtpSessionStats};

/// RTP sequence number type
pub type RtpSequenceNumber = u16;

/// RTP timestamp type
pub type RtpTimestamp = u32;

/// RTP synchronization source identifier type
pub type RtpSsrc = u32;

/// RTP contributing source identifier type
pub type RtpCsrc = u32;
