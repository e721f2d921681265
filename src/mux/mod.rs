//! The multiplexed terminal I/O plane.
//!
//! [`protocol`] is the pure wire codec for the viewer-facing binary frames,
//! [`queue`] the bounded drop-oldest frame queue, [`client`] the per-viewer
//! scheduler that batches, compresses and resyncs, and [`broadcaster`] the
//! fan-out from session output to every live viewer.

pub mod broadcaster;
pub mod client;
pub mod protocol;
pub mod queue;

pub use broadcaster::{MuxBroadcaster, OutputEvent, ViewerEvent};
pub use client::{MuxClient, MuxClientConfig, SessionOps};
pub use protocol::{MuxFrame, MuxFrameType};
pub use queue::FrameQueue;
