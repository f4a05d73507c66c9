//! Network transports: publish fan-out and subscriber clients.
//!
//! Published messages travel as `[len:u32 LE][bytes]` frames over TCP.
//! Frames are FIFO per publisher-subscriber pair; subscribers joining late
//! miss earlier messages and there is no replay.

pub mod publisher;
pub mod subscriber;

pub use publisher::{FileSink, NullSink, PublisherFanout, Sink, TcpPublisher};
pub use subscriber::{ReadoutSubscriber, Subscriber};
