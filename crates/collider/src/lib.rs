//! # collider
//!
//! Event-driven network I/O engine.
//!
//! One reactor thread waits on epoll and owns every readiness registration.
//! Socket I/O and user callbacks run on a sharded worker pool. Work that must
//! touch a registration is sent back to the reactor through a lock-free job
//! queue.
//!
//! This crate provides:
//! - `ThreadPool` - sharded FIFO dispatcher for reusable tasks
//! - `Collider` - the reactor, its job queue and the acceptor/connector registry
//! - `Session` - per-connection write queue, lifecycle and buffered read path
//! - `StreamDefragger` - length-prefixed message reassembly
//!
//! ## Example
//!
//! ```rust,ignore
//! use collider::{Acceptor, Collider, Session, SessionListener};
//!
//! let collider = Collider::new(ColliderConfig::from_env())?;
//! collider.add_acceptor(Arc::new(MyAcceptor::new("127.0.0.1:7000".parse()?)));
//! collider.run()?;
//! ```

pub mod thread_pool;
pub mod parking;
pub mod reactor;
pub mod session;
pub mod socket;
pub mod acceptor;
pub mod connector;
pub mod defragger;

// Re-exports
pub use acceptor::Acceptor;
pub use connector::Connector;
pub use defragger::{Feed, Frame, StreamDefragger};
pub use reactor::{Collider, Job, Selector, Token, OP_READ, OP_WRITE};
pub use session::shmem::{ShMem, ShMemChannelIn, ShMemChannelOut};
pub use session::{ReadStats, SendStatus, Session, SessionListener};
pub use socket::SocketOptions;
pub use thread_pool::{Task, ThreadPool};

pub use collider_core::{ColliderConfig, ColliderError, DataBlockCache, Result};
