//! Parallel inclusive prefix scans served over a local request channel.
//!
//! A requester puts its values in a shared segment and sends a request record
//! through a named FIFO. The server's dispatcher hands each request to a
//! compute task, which runs a Hillis–Steele scan over a worker pool and writes
//! the result back into the segment.

pub mod channel;
pub mod config;
pub mod data_file;
pub mod dispatcher;
pub mod engine;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod operation;
pub mod prefix_scan;
pub mod request;
pub mod requester;
pub mod segment;
pub mod telemetry;
pub mod wait;
pub mod worker;

pub use config::{Backend, Config};
pub use dispatcher::{run_server, DispatchStats, Dispatcher};
pub use engine::{Engine, IndexHook, Stage};
pub use error::{Result, ScanError};
pub use operation::Operation;
pub use prefix_scan::{stage_count, ScanOutput, Scanner};
pub use request::{Request, RequestRecord};
pub use requester::Requester;
pub use segment::{Attachment, RequesterId, SegmentOwner, SegmentStore, Status, MAX_ELEMENTS};
pub use wait::WaitPolicy;
