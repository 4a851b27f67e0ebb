//! The worker tasks of the broadcasting pipeline. Each processor owns a
//! bounded input queue and a tokio task; the participant shuts one down by
//! dropping the queue's sender and awaiting the task, which drains its
//! in-flight work before exiting.

pub mod ack;
pub mod commit;
pub mod pre;
pub mod sync;

pub use ack::{AckInput, AckProcessor};
pub use commit::{CommitInput, CommitProcessor};
pub use pre::PreProcessor;
pub use sync::{AckSink, SyncProposalProcessor};
