//! Server-side ingestion: the conversation aggregator and the durable
//! task queue feeding the reconciliation worker pool.

pub mod aggregator;
pub mod queue;

pub use aggregator::{IngestWorker, TrivialFilters};
pub use queue::TaskQueue;
