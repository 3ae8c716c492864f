pub mod indexer;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;

pub use indexer::normalizer::{ACTION_POINTS, UNRESOLVED_SENDER};
pub use indexer::{LogDiagnostic, ProcessedBatch, process_logs};
