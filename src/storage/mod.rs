pub mod checkpoint;
pub mod datastore;
pub mod input;
pub mod reconcile;
pub mod sink;

// Re-export common types
pub use checkpoint::{CheckpointState, CheckpointStore};
pub use datastore::{Datastore, Filter, RestDatastore};
pub use input::{InputRecord, InputTable};
pub use reconcile::{PushSummary, Reconciler};
pub use sink::{ResultRow, ResultSink};
