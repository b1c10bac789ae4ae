pub mod audit;
pub mod coordinator;
pub mod indexer;
pub mod io;
pub mod model;
pub mod service;
pub mod state;

pub use audit::{AuditEvent, AuditKind, AuditSink, MemoryAuditor, TracingAuditor};
pub use coordinator::{Coordinator, CoordinatorDeps, CoordinatorHandle};
pub use indexer::{IncrementOutcome, Indexer};
pub use io::{Document, DestinationWriter, MemoryDestination, Page, SourceReader, VecSource};
pub use model::{DestConfig, JobDefinition, SourceConfig, TaskState, TaskStatus};
pub use service::{TransformService, TransformStats};
pub use state::{TaskEvent, Transition};
