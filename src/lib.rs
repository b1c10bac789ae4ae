pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod transform;

pub use error::{Result, TransformError};
