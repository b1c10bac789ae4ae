pub mod eligibility;
pub mod service;
pub mod state;

pub use eligibility::{Eligibility, EligibilityOptions, EligibilitySource};
pub use service::ClusterService;
pub use state::{Assignment, ClusterState, DiscoveryNode, TaskStatusReport};
