pub mod clock;
pub mod engine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{PollSummary, SchedulerConfig, SchedulerEngine, SchedulerStats, TickHandler};
