pub mod handler;
pub mod job;
pub mod queue;
pub mod store;

pub use handler::CrawlJobHandler;
pub use job::{CancelFlag, JobRecord, JobState};
pub use queue::{JobContext, JobHandler, JobQueue, QueueMetrics, QueueSettings};
pub use store::RedisJobStore;
