pub mod entry;
pub mod filter;
pub mod queue;

// Re-export common types
pub use entry::{priority, FrontierEntry, LinkSource, PathClass};
pub use filter::UrlFilter;
pub use queue::Frontier;
