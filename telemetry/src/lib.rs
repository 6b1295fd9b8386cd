pub mod bus;
pub mod monitors;

pub use bus::{SubscriptionBus, SubscriptionFilter};
pub use monitors::crawl::{CrawlMonitor, TrackedCrawl};
pub use monitors::metadata::MetadataMonitor;
pub use monitors::vectors::VectorStoreMonitor;
