pub mod events;
pub mod feed;
pub mod queue;

pub use events::{DomainEvent, FeedEvent, NoticeKind, TransportEvent, TransportState};
pub use feed::EventFeed;
pub use queue::{RateLimited, TransportBus};
