pub mod config;
pub mod logger;
pub mod notify;
pub mod store;
pub mod traits;
pub mod types;
pub mod utils;

pub use logger::*;
pub use notify::{Notification, NotificationKind, NotificationSink, Severity, StoreSink};
pub use store::{MemoryStore, PairId, PersistencePort, StoreError};
pub use traits::*;
pub use types::*;
