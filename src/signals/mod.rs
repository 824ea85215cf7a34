pub mod merge;
pub mod store;

pub use merge::{apply_context_update, compare_newest_first, merge_signal, sort_newest_first};
pub use store::{RetentionPolicy, SignalStore, StoreSnapshot, SubscriptionId};
