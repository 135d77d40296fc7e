//! Versioned routing registry and its change notifications.

pub mod notification;
pub mod object_store;
pub mod snapshot;

pub use notification::{DispatchListener, DispatchNotification, NotificationQueue, Subscription};
pub use object_store::{RoutingStore, Watch};
pub use snapshot::{IndexedSnapshot, ObjectStore};
