//! Realtime reconciliation
//!
//! Server-pushed row changes are classified per table and either patched into
//! the held query rows or turned into an invalidation that makes the view
//! refetch.

pub mod channel;
pub mod listener;
pub mod phoenix;
pub mod queries;
pub mod reconcile;
pub mod topics;
pub mod transport;

pub use channel::{ChangeAction, ChangePayload, ChannelId, ChannelSpec, ChannelState, TableFilter};
pub use listener::RealtimeListener;
pub use phoenix::PhoenixTransport;
pub use queries::{QueryCache, QueryKey};
pub use reconcile::{RealtimeUpdateEvent, Reconciler, Reconciliation, TableBinding};
pub use topics::{project_activity_channel, task_board_channel, Topic};
pub use transport::{LocalTransport, RealtimeTransport, Subscription};
