//! Push-based realtime updates.

mod hub;
mod provider;
mod websocket;

pub use hub::{json_decoder, Decoder, RealtimeSubscription, RealtimeSubscriptionHub};
pub use provider::{Listener, ListenerGuard, ListenerStream, RealtimeProvider};
pub use websocket::WebsocketProvider;
