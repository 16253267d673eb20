//! 接入层：广播中枢、回复载荷与 HTTP / WebSocket 服务

mod hub;
mod message;
#[cfg(feature = "server")]
pub mod server;

pub use hub::{BroadcastHub, ChannelListener, DeliveryError, Listener};
pub use message::ChatResult;
