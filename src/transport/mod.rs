pub mod stomp;
pub mod traits;
pub mod websocket;

pub use stomp::{StompOptions, StompTransport};
pub use traits::{Connector, SubscriptionHandle, Transport, TransportEvent, WsStream};
pub use websocket::TungsteniteConnector;
