//! Physical links and their sharing.

pub mod channel;
pub mod endpoint;
pub mod pool;

pub use channel::{
    CallStream, Channel, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, IncomingCall, StreamReceiver,
    StreamSender,
};
pub use endpoint::{Connector, EndpointIdentity, TcpConnector};
pub use pool::{ChannelPool, PoolConfig};
