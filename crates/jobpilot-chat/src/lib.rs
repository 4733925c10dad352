pub mod client;
pub mod envelope;
pub mod inbound;
pub mod mqtt;
pub mod testutil;
pub mod transport;

pub use client::{ChatConfig, ChatProtocolClient, ChatThread, ConnectionState};
pub use envelope::{build_envelope, decode_envelope, encode_envelope};
pub use inbound::{InboundEvent, InboundHandler, ProtocolType, TracingInboundHandler};
pub use transport::{ConnectRequest, Connection, Connector, WsConnector};
