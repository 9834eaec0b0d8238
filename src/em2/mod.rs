pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod transport;

// Re-export the main types from client
pub use client::{Em2Client, Em2ClientBuilder};
pub use protocol::Protocol;
pub use transport::{ConnectionConfig, Connector, TcpConnector, Transport};
