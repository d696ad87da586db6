extern crate self as iskndr_utils;

mod graceful;
pub mod http;
pub mod protocol;
mod safe_ws;
mod subdomain;

pub use graceful::Graceful;
pub use http::{ProxyResponse, ProxyResult};
pub use protocol::{Message, RegisterTunnelMessage, flatten_headers};
pub use safe_ws::SafeWebSocket;
pub use subdomain::{SUBDOMAIN_KEY_LENGTH, compose_public_url, generate_subdomain_key};

/// Path a client dials on the tunnel server to open its control channel.
pub const TUNNEL_CONNECT_PATH: &str = "/tunnel/connect";
