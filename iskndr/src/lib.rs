extern crate self as iskndr;

mod config;
pub mod forward;
mod tunnel;

pub use config::{parse_destination, parse_server_url};
pub use tunnel::{ClientWebSocket, TunnelSession, connect, run};
