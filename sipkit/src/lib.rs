//! # sipkit
//!
//! A rust library that implements the SIP transaction and transport
//! layers of RFC 3261, with the `received`/`rport` handling of RFC 3581
//! and the client transaction updates of RFC 6026.

pub mod config;
pub mod endpoint;
pub mod headers;
pub mod message;
pub mod parser;
pub mod resolver;
pub mod service;
pub mod timer;
pub mod transaction;
pub mod transport;

pub(crate) mod error;

pub use config::Settings;
pub use endpoint::Endpoint;
pub use error::Error;
pub use error::Result;
pub use service::SipService;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::net::SocketAddr;

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());
    let local_name = format!("{}:{}", ip, addr.port());

    local_name
}
