//! HTTP and WebSocket front end for genrelay.
//!
//! - `GET /health`
//! - `GET /ws`: streaming turns, one at a time per connection
//! - `GET /artifacts?prompt=&style=`: cached artifact lookup
//! - `GET /messages/{id}`: stored message with its artifact associations

pub mod connection;
pub mod router;
pub mod server;

pub use router::{ClientFrame, ServerFrame};
pub use server::GatewayServer;
