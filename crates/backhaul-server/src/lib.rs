//! Reverse tunnel server
//!
//! A public port accepts raw TCP from the Internet and routes each
//! connection by its HTTP Host header or TLS SNI. A manager port accepts
//! persistent WebSockets from agents behind NAT. When a public request
//! arrives for a registered domain, the domain's hub asks the agent over
//! its control socket to dial back a data socket for a one-time ticket,
//! then splices the two connections byte for byte.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod manager;
pub mod proxy;
pub mod server;
pub mod sniff;
pub mod stream;
pub mod traffic;

mod splice;

pub use config::ServerConfig;
pub use server::{Server, ServerError, ServerHandle};
