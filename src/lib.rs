//! Hostgate - a multi-tenant HTTP(S) front door
//!
//! This library provides the edge of a multi-tenant web server:
//! - Binds one listener per configured port, plain or TLS, started in order
//! - Selects the certificate for each TLS connection from the SNI hostname
//! - Resolves the tenant for each request from its Host header and port
//! - Redirects requests to the tenant's canonical host, port and protocol
//! - Hands validated requests to a per-tenant handler
//! - Tears every listener down when a fatal event is published

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod listener;
pub mod router;
pub mod tenant;
pub mod tls;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
