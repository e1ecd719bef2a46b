//! dpsrv server - listener, lifecycle controller and session registry
//!
//! This crate provides the network front-end of the collaborative drawing
//! server:
//! - `listener` - Plain or TLS listening socket, socket activation
//! - `client` - Accepted connection handle (kick, TLS handshake)
//! - `server` - Lifecycle controller (`MultiServer`)
//! - `registry` - Session registry boundary and the bundled `SessionServer`
//! - `status` - Status reporting
//! - `initsys` - Process manager integration
//! - `cli` - Command line entry point
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         dpsrv                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │    Listener     │────▶│        MultiServer          │   │
//! │  │  (TCP / TLS)    │     │  (state, ban check, drain)  │   │
//! │  └─────────────────┘     └──────┬───────────────▲──────┘   │
//! │                                 │ add_client    │ events   │
//! │                                 ▼               │          │
//! │                          ┌──────────────────────┴──────┐   │
//! │                          │       SessionServer         │   │
//! │                          │  (clients, sessions)        │   │
//! │                          └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod client;
pub mod initsys;
pub mod listener;
pub mod registry;
pub mod server;
pub mod status;
