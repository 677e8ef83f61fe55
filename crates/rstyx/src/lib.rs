#![forbid(unsafe_code)]
//! Asynchronous 9P2000 and Styx server engine for Rust.
//!
//! This crate serves a file tree over the two binary dialects of the Plan 9
//! file protocol: 9P2000 (length-prefixed messages, types 100 to 127) and
//! Styx, the older Inferno encoding with fixed-size fields. Both dialects
//! drive the same per-session engine, so a namespace is written once.
//!
//! # Getting Started
//!
//! 1. Implement [`srv::Namespace`] for your tree
//! 2. Build a [`config::Config`], with [`config::AuthConfig`] if clients
//!    must authenticate
//! 3. Start the server with [`srv::srv_async`], or hand any byte stream to
//!    [`srv::serve_stream`]
//!
//! ```no_run
//! # use rstyx::{config::Config, srv::{Namespace, srv_async}, Result};
//! # async fn run<N: Namespace>(ns: N) -> Result<()> {
//! srv_async(ns, Config::default(), "tcp!0.0.0.0!564").await
//! # }
//! ```
//!
//! # Sessions
//!
//! Every request runs in its own task and may be cancelled by `Tflush`. A
//! reply is only written while its request is still registered, so a
//! flushed request is never answered.
//!
//! # Authentication
//!
//! Clients authenticate either at connection start, by sending keyring
//! framed messages before the first protocol message, or through an auth
//! fid obtained with `Tauth`. Both run p9any negotiation followed by
//! p9sk1 or p9sk2. Authentication at connection start may also key a
//! [`channel::secure::SecureLayer`] for the rest of the session.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
pub mod auth;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod dialect;
pub mod error;
pub mod fcall;
pub mod registry;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
