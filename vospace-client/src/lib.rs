//! A client for the VOSpace 2.0 remote storage protocol: URI normalization,
//! a mutual-TLS HTTP transport, and a node-level facade over it.
//!
//! The node model and XML wire format live in `vospace-xml`; this crate
//! knows how to turn node operations into HTTP requests against a real
//! (or locally mocked) VOSpace service.

pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod uri;
pub mod vofile;

pub use client::Client;
pub use config::ClientConfig;
pub use credential::Credential;
pub use error::Error;
pub use vofile::{OpenMode, SeekWhence, VOFile};
