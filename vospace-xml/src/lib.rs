//! VOSpace 2.0 node model and XML wire representation.
//!
//! This crate knows how a `<node>` document is structured and how to turn one
//! into a [`Node`] and back. It does not know how to fetch one -- that's
//! `vospace-client`'s job.

pub mod error;
pub mod types;
pub mod xml;

pub use error::ParsingError;
pub use types::{ChildList, EntryInfo, Node, NodeStat, NodeType, Properties, RESERVED_PROPERTIES};
