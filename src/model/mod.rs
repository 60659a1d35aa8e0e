//! # Object Graph Model
//!
//! Clean DTOs that define the typed object graph.
//! These types cross every boundary: store, index, query, watch and user code.
//!
//! This module is pure data: no I/O, no state, no async.

pub mod node;
pub mod value;
pub mod property_map;

pub use node::{Node, NodeId, NodeKind, LinkSlot, Membership};
pub use value::Value;
pub use property_map::PropertyMap;
