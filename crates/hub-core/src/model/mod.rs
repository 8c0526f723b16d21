//! Domain model
//!
//! Entities are plain serde structs; the store assigns ids on insert.

pub mod identity;
pub mod portspec;
pub mod rule;

/// Store-assigned entity id; `0` marks an entity that was never persisted
pub type Id = u64;

pub use identity::{
    ALL_DEVICES, ALL_SERVERS, AccessConfig, ConnectionState, Group, Identity, IdentityKind,
};
pub use portspec::{MULTIPORT_SLOTS, PortRange, PortSpec};
pub use rule::{Policy, Protocol, Rule};
