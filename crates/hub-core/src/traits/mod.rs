//! Collaborator traits for the hub
//!
//! The engine only talks to the outside world through these interfaces.
//!
//! - [`PacketFilter`]: kernel packet-filter chains and entries
//! - [`VpnManagement`]: VPN transport management interface
//! - [`DnsZone`]: DNS zone holding one record per connected identity
//! - [`HubStore`]: persistence of the domain model

pub mod dns_zone;
pub mod packet_filter;
pub mod store;
pub mod vpn;

pub use dns_zone::DnsZone;
pub use packet_filter::{FILTER_TABLE, FilterEntry, PacketFilter, Target};
pub use store::HubStore;
pub use vpn::VpnManagement;
