// # Backend Implementations
//
// Store, zone and packet-filter implementations that live in the core:
// the persistent file store, and in-memory variants used by tests and
// by deployments without a zone API.

pub mod file;
pub mod filter;
pub mod memory;
pub mod snapshot;
pub mod zone;

pub use file::FileStore;
pub use filter::MemoryPacketFilter;
pub use memory::MemoryStore;
pub use snapshot::Snapshot;
pub use zone::MemoryZone;
