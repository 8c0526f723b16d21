// # hub-core
//
// Core library for the overlay hub's access-control and connectivity
// reconciliation engine.
//
// ## Architecture Overview
//
// - **Address Allocator** (`pool`): stable first-fit addresses per peer class
// - **Rule / Policy Compiler** (`firewall`): rules and policies to packet-filter chains
// - **Packet-Filter Sync** (`firewall`): skeleton, full resync, teardown
// - **Reconciler** (`reconcile`): connected flags and DNS zone against live VPN state
// - **Inventory Diff** (`inventory`): zone changesets
// - **Job Queue** (`engine::queue`): one worker owns every external mutation
// - **HubEngine** (`engine`): domain events to queued jobs
// - **Admission** (`admission`): join gate, address and FQDN assignment
//
// ## Design Principles
//
// 1. **Separation of Concerns**: core logic only talks to the outside world
//    through the traits in `traits`
// 2. **Event-Driven**: mutations are published as `HubEvent`s, never run inline
// 3. **Library-First**: the daemon is a thin shell around `HubEngine`
// 4. **Idempotency**: every compiler pass flushes and rebuilds what it owns

pub mod admission;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod inventory;
pub mod model;
pub mod pool;
pub mod reconcile;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use admission::{Admission, AdmissionDecision, JoinRequest};
pub use config::{DnsConfig, HubConfig, ManagementConfig, ManagementEndpoint, Secret, StoreConfig};
pub use engine::{Backends, EngineEvent, HubEngine, HubEvent, JobQueue, Submission};
pub use error::{Error, ErrorClass, Result};
pub use firewall::{Firewall, SyncReport};
pub use inventory::{Changeset, Inventory, diff};
pub use pool::{SubnetKey, SubnetPool};
pub use reconcile::{ReconcileReport, Reconciler};
pub use state::{FileStore, MemoryPacketFilter, MemoryStore, MemoryZone};
pub use traits::{DnsZone, HubStore, PacketFilter, VpnManagement};
