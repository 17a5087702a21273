// Structured overlay for the ring node
//
// The overlay combines the neighborhood views, the random peer source,
// the routing-table behaviors and the gossip-driven ring maintenance.

pub mod cyclon;
pub mod neighborhood;
pub mod rm_tman;
pub mod routing;


pub use cyclon::{spawn_peer_cache, CacheMessage, PeerCache};
pub use neighborhood::Neighborhood;
pub use rm_tman::{spawn_ring_maintenance, NodeDetails, RingMaintenance, RmConfig, RmMessage, RmState};
pub use routing::{replica_keys, RoutingTable, SuccessorRouting, REPLICATION_FACTOR};
