//! Business logic of one Meeseeks box: cluster state, pool/task supervision,
//! peer gossip, job routing, the inbound wire listener, and a client façade.
//! Paired with `meeseeks-core` (shared types) and driven by the `meeseeksd`
//! binary crate, which owns process-level config loading and signal handling.

pub mod client;
pub mod patch;
pub mod peer;
pub mod pool;
pub mod router;
pub mod state;
pub mod task;
pub mod tls;
pub mod transport;

pub use client::{Client, JobHandle};
pub use peer::{PeerConfig, PeerLink};
pub use pool::{Pool, PoolConfig};
pub use router::{BoxNode, RequestHandler, RouterConfig};
pub use state::{State, StateConfig};
pub use task::Task;
pub use tls::TlsConfig;
