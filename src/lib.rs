//! Cluster VIP membership driven by Maglev consistent hashing.
//!
//! Each node of a cluster sharing a virtual IP runs one controller process.
//! The controller:
//! - registers the node as live in a Redis-backed member registry
//!   (heartbeat-scored markers, pub/sub change notifications)
//! - watches cluster membership and, on every change, rebuilds a Maglev
//!   lookup table over the live backend set
//! - claims exactly the table slots assigned to the local backend in the
//!   kernel's VIP group, releasing the rest
//!
//! Because the table is a pure function of the sorted live set and the table
//! size, every node converges on the same slot ownership without any
//! cross-node coordination beyond the shared membership view, and a
//! membership change remaps close to the minimal number of slots.
//!
//! # Example
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use vip_hashring::{
//!     ClusterIpFile, Config, MemberRegistry, MembershipWatcher, Reconciler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), vip_hashring::Error> {
//!     let config = Config::default();
//!     let session = uuid::Uuid::new_v4();
//!     let mut registry =
//!         MemberRegistry::connect("redis://127.0.0.1:6379", &config.chroot, config.my_id, session)
//!             .await?;
//!     registry.register().await?;
//!
//!     let cancel = CancellationToken::new();
//!     let (events, _watch) = MembershipWatcher::new(registry.clone()).spawn(cancel.clone());
//!
//!     let sink = ClusterIpFile::new(&config.sink_dir, &config.vip);
//!     let mut reconciler = Reconciler::new(config, sink);
//!     reconciler.run(events).await
//! }
//! ```

mod config;
mod error;
mod reconciler;
mod registry;
mod ring;
mod sink;
mod watcher;

pub use config::Config;
pub use error::{Error, ErrorKind};
pub use reconciler::Reconciler;
pub use registry::{MemberEvent, MemberRegistry};
pub use ring::{is_prime, Assignment};
pub use sink::{ClusterIpFile, MemorySink, SinkOp, VipSink};
pub use watcher::{MembershipSnapshot, MembershipWatcher, WatchEvent};
