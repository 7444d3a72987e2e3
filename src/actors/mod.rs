//! Actor-based monitoring core
//!
//! Each actor owns its state exclusively and runs as an independent async
//! task, reachable only through its `*Handle` facade over an `mpsc`
//! command channel. `oneshot` channels carry request/response replies;
//! `CheckableEvent`/`ClusterMessage` broadcasts carry fan-out.
//!
//! ## Actor Types
//!
//! - **CheckScheduler**: drives the next-check priority queue and admission (§4.6)
//! - **LocalExecutor**: runs Plugin/Dummy/Sleep/Null/IFW-API commands (§4.7)
//! - **NotificationEngine**: fans a requested notification out to users (§4.8)
//! - **ExternalCommandBus**: applies operator/peer admin operations (§4.9)
//! - **ClusterActor**: best-effort JSON-RPC delivery to cluster endpoints (§4.10)
//! - **Snapshotter**: periodic `ObjectStore` persistence (§4.11)

pub mod cluster;
pub mod command_runner;
pub mod external_commands;
pub mod messages;
pub mod notification;
pub mod persistence;
pub mod scheduler;
