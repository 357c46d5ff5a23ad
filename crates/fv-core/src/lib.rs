//! Functional-verification harness for dataplane agents.
//!
//! Spawns agents, watches their stdout for patterns, drives their
//! lifecycle, and polls external state until it converges.

pub mod launcher;
pub mod node;
pub mod poll;
pub mod process;
pub mod scenario;
pub mod topology;
pub mod watch;

pub use node::{Node, NodeError, NodeIdentity, NodeOptions};
pub use poll::{Poller, Timeout, eventually};
pub use topology::{Infrastructure, LocalInfra, Topology, TopologyOptions, start_topology};
pub use watch::{LineMatch, LogWatcher, Subscription, SubscriptionState};
