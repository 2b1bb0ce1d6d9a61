#![deny(missing_debug_implementations, missing_docs)]
#![doc(html_root_url = "https://docs.rs/h2-priority/0.1.0")]

//! An HTTP/2 stream prioritization tree.
//!
//! This crate implements the dependency tree described by RFC 7540 section
//! 5.3 and answers the question an HTTP/2 egress loop asks at every write
//! opportunity: which streams should transmit next, and with which relative
//! share of the available bandwidth.
//!
//! The tree is fed priority records ([`Priority`]) parsed from PRIORITY
//! frames or HEADERS priority fields by the caller; frame parsing itself is
//! out of scope. Streams toggle readiness with `signal_pending_egress` /
//! `clear_pending_egress`, and the egress loop pulls weighted candidates
//! with `next_egress` or walks the tree with `iterate` / `iterate_bfs`.
//!
//! Nodes whose stream has ended (or that were only ever referenced as a
//! dependency) live on as *virtual* placeholders so that late priority
//! records can still target them. Their retention is bounded: a grace
//! period per node, a global cap, and an explicit `drop_priority_nodes`
//! purge. The grace period is driven by a [`Clock`] collaborator supplied
//! by the embedder; the tree itself never spawns timers.
//!
//! The tree is a single-threaded cooperative structure. No operation
//! blocks or suspends; callers serialize access externally, typically by
//! owning one tree per connection on that connection's I/O task.
//!
//! # Example
//!
//! ```
//! use h2_priority::{Priority, PriorityTree, StreamId};
//!
//! let mut tree = PriorityTree::new();
//!
//! // Stream 1 depends on the root with weight 16 (wire byte 15).
//! let h1 = tree.add(StreamId::from(1), Priority::new(StreamId::zero(), false, 15),
//!                   Some("stream-1"), false).unwrap();
//! // Stream 3 depends on stream 1.
//! let h3 = tree.add(StreamId::from(3), Priority::new(StreamId::from(1), false, 15),
//!                   Some("stream-3"), false).unwrap();
//!
//! tree.signal_pending_egress(h1);
//! tree.signal_pending_egress(h3);
//!
//! // Stream 1 shields its descendants while it has data to send.
//! let next = tree.next_egress();
//! assert_eq!(next.len(), 1);
//! assert_eq!(tree.stream(next[0].0), Some(&"stream-1"));
//! ```

mod error;
mod node;
mod priority;
mod store;
mod stream_id;
mod timer;
mod tree;

pub use crate::error::UserError;
pub use crate::priority::{Priority, DEFAULT_WEIGHT};
pub use crate::store::Handle;
pub use crate::stream_id::StreamId;
pub use crate::timer::{Clock, SystemClock};
pub use crate::tree::PriorityTree;
