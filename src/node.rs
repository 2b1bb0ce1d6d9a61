use crate::store::Key;
use crate::stream_id::StreamId;

use std::time::Instant;

/// A priority tree node.
///
/// A node represents either a live stream or a virtual placeholder kept to
/// preserve dependency structure (a stream that ended, or one that has only
/// ever been referenced as a dependency).
#[derive(Debug)]
pub(crate) struct Node<T> {
    /// The h2 stream identifier, zero for the root.
    pub id: StreamId,

    /// Stamped by the store at insertion; pairs with caller handles.
    pub generation: u64,

    /// Parent node, `None` only for the root.
    pub parent: Option<Key>,

    /// Effective weight, 1..=256.
    pub weight: u16,

    /// Children in insertion order.
    pub children: Vec<Key>,

    /// Children with at least one enqueued node in their subtree, in the
    /// order they entered the egress tree. This order breaks share ties in
    /// `next_egress`.
    pub enqueued_children: Vec<Key>,

    /// Sum of the weights of all direct children.
    pub total_child_weight: u64,

    /// Sum of the weights of the children in `enqueued_children`.
    pub total_enqueued_weight: u64,

    /// True when this node itself has data ready to send.
    pub enqueued: bool,

    /// The opaque stream handle. `None` makes the node virtual. The tree
    /// never inspects the value.
    pub stream: Option<T>,

    /// Permanent virtual nodes are exempt from expiry and the cap.
    pub permanent: bool,

    /// Order of entry into the virtual state, for oldest-first cap
    /// eviction. `None` while live.
    pub virtual_since: Option<u64>,

    /// Grace deadline while this node is virtual and childless. A stale
    /// queue entry is detected by comparing against this field.
    pub expire_at: Option<Instant>,
}

impl<T> Node<T> {
    pub fn new(id: StreamId, weight: u16, stream: Option<T>) -> Node<T> {
        debug_assert!(weight >= 1 && weight <= 256);

        Node {
            id,
            generation: 0,
            parent: None,
            weight,
            children: Vec::new(),
            enqueued_children: Vec::new(),
            total_child_weight: 0,
            total_enqueued_weight: 0,
            enqueued: false,
            stream,
            permanent: false,
            virtual_since: None,
            expire_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id.is_zero()
    }

    /// True for placeholder nodes, i.e. every non-root node without a
    /// stream handle.
    pub fn is_virtual(&self) -> bool {
        self.stream.is_none() && !self.is_root()
    }

    /// True when this node or any descendant is enqueued.
    pub fn in_egress_tree(&self) -> bool {
        self.enqueued || !self.enqueued_children.is_empty()
    }

    /// Drops the child link to `key`, egress accounting included.
    ///
    /// The caller settles `parent` and any upward propagation.
    pub fn unlink_child(&mut self, key: Key, child_weight: u16, child_in_egress: bool) {
        let pos = self
            .children
            .iter()
            .position(|&c| c == key)
            .expect("child link missing");
        self.children.remove(pos);
        self.total_child_weight -= u64::from(child_weight);

        if child_in_egress {
            self.unlink_enqueued_child(key, child_weight);
        }
    }

    /// Drops `key` from the egress-child list only.
    pub fn unlink_enqueued_child(&mut self, key: Key, child_weight: u16) {
        let pos = self
            .enqueued_children
            .iter()
            .position(|&c| c == key)
            .expect("egress child link missing");
        self.enqueued_children.remove(pos);
        self.total_enqueued_weight -= u64::from(child_weight);
    }

    /// Appends `key` to the egress-child list.
    pub fn link_enqueued_child(&mut self, key: Key, child_weight: u16) {
        debug_assert!(!self.enqueued_children.contains(&key));
        self.enqueued_children.push(key);
        self.total_enqueued_weight += u64::from(child_weight);
    }
}
