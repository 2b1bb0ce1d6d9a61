use crate::node::Node;
use crate::stream_id::StreamId;

use fnv::FnvHashMap;

use std::ops;

/// Storage for priority tree nodes.
///
/// Nodes live in a slab and reference each other by [`Key`] (slot index).
/// Keys are internal: every key held in a parent or child link is valid by
/// construction. References handed to callers are [`Handle`]s, which pair
/// the slot with the generation stamped on the node at insertion, so a
/// handle kept across the node's destruction fails to resolve instead of
/// aliasing whatever reused the slot.
#[derive(Debug)]
pub(crate) struct Store<T> {
    slab: slab::Slab<Node<T>>,

    /// Maps stream IDs to slab slots, for live and virtual nodes alike. The
    /// root is not registered here.
    ids: FnvHashMap<StreamId, usize>,

    /// Generation stamped on the next inserted node. Generations are unique
    /// per store, never reused.
    next_generation: u64,
}

/// References an entry in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Key(usize);

/// A stable, non-owning reference to a priority tree node.
///
/// Handles survive reparenting and weight updates. A handle to a node that
/// has since been destroyed (removed, expired, evicted, or dropped) is
/// detected and every operation taking it becomes a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub(crate) key: Key,
    pub(crate) generation: u64,
}

// ===== impl Store =====

impl<T> Store<T> {
    pub fn new() -> Self {
        Store {
            slab: slab::Slab::new(),
            ids: FnvHashMap::default(),
            next_generation: 0,
        }
    }

    /// Inserts a node, stamping its generation and registering its ID.
    pub fn insert(&mut self, mut node: Node<T>) -> Key {
        node.generation = self.next_generation;
        self.next_generation += 1;

        let id = node.id;
        let key = self.slab.insert(node);

        if !id.is_zero() {
            assert!(self.ids.insert(id, key).is_none());
        }

        Key(key)
    }

    /// Removes a node, releasing its slot and ID.
    pub fn remove(&mut self, key: Key) -> Node<T> {
        let node = self.slab.remove(key.0);
        self.ids.remove(&node.id);
        node
    }

    pub fn lookup(&self, id: &StreamId) -> Option<Key> {
        self.ids.get(id).map(|&key| Key(key))
    }

    /// Direct access by key without a generation check, for bookkeeping
    /// lists that validate staleness themselves.
    pub fn get(&self, key: Key) -> Option<&Node<T>> {
        self.slab.get(key.0)
    }

    /// Every node key except the root's, in no particular order.
    pub fn node_keys(&self) -> Vec<Key> {
        self.ids.values().map(|&key| Key(key)).collect()
    }

    /// Resolves a caller-held handle, failing for destroyed nodes.
    pub fn resolve(&self, handle: Handle) -> Option<Key> {
        match self.slab.get((handle.key).0) {
            Some(node) if node.generation == handle.generation => Some(handle.key),
            _ => None,
        }
    }

    /// Returns a caller-facing handle for a key known to be occupied.
    pub fn handle(&self, key: Key) -> Handle {
        Handle {
            key,
            generation: self[key].generation,
        }
    }

    /// Number of nodes excluding the root.
    pub fn num_nodes(&self) -> usize {
        self.ids.len()
    }
}

impl<T> ops::Index<Key> for Store<T> {
    type Output = Node<T>;

    fn index(&self, key: Key) -> &Self::Output {
        self.slab.index(key.0)
    }
}

impl<T> ops::IndexMut<Key> for Store<T> {
    fn index_mut(&mut self, key: Key) -> &mut Self::Output {
        self.slab.index_mut(key.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_node(id: u32) -> Node<()> {
        Node::new(StreamId::from(id), 16, None)
    }

    #[test]
    fn insert_and_lookup() {
        let mut store = Store::new();

        let key = store.insert(new_node(1));
        assert_eq!(store.lookup(&StreamId::from(1)), Some(key));
        assert_eq!(store.lookup(&StreamId::from(3)), None);
        assert_eq!(store[key].id, 1);
    }

    #[test]
    fn handle_survives_unrelated_removal() {
        let mut store = Store::new();

        let k1 = store.insert(new_node(1));
        let k3 = store.insert(new_node(3));

        let h1 = store.handle(k1);
        store.remove(k3);

        assert_eq!(store.resolve(h1), Some(k1));
    }

    #[test]
    fn stale_handle_fails_resolution() {
        let mut store = Store::new();

        let k1 = store.insert(new_node(1));
        let h1 = store.handle(k1);

        store.remove(k1);
        assert_eq!(store.resolve(h1), None);

        // The slot is reused, the stale handle still must not resolve.
        let k3 = store.insert(new_node(3));
        assert_eq!(store.resolve(h1), None);
        assert_eq!(store.resolve(store.handle(k3)), Some(k3));
    }

    #[test]
    fn root_is_not_registered() {
        let mut store: Store<()> = Store::new();

        store.insert(Node::new(StreamId::zero(), 1, None));
        assert_eq!(store.num_nodes(), 0);
        assert_eq!(store.lookup(&StreamId::zero()), None);
    }
}
