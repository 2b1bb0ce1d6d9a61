use crate::error::UserError;
use crate::node::Node;
use crate::priority::{Priority, DEFAULT_WEIGHT};
use crate::store::{Handle, Key, Store};
use crate::stream_id::StreamId;
use crate::timer::{Clock, SystemClock};

use log::{debug, trace};

use std::cmp::{self, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::mem;
use std::time::{Duration, Instant};

/// The HTTP/2 priority tree.
///
/// Holds one node per stream the endpoint knows about, shaped by the
/// priority records the peer has sent, plus the implicit root (stream 0)
/// and any virtual placeholders. `T` is an opaque per-stream value owned by
/// the caller; the tree stores it and hands it back, nothing more.
///
/// `C` supplies the monotonic time used for virtual node grace deadlines.
/// A tree built with [`PriorityTree::new`] has no timer collaborator and
/// therefore no virtual node retention: removing a stream immediately
/// splices its children up to its parent. A tree built with
/// [`PriorityTree::with_timer`] instead keeps removed streams as virtual
/// placeholders until their grace period lapses.
#[derive(Debug)]
pub struct PriorityTree<T, C = SystemClock> {
    store: Store<T>,

    /// The implicit root, stream 0.
    root: Key,

    /// Time source for grace deadlines. `None` disables retention.
    timer: Option<C>,

    /// Grace period for childless virtual nodes.
    node_lifetime: Duration,

    /// Cap on the number of non-permanent virtual nodes.
    max_virtual_nodes: usize,

    /// Count of non-permanent virtual nodes.
    num_virtual: usize,

    /// Count of nodes with `enqueued` set.
    pending_egress: usize,

    /// Entry order into the virtual state; stamps `virtual_since`.
    next_virtual_seq: u64,

    /// Virtual nodes oldest first, for cap eviction. Entries whose node
    /// has since been destroyed or revived are skipped on pop.
    virtual_order: VecDeque<(u64, Key)>,

    /// Pending grace deadlines, earliest first. Entries are invalidated
    /// lazily: a node that left grace no longer matches its record.
    grace: BinaryHeap<Reverse<GraceEntry>>,
}

/// A scheduled expiry for a virtual node.
#[derive(Debug)]
struct GraceEntry {
    deadline: Instant,
    generation: u64,
    key: Key,
}

const DEFAULT_NODE_LIFETIME: Duration = Duration::from_secs(30);
const DEFAULT_MAX_VIRTUAL_NODES: usize = 50;

// ===== impl PriorityTree =====

impl<T> PriorityTree<T, SystemClock> {
    /// Creates a tree without a timer collaborator.
    ///
    /// Virtual node retention is disabled: a removed stream's children are
    /// promoted to its parent on the spot, with their weights rescaled per
    /// RFC 7540 section 5.3.4.
    pub fn new() -> PriorityTree<T, SystemClock> {
        PriorityTree::build(None)
    }
}

impl<T> Default for PriorityTree<T, SystemClock> {
    fn default() -> Self {
        PriorityTree::new()
    }
}

impl<T, C> PriorityTree<T, C>
where
    C: Clock,
{
    /// Creates a tree with virtual node retention driven by `timer`.
    ///
    /// The embedder is expected to call [`expire_nodes`] at or after the
    /// instant reported by [`next_expiry`]; both are measured against
    /// `timer`.
    ///
    /// [`expire_nodes`]: PriorityTree::expire_nodes
    /// [`next_expiry`]: PriorityTree::next_expiry
    pub fn with_timer(timer: C) -> PriorityTree<T, C> {
        PriorityTree::build(Some(timer))
    }

    fn build(timer: Option<C>) -> PriorityTree<T, C> {
        let mut store = Store::new();
        let root = store.insert(Node::new(StreamId::zero(), 1, None));

        PriorityTree {
            store,
            root,
            timer,
            node_lifetime: DEFAULT_NODE_LIFETIME,
            max_virtual_nodes: DEFAULT_MAX_VIRTUAL_NODES,
            num_virtual: 0,
            pending_egress: 0,
            next_virtual_seq: 0,
            virtual_order: VecDeque::new(),
            grace: BinaryHeap::new(),
        }
    }

    /// Sets the grace period for virtual nodes.
    ///
    /// Applies to nodes entering grace after the call; nodes already in
    /// grace keep their deadline.
    pub fn set_node_lifetime(&mut self, lifetime: Duration) {
        self.node_lifetime = lifetime;
    }

    /// Caps the number of non-permanent virtual nodes.
    ///
    /// The next mutation that would exceed the cap expires the oldest
    /// virtual nodes (by entry into the virtual state) until the count is
    /// back under it, regardless of their grace deadlines.
    pub fn set_max_virtual_nodes(&mut self, max: usize) {
        self.max_virtual_nodes = max;
    }

    /// Adds a stream to the tree.
    ///
    /// The dependency in `pri` resolves to the root for zero or a
    /// self-dependency, to the existing node for a known stream, and to a
    /// freshly synthesized virtual placeholder (weight 16, child of the
    /// root) for a stream never seen.
    ///
    /// `stream: None` creates a virtual node directly; `permanent` marks
    /// such a node exempt from expiry and the cap.
    ///
    /// If `id` is already present: a virtual node is converted to live in
    /// place (late arrival of a stream that was only known as a
    /// dependency), a live one is treated as an [`update_priority`]. Either
    /// way the peer cannot make this fail.
    ///
    /// [`update_priority`]: PriorityTree::update_priority
    pub fn add(
        &mut self,
        id: StreamId,
        pri: Priority,
        stream: Option<T>,
        permanent: bool,
    ) -> Result<Handle, UserError> {
        if id.is_zero() {
            return Err(UserError::InvalidStreamId);
        }

        trace!(
            "add; id={}; dep={}; excl={}; weight={}; virtual={}",
            id,
            pri.dependency(),
            pri.is_exclusive(),
            pri.weight(),
            stream.is_none()
        );

        if let Some(existing) = self.store.lookup(&id) {
            if self.store[existing].is_virtual() {
                if let Some(stream) = stream {
                    self.make_live(existing, stream);
                }
            } else {
                debug!("add for live id; downgraded to update; id={}", id);
            }

            let handle = self.store.handle(existing);
            return Ok(self.update_priority(handle, pri));
        }

        let parent = self.resolve_dependency(id, pri.dependency());

        let is_virtual = stream.is_none();
        let mut node = Node::new(id, pri.effective_weight(), stream);
        node.permanent = permanent && is_virtual;
        let key = self.store.insert(node);

        if pri.is_exclusive() {
            self.insert_exclusive(parent, key);
        } else {
            self.attach_child(parent, key);
        }

        if is_virtual {
            self.note_virtual(key);
            if self.store[key].children.is_empty() {
                self.enter_grace(key);
            }
        }

        self.enforce_virtual_cap();

        Ok(self.store.handle(key))
    }

    /// Applies a new priority record to an existing node.
    ///
    /// Weight-only updates adjust the parent's sums in place. Anything else
    /// reparents the node: if the new parent is currently a descendant of
    /// the node, it is first lifted into the node's own position at the old
    /// parent; an exclusive record additionally demotes the new parent's
    /// children to sit after the node's existing ones.
    ///
    /// Updating a virtual node refreshes its grace deadline. A stale handle
    /// is a no-op and is returned unchanged.
    pub fn update_priority(&mut self, handle: Handle, pri: Priority) -> Handle {
        let key = match self.store.resolve(handle) {
            Some(key) => key,
            None => return handle,
        };

        let id = self.store[key].id;

        trace!(
            "update_priority; id={}; dep={}; excl={}; weight={}",
            id,
            pri.dependency(),
            pri.is_exclusive(),
            pri.weight()
        );

        let new_parent = self.resolve_dependency(id, pri.dependency());
        let old_parent = self.store[key].parent.expect("the root has no priority");

        let mut to_settle: Vec<Handle> = Vec::new();

        if new_parent == old_parent && !pri.is_exclusive() {
            self.update_weight(key, pri.effective_weight());
        } else {
            if self.is_descendant_of(new_parent, key) {
                // Lift the target out of the moving subtree, into this
                // node's own slot at its parent.
                let idx = self.store[old_parent]
                    .children
                    .iter()
                    .position(|&c| c == key)
                    .expect("child link missing");

                let lift_parent = self.detach_child(new_parent);
                to_settle.push(self.store.handle(lift_parent));
                self.attach_child_at(old_parent, new_parent, idx);
            }

            self.update_weight(key, pri.effective_weight());

            let old_parent = self.detach_child(key);
            to_settle.push(self.store.handle(old_parent));

            if pri.is_exclusive() {
                self.insert_exclusive(new_parent, key);
            } else {
                self.attach_child(new_parent, key);
            }
        }

        let handle = self.store.handle(key);

        for h in to_settle {
            self.settle_childless(h);
        }

        if let Some(key) = self.store.resolve(handle) {
            self.refresh_grace(key);
        }

        self.enforce_virtual_cap();

        handle
    }

    /// Removes a stream from the tree.
    ///
    /// With a timer collaborator the node stays in place as a virtual
    /// placeholder, keeping its weight and its children; if childless it
    /// enters grace. Without one the node is taken out immediately and its
    /// children are promoted to its parent with their weights rescaled per
    /// RFC 7540 section 5.3.4.
    ///
    /// Stale handles and nodes already virtual are ignored.
    pub fn remove(&mut self, handle: Handle) {
        let key = match self.store.resolve(handle) {
            Some(key) => key,
            None => return,
        };

        if self.store[key].is_virtual() {
            return;
        }

        trace!("remove; id={}", self.store[key].id);

        self.clear_pending_egress(handle);

        if self.timer.is_some() {
            self.store[key].stream = None;
            self.note_virtual(key);

            if self.store[key].children.is_empty() {
                self.enter_grace(key);
            }

            self.enforce_virtual_cap();
        } else {
            let parent = self.store[key].parent.map(|p| self.store.handle(p));
            self.remove_from_tree(key);

            if let Some(parent) = parent {
                self.settle_childless(parent);
            }
        }
    }

    /// Marks the node as having data ready to send.
    pub fn signal_pending_egress(&mut self, handle: Handle) {
        let key = match self.store.resolve(handle) {
            Some(key) => key,
            None => return,
        };

        if self.store[key].enqueued || self.store[key].is_virtual() {
            return;
        }

        trace!("signal_pending_egress; id={}", self.store[key].id);

        let was_in_egress = self.store[key].in_egress_tree();
        self.store[key].enqueued = true;
        self.pending_egress += 1;

        if !was_in_egress {
            if let Some(parent) = self.store[key].parent {
                self.link_egress(parent, key);
            }
        }
    }

    /// Clears the node's pending egress mark.
    pub fn clear_pending_egress(&mut self, handle: Handle) {
        let key = match self.store.resolve(handle) {
            Some(key) => key,
            None => return,
        };

        if !self.store[key].enqueued {
            return;
        }

        trace!("clear_pending_egress; id={}", self.store[key].id);

        self.store[key].enqueued = false;
        self.pending_egress -= 1;

        if !self.store[key].in_egress_tree() {
            if let Some(parent) = self.store[key].parent {
                self.unlink_egress(parent, key);
            }
        }
    }

    /// Returns the current egress candidates with their bandwidth shares.
    ///
    /// Descends the egress tree from the root: an enqueued node absorbs the
    /// whole share flowing into it, a node that is merely shielding
    /// enqueued descendants passes its share down. Shares at each level are
    /// `weight / total enqueued weight of the siblings in the egress tree`.
    ///
    /// The result is sorted by share, largest first; equal shares keep the
    /// order in which the nodes entered the egress tree.
    pub fn next_egress(&self) -> Vec<(Handle, f64)> {
        let mut result = Vec::new();
        self.collect_egress(self.root, 1.0, &mut result);
        result.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(cmp::Ordering::Equal));
        result
    }

    /// Walks the tree depth first, children in insertion order.
    ///
    /// The root is not visited. The visitor receives the stream ID, the
    /// stream value (`None` for virtual nodes), and the node's weight as a
    /// fraction of its parent's total child weight; returning `true` stops
    /// the walk. `stop_fn` is consulted before every node. With
    /// `all_nodes: false` only enqueued nodes are reported, though their
    /// subtrees are still traversed.
    pub fn iterate<F, S>(&self, mut f: F, mut stop_fn: S, all_nodes: bool)
    where
        F: FnMut(StreamId, Option<&T>, f64) -> bool,
        S: FnMut() -> bool,
    {
        self.visit_dfs(self.root, &mut f, &mut stop_fn, all_nodes);
    }

    /// Walks the tree in breadth-first order, siblings in insertion order.
    ///
    /// Same visitor contract as [`iterate`], except `stop_fn` is consulted
    /// once per depth level rather than per node.
    ///
    /// [`iterate`]: PriorityTree::iterate
    pub fn iterate_bfs<F, S>(&self, mut f: F, mut stop_fn: S, all_nodes: bool)
    where
        F: FnMut(StreamId, Option<&T>, f64) -> bool,
        S: FnMut() -> bool,
    {
        let mut level = vec![self.root];
        let mut next = Vec::new();

        while !level.is_empty() {
            if stop_fn() {
                return;
            }

            for key in level.drain(..) {
                let node = &self.store[key];

                if !node.is_root() && (all_nodes || node.enqueued) {
                    if f(node.id, node.stream.as_ref(), self.relative_weight(key)) {
                        return;
                    }
                }

                next.extend(node.children.iter().cloned());
            }

            mem::swap(&mut level, &mut next);
        }
    }

    /// True when only the root exists.
    pub fn is_empty(&self) -> bool {
        self.store.num_nodes() == 0
    }

    /// The number of nodes currently marked pending egress.
    pub fn num_pending_egress(&self) -> usize {
        self.pending_egress
    }

    /// Looks up the node for a stream ID, live or virtual.
    pub fn find(&self, id: StreamId) -> Option<Handle> {
        self.store.lookup(&id).map(|key| self.store.handle(key))
    }

    /// The stream value stored on a node, `None` for stale handles and
    /// virtual nodes.
    pub fn stream(&self, handle: Handle) -> Option<&T> {
        self.store
            .resolve(handle)
            .and_then(|key| self.store[key].stream.as_ref())
    }

    /// The stream ID of the node, `None` for stale handles.
    pub fn stream_id(&self, handle: Handle) -> Option<StreamId> {
        self.store.resolve(handle).map(|key| self.store[key].id)
    }

    /// Destroys every virtual node, permanent placeholders included.
    ///
    /// Live descendants are spliced up to their first live ancestor (the
    /// root in the limit), collapsing the dependency chains the departed
    /// peer structure used to provide. Used when the peer's dependency
    /// graph is no longer trusted.
    pub fn drop_priority_nodes(&mut self) {
        debug!("drop_priority_nodes; num_virtual={}", self.num_virtual);

        let mut victims: Vec<(StreamId, Handle)> = Vec::new();

        for key in self.store.node_keys() {
            let node = &self.store[key];
            if node.is_virtual() {
                victims.push((node.id, self.store.handle(key)));
            }
        }

        victims.sort_by_key(|&(id, _)| id);

        for (_, handle) in victims {
            if let Some(key) = self.store.resolve(handle) {
                self.remove_from_tree(key);
            }
        }

        self.grace.clear();
        self.virtual_order.clear();

        debug_assert_eq!(self.num_virtual, 0);
    }

    /// Destroys every virtual node whose grace deadline has passed and
    /// that is still childless, returning how many were destroyed.
    ///
    /// A virtual parent left childless by an expiry enters grace itself
    /// with a fresh deadline, so a dangling chain unwinds one link per
    /// grace period. Without a timer collaborator this is a no-op.
    pub fn expire_nodes(&mut self) -> usize {
        let now = match self.timer {
            Some(ref timer) => timer.now(),
            None => return 0,
        };

        let mut expired = 0;

        loop {
            match self.grace.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {}
                _ => break,
            }

            let entry = self.grace.pop().expect("peeked entry vanished").0;

            let valid = self.store.get(entry.key).map_or(false, |node| {
                node.generation == entry.generation
                    && node.is_virtual()
                    && !node.permanent
                    && node.children.is_empty()
                    && node.expire_at == Some(entry.deadline)
            });

            if !valid {
                continue;
            }

            trace!("expire; id={}", self.store[entry.key].id);

            let parent = self.store[entry.key].parent.map(|p| self.store.handle(p));

            self.detach_child(entry.key);
            self.destroy(entry.key);
            expired += 1;

            if let Some(parent) = parent {
                self.settle_childless(parent);
            }
        }

        expired
    }

    /// The earliest pending grace deadline, if any.
    ///
    /// May be stale (the node may have left grace since); a resulting
    /// spurious [`expire_nodes`] call is harmless.
    ///
    /// [`expire_nodes`]: PriorityTree::expire_nodes
    pub fn next_expiry(&self) -> Option<Instant> {
        self.grace.peek().map(|Reverse(entry)| entry.deadline)
    }

    // ===== dependency resolution =====

    fn resolve_dependency(&mut self, id: StreamId, dep: StreamId) -> Key {
        if dep.is_zero() {
            return self.root;
        }

        if dep == id {
            // A stream cannot depend on itself; RFC 7540 treats this as a
            // protocol error, the session layer downgrades it to a root
            // dependency rather than let the peer wedge the tree.
            debug!("self dependency; id={}", id);
            return self.root;
        }

        if let Some(key) = self.store.lookup(&dep) {
            return key;
        }

        // Dependency on a stream never seen. Synthesize a placeholder so
        // the relationship survives until that stream shows up.
        debug!("unknown dependency; id={}; dep={}", id, dep);

        let node = Node::new(dep, DEFAULT_WEIGHT, None);
        let key = self.store.insert(node);
        self.attach_child(self.root, key);
        self.note_virtual(key);

        key
    }

    // ===== structural edits =====

    /// Appends `child` (currently detached) to `parent`'s child list.
    fn attach_child(&mut self, parent: Key, child: Key) {
        let idx = self.store[parent].children.len();
        self.attach_child_at(parent, child, idx);
    }

    fn attach_child_at(&mut self, parent: Key, child: Key, idx: usize) {
        debug_assert!(self.store[child].parent.is_none());

        self.store[child].parent = Some(parent);

        let weight = self.store[child].weight;
        let in_egress = self.store[child].in_egress_tree();

        {
            let p = &mut self.store[parent];
            p.children.insert(idx, child);
            p.total_child_weight += u64::from(weight);
            // A virtual parent gaining a child leaves grace.
            p.expire_at = None;
        }

        if in_egress {
            self.link_egress(parent, child);
        }
    }

    /// Unlinks `child` from its parent, returning the parent. Egress sums
    /// along the old ancestry are corrected.
    fn detach_child(&mut self, child: Key) -> Key {
        let parent = self.store[child].parent.take().expect("detaching the root");

        let weight = self.store[child].weight;
        let in_egress = self.store[child].in_egress_tree();

        self.store[parent].unlink_child(child, weight, in_egress);

        if in_egress && !self.store[parent].in_egress_tree() {
            if let Some(grandparent) = self.store[parent].parent {
                self.unlink_egress(grandparent, parent);
            }
        }

        parent
    }

    /// Inserts `key` (currently detached) as the sole child of `parent`,
    /// demoting the parent's current children to children of `key`, placed
    /// after `key`'s own.
    fn insert_exclusive(&mut self, parent: Key, key: Key) {
        let parent_was_in_egress = self.store[parent].in_egress_tree();

        // Move the cohort down as a block; orders are preserved and the
        // egress membership of each moved child is unchanged.
        let cohort = mem::take(&mut self.store[parent].children);
        let cohort_egress = mem::take(&mut self.store[parent].enqueued_children);
        let cohort_weight = mem::take(&mut self.store[parent].total_child_weight);
        let cohort_enqueued = mem::take(&mut self.store[parent].total_enqueued_weight);

        for &c in &cohort {
            self.store[c].parent = Some(key);
        }

        {
            let n = &mut self.store[key];
            n.children.extend(cohort);
            n.total_child_weight += cohort_weight;
            n.enqueued_children.extend(cohort_egress);
            n.total_enqueued_weight += cohort_enqueued;
            if !n.children.is_empty() {
                n.expire_at = None;
            }
        }

        // Attach as the sole child. The cohort's egress content never left
        // this subtree, so the ancestors only need fixing if the arriving
        // node brings egress of its own into a parent that had none.
        self.store[key].parent = Some(parent);

        let weight = self.store[key].weight;
        let in_egress = self.store[key].in_egress_tree();

        {
            let p = &mut self.store[parent];
            p.children.push(key);
            p.total_child_weight += u64::from(weight);
            p.expire_at = None;
        }

        if in_egress {
            self.store[parent].link_enqueued_child(key, weight);
        }

        if !parent_was_in_egress && self.store[parent].in_egress_tree() {
            if let Some(grandparent) = self.store[parent].parent {
                self.link_egress(grandparent, parent);
            }
        }
    }

    /// Takes the node out of the tree, promoting its children to its
    /// parent with weights rescaled per RFC 7540 section 5.3.4, and
    /// destroys it.
    fn remove_from_tree(&mut self, key: Key) {
        debug_assert!(!self.store[key].enqueued);

        let parent = match self.store[key].parent {
            Some(parent) => parent,
            None => return,
        };

        let node_weight = u64::from(self.store[key].weight);
        let total = self.store[key].total_child_weight;

        self.detach_child(key);

        let children = mem::take(&mut self.store[key].children);
        self.store[key].enqueued_children.clear();
        self.store[key].total_child_weight = 0;
        self.store[key].total_enqueued_weight = 0;

        for &child in &children {
            let scaled = u64::from(self.store[child].weight) * node_weight / total;
            self.store[child].weight = cmp::max(1, scaled) as u16;
            self.store[child].parent = None;
            self.attach_child(parent, child);
        }

        self.destroy(key);
    }

    // ===== egress accounting =====

    /// Records that `child` (a subtree newly containing an enqueued node)
    /// entered the egress tree under `parent`, walking up while ancestors
    /// enter it in turn.
    fn link_egress(&mut self, mut parent: Key, mut child: Key) {
        loop {
            let parent_was_in_egress = self.store[parent].in_egress_tree();
            let weight = self.store[child].weight;

            self.store[parent].link_enqueued_child(child, weight);

            if parent_was_in_egress {
                return;
            }

            match self.store[parent].parent {
                Some(grandparent) => {
                    child = parent;
                    parent = grandparent;
                }
                None => return,
            }
        }
    }

    /// Reverse of [`link_egress`]: `child`'s subtree no longer contains an
    /// enqueued node; ancestors fall out of the egress tree until one is
    /// held in by something else.
    fn unlink_egress(&mut self, mut parent: Key, mut child: Key) {
        loop {
            let weight = self.store[child].weight;

            self.store[parent].unlink_enqueued_child(child, weight);

            if self.store[parent].in_egress_tree() {
                return;
            }

            match self.store[parent].parent {
                Some(grandparent) => {
                    child = parent;
                    parent = grandparent;
                }
                None => return,
            }
        }
    }

    fn update_weight(&mut self, key: Key, new_weight: u16) {
        let old_weight = self.store[key].weight;

        if old_weight == new_weight {
            return;
        }

        self.store[key].weight = new_weight;

        let in_egress = self.store[key].in_egress_tree();

        if let Some(parent) = self.store[key].parent {
            let p = &mut self.store[parent];
            p.total_child_weight =
                p.total_child_weight - u64::from(old_weight) + u64::from(new_weight);

            if in_egress {
                p.total_enqueued_weight =
                    p.total_enqueued_weight - u64::from(old_weight) + u64::from(new_weight);
            }
        }
    }

    fn collect_egress(&self, key: Key, share: f64, result: &mut Vec<(Handle, f64)>) {
        let node = &self.store[key];

        if node.total_enqueued_weight == 0 {
            return;
        }

        for &c in &node.enqueued_children {
            let child = &self.store[c];
            let ratio = share * f64::from(child.weight) / node.total_enqueued_weight as f64;

            if child.enqueued {
                result.push((self.store.handle(c), ratio));
            } else {
                self.collect_egress(c, ratio, result);
            }
        }
    }

    // ===== traversal =====

    fn visit_dfs<F, S>(&self, key: Key, f: &mut F, stop_fn: &mut S, all_nodes: bool) -> bool
    where
        F: FnMut(StreamId, Option<&T>, f64) -> bool,
        S: FnMut() -> bool,
    {
        if stop_fn() {
            return true;
        }

        let node = &self.store[key];

        if !node.is_root() && (all_nodes || node.enqueued) {
            if f(node.id, node.stream.as_ref(), self.relative_weight(key)) {
                return true;
            }
        }

        for &c in &node.children {
            if self.visit_dfs(c, f, stop_fn, all_nodes) {
                return true;
            }
        }

        false
    }

    fn relative_weight(&self, key: Key) -> f64 {
        match self.store[key].parent {
            Some(parent) => {
                f64::from(self.store[key].weight) / self.store[parent].total_child_weight as f64
            }
            None => 1.0,
        }
    }

    fn is_descendant_of(&self, mut node: Key, ancestor: Key) -> bool {
        while let Some(parent) = self.store[node].parent {
            if parent == ancestor {
                return true;
            }
            node = parent;
        }

        false
    }

    // ===== virtual node lifetime =====

    fn make_live(&mut self, key: Key, stream: T) {
        trace!("make_live; id={}", self.store[key].id);

        let was_virtual = self.store[key].virtual_since.take().is_some();

        let node = &mut self.store[key];
        node.stream = Some(stream);
        node.permanent = false;
        node.expire_at = None;

        if was_virtual {
            self.num_virtual -= 1;
        }
    }

    fn note_virtual(&mut self, key: Key) {
        if self.store[key].permanent {
            return;
        }

        let seq = self.next_virtual_seq;
        self.next_virtual_seq += 1;

        self.store[key].virtual_since = Some(seq);
        self.num_virtual += 1;
        self.virtual_order.push_back((seq, key));
    }

    /// Handles a node that may have been left a childless virtual: enters
    /// grace under a timer, otherwise destroys it (and any virtual chain
    /// it leaves childless above it, nothing else holds those alive).
    fn settle_childless(&mut self, handle: Handle) {
        let mut key = match self.store.resolve(handle) {
            Some(key) => key,
            None => return,
        };

        loop {
            {
                let node = &self.store[key];
                if !node.is_virtual() || node.permanent || !node.children.is_empty() {
                    return;
                }
            }

            if self.timer.is_some() {
                if self.store[key].expire_at.is_none() {
                    self.enter_grace(key);
                }
                return;
            }

            let parent = self.detach_child(key);
            self.destroy(key);
            key = parent;
        }
    }

    fn enter_grace(&mut self, key: Key) {
        if self.store[key].permanent {
            return;
        }

        let timer = match self.timer {
            Some(ref timer) => timer,
            None => return,
        };

        let deadline = timer.now() + self.node_lifetime;
        let generation = self.store[key].generation;

        trace!("enter_grace; id={}", self.store[key].id);

        self.store[key].expire_at = Some(deadline);
        self.grace.push(Reverse(GraceEntry {
            deadline,
            generation,
            key,
        }));
    }

    /// Re-stamps the grace deadline of a node currently in grace.
    fn refresh_grace(&mut self, key: Key) {
        if self.store[key].expire_at.is_some() {
            self.enter_grace(key);
        }
    }

    fn enforce_virtual_cap(&mut self) {
        while self.num_virtual > self.max_virtual_nodes {
            let (seq, key) = match self.virtual_order.pop_front() {
                Some(entry) => entry,
                None => return,
            };

            let valid = self
                .store
                .get(key)
                .map_or(false, |node| node.virtual_since == Some(seq));

            if !valid {
                continue;
            }

            debug!("virtual node cap exceeded; evicting id={}", self.store[key].id);

            let parent = self.store[key].parent.map(|p| self.store.handle(p));
            self.remove_from_tree(key);

            if let Some(parent) = parent {
                self.settle_childless(parent);
            }
        }
    }

    /// Destroys a detached, childless node.
    fn destroy(&mut self, key: Key) {
        debug_assert!(self.store[key].parent.is_none());
        debug_assert!(self.store[key].children.is_empty());

        if self.store[key].virtual_since.is_some() {
            self.num_virtual -= 1;
        }

        let node = self.store.remove(key);
        trace!("destroy; id={}", node.id);
    }
}

// ===== impl GraceEntry =====

impl PartialEq for GraceEntry {
    fn eq(&self, other: &GraceEntry) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for GraceEntry {}

impl PartialOrd for GraceEntry {
    fn partial_cmp(&self, other: &GraceEntry) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GraceEntry {
    fn cmp(&self, other: &GraceEntry) -> cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use std::collections::HashMap;

    fn pri(dep: u32, excl: bool, weight: u8) -> Priority {
        Priority::new(StreamId::from(dep), excl, weight)
    }

    /// Recomputes every derived quantity from scratch and compares it with
    /// the incrementally maintained state.
    fn assert_invariants<T, C: Clock>(tree: &PriorityTree<T, C>) {
        fn walk<T, C: Clock>(tree: &PriorityTree<T, C>, key: Key, seen: &mut usize) -> bool {
            let node = &tree.store[key];

            if !node.is_root() {
                assert!(node.weight >= 1 && node.weight <= 256);
            }

            let mut total = 0u64;
            let mut enqueued_total = 0u64;
            let mut num_in_egress = 0;

            for &c in &node.children {
                *seen += 1;
                assert_eq!(tree.store[c].parent, Some(key));

                total += u64::from(tree.store[c].weight);

                let in_egress = walk(tree, c, seen);
                assert_eq!(in_egress, node.enqueued_children.contains(&c));

                if in_egress {
                    enqueued_total += u64::from(tree.store[c].weight);
                    num_in_egress += 1;
                }
            }

            assert_eq!(node.total_child_weight, total);
            assert_eq!(node.total_enqueued_weight, enqueued_total);
            assert_eq!(node.enqueued_children.len(), num_in_egress);

            node.enqueued || num_in_egress > 0
        }

        let mut seen = 0;
        walk(tree, tree.root, &mut seen);
        assert_eq!(seen, tree.store.num_nodes(), "unreachable nodes exist");
    }

    #[test]
    fn descendant_lift_keeps_sums_consistent() {
        let mut tree: PriorityTree<u32> = PriorityTree::new();

        let h1 = tree.add(StreamId::from(1), pri(0, false, 15), Some(1), false).unwrap();
        let h3 = tree.add(StreamId::from(3), pri(1, false, 3), Some(3), false).unwrap();
        let h5 = tree.add(StreamId::from(5), pri(3, false, 7), Some(5), false).unwrap();

        tree.signal_pending_egress(h1);
        tree.signal_pending_egress(h3);
        tree.signal_pending_egress(h5);
        assert_invariants(&tree);

        // 5 is a grandchild of 1; moving 1 under it lifts 5 to the root.
        tree.update_priority(h1, pri(5, false, 15));
        assert_invariants(&tree);

        assert_eq!(tree.stream_id(h5), Some(StreamId::from(5)));
        let next = tree.next_egress();
        assert_eq!(next.len(), 1);
        assert_eq!(tree.stream(next[0].0), Some(&5));
    }

    #[test]
    fn placeholder_synthesis_counts_toward_cap() {
        let mut tree: PriorityTree<u32> = PriorityTree::new();
        tree.set_max_virtual_nodes(2);

        for (n, dep) in &[(1u32, 101u32), (3, 103), (5, 105)] {
            let h = tree
                .add(StreamId::from(*n), pri(*dep, false, 15), Some(*n), false)
                .unwrap();
            tree.signal_pending_egress(h);
            assert_invariants(&tree);
        }

        // The oldest placeholder (101) was evicted; its child now sits at
        // the root. The two younger placeholders survive.
        assert!(tree.find(StreamId::from(101)).is_none());
        assert!(tree.find(StreamId::from(103)).is_some());
        assert!(tree.find(StreamId::from(105)).is_some());
        assert_invariants(&tree);
        assert_eq!(tree.next_egress().len(), 3);
    }

    #[test]
    fn random_chrome_like_workload() {
        let mut tree: PriorityTree<u32> = PriorityTree::new();
        let mut rng = StdRng::seed_from_u64(12345);

        let anchors = [1u32, 3, 5];
        let mut handles: HashMap<u32, Handle> = HashMap::new();

        let mut dep = 0;
        for &id in &anchors {
            let h = tree
                .add(StreamId::from(id), pri(dep, true, 99), Some(id), false)
                .unwrap();
            handles.insert(id, h);
            dep = id;
        }

        let mut txns: Vec<u32> = vec![];
        let mut active: Vec<u32> = vec![];
        let mut inactive: Vec<u32> = vec![];
        let mut next_id = 7u32;

        for _ in 4..1000 {
            let action: u8 = rng.gen_range(0..4);

            if action == 0 {
                let anchor = anchors[rng.gen_range(0..anchors.len())];
                let id = next_id;
                next_id += 2;

                let h = tree
                    .add(StreamId::from(id), pri(anchor, true, 99), Some(id), false)
                    .unwrap();
                tree.signal_pending_egress(h);
                handles.insert(id, h);
                txns.push(id);
                active.push(id);
            } else if action == 1 && !inactive.is_empty() {
                let id = inactive.remove(rng.gen_range(0..inactive.len()));
                tree.signal_pending_egress(handles[&id]);
                active.push(id);
            } else if action == 2 && !active.is_empty() {
                let id = active.remove(rng.gen_range(0..active.len()));
                tree.clear_pending_egress(handles[&id]);
                inactive.push(id);
            } else if action == 3 && !txns.is_empty() {
                let id = txns.remove(rng.gen_range(0..txns.len()));
                tree.remove(handles[&id]);
                active.retain(|&t| t != id);
                inactive.retain(|&t| t != id);
            }

            assert_invariants(&tree);

            let next = tree.next_egress();

            if tree.num_pending_egress() > 0 {
                assert!(!next.is_empty());

                let sum: f64 = next.iter().map(|&(_, share)| share).sum();
                assert!(sum <= 1.0 + 1e-9, "shares sum to {}", sum);
                assert!(next.iter().all(|&(_, share)| share > 0.0));
            } else {
                assert!(next.is_empty());
            }
        }
    }
}
