#![allow(dead_code)]

use h2_priority::{Clock, Handle, Priority, PriorityTree, StreamId, SystemClock};

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub fn pri(dep: u32, excl: bool, weight: u8) -> Priority {
    Priority::new(StreamId::from(dep), excl, weight)
}

/// A manually advanced clock shared between a test and its tree.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Drives a `PriorityTree<u32, _>` by stream ID, the way a session layer
/// would: the stream value stored on each live node is its own ID.
pub struct TestQueue<C: Clock> {
    pub tree: PriorityTree<u32, C>,
    handles: HashMap<u32, Handle>,
}

impl TestQueue<SystemClock> {
    pub fn new() -> TestQueue<SystemClock> {
        TestQueue {
            tree: PriorityTree::new(),
            handles: HashMap::new(),
        }
    }
}

impl<C: Clock> TestQueue<C> {
    pub fn with_timer(clock: C) -> TestQueue<C> {
        TestQueue {
            tree: PriorityTree::with_timer(clock),
            handles: HashMap::new(),
        }
    }

    /// Adds a live stream and marks it pending egress.
    pub fn add(&mut self, id: u32, dep: u32, excl: bool, weight: u8) {
        let handle = self
            .tree
            .add(StreamId::from(id), pri(dep, excl, weight), Some(id), false)
            .unwrap();
        self.handles.insert(id, handle);
        self.signal(id, true);
    }

    /// Adds a virtual placeholder.
    pub fn add_virtual(&mut self, id: u32, dep: u32, weight: u8) {
        let handle = self
            .tree
            .add(StreamId::from(id), pri(dep, false, weight), None, false)
            .unwrap();
        self.handles.insert(id, handle);
    }

    pub fn handle(&self, id: u32) -> Handle {
        self.handles[&id]
    }

    pub fn remove(&mut self, id: u32) {
        self.tree.remove(self.handles[&id]);
    }

    pub fn update(&mut self, id: u32, dep: u32, excl: bool, weight: u8) {
        let handle = self
            .tree
            .update_priority(self.handles[&id], pri(dep, excl, weight));
        self.handles.insert(id, handle);
    }

    pub fn signal(&mut self, id: u32, mark: bool) {
        if mark {
            self.tree.signal_pending_egress(self.handles[&id]);
        } else {
            self.tree.clear_pending_egress(self.handles[&id]);
        }
    }

    /// Builds the five stream tree most scenarios start from:
    ///
    /// ```text
    /// 0 -- 1(16) -- 3(4)
    ///            \- 5(4) -- 9(8)
    ///            \- 7(8)
    /// ```
    pub fn build_simple_tree(&mut self) {
        self.add(1, 0, false, 15);
        self.add(3, 1, false, 3);
        self.add(5, 1, false, 3);
        self.add(7, 1, false, 7);
        self.add(9, 5, false, 7);
    }

    /// Depth-first dump of every node as `(id, percent)`, the share
    /// truncated to an integer percent.
    pub fn dump(&self) -> Vec<(u32, u8)> {
        let mut nodes = vec![];
        self.tree.iterate(
            |id, _, ratio| {
                nodes.push((u32::from(id), (ratio * 100.0) as u8));
                false
            },
            || false,
            true,
        );
        nodes
    }

    /// Breadth-first dump, stopping once more than `max` nodes have been
    /// reported.
    pub fn dump_bfs(&self, max: usize) -> Vec<(u32, u8)> {
        let visited = Cell::new(0usize);
        let mut nodes = vec![];
        self.tree.iterate_bfs(
            |id, _, ratio| {
                nodes.push((u32::from(id), (ratio * 100.0) as u8));
                visited.set(visited.get() + 1);
                false
            },
            || visited.get() > max,
            true,
        );
        nodes
    }

    /// The current egress candidates as `(id, percent)`.
    pub fn next_egress(&self) -> Vec<(u32, u8)> {
        self.tree
            .next_egress()
            .iter()
            .map(|&(handle, share)| {
                let id = self.tree.stream(handle).copied().expect("virtual candidate");
                (id, (share * 100.0) as u8)
            })
            .collect()
    }
}
