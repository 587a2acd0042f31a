//! Commit dependency graph
//!
//! Commits live in an arena keyed by [`ObjectId`]; parent and child links
//! are ids, never references. A commit can only be added once every parent
//! it names is already present, which keeps the graph acyclic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::storage::ObjectStore;

/// Classification of a commit by its parent count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitClass {
    Root,
    Regular,
    Merge,
}

impl CommitClass {
    fn from_parent_count(count: usize) -> Self {
        match count {
            0 => CommitClass::Root,
            1 => CommitClass::Regular,
            _ => CommitClass::Merge,
        }
    }
}

/// A commit record inside the graph
#[derive(Debug, Clone)]
pub struct CommitNode {
    pub id: ObjectId,
    pub parents: Vec<ObjectId>,
    pub children: Vec<ObjectId>,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
    pub class: CommitClass,
}

impl CommitNode {
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    /// Ordering key used for tie-breaks: timestamp, then hash
    fn key(&self) -> (i64, ObjectId) {
        (self.timestamp, self.id)
    }
}

/// Traversal order for [`CommitGraph::commits_in_range`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Newest first by timestamp, ties by descending hash
    Chronological,
    /// Reverse of [`CommitGraph::topological_sort`]: children always
    /// before their parents
    Topological,
}

/// Aggregate counts over the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStatistics {
    pub total_commits: usize,
    pub root_commits: usize,
    pub regular_commits: usize,
    pub merge_commits: usize,
    /// Commits without children
    pub tips: usize,
}

/// In-memory commit DAG
#[derive(Debug, Default, Clone)]
pub struct CommitGraph {
    nodes: HashMap<ObjectId, CommitNode>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph containing every commit reachable from `tips`
    pub fn load(store: &dyn ObjectStore, tips: &[ObjectId]) -> Result<Self> {
        let mut graph = Self::new();
        graph.extend_from(store, tips)?;
        tracing::debug!("Loaded commit graph with {} commits", graph.len());
        Ok(graph)
    }

    /// Add every commit reachable from `tips` that is not yet in the graph.
    /// Returns the number of commits added.
    pub fn extend_from(&mut self, store: &dyn ObjectStore, tips: &[ObjectId]) -> Result<usize> {
        let before = self.len();
        let mut stack: Vec<ObjectId> = tips.to_vec();
        let mut pending: HashMap<ObjectId, crate::object::Commit> = HashMap::new();

        while let Some(id) = stack.pop() {
            if self.contains(&id) {
                continue;
            }
            if !pending.contains_key(&id) {
                pending.insert(id, store.read_commit(&id)?);
            }
            let missing: Vec<ObjectId> = pending[&id]
                .parents
                .iter()
                .filter(|p| !self.contains(p))
                .copied()
                .collect();
            if missing.is_empty() {
                if let Some(commit) = pending.remove(&id) {
                    self.add_commit(
                        id,
                        &commit.message,
                        &commit.author,
                        commit.timestamp,
                        &commit.parents,
                    )?;
                }
            } else {
                stack.push(id);
                stack.extend(missing);
            }
        }
        Ok(self.len() - before)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&CommitNode> {
        self.nodes.get(id)
    }

    fn node(&self, id: &ObjectId) -> Result<&CommitNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::not_found(format!("commit {}", id)))
    }

    /// Insert a commit. Every parent must already be in the graph.
    pub fn add_commit(
        &mut self,
        id: ObjectId,
        message: &str,
        author: &str,
        timestamp: i64,
        parents: &[ObjectId],
    ) -> Result<CommitClass> {
        if self.nodes.contains_key(&id) {
            return Err(Error::Exists(format!("commit {}", id)));
        }
        let mut seen = HashSet::new();
        for parent in parents {
            if !self.nodes.contains_key(parent) {
                return Err(Error::invalid(format!(
                    "commit {} names unknown parent {}",
                    id.short(),
                    parent.short()
                )));
            }
            if !seen.insert(*parent) {
                return Err(Error::invalid(format!(
                    "commit {} lists parent {} twice",
                    id.short(),
                    parent.short()
                )));
            }
        }

        for parent in parents {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.push(id);
            }
        }
        let class = CommitClass::from_parent_count(parents.len());
        self.nodes.insert(
            id,
            CommitNode {
                id,
                parents: parents.to_vec(),
                children: Vec::new(),
                message: message.to_string(),
                author: author.to_string(),
                timestamp,
                class,
            },
        );
        Ok(class)
    }

    /// Kahn's algorithm over parent → child edges. Among commits that are
    /// ready at the same time the oldest timestamp wins, then the smaller
    /// hash.
    pub fn topological_sort(&self) -> Vec<ObjectId> {
        let mut remaining: HashMap<ObjectId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.parents.len()))
            .collect();
        let mut ready: BinaryHeap<Reverse<(i64, ObjectId)>> = self
            .nodes
            .values()
            .filter(|n| n.parents.is_empty())
            .map(|n| Reverse(n.key()))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for child in &self.nodes[&id].children {
                if let Some(count) = remaining.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(self.nodes[child].key()));
                    }
                }
            }
        }
        order
    }

    /// Lazy, restartable walk over at most `max_count` commits
    pub fn commits_in_range(&self, max_count: usize, order: Order) -> CommitRange<'_> {
        CommitRange::new(self, max_count, order)
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics {
            total_commits: self.nodes.len(),
            ..GraphStatistics::default()
        };
        for node in self.nodes.values() {
            match node.class {
                CommitClass::Root => stats.root_commits += 1,
                CommitClass::Regular => stats.regular_commits += 1,
                CommitClass::Merge => stats.merge_commits += 1,
            }
            if node.children.is_empty() {
                stats.tips += 1;
            }
        }
        stats
    }

    /// Every commit reachable from `id` through parents, including `id`
    pub fn ancestors(&self, id: &ObjectId) -> Result<HashSet<ObjectId>> {
        self.node(id)?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.parents.iter().copied());
            }
        }
        Ok(seen)
    }

    /// True iff `ancestor` is reachable from `descendant` (a commit is its
    /// own ancestor)
    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
        self.node(ancestor)?;
        self.node(descendant)?;
        if ancestor == descendant {
            return Ok(true);
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*descendant]);
        while let Some(current) = queue.pop_front() {
            if current == *ancestor {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            queue.extend(self.nodes[&current].parents.iter().copied());
        }
        Ok(false)
    }

    /// Best common ancestor of two commits: a common ancestor that is not
    /// an ancestor of any other common ancestor. Ties pick the newest
    /// timestamp, then the larger hash.
    pub fn merge_base(&self, a: &ObjectId, b: &ObjectId) -> Result<Option<ObjectId>> {
        let ours = self.ancestors(a)?;
        let theirs = self.ancestors(b)?;
        let common: Vec<ObjectId> = ours.intersection(&theirs).copied().collect();
        if common.is_empty() {
            return Ok(None);
        }

        let mut dominated = HashSet::new();
        for candidate in &common {
            for parent in &self.nodes[candidate].parents {
                for ancestor in self.ancestors(parent)? {
                    dominated.insert(ancestor);
                }
            }
        }
        Ok(common
            .into_iter()
            .filter(|id| !dominated.contains(id))
            .max_by_key(|id| self.nodes[id].key()))
    }

    /// Text rendering of the first `max_count` commits of the
    /// [`Order::Topological`] range, one lane per open line of history
    pub fn ascii_graph(&self, max_count: usize) -> String {
        let mut lanes: Vec<Option<ObjectId>> = Vec::new();
        let mut out = String::new();

        for node in self.commits_in_range(max_count, Order::Topological) {
            let col = match lanes.iter().position(|l| *l == Some(node.id)) {
                Some(col) => col,
                None => allocate_lane(&mut lanes, node.id),
            };
            // Other lanes waiting for this commit converge here
            for (i, lane) in lanes.iter_mut().enumerate() {
                if i != col && *lane == Some(node.id) {
                    *lane = None;
                }
            }

            let row: Vec<&str> = lanes
                .iter()
                .enumerate()
                .map(|(i, lane)| match (i == col, lane) {
                    (true, _) => "*",
                    (false, Some(_)) => "|",
                    (false, None) => " ",
                })
                .collect();
            out.push_str(row.join(" ").trim_end());
            out.push_str(&format!("  {} {}\n", node.id.short(), node.summary()));

            lanes[col] = node.parents.first().copied();
            let mut opened = Vec::new();
            for parent in node.parents.iter().skip(1) {
                if !lanes.contains(&Some(*parent)) {
                    opened.push(allocate_lane(&mut lanes, *parent));
                }
            }
            if !opened.is_empty() {
                let connector: Vec<&str> = lanes
                    .iter()
                    .enumerate()
                    .map(|(i, lane)| {
                        if opened.contains(&i) {
                            "\\"
                        } else if lane.is_some() {
                            "|"
                        } else {
                            " "
                        }
                    })
                    .collect();
                out.push_str(connector.join(" ").trim_end());
                out.push('\n');
            }
            while lanes.last() == Some(&None) {
                lanes.pop();
            }
        }
        out
    }
}

fn allocate_lane(lanes: &mut Vec<Option<ObjectId>>, id: ObjectId) -> usize {
    match lanes.iter().position(|l| l.is_none()) {
        Some(free) => {
            lanes[free] = Some(id);
            free
        }
        None => {
            lanes.push(Some(id));
            lanes.len() - 1
        }
    }
}

/// Lazy commit sequence returned by [`CommitGraph::commits_in_range`].
///
/// The iterator is `Clone`: cloning it captures the current position, and
/// [`CommitRange::restart`] rewinds to the beginning.
#[derive(Debug, Clone)]
pub struct CommitRange<'g> {
    graph: &'g CommitGraph,
    order: Order,
    max_count: usize,
    emitted: usize,
    /// Chronological only: every commit keyed by `(timestamp, hash)`
    ready: BinaryHeap<(i64, ObjectId)>,
    /// Topological only: the sorted order, consumed from the back
    sorted: Vec<ObjectId>,
}

impl<'g> CommitRange<'g> {
    fn new(graph: &'g CommitGraph, max_count: usize, order: Order) -> Self {
        let (ready, sorted) = match order {
            Order::Chronological => (graph.nodes.values().map(|n| n.key()).collect(), Vec::new()),
            Order::Topological => (BinaryHeap::new(), graph.topological_sort()),
        };
        Self {
            graph,
            order,
            max_count,
            emitted: 0,
            ready,
            sorted,
        }
    }

    /// A fresh sequence over the same graph, order and bound
    pub fn restart(&self) -> Self {
        Self::new(self.graph, self.max_count, self.order)
    }
}

impl<'g> Iterator for CommitRange<'g> {
    type Item = &'g CommitNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.max_count {
            return None;
        }
        let id = match self.order {
            Order::Chronological => self.ready.pop()?.1,
            Order::Topological => self.sorted.pop()?,
        };
        self.emitted += 1;
        self.graph.nodes.get(&id)
    }
}
