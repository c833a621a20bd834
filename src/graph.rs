//! The asset dependency graph.
//!
//! Two kinds of nodes live here: files on disk and the dependency requests
//! discovered inside them. Edges always alternate between the two: a
//! dependency points at the file it resolved to, and a file points at every
//! dependency its transform discovered.
//!
//! The graph is content-addressed. A file node is keyed by its canonical
//! path, a dependency node by a hash of `(specifier, resolve_from)`, so
//! inserting a node that already exists merges into it instead of
//! duplicating it. Everything reachable from the fixed entry set stays;
//! whatever an edge removal makes unreachable is pruned.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Dfs, EdgeRef};

use crate::plugin::Asset;

/// A 32-byte BLAKE3 hash used for content-addressing dependency nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).expect("hex output is valid UTF-8")
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Deterministic identity of a dependency node.
///
/// Derived from the import specifier and the path of the file that requested
/// it, so the same import written in two different files yields two distinct
/// nodes, while re-transforming a file reproduces the same ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyId(Hash32);

impl DependencyId {
    pub fn new(specifier: &str, resolve_from: &Utf8Path) -> Self {
        let hash = blake3::Hasher::new()
            .update(specifier.as_bytes())
            .update(b"\0")
            .update(resolve_from.as_str().as_bytes())
            .finalize();

        DependencyId(hash.into())
    }
}

impl Debug for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DependencyId({})", self.0.to_hex())
    }
}

impl Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// An import discovered by a transform, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyRequest {
    /// The raw specifier, e.g. `./b.js`.
    pub specifier: String,
    /// Path of the file the specifier appeared in.
    pub resolve_from: Utf8PathBuf,
}

/// Processing state of a node. See the transitions on [`AssetGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created, never processed.
    New,
    /// Previously complete, marked stale by a change notification.
    Invalid,
    /// A task has been scheduled for this node in some generation.
    InProgress,
    /// The last scheduled task applied its result.
    Complete,
    /// Processing failed; not retried until invalidated again.
    Errored,
}

/// An unresolved reference from one file to another.
#[derive(Clone, Debug)]
pub struct DependencyNode {
    pub id: DependencyId,
    pub specifier: String,
    pub resolve_from: Utf8PathBuf,
    pub state: NodeState,
}

/// A file tracked by the build, together with the assets its last
/// successfully applied transform produced.
#[derive(Clone, Debug)]
pub struct FileNode {
    pub path: Utf8PathBuf,
    pub state: NodeState,
    pub assets: Vec<Asset>,
}

/// Closed node variant; exhaustive matching replaces any runtime type tag.
#[derive(Clone, Debug)]
pub enum Node {
    Dependency(DependencyNode),
    File(FileNode),
}

impl Node {
    pub fn key(&self) -> NodeKey {
        match self {
            Node::Dependency(dep) => NodeKey::Dependency(dep.id),
            Node::File(file) => NodeKey::File(file.path.clone()),
        }
    }

    pub fn state(&self) -> NodeState {
        match self {
            Node::Dependency(dep) => dep.state,
            Node::File(file) => file.state,
        }
    }

    fn state_mut(&mut self) -> &mut NodeState {
        match self {
            Node::Dependency(dep) => &mut dep.state,
            Node::File(file) => &mut file.state,
        }
    }
}

/// Content address of a node: `(type, id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Dependency(DependencyId),
    File(Utf8PathBuf),
}

impl NodeKey {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        NodeKey::File(path.into())
    }
}

/// Directed, typed edges between the two node kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    /// `Dependency → File`, created on successful resolution.
    ResolvesTo,
    /// `File → Dependency`, created on transform, one per discovered import.
    Imports,
}

/// Result of [`AssetGraph::update_dependency`].
#[derive(Debug, Default)]
pub struct DependencyUpdate {
    /// The resolved file node did not previously exist; the caller should
    /// schedule its transform and start watching the path.
    pub created: bool,
}

/// Result of [`AssetGraph::update_file`].
#[derive(Debug, Default)]
pub struct FileUpdate {
    /// Files that became unreachable from the entry set and were removed.
    pub pruned: Vec<Utf8PathBuf>,
    /// Dependency nodes created by this update, in discovery order.
    pub new_deps: Vec<DependencyNode>,
}

#[derive(Clone, Debug)]
pub struct AssetGraph {
    graph: StableDiGraph<Node, Edge>,
    keys: HashMap<NodeKey, NodeIndex>,
    entries: Vec<NodeIndex>,
}

impl AssetGraph {
    /// Seed the graph with one file node per entry, all in [`NodeState::New`].
    pub fn new(entries: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        let mut graph = AssetGraph {
            graph: StableDiGraph::new(),
            keys: HashMap::new(),
            entries: Vec::new(),
        };

        for path in entries {
            let (index, _) = graph.insert_file(path);
            if !graph.entries.contains(&index) {
                graph.entries.push(index);
            }
        }

        graph
    }

    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn has_file(&self, path: &Utf8Path) -> bool {
        self.keys.contains_key(&NodeKey::File(path.to_owned()))
    }

    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.keys.get(key).map(|&index| &self.graph[index])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All file nodes, in arbitrary order. This is the view bundlers consume.
    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.graph.node_weights().filter_map(|node| match node {
            Node::File(file) => Some(file),
            Node::Dependency(_) => None,
        })
    }

    /// Snapshot of all nodes in [`NodeState::Invalid`].
    pub fn invalid_nodes(&self) -> Vec<(NodeKey, Node)> {
        self.nodes_where(|state| state == NodeState::Invalid)
    }

    /// Snapshot of all nodes in [`NodeState::New`] or [`NodeState::InProgress`].
    pub fn incomplete_nodes(&self) -> Vec<(NodeKey, Node)> {
        self.nodes_where(|state| matches!(state, NodeState::New | NodeState::InProgress))
    }

    /// Mark a node stale after an external change notification.
    ///
    /// Unknown keys are ignored: a notification for an untracked path is not
    /// an error. `New` and `InProgress` nodes are left alone, they already
    /// have processing due. Re-invalidating an `Invalid` node is a no-op that
    /// never touches topology.
    pub fn invalidate(&mut self, key: &NodeKey) {
        let Some(&index) = self.keys.get(key) else {
            return;
        };

        let state = self.graph[index].state_mut();
        if matches!(
            state,
            NodeState::Complete | NodeState::Errored | NodeState::Invalid
        ) {
            *state = NodeState::Invalid;
        }
    }

    pub fn mark_in_progress(&mut self, key: &NodeKey) {
        if let Some(&index) = self.keys.get(key) {
            *self.graph[index].state_mut() = NodeState::InProgress;
        }
    }

    pub fn mark_errored(&mut self, key: &NodeKey) {
        if let Some(&index) = self.keys.get(key) {
            *self.graph[index].state_mut() = NodeState::Errored;
        }
    }

    /// Apply a successful resolution: attach (or create) the target file
    /// node, record the `ResolvesTo` edge and complete the dependency.
    pub fn update_dependency(&mut self, id: DependencyId, resolved: &Utf8Path) -> DependencyUpdate {
        let Some(&dep_index) = self.keys.get(&NodeKey::Dependency(id)) else {
            tracing::debug!(%id, "resolution for a dependency no longer in the graph");
            return DependencyUpdate::default();
        };

        let (file_index, created) = self.insert_file(resolved.to_owned());

        if self.graph.find_edge(dep_index, file_index).is_none() {
            self.graph.add_edge(dep_index, file_index, Edge::ResolvesTo);
        }

        *self.graph[dep_index].state_mut() = NodeState::Complete;

        DependencyUpdate { created }
    }

    /// Apply a successful transform: replace the file's assets, reconcile
    /// its outgoing import edges against the newly discovered dependency
    /// set, and prune whatever the removed edges left unreachable.
    pub fn update_file(
        &mut self,
        path: &Utf8Path,
        assets: Vec<Asset>,
        deps: Vec<DependencyRequest>,
    ) -> FileUpdate {
        let Some(&file_index) = self.keys.get(&NodeKey::File(path.to_owned())) else {
            tracing::debug!(%path, "transform result for a file no longer in the graph");
            return FileUpdate::default();
        };

        if let Node::File(file) = &mut self.graph[file_index] {
            file.assets = assets;
            file.state = NodeState::Complete;
        }

        let old: HashMap<DependencyId, NodeIndex> = self
            .graph
            .edges(file_index)
            .filter(|edge| matches!(edge.weight(), Edge::Imports))
            .filter_map(|edge| match &self.graph[edge.target()] {
                Node::Dependency(dep) => Some((dep.id, edge.target())),
                Node::File(_) => None,
            })
            .collect();

        let mut new_deps = Vec::new();
        let mut kept = HashSet::new();

        for request in deps {
            let id = DependencyId::new(&request.specifier, &request.resolve_from);
            if !kept.insert(id) {
                continue;
            }

            if old.contains_key(&id) {
                continue;
            }

            let key = NodeKey::Dependency(id);
            let dep_index = match self.keys.get(&key) {
                Some(&index) => index,
                None => {
                    let node = DependencyNode {
                        id,
                        specifier: request.specifier,
                        resolve_from: request.resolve_from,
                        state: NodeState::New,
                    };
                    new_deps.push(node.clone());

                    let index = self.graph.add_node(Node::Dependency(node));
                    self.keys.insert(key, index);
                    index
                }
            };

            if self.graph.find_edge(file_index, dep_index).is_none() {
                self.graph.add_edge(file_index, dep_index, Edge::Imports);
            }
        }

        let mut removed_any = false;
        for (id, dep_index) in &old {
            if kept.contains(id) {
                continue;
            }
            if let Some(edge) = self.graph.find_edge(file_index, *dep_index) {
                self.graph.remove_edge(edge);
                removed_any = true;
            }
        }

        let pruned = if removed_any {
            self.prune_unreachable()
        } else {
            Vec::new()
        };

        FileUpdate { pruned, new_deps }
    }

    /// Insert a file node unless its path is already present. Returns the
    /// node index and whether it was created by this call.
    fn insert_file(&mut self, path: Utf8PathBuf) -> (NodeIndex, bool) {
        let key = NodeKey::File(path.clone());

        match self.keys.get(&key) {
            Some(&index) => (index, false),
            None => {
                let index = self.graph.add_node(Node::File(FileNode {
                    path,
                    state: NodeState::New,
                    assets: Vec::new(),
                }));
                self.keys.insert(key, index);
                (index, true)
            }
        }
    }

    fn nodes_where(&self, predicate: impl Fn(NodeState) -> bool) -> Vec<(NodeKey, Node)> {
        self.graph
            .node_weights()
            .filter(|node| predicate(node.state()))
            .map(|node| (node.key(), node.clone()))
            .collect()
    }

    /// Remove every node unreachable from the entry set, along with its
    /// incident edges. Entries themselves are never pruned. Returns the
    /// paths of removed file nodes so the caller can stop watching them.
    fn prune_unreachable(&mut self) -> Vec<Utf8PathBuf> {
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::empty(&self.graph);

        for &entry in &self.entries {
            dfs.move_to(entry);
            while let Some(index) = dfs.next(&self.graph) {
                reachable.insert(index);
            }
        }

        let doomed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| !reachable.contains(index))
            .collect();

        let mut pruned = Vec::new();
        for index in doomed {
            if let Some(node) = self.graph.remove_node(index) {
                self.keys.remove(&node.key());
                if let Node::File(file) = node {
                    tracing::debug!(path = %file.path, "pruned unreachable file");
                    pruned.push(file.path);
                }
            }
        }

        pruned
    }

    /// Incoming dependency edges of a file, used by tests and diagnostics.
    #[cfg(test)]
    fn incoming_deps(&self, path: &Utf8Path) -> usize {
        match self.keys.get(&NodeKey::File(path.to_owned())) {
            Some(&index) => self
                .graph
                .edges_directed(index, petgraph::Direction::Incoming)
                .count(),
            None => 0,
        }
    }
}
