//! Typed node/edge store for the link graph.
//!
//! Nodes live in a slot arena and edges reference them by integer id; paths
//! only appear at the API boundary. `file` nodes mirror real documents,
//! `topic` nodes hold unresolved link targets until a matching file shows
//! up and promotes them.

use crate::config::SIBLING_DECAY;
use crate::model::{NeighborDirection, NeighborHit, NeighborMode};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Topic,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Topic => "topic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Link,
    Semantic,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::Link => "link",
            EdgeType::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    Frontmatter,
    Body,
}

impl EdgeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeSource::Frontmatter => "frontmatter",
            EdgeSource::Body => "body",
        }
    }
}

type NodeId = u32;

#[derive(Debug, Clone)]
struct Node {
    path: String,
    kind: NodeKind,
}

#[derive(Debug, Clone, Copy)]
struct EdgeData {
    weight: f32,
    source: EdgeSource,
}

#[derive(Debug, Clone)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    pub edge_type: EdgeType,
    pub weight: f32,
    pub source: EdgeSource,
}

#[derive(Default)]
pub struct GraphStore {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    by_path: HashMap<String, NodeId>,
    /// Case-folded full path -> id, for case-insensitive resolution.
    by_folded_path: HashMap<String, NodeId>,
    /// Case-folded basename (without `.md`) -> id of a file node.
    by_stem: HashMap<String, NodeId>,
    /// Case-folded alias -> canonical path. Takes precedence over stems.
    aliases: HashMap<String, String>,
    edges: HashMap<(NodeId, NodeId, EdgeType), EdgeData>,
    outbound: HashMap<NodeId, HashSet<NodeId>>,
    inbound: HashMap<NodeId, HashSet<NodeId>>,
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

fn stem_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    fold(name.strip_suffix(".md").unwrap_or(name))
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn node_kind(&self, path: &str) -> Option<NodeKind> {
        let id = *self.by_path.get(path)?;
        self.nodes[id as usize].as_ref().map(|n| n.kind)
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, NodeKind)> {
        self.nodes
            .iter()
            .flatten()
            .map(|n| (n.path.as_str(), n.kind))
    }

    /// Inserts or promotes a node. A topic node re-declared as a file is
    /// promoted in place so existing edges keep their endpoints.
    pub fn ensure_node(&mut self, path: &str, kind: NodeKind) -> NodeId {
        if let Some(&id) = self.by_path.get(path) {
            if kind == NodeKind::File {
                if let Some(node) = self.nodes[id as usize].as_mut() {
                    if node.kind == NodeKind::Topic {
                        node.kind = NodeKind::File;
                        self.by_stem.insert(stem_of(path), id);
                    }
                }
            }
            return id;
        }

        let node = Node {
            path: path.to_string(),
            kind,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as NodeId
            }
        };
        self.by_path.insert(path.to_string(), id);
        self.by_folded_path.insert(fold(path), id);
        if kind == NodeKind::File {
            self.by_stem.insert(stem_of(path), id);
        }
        id
    }

    /// Merges duplicate edges by taking the max weight.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        edge_type: EdgeType,
        weight: f32,
        source: EdgeSource,
    ) {
        if from == to {
            return;
        }
        let (Some(&u), Some(&v)) = (self.by_path.get(from), self.by_path.get(to)) else {
            return;
        };
        let weight = weight.clamp(0.0, 1.0);
        match self.edges.entry((u, v, edge_type)) {
            Entry::Occupied(mut e) => {
                if weight > e.get().weight {
                    *e.get_mut() = EdgeData { weight, source };
                }
            }
            Entry::Vacant(e) => {
                e.insert(EdgeData { weight, source });
            }
        }
        self.outbound.entry(u).or_default().insert(v);
        self.inbound.entry(v).or_default().insert(u);
    }

    /// Drops every outbound edge of the given type. Endpoints left with no
    /// edges and no file backing are garbage-collected.
    pub fn clear_outbound(&mut self, path: &str, edge_type: EdgeType) {
        let Some(&u) = self.by_path.get(path) else {
            return;
        };
        let targets: Vec<NodeId> = self
            .outbound
            .get(&u)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for v in targets {
            self.edges.remove(&(u, v, edge_type));
            if !self.has_edge_any_type(u, v) {
                if let Some(out) = self.outbound.get_mut(&u) {
                    out.remove(&v);
                }
                if let Some(inc) = self.inbound.get_mut(&v) {
                    inc.remove(&u);
                }
                self.collect_if_orphan_topic(v);
            }
        }
    }

    fn has_edge_any_type(&self, u: NodeId, v: NodeId) -> bool {
        self.edges.contains_key(&(u, v, EdgeType::Link))
            || self.edges.contains_key(&(u, v, EdgeType::Semantic))
    }

    /// Removes a document's node. Outbound edges always go; when inbound
    /// links remain the node is demoted to a topic (the target is
    /// unresolved again), otherwise it is removed outright.
    pub fn remove_file(&mut self, path: &str) {
        let Some(&id) = self.by_path.get(path) else {
            return;
        };
        self.clear_outbound(path, EdgeType::Link);
        self.clear_outbound(path, EdgeType::Semantic);

        let has_inbound = self.inbound.get(&id).is_some_and(|s| !s.is_empty());
        if has_inbound {
            if let Some(node) = self.nodes[id as usize].as_mut() {
                node.kind = NodeKind::Topic;
            }
            if self.by_stem.get(&stem_of(path)) == Some(&id) {
                self.by_stem.remove(&stem_of(path));
            }
        } else {
            self.remove_node(id);
        }
    }

    fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes[id as usize].take() else {
            return;
        };
        // Edge referential integrity: no edge survives a lost endpoint.
        for v in self.outbound.remove(&id).unwrap_or_default() {
            self.edges.remove(&(id, v, EdgeType::Link));
            self.edges.remove(&(id, v, EdgeType::Semantic));
            if let Some(inc) = self.inbound.get_mut(&v) {
                inc.remove(&id);
            }
            self.collect_if_orphan_topic(v);
        }
        for u in self.inbound.remove(&id).unwrap_or_default() {
            self.edges.remove(&(u, id, EdgeType::Link));
            self.edges.remove(&(u, id, EdgeType::Semantic));
            if let Some(out) = self.outbound.get_mut(&u) {
                out.remove(&id);
            }
        }
        self.by_path.remove(&node.path);
        self.by_folded_path.remove(&fold(&node.path));
        if self.by_stem.get(&stem_of(&node.path)) == Some(&id) {
            self.by_stem.remove(&stem_of(&node.path));
        }
        self.free.push(id);
    }

    /// Topic nodes exist only while something links to them.
    fn collect_if_orphan_topic(&mut self, id: NodeId) {
        let is_orphan_topic = self.nodes[id as usize]
            .as_ref()
            .is_some_and(|n| n.kind == NodeKind::Topic)
            && self.inbound.get(&id).is_none_or(|s| s.is_empty())
            && self.outbound.get(&id).is_none_or(|s| s.is_empty());
        if is_orphan_topic {
            self.remove_node(id);
        }
    }

    pub fn set_alias(&mut self, alias: &str, canonical_path: &str) {
        self.aliases.insert(fold(alias), canonical_path.to_string());
    }

    pub fn remove_aliases_for(&mut self, canonical_path: &str) {
        self.aliases.retain(|_, v| v != canonical_path);
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&String, &String)> {
        self.aliases.iter()
    }

    /// Case-insensitive link resolution: aliases first, then full paths,
    /// then bare basenames. Unresolved targets get a canonical `.md` path
    /// a topic node can live under.
    pub fn resolve_target(&self, target: &str) -> (String, bool) {
        let folded = fold(target);
        if let Some(path) = self.aliases.get(&folded) {
            return (path.clone(), true);
        }
        let folded_md = if folded.ends_with(".md") {
            folded.clone()
        } else {
            format!("{folded}.md")
        };
        if let Some(&id) = self
            .by_folded_path
            .get(&folded)
            .or_else(|| self.by_folded_path.get(&folded_md))
        {
            if let Some(node) = self.nodes[id as usize].as_ref() {
                return (node.path.clone(), node.kind == NodeKind::File);
            }
        }
        if !target.contains('/') {
            let stem = folded.strip_suffix(".md").unwrap_or(&folded);
            if let Some(&id) = self.by_stem.get(stem) {
                if let Some(node) = self.nodes[id as usize].as_ref() {
                    return (node.path.clone(), true);
                }
            }
        }
        let canonical = if target.ends_with(".md") {
            target.to_string()
        } else {
            format!("{target}.md")
        };
        (canonical, false)
    }

    pub fn neighbors(
        &self,
        path: &str,
        direction: NeighborDirection,
        mode: NeighborMode,
        ontology_folder: &str,
        limit: usize,
    ) -> Vec<NeighborHit> {
        let Some(&id) = self.by_path.get(path) else {
            return Vec::new();
        };
        let mut hits = match mode {
            NeighborMode::Simple => self.simple_neighbors(id, direction),
            NeighborMode::Ontology => self.ontology_siblings(id, ontology_folder),
        };
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(limit);
        hits
    }

    fn simple_neighbors(&self, id: NodeId, direction: NeighborDirection) -> Vec<NeighborHit> {
        let mut best: HashMap<NodeId, (f32, EdgeType)> = HashMap::new();
        let mut consider = |this: &Self, u: NodeId, v: NodeId, other: NodeId| {
            for edge_type in [EdgeType::Link, EdgeType::Semantic] {
                if let Some(data) = this.edges.get(&(u, v, edge_type)) {
                    let entry = best.entry(other).or_insert((data.weight, edge_type));
                    if data.weight > entry.0 {
                        *entry = (data.weight, edge_type);
                    }
                }
            }
        };
        if matches!(direction, NeighborDirection::Outbound | NeighborDirection::Both) {
            for &v in self.outbound.get(&id).into_iter().flatten() {
                consider(self, id, v, v);
            }
        }
        if matches!(direction, NeighborDirection::Inbound | NeighborDirection::Both) {
            for &u in self.inbound.get(&id).into_iter().flatten() {
                consider(self, u, id, u);
            }
        }
        best.into_iter()
            .filter_map(|(other, (weight, edge_type))| {
                let node = self.nodes[other as usize].as_ref()?;
                Some(NeighborHit {
                    path: node.path.clone(),
                    score: weight,
                    edge_type: edge_type.as_str().to_string(),
                    via: None,
                })
            })
            .collect()
    }

    /// Two-hop discovery through topic nodes under the ontology folder:
    /// documents citing the same topic are siblings.
    fn ontology_siblings(&self, id: NodeId, ontology_folder: &str) -> Vec<NeighborHit> {
        let prefix = format!("{}/", ontology_folder.trim_end_matches('/'));
        let mut best: HashMap<NodeId, (f32, NodeId)> = HashMap::new();

        let topics = self
            .outbound
            .get(&id)
            .into_iter()
            .flatten()
            .chain(self.inbound.get(&id).into_iter().flatten());
        for &topic in topics {
            let Some(topic_node) = self.nodes[topic as usize].as_ref() else {
                continue;
            };
            if !topic_node.path.starts_with(&prefix) {
                continue;
            }
            let Some(w1) = self.edge_weight_between(id, topic) else {
                continue;
            };
            let siblings = self
                .inbound
                .get(&topic)
                .into_iter()
                .flatten()
                .chain(self.outbound.get(&topic).into_iter().flatten());
            for &sibling in siblings {
                if sibling == id {
                    continue;
                }
                let Some(w2) = self.edge_weight_between(sibling, topic) else {
                    continue;
                };
                let score = w1 * w2 * SIBLING_DECAY;
                let entry = best.entry(sibling).or_insert((score, topic));
                if score > entry.0 {
                    *entry = (score, topic);
                }
            }
        }

        best.into_iter()
            .filter_map(|(sibling, (score, topic))| {
                let node = self.nodes[sibling as usize].as_ref()?;
                let via = self.nodes[topic as usize].as_ref()?;
                Some(NeighborHit {
                    path: node.path.clone(),
                    score,
                    edge_type: EdgeType::Link.as_str().to_string(),
                    via: Some(via.path.clone()),
                })
            })
            .collect()
    }

    /// Max weight over both orientations and both edge types.
    fn edge_weight_between(&self, a: NodeId, b: NodeId) -> Option<f32> {
        let mut best: Option<f32> = None;
        for (u, v) in [(a, b), (b, a)] {
            for edge_type in [EdgeType::Link, EdgeType::Semantic] {
                if let Some(data) = self.edges.get(&(u, v, edge_type)) {
                    best = Some(best.map_or(data.weight, |w: f32| w.max(data.weight)));
                }
            }
        }
        best
    }

    /// In-degree centrality, dampened by `1/ln(degree+1)` unless the node
    /// is a hub (an ontology topic), which keeps its raw pull.
    pub fn centrality(&self, path: &str, ontology_folder: &str) -> f32 {
        let Some(&id) = self.by_path.get(path) else {
            return 0.0;
        };
        let in_degree = self.inbound.get(&id).map_or(0, HashSet::len);
        if in_degree == 0 {
            return 0.0;
        }
        let prefix = format!("{}/", ontology_folder.trim_end_matches('/'));
        let is_hub = self.nodes[id as usize]
            .as_ref()
            .is_some_and(|n| n.kind == NodeKind::Topic && n.path.starts_with(&prefix));
        if is_hub {
            in_degree as f32
        } else {
            in_degree as f32 / ((in_degree + 1) as f32).ln()
        }
    }

    pub fn batch_centrality(&self, paths: &[String], ontology_folder: &str) -> Vec<f32> {
        paths
            .iter()
            .map(|p| self.centrality(p, ontology_folder))
            .collect()
    }

    pub fn edges_snapshot(&self) -> Vec<EdgeView> {
        let mut out = Vec::with_capacity(self.edges.len());
        for (&(u, v, edge_type), data) in &self.edges {
            let (Some(from), Some(to)) = (
                self.nodes[u as usize].as_ref(),
                self.nodes[v as usize].as_ref(),
            ) else {
                continue;
            };
            out.push(EdgeView {
                from: from.path.clone(),
                to: to.path.clone(),
                edge_type,
                weight: data.weight,
                source: data.source,
            });
        }
        out.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        out
    }

    pub fn edges_of(&self, path: &str) -> Vec<EdgeView> {
        let Some(&id) = self.by_path.get(path) else {
            return Vec::new();
        };
        self.edges_snapshot()
            .into_iter()
            .filter(|e| {
                self.by_path.get(&e.from) == Some(&id) || self.by_path.get(&e.to) == Some(&id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(pairs: &[(&str, &str)]) -> GraphStore {
        let mut g = GraphStore::new();
        for (from, to) in pairs {
            g.ensure_node(from, NodeKind::File);
            g.ensure_node(to, NodeKind::Topic);
            g.add_edge(from, to, EdgeType::Link, 1.0, EdgeSource::Body);
        }
        g
    }

    #[test]
    fn duplicate_edges_merge_by_max_weight() {
        let mut g = GraphStore::new();
        g.ensure_node("a.md", NodeKind::File);
        g.ensure_node("b.md", NodeKind::File);
        g.add_edge("a.md", "b.md", EdgeType::Link, 0.4, EdgeSource::Body);
        g.add_edge("a.md", "b.md", EdgeType::Link, 0.9, EdgeSource::Frontmatter);
        g.add_edge("a.md", "b.md", EdgeType::Link, 0.2, EdgeSource::Body);
        assert_eq!(g.edge_count(), 1);
        let hits = g.neighbors(
            "a.md",
            NeighborDirection::Outbound,
            NeighborMode::Simple,
            "Ontology",
            10,
        );
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn topic_promoted_to_file_keeps_edges() {
        let mut g = linked(&[("a.md", "Topic.md")]);
        assert_eq!(g.node_kind("Topic.md"), Some(NodeKind::Topic));
        g.ensure_node("Topic.md", NodeKind::File);
        assert_eq!(g.node_kind("Topic.md"), Some(NodeKind::File));
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn remove_file_demotes_when_still_linked() {
        let mut g = GraphStore::new();
        g.ensure_node("a.md", NodeKind::File);
        g.ensure_node("b.md", NodeKind::File);
        g.add_edge("a.md", "b.md", EdgeType::Link, 1.0, EdgeSource::Body);
        g.remove_file("b.md");
        // a.md still links to it, so it survives as an unresolved topic.
        assert_eq!(g.node_kind("b.md"), Some(NodeKind::Topic));
        assert_eq!(g.edge_count(), 1);
        g.remove_file("a.md");
        // Nothing references b.md anymore; both are gone.
        assert!(!g.contains("a.md"));
        assert!(!g.contains("b.md"));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn edges_never_outlive_endpoints() {
        let mut g = linked(&[("a.md", "t.md"), ("b.md", "t.md")]);
        g.remove_file("a.md");
        for edge in g.edges_snapshot() {
            assert!(g.contains(&edge.from));
            assert!(g.contains(&edge.to));
        }
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn rename_roundtrip_restores_node_and_edge_sets() {
        let mut g = GraphStore::new();
        g.ensure_node("x.md", NodeKind::File);
        g.ensure_node("a.md", NodeKind::File);
        g.add_edge("a.md", "x.md", EdgeType::Link, 1.0, EdgeSource::Body);

        // rename a -> b
        g.remove_file("a.md");
        g.ensure_node("b.md", NodeKind::File);
        g.add_edge("b.md", "x.md", EdgeType::Link, 1.0, EdgeSource::Body);
        // rename b -> a
        g.remove_file("b.md");
        g.ensure_node("a.md", NodeKind::File);
        g.add_edge("a.md", "x.md", EdgeType::Link, 1.0, EdgeSource::Body);

        assert!(g.contains("a.md"));
        assert!(!g.contains("b.md"));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn ontology_siblings_through_shared_topic() {
        let mut g = GraphStore::new();
        g.ensure_node("Journal.md", NodeKind::File);
        g.ensure_node("FluxComp.md", NodeKind::File);
        g.ensure_node("Ontology/Project FooBar.md", NodeKind::Topic);
        g.add_edge(
            "Journal.md",
            "Ontology/Project FooBar.md",
            EdgeType::Link,
            1.0,
            EdgeSource::Body,
        );
        g.add_edge(
            "FluxComp.md",
            "Ontology/Project FooBar.md",
            EdgeType::Link,
            1.0,
            EdgeSource::Body,
        );

        let hits = g.neighbors(
            "Journal.md",
            NeighborDirection::Both,
            NeighborMode::Ontology,
            "Ontology",
            10,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "FluxComp.md");
        assert!((hits[0].score - SIBLING_DECAY).abs() < 1e-6);
        assert_eq!(hits[0].via.as_deref(), Some("Ontology/Project FooBar.md"));
    }

    #[test]
    fn ontology_mode_ignores_topics_outside_folder() {
        let mut g = linked(&[("a.md", "Elsewhere/Topic.md"), ("b.md", "Elsewhere/Topic.md")]);
        let hits = g.neighbors(
            "a.md",
            NeighborDirection::Both,
            NeighborMode::Ontology,
            "Ontology",
            10,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn centrality_dampens_non_hubs() {
        let mut g = GraphStore::new();
        for i in 0..5 {
            g.ensure_node(&format!("doc{i}.md"), NodeKind::File);
        }
        g.ensure_node("hub.md", NodeKind::File);
        for i in 0..5 {
            g.add_edge(&format!("doc{i}.md"), "hub.md", EdgeType::Link, 1.0, EdgeSource::Body);
        }
        let c = g.centrality("hub.md", "Ontology");
        assert!(c > 0.0);
        assert!(c < 5.0, "non-hub in-degree must be dampened, got {c}");
        assert_eq!(g.centrality("doc0.md", "Ontology"), 0.0);
    }

    #[test]
    fn ontology_topic_is_undampened_hub() {
        let mut g = GraphStore::new();
        for i in 0..5 {
            g.ensure_node(&format!("doc{i}.md"), NodeKind::File);
        }
        g.ensure_node("Ontology/Hub.md", NodeKind::Topic);
        for i in 0..5 {
            g.add_edge(
                &format!("doc{i}.md"),
                "Ontology/Hub.md",
                EdgeType::Link,
                1.0,
                EdgeSource::Body,
            );
        }
        assert_eq!(g.centrality("Ontology/Hub.md", "Ontology"), 5.0);
    }

    #[test]
    fn resolution_prefers_alias_over_stem() {
        let mut g = GraphStore::new();
        g.ensure_node("notes/Real Note.md", NodeKind::File);
        g.ensure_node("other/Alias Target.md", NodeKind::File);
        g.set_alias("real note", "other/Alias Target.md");

        let (path, exists) = g.resolve_target("Real Note");
        assert!(exists);
        assert_eq!(path, "other/Alias Target.md");
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let mut g = GraphStore::new();
        g.ensure_node("notes/My Note.md", NodeKind::File);
        let (path, exists) = g.resolve_target("my note");
        assert!(exists);
        assert_eq!(path, "notes/My Note.md");
        let (path, exists) = g.resolve_target("NOTES/MY NOTE.md");
        assert!(exists);
        assert_eq!(path, "notes/My Note.md");
    }

    #[test]
    fn unresolved_target_gets_md_suffix() {
        let g = GraphStore::new();
        let (path, exists) = g.resolve_target("Never Written");
        assert!(!exists);
        assert_eq!(path, "Never Written.md");
    }
}
