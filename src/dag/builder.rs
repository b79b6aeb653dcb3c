//! Graph builder for assembling domains of phase nodes.
//!
//! The builder resolves phase names against a [`PhaseRegistry`], wires
//! predecessor edges (within and across domains), links same-named nodes
//! of different domains as sync peers and validates the result. The built
//! [`PhaseGraph`] is immutable.

use crate::errors::GraphError;
use crate::phase::{COMMON_PHASES, PhaseDefinition, PhaseRegistry, RUNTIME_PHASES};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Index into the node list.
pub type NodeId = usize;

/// Name of the domain every component participates in.
pub const COMMON_DOMAIN: &str = "common";

/// One phase definition placed in one domain.
#[derive(Debug, Clone)]
pub struct PhaseNode {
    id: NodeId,
    definition: Arc<PhaseDefinition>,
    domain: String,
    predecessors: Vec<NodeId>,
    successors: Vec<NodeId>,
    /// Same-named nodes in other domains
    sync_peers: Vec<NodeId>,
    /// Other predecessors of this node's successors
    siblings: Vec<NodeId>,
}

impl PhaseNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn definition(&self) -> &Arc<PhaseDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    pub fn sync_peers(&self) -> &[NodeId] {
        &self.sync_peers
    }

    /// Nodes that feed a common successor and must drain before this one ends.
    pub fn siblings(&self) -> &[NodeId] {
        &self.siblings
    }

    /// Label used in logs and reports, e.g. `uvm.main`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.domain, self.definition.name())
    }
}

/// An immutable graph of phase nodes grouped into domains.
#[derive(Debug)]
pub struct PhaseGraph {
    nodes: Vec<PhaseNode>,
    /// (domain, phase) -> index
    index_map: HashMap<(String, String), NodeId>,
    /// Domains in creation order, with their nodes
    domains: Vec<(String, Vec<NodeId>)>,
}

impl PhaseGraph {
    /// Get the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&PhaseNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &[PhaseNode] {
        &self.nodes
    }

    /// Get the index of a phase within a domain.
    pub fn get_index(&self, domain: &str, phase: &str) -> Option<NodeId> {
        self.index_map
            .get(&(domain.to_string(), phase.to_string()))
            .copied()
    }

    /// Look up a node by its `domain.phase` label.
    pub fn find(&self, label: &str) -> Option<NodeId> {
        let (domain, phase) = label.split_once('.')?;
        self.get_index(domain, phase)
    }

    /// Domain names in creation order.
    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|(name, _)| name.as_str())
    }

    /// Nodes of a domain, in insertion order.
    pub fn domain(&self, name: &str) -> Option<&[NodeId]> {
        self.domains
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, nodes)| nodes.as_slice())
    }

    /// Nodes of the shared common domain.
    pub fn common_domain(&self) -> Option<&[NodeId]> {
        self.domain(COMMON_DOMAIN)
    }

    pub fn label(&self, id: NodeId) -> String {
        self.nodes.get(id).map(PhaseNode::label).unwrap_or_default()
    }

    /// A node together with its sync peers, sorted by id.
    pub fn sync_group(&self, id: NodeId) -> Vec<NodeId> {
        let mut group = vec![id];
        if let Some(node) = self.nodes.get(id) {
            group.extend(node.sync_peers.iter().copied());
        }
        group.sort_unstable();
        group
    }

    /// Nodes without predecessors (entry points).
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.predecessors.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Nodes without successors (exit points).
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.successors.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Check if a node and all of its sync peers have their predecessors ended.
    pub fn dependencies_satisfied(&self, id: NodeId, ended: &HashSet<NodeId>) -> bool {
        self.sync_group(id).iter().all(|&member| {
            self.nodes[member]
                .predecessors
                .iter()
                .all(|p| ended.contains(p))
        })
    }

    /// Nodes reachable from `id` through successor edges, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &next in &self.nodes[current].successors {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Predecessors of the group's successors outside the group.
    ///
    /// Nodes downstream of the group are left out: they cannot start
    /// until the group has ended.
    fn find_siblings(&self, id: NodeId) -> Vec<NodeId> {
        let group = self.sync_group(id);
        let mut downstream = HashSet::new();
        for &member in &group {
            downstream.extend(self.descendants(member));
        }

        let mut siblings: Vec<NodeId> = group
            .iter()
            .flat_map(|&member| self.nodes[member].successors.iter())
            .flat_map(|&succ| self.nodes[succ].predecessors.iter().copied())
            .filter(|p| !group.contains(p) && !downstream.contains(p))
            .collect();
        siblings.sort_unstable();
        siblings.dedup();
        siblings
    }

    /// Nodes that can run to `Done`.
    ///
    /// Replays the scheduling rules with every started activity assumed to
    /// drain: a node starts once its group's predecessors ended, and a
    /// group ends once all of its members and their siblings started.
    fn completable(&self) -> HashSet<NodeId> {
        let mut started: HashSet<NodeId> = HashSet::new();
        let mut ended: HashSet<NodeId> = HashSet::new();

        loop {
            let mut progress = false;
            for id in 0..self.nodes.len() {
                if !started.contains(&id) && self.dependencies_satisfied(id, &ended) {
                    started.insert(id);
                    progress = true;
                }
            }
            for id in 0..self.nodes.len() {
                if !started.contains(&id) || ended.contains(&id) {
                    continue;
                }
                let group = self.sync_group(id);
                let can_end = group.iter().all(|&m| {
                    started.contains(&m) && self.nodes[m].siblings.iter().all(|s| started.contains(s))
                });
                if can_end {
                    ended.extend(group);
                    progress = true;
                }
            }
            if !progress {
                return ended;
            }
        }
    }

    /// Groups of nodes that can run together once all previous waves ended.
    ///
    /// A node only appears in a wave alongside its sync peers. Nodes caught
    /// in a cycle never become ready and are left out.
    pub fn waves(&self) -> Vec<Vec<NodeId>> {
        let mut waves = Vec::new();
        let mut ended: HashSet<NodeId> = HashSet::new();

        loop {
            let ready: Vec<NodeId> = (0..self.nodes.len())
                .filter(|i| !ended.contains(i) && self.dependencies_satisfied(*i, &ended))
                .collect();

            if ready.is_empty() {
                break;
            }

            ended.extend(ready.iter().copied());
            waves.push(ready);
        }

        waves
    }

    /// Execution waves as node labels.
    pub fn wave_labels(&self) -> Vec<Vec<String>> {
        self.waves()
            .into_iter()
            .map(|wave| wave.into_iter().map(|id| self.label(id)).collect())
            .collect()
    }
}

/// Builder for phase graphs.
pub struct GraphBuilder<'r> {
    registry: &'r PhaseRegistry,
    nodes: Vec<(Arc<PhaseDefinition>, String)>,
    index_map: HashMap<(String, String), NodeId>,
    domains: Vec<(String, Vec<NodeId>)>,
    edges: Vec<(NodeId, NodeId)>,
    seen_edges: HashSet<(NodeId, NodeId)>,
}

impl<'r> GraphBuilder<'r> {
    /// Create an empty builder resolving phases from `registry`.
    pub fn new(registry: &'r PhaseRegistry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            index_map: HashMap::new(),
            domains: Vec::new(),
            edges: Vec::new(),
            seen_edges: HashSet::new(),
        }
    }

    /// Build the common domain plus the default `uvm` runtime domain.
    pub fn standard(registry: &'r PhaseRegistry) -> Result<PhaseGraph, GraphError> {
        Self::with_runtime_domains(registry, &[crate::component::DEFAULT_DOMAIN])
    }

    /// Build the common domain plus one runtime chain per name.
    pub fn with_runtime_domains(
        registry: &'r PhaseRegistry,
        names: &[&str],
    ) -> Result<PhaseGraph, GraphError> {
        let mut builder = Self::new(registry);
        builder.add_common_domain()?;
        for name in names {
            builder.add_runtime_domain(name)?;
        }
        builder.build()
    }

    /// Place `phase` in `domain`.
    pub fn add_node(&mut self, domain: &str, phase: &str) -> Result<NodeId, GraphError> {
        let definition = self
            .registry
            .get(phase)
            .ok_or_else(|| GraphError::UnknownPhase(phase.to_string()))?;

        let key = (domain.to_string(), phase.to_string());
        if self.index_map.contains_key(&key) {
            return Err(GraphError::DuplicateNode {
                domain: domain.to_string(),
                phase: phase.to_string(),
            });
        }

        let id = self.nodes.len();
        self.nodes.push((definition, domain.to_string()));
        self.index_map.insert(key, id);
        match self.domains.iter_mut().find(|(name, _)| name == domain) {
            Some((_, nodes)) => nodes.push(id),
            None => self.domains.push((domain.to_string(), vec![id])),
        }
        Ok(id)
    }

    /// Require `from` to end before `to` may start.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        for id in [from, to] {
            if id >= self.nodes.len() {
                return Err(GraphError::InvalidNode(id));
            }
        }
        if from == to {
            return Err(GraphError::SelfEdge(self.label(from)));
        }
        if self.seen_edges.insert((from, to)) {
            self.edges.push((from, to));
        }
        Ok(())
    }

    /// Append `phases` to `domain` as a linear chain.
    pub fn add_chain(&mut self, domain: &str, phases: &[&str]) -> Result<Vec<NodeId>, GraphError> {
        let mut ids = Vec::with_capacity(phases.len());
        for phase in phases {
            let id = self.add_node(domain, phase)?;
            if let Some(&prev) = ids.last() {
                self.add_edge(prev, id)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Get a previously added node.
    pub fn node(&self, domain: &str, phase: &str) -> Result<NodeId, GraphError> {
        self.index_map
            .get(&(domain.to_string(), phase.to_string()))
            .copied()
            .ok_or_else(|| GraphError::UnknownNode {
                domain: domain.to_string(),
                phase: phase.to_string(),
            })
    }

    /// Add the common chain: build through final.
    pub fn add_common_domain(&mut self) -> Result<Vec<NodeId>, GraphError> {
        self.add_chain(COMMON_DOMAIN, &COMMON_PHASES)
    }

    /// Add a runtime chain wedged between `start_of_simulation` and
    /// `extract` of the common domain.
    pub fn add_runtime_domain(&mut self, name: &str) -> Result<Vec<NodeId>, GraphError> {
        let start = self
            .node(COMMON_DOMAIN, "start_of_simulation")
            .map_err(|_| GraphError::MissingCommonDomain(COMMON_DOMAIN.to_string()))?;
        let extract = self
            .node(COMMON_DOMAIN, "extract")
            .map_err(|_| GraphError::MissingCommonDomain(COMMON_DOMAIN.to_string()))?;

        let chain = self.add_chain(name, &RUNTIME_PHASES)?;
        if let (Some(&first), Some(&last)) = (chain.first(), chain.last()) {
            self.add_edge(start, first)?;
            self.add_edge(last, extract)?;
        }
        Ok(chain)
    }

    fn label(&self, id: NodeId) -> String {
        let (definition, domain) = &self.nodes[id];
        format!("{}.{}", domain, definition.name())
    }

    /// Build the graph.
    ///
    /// Fails on an empty graph or when some nodes can never finish: a
    /// cycle through edges, sync peers or sibling waits.
    pub fn build(self) -> Result<PhaseGraph, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut nodes: Vec<PhaseNode> = self
            .nodes
            .into_iter()
            .enumerate()
            .map(|(id, (definition, domain))| PhaseNode {
                id,
                definition,
                domain,
                predecessors: Vec::new(),
                successors: Vec::new(),
                sync_peers: Vec::new(),
                siblings: Vec::new(),
            })
            .collect();

        for &(from, to) in &self.edges {
            nodes[from].successors.push(to);
            nodes[to].predecessors.push(from);
        }

        let mut by_name: HashMap<String, Vec<NodeId>> = HashMap::new();
        for node in &nodes {
            by_name
                .entry(node.name().to_string())
                .or_default()
                .push(node.id);
        }
        for group in by_name.values().filter(|g| g.len() > 1) {
            for &id in group {
                nodes[id].sync_peers = group.iter().copied().filter(|&p| p != id).collect();
            }
        }

        let mut graph = PhaseGraph {
            nodes,
            index_map: self.index_map,
            domains: self.domains,
        };

        for id in 0..graph.len() {
            let siblings = graph.find_siblings(id);
            graph.nodes[id].siblings = siblings;
        }

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    fn validate_no_cycles(graph: &PhaseGraph) -> Result<(), GraphError> {
        let completable = graph.completable();
        if completable.len() != graph.len() {
            let stuck: Vec<String> = (0..graph.len())
                .filter(|i| !completable.contains(i))
                .map(|i| graph.label(i))
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(())
    }
}
