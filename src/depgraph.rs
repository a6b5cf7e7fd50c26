//! Dependency Engine (C2): parsing, graph construction, platform pruning,
//! backlinking, cycle detection/breaking, provider selection, and DFS
//! ordering (§4.2).
//!
//! The bit-matrix cycle-breaking design is specified precisely enough in §4.2
//! and §9 to implement directly, rather than literally porting
//! `original_source/src/librc/librc-depsolver.c`'s combinatorial
//! path-enumeration `solve_loop()`. See DESIGN.md for the exact
//! correspondence preserved (cost ordering, descending-presence-count
//! removal, 128-iteration limit).

use crate::constants::{AggregateKind, DepType, AGGREGATE_KINDS, BOOT_RUNLEVEL, LOOPSOLVER_LIMIT};
use crate::error::DependencyError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, trace, warn};

pub type NodeId = usize;

/// Operation mode for provider selection (§4.2 "Provider selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Strict,
}

/// Runtime status of a service, as far as the provider-selection fuzzy bands
/// (§4.2) need to distinguish it. A thin projection of the full `service`
/// module's state, kept separate so `depgraph` has no dependency on C3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Started,
    Pending, // starting/stopping/inactive
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    edges: HashMap<DepType, Vec<NodeId>>,
    pub broken: BTreeSet<String>,
    pub keyword: BTreeSet<String>,
    /// Monotonically increasing traversal-pass marker (§4.2 "Ordering"):
    /// compared against the graph's current pass id rather than storing a
    /// boolean, so ordering stays stable across repeated plans.
    visited_pass: u64,
}

impl Node {
    fn new(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            edges: HashMap::new(),
            broken: BTreeSet::new(),
            keyword: BTreeSet::new(),
            visited_pass: 0,
        }
    }

    pub fn edge_targets(&self, kind: DepType) -> &[NodeId] {
        self.edges.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn edge_targets_mut(&mut self, kind: DepType) -> &mut Vec<NodeId> {
        self.edges.entry(kind).or_default()
    }
}

/// Directed multigraph over services (§3). Node identity is by index; a name
/// index resolves `RC_SVCNAME`-style references.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    /// Files named on `config` lines (§4.2 "Parsing"): an orthogonal list
    /// that feeds cache-validity checks, not a dependency edge.
    pub config_files: Vec<String>,
    /// Services that appeared as the SERVICE field of at least one line, as
    /// opposed to nodes created only because something else referenced them
    /// (used to tell a genuinely declared service from a dangling `need`
    /// target when computing `broken`, §3).
    declared: HashSet<NodeId>,
    pass_counter: u64,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    /// Iterates over every declared service's name (§4.2 "Ordering" callers
    /// that need a full-graph scan, e.g. a restart's started-service
    /// snapshot). Pruned/dangling nodes are excluded since they are no
    /// longer present in the name index.
    pub fn declared_names(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(|&id| self.nodes[id].name.as_str())
    }

    fn get_or_insert(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node::new(name));
        self.index.insert(name.to_string(), id);
        id
    }

    /// Parses harness output: lines of the form `SERVICE TYPE TOKEN …`
    /// (§4.2 "Parsing"). Consecutive lines sharing SERVICE form one node.
    /// Unknown TYPEs and `.sh`-suffixed or self-referencing tokens are
    /// ignored. A `!`-prefixed token removes an already-declared edge of
    /// that kind. `config` lines accumulate `config_files` instead of edges.
    pub fn parse(lines: impl IntoIterator<Item = impl AsRef<str>>) -> Graph {
        let mut graph = Graph::default();
        // name-keyed pending edges, resolved to NodeId once parsing completes
        // so forward references to not-yet-seen services still work.
        let mut pending: HashMap<String, HashMap<DepType, Vec<String>>> = HashMap::new();

        for raw in lines {
            let line = raw.as_ref();
            let mut parts = line.split_whitespace();
            let (Some(service), Some(kind_tok)) = (parts.next(), parts.next()) else {
                continue;
            };
            let service_id = graph.get_or_insert(service);
            graph.declared.insert(service_id);

            if kind_tok == "config" {
                graph
                    .config_files
                    .extend(parts.map(|s| s.trim_start_matches('!').to_string()));
                continue;
            }

            if kind_tok == "keyword" {
                let node = &mut graph.nodes[graph.index[service]];
                for tok in parts {
                    node.keyword.insert(tok.trim_start_matches('!').to_string());
                }
                continue;
            }

            let Ok(kind) = DepType::from_str(kind_tok) else {
                trace!(service, kind = kind_tok, "ignoring unknown dependency type");
                continue;
            };

            let bucket = pending.entry(service.to_string()).or_default();
            for token in parts {
                let (removal, name) = match token.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, token),
                };
                if name.ends_with(".sh") || name == service {
                    continue;
                }
                let list = bucket.entry(kind).or_default();
                if removal {
                    list.retain(|n| n != name);
                } else if !list.contains(&name.to_string()) {
                    list.push(name.to_string());
                }
            }
        }

        for (service, kinds) in pending {
            let id = graph.get_or_insert(&service);
            for (kind, names) in kinds {
                for name in names {
                    let target = graph.get_or_insert(&name);
                    graph.nodes[id].edge_targets_mut(kind).push(target);
                }
            }
        }

        graph
    }

    /// Serializes this graph as the persisted `deptree` cache (§6): one
    /// `depinfo_<I>_service='<NAME>'` line per declared node, followed by
    /// `depinfo_<I>_<TYPE>_<K>='<NAME>'` lines for each of its edges (all
    /// twelve real edge kinds, forward and reverse) and for its `broken` and
    /// `keyword` attribute sets. Distinct from [`Graph::parse`], which reads
    /// the harness build format, not this cache format.
    pub fn to_cache_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if !self.declared.contains(&idx) {
                continue;
            }
            lines.push(format!("depinfo_{idx}_service='{}'", node.name));

            for kind in DepType::FORWARD_EDGE_KINDS {
                for (k, &target) in node.edge_targets(kind).iter().enumerate() {
                    lines.push(format!(
                        "depinfo_{idx}_{}_{k}='{}'",
                        kind.cache_name(),
                        self.nodes[target].name
                    ));
                }
                if let Some(reverse) = kind.reverse() {
                    for (k, &target) in node.edge_targets(reverse).iter().enumerate() {
                        lines.push(format!(
                            "depinfo_{idx}_{}_{k}='{}'",
                            reverse.cache_name(),
                            self.nodes[target].name
                        ));
                    }
                }
            }
            for (k, name) in node.broken.iter().enumerate() {
                lines.push(format!("depinfo_{idx}_broken_{k}='{name}'"));
            }
            for (k, name) in node.keyword.iter().enumerate() {
                lines.push(format!("depinfo_{idx}_keyword_{k}='{name}'"));
            }
        }
        lines
    }

    /// Parses the persisted `deptree` cache format (§6): `depinfo_<I>_service`
    /// lines open a node, `depinfo_<I>_<TYPE>_<K>` lines add that node's Kth
    /// token for dependency kind `TYPE`. Unlike [`Graph::parse`] this format
    /// carries no `config` lines; `config_files` is left empty by a
    /// cache-only load.
    pub fn from_cache(lines: impl IntoIterator<Item = impl AsRef<str>>) -> Graph {
        let mut graph = Graph::default();
        let mut by_index: HashMap<u64, NodeId> = HashMap::new();
        let mut pending: HashMap<NodeId, HashMap<DepType, Vec<String>>> = HashMap::new();
        let mut broken: HashMap<NodeId, Vec<String>> = HashMap::new();
        let mut keywords: HashMap<NodeId, Vec<String>> = HashMap::new();

        for raw in lines {
            let line = raw.as_ref().trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some(key) = key.strip_prefix("depinfo_") else {
                continue;
            };
            let value = value.trim_matches('\'');

            let mut parts = key.splitn(2, '_');
            let (Some(idx_tok), Some(rest)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(idx) = idx_tok.parse::<u64>() else {
                continue;
            };

            if rest == "service" {
                let id = graph.get_or_insert(value);
                graph.declared.insert(id);
                by_index.insert(idx, id);
                continue;
            }

            let Some(&node_id) = by_index.get(&idx) else {
                trace!(idx, "ignoring cache line for unopened node");
                continue;
            };
            let Some((type_tok, _k)) = rest.rsplit_once('_') else {
                continue;
            };

            if type_tok == "broken" {
                broken.entry(node_id).or_default().push(value.to_string());
                continue;
            }
            if type_tok == "keyword" {
                keywords.entry(node_id).or_default().push(value.to_string());
                continue;
            }
            let Ok(kind) = DepType::from_str(type_tok) else {
                trace!(idx, kind = type_tok, "ignoring unknown dependency type in cache");
                continue;
            };
            pending
                .entry(node_id)
                .or_default()
                .entry(kind)
                .or_default()
                .push(value.to_string());
        }

        for (node_id, kinds) in pending {
            for (kind, names) in kinds {
                for name in names {
                    let target = graph.get_or_insert(&name);
                    graph.nodes[node_id].edge_targets_mut(kind).push(target);
                }
            }
        }
        for (node_id, names) in broken {
            graph.nodes[node_id].broken.extend(names);
        }
        for (node_id, names) in keywords {
            graph.nodes[node_id].keyword.extend(names);
        }

        graph
    }

    /// Writes this graph's `deptree` cache and its accumulated `config_files`
    /// (kept in `depconfig`) in one step, so the two on-disk artifacts a
    /// regenerator produces stay in sync (§6).
    pub fn write_cache(&self, cache_path: &Path, depconfig_path: &Path) -> io::Result<()> {
        fs::write(cache_path, self.to_cache_lines().join("\n"))?;
        fs::write(depconfig_path, self.config_files.join("\n"))?;
        Ok(())
    }

    /// Platform pruning (§4.2): removes any service whose keyword set opts
    /// out of system type `system_tag`, and strips every edge referencing
    /// it. Runs before backlinking.
    pub fn prune_platform(&mut self, system_tag: &str) {
        let lower = system_tag.to_lowercase();
        let deny_a = format!("-{lower}");
        let deny_b = format!("no{lower}");
        let removed: HashSet<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.keyword.contains(&deny_a) || n.keyword.contains(&deny_b))
            .map(|(id, _)| id)
            .collect();

        if removed.is_empty() {
            return;
        }

        debug!(count = removed.len(), tag = system_tag, "pruning services for platform");
        for node in &mut self.nodes {
            for targets in node.edges.values_mut() {
                targets.retain(|t| !removed.contains(t));
            }
        }
        // Leave pruned nodes themselves in the table (their ids must stay
        // stable for any other node's edge vectors), but detach them from
        // the name index so `find`/`resolve` no longer surfaces them.
        self.index.retain(|_, id| !removed.contains(id));
    }

    /// Backlinking (§4.2): for every forward edge A→B of kind K with a
    /// defined reverse K′, insert B→A of kind K′. A `need` edge to a missing
    /// target is recorded in A's `broken` set instead of creating an edge.
    pub fn backlink(&mut self) {
        let mut to_add: Vec<(NodeId, DepType, NodeId)> = Vec::new();

        for (id, node) in self.nodes.iter().enumerate() {
            for kind in DepType::FORWARD_EDGE_KINDS {
                let Some(reverse) = kind.reverse() else {
                    continue;
                };
                for &target in node.edge_targets(kind) {
                    to_add.push((target, reverse, id));
                }
            }
        }

        for (id, kind, target) in to_add {
            let list = self.nodes[id].edge_targets_mut(kind);
            if !list.contains(&target) {
                list.push(target);
            }
        }

        self.mark_broken_needs();
    }

    /// Records missing `need` targets into `broken` (§3): a target that was
    /// only ever created as the far end of a `need` edge, never declared by
    /// its own `SERVICE ...` line, does not exist.
    fn mark_broken_needs(&mut self) {
        let mut to_break: Vec<(NodeId, String)> = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            for &target in node.edge_targets(DepType::INeed) {
                if !self.declared.contains(&target) {
                    to_break.push((id, self.nodes[target].name.clone()));
                }
            }
        }
        for (id, name) in to_break {
            self.nodes[id].broken.insert(name);
        }
    }

    fn aggregate_kind_to_deptype(kind: AggregateKind) -> DepType {
        match kind {
            AggregateKind::Use => DepType::IUse,
            AggregateKind::After => DepType::IAfter,
            AggregateKind::Need => DepType::INeed,
            AggregateKind::ProvidedBy => DepType::ProvidedBy,
        }
    }

    fn adjacency(&self, kinds: &[DepType]) -> Vec<HashSet<NodeId>> {
        self.nodes
            .iter()
            .map(|n| {
                let mut set = HashSet::new();
                for &k in kinds {
                    set.extend(n.edge_targets(k).iter().copied());
                }
                set
            })
            .collect()
    }

    /// Reflexive transitive closure via bitwise OR to a fixed point (§9
    /// Design Note): row `i` starts as the direct neighbours of `i`, and is
    /// repeatedly unioned with the rows of its current members until no row
    /// changes. `i` ends up a member of its own closure exactly when a real
    /// cycle passes through it.
    fn expand(adjacency: &[HashSet<NodeId>]) -> Vec<HashSet<NodeId>> {
        let mut expanded = adjacency.to_vec();
        loop {
            let mut changed = false;
            for i in 0..expanded.len() {
                let additions: Vec<NodeId> = expanded[i]
                    .iter()
                    .flat_map(|&j| adjacency[j].iter().copied())
                    .filter(|n| !expanded[i].contains(n))
                    .collect();
                if !additions.is_empty() {
                    expanded[i].extend(additions);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        expanded
    }

    /// Cycle breaking (`tryfix`, §4.2). Returns `Ok(())` once no cycle
    /// remains (possibly after dropping `use`/`after` edges), or
    /// `Err(DependencyError::UnsolvableCycle)` the first time a cycle is
    /// found with no droppable (cost ≤ `after`) escape, or
    /// `Err(DependencyError::CycleSolverLimitExceeded)` past the iteration
    /// cap.
    pub fn tryfix(&mut self) -> Result<(), DependencyError> {
        let mixed_kinds: Vec<DepType> = AGGREGATE_KINDS
            .iter()
            .map(|k| Self::aggregate_kind_to_deptype(*k))
            .collect();
        let droppable_kinds = [DepType::IUse, DepType::IAfter];

        for iteration in 0..LOOPSOLVER_LIMIT {
            let mixed = self.adjacency(&mixed_kinds);
            let expanded = Self::expand(&mixed);

            let cyclic: Vec<NodeId> = (0..self.nodes.len())
                .filter(|&i| expanded[i].contains(&i))
                .collect();

            if cyclic.is_empty() {
                return Ok(());
            }

            // Solvability: a cycle through S is breakable iff S is
            // self-reachable using only cost<=after edges (use, after). If
            // every path back to S needs a `need`/`providedby` edge, the
            // minimum path cost exceeds `after` and the loop is unsolvable.
            let use_after = self.adjacency(&droppable_kinds);
            let use_after_expanded = Self::expand(&use_after);

            let mut edge_counts: HashMap<(NodeId, DepType, NodeId), usize> = HashMap::new();
            let mut discovery_order: Vec<(NodeId, DepType, NodeId)> = Vec::new();
            let mut unsolvable = Vec::new();

            for &start in &cyclic {
                if !use_after_expanded[start].contains(&start) {
                    unsolvable.push(start);
                    continue;
                }
                if let Some(path) = self.find_elementary_cycle(start, &droppable_kinds) {
                    for edge in path {
                        let count = edge_counts.entry(edge).or_insert(0);
                        if *count == 0 {
                            discovery_order.push(edge);
                        }
                        *count += 1;
                    }
                }
            }

            if !unsolvable.is_empty() {
                let cycle_desc = unsolvable
                    .iter()
                    .map(|&id| self.nodes[id].name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(cycle = %cycle_desc, "unsolvable dependency cycle (need/providedby load-bearing)");
                return Err(DependencyError::UnsolvableCycle { cycle: cycle_desc });
            }

            if discovery_order.is_empty() {
                // Cyclic nodes exist but no droppable elementary cycle was
                // found by the bounded search; treat conservatively as
                // unsolvable rather than spin.
                let cycle_desc = cyclic
                    .iter()
                    .map(|&id| self.nodes[id].name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DependencyError::UnsolvableCycle { cycle: cycle_desc });
            }

            let mut ranked: Vec<(usize, (NodeId, DepType, NodeId))> = discovery_order
                .into_iter()
                .enumerate()
                .map(|(idx, edge)| (idx, edge))
                .collect();
            ranked.sort_by(|(idx_a, a), (idx_b, b)| {
                edge_counts[b]
                    .cmp(&edge_counts[a])
                    .then_with(|| idx_a.cmp(idx_b))
            });

            let (src, kind, dst) = ranked[0].1;
            trace!(
                iteration,
                from = %self.nodes[src].name,
                kind = ?kind,
                to = %self.nodes[dst].name,
                "dropping edge to break cycle"
            );
            self.nodes[src].edge_targets_mut(kind).retain(|&t| t != dst);
            if let Some(rev) = kind.reverse() {
                self.nodes[dst].edge_targets_mut(rev).retain(|&t| t != src);
            }
        }

        Err(DependencyError::CycleSolverLimitExceeded {
            iterations: LOOPSOLVER_LIMIT,
        })
    }

    /// DFS for the first elementary cycle from `start` back to `start` using
    /// only the given edge kinds. Returns the edges along that cycle.
    fn find_elementary_cycle(
        &self,
        start: NodeId,
        kinds: &[DepType],
    ) -> Option<Vec<(NodeId, DepType, NodeId)>> {
        let mut path_edges: Vec<(NodeId, DepType, NodeId)> = Vec::new();
        let mut on_stack: HashSet<NodeId> = HashSet::from([start]);

        fn dfs(
            graph: &Graph,
            current: NodeId,
            start: NodeId,
            kinds: &[DepType],
            on_stack: &mut HashSet<NodeId>,
            path: &mut Vec<(NodeId, DepType, NodeId)>,
        ) -> bool {
            for &kind in kinds {
                for &next in graph.nodes[current].edge_targets(kind) {
                    if next == start && !path.is_empty() {
                        path.push((current, kind, next));
                        return true;
                    }
                    if on_stack.contains(&next) {
                        continue;
                    }
                    on_stack.insert(next);
                    path.push((current, kind, next));
                    if dfs(graph, next, start, kinds, on_stack, path) {
                        return true;
                    }
                    path.pop();
                    on_stack.remove(&next);
                }
            }
            false
        }

        if dfs(self, start, start, kinds, &mut on_stack, &mut path_edges) {
            Some(path_edges)
        } else {
            None
        }
    }

    /// Provider selection (§4.2). `candidates` are providers of an abstract
    /// name in a forward `need`/`use`/`want` edge.
    pub fn select_provider(
        &self,
        candidates: &[NodeId],
        op: Operation,
        runlevel_members: &HashSet<String>,
        hotplugged: &HashSet<NodeId>,
        boot_members: &HashSet<String>,
        status_of: &dyn Fn(NodeId) -> ProviderStatus,
    ) -> Vec<NodeId> {
        if candidates.is_empty() {
            return Vec::new();
        }

        if op == Operation::Stop {
            return candidates.to_vec();
        }

        if op == Operation::Strict || op == Operation::Start {
            let strict: Vec<NodeId> = candidates
                .iter()
                .copied()
                .filter(|&c| {
                    let name = &self.nodes[c].name;
                    runlevel_members.contains(name)
                        || boot_members.contains(name)
                        || (op == Operation::Start && hotplugged.contains(&c))
                })
                .collect();
            if op == Operation::Strict {
                return strict;
            }
            if !strict.is_empty() {
                return strict;
            }
            // START falls through to fuzzy selection when no strict match.
        }

        let started: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|&c| status_of(c) == ProviderStatus::Started)
            .collect();
        if started.len() >= 2 {
            // Early-exit: needs already satisfied by multiple started
            // providers, caller should not wait on any one of them.
            return Vec::new();
        }
        if started.len() == 1 {
            return started;
        }

        let pending: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|&c| status_of(c) == ProviderStatus::Pending)
            .collect();
        let band = if !pending.is_empty() {
            pending
        } else {
            candidates.to_vec()
        };

        self.rank_within_band(band, runlevel_members, hotplugged, boot_members)
    }

    fn rank_within_band(
        &self,
        band: Vec<NodeId>,
        runlevel_members: &HashSet<String>,
        hotplugged: &HashSet<NodeId>,
        boot_members: &HashSet<String>,
    ) -> Vec<NodeId> {
        let score = |c: &NodeId| -> u8 {
            let name = &self.nodes[*c].name;
            if runlevel_members.contains(name) {
                0
            } else if hotplugged.contains(c) {
                1
            } else if boot_members.contains(name) {
                2
            } else {
                3
            }
        };
        let mut best = band;
        best.sort_by_key(|c| score(c));
        if let Some(&first) = best.first() {
            vec![first]
        } else {
            Vec::new()
        }
    }

    /// `order(runlevel, options)` (§4.2): DFS over `need ∪ use ∪ want ∪
    /// after`, emitting each service after its dependencies, in a fresh
    /// traversal pass so prior calls don't leak visitation state.
    #[allow(clippy::too_many_arguments)]
    pub fn order(
        &mut self,
        entry_points: &[NodeId],
        op: Operation,
        runlevel_members: &HashSet<String>,
        hotplugged: &HashSet<NodeId>,
        boot_members: &HashSet<String>,
        status_of: &dyn Fn(NodeId) -> ProviderStatus,
        caller_svcname: Option<&str>,
        providedby_of_someone_else: &HashSet<NodeId>,
    ) -> Vec<NodeId> {
        self.pass_counter += 1;
        let pass = self.pass_counter;
        let mut output = Vec::new();
        let kinds = [DepType::INeed, DepType::IUse, DepType::IWant, DepType::IAfter];

        for &entry in entry_points {
            self.visit(
                entry,
                pass,
                &kinds,
                op,
                runlevel_members,
                hotplugged,
                boot_members,
                status_of,
                caller_svcname,
                providedby_of_someone_else,
                entry_points,
                &mut output,
            );
        }
        output
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        node: NodeId,
        pass: u64,
        kinds: &[DepType],
        op: Operation,
        runlevel_members: &HashSet<String>,
        hotplugged: &HashSet<NodeId>,
        boot_members: &HashSet<String>,
        status_of: &dyn Fn(NodeId) -> ProviderStatus,
        caller_svcname: Option<&str>,
        providedby_of_someone_else: &HashSet<NodeId>,
        entry_points: &[NodeId],
        output: &mut Vec<NodeId>,
    ) {
        if self.nodes[node].visited_pass == pass {
            return;
        }
        self.nodes[node].visited_pass = pass;

        for &kind in kinds {
            let targets = self.nodes[node].edge_targets(kind).to_vec();
            for target in targets {
                let providers = self.nodes[target].edge_targets(DepType::ProvidedBy).to_vec();
                if providers.is_empty() {
                    self.visit(
                        target,
                        pass,
                        kinds,
                        op,
                        runlevel_members,
                        hotplugged,
                        boot_members,
                        status_of,
                        caller_svcname,
                        providedby_of_someone_else,
                        entry_points,
                        output,
                    );
                } else {
                    let chosen = self.select_provider(
                        &providers,
                        op,
                        runlevel_members,
                        hotplugged,
                        boot_members,
                        status_of,
                    );
                    for provider in chosen {
                        self.visit(
                            provider,
                            pass,
                            kinds,
                            op,
                            runlevel_members,
                            hotplugged,
                            boot_members,
                            status_of,
                            caller_svcname,
                            providedby_of_someone_else,
                            entry_points,
                            output,
                        );
                    }
                }
            }
        }

        let is_entry = entry_points.contains(&node);
        let is_svcname = caller_svcname.is_some_and(|s| s == self.nodes[node].name);
        if !providedby_of_someone_else.contains(&node) || is_entry {
            if !is_svcname {
                output.push(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &str) -> Vec<String> {
        s.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn backlink_symmetry_holds() {
        let mut g = Graph::parse(lines("a ineed b\nb ineed c\n"));
        g.backlink();
        let a = g.find("a").unwrap();
        let b = g.find("b").unwrap();
        let c = g.find("c").unwrap();
        assert!(g.node(b).edge_targets(DepType::NeedsMe).contains(&a));
        assert!(g.node(c).edge_targets(DepType::NeedsMe).contains(&b));
    }

    #[test]
    fn no_self_edges_created() {
        let mut g = Graph::parse(lines("a ineed a\n"));
        g.backlink();
        let a = g.find("a").unwrap();
        assert!(!g.node(a).edge_targets(DepType::INeed).contains(&a));
    }

    #[test]
    fn breakable_after_cycle_is_resolved() {
        // S3: A after B, B after C, C after A
        let mut g = Graph::parse(lines(
            "a iafter b\nb iafter c\nc iafter a\n",
        ));
        g.backlink();
        g.tryfix().expect("after-only cycle should be solvable");

        let a = g.find("a").unwrap();
        let b = g.find("b").unwrap();
        let c = g.find("c").unwrap();
        let mixed = g.adjacency(&[DepType::IUse, DepType::IAfter, DepType::INeed, DepType::ProvidedBy]);
        let expanded = Graph::expand(&mixed);
        assert!(!expanded[a].contains(&a));
        assert!(!expanded[b].contains(&b));
        assert!(!expanded[c].contains(&c));
    }

    #[test]
    fn unsolvable_need_cycle_errors() {
        // S4: A need B, B need A
        let mut g = Graph::parse(lines("a ineed b\nb ineed a\n"));
        g.backlink();
        let err = g.tryfix().unwrap_err();
        assert!(matches!(err, DependencyError::UnsolvableCycle { .. }));
    }

    #[test]
    fn provider_selection_prefers_runlevel_member() {
        // S5: net providedby {eth0, wlan0}; eth0 in default, wlan0 not.
        let mut g = Graph::parse(lines(
            "eth0 iprovide net\nwlan0 iprovide net\nsshd ineed net\n",
        ));
        g.backlink();
        let net = g.find("net").unwrap();
        let eth0 = g.find("eth0").unwrap();
        let providers = g.node(net).edge_targets(DepType::ProvidedBy).to_vec();

        let mut runlevel_members = HashSet::new();
        runlevel_members.insert("eth0".to_string());
        let boot_members = HashSet::new();
        let hotplugged = HashSet::new();
        let status_of = |_: NodeId| ProviderStatus::Stopped;

        let chosen = g.select_provider(
            &providers,
            Operation::Start,
            &runlevel_members,
            &hotplugged,
            &boot_members,
            &status_of,
        );
        assert_eq!(chosen, vec![eth0]);
    }

    #[test]
    fn order_respects_need_closure() {
        // S1: A need B, both in default; order must place B before A.
        let mut g = Graph::parse(lines("a ineed b\n"));
        g.backlink();
        let a = g.find("a").unwrap();
        let b = g.find("b").unwrap();
        let runlevel_members: HashSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        let boot_members = HashSet::new();
        let hotplugged = HashSet::new();
        let providedby_of_someone_else = HashSet::new();
        let status_of = |_: NodeId| ProviderStatus::Stopped;

        let order = g.order(
            &[a],
            Operation::Start,
            &runlevel_members,
            &hotplugged,
            &boot_members,
            &status_of,
            None,
            &providedby_of_someone_else,
        );
        let pos_a = order.iter().position(|&n| n == a).unwrap();
        let pos_b = order.iter().position(|&n| n == b).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn config_lines_are_collected_not_edges() {
        let g = Graph::parse(lines("a config /etc/conf.d/a\n"));
        assert_eq!(g.config_files, vec!["/etc/conf.d/a".to_string()]);
    }

    #[test]
    fn bang_prefix_removes_previously_declared_edge() {
        let g = Graph::parse(lines("a ineed b\na ineed !b\n"));
        let a = g.find("a").unwrap();
        assert!(g.node(a).edge_targets(DepType::INeed).is_empty());
    }

    #[test]
    fn cache_round_trip_preserves_edges_broken_and_keyword() {
        let mut g = Graph::parse(lines("a ineed b\na iuse c\n"));
        g.backlink();
        let a_id = g.find("a").unwrap();
        g.nodes[a_id].keyword.insert("-linux".to_string());
        g.nodes[a_id].broken.insert("ghost".to_string());

        let cached = g.to_cache_lines();
        assert!(cached.iter().any(|l| l == "depinfo_0_service='a'"));

        let reloaded = Graph::from_cache(cached);
        let a = reloaded.find("a").unwrap();
        let b = reloaded.find("b").unwrap();
        let c = reloaded.find("c").unwrap();
        assert!(reloaded.node(a).edge_targets(DepType::INeed).contains(&b));
        assert!(reloaded.node(a).edge_targets(DepType::IUse).contains(&c));
        assert!(reloaded.node(b).edge_targets(DepType::NeedsMe).contains(&a));
        assert!(reloaded.node(a).keyword.contains("-linux"));
        assert!(reloaded.node(a).broken.contains("ghost"));
    }

    #[test]
    fn cache_lines_ignore_undeclared_dangling_targets() {
        // "b" only exists as a need-target, never declared by its own line,
        // so it must not get a `depinfo_*_service` line of its own.
        let g = Graph::parse(lines("a ineed b\n"));
        let cached = g.to_cache_lines();
        assert!(!cached.iter().any(|l| l.contains("_service='b'")));
    }
}
