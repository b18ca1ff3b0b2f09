//! # Program Control-Flow Graph
//!
//! One node per statement of an iterative query program. Assignments
//! define a variable, sinks define nothing, and each `DO ... WHILE` loop
//! contributes a condition node after its body with a back-edge to the
//! first body node.
//!
//! ```text
//! Vec<ProgramItem> -> Cfg -> [validate] -> [dead code elimination] -> [chaining] -> nodes
//! ```
//!
//! Node ids are assigned in program order and stay stable across both
//! passes: eliminated nodes disappear, merged producers disappear into
//! their consumer, which keeps its own id.

pub mod analysis;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::algebra::Operator;
use crate::error::CompileResult;

pub use analysis::{Definitions, Liveness, ReachingDefinitions};

pub type NodeId = usize;

/// One statement of a query program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramItem {
    /// `variable = plan`
    Assign { variable: String, plan: Operator },
    /// A plan evaluated for its side effect, usually a store
    Sink { plan: Operator },
    /// Run `body`, then repeat while `condition` yields a truthy first value
    DoWhile {
        body: Vec<ProgramItem>,
        condition: Operator,
    },
}

/// Statement node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgNode {
    pub id: NodeId,
    /// Right-hand side; for a loop condition, the condition plan
    pub plan: Operator,
    /// Variable defined here, `None` for sinks and loop conditions
    pub def_var: Option<String>,
    /// Variables read by `plan`
    pub uses: BTreeSet<String>,
    /// Enclosing loops, outermost first
    pub loops: Vec<usize>,
    /// Set on the condition node of the loop it closes
    pub closes_loop: Option<usize>,
}

impl CfgNode {
    pub fn is_sink(&self) -> bool {
        self.def_var.is_none()
    }
}

/// Statement graph with stable node ids
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    nodes: BTreeMap<NodeId, CfgNode>,
    succs: BTreeMap<NodeId, BTreeSet<NodeId>>,
    preds: BTreeMap<NodeId, BTreeSet<NodeId>>,
    loop_count: usize,
}

impl Cfg {
    /// Build the graph; no validation happens here, see [`Cfg::validate`]
    pub fn from_program(items: &[ProgramItem]) -> Cfg {
        let mut cfg = Cfg::default();
        let mut loops = Vec::new();
        let mut prev = None;
        cfg.add_items(items, &mut loops, &mut prev);
        debug!(nodes = cfg.len(), loops = cfg.loop_count, "built program graph");
        cfg
    }

    fn add_items(&mut self, items: &[ProgramItem], loops: &mut Vec<usize>, prev: &mut Option<NodeId>) {
        for item in items {
            match item {
                ProgramItem::Assign { variable, plan } => {
                    let id = self.add_node(plan.clone(), Some(variable.clone()), loops, None);
                    self.link(prev, id);
                }
                ProgramItem::Sink { plan } => {
                    let id = self.add_node(plan.clone(), None, loops, None);
                    self.link(prev, id);
                }
                ProgramItem::DoWhile { body, condition } => {
                    let loop_id = self.loop_count;
                    self.loop_count += 1;
                    loops.push(loop_id);

                    let first = self.next_id();
                    self.add_items(body, loops, prev);
                    let test = self.add_node(condition.clone(), None, loops, Some(loop_id));
                    self.link(prev, test);
                    self.add_edge(test, first);

                    loops.pop();
                }
            }
        }
    }

    fn next_id(&self) -> NodeId {
        self.nodes.keys().next_back().map_or(0, |last| last + 1)
    }

    fn add_node(
        &mut self,
        plan: Operator,
        def_var: Option<String>,
        loops: &[usize],
        closes_loop: Option<usize>,
    ) -> NodeId {
        let id = self.next_id();
        let uses = plan.temp_reads();
        self.nodes.insert(
            id,
            CfgNode {
                id,
                plan,
                def_var,
                uses,
                loops: loops.to_vec(),
                closes_loop,
            },
        );
        self.succs.entry(id).or_default();
        self.preds.entry(id).or_default();
        id
    }

    fn link(&mut self, prev: &mut Option<NodeId>, id: NodeId) {
        if let Some(p) = *prev {
            self.add_edge(p, id);
        }
        *prev = Some(id);
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.succs.entry(from).or_default().insert(to);
        self.preds.entry(to).or_default().insert(from);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in program order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&CfgNode> {
        self.nodes.get(&id)
    }

    /// Nodes in program order
    pub fn nodes(&self) -> impl Iterator<Item = &CfgNode> {
        self.nodes.values()
    }

    pub fn successors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.succs.get(&id).cloned().unwrap_or_default()
    }

    pub fn predecessors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.preds.get(&id).cloned().unwrap_or_default()
    }

    /// All edges, sorted
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.succs
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (*from, *to)))
            .collect()
    }

    /// Remove `id`, connecting each of its predecessors to each of its successors
    fn remove_node(&mut self, id: NodeId) -> Option<CfgNode> {
        let node = self.nodes.remove(&id)?;
        let preds = self.preds.remove(&id).unwrap_or_default();
        let succs = self.succs.remove(&id).unwrap_or_default();
        for p in &preds {
            if let Some(out) = self.succs.get_mut(p) {
                out.remove(&id);
            }
        }
        for s in &succs {
            if let Some(inc) = self.preds.get_mut(s) {
                inc.remove(&id);
            }
        }
        for &p in preds.iter().filter(|p| **p != id) {
            for &s in succs.iter().filter(|s| **s != id) {
                self.add_edge(p, s);
            }
        }
        Some(node)
    }

    /// Remove assignments whose variable is never read afterwards, to a fixpoint.
    /// Returns the number of removed nodes.
    pub fn dead_code_elimination(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let liveness = self.compute_liveness();
            let dead: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| match &n.def_var {
                    Some(var) => !liveness.live_out(n.id).contains(var),
                    None => false,
                })
                .map(|n| n.id)
                .collect();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                debug!(node = id, "eliminating dead statement");
                self.remove_node(id);
                removed += 1;
            }
        }
        info!(removed, remaining = self.len(), "dead code elimination finished");
        removed
    }

    /// Inline single-use definitions into their only consumer, to a fixpoint.
    /// Returns the number of merged nodes.
    pub fn apply_chaining(&mut self) -> CompileResult<usize> {
        let mut merged = 0;
        while let Some((producer, consumer)) = self.find_chain() {
            self.merge(producer, consumer)?;
            merged += 1;
        }
        info!(merged, remaining = self.len(), "chaining finished");
        Ok(merged)
    }

    fn find_chain(&self) -> Option<(NodeId, NodeId)> {
        let reaching = self.reaching_definitions();
        let reach = |node: NodeId, var: &str| reaching.reaching(node, var).clone();

        for n in self.nodes.values() {
            let Some(var) = &n.def_var else {
                continue;
            };
            let users: Vec<&CfgNode> = self
                .nodes
                .values()
                .filter(|u| u.uses.contains(var) && reach(u.id, var).contains(&n.id))
                .collect();
            let [u] = users.as_slice() else {
                continue;
            };
            if u.id <= n.id || u.loops != n.loops {
                continue;
            }
            if reach(u.id, var).len() != 1 {
                continue;
            }
            if n.uses.iter().all(|w| reach(n.id, w) == reach(u.id, w)) {
                return Some((n.id, u.id));
            }
        }
        None
    }

    fn merge(&mut self, producer: NodeId, consumer: NodeId) -> CompileResult<()> {
        let Some(p) = self.remove_node(producer) else {
            return Ok(());
        };
        let Some(var) = p.def_var else {
            return Ok(());
        };
        if let Some(u) = self.nodes.get_mut(&consumer) {
            debug!(producer, consumer, variable = %var, "chaining statement");
            u.plan = u.plan.clone().replace_scan_temp(&var, &p.plan)?;
            u.uses.remove(&var);
            u.uses.extend(p.uses);
        }
        Ok(())
    }
}
