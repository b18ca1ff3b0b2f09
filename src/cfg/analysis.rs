//! Dataflow analyses over the program graph: liveness (backward, may),
//! reaching definitions (forward, may) and definite assignment (forward,
//! must). All three iterate to a fixpoint, so loop back-edges are handled
//! without special cases.

use std::collections::{BTreeMap, BTreeSet};

use super::{Cfg, NodeId};
use crate::error::{CompileError, CompileResult};

static NO_VARIABLES: BTreeSet<String> = BTreeSet::new();
static NO_NODES: BTreeSet<NodeId> = BTreeSet::new();

/// Definitions reaching one point, per variable
pub type Definitions = BTreeMap<String, BTreeSet<NodeId>>;

/// Live variable sets on entry to and exit from each node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    pub live_in: BTreeMap<NodeId, BTreeSet<String>>,
    pub live_out: BTreeMap<NodeId, BTreeSet<String>>,
}

impl Liveness {
    pub fn live_in(&self, node: NodeId) -> &BTreeSet<String> {
        self.live_in.get(&node).unwrap_or(&NO_VARIABLES)
    }

    pub fn live_out(&self, node: NodeId) -> &BTreeSet<String> {
        self.live_out.get(&node).unwrap_or(&NO_VARIABLES)
    }
}

/// Definitions reaching the entry of each node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachingDefinitions {
    reaching_in: BTreeMap<NodeId, Definitions>,
}

impl ReachingDefinitions {
    /// Nodes whose definition of `var` may reach the entry of `node`
    pub fn reaching(&self, node: NodeId, var: &str) -> &BTreeSet<NodeId> {
        self.reaching_in
            .get(&node)
            .and_then(|defs| defs.get(var))
            .unwrap_or(&NO_NODES)
    }

    pub fn at(&self, node: NodeId) -> Option<&Definitions> {
        self.reaching_in.get(&node)
    }
}

impl Cfg {
    /// `live_out[n] = U live_in[s]`, `live_in[n] = uses[n] U (live_out[n] - def[n])`
    pub fn compute_liveness(&self) -> Liveness {
        let mut liveness = Liveness::default();
        for id in self.node_ids() {
            liveness.live_in.insert(id, BTreeSet::new());
            liveness.live_out.insert(id, BTreeSet::new());
        }

        let order: Vec<NodeId> = self.node_ids().into_iter().rev().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &order {
                let Some(node) = self.node(id) else {
                    continue;
                };
                let out: BTreeSet<String> = self
                    .successors(id)
                    .iter()
                    .flat_map(|s| liveness.live_in(*s).iter().cloned())
                    .collect();
                let mut inn: BTreeSet<String> = out.clone();
                if let Some(def) = &node.def_var {
                    inn.remove(def);
                }
                inn.extend(node.uses.iter().cloned());

                if liveness.live_out(id) != &out || liveness.live_in(id) != &inn {
                    liveness.live_out.insert(id, out);
                    liveness.live_in.insert(id, inn);
                    changed = true;
                }
            }
        }
        liveness
    }

    /// Forward may-analysis of which assignments reach each node
    pub fn reaching_definitions(&self) -> ReachingDefinitions {
        let mut reaching_in: BTreeMap<NodeId, Definitions> = BTreeMap::new();
        let mut reaching_out: BTreeMap<NodeId, Definitions> = BTreeMap::new();

        let mut changed = true;
        while changed {
            changed = false;
            for node in self.nodes() {
                let mut inn = Definitions::new();
                for p in self.predecessors(node.id) {
                    for (var, defs) in reaching_out.get(&p).into_iter().flatten() {
                        inn.entry(var.clone()).or_default().extend(defs);
                    }
                }
                let mut out = inn.clone();
                if let Some(def) = &node.def_var {
                    out.insert(def.clone(), BTreeSet::from([node.id]));
                }

                if reaching_in.get(&node.id) != Some(&inn) || reaching_out.get(&node.id) != Some(&out) {
                    reaching_in.insert(node.id, inn);
                    reaching_out.insert(node.id, out);
                    changed = true;
                }
            }
        }
        ReachingDefinitions { reaching_in }
    }

    /// Every read must be preceded by an assignment on every path from the
    /// program entry, including the first iteration of each loop
    pub fn validate(&self) -> CompileResult<()> {
        let Some(entry) = self.node_ids().first().copied() else {
            return Ok(());
        };

        // None stands for "every variable" until a path reaches the node
        let mut assigned_in: BTreeMap<NodeId, Option<BTreeSet<String>>> =
            self.node_ids().into_iter().map(|id| (id, None)).collect();
        let mut assigned_out = assigned_in.clone();
        assigned_in.insert(entry, Some(BTreeSet::new()));

        let mut changed = true;
        while changed {
            changed = false;
            for node in self.nodes() {
                let mut inn: Option<BTreeSet<String>> = if node.id == entry {
                    Some(BTreeSet::new())
                } else {
                    None
                };
                for p in self.predecessors(node.id) {
                    if let Some(Some(out)) = assigned_out.get(&p) {
                        inn = Some(match inn {
                            None => out.clone(),
                            Some(current) => current.intersection(out).cloned().collect(),
                        });
                    }
                }
                let out = inn.clone().map(|mut set| {
                    set.extend(node.def_var.iter().cloned());
                    set
                });
                if assigned_in.get(&node.id) != Some(&inn) || assigned_out.get(&node.id) != Some(&out) {
                    assigned_in.insert(node.id, inn);
                    assigned_out.insert(node.id, out);
                    changed = true;
                }
            }
        }

        for node in self.nodes() {
            let assigned = assigned_in.get(&node.id).cloned().flatten().unwrap_or_default();
            if let Some(var) = node.uses.iter().find(|v| !assigned.contains(*v)) {
                return Err(CompileError::UndefinedVariable {
                    variable: var.clone(),
                    context: format!("statement {}: {}", node.id, node.plan),
                });
            }
        }
        Ok(())
    }
}
