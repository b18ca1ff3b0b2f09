//! # Optimizer
//!
//! Rewrites a logical plan into a plan over a target algebra by running the
//! target's rule groups in order:
//!
//! - Trivial sequence removal: `Sequence[x]` -> `x`
//! - Group-by simplification: computed keys and aggregate inputs move into an `Apply`
//! - Select pushdown: merge selects, extract join conditions, push through set operations
//! - Project cleanup: merge projections, drop identity projections
//! - Apply cleanup: merge applies, absorb projections, drop identity applies
//! - Physical substitution (pipelined target only)
//!
//! ```text
//! Operator (logical) -> [bind] -> [catalog check] -> [rule groups] -> Operator (target)
//! ```

pub mod logical;
pub mod physical;

use tracing::{debug, info};

use crate::algebra::Operator;
use crate::catalog::RelationCatalog;
use crate::config::OptimizerConfig;
use crate::error::{CompileError, CompileResult};
use crate::rules::{run_groups, Mode, RuleGroup, Strategy, DEFAULT_MAX_ITERATIONS};

pub use physical::JoinAlgorithm;

use logical::{
    AbsorbProjectIntoApply, ExtractJoinConditions, MergeApplies, MergeProjects, MergeSelects,
    PushSelectThroughSetOperations, RemoveIdentityApply, RemoveIdentityProject,
    RemoveTrivialSequences, SimpleGroupBy, SwapJoinSides,
};
use physical::{JoinImplementation, MemoryScanOfFileScan, OneToOne};

/// A target algebra supplies the ordered rule groups that lower a plan
pub trait TargetAlgebra {
    fn name(&self) -> &str;

    fn rule_groups(&self, max_iterations: usize) -> Vec<RuleGroup>;
}

fn logical_groups(max_iterations: usize) -> Vec<RuleGroup> {
    vec![
        RuleGroup::new("remove_trivial_sequences", vec![Box::new(RemoveTrivialSequences)]),
        RuleGroup::new("simple_group_by", vec![Box::new(SimpleGroupBy)]),
        RuleGroup::new(
            "push_select",
            vec![
                Box::new(MergeSelects),
                Box::new(ExtractJoinConditions),
                Box::new(PushSelectThroughSetOperations),
            ],
        ),
        RuleGroup::new(
            "push_project",
            vec![Box::new(MergeProjects), Box::new(RemoveIdentityProject)],
        ),
        RuleGroup::new(
            "push_apply",
            vec![
                Box::new(MergeApplies),
                Box::new(AbsorbProjectIntoApply),
                Box::new(RemoveIdentityApply),
            ],
        ),
    ]
    .into_iter()
    .map(|g| g.with_max_iterations(max_iterations))
    .collect()
}

/// Logical rewrites only; the result is still a logical plan
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalAlgebra;

impl TargetAlgebra for LogicalAlgebra {
    fn name(&self) -> &str {
        "logical"
    }

    fn rule_groups(&self, max_iterations: usize) -> Vec<RuleGroup> {
        logical_groups(max_iterations)
    }
}

/// Pipelined produce/consume target
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelinedAlgebra {
    pub join: JoinAlgorithm,
    /// Swap the inputs of every join before anything else runs
    pub swap_join_sides: bool,
}

impl PipelinedAlgebra {
    pub fn new(join: JoinAlgorithm) -> Self {
        PipelinedAlgebra {
            join,
            swap_join_sides: false,
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        PipelinedAlgebra {
            join: config.join_algorithm,
            swap_join_sides: config.swap_join_sides,
        }
    }
}

impl TargetAlgebra for PipelinedAlgebra {
    fn name(&self) -> &str {
        "pipelined"
    }

    fn rule_groups(&self, max_iterations: usize) -> Vec<RuleGroup> {
        let mut groups = Vec::new();
        if self.swap_join_sides {
            groups.push(
                RuleGroup::new("swap_join_sides", vec![Box::new(SwapJoinSides)])
                    .with_strategy(Strategy::BottomUp)
                    .with_mode(Mode::OnePass),
            );
        }
        groups.extend(logical_groups(max_iterations));
        groups.push(
            RuleGroup::new(
                "physical",
                vec![
                    Box::new(MemoryScanOfFileScan),
                    Box::new(OneToOne),
                    Box::new(JoinImplementation { algorithm: self.join }),
                ],
            )
            .with_strategy(Strategy::BottomUp)
            .with_mode(Mode::OnePass),
        );
        groups
    }
}

/// Plan optimizer
pub struct Optimizer {
    max_iterations: usize,
    check_catalog: bool,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            check_catalog: true,
        }
    }

    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Optimizer {
            max_iterations,
            ..Self::new()
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Optimizer {
            max_iterations: config.max_fixpoint_iterations,
            check_catalog: config.check_catalog,
        }
    }

    /// Bind, check and lower `plan` for `target`
    pub fn optimize(
        &self,
        plan: Operator,
        target: &dyn TargetAlgebra,
        catalog: Option<&dyn RelationCatalog>,
    ) -> CompileResult<Operator> {
        let plan = bind_attributes(plan)?;
        if self.check_catalog {
            if let Some(catalog) = catalog {
                check_scans(&plan, catalog)?;
            }
        }

        let groups = target.rule_groups(self.max_iterations);
        debug!(target = target.name(), groups = groups.len(), "optimizing plan");
        let before = plan.size();
        let optimized = run_groups(&groups, plan)?;
        info!(
            target = target.name(),
            nodes_before = before,
            nodes_after = optimized.size(),
            "plan optimized"
        );
        Ok(optimized)
    }
}

/// Resolve named attribute references to positions, bottom-up
pub fn bind_attributes(plan: Operator) -> CompileResult<Operator> {
    plan.rewrite_up(&mut bind_node)
}

fn bind_node(op: Operator) -> CompileResult<Operator> {
    Ok(match op {
        Operator::Select { condition, input } => {
            let scheme = input.scheme()?;
            Operator::Select {
                condition: condition.bind(&scheme)?,
                input,
            }
        }
        Operator::Apply { emitters, input } => {
            let scheme = input.scheme()?;
            let emitters = emitters
                .into_iter()
                .map(|(name, e)| Ok((name, e.bind(&scheme)?)))
                .collect::<CompileResult<_>>()?;
            Operator::Apply { emitters, input }
        }
        Operator::Project { columns, input } => {
            let arity = input.scheme()?.len();
            if let Some(&position) = columns.iter().find(|c| **c >= arity) {
                return Err(CompileError::AttributeOutOfRange { position, arity });
            }
            Operator::Project { columns, input }
        }
        Operator::Join {
            condition,
            left,
            right,
        } => {
            let scheme = left.scheme()?.concat(&right.scheme()?);
            Operator::Join {
                condition: condition.bind(&scheme)?,
                left,
                right,
            }
        }
        Operator::GroupBy {
            grouping,
            aggregates,
            input,
        } => {
            let scheme = input.scheme()?;
            let grouping = grouping
                .into_iter()
                .map(|g| g.bind(&scheme))
                .collect::<CompileResult<_>>()?;
            let aggregates = aggregates
                .into_iter()
                .map(|a| a.map_inputs(&mut |e| e.bind(&scheme)))
                .collect::<CompileResult<_>>()?;
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            }
        }
        other => other,
    })
}

/// Every scanned relation must exist in the catalog with a compatible scheme
pub fn check_scans(plan: &Operator, catalog: &dyn RelationCatalog) -> CompileResult<()> {
    let mut result = Ok(());
    plan.visit(&mut |op| {
        if result.is_err() {
            return;
        }
        if let Operator::Scan { relation, scheme } = op {
            match catalog.scheme(relation) {
                None => result = Err(CompileError::UnknownRelation(relation.clone())),
                Some(expected) if !expected.compatible(scheme) => {
                    result = Err(CompileError::SchemeMismatch {
                        relation: relation.clone(),
                        expected: expected.to_string(),
                        found: scheme.to_string(),
                    })
                }
                Some(_) => {}
            }
        }
    });
    result
}
