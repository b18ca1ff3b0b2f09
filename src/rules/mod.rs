//! # Rule Engine
//!
//! A [`Rule`] maps one operator node to a (possibly identical) replacement.
//! [`apply`] runs one rule over a whole tree in a single pass;
//! [`apply_to_fixpoint`] runs a [`RuleGroup`] until the tree stops changing,
//! bounded by the group's iteration cap. Groups run in sequence via
//! [`run_groups`].
//!
//! Every firing that changes a node is checked for scheme preservation
//! unless the rule declares itself scheme-changing.

use std::fmt;
use tracing::debug;

use crate::algebra::Operator;
use crate::error::{CompileError, CompileResult};

/// Default safety cap on fixpoint passes
pub const DEFAULT_MAX_ITERATIONS: usize = 64;

/// One rewrite rule
pub trait Rule: Send + Sync {
    /// Stable rule name used in logs and errors
    fn name(&self) -> &str;

    /// Rewrite a single node; return it unchanged when the rule does not match
    fn fire(&self, op: Operator) -> CompileResult<Operator>;

    /// Rules that may legitimately change a node's scheme opt out of the check
    fn changes_scheme(&self) -> bool {
        false
    }
}

/// Traversal order for one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fire on a node, then descend into the result's children
    TopDown,
    /// Rewrite children first, then fire on the rebuilt node
    BottomUp,
}

/// Whether a group runs until nothing changes or exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fixpoint,
    OnePass,
}

/// Ordered rules run together
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<Box<dyn Rule>>,
    pub strategy: Strategy,
    pub mode: Mode,
    pub max_iterations: usize,
}

impl RuleGroup {
    pub fn new(name: &str, rules: Vec<Box<dyn Rule>>) -> Self {
        RuleGroup {
            name: name.to_string(),
            rules,
            strategy: Strategy::TopDown,
            mode: Mode::Fixpoint,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

impl fmt::Debug for RuleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleGroup")
            .field("name", &self.name)
            .field("rules", &self.rule_names())
            .field("strategy", &self.strategy)
            .field("mode", &self.mode)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

fn fire_checked(rule: &dyn Rule, op: Operator) -> CompileResult<Operator> {
    let before = op.clone();
    let after = rule.fire(op)?;
    if after != before {
        debug!(rule = rule.name(), from = %before, to = %after, "rule fired");
        if !rule.changes_scheme() {
            let old = before.scheme()?;
            let new = after.scheme()?;
            if !old.compatible(&new) {
                return Err(CompileError::SchemeChanged {
                    rule: rule.name().to_string(),
                    before: old.to_string(),
                    after: new.to_string(),
                });
            }
        }
    }
    Ok(after)
}

/// Apply `rule` once to every node of `tree`
pub fn apply(rule: &dyn Rule, tree: Operator, strategy: Strategy) -> CompileResult<Operator> {
    match strategy {
        Strategy::TopDown => {
            let fired = fire_checked(rule, tree)?;
            fired.map_children(|c| apply(rule, c, strategy))
        }
        Strategy::BottomUp => {
            let rebuilt = tree.map_children(|c| apply(rule, c, strategy))?;
            fire_checked(rule, rebuilt)
        }
    }
}

/// Run every rule of `group` in order, repeating until the tree is stable
pub fn apply_to_fixpoint(group: &RuleGroup, tree: Operator) -> CompileResult<Operator> {
    let mut current = tree;
    if group.mode == Mode::OnePass {
        for rule in &group.rules {
            current = apply(rule.as_ref(), current, group.strategy)?;
        }
        return Ok(current);
    }

    for iteration in 0..group.max_iterations {
        let before = current.clone();
        for rule in &group.rules {
            current = apply(rule.as_ref(), current, group.strategy)?;
        }
        if current == before {
            debug!(group = %group.name, iteration, "rule group reached fixpoint");
            return Ok(current);
        }
    }

    Err(CompileError::FixpointNotReached {
        group: group.name.clone(),
        iterations: group.max_iterations,
    })
}

/// Run groups in sequence, each to its own fixpoint
pub fn run_groups(groups: &[RuleGroup], tree: Operator) -> CompileResult<Operator> {
    groups
        .iter()
        .try_fold(tree, |plan, group| apply_to_fixpoint(group, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::OperatorKind;
    use crate::expression::Expression;
    use crate::scheme::{DataType, Scheme};

    fn scan() -> Operator {
        Operator::scan("r", Scheme::from_pairs(&[("a", DataType::Int64)]))
    }

    /// Strips one Distinct per firing
    struct DropDistinct;

    impl Rule for DropDistinct {
        fn name(&self) -> &str {
            "DropDistinct"
        }
        fn fire(&self, op: Operator) -> CompileResult<Operator> {
            match op {
                Operator::Distinct { input } => Ok(*input),
                other => Ok(other),
            }
        }
    }

    /// Never converges: wraps every scan in another select
    struct Grow;

    impl Rule for Grow {
        fn name(&self) -> &str {
            "Grow"
        }
        fn fire(&self, op: Operator) -> CompileResult<Operator> {
            match op {
                scan @ Operator::Scan { .. } => Ok(Operator::select(Expression::literal(true), scan)),
                other => Ok(other),
            }
        }
    }

    /// Changes the scheme without declaring it
    struct Narrow;

    impl Rule for Narrow {
        fn name(&self) -> &str {
            "Narrow"
        }
        fn fire(&self, op: Operator) -> CompileResult<Operator> {
            match op {
                scan @ Operator::Scan { .. } => Ok(Operator::project(vec![], scan)),
                other => Ok(other),
            }
        }
    }

    #[test]
    fn test_single_pass_top_down_reaches_nested_nodes() {
        let tree = Operator::distinct(Operator::distinct(scan()));
        let out = apply(&DropDistinct, tree, Strategy::TopDown).unwrap();
        assert_eq!(out, scan());
    }

    #[test]
    fn test_fixpoint_group() {
        let group = RuleGroup::new("drop", vec![Box::new(DropDistinct)]);
        let tree = Operator::union_all(
            Operator::distinct(Operator::distinct(scan())),
            Operator::distinct(scan()),
        );
        let out = apply_to_fixpoint(&group, tree).unwrap();
        assert_eq!(out.count(OperatorKind::Distinct), 0);
    }

    #[test]
    fn test_fixpoint_cap_is_fatal() {
        let group = RuleGroup::new("grow", vec![Box::new(Grow)])
            .with_strategy(Strategy::BottomUp)
            .with_max_iterations(5);
        let err = apply_to_fixpoint(&group, scan()).unwrap_err();
        assert_eq!(
            err,
            CompileError::FixpointNotReached {
                group: "grow".to_string(),
                iterations: 5
            }
        );
    }

    #[test]
    fn test_one_pass_runs_once() {
        let group = RuleGroup::new("grow", vec![Box::new(Grow)])
            .with_strategy(Strategy::BottomUp)
            .with_mode(Mode::OnePass);
        let out = apply_to_fixpoint(&group, scan()).unwrap();
        assert_eq!(out.count(OperatorKind::Select), 1);
    }

    #[test]
    fn test_scheme_change_detected() {
        let err = apply(&Narrow, scan(), Strategy::BottomUp).unwrap_err();
        assert!(matches!(err, CompileError::SchemeChanged { rule, .. } if rule == "Narrow"));
    }

    #[test]
    fn test_run_groups_in_sequence() {
        let groups = vec![
            RuleGroup::new("grow", vec![Box::new(Grow)])
                .with_strategy(Strategy::BottomUp)
                .with_mode(Mode::OnePass),
            RuleGroup::new("drop", vec![Box::new(DropDistinct)]),
        ];
        let out = run_groups(&groups, Operator::distinct(scan())).unwrap();
        assert_eq!(out, Operator::select(Expression::literal(true), scan()));
    }
}
