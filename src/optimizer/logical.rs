//! Logical rewrite rules shared by every target.
//!
//! Each rule matches one node shape and returns anything else unchanged.

use crate::algebra::Operator;
use crate::error::{CompileError, CompileResult};
use crate::expression::{Aggregate, Expression};
use crate::rules::Rule;

/// `Sequence[x]` -> `x`
pub struct RemoveTrivialSequences;

impl Rule for RemoveTrivialSequences {
    fn name(&self) -> &str {
        "RemoveTrivialSequences"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            Operator::Sequence { mut children } if children.len() == 1 => {
                Ok(children.remove(0))
            }
            other => Ok(other),
        }
    }
}

/// Move computed grouping keys and built-in aggregate inputs into an
/// `Apply` below the group-by, so the group-by only references attributes
pub struct SimpleGroupBy;

impl Rule for SimpleGroupBy {
    fn name(&self) -> &str {
        "SimpleGroupBy"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let (grouping, aggregates, input) = match op {
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            } => (grouping, aggregates, input),
            other => return Ok(other),
        };

        let complex_agg = |a: &Aggregate| {
            matches!(a, Aggregate::Builtin { input: Some(e), .. } if !e.is_attribute())
        };
        if grouping.iter().all(Expression::is_attribute) && !aggregates.iter().any(complex_agg) {
            return Ok(Operator::GroupBy {
                grouping,
                aggregates,
                input,
            });
        }

        let scheme = input.scheme()?;
        let mut emitters: Vec<(String, Expression)> = scheme
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), Expression::attr(i)))
            .collect();

        let mut new_grouping = Vec::with_capacity(grouping.len());
        for (i, g) in grouping.into_iter().enumerate() {
            if g.is_attribute() {
                new_grouping.push(g);
            } else {
                new_grouping.push(Expression::attr(emitters.len()));
                emitters.push((format!("_COLUMN{i}_"), g));
            }
        }

        let mut new_aggregates = Vec::with_capacity(aggregates.len());
        for (j, agg) in aggregates.into_iter().enumerate() {
            match agg {
                Aggregate::Builtin {
                    function,
                    input: Some(e),
                } if !e.is_attribute() => {
                    new_aggregates.push(Aggregate::builtin(function, Expression::attr(emitters.len())));
                    emitters.push((format!("_AGG{j}_"), e));
                }
                other => new_aggregates.push(other),
            }
        }

        Ok(Operator::GroupBy {
            grouping: new_grouping,
            aggregates: new_aggregates,
            input: Box::new(Operator::Apply { emitters, input }),
        })
    }
}

/// `Select(c1, Select(c2, x))` -> `Select(c1 AND c2, x)`, outer conjuncts first
pub struct MergeSelects;

impl Rule for MergeSelects {
    fn name(&self) -> &str {
        "MergeSelects"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let (mut condition, mut input) = match op {
            Operator::Select { condition, input } => (condition, input),
            other => return Ok(other),
        };
        loop {
            match *input {
                Operator::Select {
                    condition: inner,
                    input: inner_input,
                } => {
                    condition = Expression::and(condition, inner);
                    input = inner_input;
                }
                other => return Ok(Operator::select(condition, other)),
            }
        }
    }
}

fn strip_selects(op: &Operator) -> &Operator {
    match op {
        Operator::Select { input, .. } => strip_selects(input),
        other => other,
    }
}

fn builds_join(op: &Operator) -> bool {
    matches!(
        strip_selects(op),
        Operator::CrossProduct { .. } | Operator::Join { .. }
    )
}

fn wrap_select(conjuncts: Vec<Expression>, input: Operator) -> Operator {
    match Expression::conjunction(conjuncts) {
        Some(condition) => Operator::select(condition, input),
        None => input,
    }
}

/// Turn `Select(p, CrossProduct(L, R))` (or a select over a join) into a
/// join.
///
/// Equality conjuncts with one attribute on each side become the join
/// condition. Equalities entirely on one side sink into that side when it
/// is itself a product or join, so nested products chain into joins.
/// Everything else stays in one select above the join.
pub struct ExtractJoinConditions;

impl Rule for ExtractJoinConditions {
    fn name(&self) -> &str {
        "ExtractJoinConditions"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let (condition, input) = match op {
            Operator::Select { condition, input } => (condition, input),
            other => return Ok(other),
        };
        let (existing, left, right) = match *input {
            Operator::CrossProduct { left, right } => (None, left, right),
            Operator::Join {
                condition: existing,
                left,
                right,
            } => (Some(existing), left, right),
            other => {
                return Ok(Operator::Select {
                    condition,
                    input: Box::new(other),
                })
            }
        };

        let n_left = left.scheme()?.len();
        let left_builds = builds_join(&left);
        let right_builds = builds_join(&right);

        let original = condition.clone();
        let mut spanning = Vec::new();
        let mut to_left = Vec::new();
        let mut to_right = Vec::new();
        let mut residual = Vec::new();
        for conjunct in condition.into_conjuncts() {
            match conjunct.equality_positions() {
                Some((a, b)) if (a < n_left) != (b < n_left) => spanning.push(conjunct),
                Some((a, b)) if a < n_left && b < n_left && left_builds => to_left.push(conjunct),
                Some((a, b)) if a >= n_left && b >= n_left && right_builds => {
                    to_right.push(conjunct.shifted(-(n_left as isize))?);
                }
                _ => residual.push(conjunct),
            }
        }

        if spanning.is_empty() && to_left.is_empty() && to_right.is_empty() {
            let input = match existing {
                Some(existing) => Operator::Join {
                    condition: existing,
                    left,
                    right,
                },
                None => Operator::CrossProduct { left, right },
            };
            return Ok(Operator::select(original, input));
        }

        let left = wrap_select(to_left, *left);
        let right = wrap_select(to_right, *right);
        let condition = match (existing, Expression::conjunction(spanning)) {
            (Some(existing), Some(extracted)) => Some(Expression::and(existing, extracted)),
            (existing, extracted) => existing.or(extracted),
        };
        let joined = match condition {
            Some(condition) => Operator::join(condition, left, right),
            None => Operator::cross_product(left, right),
        };
        Ok(wrap_select(residual, joined))
    }
}

/// Push a select into both inputs of a union or difference
pub struct PushSelectThroughSetOperations;

impl Rule for PushSelectThroughSetOperations {
    fn name(&self) -> &str {
        "PushSelectThroughSetOperations"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let (condition, input) = match op {
            Operator::Select { condition, input } => (condition, input),
            other => return Ok(other),
        };
        Ok(match *input {
            Operator::UnionAll { left, right } => Operator::union_all(
                Operator::select(condition.clone(), *left),
                Operator::select(condition, *right),
            ),
            Operator::Union { left, right } => Operator::union(
                Operator::select(condition.clone(), *left),
                Operator::select(condition, *right),
            ),
            Operator::Difference { left, right } => Operator::difference(
                Operator::select(condition.clone(), *left),
                Operator::select(condition, *right),
            ),
            other => Operator::select(condition, other),
        })
    }
}

fn compose_columns(outer: &[usize], inner: &[usize]) -> CompileResult<Vec<usize>> {
    outer
        .iter()
        .map(|&i| {
            inner
                .get(i)
                .copied()
                .ok_or(CompileError::AttributeOutOfRange {
                    position: i,
                    arity: inner.len(),
                })
        })
        .collect()
}

/// `Project(p1, Project(p2, x))` -> `Project(p2[p1[i]], x)`
pub struct MergeProjects;

impl Rule for MergeProjects {
    fn name(&self) -> &str {
        "MergeProjects"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            Operator::Project { columns, input } => match *input {
                Operator::Project {
                    columns: inner,
                    input: inner_input,
                } => Ok(Operator::Project {
                    columns: compose_columns(&columns, &inner)?,
                    input: inner_input,
                }),
                other => Ok(Operator::project(columns, other)),
            },
            other => Ok(other),
        }
    }
}

/// `Project(0..n, x)` -> `x` when `x` has arity `n`
pub struct RemoveIdentityProject;

impl Rule for RemoveIdentityProject {
    fn name(&self) -> &str {
        "RemoveIdentityProject"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            Operator::Project { columns, input } => {
                let arity = input.scheme()?.len();
                if columns.len() == arity && columns.iter().enumerate().all(|(i, c)| i == *c) {
                    Ok(*input)
                } else {
                    Ok(Operator::Project { columns, input })
                }
            }
            other => Ok(other),
        }
    }
}

/// `Apply(e1, Apply(e2, x))` -> `Apply(e1[e2], x)`
pub struct MergeApplies;

impl Rule for MergeApplies {
    fn name(&self) -> &str {
        "MergeApplies"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            Operator::Apply { emitters, input } => match *input {
                Operator::Apply {
                    emitters: inner,
                    input: inner_input,
                } => {
                    let replacements: Vec<Expression> =
                        inner.into_iter().map(|(_, e)| e).collect();
                    let emitters = emitters
                        .into_iter()
                        .map(|(name, e)| Ok((name, e.substitute(&replacements)?)))
                        .collect::<CompileResult<_>>()?;
                    Ok(Operator::Apply {
                        emitters,
                        input: inner_input,
                    })
                }
                other => Ok(Operator::Apply {
                    emitters,
                    input: Box::new(other),
                }),
            },
            other => Ok(other),
        }
    }
}

/// Fold a projection into the apply on either side of it
pub struct AbsorbProjectIntoApply;

impl Rule for AbsorbProjectIntoApply {
    fn name(&self) -> &str {
        "AbsorbProjectIntoApply"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            // Apply(e, Project(cols, x)) -> Apply(e[$i := $cols[i]], x)
            Operator::Apply { emitters, input } => match *input {
                Operator::Project {
                    columns,
                    input: inner_input,
                } => {
                    let replacements: Vec<Expression> =
                        columns.iter().map(|&c| Expression::attr(c)).collect();
                    let emitters = emitters
                        .into_iter()
                        .map(|(name, e)| Ok((name, e.substitute(&replacements)?)))
                        .collect::<CompileResult<_>>()?;
                    Ok(Operator::Apply {
                        emitters,
                        input: inner_input,
                    })
                }
                other => Ok(Operator::Apply {
                    emitters,
                    input: Box::new(other),
                }),
            },
            // Project(cols, Apply(e, x)) -> Apply(e[cols], x)
            Operator::Project { columns, input } => match *input {
                Operator::Apply {
                    emitters,
                    input: inner_input,
                } => {
                    let picked = columns
                        .iter()
                        .map(|&c| {
                            emitters
                                .get(c)
                                .cloned()
                                .ok_or(CompileError::AttributeOutOfRange {
                                    position: c,
                                    arity: emitters.len(),
                                })
                        })
                        .collect::<CompileResult<_>>()?;
                    Ok(Operator::Apply {
                        emitters: picked,
                        input: inner_input,
                    })
                }
                other => Ok(Operator::project(columns, other)),
            },
            other => Ok(other),
        }
    }
}

/// `Apply($0 AS a, $1 AS b, x)` -> `x` when `x` is exactly `(a, b)`
pub struct RemoveIdentityApply;

impl Rule for RemoveIdentityApply {
    fn name(&self) -> &str {
        "RemoveIdentityApply"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        match op {
            Operator::Apply { emitters, input } => {
                let scheme = input.scheme()?;
                let identity = emitters.len() == scheme.len()
                    && emitters.iter().enumerate().all(|(i, (name, e))| {
                        e.position() == Some(i) && scheme.name(i) == Some(name.as_str())
                    });
                if identity {
                    Ok(*input)
                } else {
                    Ok(Operator::Apply { emitters, input })
                }
            }
            other => Ok(other),
        }
    }
}

/// `Join(c, L, R)` -> `Project(L ++ R order, Join(c', R, L))`
pub struct SwapJoinSides;

impl Rule for SwapJoinSides {
    fn name(&self) -> &str {
        "SwapJoinSides"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let (condition, left, right) = match op {
            Operator::Join {
                condition,
                left,
                right,
            } => (condition, left, right),
            other => return Ok(other),
        };
        let n_left = left.scheme()?.len();
        let n_right = right.scheme()?.len();
        let condition = condition.map_attributes(&mut |p| {
            Ok(Expression::attr(if p < n_left { p + n_right } else { p - n_left }))
        })?;
        let columns = (n_right..n_right + n_left).chain(0..n_right).collect();
        Ok(Operator::project(
            columns,
            Operator::Join {
                condition,
                left: right,
                right: left,
            },
        ))
    }
}
