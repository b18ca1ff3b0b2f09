//! # FakeDb
//!
//! In-memory reference evaluator with bag semantics. It runs logical and
//! physical plans alike, so a plan can be evaluated before and after
//! optimization and the two results compared as multisets. It also runs
//! whole programs, either from their items or from an analysed [`Cfg`].
//!
//! Empty-input note: an aggregate over an empty input produces no rows,
//! grouped or not.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::algebra::{Operator, ScanSource, StoreTarget};
use crate::catalog::RelationCatalog;
use crate::cfg::{Cfg, ProgramItem};
use crate::error::{CompileError, CompileResult};
use crate::expression::{Aggregate, AttributeRef, BinaryOp, BuiltinAggregate, Expression, UnaryOp};
use crate::scheme::Scheme;
use crate::value::{Tuple, Value};

/// Iteration cap for `DO ... WHILE` loops
pub const MAX_LOOP_ITERATIONS: usize = 10_000;

/// True when `a` and `b` hold the same tuples with the same multiplicities
pub fn same_bag(a: &[Tuple], b: &[Tuple]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Loop test: the first value of the first tuple decides
pub fn condition_holds(result: &[Tuple]) -> bool {
    result
        .first()
        .and_then(|t| t.first())
        .is_some_and(Value::is_truthy)
}

fn distinct(tuples: Vec<Tuple>) -> Vec<Tuple> {
    let mut seen = HashSet::new();
    tuples.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

/// State columns visible to a UDA expression
struct StateValues<'a> {
    scheme: &'a Scheme,
    values: &'a [Value],
}

fn eval_expr(expr: &Expression, tuple: &[Value], state: Option<&StateValues<'_>>) -> CompileResult<Value> {
    match expr {
        Expression::Attribute(AttributeRef::Position(p)) => {
            tuple
                .get(*p)
                .cloned()
                .ok_or(CompileError::AttributeOutOfRange {
                    position: *p,
                    arity: tuple.len(),
                })
        }
        Expression::Attribute(AttributeRef::Named(name)) => Err(CompileError::UnknownAttribute {
            name: name.clone(),
            scheme: "unbound expression".to_string(),
        }),
        Expression::Literal(v) => Ok(v.clone()),
        Expression::State(name) => state
            .and_then(|s| s.scheme.position(name).and_then(|p| s.values.get(p)))
            .cloned()
            .ok_or_else(|| CompileError::UnknownAttribute {
                name: name.clone(),
                scheme: state.map(|s| s.scheme.to_string()).unwrap_or_default(),
            }),
        Expression::Unary { op, operand } => {
            let v = eval_expr(operand, tuple, state)?;
            match (op, v) {
                (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
                (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
                (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (UnaryOp::Neg, v) => Err(CompileError::TypeMismatch(format!("negation of {v}"))),
            }
        }
        Expression::Binary { op, left, right } => {
            let l = eval_expr(left, tuple, state)?;
            match op {
                BinaryOp::And if !l.is_truthy() => return Ok(Value::Bool(false)),
                BinaryOp::Or if l.is_truthy() => return Ok(Value::Bool(true)),
                _ => {}
            }
            let r = eval_expr(right, tuple, state)?;
            eval_binary(*op, l, r)
        }
    }
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> CompileResult<Value> {
    if op.is_logical() {
        return Ok(Value::Bool(r.is_truthy()));
    }
    if op.is_comparison() {
        let ordering = match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => l.cmp(&r),
        };
        let holds = match op {
            BinaryOp::Eq => ordering.is_eq(),
            BinaryOp::Ne => ordering.is_ne(),
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::Le => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            _ => ordering.is_ge(),
        };
        return Ok(Value::Bool(holds));
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            _ => {
                if b == 0 {
                    return Err(CompileError::TypeMismatch("integer division by zero".to_string()));
                }
                a.wrapping_div(b)
            }
        })),
        (l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                _ => a / b,
            })),
            _ => Err(CompileError::TypeMismatch(format!(
                "{l} {} {r}",
                op.symbol()
            ))),
        },
    }
}

fn aggregate(agg: &Aggregate, group: &[Tuple]) -> CompileResult<Value> {
    match agg {
        Aggregate::Builtin {
            function: BuiltinAggregate::CountAll | BuiltinAggregate::Count,
            ..
        } => Ok(Value::Int(group.len() as i64)),
        Aggregate::Builtin {
            function,
            input: Some(input),
        } => {
            let values = group
                .iter()
                .map(|t| eval_expr(input, t, None))
                .collect::<CompileResult<Vec<_>>>()?;
            let empty = || CompileError::TypeMismatch(format!("{} over no values", function.name()));
            match function {
                BuiltinAggregate::Min => values.into_iter().min().ok_or_else(empty),
                BuiltinAggregate::Max => values.into_iter().max().ok_or_else(empty),
                _ => {
                    let mut values = values.into_iter();
                    let first = values.next().ok_or_else(empty)?;
                    values.try_fold(first, |acc, v| eval_binary(BinaryOp::Add, acc, v))
                }
            }
        }
        Aggregate::Builtin {
            function,
            input: None,
        } => Err(CompileError::TypeMismatch(format!(
            "{} requires an input expression",
            function.name()
        ))),
        Aggregate::Uda(uda) => {
            uda.check_arity()?;
            let mut values = uda
                .inits
                .iter()
                .map(|e| eval_expr(e, &[], None))
                .collect::<CompileResult<Vec<_>>>()?;
            for tuple in group {
                let current = StateValues {
                    scheme: &uda.state,
                    values: &values,
                };
                values = uda
                    .updates
                    .iter()
                    .map(|e| eval_expr(e, tuple, Some(&current)))
                    .collect::<CompileResult<Vec<_>>>()?;
            }
            let finished = StateValues {
                scheme: &uda.state,
                values: &values,
            };
            eval_expr(&uda.emit, &[], Some(&finished))
        }
    }
}

/// Relations and program variables held in memory
#[derive(Debug, Clone, Default)]
pub struct FakeDb {
    relations: HashMap<String, (Scheme, Vec<Tuple>)>,
    temps: HashMap<String, Vec<Tuple>>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, relation: impl Into<String>, scheme: Scheme, tuples: Vec<Tuple>) {
        self.relations.insert(relation.into(), (scheme, tuples));
    }

    pub fn relation(&self, relation: &str) -> Option<&[Tuple]> {
        self.relations.get(relation).map(|(_, t)| t.as_slice())
    }

    pub fn temp(&self, name: &str) -> Option<&[Tuple]> {
        self.temps.get(name).map(Vec::as_slice)
    }

    fn read_relation(&self, relation: &str) -> CompileResult<Vec<Tuple>> {
        self.relation(relation)
            .map(<[Tuple]>::to_vec)
            .ok_or_else(|| CompileError::UnknownRelation(relation.to_string()))
    }

    fn read_temp(&self, name: &str) -> CompileResult<Vec<Tuple>> {
        self.temp(name)
            .map(<[Tuple]>::to_vec)
            .ok_or_else(|| CompileError::UndefinedVariable {
                variable: name.to_string(),
                context: "evaluation".to_string(),
            })
    }

    fn write_relation(&mut self, relation: &str, scheme: Scheme, tuples: Vec<Tuple>) {
        self.relations.insert(relation.to_string(), (scheme, tuples));
    }

    /// Evaluate `plan`; stores update the database as a side effect
    pub fn evaluate(&mut self, plan: &Operator) -> CompileResult<Vec<Tuple>> {
        Ok(match plan {
            Operator::Scan { relation, .. }
            | Operator::FileScan {
                source: ScanSource::Relation(relation),
                ..
            } => self.read_relation(relation)?,
            Operator::ScanTemp { name, .. }
            | Operator::FileScan {
                source: ScanSource::Temp(name),
                ..
            } => self.read_temp(name)?,
            Operator::MemoryScan { input } => self.evaluate(input)?,
            Operator::Select { condition, input } | Operator::PhysicalSelect { condition, input } => {
                let mut out = Vec::new();
                for t in self.evaluate(input)? {
                    if eval_expr(condition, &t, None)?.is_truthy() {
                        out.push(t);
                    }
                }
                out
            }
            Operator::Apply { emitters, input } | Operator::PhysicalApply { emitters, input } => self
                .evaluate(input)?
                .iter()
                .map(|t| {
                    emitters
                        .iter()
                        .map(|(_, e)| eval_expr(e, t, None))
                        .collect::<CompileResult<Tuple>>()
                })
                .collect::<CompileResult<_>>()?,
            Operator::Project { columns, input } | Operator::PhysicalProject { columns, input } => self
                .evaluate(input)?
                .iter()
                .map(|t| {
                    columns
                        .iter()
                        .map(|c| {
                            t.get(*c).cloned().ok_or(CompileError::AttributeOutOfRange {
                                position: *c,
                                arity: t.len(),
                            })
                        })
                        .collect::<CompileResult<Tuple>>()
                })
                .collect::<CompileResult<_>>()?,
            Operator::Join {
                condition,
                left,
                right,
            }
            | Operator::HashJoin {
                condition,
                left,
                right,
            }
            | Operator::SymmetricHashJoin {
                condition,
                left,
                right,
            }
            | Operator::ShuffleHashJoin {
                condition,
                left,
                right,
            } => {
                let mut out = Vec::new();
                for t in self.product(left, right)? {
                    if eval_expr(condition, &t, None)?.is_truthy() {
                        out.push(t);
                    }
                }
                out
            }
            Operator::CrossProduct { left, right } => self.product(left, right)?,
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            }
            | Operator::HashGroupBy {
                grouping,
                aggregates,
                input,
            } => {
                let mut groups: BTreeMap<Tuple, Vec<Tuple>> = BTreeMap::new();
                for t in self.evaluate(input)? {
                    let key = grouping
                        .iter()
                        .map(|g| eval_expr(g, &t, None))
                        .collect::<CompileResult<Tuple>>()?;
                    groups.entry(key).or_default().push(t);
                }
                let mut out = Vec::new();
                for (mut key, group) in groups {
                    for agg in aggregates {
                        key.push(aggregate(agg, &group)?);
                    }
                    out.push(key);
                }
                out
            }
            Operator::Distinct { input } => distinct(self.evaluate(input)?),
            Operator::UnionAll { left, right } | Operator::PhysicalUnionAll { left, right } => {
                let mut out = self.evaluate(left)?;
                out.extend(self.evaluate(right)?);
                out
            }
            Operator::Union { left, right } => {
                let mut out = self.evaluate(left)?;
                out.extend(self.evaluate(right)?);
                distinct(out)
            }
            Operator::Difference { left, right } => {
                let right: HashSet<Tuple> = self.evaluate(right)?.into_iter().collect();
                distinct(self.evaluate(left)?)
                    .into_iter()
                    .filter(|t| !right.contains(t))
                    .collect()
            }
            Operator::Store { relation, input }
            | Operator::PhysicalStore {
                target: StoreTarget::Relation(relation),
                input,
            } => {
                let out = self.evaluate(input)?;
                self.write_relation(relation, input.scheme()?, out.clone());
                out
            }
            Operator::StoreTemp { name, input }
            | Operator::PhysicalStore {
                target: StoreTarget::Temp(name),
                input,
            } => {
                let out = self.evaluate(input)?;
                self.temps.insert(name.clone(), out.clone());
                out
            }
            Operator::Sequence { children } => {
                let mut last = Vec::new();
                for child in children {
                    last = self.evaluate(child)?;
                }
                last
            }
        })
    }

    fn product(&mut self, left: &Operator, right: &Operator) -> CompileResult<Vec<Tuple>> {
        let left = self.evaluate(left)?;
        let right = self.evaluate(right)?;
        let mut out = Vec::with_capacity(left.len() * right.len());
        for l in &left {
            for r in &right {
                let mut t = l.clone();
                t.extend(r.iter().cloned());
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Run program items in order
    pub fn run_program(&mut self, items: &[ProgramItem]) -> CompileResult<()> {
        for item in items {
            match item {
                ProgramItem::Assign { variable, plan } => {
                    let out = self.evaluate(plan)?;
                    self.temps.insert(variable.clone(), out);
                }
                ProgramItem::Sink { plan } => {
                    self.evaluate(plan)?;
                }
                ProgramItem::DoWhile { body, condition } => {
                    let mut iterations = 0;
                    loop {
                        self.run_program(body)?;
                        iterations += 1;
                        if !condition_holds(&self.evaluate(condition)?) {
                            break;
                        }
                        if iterations >= MAX_LOOP_ITERATIONS {
                            return Err(CompileError::FixpointNotReached {
                                group: "do-while".to_string(),
                                iterations,
                            });
                        }
                    }
                    debug!(iterations, "loop finished");
                }
            }
        }
        Ok(())
    }

    /// Run an analysed program graph by following its edges
    pub fn run_cfg(&mut self, cfg: &Cfg) -> CompileResult<()> {
        let mut current = cfg.node_ids().first().copied();
        let mut steps = 0usize;
        let limit = MAX_LOOP_ITERATIONS.saturating_mul(cfg.len().max(1));
        while let Some(id) = current {
            let node = cfg.node(id).ok_or_else(|| {
                CompileError::InvalidPipeline(format!("program graph has no node {id}"))
            })?;
            let out = self.evaluate(&node.plan)?;
            let successors = cfg.successors(id);
            current = if node.closes_loop.is_some() {
                // back-edges point at earlier nodes
                if condition_holds(&out) {
                    successors.iter().copied().find(|s| *s <= id)
                } else {
                    successors.iter().copied().find(|s| *s > id)
                }
            } else {
                successors.iter().copied().next()
            };
            if let Some(var) = &node.def_var {
                self.temps.insert(var.clone(), out);
            }
            steps += 1;
            if steps > limit {
                return Err(CompileError::FixpointNotReached {
                    group: "do-while".to_string(),
                    iterations: steps,
                });
            }
        }
        Ok(())
    }
}

impl RelationCatalog for FakeDb {
    fn scheme(&self, relation: &str) -> Option<Scheme> {
        self.relations.get(relation).map(|(s, _)| s.clone())
    }
}
