//! Scalar and aggregate expressions over an operator's input tuple.
//!
//! Attribute references start out either positional (`$2`) or named
//! (`c`). The optimizer binds every named reference to a position before
//! any rewrite runs, so all rules and the code generator only ever see
//! positional references.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{CompileError, CompileResult};
use crate::scheme::{DataType, Scheme};
use crate::value::Value;

/// Reference to one input attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeRef {
    Position(usize),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Scalar expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    Attribute(AttributeRef),
    Literal(Value),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Accumulator column of a user-defined aggregate
    State(String),
}

impl Expression {
    pub fn attr(position: usize) -> Self {
        Expression::Attribute(AttributeRef::Position(position))
    }

    pub fn named(name: &str) -> Self {
        Expression::Attribute(AttributeRef::Named(name.to_string()))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn state(name: &str) -> Self {
        Expression::State(name.to_string())
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    /// Position of a bound attribute reference
    pub fn position(&self) -> Option<usize> {
        match self {
            Expression::Attribute(AttributeRef::Position(p)) => Some(*p),
            _ => None,
        }
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, Expression::Attribute(_))
    }

    /// Top-level AND conjuncts, left to right
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self {
            Expression::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    pub fn into_conjuncts(self) -> Vec<Expression> {
        match self {
            Expression::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut out = left.into_conjuncts();
                out.extend(right.into_conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// AND of all parts in order, `None` when empty
    pub fn conjunction(parts: Vec<Expression>) -> Option<Expression> {
        parts.into_iter().reduce(Expression::and)
    }

    /// `$a = $b` between two bound attributes
    pub fn equality_positions(&self) -> Option<(usize, usize)> {
        match self {
            Expression::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => Some((left.position()?, right.position()?)),
            _ => None,
        }
    }

    /// Positions of every bound attribute referenced
    pub fn attribute_positions(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.collect_positions(&mut out);
        out
    }

    fn collect_positions(&self, out: &mut BTreeSet<usize>) {
        match self {
            Expression::Attribute(AttributeRef::Position(p)) => {
                out.insert(*p);
            }
            Expression::Unary { operand, .. } => operand.collect_positions(out),
            Expression::Binary { left, right, .. } => {
                left.collect_positions(out);
                right.collect_positions(out);
            }
            Expression::Attribute(AttributeRef::Named(_))
            | Expression::Literal(_)
            | Expression::State(_) => {}
        }
    }

    /// Replace every positional reference by `f(position)`
    pub fn map_attributes<F>(self, f: &mut F) -> CompileResult<Expression>
    where
        F: FnMut(usize) -> CompileResult<Expression>,
    {
        Ok(match self {
            Expression::Attribute(AttributeRef::Position(p)) => f(p)?,
            Expression::Unary { op, operand } => Expression::Unary {
                op,
                operand: Box::new(operand.map_attributes(f)?),
            },
            Expression::Binary { op, left, right } => Expression::Binary {
                op,
                left: Box::new(left.map_attributes(f)?),
                right: Box::new(right.map_attributes(f)?),
            },
            other => other,
        })
    }

    /// Shift every position by `delta`
    pub fn shifted(self, delta: isize) -> CompileResult<Expression> {
        self.map_attributes(&mut |p| {
            let moved = p as isize + delta;
            if moved < 0 {
                return Err(CompileError::AttributeOutOfRange {
                    position: p,
                    arity: 0,
                });
            }
            Ok(Expression::attr(moved as usize))
        })
    }

    /// Substitute attribute `i` by `replacements[i]`
    pub fn substitute(self, replacements: &[Expression]) -> CompileResult<Expression> {
        self.map_attributes(&mut |p| {
            replacements
                .get(p)
                .cloned()
                .ok_or(CompileError::AttributeOutOfRange {
                    position: p,
                    arity: replacements.len(),
                })
        })
    }

    /// Resolve named references against `scheme` and range-check positions
    pub fn bind(self, scheme: &Scheme) -> CompileResult<Expression> {
        Ok(match self {
            Expression::Attribute(AttributeRef::Named(name)) => match scheme.position(&name) {
                Some(p) => Expression::attr(p),
                None => {
                    return Err(CompileError::UnknownAttribute {
                        name,
                        scheme: scheme.to_string(),
                    })
                }
            },
            Expression::Attribute(AttributeRef::Position(p)) => {
                if p >= scheme.len() {
                    return Err(CompileError::AttributeOutOfRange {
                        position: p,
                        arity: scheme.len(),
                    });
                }
                Expression::attr(p)
            }
            Expression::Unary { op, operand } => Expression::Unary {
                op,
                operand: Box::new(operand.bind(scheme)?),
            },
            Expression::Binary { op, left, right } => Expression::Binary {
                op,
                left: Box::new(left.bind(scheme)?),
                right: Box::new(right.bind(scheme)?),
            },
            other => other,
        })
    }

    /// Result type given the input scheme and, inside UDA bodies, the state scheme
    pub fn data_type(&self, input: &Scheme, state: Option<&Scheme>) -> CompileResult<DataType> {
        match self {
            Expression::Attribute(AttributeRef::Position(p)) => {
                input
                    .data_type(*p)
                    .ok_or(CompileError::AttributeOutOfRange {
                        position: *p,
                        arity: input.len(),
                    })
            }
            Expression::Attribute(AttributeRef::Named(name)) => input
                .position(name)
                .and_then(|p| input.data_type(p))
                .ok_or_else(|| CompileError::UnknownAttribute {
                    name: name.clone(),
                    scheme: input.to_string(),
                }),
            Expression::Literal(v) => Ok(v.data_type()),
            Expression::State(name) => state
                .and_then(|s| s.position(name).and_then(|p| s.data_type(p)))
                .ok_or_else(|| CompileError::UnknownAttribute {
                    name: name.clone(),
                    scheme: state.map(ToString::to_string).unwrap_or_default(),
                }),
            Expression::Unary { op, operand } => {
                let t = operand.data_type(input, state)?;
                match op {
                    UnaryOp::Not if t == DataType::Bool => Ok(DataType::Bool),
                    UnaryOp::Neg if t.is_numeric() => Ok(t),
                    _ => Err(CompileError::TypeMismatch(format!(
                        "{op:?} applied to {t} in {self}"
                    ))),
                }
            }
            Expression::Binary { op, left, right } => {
                let l = left.data_type(input, state)?;
                let r = right.data_type(input, state)?;
                if op.is_logical() {
                    if l == DataType::Bool && r == DataType::Bool {
                        return Ok(DataType::Bool);
                    }
                } else if op.is_comparison() {
                    if l == r || (l.is_numeric() && r.is_numeric()) {
                        return Ok(DataType::Bool);
                    }
                } else if l.is_numeric() && r.is_numeric() {
                    if l == DataType::Float64 || r == DataType::Float64 {
                        return Ok(DataType::Float64);
                    }
                    return Ok(DataType::Int64);
                }
                Err(CompileError::TypeMismatch(format!(
                    "{l} {} {r} in {self}",
                    op.symbol()
                )))
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Attribute(AttributeRef::Position(p)) => write!(f, "${p}"),
            Expression::Attribute(AttributeRef::Named(n)) => write!(f, "{n}"),
            Expression::Literal(v) => write!(f, "{v}"),
            Expression::State(n) => write!(f, "@{n}"),
            Expression::Unary {
                op: UnaryOp::Not,
                operand,
            } => write!(f, "NOT {operand}"),
            Expression::Unary {
                op: UnaryOp::Neg,
                operand,
            } => write!(f, "-{operand}"),
            Expression::Binary { op, left, right } => {
                write!(f, "({left} {} {right})", op.symbol())
            }
        }
    }
}

/// Built-in aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinAggregate {
    CountAll,
    Count,
    Sum,
    Min,
    Max,
}

impl BuiltinAggregate {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinAggregate::CountAll => "COUNTALL",
            BuiltinAggregate::Count => "COUNT",
            BuiltinAggregate::Sum => "SUM",
            BuiltinAggregate::Min => "MIN",
            BuiltinAggregate::Max => "MAX",
        }
    }
}

/// User-defined aggregate: typed accumulator columns, one init and one
/// update expression per column, and an emit expression over the state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UdaDefinition {
    pub name: String,
    pub state: Scheme,
    pub inits: Vec<Expression>,
    pub updates: Vec<Expression>,
    pub emit: Expression,
}

impl UdaDefinition {
    /// Init and update lists must each cover every state column
    pub fn check_arity(&self) -> CompileResult<()> {
        if self.inits.len() != self.state.len() || self.updates.len() != self.state.len() {
            return Err(CompileError::UnsupportedAggregates {
                aggregates: vec![format!(
                    "{}: {} state columns, {} inits, {} updates",
                    self.name,
                    self.state.len(),
                    self.inits.len(),
                    self.updates.len()
                )],
            });
        }
        Ok(())
    }
}

/// Aggregate computed by a group-by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    Builtin {
        function: BuiltinAggregate,
        input: Option<Expression>,
    },
    Uda(UdaDefinition),
}

impl Aggregate {
    pub fn count_all() -> Self {
        Aggregate::Builtin {
            function: BuiltinAggregate::CountAll,
            input: None,
        }
    }

    pub fn builtin(function: BuiltinAggregate, input: Expression) -> Self {
        Aggregate::Builtin {
            function,
            input: Some(input),
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Aggregate::Builtin { .. })
    }

    pub fn output_type(&self, input_scheme: &Scheme) -> CompileResult<DataType> {
        match self {
            Aggregate::Builtin {
                function: BuiltinAggregate::CountAll | BuiltinAggregate::Count,
                ..
            } => Ok(DataType::Int64),
            Aggregate::Builtin {
                function,
                input: Some(input),
            } => {
                let t = input.data_type(input_scheme, None)?;
                if *function == BuiltinAggregate::Sum && !t.is_numeric() {
                    return Err(CompileError::TypeMismatch(format!("SUM over {t}")));
                }
                Ok(t)
            }
            Aggregate::Builtin {
                function,
                input: None,
            } => Err(CompileError::TypeMismatch(format!(
                "{} requires an input expression",
                function.name()
            ))),
            Aggregate::Uda(uda) => uda.emit.data_type(input_scheme, Some(&uda.state)),
        }
    }

    /// Apply `f` to every input-side expression, leaving state references alone
    pub fn map_inputs<F>(self, f: &mut F) -> CompileResult<Aggregate>
    where
        F: FnMut(Expression) -> CompileResult<Expression>,
    {
        Ok(match self {
            Aggregate::Builtin { function, input } => Aggregate::Builtin {
                function,
                input: input.map(&mut *f).transpose()?,
            },
            Aggregate::Uda(uda) => Aggregate::Uda(UdaDefinition {
                inits: uda.inits.into_iter().map(&mut *f).collect::<CompileResult<_>>()?,
                updates: uda
                    .updates
                    .into_iter()
                    .map(&mut *f)
                    .collect::<CompileResult<_>>()?,
                ..uda
            }),
        })
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Builtin {
                function,
                input: None,
            } => write!(f, "{}(*)", function.name()),
            Aggregate::Builtin {
                function,
                input: Some(input),
            } => write!(f, "{}({input})", function.name()),
            Aggregate::Uda(uda) => write!(f, "{}{}", uda.name, uda.state),
        }
    }
}
