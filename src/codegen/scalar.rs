//! Scalar expressions as generated code

use super::state::{CompileState, TupleRef};
use crate::error::{CompileError, CompileResult};
use crate::expression::{AttributeRef, BinaryOp, Expression, UnaryOp};
use crate::scheme::Scheme;
use crate::value::Value;

/// How `State(name)` references are rendered
#[derive(Debug, Clone, Copy)]
pub(crate) enum StateScope<'a> {
    /// Not inside an aggregate; state references are an error
    None,
    /// Inside a UDA update function where each state column is a local
    Locals,
    /// Read from a state tuple variable
    Tuple { var: &'a str, scheme: &'a Scheme },
}

fn operator_code(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Eq => "==",
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

pub(crate) fn compile_expression(
    expr: &Expression,
    tuple: &TupleRef,
    scope: StateScope<'_>,
    state: &mut CompileState,
) -> CompileResult<String> {
    Ok(match expr {
        Expression::Attribute(AttributeRef::Position(p)) => {
            if *p >= tuple.scheme.len() {
                return Err(CompileError::AttributeOutOfRange {
                    position: *p,
                    arity: tuple.scheme.len(),
                });
            }
            tuple.field(*p)
        }
        Expression::Attribute(AttributeRef::Named(name)) => {
            return Err(CompileError::UnknownAttribute {
                name: name.clone(),
                scheme: tuple.scheme.to_string(),
            })
        }
        Expression::Literal(Value::Str(s)) => state.string_constant(s),
        Expression::Literal(Value::Float(f)) => format!("{f:?}"),
        Expression::Literal(v) => v.to_string(),
        Expression::State(name) => match scope {
            StateScope::Locals => name.clone(),
            StateScope::Tuple { var, scheme } => match scheme.position(name) {
                Some(i) => format!("{var}.f{i}"),
                None => {
                    return Err(CompileError::UnknownAttribute {
                        name: name.clone(),
                        scheme: scheme.to_string(),
                    })
                }
            },
            StateScope::None => {
                return Err(CompileError::UnknownAttribute {
                    name: name.clone(),
                    scheme: String::new(),
                })
            }
        },
        Expression::Unary { op, operand } => {
            let inner = compile_expression(operand, tuple, scope, state)?;
            match op {
                UnaryOp::Not => format!("(!{inner})"),
                UnaryOp::Neg => format!("(-{inner})"),
            }
        }
        Expression::Binary { op, left, right } => {
            let l = compile_expression(left, tuple, scope, state)?;
            let r = compile_expression(right, tuple, scope, state)?;
            format!("({l} {} {r})", operator_code(*op))
        }
    })
}
