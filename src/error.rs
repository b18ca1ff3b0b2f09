//! Compiler Error Types
//!
//! Every error aborts compilation of the current statement or program.
//! Nothing here is retried.

use thiserror::Error;

/// Errors raised while optimizing, analysing or generating code
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A join or select condition a physical operator cannot express
    #[error("{operator} cannot handle condition: {condition}")]
    UnsupportedCondition { operator: String, condition: String },

    /// A placeholder was still unbound at emission time
    #[error("unresolved symbol at emission: {symbol}")]
    UnresolvedSymbol { symbol: String },

    /// A group-by mixes built-in and user-defined aggregates
    #[error("unsupported aggregates: [{}]", aggregates.join(", "))]
    UnsupportedAggregates { aggregates: Vec<String> },

    /// A rule group kept changing the plan past its iteration cap
    #[error("rule group '{group}' did not reach a fixpoint after {iterations} iterations")]
    FixpointNotReached { group: String, iterations: usize },

    /// A rule rewrote a node into one with a different output scheme
    #[error("rule '{rule}' changed scheme from {before} to {after}")]
    SchemeChanged {
        rule: String,
        before: String,
        after: String,
    },

    /// Named attribute reference not present in the input scheme
    #[error("unknown attribute '{name}' in scheme {scheme}")]
    UnknownAttribute { name: String, scheme: String },

    /// Positional attribute reference past the end of the input scheme
    #[error("attribute position {position} out of range for arity {arity}")]
    AttributeOutOfRange { position: usize, arity: usize },

    /// Expression operand types do not fit the operator
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Relation not present in the catalog
    #[error("relation '{0}' not found in catalog")]
    UnknownRelation(String),

    /// Relation scheme disagrees with the catalog
    #[error("relation '{relation}' scanned as {found} but catalog has {expected}")]
    SchemeMismatch {
        relation: String,
        expected: String,
        found: String,
    },

    /// A variable read before it is assigned on some path
    #[error("variable '{variable}' may be used before definition ({context})")]
    UndefinedVariable { variable: String, context: String },

    /// An operator with no pipelined implementation reached code generation
    #[error("operator {operator} has no pipelined implementation")]
    NotPhysical { operator: String },

    /// A pipeline waits on a synchronization name nobody declares
    #[error("pipeline {pipeline} depends on undeclared sync '{sync}'")]
    DanglingDependence { pipeline: String, sync: String },

    /// Pipeline bookkeeping violated during produce/consume
    #[error("invalid pipeline state: {0}")]
    InvalidPipeline(String),
}

/// Result type for compiler operations
pub type CompileResult<T> = Result<T, CompileError>;
