//! # ralc: Relational Algebra Compiler
//!
//! Compiles iterative relational-algebra query programs into C++ source
//! for a distributed, pipelined, produce/consume runtime.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Program (Vec<ProgramItem>)
//!     ↓
//! [Cfg]                 → one node per statement, loop back-edges
//!     ↓
//! [Validate]            → no variable read before assignment
//!     ↓
//! [Dead Code Elim.]     → drop assignments nobody reads
//!     ↓
//! [Chaining]            → inline single-use producers into their consumer
//!     ↓  per statement
//! [Optimizer]           → logical rule groups, then physical lowering
//!     ↓
//! [Code Generator]      → produce/consume over one shared CompileState
//!     ↓
//! CodeBundle            → declarations, init(), query(), flush
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ralc::{Compiler, Config, Operator, ProgramItem};
//!
//! let compiler = Compiler::new(&Config::default());
//! let compiled = compiler.compile_program(&program)?;
//! println!("{}", compiled.bundle.render()?);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `algebra` | Operator tree, logical and physical |
//! | `expression` | Scalar expressions and aggregates |
//! | `rules` | Rule trait, traversal strategies, fixpoint groups |
//! | `optimizer` | Rule set and target algebras |
//! | `cfg` | Program graph, liveness, DCE, chaining |
//! | `codegen` | Produce/consume generator and compile state |
//! | `compiler` | Whole-program driver |
//! | `fakedb` | Reference evaluator used by tests |

pub mod algebra;
pub mod catalog;
pub mod cfg;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expression;
pub mod fakedb;
pub mod optimizer;
pub mod rules;
pub mod scheme;
pub mod value;

pub use algebra::{Operator, OperatorKind, ScanSource, StoreTarget, SubexpressionKey};
pub use catalog::{Catalog, RelationCatalog};
pub use cfg::{Cfg, CfgNode, NodeId, ProgramItem};
pub use codegen::{compile, compile_plan, CodeBundle, CompileState};
pub use compiler::{CompiledProgram, Compiler, ProgramFile};
pub use config::Config;
pub use error::{CompileError, CompileResult};
pub use expression::{Aggregate, BinaryOp, BuiltinAggregate, Expression, UdaDefinition, UnaryOp};
pub use fakedb::FakeDb;
pub use optimizer::{JoinAlgorithm, LogicalAlgebra, Optimizer, PipelinedAlgebra, TargetAlgebra};
pub use scheme::{DataType, Scheme};
pub use value::{Tuple, Value};
