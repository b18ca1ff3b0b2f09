//! # Program Compiler
//!
//! Drives a whole program through the phases:
//!
//! ```text
//! Vec<ProgramItem> -> Cfg -> [validate, DCE, chaining] -> per statement:
//!     [optimize] -> physical plan -> [produce/consume] -> CompileState -> CodeBundle
//! ```
//!
//! All statements share one [`CompileState`], so structures built by one
//! statement can serve later ones. Loops are emitted as `do { ... } while`
//! control code around their statements in the in-memory stream; the loop
//! test reads the first column of the first tuple of the condition relation.
//! Structures built inside a loop body are set up again on every iteration,
//! and structures built before it over temps the body reassigns are not
//! reused inside it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algebra::{Operator, OperatorKind};
use crate::catalog::{Catalog, RelationCatalog};
use crate::cfg::{Cfg, NodeId, ProgramItem};
use crate::codegen::{compile_plan, CodeBundle, CompileState};
use crate::config::{AnalysisConfig, CodegenConfig, Config};
use crate::error::{CompileError, CompileResult};
use crate::optimizer::{Optimizer, PipelinedAlgebra};

/// Program input as read by the command line driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramFile {
    /// Base relation schemes, checked against scans
    #[serde(default)]
    pub catalog: Catalog,
    pub program: Vec<ProgramItem>,
}

/// Output of a program compile
#[derive(Debug)]
pub struct CompiledProgram {
    /// Program graph after dead-code elimination and chaining
    pub cfg: Cfg,
    /// Physical plan generated for each surviving node, in emission order
    pub plans: Vec<(NodeId, Operator)>,
    pub bundle: CodeBundle,
}

/// Name of the temp a non-trivial loop test is stored into
pub fn loop_condition_variable(loop_id: usize) -> String {
    format!("__loop_condition_{loop_id}")
}

pub struct Compiler<'c> {
    optimizer: Optimizer,
    target: PipelinedAlgebra,
    analysis: AnalysisConfig,
    codegen: CodegenConfig,
    catalog: Option<&'c dyn RelationCatalog>,
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl<'c> Compiler<'c> {
    pub fn new(config: &Config) -> Self {
        Compiler {
            optimizer: Optimizer::from_config(&config.optimizer),
            target: PipelinedAlgebra::from_config(&config.optimizer),
            analysis: config.analysis.clone(),
            codegen: config.codegen.clone(),
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: &'c dyn RelationCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Build the program graph and run the enabled passes
    pub fn analyse(&self, items: &[ProgramItem]) -> CompileResult<Cfg> {
        let mut cfg = Cfg::from_program(items);
        if self.analysis.validate {
            cfg.validate()?;
        }
        let statements = cfg.len();
        let removed = if self.analysis.dead_code_elimination {
            cfg.dead_code_elimination()
        } else {
            0
        };
        let merged = if self.analysis.chaining {
            cfg.apply_chaining()?
        } else {
            0
        };
        info!(statements, removed, merged, remaining = cfg.len(), "program analysed");
        Ok(cfg)
    }

    fn optimize(&self, plan: Operator) -> CompileResult<Operator> {
        self.optimizer.optimize(plan, &self.target, self.catalog)
    }

    pub fn compile_program(&self, items: &[ProgramItem]) -> CompileResult<CompiledProgram> {
        let cfg = self.analyse(items)?;
        let mut state = CompileState::new(self.codegen.common_subexpression_elimination);
        let mut plans = Vec::new();
        let mut open_loops: Vec<usize> = Vec::new();

        for node in cfg.nodes() {
            for loop_id in node.loops.iter().skip(open_loops.len()) {
                let assigned: BTreeSet<String> = cfg
                    .nodes()
                    .filter(|n| n.loops.contains(loop_id))
                    .filter_map(|n| n.def_var.clone())
                    .chain([loop_condition_variable(*loop_id)])
                    .collect();
                debug!(loop_id, node = node.id, assigned = ?assigned, "loop begins");
                state.add_code("do {");
                state.enter_loop(&assigned);
                open_loops.push(*loop_id);
            }

            let plan = match (&node.def_var, node.closes_loop) {
                (Some(var), _) => Some(Operator::store_temp(var, node.plan.clone())),
                // a bare variable test needs no code of its own
                (None, Some(_)) if node.plan.kind() == OperatorKind::ScanTemp => None,
                (None, Some(loop_id)) => Some(Operator::store_temp(
                    &loop_condition_variable(loop_id),
                    node.plan.clone(),
                )),
                (None, None) => Some(node.plan.clone()),
            };
            if let Some(plan) = plan {
                let physical = self.optimize(plan)?;
                compile_plan(&physical, &mut state)?;
                plans.push((node.id, physical));
            }

            if let Some(loop_id) = node.closes_loop {
                let variable = match &node.plan {
                    Operator::ScanTemp { name, .. } => name.clone(),
                    _ => loop_condition_variable(loop_id),
                };
                let relation = state
                    .temp_relation(&variable)
                    .ok_or_else(|| CompileError::UndefinedVariable {
                        variable: variable.clone(),
                        context: format!("condition of loop {loop_id}"),
                    })?
                    .to_string();
                let waits: Vec<String> = state
                    .temp_writers(&variable)
                    .iter()
                    .map(|writer| format!("{writer}.wait();"))
                    .collect();
                state.exit_loop();
                if !waits.is_empty() {
                    state.add_code(waits.join("\n"));
                }
                state.add_code(format!(
                    "}} while ({relation}.numtuples > 0 && {relation}.data[0].f0);"
                ));
                open_loops.pop();
                debug!(loop_id, node = node.id, "loop ends");
            }
        }

        let bundle = state.finish()?;
        info!(
            statements = plans.len(),
            pipelines = bundle.pipelines().count(),
            "program compiled"
        );
        Ok(CompiledProgram { cfg, plans, bundle })
    }
}
