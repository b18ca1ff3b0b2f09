//! # Pipelined Code Generator
//!
//! Emits code for a physical plan with the two-pass produce/consume
//! protocol. `produce` walks down to the pipeline sources; each source
//! pushes its tuples up through `consume` on its parent until an operator
//! materializes them (a hash table, an aggregate, a stored relation). That
//! operator ends the pipeline and its output starts the next one.
//!
//! ```text
//! Physical Operator -> [PlanArena] -> produce/consume -> CompileState -> CodeBundle
//! ```
//!
//! The plan is flattened into an arena with parent links so consume can
//! find the operator above it without the tree holding back-pointers.
//! Per-node generation state (structure names, key columns, syncs) lives
//! in a side table indexed like the arena.

pub mod fragment;
mod scalar;
pub mod state;

use std::collections::BTreeSet;
use tracing::{debug, info};

pub use fragment::{Fragment, Piece, SymbolId, SymbolTable};
pub use state::{
    CodeBundle, CompileState, ExecutionItem, MaterializationKey, Materialized, Pipeline,
    PipelineKind, PipelineProperties, StoreHandle, TupleRef,
};

use crate::algebra::{Operator, OperatorKind, ScanSource, StoreTarget};
use crate::error::{CompileError, CompileResult};
use crate::expression::{Aggregate, BuiltinAggregate, Expression, UdaDefinition};
use crate::scheme::Scheme;
use scalar::{compile_expression, StateScope};

type NodeIndex = usize;

struct ArenaNode<'p> {
    op: &'p Operator,
    children: Vec<NodeIndex>,
    parent: Option<NodeIndex>,
}

/// Plan flattened in preorder, root at index 0
struct PlanArena<'p> {
    nodes: Vec<ArenaNode<'p>>,
}

impl<'p> PlanArena<'p> {
    fn new(root: &'p Operator) -> Self {
        let mut arena = PlanArena { nodes: Vec::new() };
        arena.insert(root, None);
        arena
    }

    fn insert(&mut self, op: &'p Operator, parent: Option<NodeIndex>) -> NodeIndex {
        let index = self.nodes.len();
        self.nodes.push(ArenaNode {
            op,
            children: Vec::new(),
            parent,
        });
        for child in op.children() {
            let c = self.insert(child, Some(index));
            self.nodes[index].children.push(c);
        }
        index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left = 0,
    Right = 1,
}

impl Side {
    fn index(self) -> usize {
        self as usize
    }

    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Side::Left => "Left",
            Side::Right => "Right",
        }
    }
}

#[derive(Debug, Clone)]
enum AggregateMode {
    Builtin {
        function: BuiltinAggregate,
        input: Option<Expression>,
    },
    Udas {
        udas: Vec<UdaDefinition>,
        state: Scheme,
    },
}

#[derive(Debug, Clone)]
struct GroupPlan {
    mode: AggregateMode,
    keys: Vec<usize>,
    key_type: String,
    state_type: String,
    update_func: String,
    init_func: String,
}

/// Generation state of one arena node
#[derive(Debug, Default)]
struct Scratch {
    structure: Option<String>,
    keys: [Vec<usize>; 2],
    tuple_types: [Option<String>; 2],
    type_refs: [Option<SymbolId>; 2],
    syncs: [Vec<String>; 2],
    out: Option<TupleRef>,
    group: Option<GroupPlan>,
    store: Option<StoreHandle>,
    /// Syncs of the pipelines appending to a temp
    writers: Vec<String>,
}

/// Key column pairs `(left, right)` of an equi-join condition, positions
/// relative to each side
fn equi_columns(
    condition: &Expression,
    left_arity: usize,
    operator: OperatorKind,
    single: bool,
) -> CompileResult<Vec<(usize, usize)>> {
    let unsupported = || CompileError::UnsupportedCondition {
        operator: operator.to_string(),
        condition: condition.to_string(),
    };
    let conjuncts = condition.conjuncts();
    if single && conjuncts.len() != 1 {
        return Err(unsupported());
    }
    let mut pairs = conjuncts
        .into_iter()
        .map(|c| match c.equality_positions() {
            Some((a, b)) if a < left_arity && b >= left_arity => Ok((a, b - left_arity)),
            Some((a, b)) if b < left_arity && a >= left_arity => Ok((b, a - left_arity)),
            _ => Err(unsupported()),
        })
        .collect::<CompileResult<Vec<_>>>()?;
    // build-side key order is canonical so equal column sets share a key layout
    pairs.sort_by_key(|&(l, r)| (r, l));
    Ok(pairs)
}

fn key_type(scheme: &Scheme, columns: &[usize]) -> CompileResult<String> {
    let types = columns
        .iter()
        .map(|c| {
            scheme
                .data_type(*c)
                .map(|t| t.code_name())
                .ok_or(CompileError::AttributeOutOfRange {
                    position: *c,
                    arity: scheme.len(),
                })
        })
        .collect::<CompileResult<Vec<_>>>()?;
    Ok(format!("std::tuple<{}>", types.join(", ")))
}

fn key_value(tuple: &TupleRef, columns: &[usize]) -> String {
    let fields: Vec<String> = columns.iter().map(|c| tuple.field(*c)).collect();
    format!("std::make_tuple({})", fields.join(", "))
}

fn aggregate_mode(aggregates: &[Aggregate]) -> CompileResult<AggregateMode> {
    let unsupported = || CompileError::UnsupportedAggregates {
        aggregates: aggregates.iter().map(ToString::to_string).collect(),
    };
    match aggregates {
        [Aggregate::Builtin { function, input }] => Ok(AggregateMode::Builtin {
            function: *function,
            input: input.clone(),
        }),
        _ if !aggregates.is_empty() && aggregates.iter().all(|a| !a.is_builtin()) => {
            let mut state = Scheme::default();
            let mut udas = Vec::new();
            for agg in aggregates {
                if let Aggregate::Uda(uda) = agg {
                    uda.check_arity()?;
                    for (name, data_type) in uda.state.iter() {
                        // state columns of all UDAs share one accumulator tuple
                        if state.position(name).is_some() {
                            return Err(unsupported());
                        }
                        state.push(name.clone(), *data_type);
                    }
                    udas.push(uda.clone());
                }
            }
            Ok(AggregateMode::Udas { udas, state })
        }
        _ => Err(unsupported()),
    }
}

fn missing(what: &str, node: NodeIndex) -> CompileError {
    CompileError::InvalidPipeline(format!("{what} not set for node {node}"))
}

struct Generator<'p, 's> {
    arena: PlanArena<'p>,
    scratch: Vec<Scratch>,
    state: &'s mut CompileState,
}

impl<'p, 's> Generator<'p, 's> {
    fn new(plan: &'p Operator, state: &'s mut CompileState) -> Self {
        let arena = PlanArena::new(plan);
        let scratch = arena.nodes.iter().map(|_| Scratch::default()).collect();
        Generator {
            arena,
            scratch,
            state,
        }
    }

    fn op(&self, node: NodeIndex) -> &'p Operator {
        self.arena.nodes[node].op
    }

    fn child(&self, node: NodeIndex, i: usize) -> NodeIndex {
        self.arena.nodes[node].children[i]
    }

    fn side_of(&self, node: NodeIndex, from: NodeIndex) -> Side {
        if self.child(node, 0) == from {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn structure(&self, node: NodeIndex) -> CompileResult<String> {
        self.scratch[node]
            .structure
            .clone()
            .ok_or_else(|| missing("structure", node))
    }

    fn consume_parent(&mut self, node: NodeIndex, tuple: &TupleRef) -> CompileResult<Fragment> {
        match self.arena.nodes[node].parent {
            Some(parent) => self.consume(parent, tuple, node),
            None => Err(CompileError::InvalidPipeline(format!(
                "{} output has no consumer",
                self.op(node).kind()
            ))),
        }
    }

    fn produce(&mut self, node: NodeIndex) -> CompileResult<()> {
        let op = self.op(node);
        debug!(node, operator = %op.kind(), "produce");
        match op {
            Operator::Sequence { .. } => {
                for child in self.arena.nodes[node].children.clone() {
                    self.produce(child)?;
                }
                Ok(())
            }
            Operator::FileScan { source, scheme } => self.produce_file_scan(node, source, scheme),
            Operator::MemoryScan { .. }
            | Operator::PhysicalSelect { .. }
            | Operator::PhysicalApply { .. }
            | Operator::PhysicalProject { .. } => {
                let input = self.child(node, 0);
                self.produce(input)
            }
            Operator::PhysicalUnionAll { .. } => {
                let (left, right) = (self.child(node, 0), self.child(node, 1));
                self.produce(left)?;
                self.produce(right)
            }
            Operator::HashJoin {
                condition,
                left,
                right,
            } => self.produce_hash_join(node, condition, left, right),
            Operator::SymmetricHashJoin {
                condition,
                left,
                right,
            } => self.produce_symmetric_join(node, condition, left, right),
            Operator::ShuffleHashJoin {
                condition,
                left,
                right,
            } => self.produce_shuffle_join(node, condition, left, right),
            Operator::HashGroupBy {
                grouping,
                aggregates,
                input,
            } => self.produce_group_by(node, grouping, aggregates, input),
            Operator::PhysicalStore { target, .. } => self.produce_store(node, target),
            logical => Err(CompileError::NotPhysical {
                operator: logical.kind().to_string(),
            }),
        }
    }

    fn consume(&mut self, node: NodeIndex, tuple: &TupleRef, from: NodeIndex) -> CompileResult<Fragment> {
        let op = self.op(node);
        match op {
            Operator::MemoryScan { .. } => self.consume_memory_scan(node, tuple),
            Operator::PhysicalSelect { condition, .. } => {
                let test = compile_expression(condition, tuple, StateScope::None, self.state)?;
                let inner = self.consume_parent(node, tuple)?;
                Ok(Fragment::from(format!("if ({test}) {{\n")).then(inner).text("\n}"))
            }
            Operator::PhysicalApply { emitters, .. } => {
                let out = self.state.new_tuple(&op.scheme()?);
                let mut code = format!("{} {};\n", out.type_name, out.name);
                for (i, (_, expr)) in emitters.iter().enumerate() {
                    let value = compile_expression(expr, tuple, StateScope::None, self.state)?;
                    code.push_str(&format!("{} = {value};\n", out.field(i)));
                }
                let inner = self.consume_parent(node, &out)?;
                Ok(Fragment::from(code).then(inner))
            }
            Operator::PhysicalProject { columns, .. } => {
                let out = self.state.new_tuple(&op.scheme()?);
                let mut code = format!("{} {};\n", out.type_name, out.name);
                for (i, c) in columns.iter().enumerate() {
                    code.push_str(&format!("{} = {};\n", out.field(i), tuple.field(*c)));
                }
                let inner = self.consume_parent(node, &out)?;
                Ok(Fragment::from(code).then(inner))
            }
            Operator::PhysicalUnionAll { .. } => self.consume_parent(node, tuple),
            Operator::HashJoin { .. } => {
                let side = self.side_of(node, from);
                self.consume_hash_join(node, tuple, side)
            }
            Operator::SymmetricHashJoin { .. } => {
                let side = self.side_of(node, from);
                self.consume_symmetric_join(node, tuple, side)
            }
            Operator::ShuffleHashJoin { .. } => {
                let side = self.side_of(node, from);
                self.consume_shuffle_join(node, tuple, side)
            }
            Operator::HashGroupBy { .. } => self.consume_group_by(node, tuple),
            Operator::PhysicalStore { target, .. } => self.consume_store(node, target, tuple),
            other => Err(CompileError::InvalidPipeline(format!(
                "{} cannot consume tuples",
                other.kind()
            ))),
        }
    }

    // Scans

    fn produce_file_scan(&mut self, node: NodeIndex, source: &ScanSource, scheme: &Scheme) -> CompileResult<()> {
        let parent_kind = self.arena.nodes[node].parent.map(|p| self.op(p).kind());
        if parent_kind != Some(OperatorKind::MemoryScan) {
            return Err(CompileError::InvalidPipeline(
                "file scan output must feed a memory scan".to_string(),
            ));
        }

        let relation = match source {
            ScanSource::Relation(name) => {
                let key = self.op(node).cse_key();
                match self.state.lookup_scan(&key) {
                    Some(relation) => {
                        debug!(relation = %relation, "reusing scanned relation");
                        relation
                    }
                    None => {
                        let relation = self.state.gensym("rel");
                        let tuple_type = self.state.tuple_type(scheme);
                        self.state
                            .add_declaration_later(format!("Relation<{tuple_type}> {relation};"));
                        self.state.set_pipeline_kind(PipelineKind::Scan);
                        self.state.set_pipeline_source(OperatorKind::FileScan);
                        self.state.add_pipeline(Fragment::from(format!(
                            "{relation} = readTuples<{tuple_type}>({name:?});"
                        )))?;
                        let staged = self.state.new_tuple(scheme);
                        self.state.save_tuple_def(&relation, staged);
                        self.state.save_scan(key, relation.clone());
                        relation
                    }
                }
            }
            ScanSource::Temp(name) => {
                let relation = self
                    .state
                    .temp_relation(name)
                    .map(str::to_string)
                    .ok_or_else(|| CompileError::UndefinedVariable {
                        variable: name.clone(),
                        context: "scan before any store".to_string(),
                    })?;
                // the reader starts only once the swap has published the contents
                for writer in self.state.temp_writers(name).to_vec() {
                    self.state.add_dependence(&writer);
                }
                relation
            }
        };

        let handle = TupleRef {
            name: relation,
            type_name: self.state.tuple_type(scheme),
            scheme: scheme.clone(),
        };
        self.consume_parent(node, &handle)?;
        Ok(())
    }

    fn consume_memory_scan(&mut self, node: NodeIndex, input: &TupleRef) -> CompileResult<Fragment> {
        let relation = &input.name;
        let staged = self
            .state
            .lookup_tuple_def(relation)
            .cloned()
            .ok_or_else(|| CompileError::InvalidPipeline(format!("no tuple definition for {relation}")))?;

        let global_sync = self.state.create_pipeline_synchronization();
        self.state.get_pipeline_task_name();
        let inner = self.consume_parent(node, &staged)?;

        let code = Fragment::from(format!(
            "forall<&{global_sync}>({relation}.data, {relation}.numtuples, [=](int64_t i, {}& {}) {{\n",
            staged.type_name, staged.name
        ))
        .then(inner)
        .text(format!("\n}}); // end scan over {relation}"));

        self.state.set_pipeline_kind(PipelineKind::InMemory);
        self.state.set_pipeline_source(OperatorKind::MemoryScan);
        self.state.add_pipeline(code)?;
        Ok(Fragment::new())
    }

    // Hash join: right side builds, left side probes

    fn produce_hash_join(
        &mut self,
        node: NodeIndex,
        condition: &Expression,
        left: &Operator,
        right: &Operator,
    ) -> CompileResult<()> {
        let right_scheme = right.scheme()?;
        let pairs = equi_columns(condition, left.scheme()?.len(), OperatorKind::HashJoin, false)?;
        let (left_keys, right_keys): (Vec<usize>, Vec<usize>) = pairs.into_iter().unzip();
        let key_type = key_type(&right_scheme, &right_keys)?;
        let key = MaterializationKey {
            subexpressions: vec![right.cse_key()],
            columns: right_keys.iter().copied().collect(),
        };
        self.scratch[node].keys = [left_keys, right_keys];

        match self.state.lookup_expr(&key) {
            Some(handle) => {
                debug!(structure = %handle.name, "reusing hash table");
                let scratch = &mut self.scratch[node];
                scratch.tuple_types[Side::Right.index()] = handle.tuple_types.first().cloned();
                scratch.syncs[Side::Right.index()] = handle.syncs;
                scratch.structure = Some(handle.name);
            }
            None => {
                let hash = self.state.gensym("hash");
                let right_ref = self.state.create_unresolved_symbol();
                self.state.add_declaration_later(
                    Fragment::from(format!("typedef MatchesDHT<{key_type}, "))
                        .symbol(right_ref)
                        .text(format!(
                            ", hash_tuple::hash<{key_type}>> DHT_{hash};\nDHT_{hash} {hash};"
                        )),
                );
                self.state
                    .add_structure_initializer(format!("{hash}.init_global_DHT(&{hash}, cores() * 16 * 1024);"));
                self.scratch[node].structure = Some(hash.clone());
                self.scratch[node].type_refs[Side::Right.index()] = Some(right_ref);

                let build = self.child(node, 1);
                self.produce(build)?;

                let scratch = &self.scratch[node];
                let right_type = scratch.tuple_types[Side::Right.index()]
                    .clone()
                    .ok_or_else(|| missing("build side tuple type", node))?;
                let handle = Materialized {
                    name: hash,
                    tuple_types: vec![right_type],
                    syncs: scratch.syncs[Side::Right.index()].clone(),
                };
                self.state.save_expr(key, right.temp_reads(), handle);
            }
        }

        let probe = self.child(node, 0);
        self.produce(probe)
    }

    fn consume_hash_join(&mut self, node: NodeIndex, tuple: &TupleRef, side: Side) -> CompileResult<Fragment> {
        let hash = self.structure(node)?;
        let keys = self.scratch[node].keys[side.index()].clone();
        let global_sync = self.state.global_sync()?;

        if side == Side::Right {
            let sync = self.state.get_pipeline_task_name();
            let scratch = &mut self.scratch[node];
            scratch.syncs[Side::Right.index()].push(sync);
            scratch.tuple_types[Side::Right.index()] = Some(tuple.type_name.clone());
            if let Some(id) = scratch.type_refs[Side::Right.index()] {
                self.state.resolve_symbol(id, &tuple.type_name);
            }
            return Ok(Fragment::from(format!(
                "{hash}.insert_async<&{global_sync}>({}, {});",
                key_value(tuple, &keys),
                tuple.name
            )));
        }

        for sync in self.scratch[node].syncs[Side::Right.index()].clone() {
            self.state.add_dependence(&sync);
        }
        let right_type = self.scratch[node].tuple_types[Side::Right.index()]
            .clone()
            .ok_or_else(|| missing("build side tuple type", node))?;
        let out = self.state.new_tuple(&self.op(node).scheme()?);
        let matched = self.state.gensym("t");
        let inner = self.consume_parent(node, &out)?;

        Ok(Fragment::from(format!(
            "{hash}.lookup_iter<&{global_sync}>({}, [=]({right_type}& {matched}) {{\n{ot} {on} = {ot}::create({}, {matched});\n",
            key_value(tuple, &keys),
            tuple.name,
            ot = out.type_name,
            on = out.name,
        ))
        .then(inner)
        .text("\n});"))
    }

    // Symmetric hash join: both sides insert and probe, no pipeline break

    fn produce_symmetric_join(
        &mut self,
        node: NodeIndex,
        condition: &Expression,
        left: &Operator,
        right: &Operator,
    ) -> CompileResult<()> {
        let left_scheme = left.scheme()?;
        let pairs = equi_columns(condition, left_scheme.len(), OperatorKind::SymmetricHashJoin, true)?;
        let (left_key, right_key) = pairs[0];
        let key_type = left_scheme
            .data_type(left_key)
            .map(|t| t.code_name())
            .ok_or(CompileError::AttributeOutOfRange {
                position: left_key,
                arity: left_scheme.len(),
            })?;

        let hash = self.state.gensym("dhash");
        let left_ref = self.state.create_unresolved_symbol();
        let right_ref = self.state.create_unresolved_symbol();
        self.state.add_declaration_later(
            Fragment::from(format!("typedef DoubleDHT<{key_type}, "))
                .symbol(left_ref)
                .text(", ")
                .symbol(right_ref)
                .text(format!(", std::hash<{key_type}>> DHT_{hash};\nDHT_{hash} {hash};")),
        );
        self.state
            .add_structure_initializer(format!("{hash}.init_global_DHT(&{hash}, cores() * 16 * 1024);"));

        let out = self.state.new_tuple(&self.op(node).scheme()?);
        let scratch = &mut self.scratch[node];
        scratch.structure = Some(hash);
        scratch.keys = [vec![left_key], vec![right_key]];
        scratch.type_refs = [Some(left_ref), Some(right_ref)];
        scratch.out = Some(out);

        let (l, r) = (self.child(node, 0), self.child(node, 1));
        self.produce(r)?;
        self.produce(l)
    }

    fn consume_symmetric_join(&mut self, node: NodeIndex, tuple: &TupleRef, side: Side) -> CompileResult<Fragment> {
        let hash = self.structure(node)?;
        let global_sync = self.state.global_sync()?;
        let scratch = &mut self.scratch[node];
        let key = scratch.keys[side.index()]
            .first()
            .copied()
            .ok_or_else(|| missing("join key", node))?;
        scratch.tuple_types[side.index()] = Some(tuple.type_name.clone());
        let other_type = match (&scratch.tuple_types[side.other().index()], scratch.type_refs[side.other().index()]) {
            (Some(known), _) => Fragment::from(known.as_str()),
            (None, Some(id)) => Fragment::new().symbol(id),
            (None, None) => return Err(missing("tuple type", node)),
        };
        let out_type = scratch.out.clone().ok_or_else(|| missing("output tuple", node))?;
        if let Some(id) = scratch.type_refs[side.index()] {
            self.state.resolve_symbol(id, &tuple.type_name);
        }

        let matched = self.state.gensym("t");
        let out = TupleRef {
            name: self.state.gensym("t"),
            ..out_type
        };
        let (l, r) = match side {
            Side::Left => (tuple.name.as_str(), matched.as_str()),
            Side::Right => (matched.as_str(), tuple.name.as_str()),
        };
        let create = format!(
            "& {matched}) {{\n{ot} {on} = {ot}::create({l}, {r});\n",
            ot = out.type_name,
            on = out.name
        );
        let inner = self.consume_parent(node, &out)?;

        Ok(Fragment::from(format!(
            "{hash}.insert_lookup_iter_{}<&{global_sync}>({}, {}, [=](",
            side.name(),
            tuple.field(key),
            tuple.name
        ))
        .then(other_type)
        .text(create)
        .then(inner)
        .text("\n});"))
    }

    // Shuffle hash join: both sides emit to reducers, a reduce pipeline joins

    fn produce_shuffle_join(
        &mut self,
        node: NodeIndex,
        condition: &Expression,
        left: &Operator,
        right: &Operator,
    ) -> CompileResult<()> {
        let left_scheme = left.scheme()?;
        let pairs = equi_columns(condition, left_scheme.len(), OperatorKind::ShuffleHashJoin, true)?;
        let (left_key, right_key) = pairs[0];
        let key_type = left_scheme
            .data_type(left_key)
            .map(|t| t.code_name())
            .ok_or(CompileError::AttributeOutOfRange {
                position: left_key,
                arity: left_scheme.len(),
            })?;
        let out_scheme = self.op(node).scheme()?;
        let key = MaterializationKey {
            subexpressions: vec![left.cse_key(), right.cse_key()],
            columns: BTreeSet::from([left_key, left_scheme.len() + right_key]),
        };
        self.scratch[node].keys = [vec![left_key], vec![right_key]];

        let (hash, types, syncs, fresh) = match self.state.lookup_expr(&key) {
            Some(handle) => {
                debug!(structure = %handle.name, "reusing join reducers");
                (handle.name, handle.tuple_types, handle.syncs, false)
            }
            None => {
                let hash = self.state.gensym("hashjoin_reducer");
                let left_ref = self.state.create_unresolved_symbol();
                let right_ref = self.state.create_unresolved_symbol();
                let out_type = self.state.tuple_type(&out_scheme);
                let template = |name: &str| {
                    Fragment::from(format!("{name}<{key_type}, "))
                        .symbol(left_ref)
                        .text(", ")
                        .symbol(right_ref)
                        .text(format!(", {out_type}>"))
                };
                self.state.add_structure_initializer(
                    Fragment::from(format!(
                        "auto {hash}_num_reducers = cores();\nauto {hash} = "
                    ))
                    .then(template("allocateJoinReducers"))
                    .text(format!("({hash}_num_reducers);\nauto {hash}_ctx = "))
                    .then(template("HashJoinContext"))
                    .text(format!("({hash}, {hash}_num_reducers);")),
                );
                let scratch = &mut self.scratch[node];
                scratch.structure = Some(hash.clone());
                scratch.type_refs = [Some(left_ref), Some(right_ref)];

                let (l, r) = (self.child(node, 0), self.child(node, 1));
                self.produce(r)?;
                self.produce(l)?;

                let scratch = &self.scratch[node];
                let mut types = Vec::new();
                for side in [Side::Left, Side::Right] {
                    types.push(
                        scratch.tuple_types[side.index()]
                            .clone()
                            .ok_or_else(|| missing("input tuple type", node))?,
                    );
                }
                types.push(out_type);
                let syncs: Vec<String> = scratch.syncs.iter().flatten().cloned().collect();
                let mut reads = left.temp_reads();
                reads.extend(right.temp_reads());
                self.state.save_expr(
                    key,
                    reads,
                    Materialized {
                        name: hash.clone(),
                        tuple_types: types.clone(),
                        syncs: syncs.clone(),
                    },
                );
                (hash, types, syncs, true)
            }
        };

        let [left_type, right_type, out_type] = match types.as_slice() {
            [l, r, o] => [l.clone(), r.clone(), o.clone()],
            _ => return Err(missing("reducer tuple types", node)),
        };

        let global_sync = self.state.create_pipeline_synchronization();
        let reduce = self.state.get_pipeline_task_name();
        for sync in &syncs {
            self.state.add_dependence(sync);
        }
        if fresh {
            self.state.add_precode(format!("{hash}_ctx.reduceExecute();"));
            let release = format!("freeJoinReducers({hash}, {hash}_num_reducers);");
            if self.state.in_loop() {
                // reducers are reallocated next iteration, drain them first
                self.state
                    .add_structure_release(format!("{reduce}.wait();\n{release}"));
            } else {
                self.state.add_flush(release);
            }
        }

        let out = TupleRef {
            name: self.state.gensym("t"),
            type_name: out_type,
            scheme: out_scheme,
        };
        let l = self.state.gensym("t");
        let r = self.state.gensym("t");
        let inner = self.consume_parent(node, &out)?;
        let code = Fragment::from(format!(
            "{hash}_ctx.forall_results<&{global_sync}>([=]({left_type}& {l}, {right_type}& {r}) {{\n{ot} {on} = {ot}::create({l}, {r});\n",
            ot = out.type_name,
            on = out.name
        ))
        .then(inner)
        .text("\n});");

        self.state.set_pipeline_kind(PipelineKind::InMemory);
        self.state.set_pipeline_source(OperatorKind::ShuffleHashJoin);
        self.state.add_pipeline(code)
    }

    fn consume_shuffle_join(&mut self, node: NodeIndex, tuple: &TupleRef, side: Side) -> CompileResult<Fragment> {
        let hash = self.structure(node)?;
        let global_sync = self.state.global_sync()?;
        let sync = self.state.get_pipeline_task_name();
        let scratch = &mut self.scratch[node];
        let key = scratch.keys[side.index()]
            .first()
            .copied()
            .ok_or_else(|| missing("join key", node))?;
        scratch.syncs[side.index()].push(sync);
        scratch.tuple_types[side.index()] = Some(tuple.type_name.clone());
        if let Some(id) = scratch.type_refs[side.index()] {
            self.state.resolve_symbol(id, &tuple.type_name);
        }
        Ok(Fragment::from(format!(
            "{hash}_ctx.emitIntermediate{}<&{global_sync}>({}, {});",
            side.title(),
            tuple.field(key),
            tuple.name
        )))
    }

    // Hash group-by

    fn produce_group_by(
        &mut self,
        node: NodeIndex,
        grouping: &[Expression],
        aggregates: &[Aggregate],
        input: &Operator,
    ) -> CompileResult<()> {
        let input_scheme = input.scheme()?;
        let mode = aggregate_mode(aggregates)?;
        let keys = grouping
            .iter()
            .map(|g| {
                g.position().ok_or_else(|| {
                    CompileError::InvalidPipeline(format!("group-by key {g} is not a bound attribute"))
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;
        let key_type = key_type(&input_scheme, &keys)?;
        let hash = self.state.gensym("group_hash");

        let (state_type, update_func, init_func) = match &mode {
            AggregateMode::Builtin { function, input } => {
                let value_type = match input {
                    Some(e) => e.data_type(&input_scheme, None)?.code_name(),
                    None => "int64",
                };
                let state_type = match function {
                    BuiltinAggregate::CountAll | BuiltinAggregate::Count => "int64",
                    _ => value_type,
                };
                (
                    state_type.to_string(),
                    format!("Aggregates::{}<{state_type}, {value_type}>", function.name()),
                    format!("Aggregates::Zero<{state_type}>"),
                )
            }
            AggregateMode::Udas { udas, state } => {
                let state_type = self.state.tuple_type(state);
                let func = self.state.gensym(&udas[0].name);
                (state_type, format!("{func}_update"), format!("{func}_init"))
            }
        };

        let initializer = match (&mode, keys.is_empty()) {
            (_, false) => format!(
                "auto {hash} = DHT_symmetric<{key_type}, {state_type}, hash_tuple::hash<{key_type}>>::create_DHT_symmetric();"
            ),
            (AggregateMode::Builtin { function, .. }, true) => {
                let initial = match function {
                    BuiltinAggregate::Min => format!("std::numeric_limits<{state_type}>::max()"),
                    BuiltinAggregate::Max => format!("std::numeric_limits<{state_type}>::lowest()"),
                    _ => "0".to_string(),
                };
                format!("auto {hash} = counter<{state_type}>::create({initial});")
            }
            (AggregateMode::Udas { .. }, true) => {
                format!("auto {hash} = symmetric_global_alloc<{state_type}>({init_func}());")
            }
        };
        self.state.add_structure_initializer(initializer);

        self.scratch[node].structure = Some(hash.clone());
        self.scratch[node].group = Some(GroupPlan {
            mode: mode.clone(),
            keys: keys.clone(),
            key_type: key_type.clone(),
            state_type: state_type.clone(),
            update_func,
            init_func,
        });

        let child = self.child(node, 0);
        self.produce(child)?;

        // output pipeline over the finished accumulators
        let input_syncs = self.scratch[node].syncs[0].clone();
        if input_syncs.is_empty() {
            return Err(missing("group-by input sync", node));
        }
        let global_sync = self.state.create_pipeline_synchronization();
        self.state.get_pipeline_task_name();
        for sync in &input_syncs {
            self.state.add_dependence(sync);
        }

        let out = self.state.new_tuple(&self.op(node).scheme()?);
        let entry = self.state.gensym("entry");
        let mut body = format!("{} {};\n", out.type_name, out.name);
        let (state_var, header) = if keys.is_empty() {
            let reduce = match &mode {
                AggregateMode::Builtin { .. } => format!("reduce<{state_type}, counter, &get_count>({hash})"),
                AggregateMode::Udas { .. } => format!("reduce<{state_type}>({hash})"),
            };
            (entry.clone(), format!("{state_type} {entry} = {reduce};\n"))
        } else {
            for k in 0..keys.len() {
                body.push_str(&format!("{} = std::get<{k}>({entry}.first);\n", out.field(k)));
            }
            (
                format!("{entry}.second"),
                format!(
                    "{hash}->forall_entries<&{global_sync}>([=](std::pair<const {key_type}, {state_type}>& {entry}) {{\n"
                ),
            )
        };
        match &mode {
            AggregateMode::Builtin { .. } => {
                body.push_str(&format!("{} = {state_var};\n", out.field(keys.len())));
            }
            AggregateMode::Udas { udas, state } => {
                let scope = StateScope::Tuple {
                    var: &state_var,
                    scheme: state,
                };
                for (j, uda) in udas.iter().enumerate() {
                    let value = compile_expression(&uda.emit, &out, scope, self.state)?;
                    body.push_str(&format!("{} = {value};\n", out.field(keys.len() + j)));
                }
            }
        }

        let inner = self.consume_parent(node, &out)?;
        let mut code = Fragment::from(header).text(body).then(inner);
        if !keys.is_empty() {
            code.push_str("\n});");
        }

        self.state.set_pipeline_kind(PipelineKind::InMemory);
        self.state.set_pipeline_source(OperatorKind::HashGroupBy);
        self.state.add_pipeline(code)
    }

    fn consume_group_by(&mut self, node: NodeIndex, tuple: &TupleRef) -> CompileResult<Fragment> {
        let hash = self.structure(node)?;
        let plan = self.scratch[node]
            .group
            .clone()
            .ok_or_else(|| missing("group-by plan", node))?;
        let sync = self.state.get_pipeline_task_name();
        self.scratch[node].syncs[0].push(sync);
        let global_sync = self.state.global_sync()?;

        let (argument_type, value) = match &plan.mode {
            AggregateMode::Builtin { input: None, .. } => (plan.state_type.clone(), "1".to_string()),
            AggregateMode::Builtin { input: Some(e), .. } => (
                plan.state_type.clone(),
                compile_expression(e, tuple, StateScope::None, self.state)?,
            ),
            AggregateMode::Udas { udas, state } => {
                self.declare_uda_functions(&plan, udas, state, tuple)?;
                (tuple.type_name.clone(), tuple.name.clone())
            }
        };

        let code = if !plan.keys.is_empty() {
            format!(
                "{hash}->update<&{global_sync}, {argument_type}, &{}, &{}>({}, {value});",
                plan.update_func,
                plan.init_func,
                key_value(tuple, &plan.keys)
            )
        } else if matches!(plan.mode, AggregateMode::Builtin { .. }) {
            format!("{hash}->count = {}({hash}->count, {value});", plan.update_func)
        } else {
            format!(
                "auto {hash}_local = {hash}.localize();\n*{hash}_local = {}(*{hash}_local, {value});",
                plan.update_func
            )
        };
        Ok(Fragment::from(code))
    }

    /// Update and init functions over the shared accumulator tuple
    fn declare_uda_functions(
        &mut self,
        plan: &GroupPlan,
        udas: &[UdaDefinition],
        state: &Scheme,
        tuple: &TupleRef,
    ) -> CompileResult<()> {
        let st = &plan.state_type;
        let mut update = format!(
            "{st} {}(const {st}& state, const {}& {}) {{\n",
            plan.update_func, tuple.type_name, tuple.name
        );
        for (i, name) in state.names().iter().enumerate() {
            update.push_str(&format!("  auto {name} = state.f{i};\n"));
        }
        update.push_str(&format!("  {st} next;\n"));
        let mut init = format!("{st} {}() {{\n  {st} next;\n", plan.init_func);

        let mut column = 0;
        for uda in udas {
            for (update_expr, init_expr) in uda.updates.iter().zip(&uda.inits) {
                let u = compile_expression(update_expr, tuple, StateScope::Locals, self.state)?;
                let i = compile_expression(init_expr, tuple, StateScope::Locals, self.state)?;
                update.push_str(&format!("  next.f{column} = {u};\n"));
                init.push_str(&format!("  next.f{column} = {i};\n"));
                column += 1;
            }
        }
        update.push_str("  return next;\n}");
        init.push_str("  return next;\n}");
        self.state.add_declaration_later(init);
        self.state.add_declaration_later(update);
        Ok(())
    }

    // Stores

    fn produce_store(&mut self, node: NodeIndex, target: &StoreTarget) -> CompileResult<()> {
        let input = self.child(node, 0);
        match target {
            StoreTarget::Relation(name) => {
                let relation = format!("result_{name}");
                let handle = self.state.store_target(&relation, |rel, id| {
                    Fragment::from("std::vector<").symbol(id).text(format!("> {rel};"))
                });
                self.state
                    .add_flush(format!("writeTuples({relation}, {name:?});"));
                self.scratch[node].store = Some(handle);
                self.produce(input)
            }
            StoreTarget::Temp(name) => {
                // readers of the old contents may run in this same statement,
                // so tuples go to a staging relation swapped in afterwards
                let relation = format!("temp_{name}");
                let handle = self.state.store_target(&relation, |rel, id| {
                    Fragment::from("Relation<")
                        .symbol(id)
                        .text(format!("> {rel};\nRelation<"))
                        .symbol(id)
                        .text(format!("> {rel}_next;"))
                });
                self.scratch[node].store = Some(handle);
                self.state.add_code(format!("{relation}_next.clear();"));
                self.produce(input)?;
                let writers = std::mem::take(&mut self.scratch[node].writers);
                let mut swap = String::new();
                for writer in &writers {
                    swap.push_str(&format!("{writer}.wait();\n"));
                }
                swap.push_str(&format!("std::swap({relation}, {relation}_next);"));
                self.state.add_code(swap);
                self.state.register_temp(name, &relation, writers);
                Ok(())
            }
        }
    }

    fn consume_store(&mut self, node: NodeIndex, target: &StoreTarget, tuple: &TupleRef) -> CompileResult<Fragment> {
        let handle = self.scratch[node]
            .store
            .clone()
            .ok_or_else(|| missing("store target", node))?;
        self.state.resolve_symbol(handle.type_ref, &tuple.type_name);
        match target {
            StoreTarget::Relation(_) => Ok(Fragment::from(format!(
                "{}.push_back({});",
                handle.relation, tuple.name
            ))),
            StoreTarget::Temp(_) => {
                let staged = self.state.new_tuple(&tuple.scheme);
                self.state.save_tuple_def(&handle.relation, staged);
                let sync = self.state.get_pipeline_task_name();
                if !self.scratch[node].writers.contains(&sync) {
                    self.scratch[node].writers.push(sync);
                }
                Ok(Fragment::from(format!(
                    "{}_next.append({});",
                    handle.relation, tuple.name
                )))
            }
        }
    }
}

/// Generate code for one physical plan into a shared compile state
pub fn compile_plan(plan: &Operator, state: &mut CompileState) -> CompileResult<()> {
    let first = state.current_pipeline_id();
    Generator::new(plan, state).produce(0)?;
    debug!(
        pipelines = state.current_pipeline_id() - first,
        "plan compiled"
    );
    Ok(())
}

/// Compile a single physical plan into a finished bundle
pub fn compile(plan: &Operator, common_subexpression_elimination: bool) -> CompileResult<CodeBundle> {
    let mut state = CompileState::new(common_subexpression_elimination);
    compile_plan(plan, &mut state)?;
    let bundle = state.finish()?;
    info!(
        pipelines = bundle.pipelines().count(),
        declarations = bundle.declarations.len() + bundle.declarations_later.len(),
        "code generated"
    );
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::DataType;

    fn ab() -> Scheme {
        Scheme::from_pairs(&[("a", DataType::Int64), ("b", DataType::Int64)])
    }

    fn scan(name: &str) -> Operator {
        Operator::MemoryScan {
            input: Box::new(Operator::FileScan {
                source: ScanSource::Relation(name.to_string()),
                scheme: ab(),
            }),
        }
    }

    fn store(name: &str, input: Operator) -> Operator {
        Operator::PhysicalStore {
            target: StoreTarget::Relation(name.to_string()),
            input: Box::new(input),
        }
    }

    #[test]
    fn test_equi_columns_orients_sides() {
        let cond = Expression::and(
            Expression::eq(Expression::attr(3), Expression::attr(0)),
            Expression::eq(Expression::attr(1), Expression::attr(2)),
        );
        let pairs = equi_columns(&cond, 2, OperatorKind::HashJoin, false).unwrap();
        assert_eq!(pairs, vec![(1, 0), (0, 1)]);
        assert!(matches!(
            equi_columns(&cond, 2, OperatorKind::ShuffleHashJoin, true),
            Err(CompileError::UnsupportedCondition { .. })
        ));
    }

    #[test]
    fn test_equi_columns_rejects_local_equality() {
        let cond = Expression::eq(Expression::attr(0), Expression::attr(1));
        assert!(equi_columns(&cond, 2, OperatorKind::HashJoin, false).is_err());
    }

    #[test]
    fn test_scan_select_store() {
        let plan = store(
            "out",
            Operator::PhysicalSelect {
                condition: Expression::eq(Expression::attr(0), Expression::literal(3i64)),
                input: Box::new(scan("r")),
            },
        );
        let bundle = compile(&plan, true).unwrap();
        assert_eq!(bundle.scan_pipelines.len(), 1);
        assert_eq!(bundle.pipelines().count(), 2);
        let text = bundle.render().unwrap();
        assert!(text.contains("readTuples"));
        assert!(text.contains(".f0 == 3)"));
        assert!(text.contains("result_out.push_back"));
        assert!(text.contains("writeTuples(result_out, \"out\");"));
    }

    #[test]
    fn test_logical_operator_rejected() {
        let plan = store("out", Operator::distinct(scan("r")));
        assert_eq!(
            compile(&plan, true).unwrap_err(),
            CompileError::NotPhysical {
                operator: "Distinct".to_string()
            }
        );
    }

    #[test]
    fn test_mixed_aggregates_rejected() {
        let uda = UdaDefinition {
            name: "cnt".to_string(),
            state: Scheme::from_pairs(&[("c", DataType::Int64)]),
            inits: vec![Expression::literal(0i64)],
            updates: vec![Expression::binary(
                crate::expression::BinaryOp::Add,
                Expression::state("c"),
                Expression::literal(1i64),
            )],
            emit: Expression::state("c"),
        };
        let plan = store(
            "out",
            Operator::HashGroupBy {
                grouping: vec![],
                aggregates: vec![Aggregate::count_all(), Aggregate::Uda(uda)],
                input: Box::new(scan("r")),
            },
        );
        assert!(matches!(
            compile(&plan, true),
            Err(CompileError::UnsupportedAggregates { aggregates }) if aggregates.len() == 2
        ));
    }
}
