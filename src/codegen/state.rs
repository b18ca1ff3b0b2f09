//! # Compile State
//!
//! Everything one program compilation accumulates: ordered and
//! deduplicated declarations, initializers, the pipelines in emission
//! order, deferred symbols, the materialization cache used for common
//! subexpression elimination, and the property bag of the pipeline
//! currently being generated.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::fragment::{Fragment, SymbolId, SymbolTable};
use crate::algebra::{OperatorKind, SubexpressionKey};
use crate::error::{CompileError, CompileResult};
use crate::scheme::{DataType, Scheme};

/// Staged tuple: a variable of a generated tuple type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleRef {
    pub name: String,
    pub type_name: String,
    pub scheme: Scheme,
}

impl TupleRef {
    /// Access expression for column `i`
    pub fn field(&self, i: usize) -> String {
        format!("{}.f{i}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Reads input from storage; always scheduled before in-memory work
    Scan,
    InMemory,
}

/// Property bag of the pipeline under construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineProperties {
    pub kind: Option<PipelineKind>,
    /// Syncs this pipeline waits on before running
    pub dependences: BTreeSet<String>,
    /// Task-level completion event other pipelines can depend on
    pub sync: Option<String>,
    /// Completion event for the tasks spawned inside this pipeline
    pub global_sync: Option<String>,
    pub source: Option<OperatorKind>,
}

/// One emitted pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub id: usize,
    pub kind: PipelineKind,
    pub sync: Option<String>,
    pub global_sync: Option<String>,
    pub dependences: BTreeSet<String>,
    pub source: Option<OperatorKind>,
    pub code: Fragment,
}

/// Entry of the in-memory execution stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionItem {
    Pipeline(Pipeline),
    /// Straight-line code between pipelines (loop control, temp swaps)
    Code(Fragment),
}

/// Cache key for a shared build structure
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterializationKey {
    pub subexpressions: Vec<SubexpressionKey>,
    pub columns: BTreeSet<usize>,
}

/// Handle to a structure some operator already generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub name: String,
    pub tuple_types: Vec<String>,
    pub syncs: Vec<String>,
}

/// Relation written by a store, declared once per name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
    pub relation: String,
    pub type_ref: SymbolId,
}

/// Finished output of a compilation
#[derive(Debug, Clone)]
pub struct CodeBundle {
    pub declarations: Vec<Fragment>,
    pub declarations_later: Vec<Fragment>,
    pub initializers: Vec<Fragment>,
    pub scan_pipelines: Vec<Pipeline>,
    pub execution: Vec<ExecutionItem>,
    pub flush: Vec<Fragment>,
    pub main_waits: Vec<String>,
    pub symbols: SymbolTable,
}

impl CodeBundle {
    /// Scan pipelines followed by in-memory pipelines
    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.scan_pipelines
            .iter()
            .chain(self.execution.iter().filter_map(|item| match item {
                ExecutionItem::Pipeline(p) => Some(p),
                ExecutionItem::Code(_) => None,
            }))
    }

    /// All declarations in emission order, symbols substituted
    pub fn rendered_declarations(&self) -> CompileResult<Vec<String>> {
        self.declarations
            .iter()
            .chain(&self.declarations_later)
            .map(|d| d.render(&self.symbols))
            .collect()
    }

    fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.declarations
            .iter()
            .chain(&self.declarations_later)
            .chain(&self.initializers)
            .chain(self.scan_pipelines.iter().map(|p| &p.code))
            .chain(self.execution.iter().map(|item| match item {
                ExecutionItem::Pipeline(p) => &p.code,
                ExecutionItem::Code(c) => c,
            }))
            .chain(&self.flush)
    }

    /// Substitute every symbol and lay the program out as text
    pub fn render(&self) -> CompileResult<String> {
        let render_all = |frags: &mut dyn Iterator<Item = &Fragment>| -> CompileResult<String> {
            let mut out = String::new();
            for frag in frags {
                out.push_str(&frag.render(&self.symbols)?);
                out.push('\n');
            }
            Ok(out)
        };

        let mut out = String::new();
        out.push_str("// declarations\n");
        out.push_str(&render_all(&mut self.declarations.iter().chain(&self.declarations_later))?);
        out.push_str("\nvoid init() {\n");
        out.push_str(&render_all(&mut self.initializers.iter())?);
        out.push_str("}\n\nvoid query() {\n// scan pipelines\n");
        out.push_str(&render_all(&mut self.scan_pipelines.iter().map(|p| &p.code))?);
        out.push_str("// in-memory pipelines\n");
        out.push_str(&render_all(&mut self.execution.iter().map(|item| match item {
            ExecutionItem::Pipeline(p) => &p.code,
            ExecutionItem::Code(c) => c,
        }))?);
        for wait in &self.main_waits {
            out.push_str(wait);
            out.push('\n');
        }
        out.push_str("// flush\n");
        out.push_str(&render_all(&mut self.flush.iter())?);
        out.push_str("}\n");
        Ok(out)
    }
}

fn push_unique(list: &mut Vec<Fragment>, seen: &mut HashSet<Fragment>, frag: Fragment) {
    if seen.insert(frag.clone()) {
        list.push(frag);
    }
}

/// Stored temp and the pipelines that wrote its current contents
#[derive(Debug, Clone)]
struct TempRelation {
    relation: String,
    writers: Vec<String>,
}

/// Mutable state threaded through produce/consume
#[derive(Debug)]
pub struct CompileState {
    common_subexpression_elimination: bool,

    declarations: Vec<Fragment>,
    declarations_later: Vec<Fragment>,
    initializers: Vec<Fragment>,
    seen_declarations: HashSet<Fragment>,
    seen_initializers: HashSet<Fragment>,

    scan_pipelines: Vec<Pipeline>,
    execution: Vec<ExecutionItem>,
    flush: Vec<Fragment>,
    main_waits: Vec<String>,
    pipeline_count: usize,

    current: PipelineProperties,
    precode: Vec<Fragment>,
    /// Code run at the end of each open loop's body, innermost last
    loop_tails: Vec<Vec<Fragment>>,

    materialized: HashMap<MaterializationKey, (BTreeSet<String>, Materialized)>,
    scans: HashMap<SubexpressionKey, String>,
    tuple_defs: HashMap<String, TupleRef>,
    tuple_types: HashMap<Vec<DataType>, String>,
    stores: HashMap<String, StoreHandle>,
    temps: HashMap<String, TempRelation>,
    strings: HashMap<String, String>,

    symbols: SymbolTable,
    counter: usize,
}

impl Default for CompileState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CompileState {
    pub fn new(common_subexpression_elimination: bool) -> Self {
        CompileState {
            common_subexpression_elimination,
            declarations: Vec::new(),
            declarations_later: Vec::new(),
            initializers: Vec::new(),
            seen_declarations: HashSet::new(),
            seen_initializers: HashSet::new(),
            scan_pipelines: Vec::new(),
            execution: Vec::new(),
            flush: Vec::new(),
            main_waits: Vec::new(),
            pipeline_count: 0,
            current: PipelineProperties::default(),
            precode: Vec::new(),
            loop_tails: Vec::new(),
            materialized: HashMap::new(),
            scans: HashMap::new(),
            tuple_defs: HashMap::new(),
            tuple_types: HashMap::new(),
            stores: HashMap::new(),
            temps: HashMap::new(),
            strings: HashMap::new(),
            symbols: SymbolTable::default(),
            counter: 0,
        }
    }

    /// Fresh identifier `{prefix}_{n}`
    pub fn gensym(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}_{}", self.counter);
        self.counter += 1;
        name
    }

    // Declarations and initializers

    pub fn add_declaration(&mut self, decl: impl Into<Fragment>) {
        // both lists share one dedup set so a declaration is emitted at most once
        push_unique(&mut self.declarations, &mut self.seen_declarations, decl.into());
    }

    /// Declarations that reference names declared by regular declarations
    pub fn add_declaration_later(&mut self, decl: impl Into<Fragment>) {
        push_unique(&mut self.declarations_later, &mut self.seen_declarations, decl.into());
    }

    pub fn add_initializer(&mut self, init: impl Into<Fragment>) {
        push_unique(&mut self.initializers, &mut self.seen_initializers, init.into());
    }

    /// Tuple type for a column type list, declared on first use
    pub fn tuple_type(&mut self, scheme: &Scheme) -> String {
        let types = scheme.types();
        if let Some(name) = self.tuple_types.get(&types) {
            return name.clone();
        }
        let name = format!("tuple_{}", self.tuple_types.len());
        let fields: String = types
            .iter()
            .enumerate()
            .map(|(i, t)| format!("  {} f{i};\n", t.code_name()))
            .collect();
        self.add_declaration(format!("struct {name} {{\n{fields}}};"));
        self.tuple_types.insert(types, name.clone());
        name
    }

    /// Interned id constant for a string literal
    pub fn string_constant(&mut self, value: &str) -> String {
        if let Some(name) = self.strings.get(value) {
            return name.clone();
        }
        let name = self.gensym("str");
        self.add_declaration(format!("string_id {name};"));
        self.add_initializer(format!("{name} = string_index.string_lookup({value:?});"));
        self.strings.insert(value.to_string(), name.clone());
        name
    }

    pub fn new_tuple(&mut self, scheme: &Scheme) -> TupleRef {
        TupleRef {
            name: self.gensym("t"),
            type_name: self.tuple_type(scheme),
            scheme: scheme.clone(),
        }
    }

    // Symbols

    pub fn create_unresolved_symbol(&mut self) -> SymbolId {
        self.symbols.create()
    }

    pub fn resolve_symbol(&mut self, id: SymbolId, value: &str) {
        debug!(symbol = %id, value, "resolving symbol");
        self.symbols.resolve(id, value);
    }

    // Pipelines

    pub fn current_pipeline_id(&self) -> usize {
        self.pipeline_count
    }

    pub fn current_pipeline(&self) -> &PipelineProperties {
        &self.current
    }

    pub fn set_pipeline_kind(&mut self, kind: PipelineKind) {
        self.current.kind = Some(kind);
    }

    pub fn set_pipeline_source(&mut self, source: OperatorKind) {
        self.current.source = Some(source);
    }

    pub fn add_dependence(&mut self, sync: &str) {
        self.current.dependences.insert(sync.to_string());
    }

    /// Global completion event of the current pipeline
    pub fn global_sync(&self) -> CompileResult<String> {
        self.current.global_sync.clone().ok_or_else(|| {
            CompileError::InvalidPipeline(format!(
                "pipeline {} has no global sync",
                self.pipeline_count
            ))
        })
    }

    /// Name the current pipeline's task sync and wait for it at the end of the query
    pub fn get_pipeline_task_name(&mut self) -> String {
        let name = format!("p_task_{}", self.pipeline_count);
        self.current.sync = Some(name.clone());
        let wait = format!("{name}.wait();");
        if !self.main_waits.contains(&wait) {
            self.main_waits.push(wait);
        }
        name
    }

    /// Declare a completion event for tasks spawned by the current pipeline
    pub fn create_pipeline_synchronization(&mut self) -> String {
        let name = self.gensym("gce");
        self.add_declaration(format!("GlobalCompletionEvent {name}(true);"));
        self.current.global_sync = Some(name.clone());
        name
    }

    pub fn add_precode(&mut self, code: impl Into<Fragment>) {
        self.precode.push(code.into());
    }

    pub fn add_flush(&mut self, code: impl Into<Fragment>) {
        let code = code.into();
        if !self.flush.contains(&code) {
            self.flush.push(code);
        }
    }

    /// Straight-line code in the in-memory stream
    pub fn add_code(&mut self, code: impl Into<Fragment>) {
        self.execution.push(ExecutionItem::Code(code.into()));
    }

    /// Close the current pipeline around `body` and start a new one
    pub fn add_pipeline(&mut self, body: Fragment) -> CompileResult<()> {
        let props = std::mem::take(&mut self.current);
        let kind = props.kind.ok_or_else(|| {
            CompileError::InvalidPipeline(format!(
                "pipeline {} emitted without a kind",
                self.pipeline_count
            ))
        })?;

        let mut inner = Fragment::new();
        for dep in &props.dependences {
            inner.push_str(&format!("{dep}.wait();\n"));
        }
        inner.append(body);

        let wrapped = match &props.sync {
            Some(sync) => Fragment::from(format!("CompletionEvent {sync};\nspawn(&{sync}, [=] {{\n"))
                .then(inner)
                .text("\n});"),
            None => inner,
        };

        let mut code = Fragment::new();
        for pre in self.precode.drain(..) {
            code.append(pre);
            code.push_str("\n");
        }
        code.append(wrapped);

        let pipeline = Pipeline {
            id: self.pipeline_count,
            kind,
            sync: props.sync,
            global_sync: props.global_sync,
            dependences: props.dependences,
            source: props.source,
            code,
        };
        debug!(
            pipeline = pipeline.id,
            kind = ?pipeline.kind,
            dependences = ?pipeline.dependences,
            "emitting pipeline"
        );
        match kind {
            PipelineKind::Scan => self.scan_pipelines.push(pipeline),
            PipelineKind::InMemory => self.execution.push(ExecutionItem::Pipeline(pipeline)),
        }
        self.pipeline_count += 1;
        Ok(())
    }

    // Materialization cache

    pub fn lookup_expr(&self, key: &MaterializationKey) -> Option<Materialized> {
        if !self.common_subexpression_elimination {
            return None;
        }
        let found = self.materialized.get(key).map(|(_, m)| m.clone());
        debug!(hit = found.is_some(), "lookup subexpression");
        found
    }

    /// Cache `handle` under `key`; `reads` are the temps the subexpression scans
    pub fn save_expr(&mut self, key: MaterializationKey, reads: BTreeSet<String>, handle: Materialized) {
        debug!(structure = %handle.name, "saving subexpression");
        self.materialized.insert(key, (reads, handle));
    }

    pub fn lookup_scan(&self, key: &SubexpressionKey) -> Option<String> {
        if !self.common_subexpression_elimination {
            return None;
        }
        self.scans.get(key).cloned()
    }

    pub fn save_scan(&mut self, key: SubexpressionKey, relation: String) {
        self.scans.insert(key, relation);
    }

    pub fn lookup_tuple_def(&self, symbol: &str) -> Option<&TupleRef> {
        self.tuple_defs.get(symbol)
    }

    pub fn save_tuple_def(&mut self, symbol: &str, tuple: TupleRef) {
        self.tuple_defs.insert(symbol.to_string(), tuple);
    }

    // Stores and temps

    /// Relation a store writes, declared the first time `relation` is stored
    pub fn store_target(&mut self, relation: &str, declaration: impl Fn(&str, SymbolId) -> Fragment) -> StoreHandle {
        if let Some(handle) = self.stores.get(relation) {
            return handle.clone();
        }
        let handle = StoreHandle {
            relation: relation.to_string(),
            type_ref: self.symbols.create(),
        };
        self.add_declaration_later(declaration(relation, handle.type_ref));
        self.stores.insert(relation.to_string(), handle.clone());
        handle
    }

    /// Make a stored temp visible to later scans. `writers` are the syncs
    /// of the pipelines that filled it. Structures built from the temp's
    /// previous contents are no longer valid.
    pub fn register_temp(&mut self, name: &str, relation: &str, writers: Vec<String>) {
        self.temps.insert(
            name.to_string(),
            TempRelation {
                relation: relation.to_string(),
                writers,
            },
        );
        self.invalidate_readers_of(&BTreeSet::from([name.to_string()]));
    }

    pub fn temp_relation(&self, name: &str) -> Option<&str> {
        self.temps.get(name).map(|t| t.relation.as_str())
    }

    /// Syncs a reader of the temp must wait on
    pub fn temp_writers(&self, name: &str) -> &[String] {
        self.temps.get(name).map_or(&[], |t| t.writers.as_slice())
    }

    fn invalidate_readers_of(&mut self, names: &BTreeSet<String>) {
        let before = self.materialized.len();
        self.materialized.retain(|_, (reads, _)| reads.is_disjoint(names));
        if self.materialized.len() != before {
            debug!(temps = ?names, dropped = before - self.materialized.len(), "invalidated structures");
        }
    }

    // Loops

    /// Open a loop whose body assigns `assigned`. Structures built from
    /// those temps before the loop are stale from the second iteration on.
    pub fn enter_loop(&mut self, assigned: &BTreeSet<String>) {
        self.invalidate_readers_of(assigned);
        self.loop_tails.push(Vec::new());
    }

    /// Close the innermost loop, emitting its tail code
    pub fn exit_loop(&mut self) {
        if let Some(tail) = self.loop_tails.pop() {
            for code in tail {
                self.add_code(code);
            }
        }
    }

    pub fn in_loop(&self) -> bool {
        !self.loop_tails.is_empty()
    }

    /// Set up a structure: once in `init()`, or on every iteration when it
    /// is built inside a loop
    pub fn add_structure_initializer(&mut self, init: impl Into<Fragment>) {
        if self.in_loop() {
            self.add_code(init);
        } else {
            self.add_initializer(init);
        }
    }

    /// Release a structure: in the flush, or at the end of the iteration
    /// that set it up
    pub fn add_structure_release(&mut self, code: impl Into<Fragment>) {
        match self.loop_tails.last_mut() {
            Some(tail) => tail.push(code.into()),
            None => self.add_flush(code),
        }
    }

    /// Validate and hand over everything generated
    pub fn finish(self) -> CompileResult<CodeBundle> {
        if self.current != PipelineProperties::default() || !self.precode.is_empty() {
            return Err(CompileError::InvalidPipeline(format!(
                "pipeline {} was started but never emitted",
                self.pipeline_count
            )));
        }
        if !self.loop_tails.is_empty() {
            return Err(CompileError::InvalidPipeline(format!(
                "{} loop(s) left open",
                self.loop_tails.len()
            )));
        }

        let bundle = CodeBundle {
            declarations: self.declarations,
            declarations_later: self.declarations_later,
            initializers: self.initializers,
            scan_pipelines: self.scan_pipelines,
            execution: self.execution,
            flush: self.flush,
            main_waits: self.main_waits,
            symbols: self.symbols,
        };

        let syncs: HashSet<&str> = bundle.pipelines().filter_map(|p| p.sync.as_deref()).collect();
        for pipeline in bundle.pipelines() {
            if let Some(missing) = pipeline.dependences.iter().find(|d| !syncs.contains(d.as_str())) {
                return Err(CompileError::DanglingDependence {
                    pipeline: format!("p{}", pipeline.id),
                    sync: missing.clone(),
                });
            }
        }

        for frag in bundle.fragments() {
            if let Some(id) = frag.symbols().find(|id| !bundle.symbols.is_resolved(*id)) {
                return Err(CompileError::UnresolvedSymbol {
                    symbol: id.to_string(),
                });
            }
        }
        Ok(bundle)
    }
}
