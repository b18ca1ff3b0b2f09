//! Code generation tests: produce/consume output for each physical
//! operator, structure sharing and pipeline synchronization.

use ralc::codegen::{Fragment, PipelineKind};
use ralc::expression::BinaryOp;
use ralc::{
    compile, compile_plan, Aggregate, BuiltinAggregate, CodeBundle, CompileError, CompileState,
    DataType, Expression, JoinAlgorithm, Operator, OperatorKind, Optimizer, PipelinedAlgebra,
    Scheme, UdaDefinition,
};

fn ab() -> Scheme {
    Scheme::from_pairs(&[("a", DataType::Int64), ("b", DataType::Int64)])
}

fn scan(name: &str) -> Operator {
    Operator::scan(name, ab())
}

fn attr_eq(a: usize, b: usize) -> Expression {
    Expression::eq(Expression::attr(a), Expression::attr(b))
}

fn physical_with(plan: Operator, join: JoinAlgorithm) -> Operator {
    Optimizer::new()
        .optimize(plan, &PipelinedAlgebra::new(join), None)
        .unwrap()
}

fn physical(plan: Operator) -> Operator {
    physical_with(plan, JoinAlgorithm::Hash)
}

fn compile_all(plans: &[Operator], cse: bool) -> CodeBundle {
    let mut state = CompileState::new(cse);
    for plan in plans {
        compile_plan(&physical(plan.clone()), &mut state).unwrap();
    }
    state.finish().unwrap()
}

fn declarations_containing(bundle: &CodeBundle, needle: &str) -> usize {
    bundle
        .rendered_declarations()
        .unwrap()
        .iter()
        .filter(|d| d.contains(needle))
        .count()
}

fn assert_dependences_declared(bundle: &CodeBundle) {
    let syncs: Vec<&str> = bundle.pipelines().filter_map(|p| p.sync.as_deref()).collect();
    for pipeline in bundle.pipelines() {
        for dep in &pipeline.dependences {
            assert!(syncs.contains(&dep.as_str()), "p{} waits on {dep}", pipeline.id);
        }
    }
}

fn join_on_s(left: &str, left_key: usize) -> Operator {
    Operator::store(
        &format!("out_{left}"),
        Operator::join(attr_eq(left_key, 2), scan(left), scan("s")),
    )
}

#[test]
fn test_cse_shares_build_structure() {
    let bundle = compile_all(&[join_on_s("r", 1), join_on_s("t", 0)], true);
    assert_eq!(declarations_containing(&bundle, "MatchesDHT"), 1);
    assert_eq!(bundle.initializers.len(), 1);
    // s is scanned once for both joins
    let text = bundle.render().unwrap();
    assert_eq!(text.matches("readTuples").count(), 3);
    assert_dependences_declared(&bundle);
}

#[test]
fn test_cse_disabled_builds_twice() {
    let bundle = compile_all(&[join_on_s("r", 1), join_on_s("t", 0)], false);
    assert_eq!(declarations_containing(&bundle, "MatchesDHT"), 2);
}

#[test]
fn test_cse_requires_identical_key_columns() {
    let other_key = Operator::store(
        "out_t",
        Operator::join(attr_eq(0, 3), scan("t"), scan("s")),
    );
    let bundle = compile_all(&[join_on_s("r", 1), other_key], true);
    assert_eq!(declarations_containing(&bundle, "MatchesDHT"), 2);
}

#[test]
fn test_hash_join_probe_waits_for_build() {
    let bundle = compile_all(&[join_on_s("r", 1)], true);
    assert_eq!(bundle.scan_pipelines.len(), 2);

    let in_memory: Vec<_> = bundle
        .pipelines()
        .filter(|p| p.kind == PipelineKind::InMemory)
        .collect();
    assert_eq!(in_memory.len(), 2);
    let (build, probe) = (in_memory[0], in_memory[1]);
    let build_sync = build.sync.clone().unwrap();
    assert!(probe.dependences.contains(&build_sync));
    assert!(!bundle.main_waits.is_empty());

    let text = bundle.render().unwrap();
    assert!(text.contains("insert_async"));
    assert!(text.contains("lookup_iter"));
    assert!(text.contains(&format!("{build_sync}.wait();")));
}

#[test]
fn test_multi_column_hash_join_key() {
    let plan = Operator::store(
        "out",
        Operator::join(Expression::and(attr_eq(0, 3), attr_eq(1, 2)), scan("r"), scan("s")),
    );
    let bundle = compile_all(&[plan], true);
    assert_eq!(declarations_containing(&bundle, "std::tuple<int64, int64>"), 1);
}

#[test]
fn test_symmetric_join_resolves_both_types() {
    let plan = physical_with(
        Operator::store("out", Operator::join(attr_eq(1, 2), scan("r"), scan("s"))),
        JoinAlgorithm::SymmetricHash,
    );
    assert_eq!(plan.count(OperatorKind::SymmetricHashJoin), 1);
    let bundle = compile(&plan, true).unwrap();
    let text = bundle.render().unwrap();
    assert!(text.contains("DoubleDHT<int64, tuple_"));
    assert!(text.contains("insert_lookup_iter_left"));
    assert!(text.contains("insert_lookup_iter_right"));
    // no pipeline break: one in-memory pipeline per input
    assert_eq!(bundle.execution.len(), 2);
}

#[test]
fn test_symmetric_join_rejects_multiple_keys() {
    let plan = physical_with(
        Operator::store(
            "out",
            Operator::join(Expression::and(attr_eq(0, 3), attr_eq(1, 2)), scan("r"), scan("s")),
        ),
        JoinAlgorithm::SymmetricHash,
    );
    assert!(matches!(
        compile(&plan, true),
        Err(CompileError::UnsupportedCondition { ref operator, .. }) if operator == "SymmetricHashJoin"
    ));
}

#[test]
fn test_shuffle_join_reduce_pipeline() {
    let plan = physical_with(
        Operator::store("out", Operator::join(attr_eq(1, 2), scan("r"), scan("s"))),
        JoinAlgorithm::ShuffleHash,
    );
    let bundle = compile(&plan, true).unwrap();
    let text = bundle.render().unwrap();
    assert!(text.contains("allocateJoinReducers<int64, tuple_"));
    assert!(text.contains("emitIntermediateLeft"));
    assert!(text.contains("emitIntermediateRight"));
    assert!(text.contains("reduceExecute();"));
    assert!(text.contains("forall_results"));
    assert!(text.contains("freeJoinReducers"));

    let reduce = bundle
        .pipelines()
        .find(|p| p.source == Some(OperatorKind::ShuffleHashJoin))
        .unwrap();
    assert_eq!(reduce.dependences.len(), 2);
    assert_dependences_declared(&bundle);
}

#[test]
fn test_keyed_builtin_group_by() {
    let plan = Operator::store(
        "out",
        Operator::group_by(
            vec![Expression::attr(0)],
            vec![Aggregate::builtin(BuiltinAggregate::Sum, Expression::attr(1))],
            scan("r"),
        ),
    );
    let bundle = compile_all(&[plan], true);
    let text = bundle.render().unwrap();
    assert!(text.contains("DHT_symmetric<std::tuple<int64>, int64"));
    assert!(text.contains("Aggregates::SUM<int64, int64>"));
    assert!(text.contains("forall_entries"));
    assert_dependences_declared(&bundle);
}

#[test]
fn test_unkeyed_count_group_by() {
    let plan = Operator::store(
        "out",
        Operator::group_by(vec![], vec![Aggregate::count_all()], scan("r")),
    );
    let text = compile_all(&[plan], true).render().unwrap();
    assert!(text.contains("counter<int64>::create(0)"));
    assert!(text.contains("reduce<int64, counter, &get_count>"));
    assert!(text.contains("Aggregates::COUNTALL<int64, int64>"));
}

#[test]
fn test_unkeyed_min_starts_at_max_value() {
    let plan = Operator::store(
        "out",
        Operator::group_by(
            vec![],
            vec![Aggregate::builtin(BuiltinAggregate::Min, Expression::attr(1))],
            scan("r"),
        ),
    );
    let text = compile_all(&[plan], true).render().unwrap();
    assert!(text.contains("std::numeric_limits<int64>::max()"));
}

fn sum_of_squares() -> UdaDefinition {
    UdaDefinition {
        name: "sumsq".to_string(),
        state: Scheme::from_pairs(&[("acc", DataType::Int64)]),
        inits: vec![Expression::literal(0i64)],
        updates: vec![Expression::binary(
            BinaryOp::Add,
            Expression::state("acc"),
            Expression::binary(BinaryOp::Mul, Expression::attr(1), Expression::attr(1)),
        )],
        emit: Expression::state("acc"),
    }
}

#[test]
fn test_uda_group_by_declares_functions() {
    let plan = Operator::store(
        "out",
        Operator::group_by(
            vec![Expression::attr(0)],
            vec![Aggregate::Uda(sum_of_squares())],
            scan("r"),
        ),
    );
    let bundle = compile_all(&[plan], true);
    let declarations = bundle.rendered_declarations().unwrap();
    let functions: Vec<&String> = declarations.iter().filter(|d| d.contains(" sumsq_")).collect();
    assert_eq!(functions.len(), 2);
    assert!(functions.iter().any(|d| d.contains("_init() {")));
    assert!(functions.iter().any(|d| d.contains("_update(const ")));
    let text = bundle.render().unwrap();
    assert!(text.contains("(acc + ("));
    assert!(text.contains("->update<"));
}

#[test]
fn test_unkeyed_uda_uses_local_accumulators() {
    let plan = Operator::store(
        "out",
        Operator::group_by(vec![], vec![Aggregate::Uda(sum_of_squares())], scan("r")),
    );
    let text = compile_all(&[plan], true).render().unwrap();
    assert!(text.contains("symmetric_global_alloc<"));
    assert!(text.contains(".localize();"));
}

#[test]
fn test_mixed_aggregates_are_fatal() {
    let plan = physical(Operator::store(
        "out",
        Operator::group_by(
            vec![Expression::attr(0)],
            vec![Aggregate::count_all(), Aggregate::Uda(sum_of_squares())],
            scan("r"),
        ),
    ));
    match compile(&plan, true) {
        Err(CompileError::UnsupportedAggregates { aggregates }) => assert_eq!(aggregates.len(), 2),
        other => panic!("expected aggregate error, got {other:?}"),
    }
}

#[test]
fn test_temp_store_then_scan() {
    let mut state = CompileState::new(true);
    compile_plan(&physical(Operator::store_temp("x", scan("r"))), &mut state).unwrap();
    assert_eq!(state.temp_relation("x"), Some("temp_x"));
    compile_plan(
        &physical(Operator::store("out", Operator::scan_temp("x", ab()))),
        &mut state,
    )
    .unwrap();
    let text = state.finish().unwrap().render().unwrap();
    assert!(text.contains("temp_x_next.clear();"));
    assert!(text.contains("temp_x_next.append("));
    assert!(text.contains("std::swap(temp_x, temp_x_next);"));
    assert!(text.contains("// end scan over temp_x"));
}

#[test]
fn test_temp_reader_waits_for_writer() {
    let widen = |input| {
        Operator::apply(
            vec![
                ("a", Expression::attr(0)),
                ("b", Expression::binary(BinaryOp::Add, Expression::attr(0), Expression::attr(1))),
            ],
            input,
        )
    };
    let mut state = CompileState::new(true);
    compile_plan(&physical(Operator::store_temp("x", widen(scan("r")))), &mut state).unwrap();
    let writers = state.temp_writers("x").to_vec();
    assert_eq!(writers.len(), 1);
    compile_plan(
        &physical(Operator::store("out", widen(Operator::scan_temp("x", ab())))),
        &mut state,
    )
    .unwrap();
    let bundle = state.finish().unwrap();
    assert_dependences_declared(&bundle);

    let reader = bundle
        .pipelines()
        .find(|p| {
            p.code
                .render(&bundle.symbols)
                .unwrap()
                .contains("// end scan over temp_x")
        })
        .unwrap();
    assert!(reader.dependences.contains(&writers[0]));

    let text = bundle.render().unwrap();
    assert!(text.contains(&format!(
        "{}.wait();\nstd::swap(temp_x, temp_x_next);",
        writers[0]
    )));
}

#[test]
fn test_scan_of_unstored_temp_is_fatal() {
    let plan = physical(Operator::store("out", Operator::scan_temp("nope", ab())));
    assert!(matches!(
        compile(&plan, true),
        Err(CompileError::UndefinedVariable { ref variable, .. }) if variable == "nope"
    ));
}

#[test]
fn test_string_literal_becomes_constant() {
    let names = Scheme::from_pairs(&[("name", DataType::String)]);
    let plan = physical(Operator::store(
        "out",
        Operator::select(
            Expression::eq(Expression::attr(0), Expression::literal("alice")),
            Operator::scan("people", names),
        ),
    ));
    let bundle = compile(&plan, true).unwrap();
    assert_eq!(declarations_containing(&bundle, "string_id str_"), 1);
    assert!(bundle.render().unwrap().contains("string_lookup(\"alice\")"));
}

#[test]
fn test_unbound_symbol_is_fatal() {
    let mut state = CompileState::new(true);
    let id = state.create_unresolved_symbol();
    state.add_declaration(Fragment::from("typedef ").symbol(id).text(" T;"));
    assert!(matches!(
        state.finish(),
        Err(CompileError::UnresolvedSymbol { .. })
    ));
}

#[test]
fn test_union_all_feeds_one_store() {
    let plan = Operator::store("out", Operator::union_all(scan("r"), scan("s")));
    let bundle = compile_all(&[plan], true);
    assert_eq!(bundle.execution.len(), 2);
    let text = bundle.render().unwrap();
    assert_eq!(text.matches("result_out.push_back").count(), 2);
    assert_eq!(declarations_containing(&bundle, "result_out;"), 1);
}
