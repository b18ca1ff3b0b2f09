//! Program graph tests: construction, liveness, dead code elimination and
//! chaining over iterative programs.

use std::collections::{BTreeMap, BTreeSet};

use ralc::expression::BinaryOp;
use ralc::{Aggregate, Cfg, CompileError, DataType, Expression, Operator, ProgramItem, Scheme};

const POINTS: &str = "public:adhoc:points";

fn points() -> Scheme {
    Scheme::from_pairs(&[("id", DataType::Int64), ("x", DataType::Float64), ("y", DataType::Float64)])
}

fn scan() -> Operator {
    Operator::scan(POINTS, points())
}

fn var(name: &str) -> Operator {
    Operator::scan_temp(name, points())
}

fn assign(name: &str, plan: Operator) -> ProgramItem {
    ProgramItem::Assign {
        variable: name.to_string(),
        plan,
    }
}

fn store(plan: Operator) -> ProgramItem {
    ProgramItem::Sink {
        plan: Operator::store("OUTPUT", plan),
    }
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

fn ids(cfg: &Cfg) -> BTreeSet<usize> {
    cfg.node_ids().into_iter().collect()
}

/// Point = SCAN(points);
/// DO
///   Big = [FROM Point WHERE x * y > 100 EMIT *];
///   Continue = [FROM Big, Point EMIT COUNT(*) > 0 AS cnt];
/// WHILE Continue;
/// STORE(Big, OUTPUT);
fn big_points_program() -> Vec<ProgramItem> {
    let big = Operator::select(
        Expression::binary(
            BinaryOp::Gt,
            Expression::binary(BinaryOp::Mul, Expression::attr(1), Expression::attr(2)),
            Expression::literal(100.0),
        ),
        var("Point"),
    );
    let count = Operator::group_by(
        vec![],
        vec![Aggregate::count_all()],
        Operator::cross_product(var("Big"), var("Point")),
    );
    let cont = Operator::apply(
        vec![(
            "cnt",
            Expression::binary(BinaryOp::Gt, Expression::attr(0), Expression::literal(0i64)),
        )],
        count,
    );
    vec![
        assign("Point", scan()),
        ProgramItem::DoWhile {
            body: vec![assign("Big", big), assign("Continue", cont)],
            condition: Operator::scan_temp(
                "Continue",
                Scheme::from_pairs(&[("cnt", DataType::Bool)]),
            ),
        },
        store(var("Big")),
    ]
}

#[test]
fn test_cfg_construction() {
    let cfg = Cfg::from_program(&big_points_program());
    assert_eq!(cfg.len(), 5);
    assert_eq!(cfg.edges(), vec![(0, 1), (1, 2), (2, 3), (3, 1), (3, 4)]);

    let expected: Vec<(Option<&str>, BTreeSet<String>)> = vec![
        (Some("Point"), set(&[])),
        (Some("Big"), set(&["Point"])),
        (Some("Continue"), set(&["Big", "Point"])),
        (None, set(&["Continue"])),
        (None, set(&["Big"])),
    ];
    for (id, (def, uses)) in expected.into_iter().enumerate() {
        let node = cfg.node(id).unwrap();
        assert_eq!(node.def_var.as_deref(), def, "def of node {id}");
        assert_eq!(node.uses, uses, "uses of node {id}");
    }
    assert_eq!(cfg.node(3).unwrap().closes_loop, Some(0));
}

#[test]
fn test_liveness() {
    let cfg = Cfg::from_program(&big_points_program());
    let liveness = cfg.compute_liveness();

    let live_out: BTreeMap<usize, BTreeSet<String>> = BTreeMap::from([
        (0, set(&["Point"])),
        (1, set(&["Point", "Big"])),
        (2, set(&["Continue", "Big", "Point"])),
        (3, set(&["Big", "Point"])),
        (4, set(&[])),
    ]);
    let live_in: BTreeMap<usize, BTreeSet<String>> = BTreeMap::from([
        (0, set(&[])),
        (1, set(&["Point"])),
        (2, set(&["Big", "Point"])),
        (3, set(&["Big", "Point", "Continue"])),
        (4, set(&["Big"])),
    ]);
    assert_eq!(liveness.live_out, live_out);
    assert_eq!(liveness.live_in, live_in);
}

#[test]
fn test_dead_code_elimination() {
    // two unused branches hang off A and B; only C's chain reaches the sink
    let program = vec![
        assign("A", scan()),
        assign("B", scan()),
        assign("C", scan()),
        assign("D", Operator::distinct(var("A"))),
        assign("E", Operator::union_all(var("A"), var("B"))),
        assign("F", Operator::distinct(var("E"))),
        assign("G", Operator::distinct(var("C"))),
        assign("H", Operator::distinct(var("G"))),
        store(var("H")),
    ];
    let mut cfg = Cfg::from_program(&program);
    assert_eq!(ids(&cfg), (0..9).collect());

    assert_eq!(cfg.dead_code_elimination(), 5);
    assert_eq!(ids(&cfg), BTreeSet::from([2, 6, 7, 8]));
    assert_eq!(cfg.edges(), vec![(2, 6), (6, 7), (7, 8)]);
}

#[test]
fn test_chaining() {
    let program = vec![
        assign("A", scan()),
        assign("B", scan()),
        assign("C", Operator::union_all(var("A"), var("B"))),
        assign("D", Operator::distinct(var("C"))),
        assign("E", scan()),
        assign("F", Operator::difference(var("E"), var("D"))),
        assign("G", Operator::distinct(var("F"))),
        store(var("G")),
    ];
    let mut cfg = Cfg::from_program(&program);
    assert_eq!(cfg.len(), 8);

    assert_eq!(cfg.apply_chaining().unwrap(), 7);
    assert_eq!(cfg.node_ids(), vec![7]);
    let node = cfg.node(7).unwrap();
    assert!(node.uses.is_empty());
    assert_eq!(node.plan.count(ralc::OperatorKind::Scan), 3);
    assert_eq!(node.plan.count(ralc::OperatorKind::ScanTemp), 0);
}

#[test]
fn test_chaining_variable_reuse() {
    let join = Operator::project(
        vec![3, 4, 5],
        Operator::join(
            Expression::eq(Expression::attr(1), Expression::attr(5)),
            var("X"),
            var("Y"),
        ),
    );
    let program = vec![
        assign("X", scan()),
        assign("Y", scan()),
        assign("X", join),
        assign("X", Operator::distinct(var("X"))),
        store(var("X")),
    ];
    let mut cfg = Cfg::from_program(&program);
    assert_eq!(cfg.len(), 5);

    cfg.apply_chaining().unwrap();
    assert_eq!(cfg.node_ids(), vec![4]);
    assert!(cfg.node(4).unwrap().uses.is_empty());
}

#[test]
fn test_chaining_after_dead_code_elimination() {
    let program = vec![
        assign("Q", Operator::distinct(scan())),
        ProgramItem::DoWhile {
            body: vec![
                assign("A", scan()),
                assign("B", scan()),
                assign("P", Operator::distinct(var("A"))),
                assign("C", Operator::difference(var("A"), var("B"))),
                assign(
                    "Continue",
                    Operator::group_by(vec![], vec![Aggregate::count_all()], var("C")),
                ),
            ],
            condition: Operator::scan_temp(
                "Continue",
                Scheme::from_pairs(&[("count", DataType::Int64)]),
            ),
        },
        store(var("C")),
        assign("X", scan()),
    ];
    let mut cfg = Cfg::from_program(&program);
    assert_eq!(cfg.len(), 9);

    cfg.dead_code_elimination();
    assert_eq!(ids(&cfg), BTreeSet::from([1, 2, 4, 5, 6, 7]));

    cfg.apply_chaining().unwrap();
    assert_eq!(ids(&cfg), BTreeSet::from([4, 6, 7]));
    // the loop test now computes the count itself
    assert_eq!(cfg.node(6).unwrap().uses, set(&["C"]));
    assert!(cfg.edges().contains(&(6, 4)));
}

#[test]
fn test_reaching_definitions_across_loop() {
    let program = vec![
        assign("x", scan()),
        ProgramItem::DoWhile {
            body: vec![assign("x", Operator::distinct(var("x")))],
            condition: var("x"),
        },
        store(var("x")),
    ];
    let cfg = Cfg::from_program(&program);
    let reaching = cfg.reaching_definitions();
    assert_eq!(reaching.reaching(1, "x"), &BTreeSet::from([0, 1]));
    assert_eq!(reaching.reaching(3, "x"), &BTreeSet::from([1]));
}

#[test]
fn test_validation_rejects_use_before_definition() {
    let program = vec![
        ProgramItem::DoWhile {
            body: vec![assign("y", Operator::distinct(var("x"))), assign("x", scan())],
            condition: var("y"),
        },
        store(var("x")),
    ];
    let cfg = Cfg::from_program(&program);
    let err = cfg.validate().unwrap_err();
    assert!(matches!(err, CompileError::UndefinedVariable { ref variable, .. } if variable == "x"));
}
