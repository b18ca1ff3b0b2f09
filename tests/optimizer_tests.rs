//! Optimizer Tests
//!
//! Whole-plan optimization against the pipelined target, checked both
//! structurally (operator counts) and by evaluating the result.

use ralc::expression::BinaryOp;
use ralc::fakedb::same_bag;
use ralc::{
    CompileError, DataType, Expression, FakeDb, JoinAlgorithm, LogicalAlgebra, Operator,
    OperatorKind, Optimizer, PipelinedAlgebra, Scheme, Tuple, Value,
};

const X: &str = "public:adhoc:X";
const Y: &str = "public:adhoc:Y";

fn x_scheme() -> Scheme {
    Scheme::from_pairs(&[("a", DataType::Int64), ("b", DataType::Int64), ("c", DataType::Int64)])
}

fn y_scheme() -> Scheme {
    Scheme::from_pairs(&[("d", DataType::Int64), ("e", DataType::Int64), ("f", DataType::Int64)])
}

fn rows(seed: i64) -> Vec<Tuple> {
    (0..30)
        .map(|i| {
            vec![
                Value::Int((i * 7 + seed) % 20),
                Value::Int((i * 13 + seed * 3) % 20),
                Value::Int((i * 3 + seed * 5) % 20),
            ]
        })
        .collect()
}

fn db() -> FakeDb {
    let mut db = FakeDb::new();
    db.ingest(X, x_scheme(), rows(1));
    db.ingest(Y, y_scheme(), rows(6));
    db
}

fn cross() -> Operator {
    Operator::cross_product(Operator::scan(X, x_scheme()), Operator::scan(Y, y_scheme()))
}

fn named(op: BinaryOp, a: &str, b: &str) -> Expression {
    Expression::binary(op, Expression::named(a), Expression::named(b))
}

fn physical(plan: Operator) -> Operator {
    Optimizer::new()
        .optimize(plan, &PipelinedAlgebra::default(), None)
        .unwrap()
}

fn brute_force(filter: impl Fn(&[i64]) -> bool) -> Vec<Tuple> {
    let mut out = Vec::new();
    for l in rows(1) {
        for r in rows(6) {
            let t: Tuple = l.iter().chain(r.iter()).cloned().collect();
            let ints: Vec<i64> = t
                .iter()
                .map(|v| match v {
                    Value::Int(i) => *i,
                    _ => 0,
                })
                .collect();
            if filter(&ints) {
                out.push(t);
            }
        }
    }
    out
}

fn select_conjuncts(plan: &Operator) -> usize {
    let mut count = 0;
    plan.visit(&mut |op| {
        if let Operator::PhysicalSelect { condition, .. } = op {
            count += condition.conjuncts().len();
        }
    });
    count
}

fn run(plan: &Operator) -> Vec<Tuple> {
    let mut db = db();
    db.evaluate(plan).unwrap();
    db.temp("OUTPUT").unwrap().to_vec()
}

#[test]
fn test_merge_selects() {
    let plan = Operator::store_temp(
        "OUTPUT",
        Operator::select(
            named(BinaryOp::Le, "e", "f"),
            Operator::select(
                named(BinaryOp::Eq, "c", "d"),
                Operator::select(named(BinaryOp::Gt, "a", "b"), cross()),
            ),
        ),
    );
    assert_eq!(plan.count(OperatorKind::Select), 3);
    assert_eq!(plan.count(OperatorKind::CrossProduct), 1);

    let pp = physical(plan);
    assert_eq!(pp.count(OperatorKind::PhysicalSelect), 1);
    assert_eq!(pp.count(OperatorKind::CrossProduct), 0);
    assert_eq!(pp.count(OperatorKind::HashJoin), 1);

    let expected = brute_force(|t| t[0] > t[1] && t[4] <= t[5] && t[2] == t[3]);
    assert!(!expected.is_empty());
    assert!(same_bag(&run(&pp), &expected));
}

#[test]
fn test_extract_join() {
    let condition = Expression::and(
        named(BinaryOp::Le, "e", "f"),
        Expression::and(named(BinaryOp::Eq, "c", "d"), named(BinaryOp::Gt, "a", "b")),
    );
    let plan = Operator::store_temp("OUTPUT", Operator::select(condition, cross()));

    let pp = physical(plan);
    assert_eq!(pp.count(OperatorKind::PhysicalSelect), 1);
    assert_eq!(pp.count(OperatorKind::CrossProduct), 0);
    // the equality went into the join
    assert_eq!(select_conjuncts(&pp), 2);

    let expected = brute_force(|t| t[0] > t[1] && t[4] <= t[5] && t[2] == t[3]);
    assert!(same_bag(&run(&pp), &expected));
}

#[test]
fn test_multi_condition_join() {
    let condition = Expression::and(named(BinaryOp::Eq, "c", "d"), named(BinaryOp::Eq, "a", "f"));
    let plan = Operator::store_temp("OUTPUT", Operator::select(condition, cross()));

    let pp = physical(plan);
    assert_eq!(pp.count(OperatorKind::CrossProduct), 0);
    assert_eq!(pp.count(OperatorKind::PhysicalSelect), 0);

    let expected = brute_force(|t| t[2] == t[3] && t[0] == t[5]);
    assert!(!expected.is_empty());
    assert!(same_bag(&run(&pp), &expected));
}

#[test]
fn test_multiway_join() {
    let edges: Vec<(i64, i64)> = vec![(1, 2), (2, 3), (1, 2), (3, 4)];
    let z_scheme = Scheme::from_pairs(&[("src", DataType::Int64), ("dst", DataType::Int64)]);
    let mut db = FakeDb::new();
    db.ingest(
        "public:adhoc:Z",
        z_scheme.clone(),
        edges.iter().map(|(s, d)| vec![Value::Int(*s), Value::Int(*d)]).collect(),
    );

    let z = || Operator::scan("public:adhoc:Z", z_scheme.clone());
    let attr_eq = |a, b| Expression::eq(Expression::attr(a), Expression::attr(b));
    let plan = Operator::store_temp(
        "OUTPUT",
        Operator::apply(
            vec![("x", Expression::attr(0)), ("y", Expression::attr(5))],
            Operator::select(
                Expression::and(attr_eq(1, 2), attr_eq(3, 4)),
                Operator::cross_product(Operator::cross_product(z(), z()), z()),
            ),
        ),
    );
    assert_eq!(plan.count(OperatorKind::CrossProduct), 2);

    let pp = physical(plan);
    assert_eq!(pp.count(OperatorKind::CrossProduct), 0);
    assert_eq!(pp.count(OperatorKind::HashJoin), 2);

    let mut expected = Vec::new();
    for (s1, d1) in &edges {
        for (s2, d2) in &edges {
            for (s3, d3) in &edges {
                if d1 == s2 && d2 == s3 {
                    expected.push(vec![Value::Int(*s1), Value::Int(*d3)]);
                }
            }
        }
    }
    db.evaluate(&pp).unwrap();
    assert!(same_bag(db.temp("OUTPUT").unwrap(), &expected));
}

#[test]
fn test_join_algorithm_is_a_target_parameter() {
    let condition = named(BinaryOp::Eq, "c", "d");
    for (algorithm, kind) in [
        (JoinAlgorithm::Hash, OperatorKind::HashJoin),
        (JoinAlgorithm::SymmetricHash, OperatorKind::SymmetricHashJoin),
        (JoinAlgorithm::ShuffleHash, OperatorKind::ShuffleHashJoin),
    ] {
        let pp = Optimizer::new()
            .optimize(
                Operator::select(condition.clone(), cross()),
                &PipelinedAlgebra::new(algorithm),
                None,
            )
            .unwrap();
        assert_eq!(pp.count(kind), 1);
        assert!(pp.is_physical());
    }
}

#[test]
fn test_logical_target_keeps_logical_operators() {
    let plan = Operator::select(named(BinaryOp::Eq, "c", "d"), cross());
    let out = Optimizer::new().optimize(plan, &LogicalAlgebra, None).unwrap();
    assert_eq!(out.kind(), OperatorKind::Join);
    assert!(!out.is_physical());
}

#[test]
fn test_fixpoint_cap_is_fatal() {
    let plan = Operator::select(
        named(BinaryOp::Gt, "a", "b"),
        Operator::select(named(BinaryOp::Eq, "c", "d"), cross()),
    );
    let err = Optimizer::with_max_iterations(1)
        .optimize(plan, &PipelinedAlgebra::default(), None)
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::FixpointNotReached {
            group: "push_select".to_string(),
            iterations: 1
        }
    );
}

#[test]
fn test_unknown_attribute_is_reported() {
    let plan = Operator::select(named(BinaryOp::Eq, "c", "zz"), cross());
    let err = Optimizer::new()
        .optimize(plan, &PipelinedAlgebra::default(), None)
        .unwrap_err();
    assert!(matches!(err, CompileError::UnknownAttribute { ref name, .. } if name == "zz"));
}

#[test]
fn test_catalog_scheme_mismatch() {
    let db = db();
    let wrong = Operator::scan(X, Scheme::from_pairs(&[("a", DataType::Float64)]));
    let err = Optimizer::new()
        .optimize(wrong, &PipelinedAlgebra::default(), Some(&db))
        .unwrap_err();
    assert!(matches!(err, CompileError::SchemeMismatch { ref relation, .. } if relation == X));
}

/// `Union` is lowered to a bag union, so duplicates survive the physical
/// plan even though the logical operator removes them.
#[test]
fn test_union_lowers_to_bag_union() {
    let plan = Operator::store_temp(
        "OUTPUT",
        Operator::union(Operator::scan(X, x_scheme()), Operator::scan(X, x_scheme())),
    );
    let pp = physical(plan.clone());
    assert_eq!(pp.count(OperatorKind::PhysicalUnionAll), 1);

    let logical = run(&plan);
    let lowered = run(&pp);
    assert_eq!(lowered.len(), 2 * rows(1).len());
    assert!(logical.len() < lowered.len());
}
