//! Substitution of logical operators by the pipelined target's
//! implementations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::algebra::{Operator, ScanSource, StoreTarget};
use crate::error::CompileResult;
use crate::rules::Rule;

/// Physical join used for every logical join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinAlgorithm {
    /// Build a hash table on the right input, probe with the left
    #[default]
    Hash,
    /// Both inputs build and probe as tuples arrive
    SymmetricHash,
    /// Both inputs are repartitioned on the key, then joined
    ShuffleHash,
}

impl fmt::Display for JoinAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinAlgorithm::Hash => write!(f, "hash"),
            JoinAlgorithm::SymmetricHash => write!(f, "symmetric_hash"),
            JoinAlgorithm::ShuffleHash => write!(f, "shuffle_hash"),
        }
    }
}

/// `Scan` and `ScanTemp` become a memory scan over a file scan
pub struct MemoryScanOfFileScan;

impl Rule for MemoryScanOfFileScan {
    fn name(&self) -> &str {
        "MemoryScanOfFileScan"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        let file_scan = match op {
            Operator::Scan { relation, scheme } => Operator::FileScan {
                source: ScanSource::Relation(relation),
                scheme,
            },
            Operator::ScanTemp { name, scheme } => Operator::FileScan {
                source: ScanSource::Temp(name),
                scheme,
            },
            other => return Ok(other),
        };
        Ok(Operator::MemoryScan {
            input: Box::new(file_scan),
        })
    }
}

/// Operators with exactly one pipelined implementation
pub struct OneToOne;

impl Rule for OneToOne {
    fn name(&self) -> &str {
        "OneToOne"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        Ok(match op {
            Operator::Select { condition, input } => Operator::PhysicalSelect { condition, input },
            Operator::Apply { emitters, input } => Operator::PhysicalApply { emitters, input },
            Operator::Project { columns, input } => Operator::PhysicalProject { columns, input },
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            } => Operator::HashGroupBy {
                grouping,
                aggregates,
                input,
            },
            // Union is lowered as a bag union; duplicates are not removed
            Operator::UnionAll { left, right } | Operator::Union { left, right } => {
                Operator::PhysicalUnionAll { left, right }
            }
            Operator::Store { relation, input } => Operator::PhysicalStore {
                target: StoreTarget::Relation(relation),
                input,
            },
            Operator::StoreTemp { name, input } => Operator::PhysicalStore {
                target: StoreTarget::Temp(name),
                input,
            },
            other => other,
        })
    }
}

/// Logical join to the configured physical join
pub struct JoinImplementation {
    pub algorithm: JoinAlgorithm,
}

impl Rule for JoinImplementation {
    fn name(&self) -> &str {
        "JoinImplementation"
    }

    fn fire(&self, op: Operator) -> CompileResult<Operator> {
        Ok(match op {
            Operator::Join {
                condition,
                left,
                right,
            } => match self.algorithm {
                JoinAlgorithm::Hash => Operator::HashJoin {
                    condition,
                    left,
                    right,
                },
                JoinAlgorithm::SymmetricHash => Operator::SymmetricHashJoin {
                    condition,
                    left,
                    right,
                },
                JoinAlgorithm::ShuffleHash => Operator::ShuffleHashJoin {
                    condition,
                    left,
                    right,
                },
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::OperatorKind;
    use crate::expression::Expression;
    use crate::scheme::{DataType, Scheme};

    fn scan() -> Operator {
        Operator::scan("r", Scheme::from_pairs(&[("a", DataType::Int64)]))
    }

    #[test]
    fn test_scan_becomes_memory_scan() {
        let out = MemoryScanOfFileScan.fire(scan()).unwrap();
        match out {
            Operator::MemoryScan { input } => assert!(matches!(
                *input,
                Operator::FileScan {
                    source: ScanSource::Relation(ref r),
                    ..
                } if r == "r"
            )),
            other => panic!("expected memory scan, got {other}"),
        }
    }

    #[test]
    fn test_union_lowered_to_bag_union() {
        let out = OneToOne.fire(Operator::union(scan(), scan())).unwrap();
        assert_eq!(out.kind(), OperatorKind::PhysicalUnionAll);
    }

    #[test]
    fn test_join_algorithm_choice() {
        let join = Operator::join(Expression::eq(Expression::attr(0), Expression::attr(1)), scan(), scan());
        for (algorithm, kind) in [
            (JoinAlgorithm::Hash, OperatorKind::HashJoin),
            (JoinAlgorithm::SymmetricHash, OperatorKind::SymmetricHashJoin),
            (JoinAlgorithm::ShuffleHash, OperatorKind::ShuffleHashJoin),
        ] {
            let out = JoinImplementation { algorithm }.fire(join.clone()).unwrap();
            assert_eq!(out.kind(), kind);
        }
    }

    #[test]
    fn test_join_algorithm_serde_names() {
        let parsed: JoinAlgorithm = serde_json::from_str("\"symmetric_hash\"").unwrap();
        assert_eq!(parsed, JoinAlgorithm::SymmetricHash);
        assert_eq!(JoinAlgorithm::ShuffleHash.to_string(), "shuffle_hash");
    }
}
