//! # Algebra IR
//!
//! Immutable operator trees. Logical kinds come out of a front end;
//! physical kinds are the pipelined target's implementations chosen by
//! [`crate::optimizer`]. Rewrites always build new nodes, nodes are never
//! mutated in place.
//!
//! ```text
//! Logical Operator -> [Rule groups] -> Physical Operator -> [Codegen] -> CodeBundle
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{CompileError, CompileResult};
use crate::expression::{Aggregate, AttributeRef, Expression};
use crate::scheme::Scheme;

/// Where a physical file scan reads from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanSource {
    /// Persistent relation known to the catalog
    Relation(String),
    /// Program variable held in memory
    Temp(String),
}

/// Where a physical store writes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreTarget {
    Relation(String),
    Temp(String),
}

/// Operator tree node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    // Logical operators
    Scan {
        relation: String,
        scheme: Scheme,
    },
    ScanTemp {
        name: String,
        scheme: Scheme,
    },
    Select {
        condition: Expression,
        input: Box<Operator>,
    },
    Apply {
        emitters: Vec<(String, Expression)>,
        input: Box<Operator>,
    },
    Project {
        columns: Vec<usize>,
        input: Box<Operator>,
    },
    Join {
        condition: Expression,
        left: Box<Operator>,
        right: Box<Operator>,
    },
    CrossProduct {
        left: Box<Operator>,
        right: Box<Operator>,
    },
    GroupBy {
        grouping: Vec<Expression>,
        aggregates: Vec<Aggregate>,
        input: Box<Operator>,
    },
    Distinct {
        input: Box<Operator>,
    },
    UnionAll {
        left: Box<Operator>,
        right: Box<Operator>,
    },
    Union {
        left: Box<Operator>,
        right: Box<Operator>,
    },
    Difference {
        left: Box<Operator>,
        right: Box<Operator>,
    },
    Store {
        relation: String,
        input: Box<Operator>,
    },
    StoreTemp {
        name: String,
        input: Box<Operator>,
    },
    Sequence {
        children: Vec<Operator>,
    },

    // Pipelined physical operators
    FileScan {
        source: ScanSource,
        scheme: Scheme,
    },
    MemoryScan {
        input: Box<Operator>,
    },
    PhysicalSelect {
        condition: Expression,
        input: Box<Operator>,
    },
    PhysicalApply {
        emitters: Vec<(String, Expression)>,
        input: Box<Operator>,
    },
    PhysicalProject {
        columns: Vec<usize>,
        input: Box<Operator>,
    },
    HashJoin {
        condition: Expression,
        left: Box<Operator>,
        right: Box<Operator>,
    },
    SymmetricHashJoin {
        condition: Expression,
        left: Box<Operator>,
        right: Box<Operator>,
    },
    ShuffleHashJoin {
        condition: Expression,
        left: Box<Operator>,
        right: Box<Operator>,
    },
    HashGroupBy {
        grouping: Vec<Expression>,
        aggregates: Vec<Aggregate>,
        input: Box<Operator>,
    },
    PhysicalUnionAll {
        left: Box<Operator>,
        right: Box<Operator>,
    },
    PhysicalStore {
        target: StoreTarget,
        input: Box<Operator>,
    },
}

/// Discriminant of [`Operator`], used for counting and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorKind {
    Scan,
    ScanTemp,
    Select,
    Apply,
    Project,
    Join,
    CrossProduct,
    GroupBy,
    Distinct,
    UnionAll,
    Union,
    Difference,
    Store,
    StoreTemp,
    Sequence,
    FileScan,
    MemoryScan,
    PhysicalSelect,
    PhysicalApply,
    PhysicalProject,
    HashJoin,
    SymmetricHashJoin,
    ShuffleHashJoin,
    HashGroupBy,
    PhysicalUnionAll,
    PhysicalStore,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Structural identity of a subexpression with attribute names stripped.
///
/// Two subtrees with the same key compute the same bag of tuples, so a
/// structure materialized for one can serve the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubexpressionKey(String);

impl fmt::Display for SubexpressionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn boxed(op: Operator) -> Box<Operator> {
    Box::new(op)
}

impl Operator {
    pub fn scan(relation: &str, scheme: Scheme) -> Self {
        Operator::Scan {
            relation: relation.to_string(),
            scheme,
        }
    }

    pub fn scan_temp(name: &str, scheme: Scheme) -> Self {
        Operator::ScanTemp {
            name: name.to_string(),
            scheme,
        }
    }

    pub fn select(condition: Expression, input: Operator) -> Self {
        Operator::Select {
            condition,
            input: boxed(input),
        }
    }

    pub fn apply(emitters: Vec<(&str, Expression)>, input: Operator) -> Self {
        Operator::Apply {
            emitters: emitters
                .into_iter()
                .map(|(n, e)| (n.to_string(), e))
                .collect(),
            input: boxed(input),
        }
    }

    pub fn project(columns: Vec<usize>, input: Operator) -> Self {
        Operator::Project {
            columns,
            input: boxed(input),
        }
    }

    pub fn join(condition: Expression, left: Operator, right: Operator) -> Self {
        Operator::Join {
            condition,
            left: boxed(left),
            right: boxed(right),
        }
    }

    pub fn cross_product(left: Operator, right: Operator) -> Self {
        Operator::CrossProduct {
            left: boxed(left),
            right: boxed(right),
        }
    }

    pub fn group_by(grouping: Vec<Expression>, aggregates: Vec<Aggregate>, input: Operator) -> Self {
        Operator::GroupBy {
            grouping,
            aggregates,
            input: boxed(input),
        }
    }

    pub fn distinct(input: Operator) -> Self {
        Operator::Distinct { input: boxed(input) }
    }

    pub fn union_all(left: Operator, right: Operator) -> Self {
        Operator::UnionAll {
            left: boxed(left),
            right: boxed(right),
        }
    }

    pub fn union(left: Operator, right: Operator) -> Self {
        Operator::Union {
            left: boxed(left),
            right: boxed(right),
        }
    }

    pub fn difference(left: Operator, right: Operator) -> Self {
        Operator::Difference {
            left: boxed(left),
            right: boxed(right),
        }
    }

    pub fn store(relation: &str, input: Operator) -> Self {
        Operator::Store {
            relation: relation.to_string(),
            input: boxed(input),
        }
    }

    pub fn store_temp(name: &str, input: Operator) -> Self {
        Operator::StoreTemp {
            name: name.to_string(),
            input: boxed(input),
        }
    }

    pub fn kind(&self) -> OperatorKind {
        match self {
            Operator::Scan { .. } => OperatorKind::Scan,
            Operator::ScanTemp { .. } => OperatorKind::ScanTemp,
            Operator::Select { .. } => OperatorKind::Select,
            Operator::Apply { .. } => OperatorKind::Apply,
            Operator::Project { .. } => OperatorKind::Project,
            Operator::Join { .. } => OperatorKind::Join,
            Operator::CrossProduct { .. } => OperatorKind::CrossProduct,
            Operator::GroupBy { .. } => OperatorKind::GroupBy,
            Operator::Distinct { .. } => OperatorKind::Distinct,
            Operator::UnionAll { .. } => OperatorKind::UnionAll,
            Operator::Union { .. } => OperatorKind::Union,
            Operator::Difference { .. } => OperatorKind::Difference,
            Operator::Store { .. } => OperatorKind::Store,
            Operator::StoreTemp { .. } => OperatorKind::StoreTemp,
            Operator::Sequence { .. } => OperatorKind::Sequence,
            Operator::FileScan { .. } => OperatorKind::FileScan,
            Operator::MemoryScan { .. } => OperatorKind::MemoryScan,
            Operator::PhysicalSelect { .. } => OperatorKind::PhysicalSelect,
            Operator::PhysicalApply { .. } => OperatorKind::PhysicalApply,
            Operator::PhysicalProject { .. } => OperatorKind::PhysicalProject,
            Operator::HashJoin { .. } => OperatorKind::HashJoin,
            Operator::SymmetricHashJoin { .. } => OperatorKind::SymmetricHashJoin,
            Operator::ShuffleHashJoin { .. } => OperatorKind::ShuffleHashJoin,
            Operator::HashGroupBy { .. } => OperatorKind::HashGroupBy,
            Operator::PhysicalUnionAll { .. } => OperatorKind::PhysicalUnionAll,
            Operator::PhysicalStore { .. } => OperatorKind::PhysicalStore,
        }
    }

    /// True for implementations of the pipelined target
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            Operator::FileScan { .. }
                | Operator::MemoryScan { .. }
                | Operator::PhysicalSelect { .. }
                | Operator::PhysicalApply { .. }
                | Operator::PhysicalProject { .. }
                | Operator::HashJoin { .. }
                | Operator::SymmetricHashJoin { .. }
                | Operator::ShuffleHashJoin { .. }
                | Operator::HashGroupBy { .. }
                | Operator::PhysicalUnionAll { .. }
                | Operator::PhysicalStore { .. }
        )
    }

    pub fn is_join(&self) -> bool {
        matches!(
            self,
            Operator::Join { .. }
                | Operator::HashJoin { .. }
                | Operator::SymmetricHashJoin { .. }
                | Operator::ShuffleHashJoin { .. }
        )
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Operator::Select { .. } | Operator::PhysicalSelect { .. })
    }

    /// Ordered children
    pub fn children(&self) -> Vec<&Operator> {
        match self {
            Operator::Scan { .. } | Operator::ScanTemp { .. } | Operator::FileScan { .. } => {
                vec![]
            }
            Operator::Select { input, .. }
            | Operator::Apply { input, .. }
            | Operator::Project { input, .. }
            | Operator::GroupBy { input, .. }
            | Operator::Distinct { input }
            | Operator::Store { input, .. }
            | Operator::StoreTemp { input, .. }
            | Operator::MemoryScan { input }
            | Operator::PhysicalSelect { input, .. }
            | Operator::PhysicalApply { input, .. }
            | Operator::PhysicalProject { input, .. }
            | Operator::HashGroupBy { input, .. }
            | Operator::PhysicalStore { input, .. } => vec![input],
            Operator::Join { left, right, .. }
            | Operator::CrossProduct { left, right }
            | Operator::UnionAll { left, right }
            | Operator::Union { left, right }
            | Operator::Difference { left, right }
            | Operator::HashJoin { left, right, .. }
            | Operator::SymmetricHashJoin { left, right, .. }
            | Operator::ShuffleHashJoin { left, right, .. }
            | Operator::PhysicalUnionAll { left, right } => vec![left, right],
            Operator::Sequence { children } => children.iter().collect(),
        }
    }

    /// Rebuild this node with every child replaced by `f(child)`
    pub fn map_children<F>(self, mut f: F) -> CompileResult<Operator>
    where
        F: FnMut(Operator) -> CompileResult<Operator>,
    {
        let mut one = |input: Box<Operator>| f(*input).map(boxed);
        Ok(match self {
            leaf @ (Operator::Scan { .. } | Operator::ScanTemp { .. } | Operator::FileScan { .. }) => leaf,
            Operator::Select { condition, input } => Operator::Select {
                condition,
                input: one(input)?,
            },
            Operator::Apply { emitters, input } => Operator::Apply {
                emitters,
                input: one(input)?,
            },
            Operator::Project { columns, input } => Operator::Project {
                columns,
                input: one(input)?,
            },
            Operator::Join {
                condition,
                left,
                right,
            } => Operator::Join {
                condition,
                left: one(left)?,
                right: one(right)?,
            },
            Operator::CrossProduct { left, right } => Operator::CrossProduct {
                left: one(left)?,
                right: one(right)?,
            },
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            } => Operator::GroupBy {
                grouping,
                aggregates,
                input: one(input)?,
            },
            Operator::Distinct { input } => Operator::Distinct { input: one(input)? },
            Operator::UnionAll { left, right } => Operator::UnionAll {
                left: one(left)?,
                right: one(right)?,
            },
            Operator::Union { left, right } => Operator::Union {
                left: one(left)?,
                right: one(right)?,
            },
            Operator::Difference { left, right } => Operator::Difference {
                left: one(left)?,
                right: one(right)?,
            },
            Operator::Store { relation, input } => Operator::Store {
                relation,
                input: one(input)?,
            },
            Operator::StoreTemp { name, input } => Operator::StoreTemp {
                name,
                input: one(input)?,
            },
            Operator::Sequence { children } => Operator::Sequence {
                children: children
                    .into_iter()
                    .map(|c| one(boxed(c)).map(|b| *b))
                    .collect::<CompileResult<_>>()?,
            },
            Operator::MemoryScan { input } => Operator::MemoryScan { input: one(input)? },
            Operator::PhysicalSelect { condition, input } => Operator::PhysicalSelect {
                condition,
                input: one(input)?,
            },
            Operator::PhysicalApply { emitters, input } => Operator::PhysicalApply {
                emitters,
                input: one(input)?,
            },
            Operator::PhysicalProject { columns, input } => Operator::PhysicalProject {
                columns,
                input: one(input)?,
            },
            Operator::HashJoin {
                condition,
                left,
                right,
            } => Operator::HashJoin {
                condition,
                left: one(left)?,
                right: one(right)?,
            },
            Operator::SymmetricHashJoin {
                condition,
                left,
                right,
            } => Operator::SymmetricHashJoin {
                condition,
                left: one(left)?,
                right: one(right)?,
            },
            Operator::ShuffleHashJoin {
                condition,
                left,
                right,
            } => Operator::ShuffleHashJoin {
                condition,
                left: one(left)?,
                right: one(right)?,
            },
            Operator::HashGroupBy {
                grouping,
                aggregates,
                input,
            } => Operator::HashGroupBy {
                grouping,
                aggregates,
                input: one(input)?,
            },
            Operator::PhysicalUnionAll { left, right } => Operator::PhysicalUnionAll {
                left: one(left)?,
                right: one(right)?,
            },
            Operator::PhysicalStore { target, input } => Operator::PhysicalStore {
                target,
                input: one(input)?,
            },
        })
    }

    /// Bottom-up rewrite: children first, then `f` on the rebuilt node
    pub fn rewrite_up<F>(self, f: &mut F) -> CompileResult<Operator>
    where
        F: FnMut(Operator) -> CompileResult<Operator>,
    {
        let rebuilt = self.map_children(|c| c.rewrite_up(f))?;
        f(rebuilt)
    }

    /// Visit every node in postorder
    pub fn visit<F: FnMut(&Operator)>(&self, f: &mut F) {
        for child in self.children() {
            child.visit(f);
        }
        f(self);
    }

    /// Number of nodes of `kind` in this tree
    pub fn count(&self, kind: OperatorKind) -> usize {
        let mut n = 0;
        self.visit(&mut |op| {
            if op.kind() == kind {
                n += 1;
            }
        });
        n
    }

    /// Total number of nodes
    pub fn size(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_| n += 1);
        n
    }

    /// Program variables read by this tree
    pub fn temp_reads(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |op| match op {
            Operator::ScanTemp { name, .. }
            | Operator::FileScan {
                source: ScanSource::Temp(name),
                ..
            } => {
                out.insert(name.clone());
            }
            _ => {}
        });
        out
    }

    /// Replace every `ScanTemp(name)` by `replacement`
    pub fn replace_scan_temp(self, name: &str, replacement: &Operator) -> CompileResult<Operator> {
        self.rewrite_up(&mut |op| match op {
            Operator::ScanTemp { name: n, .. } if n == name => Ok(replacement.clone()),
            other => Ok(other),
        })
    }

    /// Output scheme, derived structurally from the children
    pub fn scheme(&self) -> CompileResult<Scheme> {
        match self {
            Operator::Scan { scheme, .. }
            | Operator::ScanTemp { scheme, .. }
            | Operator::FileScan { scheme, .. } => Ok(scheme.clone()),
            Operator::Select { input, .. }
            | Operator::PhysicalSelect { input, .. }
            | Operator::Distinct { input }
            | Operator::MemoryScan { input }
            | Operator::Store { input, .. }
            | Operator::StoreTemp { input, .. }
            | Operator::PhysicalStore { input, .. } => input.scheme(),
            Operator::Apply { emitters, input } | Operator::PhysicalApply { emitters, input } => {
                let input = input.scheme()?;
                let mut out = Scheme::default();
                for (name, expr) in emitters {
                    out.push(name.clone(), expr.data_type(&input, None)?);
                }
                Ok(out)
            }
            Operator::Project { columns, input } | Operator::PhysicalProject { columns, input } => {
                let input = input.scheme()?;
                input.project(columns).ok_or_else(|| {
                    let position = columns
                        .iter()
                        .copied()
                        .find(|c| *c >= input.len())
                        .unwrap_or_default();
                    CompileError::AttributeOutOfRange {
                        position,
                        arity: input.len(),
                    }
                })
            }
            Operator::Join { left, right, .. }
            | Operator::CrossProduct { left, right }
            | Operator::HashJoin { left, right, .. }
            | Operator::SymmetricHashJoin { left, right, .. }
            | Operator::ShuffleHashJoin { left, right, .. } => {
                Ok(left.scheme()?.concat(&right.scheme()?))
            }
            Operator::UnionAll { left, right }
            | Operator::Union { left, right }
            | Operator::Difference { left, right }
            | Operator::PhysicalUnionAll { left, right } => {
                let l = left.scheme()?;
                let r = right.scheme()?;
                if !l.compatible(&r) {
                    return Err(CompileError::TypeMismatch(format!(
                        "{} of {l} and {r}",
                        self.kind()
                    )));
                }
                Ok(l)
            }
            Operator::GroupBy {
                grouping,
                aggregates,
                input,
            }
            | Operator::HashGroupBy {
                grouping,
                aggregates,
                input,
            } => {
                let input = input.scheme()?;
                let mut out = Scheme::default();
                for (i, g) in grouping.iter().enumerate() {
                    let name = match g {
                        Expression::Attribute(AttributeRef::Position(p)) => {
                            input.name(*p).map(str::to_string)
                        }
                        Expression::Attribute(AttributeRef::Named(n)) => Some(n.clone()),
                        _ => None,
                    }
                    .unwrap_or_else(|| format!("_COLUMN{i}_"));
                    out.push(name, g.data_type(&input, None)?);
                }
                for (j, agg) in aggregates.iter().enumerate() {
                    let name = match agg {
                        Aggregate::Uda(uda) => uda.name.clone(),
                        Aggregate::Builtin { .. } => format!("_COLUMN{}_", grouping.len() + j),
                    };
                    out.push(name, agg.output_type(&input)?);
                }
                Ok(out)
            }
            Operator::Sequence { children } => match children.last() {
                Some(last) => last.scheme(),
                None => Ok(Scheme::default()),
            },
        }
    }

    /// Key used by the code generator to share materialized structures
    pub fn cse_key(&self) -> SubexpressionKey {
        let mut out = String::new();
        self.write_key(&mut out);
        SubexpressionKey(out)
    }

    fn write_key(&self, out: &mut String) {
        let types = |s: &Scheme| {
            s.types()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            Operator::Scan { relation, scheme } => {
                out.push_str(&format!("Scan[{relation}|{}]", types(scheme)));
                return;
            }
            Operator::ScanTemp { name, scheme } => {
                out.push_str(&format!("ScanTemp[{name}|{}]", types(scheme)));
                return;
            }
            Operator::FileScan { source, scheme } => {
                out.push_str(&format!("FileScan[{source:?}|{}]", types(scheme)));
                return;
            }
            _ => {}
        }
        out.push_str(&self.kind().to_string());
        out.push('{');
        out.push_str(&self.parameters(false));
        out.push('}');
        out.push('(');
        for (i, child) in self.children().into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            child.write_key(out);
        }
        out.push(')');
    }

    /// Operator parameters as text; emitter names only when `with_names`
    fn parameters(&self, with_names: bool) -> String {
        let join_exprs = |exprs: &[Expression]| {
            exprs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Operator::Scan { relation, .. } => relation.clone(),
            Operator::ScanTemp { name, .. } => name.clone(),
            Operator::FileScan { source, .. } => match source {
                ScanSource::Relation(r) => r.clone(),
                ScanSource::Temp(t) => format!("temp {t}"),
            },
            Operator::Select { condition, .. }
            | Operator::PhysicalSelect { condition, .. }
            | Operator::Join { condition, .. }
            | Operator::HashJoin { condition, .. }
            | Operator::SymmetricHashJoin { condition, .. }
            | Operator::ShuffleHashJoin { condition, .. } => condition.to_string(),
            Operator::Apply { emitters, .. } | Operator::PhysicalApply { emitters, .. } => emitters
                .iter()
                .map(|(n, e)| {
                    if with_names {
                        format!("{n}={e}")
                    } else {
                        e.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
            Operator::Project { columns, .. } | Operator::PhysicalProject { columns, .. } => columns
                .iter()
                .map(|c| format!("${c}"))
                .collect::<Vec<_>>()
                .join(", "),
            Operator::GroupBy {
                grouping,
                aggregates,
                ..
            }
            | Operator::HashGroupBy {
                grouping,
                aggregates,
                ..
            } => format!(
                "[{}; {}]",
                join_exprs(grouping),
                aggregates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Operator::Store { relation, .. } => relation.clone(),
            Operator::StoreTemp { name, .. } => name.clone(),
            Operator::PhysicalStore { target, .. } => match target {
                StoreTarget::Relation(r) => r.clone(),
                StoreTarget::Temp(t) => format!("temp {t}"),
            },
            _ => String::new(),
        }
    }

    /// Indented multi-line rendering for logs and test failures
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_at(0, &mut out);
        out
    }

    fn pretty_print_at(&self, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.to_string());
        out.push('\n');
        for child in self.children() {
            child.pretty_print_at(depth + 1, out);
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.parameters(true);
        if params.is_empty() {
            write!(f, "{}", self.kind())
        } else {
            write!(f, "{}({params})", self.kind())
        }
    }
}
