//! The table primitive contract shared by every backend, plus the plan
//! format used to push chains of table ops down into one backend call.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, WeaveError};
use crate::exec::datum::Datum;
use crate::query::expr::RowExpr;
use crate::ram::types::Value;
use crate::types::Type;

pub mod frame;
pub mod sequence;
pub mod sql;

/// Per-request deadline for backend work.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn none() -> Self {
        Deadline::default()
    }

    pub fn after(budget: Option<Duration>) -> Self {
        Deadline {
            at: budget.map(|b| Instant::now() + b),
            budget,
        }
    }

    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    pub fn expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(self.timeout())
        } else {
            Ok(())
        }
    }

    pub fn timeout(&self) -> WeaveError {
        WeaveError::Timeout(self.budget.unwrap_or_default())
    }
}

/// A function applied to each row. `expr` exposes the function as a
/// `RowExpr` when it has one, which lets backends evaluate it natively.
pub trait RowFunction: Send + Sync {
    fn expr(&self) -> Option<&RowExpr> {
        None
    }
    fn call(&self, row: &Value, index: usize) -> Result<Value>;
}

pub type RowFn = Arc<dyn RowFunction>;

pub struct ExprFunction(pub RowExpr);

impl RowFunction for ExprFunction {
    fn expr(&self) -> Option<&RowExpr> {
        Some(&self.0)
    }
    fn call(&self, row: &Value, _index: usize) -> Result<Value> {
        Ok(self.0.eval(row))
    }
}

pub fn expr_fn(expr: RowExpr) -> RowFn {
    Arc::new(ExprFunction(expr))
}

pub trait TableBackend: Send + Sync {
    fn kind(&self) -> &'static str;
    fn object_type(&self) -> Type;
    fn count(&self, deadline: &Deadline) -> Result<usize>;
    /// Row at `i`, `Null` past the end.
    fn index(&self, i: usize, deadline: &Deadline) -> Result<Value>;
    fn pick(&self, key: &str, deadline: &Deadline) -> Result<Table>;
    fn filter(&self, predicate: RowFn, deadline: &Deadline) -> Result<Table>;
    fn map(&self, f: RowFn, deadline: &Deadline) -> Result<Table>;
    fn groupby(&self, key: RowFn, deadline: &Deadline) -> Result<GroupResult>;
    fn limit(&self, n: usize, deadline: &Deadline) -> Result<Table>;
    fn rows(&self, deadline: &Deadline) -> Result<Vec<Value>>;

    /// Runs a whole plan in one go. `None` lets the caller fold the plan
    /// step by step over the primitives above.
    fn execute_native(&self, _plan: &Plan, _deadline: &Deadline) -> Option<Result<Datum>> {
        None
    }
}

pub type Table = Arc<dyn TableBackend>;

#[derive(Clone)]
pub struct Group {
    pub key: Value,
    pub members: Table,
}

/// Ordered groups produced by `groupby`.
#[derive(Clone)]
pub struct GroupResult {
    pub key_type: Type,
    pub object_type: Type,
    pub groups: Arc<Vec<Group>>,
}

impl GroupResult {
    pub fn new(key_type: Type, object_type: Type, groups: Vec<Group>) -> Self {
        GroupResult {
            key_type,
            object_type,
            groups: Arc::new(groups),
        }
    }

    pub fn get(&self, i: usize) -> Option<&Group> {
        self.groups.get(i)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Filter(RowExpr),
    Map(RowExpr),
    Pick(String),
    Limit(usize),
    Index(usize),
    Count,
    GroupBy(RowExpr),
}

impl Step {
    /// Terminal steps leave the table domain and can only end a plan.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Index(_) | Step::Count | Step::GroupBy(_))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Filter(e) => write!(f, "filter {}", e),
            Step::Map(e) => write!(f, "map {}", e),
            Step::Pick(k) => write!(f, "pick {:?}", k),
            Step::Limit(n) => write!(f, "limit {}", n),
            Step::Index(i) => write!(f, "index {}", i),
            Step::Count => write!(f, "count"),
            Step::GroupBy(e) => write!(f, "groupby {}", e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Plan { steps }
    }
}

pub fn execute_plan(table: &Table, plan: &Plan, deadline: &Deadline) -> Result<Datum> {
    if let Some(res) = table.execute_native(plan, deadline) {
        return res;
    }
    fold_plan(table.clone(), &plan.steps, deadline)
}

/// Applies the steps one primitive at a time.
pub fn fold_plan(mut table: Table, steps: &[Step], deadline: &Deadline) -> Result<Datum> {
    for step in steps {
        table = match step {
            Step::Filter(e) => table.filter(expr_fn(e.clone()), deadline)?,
            Step::Map(e) => table.map(expr_fn(e.clone()), deadline)?,
            Step::Pick(k) => table.pick(k, deadline)?,
            Step::Limit(n) => table.limit(*n, deadline)?,
            Step::Index(i) => return Ok(Datum::Value(table.index(*i, deadline)?)),
            Step::Count => return Ok(Datum::Value(Value::Int(table.count(deadline)? as i64))),
            Step::GroupBy(e) => return Ok(Datum::Groups(table.groupby(expr_fn(e.clone()), deadline)?)),
        };
    }
    Ok(Datum::Table(table))
}
