pub mod comp;
pub mod data_source;
pub mod logic;
pub mod scalar;
pub mod storage;
pub mod table;
pub mod tags;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;

pub use crate::error::{Result, WeaveError};
pub use crate::exec::backend::{Deadline, RowFn, Step, Table};
pub use crate::exec::dag::{NodeRef, OutputNode};
pub use crate::exec::datum::{Datum, Resource};
pub use crate::exec::engines::Engine;
pub use crate::query::expr::{BinOp, RowExpr};
pub use crate::ram::types::{Map, Value};
pub use crate::types::Type;

/// Input name of the table an op consumes. Pushdown chains follow it.
pub const TABLE_INPUT: &str = "arr";

/// What an op works on. Only `Table` ops join pushed down plans and only
/// `Row` ops compile into row expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncType {
    DataSource,
    Table,
    Row,
    Tags,
    Storage,
}

pub trait Function: Sync + Send {
    fn func_type(&self) -> FuncType;
    fn signature(&self) -> Signature;
    /// Output type for the given (untagged) input types.
    fn output_type(&self, args: &TypeArgs<'_>) -> Type;
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum>;

    /// Output type computed from live inputs, for ops whose type depends on
    /// data.
    fn refine_output_type(&self, _call: &mut Call<'_>) -> Option<Result<Type>> {
        None
    }
    fn default_config(&self) -> Option<Value> {
        None
    }
    /// Returns the config to actually install when a client rebinds it.
    fn set_config(&self, _old: Option<&Value>, _input: &NodeRef, new: Value) -> Option<Value> {
        Some(new)
    }
    /// The op as a row expression over already compiled arguments.
    fn row_expr(&self, _args: &Map<String, RowExpr>) -> Option<RowExpr> {
        None
    }
    /// The op as one step of a pushed down table plan.
    fn plan_step(&self, _args: &StepArgs<'_>) -> Option<Step> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: SmallVec<[Param; 4]>,
    /// Any input names are accepted, each matched against the single param.
    pub variadic: bool,
}

impl Signature {
    pub fn new<K: Into<String>>(params: impl IntoIterator<Item = (K, Type)>) -> Self {
        Signature {
            params: params
                .into_iter()
                .map(|(name, ty)| Param {
                    name: name.into(),
                    ty,
                })
                .collect(),
            variadic: false,
        }
    }

    pub fn variadic(ty: Type) -> Self {
        Signature {
            params: SmallVec::from_elem(
                Param {
                    name: "...".to_owned(),
                    ty,
                },
                1,
            ),
            variadic: true,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Type> {
        if self.variadic {
            return self.params.first().map(|p| &p.ty);
        }
        self.params.iter().find(|p| p.name == name).map(|p| &p.ty)
    }

    /// Summed per-parameter distance, `None` when the inputs do not fit.
    pub fn distance(&self, inputs: &Map<String, Type>) -> Option<u32> {
        if self.variadic {
            let ty = &self.params.first()?.ty;
            return inputs.values().map(|t| ty.distance(&t.non_null())).sum();
        }
        if inputs.len() != self.params.len() {
            return None;
        }
        self.params
            .iter()
            .map(|p| inputs.get(&p.name).and_then(|t| p.ty.distance(&t.non_null())))
            .sum()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})",
            self.params
                .iter()
                .map(|p| format!("{}: {}", p.name, p.ty))
                .join(", ")
        )
    }
}

/// Whether a tagged input is unwrapped before reaching a parameter of this
/// type. `Any` and tagged patterns see the tags.
pub fn unwraps_tags(pattern: &Type) -> bool {
    !matches!(pattern, Type::Any | Type::Tagged { .. })
}

/// One invocation of an op's resolver.
pub struct Call<'a> {
    pub op: &'a str,
    pub node: &'a OutputNode,
    pub inputs: Map<String, Datum>,
    pub config: Option<Value>,
    pub engine: &'a Engine,
    pub deadline: Deadline,
}

impl<'a> Call<'a> {
    fn missing(&self, name: &str) -> WeaveError {
        WeaveError::execution(self.op, format!("missing input {}", name))
    }

    pub fn input(&self, name: &str) -> Result<&Datum> {
        self.inputs.get(name).ok_or_else(|| self.missing(name))
    }

    pub fn take(&mut self, name: &str) -> Result<Datum> {
        match self.inputs.shift_remove(name) {
            Some(d) => Ok(d),
            None => Err(self.missing(name)),
        }
    }

    pub fn value(&self, name: &str) -> Result<&Value> {
        self.input(name)?.as_value().ok_or_else(|| {
            WeaveError::execution(self.op, format!("input {} is not a plain value", name))
        })
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| WeaveError::execution(self.op, format!("input {} is not a string", name)))
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.value(name)?
            .as_i64()
            .ok_or_else(|| WeaveError::execution(self.op, format!("input {} is not an int", name)))
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        self.input(name)?
            .as_table()
            .ok_or_else(|| WeaveError::execution(self.op, format!("input {} is not a table", name)))
    }

    /// A row function for a lambda input, compiled to a row expression
    /// when possible.
    pub fn row_fn(&self, name: &str) -> Result<RowFn> {
        match self.input(name)? {
            Datum::Function(closure) => Ok(self.engine.row_function(closure, self.deadline)),
            _ => Err(WeaveError::execution(
                self.op,
                format!("input {} is not a function", name),
            )),
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.as_ref().and_then(|c| match c {
            Value::Dict(d) => d.get(key).and_then(Value::as_str),
            _ => None,
        })
    }
}

/// Static view of a node handed to `plan_step`.
pub struct StepArgs<'a> {
    pub node: &'a OutputNode,
    pub engine: &'a Engine,
    /// Variables bound around the node, when it sits in a lambda body.
    pub vars: &'a HashMap<String, Datum>,
}

impl<'a> StepArgs<'a> {
    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.node.input(name)?.as_value()
    }

    pub fn lambda(&self, name: &str) -> Option<RowExpr> {
        let lambda = self.node.input(name)?.as_lambda()?;
        self.engine.compile_closure(lambda, self.vars)
    }
}

type Resolver = dyn Fn(&mut Call<'_>) -> Result<Datum> + Send + Sync;

/// An op backed by a closure, for ops registered outside the builtin table.
pub struct FnOp {
    signature: Signature,
    output: Type,
    resolver: Arc<Resolver>,
}

impl FnOp {
    pub fn new<K: Into<String>>(
        params: impl IntoIterator<Item = (K, Type)>,
        output: Type,
        resolver: impl Fn(&mut Call<'_>) -> Result<Datum> + Send + Sync + 'static,
    ) -> Self {
        FnOp {
            signature: Signature::new(params),
            output,
            resolver: Arc::new(resolver),
        }
    }
}

impl Function for FnOp {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        self.signature.clone()
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        self.output.clone()
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        (self.resolver)(call)
    }
}

/// Input types of an application, with the input nodes for ops whose
/// output type depends on a constant argument.
pub struct TypeArgs<'a> {
    pub types: Map<String, Type>,
    pub nodes: &'a Map<String, NodeRef>,
}

impl<'a> TypeArgs<'a> {
    /// Type of the `name` input, `Any` when absent.
    pub fn ty(&self, name: &str) -> Type {
        self.types.get(name).cloned().unwrap_or(Type::Any)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.nodes.get(name)?.as_value()
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.constant(name)?.as_str()
    }

    /// Element type of a list-like input.
    pub fn object_type(&self, name: &str) -> Type {
        self.ty(name).object_type().unwrap_or(Type::Any)
    }

    /// Output type of a lambda input.
    pub fn fn_output(&self, name: &str) -> Type {
        match self.ty(name) {
            Type::Function { output, .. } => *output,
            _ => Type::Any,
        }
    }
}

/// Pattern for a single-row lambda.
pub fn row_fn_type() -> Type {
    Type::function([("row", Type::Any)], Type::Any)
}
