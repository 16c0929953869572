//! Graph evaluation. One `ExecContext` per request memoizes every node it
//! resolves, so shared subexpressions run once. Chains of table ops over a
//! backend table are compiled into a `Plan` and handed to the backend.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;

use crate::error::{Result, WeaveError};
use crate::exec::backend::{execute_plan, expr_fn, Deadline, Plan, RowFn, RowFunction, Step};
use crate::exec::build::GraphBuilder;
use crate::exec::dag::{ConstValue, Lambda, Node, NodeRef, OutputNode};
use crate::exec::datum::{Closure, Datum};
use crate::exec::funcs::{unwraps_tags, Call, FuncType, StepArgs};
use crate::exec::registry::{input_types, OpDef, OpRegistry, TieBreak, BUILTINS};
use crate::query::expr::RowExpr;
use crate::ram::store::Store;
use crate::ram::types::{Map, Tags, Value};
use crate::types::Type;


#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Budget for backend work per request. `None` waits indefinitely.
    #[serde(default)]
    pub backend_timeout: Option<Duration>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl ExecOptions {
    /// Reads `WEAVE_BACKEND_TIMEOUT_MS` and `WEAVE_TIE_BREAK`
    /// (`first` or `last`).
    pub fn from_env() -> Self {
        let mut opts = ExecOptions::default();
        if let Some(ms) = env::var("WEAVE_BACKEND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            opts.backend_timeout = Some(Duration::from_millis(ms));
        }
        match env::var("WEAVE_TIE_BREAK").as_deref() {
            Ok("first") => opts.tie_break = TieBreak::FirstRegistered,
            Ok("last") => opts.tie_break = TieBreak::LastRegistered,
            Ok(other) => warn!("Unknown tie break policy {}, keeping default", other),
            Err(_) => {}
        }
        opts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Output nodes evaluated through their op.
    pub resolved: usize,
    /// Op chains executed as one backend plan.
    pub pushdowns: usize,
}

/// Per-request evaluation state.
pub struct ExecContext {
    // the node is held so its address stays unique while memoized
    memo: HashMap<usize, (NodeRef, Result<Datum>)>,
    vars: HashMap<String, Datum>,
    deadline: Deadline,
    pub stats: ExecStats,
}

impl ExecContext {
    pub fn new(deadline: Deadline) -> Self {
        ExecContext {
            memo: HashMap::new(),
            vars: HashMap::new(),
            deadline,
            stats: ExecStats::default(),
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Datum) {
        self.vars.insert(name.into(), value);
    }
}

fn duplicate(res: &Result<Datum>) -> Result<Datum> {
    match res {
        Ok(d) => Ok(d.clone()),
        Err(e) => Err(e.duplicate()),
    }
}

/// Errors raised by an op that are not already one of the surfaced kinds
/// become an execution error of that op.
fn attach(op: &str, e: WeaveError) -> WeaveError {
    match e {
        e @ (WeaveError::Execution { .. }
        | WeaveError::OpResolution { .. }
        | WeaveError::DuplicateOp { .. }
        | WeaveError::NotFound(_)
        | WeaveError::Timeout(_)) => e,
        other => WeaveError::execution(op, other.to_string()),
    }
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<OpRegistry>,
    store: Arc<Store>,
    options: ExecOptions,
}

impl Engine {
    pub fn new(registry: Arc<OpRegistry>, store: Arc<Store>, options: ExecOptions) -> Self {
        let registry = if registry.tie_break() == options.tie_break {
            registry
        } else {
            Arc::new((*registry).clone().with_tie_break(options.tie_break))
        };
        Engine {
            registry,
            store,
            options,
        }
    }

    /// Builtin ops over the given store.
    pub fn with_store(store: Arc<Store>) -> Self {
        Engine::new(BUILTINS.clone(), store, ExecOptions::default())
    }

    pub fn in_memory() -> Self {
        Engine::with_store(Arc::new(Store::in_memory()))
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    pub fn builder(&self) -> GraphBuilder<'_> {
        GraphBuilder::new(self)
    }

    /// A fresh context whose deadline starts now.
    pub fn context(&self) -> ExecContext {
        ExecContext::new(Deadline::after(self.options.backend_timeout))
    }

    /// Resolves every target in one context. Each target gets its own
    /// outcome; a failing target does not affect the others.
    pub fn execute(&self, ctx: &mut ExecContext, targets: &[NodeRef]) -> Vec<Result<Datum>> {
        targets
            .iter()
            .map(|target| {
                let res = self.resolve(ctx, target);
                if let Err(e) = &res {
                    warn!("Target {} failed: {}", target, e);
                }
                res
            })
            .collect()
    }

    pub fn use_node(&self, node: &NodeRef) -> Result<Datum> {
        let mut ctx = self.context();
        self.resolve(&mut ctx, node)
    }

    /// Resolves and materializes one node.
    pub fn use_value(&self, node: &NodeRef) -> Result<Value> {
        let mut ctx = self.context();
        let deadline = ctx.deadline;
        self.resolve(&mut ctx, node)?.into_value(&deadline)
    }

    pub fn use_nodes(&self, targets: &[NodeRef]) -> Vec<Result<Value>> {
        let mut ctx = self.context();
        let deadline = ctx.deadline;
        self.execute(&mut ctx, targets)
            .into_iter()
            .map(|res| res.and_then(|d| d.into_value(&deadline)))
            .collect()
    }

    pub fn resolve(&self, ctx: &mut ExecContext, node: &NodeRef) -> Result<Datum> {
        let id = Node::id(node);
        if let Some((_, res)) = ctx.memo.get(&id) {
            return duplicate(res);
        }
        let res = match &**node {
            Node::Var(v) => ctx
                .vars
                .get(&v.name)
                .cloned()
                .ok_or_else(|| WeaveError::NotFound(format!("unbound variable {}", v.name))),
            Node::Const(c) => Ok(match &c.value {
                ConstValue::Value(v) => Datum::Value(v.clone()),
                ConstValue::Function(l) => {
                    Datum::Function(Closure::new(l.clone(), ctx.vars.clone()))
                }
            }),
            Node::Output(out) => match self.try_pushdown(ctx, node) {
                Some(res) => res,
                None => self.resolve_output(ctx, out),
            },
        };
        ctx.memo.insert(id, (node.clone(), duplicate(&res)));
        res
    }

    fn resolve_output(&self, ctx: &mut ExecContext, out: &OutputNode) -> Result<Datum> {
        let mut inputs = Map::new();
        for (name, input) in &out.inputs {
            inputs.insert(name.clone(), self.resolve(ctx, input)?);
        }
        ctx.stats.resolved += 1;
        self.call_op(out, inputs, ctx.deadline)
            .map_err(|e| attach(&out.op, e))
    }

    /// Dispatches on the runtime types of `inputs` and invokes the op.
    pub fn call_op(
        &self,
        out: &OutputNode,
        inputs: Map<String, Datum>,
        deadline: Deadline,
    ) -> Result<Datum> {
        let types: Map<String, Type> = inputs
            .iter()
            .map(|(k, d)| (k.clone(), d.type_of()))
            .collect();
        let def = self.registry.resolve(&out.op, &types)?;
        let mut tags: Option<Tags> = None;
        let mut args = Map::new();
        let mut null_input = false;
        for (name, datum) in inputs {
            let param = def.signature.param(&name).cloned().unwrap_or(Type::Any);
            let datum = match datum {
                Datum::Value(v) if unwraps_tags(&param) => {
                    if let Some(t) = v.tags() {
                        tags.get_or_insert_with(|| t.clone());
                    }
                    Datum::Value(v.into_untagged())
                }
                d => d,
            };
            if matches!(&datum, Datum::Value(v) if v.is_null()) && !param.accepts_none() {
                null_input = true;
            }
            args.insert(name, datum);
        }
        if null_input {
            trace!("{} short-circuits on a null input", out.op);
            return retag(Datum::Value(Value::Null), tags, &deadline);
        }
        let res = self.invoke(def, out, args, deadline)?;
        retag(res, tags, &deadline)
    }

    fn invoke(
        &self,
        def: &OpDef,
        out: &OutputNode,
        inputs: Map<String, Datum>,
        deadline: Deadline,
    ) -> Result<Datum> {
        let mut call = Call {
            op: &out.op,
            node: out,
            inputs,
            config: out.config.clone().or_else(|| def.func.default_config()),
            engine: self,
            deadline,
        };
        def.func.resolve(&mut call)
    }

    /// Backend plan step for `out`, when its op has one and every argument
    /// the step needs is constant or compiles.
    fn plan_step(&self, out: &OutputNode, vars: &HashMap<String, Datum>) -> Option<Step> {
        let mut types = input_types(&out.inputs);
        let (_, table_type) = types.get_index_mut(0)?;
        if !matches!(table_type.untagged(), Type::GroupResult { .. }) {
            *table_type = Type::list(table_type.object_type().unwrap_or(Type::Any));
        }
        let def = self.registry.resolve(&out.op, &types).ok()?;
        if def.func.func_type() != FuncType::Table {
            return None;
        }
        def.func.plan_step(&StepArgs {
            node: out,
            engine: self,
            vars,
        })
    }

    fn try_pushdown(&self, ctx: &mut ExecContext, node: &NodeRef) -> Option<Result<Datum>> {
        let mut steps = vec![];
        let mut cur = node.clone();
        loop {
            if !steps.is_empty() && ctx.memo.contains_key(&Node::id(&cur)) {
                break;
            }
            let Some(out) = cur.as_output() else {
                break;
            };
            let Some(step) = self.plan_step(out, &ctx.vars) else {
                break;
            };
            // terminal steps leave the table domain, so only the outermost
            // node may have one
            if step.is_terminal() && !steps.is_empty() {
                break;
            }
            let Some((_, input)) = out.inputs.get_index(0) else {
                break;
            };
            let next = input.clone();
            steps.push(step);
            cur = next;
        }
        if steps.len() < 2 {
            return None;
        }
        steps.reverse();
        let base = match self.resolve(ctx, &cur) {
            Ok(base) => base,
            Err(e) => return Some(Err(e)),
        };
        if base.tags().is_some() {
            return None;
        }
        let table = base.as_table()?;
        let plan = Plan::new(steps);
        trace!(
            "Pushing [{}] into {} table",
            plan.steps.iter().join(", "),
            table.kind()
        );
        ctx.stats.pushdowns += 1;
        let op = node.as_output().map(|o| o.op.as_str()).unwrap_or_default();
        Some(execute_plan(&table, &plan, &ctx.deadline).map_err(|e| attach(op, e)))
    }

    /// Row function for a lambda. Lambdas that compile run as row
    /// expressions; the rest are interpreted per row.
    pub fn row_function(&self, closure: &Closure, deadline: Deadline) -> RowFn {
        if let Some(expr) = self.compile_closure(&closure.lambda, &closure.env) {
            return expr_fn(expr);
        }
        Arc::new(LambdaFunction {
            engine: self.clone(),
            closure: closure.clone(),
            deadline,
        })
    }

    /// Compiles a one-parameter lambda into a row expression.
    pub fn compile_lambda(&self, lambda: &Lambda) -> Option<RowExpr> {
        self.compile_closure(lambda, &HashMap::new())
    }

    /// Like `compile_lambda`, with free variables bound to plain values in
    /// `env` inlined as constants.
    pub fn compile_closure(
        &self,
        lambda: &Lambda,
        env: &HashMap<String, Datum>,
    ) -> Option<RowExpr> {
        let [(param, _)] = lambda.params.as_slice() else {
            return None;
        };
        self.compile_row(&lambda.body, param, env)
    }

    fn compile_row(
        &self,
        node: &NodeRef,
        param: &str,
        env: &HashMap<String, Datum>,
    ) -> Option<RowExpr> {
        match &**node {
            Node::Var(v) if v.name == param => Some(RowExpr::Row),
            Node::Var(v) => env.get(&v.name)?.as_value().cloned().map(RowExpr::Const),
            Node::Const(c) => match &c.value {
                ConstValue::Value(v) => Some(RowExpr::Const(v.clone())),
                ConstValue::Function(_) => None,
            },
            Node::Output(out) => {
                let args = out
                    .inputs
                    .iter()
                    .map(|(k, n)| Some((k.clone(), self.compile_row(n, param, env)?)))
                    .collect::<Option<Map<_, _>>>()?;
                // tied overloads only compile when they agree
                let exprs = self
                    .registry
                    .candidates(&out.op, &input_types(&out.inputs))
                    .into_iter()
                    .filter(|def| def.func.func_type() == FuncType::Row)
                    .filter_map(|def| def.func.row_expr(&args))
                    .collect::<Vec<_>>();
                let first = exprs.first()?;
                exprs.iter().all(|e| e == first).then(|| first.clone())
            }
        }
    }

    /// Calls a lambda with positional arguments in a fresh context that
    /// starts from the closure's captured variables.
    pub fn call_lambda(
        &self,
        closure: &Closure,
        args: Vec<Datum>,
        deadline: Deadline,
    ) -> Result<Datum> {
        let mut ctx = ExecContext::new(deadline);
        ctx.vars = (*closure.env).clone();
        for ((name, _), arg) in closure.lambda.params.iter().zip(args) {
            ctx.bind(name.clone(), arg);
        }
        self.resolve(&mut ctx, &closure.lambda.body)
    }

    /// Rebuilds the graph under `node` with `Any` output types replaced by
    /// concrete ones where they can be found. Sharing is kept.
    pub fn refine(&self, node: &NodeRef) -> Result<NodeRef> {
        let mut ctx = self.context();
        let mut memo = HashMap::new();
        self.refine_node(&mut ctx, &mut memo, node, &HashMap::new())
    }

    pub fn refine_all(&self, nodes: &[NodeRef]) -> Result<Vec<NodeRef>> {
        let mut ctx = self.context();
        let mut memo = HashMap::new();
        nodes
            .iter()
            .map(|n| self.refine_node(&mut ctx, &mut memo, n, &HashMap::new()))
            .collect()
    }

    /// `bound` holds the retyped parameters of enclosing lambdas. Nodes
    /// under a lambda are only re-typed structurally since their variables
    /// have no values yet. Each lambda body gets its own `memo`.
    fn refine_node(
        &self,
        ctx: &mut ExecContext,
        memo: &mut HashMap<usize, NodeRef>,
        node: &NodeRef,
        bound: &HashMap<String, NodeRef>,
    ) -> Result<NodeRef> {
        let id = Node::id(node);
        if let Some(refined) = memo.get(&id) {
            return Ok(refined.clone());
        }
        let refined = match &**node {
            Node::Var(v) => bound.get(&v.name).cloned().unwrap_or_else(|| node.clone()),
            Node::Const(c) => match &c.value {
                ConstValue::Value(_) => node.clone(),
                ConstValue::Function(l) => self.retype_lambda(ctx, l, None, bound)?,
            },
            Node::Output(out) => {
                let mut inputs: Vec<(String, NodeRef)> = vec![];
                for (i, (name, input)) in out.inputs.iter().enumerate() {
                    let refined = match (input.as_lambda(), inputs.first()) {
                        (Some(l), Some((_, table))) if i > 0 => {
                            let object = table.ty().object_type();
                            self.retype_lambda(ctx, l, object, bound)?
                        }
                        _ => self.refine_node(ctx, memo, input, bound)?,
                    };
                    inputs.push((name.clone(), refined));
                }
                let rebuilt =
                    self.registry
                        .apply_with_config(&out.op, inputs, out.config.clone())?;
                if bound.is_empty() && rebuilt.ty().contains_any() {
                    self.refine_by_value(ctx, rebuilt)
                } else {
                    rebuilt
                }
            }
        };
        memo.insert(id, refined.clone());
        Ok(refined)
    }

    fn retype_lambda(
        &self,
        ctx: &mut ExecContext,
        lambda: &Lambda,
        object: Option<Type>,
        bound: &HashMap<String, NodeRef>,
    ) -> Result<NodeRef> {
        let mut bound = bound.clone();
        let mut params = lambda.params.clone();
        if let (Some(object), Some((_, ty))) = (object, params.first_mut()) {
            if *ty == Type::Any {
                *ty = object;
            }
        }
        for (name, ty) in &params {
            bound.insert(name.clone(), Node::var(name.clone(), ty.clone()));
        }
        let mut memo = HashMap::new();
        let body = self.refine_node(ctx, &mut memo, &lambda.body, &bound)?;
        Ok(Node::lambda(params, body))
    }

    /// Replaces an unknown output type using the op's refine hook, or the
    /// type of the evaluated value. Failures keep the node as it is.
    fn refine_by_value(&self, ctx: &mut ExecContext, node: NodeRef) -> NodeRef {
        let Some(out) = node.as_output() else {
            return node;
        };
        let found = self.refine_hook(ctx, out).unwrap_or_else(|| {
            self.resolve(ctx, &node).map(|d| match d {
                Datum::Value(v) if v.is_null() => out.ty.clone(),
                d => d.type_of(),
            })
        });
        match found {
            Ok(ty) => {
                debug!("Refined {} to {}", out.op, ty);
                Node::output_with_config(
                    out.op.clone(),
                    out.inputs.iter().map(|(k, n)| (k.clone(), n.clone())).collect(),
                    ty,
                    out.config.clone(),
                )
            }
            Err(e) => {
                debug!("Cannot refine {}: {}", out.op, e);
                node
            }
        }
    }

    fn refine_hook(&self, ctx: &mut ExecContext, out: &OutputNode) -> Option<Result<Type>> {
        let types = input_types(&out.inputs);
        let def = self.registry.resolve(&out.op, &types).ok()?;
        let mut inputs = Map::new();
        for (name, input) in &out.inputs {
            match self.resolve(ctx, input) {
                Ok(d) => {
                    inputs.insert(name.clone(), d);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        let mut call = Call {
            op: &out.op,
            node: out,
            inputs,
            config: out.config.clone().or_else(|| def.func.default_config()),
            engine: self,
            deadline: ctx.deadline,
        };
        def.func.refine_output_type(&mut call)
    }
}

/// Result tags win over input tags on collision.
fn retag(res: Datum, tags: Option<Tags>, deadline: &Deadline) -> Result<Datum> {
    let Some(tags) = tags else {
        return Ok(res);
    };
    Ok(match res {
        Datum::Value(v) => {
            let own = v.tags().cloned();
            let v = v.into_untagged().with_tags(&tags);
            Datum::Value(match own {
                Some(own) => v.with_tags(&own),
                None => v,
            })
        }
        Datum::Table(t) => Datum::Value(Value::List(t.rows(deadline)?).with_tags(&tags)),
        other => other,
    })
}

/// A lambda interpreted row by row.
struct LambdaFunction {
    engine: Engine,
    closure: Closure,
    deadline: Deadline,
}

impl RowFunction for LambdaFunction {
    fn call(&self, row: &Value, index: usize) -> Result<Value> {
        let mut args = vec![Datum::Value(row.clone())];
        if self.closure.lambda.params.len() > 1 {
            args.push(Datum::Value(Value::Int(index as i64)));
        }
        self.engine
            .call_lambda(&self.closure, args, self.deadline)?
            .into_value(&self.deadline)
    }
}
