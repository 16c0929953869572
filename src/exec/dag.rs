//! The expression DAG. Nodes are immutable and shared through `Arc`, so the
//! same subexpression may be reachable along several paths.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::ram::types::{Map, Value};
use crate::types::Type;

pub type NodeRef = Arc<Node>;

#[derive(Debug)]
pub enum Node {
    Var(VarNode),
    Const(ConstNode),
    Output(OutputNode),
}

#[derive(Debug, Clone)]
pub struct VarNode {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct ConstNode {
    pub ty: Type,
    pub value: ConstValue,
}

#[derive(Debug, Clone)]
pub enum ConstValue {
    Value(Value),
    Function(Lambda),
}

/// A function literal. Parameters are bound by name to `Var` nodes in the
/// body when the lambda is called.
#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Vec<(String, Type)>,
    pub body: NodeRef,
}

#[derive(Debug, Clone)]
pub struct OutputNode {
    pub op: String,
    pub inputs: Map<String, NodeRef>,
    pub ty: Type,
    pub config: Option<Value>,
}

impl Lambda {
    pub fn ty(&self) -> Type {
        Type::function(self.params.iter().cloned(), self.body.ty().clone())
    }
}

impl Node {
    pub fn var(name: impl Into<String>, ty: Type) -> NodeRef {
        Arc::new(Node::Var(VarNode {
            name: name.into(),
            ty,
        }))
    }

    pub fn constant(value: Value) -> NodeRef {
        Node::typed_constant(Type::of(&value), value)
    }

    pub fn typed_constant(ty: Type, value: Value) -> NodeRef {
        Arc::new(Node::Const(ConstNode {
            ty,
            value: ConstValue::Value(value),
        }))
    }

    pub fn lambda(params: Vec<(String, Type)>, body: NodeRef) -> NodeRef {
        let lambda = Lambda { params, body };
        Arc::new(Node::Const(ConstNode {
            ty: lambda.ty(),
            value: ConstValue::Function(lambda),
        }))
    }

    /// Raw op application. No resolution happens here; the output type is
    /// taken on trust.
    pub fn output(op: impl Into<String>, inputs: Vec<(String, NodeRef)>, ty: Type) -> NodeRef {
        Node::output_with_config(op, inputs, ty, None)
    }

    pub fn output_with_config(
        op: impl Into<String>,
        inputs: Vec<(String, NodeRef)>,
        ty: Type,
        config: Option<Value>,
    ) -> NodeRef {
        Arc::new(Node::Output(OutputNode {
            op: op.into(),
            inputs: inputs.into_iter().collect(),
            ty,
            config,
        }))
    }

    pub fn ty(&self) -> &Type {
        match self {
            Node::Var(v) => &v.ty,
            Node::Const(c) => &c.ty,
            Node::Output(o) => &o.ty,
        }
    }

    /// Identity of a node within its graph.
    pub fn id(node: &NodeRef) -> usize {
        Arc::as_ptr(node) as *const () as usize
    }

    pub fn as_output(&self) -> Option<&OutputNode> {
        match self {
            Node::Output(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Const(ConstNode {
                value: ConstValue::Value(v),
                ..
            }) => Some(v),
            _ => None,
        }
    }

    pub fn as_lambda(&self) -> Option<&Lambda> {
        match self {
            Node::Const(ConstNode {
                value: ConstValue::Function(l),
                ..
            }) => Some(l),
            _ => None,
        }
    }

    /// Direct dependencies, including a lambda's body.
    pub fn children(&self) -> Vec<&NodeRef> {
        match self {
            Node::Var(_) => vec![],
            Node::Const(c) => match &c.value {
                ConstValue::Value(_) => vec![],
                ConstValue::Function(l) => vec![&l.body],
            },
            Node::Output(o) => o.inputs.values().collect(),
        }
    }
}

impl OutputNode {
    pub fn input(&self, name: &str) -> Option<&NodeRef> {
        self.inputs.get(name)
    }
}

/// Every node reachable from `targets`, dependencies before dependants.
/// Shared nodes appear once.
pub fn walk(targets: &[NodeRef]) -> Vec<NodeRef> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    // (node, children pushed)
    let mut stack: Vec<(NodeRef, bool)> = targets.iter().rev().map(|t| (t.clone(), false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        let id = Node::id(&node);
        if expanded {
            if visited.insert(id) {
                order.push(node);
            }
            continue;
        }
        if visited.contains(&id) {
            continue;
        }
        stack.push((node.clone(), true));
        for child in node.children().into_iter().rev() {
            if !visited.contains(&Node::id(child)) {
                stack.push((child.clone(), false));
            }
        }
    }
    order
}

/// Rebuilds the graphs under `targets` so that structurally identical
/// subexpressions share one node.
pub fn intern(targets: &[NodeRef]) -> Vec<NodeRef> {
    let mut by_key: HashMap<String, NodeRef> = HashMap::new();
    let mut rebuilt: HashMap<usize, NodeRef> = HashMap::new();
    for node in walk(targets) {
        let mapped = |n: &NodeRef| rebuilt.get(&Node::id(n)).cloned().unwrap_or_else(|| n.clone());
        let (key, candidate) = match &*node {
            Node::Var(v) => (format!("var:{}:{}", v.name, v.ty), node.clone()),
            Node::Const(c) => match &c.value {
                ConstValue::Value(v) => (
                    format!("const:{}:{}", c.ty, serde_json::to_string(v).unwrap_or_default()),
                    node.clone(),
                ),
                ConstValue::Function(l) => {
                    let body = mapped(&l.body);
                    (
                        format!("fn:{}:{}", c.ty, Node::id(&body)),
                        Node::lambda(l.params.clone(), body),
                    )
                }
            },
            Node::Output(o) => {
                let inputs = o
                    .inputs
                    .iter()
                    .map(|(k, n)| (k.clone(), mapped(n)))
                    .collect::<Vec<_>>();
                (
                    format!(
                        "out:{}:{}:{}:{}",
                        o.op,
                        o.ty,
                        o.config.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                        inputs.iter().map(|(k, n)| format!("{}={}", k, Node::id(n))).join(",")
                    ),
                    Node::output_with_config(o.op.clone(), inputs, o.ty.clone(), o.config.clone()),
                )
            }
        };
        let shared = by_key.entry(key).or_insert(candidate).clone();
        rebuilt.insert(Node::id(&node), shared);
    }
    targets
        .iter()
        .map(|t| rebuilt.get(&Node::id(t)).cloned().unwrap_or_else(|| t.clone()))
        .collect()
}

/// Number of distinct nodes reachable from `targets`.
pub fn distinct_nodes(targets: &[NodeRef]) -> usize {
    walk(targets).len()
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Var(v) => write!(f, "{}", v.name),
            Node::Const(c) => match &c.value {
                ConstValue::Value(v) => write!(f, "{}", v),
                ConstValue::Function(l) => write!(
                    f,
                    "({}) => {}",
                    l.params.iter().map(|(name, _)| name).join(", "),
                    l.body
                ),
            },
            Node::Output(o) => write!(f, "{}({})", o.op, o.inputs.values().join(", ")),
        }
    }
}
