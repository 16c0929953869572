//! Wire form of a graph: a flat node table where inputs refer to other
//! entries by index, so a shared node is sent once.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::{Result, WeaveError};
use crate::exec::dag::{walk, ConstValue, Node, NodeRef};
use crate::ram::types::Value;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graphs {
    pub nodes: Vec<WireNode>,
    #[serde(rename = "targetNodes")]
    pub target_nodes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodeType", rename_all = "camelCase")]
pub enum WireNode {
    Output {
        #[serde(rename = "type")]
        ty: Type,
        #[serde(rename = "fromOp")]
        from_op: WireOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<Json>,
    },
    Const {
        #[serde(rename = "type")]
        ty: Type,
        val: Json,
    },
    Var {
        #[serde(rename = "type")]
        ty: Type,
        #[serde(rename = "varName")]
        var_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOp {
    pub name: String,
    pub inputs: IndexMap<String, usize>,
}

/// Flattens the graphs under `targets`, dependencies first.
pub fn serialize(targets: &[NodeRef]) -> Graphs {
    let mut ids: HashMap<usize, usize> = HashMap::new();
    let mut nodes = vec![];
    for node in walk(targets) {
        let id_of = |n: &NodeRef| ids.get(&Node::id(n)).copied().unwrap_or_default();
        let wire = match &*node {
            Node::Var(v) => WireNode::Var {
                ty: v.ty.clone(),
                var_name: v.name.clone(),
            },
            Node::Const(c) => WireNode::Const {
                ty: c.ty.clone(),
                val: match &c.value {
                    ConstValue::Value(v) => v.to_json(),
                    ConstValue::Function(l) => Json::from(id_of(&l.body)),
                },
            },
            Node::Output(o) => WireNode::Output {
                ty: o.ty.clone(),
                from_op: WireOp {
                    name: o.op.clone(),
                    inputs: o.inputs.iter().map(|(k, n)| (k.clone(), id_of(n))).collect(),
                },
                config: o.config.as_ref().map(Value::to_json),
            },
        };
        ids.insert(Node::id(&node), nodes.len());
        nodes.push(wire);
    }
    Graphs {
        nodes,
        target_nodes: targets
            .iter()
            .map(|t| ids.get(&Node::id(t)).copied().unwrap_or_default())
            .collect(),
    }
}

/// Deepest graph accepted off the wire. Evaluation recurses once per
/// level, so deeper graphs are refused up front.
pub const MAX_GRAPH_DEPTH: usize = 256;

/// Rebuilds the target nodes. Entries referenced more than once become one
/// shared node.
pub fn deserialize(graphs: &Graphs) -> Result<Vec<NodeRef>> {
    let len = graphs.nodes.len();
    let mut reader = Reader {
        nodes: &graphs.nodes,
        built: vec![None; len],
        depth: vec![0; len],
        visiting: vec![false; len],
    };
    graphs
        .target_nodes
        .iter()
        .map(|&id| reader.build(id))
        .collect()
}

struct Reader<'a> {
    nodes: &'a [WireNode],
    built: Vec<Option<NodeRef>>,
    depth: Vec<usize>,
    visiting: Vec<bool>,
}

impl<'a> Reader<'a> {
    fn wire(&self, id: usize) -> Result<&'a WireNode> {
        let nodes = self.nodes;
        nodes
            .get(id)
            .ok_or_else(|| WeaveError::Serialization(format!("node id {} out of range", id)))
    }

    fn children(&self, id: usize) -> Result<Vec<usize>> {
        Ok(match self.wire(id)? {
            WireNode::Var { .. } => vec![],
            WireNode::Const { ty, val } => match ty {
                Type::Function { .. } => {
                    let body = val.as_u64().ok_or_else(|| {
                        WeaveError::Serialization(format!("function const {} has no body id", id))
                    })?;
                    vec![body as usize]
                }
                _ => vec![],
            },
            WireNode::Output { from_op, .. } => from_op.inputs.values().copied().collect(),
        })
    }

    /// Depth first over an explicit stack; an entry is assembled once all
    /// of its inputs are built.
    fn build(&mut self, root: usize) -> Result<NodeRef> {
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            self.wire(id)?;
            if self.built[id].is_some() {
                continue;
            }
            if expanded {
                let node = self.assemble(id)?;
                self.visiting[id] = false;
                self.built[id] = Some(node);
                continue;
            }
            if self.visiting[id] {
                return Err(WeaveError::Serialization(format!("cycle through node {}", id)));
            }
            self.visiting[id] = true;
            stack.push((id, true));
            for child in self.children(id)? {
                self.wire(child)?;
                if self.built[child].is_none() {
                    stack.push((child, false));
                }
            }
        }
        self.get(root)
    }

    fn get(&self, id: usize) -> Result<NodeRef> {
        self.built
            .get(id)
            .cloned()
            .flatten()
            .ok_or_else(|| WeaveError::Serialization(format!("node {} was not built", id)))
    }

    fn assemble(&mut self, id: usize) -> Result<NodeRef> {
        let depth = 1 + self
            .children(id)?
            .iter()
            .map(|&c| self.depth[c])
            .max()
            .unwrap_or(0);
        if depth > MAX_GRAPH_DEPTH {
            return Err(WeaveError::Serialization(format!(
                "graph deeper than {} nodes",
                MAX_GRAPH_DEPTH
            )));
        }
        self.depth[id] = depth;
        Ok(match self.wire(id)? {
            WireNode::Var { ty, var_name } => Node::var(var_name.clone(), ty.clone()),
            WireNode::Const { ty, val } => match ty {
                Type::Function { inputs, .. } => {
                    let body = val.as_u64().unwrap_or_default() as usize;
                    Node::lambda(inputs.clone(), self.get(body)?)
                }
                _ => Node::typed_constant(ty.clone(), Value::from_json(val)),
            },
            WireNode::Output {
                ty,
                from_op,
                config,
            } => {
                let mut inputs = Vec::with_capacity(from_op.inputs.len());
                for (name, &input) in &from_op.inputs {
                    inputs.push((name.clone(), self.get(input)?));
                }
                Node::output_with_config(
                    from_op.name.clone(),
                    inputs,
                    ty.clone(),
                    config.as_ref().map(Value::from_json),
                )
            }
        })
    }
}

impl Graphs {
    pub fn from_targets(targets: &[NodeRef]) -> Self {
        serialize(targets)
    }

    pub fn to_nodes(&self) -> Result<Vec<NodeRef>> {
        deserialize(self)
    }

    /// Keeps the first target whose expression renders as `expr`.
    pub fn filter_targets(&self, expr: &str) -> Result<Graphs> {
        let targets = self.to_nodes()?;
        let pos = targets
            .iter()
            .position(|t| t.to_string() == expr)
            .ok_or_else(|| WeaveError::NotFound(format!("no target node {}", expr)))?;
        Ok(Graphs {
            nodes: self.nodes.clone(),
            target_nodes: vec![self.target_nodes[pos]],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dag::distinct_nodes;
    use crate::exec::engines::Engine;
    use serde_json::json;

    #[test]
    fn shared_nodes_are_sent_once() {
        let engine = Engine::in_memory();
        let b = engine.builder();
        let n = b.int(2);
        let sum = b.add(&n, &n).unwrap();
        let prod = b.mul(&sum, &sum).unwrap();
        let graphs = serialize(&[prod.clone(), sum.clone()]);
        assert_eq!(graphs.nodes.len(), 3);
        assert_eq!(graphs.target_nodes, vec![2, 1]);
        let back = deserialize(&graphs).unwrap();
        assert_eq!(distinct_nodes(&back), distinct_nodes(&[prod, sum]));
        assert_eq!(engine.use_value(&back[0]).unwrap(), Value::Int(16));
    }

    #[test]
    fn wire_format() {
        let engine = Engine::in_memory();
        let b = engine.builder();
        let arr = b.constant(Value::List(vec![row! { "a" => 1i64 }]));
        let mapped = b.map(&arr, |row| b.pick(row, "a")).unwrap();
        let json = serde_json::to_value(serialize(&[mapped])).unwrap();
        let nodes = json["nodes"].as_array().unwrap();
        assert_eq!(json["targetNodes"], json!([nodes.len() - 1]));
        let out = nodes.last().unwrap();
        assert_eq!(out["nodeType"], "output");
        assert_eq!(out["fromOp"]["name"], "map");
        let lambda = &nodes[out["fromOp"]["inputs"]["mapFn"].as_u64().unwrap() as usize];
        assert_eq!(lambda["nodeType"], "const");
        assert_eq!(lambda["type"]["type"], "function");
        let body = &nodes[lambda["val"].as_u64().unwrap() as usize];
        assert_eq!(body["fromOp"]["name"], "pick");
        let back: Graphs = serde_json::from_value(json).unwrap();
        let nodes = back.to_nodes().unwrap();
        assert_eq!(engine.use_value(&nodes[0]).unwrap(), Value::List(vec![Value::Int(1)]));
    }

    #[test]
    fn malformed_graphs_are_rejected() {
        let cyclic: Graphs = serde_json::from_value(json!({
            "nodes": [
                {"nodeType": "output", "type": "int", "fromOp": {"name": "+", "inputs": {"lhs": 1, "rhs": 1}}},
                {"nodeType": "output", "type": "int", "fromOp": {"name": "+", "inputs": {"lhs": 0, "rhs": 0}}}
            ],
            "targetNodes": [0]
        }))
        .unwrap();
        assert_eq!(deserialize(&cyclic).unwrap_err().kind(), "SerializationError");
        let dangling = Graphs {
            nodes: vec![],
            target_nodes: vec![3],
        };
        assert_eq!(deserialize(&dangling).unwrap_err().kind(), "SerializationError");
    }

    /// `1 + 1 + ... + 1` as a flat chain of `len` additions.
    fn addition_chain(len: usize) -> Graphs {
        let mut nodes = vec![json!({"nodeType": "const", "type": "int", "val": 1})];
        for i in 1..=len {
            nodes.push(json!({
                "nodeType": "output",
                "type": "int",
                "fromOp": {"name": "+", "inputs": {"lhs": i - 1, "rhs": 0}}
            }));
        }
        serde_json::from_value(json!({"nodes": nodes, "targetNodes": [len]})).unwrap()
    }

    #[test]
    fn deep_graphs_are_refused() {
        let err = deserialize(&addition_chain(10_000)).unwrap_err();
        assert_eq!(err.kind(), "SerializationError");
        let engine = Engine::in_memory();
        let nodes = deserialize(&addition_chain(MAX_GRAPH_DEPTH - 1)).unwrap();
        assert_eq!(
            engine.use_value(&nodes[0]).unwrap(),
            Value::Int(MAX_GRAPH_DEPTH as i64)
        );
    }

    #[test]
    fn filter_targets_by_expression() {
        let engine = Engine::in_memory();
        let b = engine.builder();
        let one = b.int(1);
        let a = b.add(&one, &b.int(2)).unwrap();
        let c = b.mul(&one, &b.int(3)).unwrap();
        let graphs = serialize(&[a, c]);
        let only = graphs.filter_targets("*(1, 3)").unwrap();
        assert_eq!(only.target_nodes, vec![graphs.target_nodes[1]]);
        assert_eq!(
            graphs.filter_targets("-(1, 3)").unwrap_err().kind(),
            "NotFound"
        );
    }
}
