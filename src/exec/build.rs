//! Typed constructors for graph nodes. Each method resolves its op against
//! the input types right away, so a mistyped graph fails here rather than
//! at execution.

use std::cell::Cell;

use crate::error::Result;
use crate::exec::dag::{Node, NodeRef};
use crate::exec::engines::Engine;
use crate::ram::types::{Map, Value};
use crate::types::Type;

/// Name of the row parameter of lambdas built for table ops. Nested row
/// lambdas number theirs (`row1`, `row2`, ...) so inner bodies can still
/// read outer rows.
pub const ROW_PARAM: &str = "row";

pub struct GraphBuilder<'a> {
    engine: &'a Engine,
    /// Lambdas currently being built around the next one.
    depth: Cell<usize>,
}

macro_rules! binary_ops {
    ($($method: ident => $op: expr;)*) => {
        $(
            pub fn $method(&self, lhs: &NodeRef, rhs: &NodeRef) -> Result<NodeRef> {
                self.apply($op, [("lhs", lhs.clone()), ("rhs", rhs.clone())])
            }
        )*
    };
}

impl<'a> GraphBuilder<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        GraphBuilder {
            engine,
            depth: Cell::new(0),
        }
    }

    pub fn apply<K: Into<String>>(
        &self,
        op: &str,
        inputs: impl IntoIterator<Item = (K, NodeRef)>,
    ) -> Result<NodeRef> {
        self.engine.registry().apply(op, inputs)
    }

    pub fn constant(&self, value: impl Into<Value>) -> NodeRef {
        Node::constant(value.into())
    }

    pub fn string(&self, s: &str) -> NodeRef {
        Node::constant(Value::from(s))
    }

    pub fn int(&self, i: i64) -> NodeRef {
        Node::constant(Value::Int(i))
    }

    pub fn float(&self, f: f64) -> NodeRef {
        Node::constant(Value::Float(f))
    }

    pub fn null(&self) -> NodeRef {
        Node::typed_constant(Type::None, Value::Null)
    }

    /// A lambda over freshly made parameter variables.
    pub fn lambda(
        &self,
        params: &[(&str, Type)],
        body: impl FnOnce(&[NodeRef]) -> Result<NodeRef>,
    ) -> Result<NodeRef> {
        let vars = params
            .iter()
            .map(|(name, ty)| Node::var(*name, ty.clone()))
            .collect::<Vec<_>>();
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        let body = body(&vars);
        self.depth.set(depth);
        let body = body?;
        Ok(Node::lambda(
            params
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.clone()))
                .collect(),
            body,
        ))
    }

    /// A row lambda typed by the element type of `arr`.
    fn row_lambda(
        &self,
        arr: &NodeRef,
        body: impl FnOnce(&NodeRef) -> Result<NodeRef>,
    ) -> Result<NodeRef> {
        let object = arr.ty().object_type().unwrap_or(Type::Any);
        let name = match self.depth.get() {
            0 => ROW_PARAM.to_owned(),
            depth => format!("{}{}", ROW_PARAM, depth),
        };
        self.lambda(&[(name.as_str(), object)], |vars| body(&vars[0]))
    }

    pub fn local_path(&self, path: &str) -> Result<NodeRef> {
        self.apply("local-path", [("path", self.string(path))])
    }

    pub fn local_dir(&self, path: &str) -> Result<NodeRef> {
        self.apply("local-dir", [("path", self.string(path))])
    }

    pub fn dir_file(&self, dir: &NodeRef, path: &str) -> Result<NodeRef> {
        self.apply("dir-file", [("dir", dir.clone()), ("path", self.string(path))])
    }

    pub fn read_csv(&self, file: &NodeRef) -> Result<NodeRef> {
        self.apply("file-readcsv", [("file", file.clone())])
    }

    pub fn read_csv_frame(&self, file: &NodeRef) -> Result<NodeRef> {
        self.apply("file-readcsv-frame", [("file", file.clone())])
    }

    pub fn sql_connect(&self, uri: &str) -> Result<NodeRef> {
        self.apply("sql-connect", [("uri", self.string(uri))])
    }

    pub fn sql_table(&self, conn: &NodeRef, name: &str) -> Result<NodeRef> {
        self.apply("sql-table", [("conn", conn.clone()), ("name", self.string(name))])
    }

    pub fn count(&self, arr: &NodeRef) -> Result<NodeRef> {
        self.apply("count", [("arr", arr.clone())])
    }

    pub fn index(&self, arr: &NodeRef, i: i64) -> Result<NodeRef> {
        self.apply("index", [("arr", arr.clone()), ("index", self.int(i))])
    }

    pub fn pick(&self, obj: &NodeRef, key: &str) -> Result<NodeRef> {
        self.apply("pick", [("obj", obj.clone()), ("key", self.string(key))])
    }

    pub fn filter(
        &self,
        arr: &NodeRef,
        predicate: impl FnOnce(&NodeRef) -> Result<NodeRef>,
    ) -> Result<NodeRef> {
        let f = self.row_lambda(arr, predicate)?;
        self.apply("filter", [("arr", arr.clone()), ("filterFn", f)])
    }

    pub fn map(&self, arr: &NodeRef, f: impl FnOnce(&NodeRef) -> Result<NodeRef>) -> Result<NodeRef> {
        let f = self.row_lambda(arr, f)?;
        self.apply("map", [("arr", arr.clone()), ("mapFn", f)])
    }

    pub fn groupby(
        &self,
        arr: &NodeRef,
        key: impl FnOnce(&NodeRef) -> Result<NodeRef>,
    ) -> Result<NodeRef> {
        let f = self.row_lambda(arr, key)?;
        self.apply("groupby", [("arr", arr.clone()), ("groupByFn", f)])
    }

    pub fn group_key(&self, group: &NodeRef) -> Result<NodeRef> {
        self.apply("group-key", [("group", group.clone())])
    }

    pub fn limit(&self, arr: &NodeRef, n: i64) -> Result<NodeRef> {
        self.apply("limit", [("arr", arr.clone()), ("limit", self.int(n))])
    }

    pub fn dropna(&self, arr: &NodeRef) -> Result<NodeRef> {
        self.apply("dropna", [("arr", arr.clone())])
    }

    pub fn concat(&self, arr: &NodeRef) -> Result<NodeRef> {
        self.apply("concat", [("arr", arr.clone())])
    }

    binary_ops! {
        eq => "=";
        not_eq => "not=";
        gt => ">";
        gt_eq => ">=";
        lt => "<";
        lt_eq => "<=";
        add => "+";
        sub => "-";
        mul => "*";
        div => "/";
        and => "and";
        or => "or";
    }

    pub fn not(&self, b: &NodeRef) -> Result<NodeRef> {
        self.apply("not", [("bool", b.clone())])
    }

    pub fn dict<K: Into<String>>(
        &self,
        fields: impl IntoIterator<Item = (K, NodeRef)>,
    ) -> Result<NodeRef> {
        let fields: Map<String, NodeRef> =
            fields.into_iter().map(|(k, n)| (k.into(), n)).collect();
        self.apply("dict", fields)
    }

    pub fn tag_get(&self, obj: &NodeRef, key: &str) -> Result<NodeRef> {
        self.apply("tag-get", [("obj", obj.clone()), ("key", self.string(key))])
    }

    pub fn untag(&self, obj: &NodeRef) -> Result<NodeRef> {
        self.apply("untag", [("obj", obj.clone())])
    }

    pub fn with_tag(&self, obj: &NodeRef, key: &str, value: &NodeRef) -> Result<NodeRef> {
        self.apply(
            "with-tag",
            [
                ("obj", obj.clone()),
                ("key", self.string(key)),
                ("value", value.clone()),
            ],
        )
    }

    /// A node loading a stored artifact, typed from the store when the ref
    /// is already known.
    pub fn get(&self, uri: &str) -> NodeRef {
        self.engine.store().get(uri)
    }

    pub fn save(&self, obj: &NodeRef) -> Result<NodeRef> {
        self.apply("save", [("obj", obj.clone())])
    }

    pub fn save_named(&self, obj: &NodeRef, name: &str) -> Result<NodeRef> {
        self.apply("save", [("obj", obj.clone()), ("name", self.string(name))])
    }
}
