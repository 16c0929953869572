//! Op table: name plus signature to implementation. Built once, then only
//! read, so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{Result, WeaveError};
use crate::exec::dag::{Node, NodeRef};
use crate::exec::funcs::comp::*;
use crate::exec::funcs::data_source::*;
use crate::exec::funcs::logic::*;
use crate::exec::funcs::scalar::*;
use crate::exec::funcs::storage::*;
use crate::exec::funcs::table::*;
use crate::exec::funcs::tags::*;
use crate::exec::funcs::{unwraps_tags, Function, Signature, TypeArgs};
use crate::ram::types::{Map, Value};
use crate::types::Type;

/// Which overload wins when several match at the same distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TieBreak {
    #[default]
    LastRegistered,
    FirstRegistered,
}

#[derive(Clone)]
pub struct OpDef {
    pub name: String,
    pub signature: Signature,
    pub func: Arc<dyn Function>,
}

#[derive(Clone, Default)]
pub struct OpRegistry {
    ops: Vec<OpDef>,
    by_name: HashMap<String, Vec<usize>>,
    tie_break: TieBreak,
}

macro_rules! def_ops {
    ($($name: expr => $op: expr;)*) => {
        pub fn register_builtins(registry: &mut OpRegistry) -> Result<()> {
            $(
                registry.register($name, $op)?;
            )*
            Ok(())
        }
    };
}

// Overloads that share a name are listed least preferred first, so that
// with the default tie break an untyped input resolves to the last one.
def_ops! {
    "local-path" => LocalPath;
    "local-dir" => LocalDir;
    "dir-file" => DirFile;
    "file-readcsv" => ReadCsv;
    "file-readcsv-frame" => ReadCsvFrame;
    "sql-connect" => SqlConnect;
    "sql-table" => SqlTableOp;
    "get" => Get;
    "save" => Save;
    "save" => SaveNamed;
    "count" => CountGroups;
    "count" => Count;
    "index" => IndexGroups;
    "index" => Index;
    "pick" => PickList;
    "pick" => Pick;
    "filter" => Filter;
    "map" => MapRows;
    "groupby" => GroupBy;
    "group-key" => GroupKey;
    "limit" => Limit;
    "dropna" => DropNa;
    "concat" => ConcatLists;
    "=" => Equal(Type::String);
    "=" => Equal(Type::Boolean);
    "=" => Equal(Type::Number);
    "not=" => NotEqual(Type::String);
    "not=" => NotEqual(Type::Boolean);
    "not=" => NotEqual(Type::Number);
    ">" => Greater(Type::String);
    ">" => Greater(Type::Number);
    ">=" => GreaterEqual(Type::String);
    ">=" => GreaterEqual(Type::Number);
    "<" => Less(Type::String);
    "<" => Less(Type::Number);
    "<=" => LessEqual(Type::String);
    "<=" => LessEqual(Type::Number);
    "+" => Concat;
    "+" => Add;
    "-" => Subtract;
    "*" => Multiply;
    "/" => Divide;
    "and" => And;
    "or" => Or;
    "not" => Not;
    "dict" => MakeDict;
    "tag-get" => TagGet;
    "untag" => Untag;
    "with-tag" => WithTag;
}

lazy_static! {
    /// Registry holding every builtin op.
    pub static ref BUILTINS: Arc<OpRegistry> = {
        let mut registry = OpRegistry::default();
        if let Err(e) = register_builtins(&mut registry) {
            error!("Builtin op table is inconsistent: {}", e);
        }
        Arc::new(registry)
    };
}

fn describe(types: &Map<String, Type>) -> String {
    types.iter().map(|(k, t)| format!("{}: {}", k, t)).join(", ")
}

impl OpRegistry {
    pub fn with_builtins() -> Result<Self> {
        let mut registry = OpRegistry::default();
        register_builtins(&mut registry)?;
        Ok(registry)
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn register<F: Function + 'static>(&mut self, name: &str, func: F) -> Result<()> {
        let signature = func.signature();
        let existing = self.by_name.entry(name.to_owned()).or_default();
        if existing.iter().any(|&i| self.ops[i].signature == signature) {
            return Err(WeaveError::DuplicateOp {
                op: name.to_owned(),
                signature: signature.to_string(),
            });
        }
        existing.push(self.ops.len());
        self.ops.push(OpDef {
            name: name.to_owned(),
            signature,
            func: Arc::new(func),
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn ops(&self) -> impl Iterator<Item = &OpDef> {
        self.ops.iter()
    }

    /// Matching overloads at their minimum distance, in registration order.
    pub fn candidates(&self, name: &str, types: &Map<String, Type>) -> Vec<&OpDef> {
        let Some(indices) = self.by_name.get(name) else {
            return vec![];
        };
        let scored = indices
            .iter()
            .filter_map(|&i| Some((self.ops[i].signature.distance(types)?, i)))
            .collect::<Vec<_>>();
        let Some(min) = scored.iter().map(|(d, _)| *d).min() else {
            return vec![];
        };
        scored
            .into_iter()
            .filter(|(d, _)| *d == min)
            .map(|(_, i)| &self.ops[i])
            .collect()
    }

    pub fn resolve(&self, name: &str, types: &Map<String, Type>) -> Result<&OpDef> {
        self.resolve_with(name, types, self.tie_break)
    }

    pub fn resolve_with(
        &self,
        name: &str,
        types: &Map<String, Type>,
        tie_break: TieBreak,
    ) -> Result<&OpDef> {
        let best = self.candidates(name, types);
        let chosen = match tie_break {
            TieBreak::LastRegistered => best.last(),
            TieBreak::FirstRegistered => best.first(),
        };
        match chosen {
            Some(def) => Ok(*def),
            None => {
                debug!("No overload of {} accepts ({})", name, describe(types));
                Err(WeaveError::OpResolution {
                    op: name.to_owned(),
                    types: describe(types),
                })
            }
        }
    }

    /// Whether more than one overload ties for these types.
    pub fn is_ambiguous(&self, name: &str, types: &Map<String, Type>) -> bool {
        self.candidates(name, types).len() > 1
    }

    pub fn apply<K: Into<String>>(
        &self,
        op: &str,
        inputs: impl IntoIterator<Item = (K, NodeRef)>,
    ) -> Result<NodeRef> {
        self.apply_with_config(op, inputs, None)
    }

    /// Resolves `op` against the input node types and builds the output
    /// node. Without an explicit config the op's default is attached.
    pub fn apply_with_config<K: Into<String>>(
        &self,
        op: &str,
        inputs: impl IntoIterator<Item = (K, NodeRef)>,
        config: Option<Value>,
    ) -> Result<NodeRef> {
        let inputs: Map<String, NodeRef> =
            inputs.into_iter().map(|(k, n)| (k.into(), n)).collect();
        let types = input_types(&inputs);
        let def = self.resolve(op, &types)?;
        let ty = output_type(def, types, &inputs);
        let config = config.or_else(|| def.func.default_config());
        Ok(Node::output_with_config(
            op,
            inputs.into_iter().collect(),
            ty,
            config,
        ))
    }

    /// Installs a new config on an output node, letting the op veto or
    /// adjust it.
    pub fn rebind_config(&self, node: &NodeRef, new: Value) -> Result<NodeRef> {
        let out = node
            .as_output()
            .ok_or_else(|| WeaveError::Type(format!("{} takes no config", node)))?;
        let def = self.resolve(&out.op, &input_types(&out.inputs))?;
        let Some(input) = out.inputs.values().next() else {
            return Err(WeaveError::Type(format!("{} has no inputs", node)));
        };
        let config = def.func.set_config(out.config.as_ref(), input, new);
        Ok(Node::output_with_config(
            out.op.clone(),
            out.inputs.iter().map(|(k, n)| (k.clone(), n.clone())).collect(),
            out.ty.clone(),
            config,
        ))
    }
}

pub fn input_types(inputs: &Map<String, NodeRef>) -> Map<String, Type> {
    inputs
        .iter()
        .map(|(k, n)| (k.clone(), n.ty().clone()))
        .collect()
}

/// Output type of `def` applied to `types`. Parameters that see through
/// tags get untagged types, and the result carries the tag type of the
/// first such tagged input.
pub fn output_type(def: &OpDef, types: Map<String, Type>, nodes: &Map<String, NodeRef>) -> Type {
    let mut tag = None;
    let types = types
        .into_iter()
        .map(|(k, t)| {
            let transparent = def.signature.param(&k).map_or(false, unwraps_tags);
            match t {
                Type::Tagged { tag: tt, value } if transparent => {
                    tag.get_or_insert(*tt);
                    (k, *value)
                }
                t => (k, t),
            }
        })
        .collect();
    let out = def.func.output_type(&TypeArgs { types, nodes });
    match tag {
        Some(tag) => Type::tagged(tag, out),
        None => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::funcs::FnOp;

    fn types(pairs: &[(&str, Type)]) -> Map<String, Type> {
        pairs.iter().map(|(k, t)| (k.to_string(), t.clone())).collect()
    }

    #[test]
    fn builtins_are_consistent() {
        let registry = OpRegistry::with_builtins().unwrap();
        assert!(registry.contains("file-readcsv"));
        assert_eq!(registry.ops().count(), BUILTINS.ops().count());
    }

    #[test]
    fn duplicate_signature_is_rejected() {
        let mut registry = OpRegistry::default();
        registry.register("count", Count).unwrap();
        let err = registry.register("count", Count).unwrap_err();
        assert_eq!(err.kind(), "DuplicateOpError");
        registry.register("count", CountGroups).unwrap();
    }

    #[test]
    fn most_specific_overload_wins() {
        let registry = BUILTINS.clone();
        let ints = types(&[("lhs", Type::Int), ("rhs", Type::Int)]);
        let def = registry.resolve("+", &ints).unwrap();
        assert_eq!(def.signature.param("lhs"), Some(&Type::Number));
        let strings = types(&[("lhs", Type::String), ("rhs", Type::String)]);
        let def = registry.resolve("+", &strings).unwrap();
        assert_eq!(def.signature.param("lhs"), Some(&Type::String));
        let mixed = types(&[("lhs", Type::String), ("rhs", Type::Int)]);
        let err = registry.resolve("+", &mixed).err().unwrap();
        assert_eq!(err.kind(), "OpResolutionError");
        assert!(err.to_string().contains("lhs: String, rhs: Int"));
    }

    #[test]
    fn tie_break_is_configurable() {
        let registry = OpRegistry::with_builtins().unwrap();
        let untyped = types(&[("lhs", Type::Any), ("rhs", Type::Any)]);
        assert!(registry.is_ambiguous("+", &untyped));
        let last = registry.resolve("+", &untyped).unwrap();
        assert_eq!(last.signature.param("lhs"), Some(&Type::Number));
        let first = registry
            .resolve_with("+", &untyped, TieBreak::FirstRegistered)
            .unwrap();
        assert_eq!(first.signature.param("lhs"), Some(&Type::String));
        let registry = registry.with_tie_break(TieBreak::FirstRegistered);
        let def = registry.resolve("+", &untyped).unwrap();
        assert_eq!(def.signature.param("lhs"), Some(&Type::String));
    }

    #[test]
    fn untyped_object_picks_a_field() {
        let registry = BUILTINS.clone();
        let any = types(&[("obj", Type::Any), ("key", Type::String)]);
        let def = registry.resolve("pick", &any).unwrap();
        assert_eq!(def.signature.param("obj"), Some(&Type::dict::<String>([])));
    }

    #[test]
    fn apply_types_the_output() {
        let registry = BUILTINS.clone();
        let row = Node::var("row", Type::dict([("potass", Type::Int)]));
        let potass = registry
            .apply("pick", [("obj", row), ("key", Node::constant(Value::from("potass")))])
            .unwrap();
        assert_eq!(potass.ty(), &Type::Int);
        let gt = registry
            .apply("<", [("lhs", potass), ("rhs", Node::constant(Value::Int(3)))])
            .unwrap();
        assert_eq!(gt.ty(), &Type::Boolean);
    }

    #[test]
    fn tags_pass_through_output_types() {
        let registry = BUILTINS.clone();
        let tagged = Node::typed_constant(
            Type::tagged(Type::dict([("run", Type::String)]), Type::Int),
            Value::Int(1),
        );
        let sum = registry
            .apply("+", [("lhs", tagged), ("rhs", Node::constant(Value::Int(2)))])
            .unwrap();
        assert_eq!(
            sum.ty(),
            &Type::tagged(Type::dict([("run", Type::String)]), Type::Int)
        );
    }

    #[test]
    fn config_setter_can_veto() {
        let registry = BUILTINS.clone();
        let file = registry
            .apply("local-path", [("path", Node::constant(Value::from("x.csv")))])
            .unwrap();
        let csv = registry.apply("file-readcsv", [("file", file)]).unwrap();
        assert_eq!(csv.as_output().unwrap().config, Some(row! { "delimiter" => "," }));
        let tab = registry
            .rebind_config(&csv, row! { "delimiter" => "\t" })
            .unwrap();
        assert_eq!(tab.as_output().unwrap().config, Some(row! { "delimiter" => "\t" }));
        let rejected = registry
            .rebind_config(&tab, row! { "delimiter" => "::" })
            .unwrap();
        assert_eq!(rejected.as_output().unwrap().config, Some(row! { "delimiter" => "\t" }));
    }

    #[test]
    fn custom_ops_register_alongside_builtins() {
        let mut registry = OpRegistry::with_builtins().unwrap();
        registry
            .register(
                "double",
                FnOp::new([("n", Type::Int)], Type::Int, |call| {
                    Ok(Value::Int(call.int("n")? * 2).into())
                }),
            )
            .unwrap();
        let node = registry
            .apply("double", [("n", Node::constant(Value::Int(4)))])
            .unwrap();
        assert_eq!(node.ty(), &Type::Int);
    }
}
