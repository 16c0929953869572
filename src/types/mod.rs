use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;

use crate::ram::types::Value;

pub mod wire;


/// Distance charged when a pattern (or a concrete type) is `Any`. Large
/// enough that any structural match is preferred over it.
pub const ANY_DISTANCE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Any,
    None,
    Boolean,
    Int,
    Float,
    Number,
    String,
    List(Box<Type>),
    TypedDict(BTreeMap<String, Type>),
    Union(BTreeSet<Type>),
    Tagged { tag: Box<Type>, value: Box<Type> },
    Function { inputs: Vec<(String, Type)>, output: Box<Type> },
    Group { key: Box<Type>, object: Box<Type> },
    GroupResult { key: Box<Type>, object: Box<Type> },
    Ref(Box<Type>),
    LocalFile,
    LocalDir,
    SqlConnection,
}

impl Type {
    pub fn list(object_type: Type) -> Type {
        Type::List(Box::new(object_type))
    }

    pub fn dict<K: Into<String>>(fields: impl IntoIterator<Item = (K, Type)>) -> Type {
        Type::TypedDict(fields.into_iter().map(|(k, t)| (k.into(), t)).collect())
    }

    pub fn tagged(tag: Type, value: Type) -> Type {
        Type::Tagged {
            tag: Box::new(tag),
            value: Box::new(value),
        }
    }

    pub fn function<K: Into<String>>(
        inputs: impl IntoIterator<Item = (K, Type)>,
        output: Type,
    ) -> Type {
        Type::Function {
            inputs: inputs.into_iter().map(|(k, t)| (k.into(), t)).collect(),
            output: Box::new(output),
        }
    }

    pub fn group(key: Type, object: Type) -> Type {
        Type::Group {
            key: Box::new(key),
            object: Box::new(object),
        }
    }

    pub fn group_result(key: Type, object: Type) -> Type {
        Type::GroupResult {
            key: Box::new(key),
            object: Box::new(object),
        }
    }

    /// Plain set union: flattens nested unions without structural merging.
    pub fn union(members: impl IntoIterator<Item = Type>) -> Type {
        let mut set = BTreeSet::new();
        for m in members {
            match m {
                Type::Any => return Type::Any,
                Type::Union(inner) => set.extend(inner),
                m => {
                    set.insert(m);
                }
            }
        }
        match set.len() {
            0 => Type::Any,
            1 => set.into_iter().next().unwrap_or(Type::Any),
            _ => Type::Union(set),
        }
    }

    pub fn optional(t: Type) -> Type {
        Type::union([t, Type::None])
    }

    /// Type of a concrete value.
    pub fn of(value: &Value) -> Type {
        match value {
            Value::Null => Type::None,
            Value::Bool(_) => Type::Boolean,
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::String(_) => Type::String,
            Value::List(items) => Type::list(Type::merge_all(items.iter().map(Type::of))),
            Value::Dict(fields) => Type::TypedDict(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Type::of(v)))
                    .collect(),
            ),
            Value::Tagged(t) => Type::tagged(
                Type::TypedDict(t.tags.iter().map(|(k, v)| (k.clone(), Type::of(v))).collect()),
                Type::of(&t.value),
            ),
        }
    }

    pub fn is_assignable_from(&self, sub: &Type) -> bool {
        self.distance(sub).is_some()
    }

    /// How far `sub` is from this pattern; `None` when not assignable.
    /// Summed over parameters this ranks overload specificity.
    pub fn distance(&self, sub: &Type) -> Option<u32> {
        if self == sub {
            return Some(0);
        }
        match (self, sub) {
            (Type::Any, _) | (_, Type::Any) => Some(ANY_DISTANCE),
            (sup, Type::Union(members)) => {
                let mut worst = 0;
                for m in members {
                    worst = worst.max(sup.distance(m)?);
                }
                Some(worst + 1)
            }
            (Type::Union(members), sub) => members
                .iter()
                .filter_map(|m| m.distance(sub))
                .min()
                .map(|d| d + 1),
            (
                Type::Tagged { tag: t1, value: v1 },
                Type::Tagged { tag: t2, value: v2 },
            ) => Some(t1.distance(t2)? + v1.distance(v2)?),
            (sup, Type::Tagged { value, .. }) => sup.distance(value).map(|d| d + 1),
            (Type::Number, Type::Int) | (Type::Number, Type::Float) => Some(1),
            (Type::List(a), Type::List(b)) => a.distance(b),
            (Type::List(a), Type::Group { object, .. }) => a.distance(object).map(|d| d + 1),
            (Type::TypedDict(sup_fields), Type::TypedDict(sub_fields)) => {
                let mut total = 0;
                for (name, field) in sup_fields {
                    total += match sub_fields.get(name) {
                        Some(t) => field.distance(t)?,
                        None => field.distance(&Type::None)?,
                    };
                }
                if sub_fields.keys().any(|k| !sup_fields.contains_key(k)) {
                    total += 1;
                }
                Some(total)
            }
            (Type::Function { output: o1, .. }, Type::Function { output: o2, .. }) => {
                o1.distance(o2)
            }
            (
                Type::Group { key: k1, object: o1 },
                Type::Group { key: k2, object: o2 },
            )
            | (
                Type::GroupResult { key: k1, object: o1 },
                Type::GroupResult { key: k2, object: o2 },
            ) => Some(k1.distance(k2)? + o1.distance(o2)?),
            (Type::Ref(a), Type::Ref(b)) => a.distance(b),
            _ => None,
        }
    }

    pub fn merge(&self, other: &Type) -> Type {
        Type::merge_all([self.clone(), other.clone()])
    }

    /// Widens a collection of types to one. Dicts, lists and tagged types
    /// are merged structurally, everything else is unioned. Keys present in
    /// only some dicts become `Any`. An empty input merges to `Any`.
    pub fn merge_all(types: impl IntoIterator<Item = Type>) -> Type {
        let mut dict: Option<BTreeMap<String, Type>> = None;
        let mut list: Option<Type> = None;
        let mut tagged: Option<(Type, Type)> = None;
        let mut others = BTreeSet::new();
        let mut stack: Vec<Type> = types.into_iter().collect();
        while let Some(t) = stack.pop() {
            match t {
                Type::Any => return Type::Any,
                Type::Union(members) => stack.extend(members),
                Type::TypedDict(fields) => {
                    dict = Some(match dict {
                        Some(prev) => merge_fields(prev, fields),
                        None => fields,
                    })
                }
                Type::List(object) => {
                    list = Some(match list {
                        Some(prev) => prev.merge(&object),
                        None => *object,
                    })
                }
                Type::Tagged { tag, value } => {
                    tagged = Some(match tagged {
                        Some((t, v)) => (t.merge(&tag), v.merge(&value)),
                        None => (*tag, *value),
                    })
                }
                t => {
                    others.insert(t);
                }
            }
        }
        if let Some(fields) = dict {
            others.insert(Type::TypedDict(fields));
        }
        if let Some(object) = list {
            others.insert(Type::list(object));
        }
        if let Some((tag, value)) = tagged {
            others.insert(Type::tagged(tag, value));
        }
        Type::union(others)
    }

    /// Element type of lists, groups and group results.
    pub fn object_type(&self) -> Option<Type> {
        match self {
            Type::Any => Some(Type::Any),
            Type::List(o) => Some((**o).clone()),
            Type::Group { object, .. } => Some((**object).clone()),
            Type::GroupResult { key, object } => {
                Some(Type::group((**key).clone(), (**object).clone()))
            }
            Type::Tagged { value, .. } => value.object_type(),
            Type::Union(members) => {
                let objects = members
                    .iter()
                    .filter(|m| **m != Type::None)
                    .map(|m| m.object_type())
                    .collect::<Option<Vec<_>>>()?;
                Some(Type::merge_all(objects))
            }
            _ => None,
        }
    }

    /// Field type of a dict type, `Any` when unknown.
    pub fn field_type(&self, name: &str) -> Type {
        match self {
            Type::TypedDict(fields) => fields.get(name).cloned().unwrap_or(Type::Any),
            Type::Tagged { value, .. } => value.field_type(name),
            Type::Union(members) => Type::merge_all(
                members
                    .iter()
                    .filter(|m| **m != Type::None)
                    .map(|m| m.field_type(name)),
            ),
            _ => Type::Any,
        }
    }

    /// Strips an outer tag wrapper.
    pub fn untagged(&self) -> &Type {
        match self {
            Type::Tagged { value, .. } => value.untagged(),
            t => t,
        }
    }

    /// The type with `None` stripped from unions. A bare `None` becomes
    /// `Any`, since a null input short-circuits before any op runs.
    pub fn non_null(&self) -> Type {
        match self {
            Type::None => Type::Any,
            Type::Union(members) if members.contains(&Type::None) => {
                Type::union(members.iter().filter(|m| **m != Type::None).cloned())
            }
            t => t.clone(),
        }
    }

    pub fn accepts_none(&self) -> bool {
        self.is_assignable_from(&Type::None)
    }

    /// Whether refinement could still make this type more precise.
    pub fn contains_any(&self) -> bool {
        match self {
            Type::Any => true,
            Type::List(o) | Type::Ref(o) => o.contains_any(),
            Type::TypedDict(fields) => fields.values().any(Type::contains_any),
            Type::Union(members) => members.iter().any(Type::contains_any),
            Type::Tagged { tag, value } => tag.contains_any() || value.contains_any(),
            Type::Function { output, .. } => output.contains_any(),
            Type::Group { key, object } | Type::GroupResult { key, object } => {
                key.contains_any() || object.contains_any()
            }
            _ => false,
        }
    }
}

fn merge_fields(
    mut a: BTreeMap<String, Type>,
    b: BTreeMap<String, Type>,
) -> BTreeMap<String, Type> {
    let keys: BTreeSet<String> = a.keys().chain(b.keys()).cloned().collect();
    let mut merged = BTreeMap::new();
    for k in keys {
        let t = match (a.remove(&k), b.get(&k)) {
            (Some(x), Some(y)) => x.merge(y),
            _ => Type::Any,
        };
        merged.insert(k, t);
    }
    merged
}

/// `sub <: sup`
pub fn assignable(sub: &Type, sup: &Type) -> bool {
    sup.is_assignable_from(sub)
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "Any"),
            Type::None => write!(f, "None"),
            Type::Boolean => write!(f, "Boolean"),
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::Number => write!(f, "Number"),
            Type::String => write!(f, "String"),
            Type::List(o) => write!(f, "List[{}]", o),
            Type::TypedDict(fields) => write!(
                f,
                "TypedDict{{{}}}",
                fields.iter().map(|(k, t)| format!("{}: {}", k, t)).join(", ")
            ),
            Type::Union(members) => write!(f, "Union[{}]", members.iter().join(" | ")),
            Type::Tagged { tag, value } => write!(f, "Tagged[{}, {}]", tag, value),
            Type::Function { inputs, output } => write!(
                f,
                "Function({}) -> {}",
                inputs.iter().map(|(k, t)| format!("{}: {}", k, t)).join(", "),
                output
            ),
            Type::Group { key, object } => write!(f, "Group[{}, {}]", key, object),
            Type::GroupResult { key, object } => write!(f, "GroupResult[{}, {}]", key, object),
            Type::Ref(o) => write!(f, "Ref[{}]", o),
            Type::LocalFile => write!(f, "LocalFile"),
            Type::LocalDir => write!(f, "LocalDir"),
            Type::SqlConnection => write!(f, "SqlConnection"),
        }
    }
}
