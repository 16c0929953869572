use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, WeaveError};
use crate::exec::backend::sequence::SequenceTable;
use crate::exec::backend::sql::SqlConnection;
use crate::exec::backend::{Deadline, Group, GroupResult, Table};
use crate::exec::dag::Lambda;
use crate::ram::store::ArtifactRef;
use crate::ram::types::{Tags, Value};
use crate::types::Type;

pub const GROUP_KEY_TAG: &str = "groupKey";

/// A resolved node. Only the `Value` case is plain data; the rest are
/// handles that get materialized when a result leaves the engine.
#[derive(Clone)]
pub enum Datum {
    Value(Value),
    Table(Table),
    Groups(GroupResult),
    Group(Group),
    Function(Closure),
    Resource(Resource),
    Ref(ArtifactRef),
}

/// A lambda together with the variables bound where it was resolved, so a
/// body nested in another lambda still sees the outer parameters.
#[derive(Clone)]
pub struct Closure {
    pub lambda: Lambda,
    pub env: Arc<HashMap<String, Datum>>,
}

impl Closure {
    pub fn new(lambda: Lambda, env: HashMap<String, Datum>) -> Self {
        Closure {
            lambda,
            env: Arc::new(env),
        }
    }

    pub fn ty(&self) -> Type {
        self.lambda.ty()
    }
}

#[derive(Debug, Clone)]
pub enum Resource {
    File(PathBuf),
    Dir(PathBuf),
    Sql(SqlConnection),
}

impl Datum {
    pub fn type_of(&self) -> Type {
        match self {
            Datum::Value(v) => Type::of(v),
            Datum::Table(t) => Type::list(t.object_type()),
            Datum::Groups(g) => Type::group_result(g.key_type.clone(), g.object_type.clone()),
            Datum::Group(g) => Type::group(Type::of(&g.key), g.members.object_type()),
            Datum::Function(c) => c.ty(),
            Datum::Resource(Resource::File(_)) => Type::LocalFile,
            Datum::Resource(Resource::Dir(_)) => Type::LocalDir,
            Datum::Resource(Resource::Sql(_)) => Type::SqlConnection,
            Datum::Ref(_) => Type::Ref(Box::new(Type::Any)),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Datum::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Table view of list-like data.
    pub fn as_table(&self) -> Option<Table> {
        match self {
            Datum::Table(t) => Some(t.clone()),
            Datum::Group(g) => Some(g.members.clone()),
            Datum::Value(v) => match v.untagged() {
                Value::List(rows) => Some(Arc::new(SequenceTable::new(rows.clone()))),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Datum::Value(v) => v.tags(),
            _ => None,
        }
    }

    /// Materializes handles into plain data.
    pub fn into_value(self, deadline: &Deadline) -> Result<Value> {
        Ok(match self {
            Datum::Value(v) => v,
            Datum::Table(t) => Value::List(t.rows(deadline)?),
            Datum::Groups(g) => Value::List(
                g.groups
                    .iter()
                    .map(|group| group.to_value(deadline))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Datum::Group(g) => g.to_value(deadline)?,
            Datum::Function(c) => {
                return Err(WeaveError::Type(format!(
                    "cannot materialize function {}",
                    c.ty()
                )))
            }
            Datum::Resource(Resource::File(p)) | Datum::Resource(Resource::Dir(p)) => {
                Value::String(p.to_string_lossy().into_owned())
            }
            Datum::Resource(Resource::Sql(conn)) => Value::String(conn.uri().to_owned()),
            Datum::Ref(r) => Value::String(r.to_string()),
        })
    }
}

impl Group {
    /// A group as data: its members tagged with the group key.
    pub fn to_value(&self, deadline: &Deadline) -> Result<Value> {
        let mut tags = Tags::new();
        tags.insert(GROUP_KEY_TAG.to_owned(), self.key.clone());
        Ok(Value::tagged(tags, Value::List(self.members.rows(deadline)?)))
    }
}

impl From<Value> for Datum {
    fn from(v: Value) -> Self {
        Datum::Value(v)
    }
}

impl From<Table> for Datum {
    fn from(t: Table) -> Self {
        Datum::Table(t)
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Value(v) => write!(f, "Value({})", v),
            Datum::Table(t) => write!(f, "Table({}, {})", t.kind(), t.object_type()),
            Datum::Groups(g) => write!(f, "Groups({})", g.groups.len()),
            Datum::Group(g) => write!(f, "Group({})", g.key),
            Datum::Function(c) => write!(f, "Function({})", c.ty()),
            Datum::Resource(r) => write!(f, "Resource({:?})", r),
            Datum::Ref(r) => write!(f, "Ref({})", r),
        }
    }
}
