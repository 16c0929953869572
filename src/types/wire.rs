use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};

use super::Type;
use crate::error::{Result, WeaveError};

impl Type {
    pub fn to_json(&self) -> Json {
        match self {
            Type::Any => json!("any"),
            Type::None => json!("none"),
            Type::Boolean => json!("boolean"),
            Type::Int => json!("int"),
            Type::Float => json!("float"),
            Type::Number => json!("number"),
            Type::String => json!("string"),
            Type::LocalFile => json!({ "type": "localFile" }),
            Type::LocalDir => json!({ "type": "localDir" }),
            Type::SqlConnection => json!({ "type": "sqlConnection" }),
            Type::List(o) => json!({ "type": "list", "objectType": o.to_json() }),
            Type::TypedDict(fields) => json!({
                "type": "typedDict",
                "propertyTypes": fields_to_json(fields),
            }),
            Type::Union(members) => json!({
                "type": "union",
                "members": members.iter().map(Type::to_json).collect::<Vec<_>>(),
            }),
            Type::Tagged { tag, value } => json!({
                "type": "tagged",
                "tag": tag.to_json(),
                "value": value.to_json(),
            }),
            Type::Function { inputs, output } => json!({
                "type": "function",
                "inputTypes": Json::Object(
                    inputs.iter().map(|(k, t)| (k.clone(), t.to_json())).collect()
                ),
                "outputType": output.to_json(),
            }),
            Type::Group { key, object } => json!({
                "type": "group",
                "keyType": key.to_json(),
                "objectType": object.to_json(),
            }),
            Type::GroupResult { key, object } => json!({
                "type": "groupResult",
                "keyType": key.to_json(),
                "objectType": object.to_json(),
            }),
            Type::Ref(o) => json!({ "type": "ref", "objectType": o.to_json() }),
        }
    }

    pub fn from_json(json: &Json) -> Result<Type> {
        match json {
            Json::String(s) => simple_type(s),
            Json::Object(obj) => {
                let tag = obj
                    .get("type")
                    .and_then(Json::as_str)
                    .ok_or_else(|| WeaveError::Serialization(format!("untyped type {}", json)))?;
                let field = |name: &str| -> Result<Type> {
                    match obj.get(name) {
                        Some(t) => Type::from_json(t),
                        None => Ok(Type::Any),
                    }
                };
                Ok(match tag {
                    "list" => Type::list(field("objectType")?),
                    "typedDict" => Type::TypedDict(fields_from_json(obj.get("propertyTypes"))?),
                    "union" => {
                        let members = obj
                            .get("members")
                            .and_then(Json::as_array)
                            .map(|m| m.iter().map(Type::from_json).collect::<Result<Vec<_>>>())
                            .transpose()?
                            .unwrap_or_default();
                        Type::union(members)
                    }
                    "tagged" => Type::tagged(field("tag")?, field("value")?),
                    "function" => Type::Function {
                        inputs: obj
                            .get("inputTypes")
                            .and_then(Json::as_object)
                            .map(|o| {
                                o.iter()
                                    .map(|(k, t)| Ok((k.clone(), Type::from_json(t)?)))
                                    .collect::<Result<Vec<_>>>()
                            })
                            .transpose()?
                            .unwrap_or_default(),
                        output: Box::new(field("outputType")?),
                    },
                    "group" => Type::group(field("keyType")?, field("objectType")?),
                    "groupResult" => Type::group_result(field("keyType")?, field("objectType")?),
                    "ref" => Type::Ref(Box::new(field("objectType")?)),
                    other => simple_type(other)?,
                })
            }
            other => Err(WeaveError::Serialization(format!(
                "cannot read type from {}",
                other
            ))),
        }
    }
}

fn simple_type(name: &str) -> Result<Type> {
    Ok(match name {
        "any" | "unknown" => Type::Any,
        "none" => Type::None,
        "boolean" => Type::Boolean,
        "int" => Type::Int,
        "float" => Type::Float,
        "number" => Type::Number,
        "string" => Type::String,
        "localFile" => Type::LocalFile,
        "localDir" => Type::LocalDir,
        "sqlConnection" => Type::SqlConnection,
        other => {
            return Err(WeaveError::Serialization(format!(
                "unknown type name {}",
                other
            )))
        }
    })
}

fn fields_to_json(fields: &BTreeMap<String, Type>) -> Json {
    Json::Object(
        fields
            .iter()
            .map(|(k, t)| (k.clone(), t.to_json()))
            .collect(),
    )
}

fn fields_from_json(json: Option<&Json>) -> Result<BTreeMap<String, Type>> {
    match json {
        Some(Json::Object(obj)) => obj
            .iter()
            .map(|(k, t)| Ok((k.clone(), Type::from_json(t)?)))
            .collect(),
        Some(other) => Err(WeaveError::Serialization(format!(
            "expected field types, got {}",
            other
        ))),
        None => Ok(BTreeMap::new()),
    }
}

impl Serialize for Type {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Type {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Type, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Type::from_json(&json).map_err(D::Error::custom)
    }
}
