use super::*;
use crate::ram::types::Tags;

/// One tag of a tagged value, null when absent.
pub struct TagGet;
impl Function for TagGet {
    fn func_type(&self) -> FuncType {
        FuncType::Tags
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::Any), ("key", Type::String)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        match (args.ty("obj"), args.string("key")) {
            (Type::Tagged { tag, .. }, Some(key)) => tag.field_type(key),
            _ => Type::Any,
        }
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let key = call.string("key")?;
        Ok(Datum::Value(
            call.input("obj")?
                .tags()
                .and_then(|tags| tags.get(key))
                .cloned()
                .unwrap_or(Value::Null),
        ))
    }
}

pub struct Untag;
impl Function for Untag {
    fn func_type(&self) -> FuncType {
        FuncType::Tags
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::Any)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        args.ty("obj").untagged().clone()
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(match call.take("obj")? {
            Datum::Value(v) => Datum::Value(v.into_untagged()),
            other => other,
        })
    }
}

/// Adds one tag. An existing tag of the same name is replaced.
pub struct WithTag;
impl Function for WithTag {
    fn func_type(&self) -> FuncType {
        FuncType::Tags
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::Any), ("key", Type::String), ("value", Type::Any)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        let tag = match args.string("key") {
            Some(key) => Type::dict([(key, args.ty("value"))]),
            None => Type::Any,
        };
        Type::tagged(tag, args.ty("obj").untagged().clone())
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let deadline = call.deadline;
        let key = call.string("key")?.to_owned();
        let value = call.take("value")?.into_value(&deadline)?;
        let obj = call.take("obj")?.into_value(&deadline)?;
        let mut tags = Tags::new();
        tags.insert(key, value);
        Ok(Datum::Value(obj.with_tags(&tags)))
    }
}
