use super::*;

/// Loads a stored artifact by ref string.
pub struct Get;
impl Function for Get {
    fn func_type(&self) -> FuncType {
        FuncType::Storage
    }
    fn signature(&self) -> Signature {
        Signature::new([("uri", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::Any
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let store = call.engine.store();
        let artifact = store.resolve_ref(call.string("uri")?)?;
        Ok(Datum::Value(store.deref(&artifact)?))
    }
    fn refine_output_type(&self, call: &mut Call<'_>) -> Option<Result<Type>> {
        let store = call.engine.store();
        Some(
            call.string("uri")
                .and_then(|uri| store.resolve_ref(uri))
                .and_then(|artifact| store.type_of(&artifact)),
        )
    }
}

fn save(call: &mut Call<'_>, name: Option<&str>) -> Result<Datum> {
    let deadline = call.deadline;
    let value = call.take("obj")?.into_value(&deadline)?;
    Ok(Datum::Ref(call.engine.store().save(&value, name)?))
}

pub struct Save;
impl Function for Save {
    fn func_type(&self) -> FuncType {
        FuncType::Storage
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::Any)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::Ref(Box::new(args.ty("obj")))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        save(call, None)
    }
}

/// Saves and appends a version under a name.
pub struct SaveNamed;
impl Function for SaveNamed {
    fn func_type(&self) -> FuncType {
        FuncType::Storage
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::Any), ("name", Type::String)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::Ref(Box::new(args.ty("obj")))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let name = call.string("name")?.to_owned();
        save(call, Some(&name))
    }
}
