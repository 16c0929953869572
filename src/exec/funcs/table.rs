//! Ops over list-like inputs. Each one maps onto a table primitive, and the
//! ones with a `plan_step` can be pushed down as part of a chain.

use super::*;
use crate::exec::backend::{self, sequence::SequenceTable};

fn any_list() -> Type {
    Type::list(Type::Any)
}

fn any_groups() -> Type {
    Type::group_result(Type::Any, Type::Any)
}

fn index_arg(call: &Call<'_>) -> Result<Option<usize>> {
    Ok(usize::try_from(call.int("index")?).ok())
}

fn const_usize(args: &StepArgs<'_>, name: &str) -> Option<usize> {
    usize::try_from(args.constant(name)?.as_i64()?).ok()
}

pub struct Count;
impl Function for Count {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list())])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::Int
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let n = call.table(TABLE_INPUT)?.count(&call.deadline)?;
        Ok(Datum::Value(Value::Int(n as i64)))
    }
    fn plan_step(&self, _args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Count)
    }
}

pub struct CountGroups;
impl Function for CountGroups {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_groups())])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::Int
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        match call.input(TABLE_INPUT)? {
            Datum::Groups(g) => Ok(Datum::Value(Value::Int(g.groups.len() as i64))),
            other => Err(WeaveError::execution(
                call.op,
                format!("expected groups, got {:?}", other),
            )),
        }
    }
}

/// Row at a position, null when out of range.
pub struct Index;
impl Function for Index {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list()), ("index", Type::Int)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        args.object_type(TABLE_INPUT)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let Some(i) = index_arg(call)? else {
            return Ok(Datum::Value(Value::Null));
        };
        Ok(Datum::Value(
            call.table(TABLE_INPUT)?.index(i, &call.deadline)?,
        ))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Index(const_usize(args, "index")?))
    }
}

pub struct IndexGroups;
impl Function for IndexGroups {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_groups()), ("index", Type::Int)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        args.object_type(TABLE_INPUT)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let i = index_arg(call)?;
        match call.input(TABLE_INPUT)? {
            Datum::Groups(g) => Ok(i
                .and_then(|i| g.get(i))
                .map(|group| Datum::Group(group.clone()))
                .unwrap_or(Datum::Value(Value::Null))),
            other => Err(WeaveError::execution(
                call.op,
                format!("expected groups, got {:?}", other),
            )),
        }
    }
}

/// Field of every row.
pub struct PickList;
impl Function for PickList {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::list(Type::dict::<String>([]))), ("key", Type::String)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        let object = args.object_type("obj");
        Type::list(match args.string("key") {
            Some(key) => object.field_type(key),
            None => Type::Any,
        })
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let key = call.string("key")?.to_owned();
        Ok(Datum::Table(call.table("obj")?.pick(&key, &call.deadline)?))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Pick(args.constant("key")?.as_str()?.to_owned()))
    }
}

/// Field of a single dict.
pub struct Pick;
impl Function for Pick {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        Signature::new([("obj", Type::dict::<String>([])), ("key", Type::String)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        match args.string("key") {
            Some(key) => args.ty("obj").field_type(key),
            None => Type::Any,
        }
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Value(call.value("obj")?.pick(call.string("key")?)))
    }
    fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
        match args.get("key")? {
            RowExpr::Const(Value::String(key)) => Some(args.get("obj")?.clone().pick(key.clone())),
            _ => None,
        }
    }
}

pub struct Filter;
impl Function for Filter {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list()), ("filterFn", row_fn_type())])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::list(args.object_type(TABLE_INPUT))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let predicate = call.row_fn("filterFn")?;
        Ok(Datum::Table(
            call.table(TABLE_INPUT)?.filter(predicate, &call.deadline)?,
        ))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Filter(args.lambda("filterFn")?))
    }
}

pub struct MapRows;
impl Function for MapRows {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list()), ("mapFn", row_fn_type())])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::list(args.fn_output("mapFn"))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let f = call.row_fn("mapFn")?;
        Ok(Datum::Table(call.table(TABLE_INPUT)?.map(f, &call.deadline)?))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Map(args.lambda("mapFn")?))
    }
}

pub struct GroupBy;
impl Function for GroupBy {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list()), ("groupByFn", row_fn_type())])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::group_result(args.fn_output("groupByFn"), args.object_type(TABLE_INPUT))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let key = call.row_fn("groupByFn")?;
        Ok(Datum::Groups(
            call.table(TABLE_INPUT)?.groupby(key, &call.deadline)?,
        ))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::GroupBy(args.lambda("groupByFn")?))
    }
}

/// Key of a group, or the `groupKey` tag of a materialized one.
pub struct GroupKey;
impl Function for GroupKey {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([("group", Type::Any)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        match args.ty("group") {
            Type::Group { key, .. } => *key,
            _ => Type::Any,
        }
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Value(match call.input("group")? {
            Datum::Group(g) => g.key.clone(),
            other => other
                .tags()
                .and_then(|tags| tags.get(crate::exec::datum::GROUP_KEY_TAG))
                .cloned()
                .unwrap_or(Value::Null),
        }))
    }
}

pub struct Limit;
impl Function for Limit {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list()), ("limit", Type::Int)])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::list(args.object_type(TABLE_INPUT))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let n = usize::try_from(call.int("limit")?).unwrap_or(0);
        Ok(Datum::Table(call.table(TABLE_INPUT)?.limit(n, &call.deadline)?))
    }
    fn plan_step(&self, args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Limit(const_usize(args, "limit")?))
    }
}

fn not_null() -> RowExpr {
    RowExpr::binary(BinOp::Is, RowExpr::Row, RowExpr::Const(Value::Null)).not()
}

/// Drops null rows.
pub struct DropNa;
impl Function for DropNa {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, any_list())])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::list(args.object_type(TABLE_INPUT).non_null())
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Table(
            call.table(TABLE_INPUT)?
                .filter(backend::expr_fn(not_null()), &call.deadline)?,
        ))
    }
    fn plan_step(&self, _args: &StepArgs<'_>) -> Option<Step> {
        Some(Step::Filter(not_null()))
    }
}

/// Flattens a list of lists. Tags of each inner list move onto its
/// elements.
pub struct ConcatLists;
impl Function for ConcatLists {
    fn func_type(&self) -> FuncType {
        FuncType::Table
    }
    fn signature(&self) -> Signature {
        Signature::new([(TABLE_INPUT, Type::list(any_list()))])
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::list(
            args.object_type(TABLE_INPUT)
                .object_type()
                .unwrap_or(Type::Any),
        )
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let lists = call.table(TABLE_INPUT)?.rows(&call.deadline)?;
        let mut rows = vec![];
        for list in lists {
            let tags = list.tags().cloned().unwrap_or_default();
            match list.into_untagged() {
                Value::Null => {}
                Value::List(items) => rows.extend(items.into_iter().map(|v| v.with_tags(&tags))),
                other => {
                    return Err(WeaveError::execution(
                        call.op,
                        format!("cannot concat non-list {}", other),
                    ))
                }
            }
        }
        Ok(Datum::Table(SequenceTable::table(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_overloads_are_disjoint() {
        let mut list = Map::new();
        list.insert("obj".to_owned(), Type::list(Type::dict([("a", Type::Int)])));
        list.insert("key".to_owned(), Type::String);
        assert_eq!(PickList.signature().distance(&list), Some(1));
        assert_eq!(Pick.signature().distance(&list), None);
        let mut row = Map::new();
        row.insert("obj".to_owned(), Type::dict([("a", Type::Int)]));
        row.insert("key".to_owned(), Type::String);
        assert_eq!(Pick.signature().distance(&row), Some(1));
        assert_eq!(PickList.signature().distance(&row), None);
    }

    #[test]
    fn pick_compiles_only_constant_keys() {
        let mut args = Map::new();
        args.insert("obj".to_owned(), RowExpr::Row);
        args.insert("key".to_owned(), RowExpr::Const(Value::from("potass")));
        assert_eq!(Pick.row_expr(&args), Some(RowExpr::Row.pick("potass")));
        args.insert("key".to_owned(), RowExpr::Row.pick("k"));
        assert_eq!(Pick.row_expr(&args), None);
    }

    #[test]
    fn dropna_predicate() {
        let p = not_null();
        assert_eq!(p.eval(&Value::Null), Value::Bool(false));
        assert_eq!(p.eval(&Value::Int(0)), Value::Bool(true));
    }
}
