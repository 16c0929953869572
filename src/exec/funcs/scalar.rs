use super::comp::{binary_expr, eval_binary};
use super::*;

fn numeric_output(args: &TypeArgs<'_>) -> Type {
    let lhs = args.ty("lhs");
    let rhs = args.ty("rhs");
    match (lhs.untagged(), rhs.untagged()) {
        (Type::Int, Type::Int) => Type::Int,
        (Type::Float, Type::Int | Type::Float) | (Type::Int, Type::Float) => Type::Float,
        _ => Type::Number,
    }
}

macro_rules! arith_op {
    ($name: ident, $op: expr) => {
        pub struct $name;
        impl Function for $name {
            fn func_type(&self) -> FuncType {
                FuncType::Row
            }
            fn signature(&self) -> Signature {
                Signature::new([("lhs", Type::Number), ("rhs", Type::Number)])
            }
            fn output_type(&self, args: &TypeArgs<'_>) -> Type {
                numeric_output(args)
            }
            fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
                eval_binary($op, call)
            }
            fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
                binary_expr($op, args)
            }
        }
    };
}

arith_op!(Add, BinOp::Add);
arith_op!(Subtract, BinOp::Sub);
arith_op!(Multiply, BinOp::Mul);

/// Always a float; division by zero gives null.
pub struct Divide;
impl Function for Divide {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        Signature::new([("lhs", Type::Number), ("rhs", Type::Number)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::Float
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        eval_binary(BinOp::Div, call)
    }
    fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
        binary_expr(BinOp::Div, args)
    }
}

/// `+` over strings.
pub struct Concat;
impl Function for Concat {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        Signature::new([("lhs", Type::String), ("rhs", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::String
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        eval_binary(BinOp::Concat, call)
    }
    fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
        binary_expr(BinOp::Concat, args)
    }
}

/// Builds a dict from its inputs, in input order.
pub struct MakeDict;
impl Function for MakeDict {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        Signature::variadic(Type::Any)
    }
    fn output_type(&self, args: &TypeArgs<'_>) -> Type {
        Type::dict(args.types.iter().map(|(k, t)| (k.clone(), t.clone())))
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let deadline = call.deadline;
        let fields = std::mem::take(&mut call.inputs)
            .into_iter()
            .map(|(k, d)| Ok((k, d.into_value(&deadline)?)))
            .collect::<Result<Map<_, _>>>()?;
        Ok(Datum::Value(Value::Dict(fields)))
    }
    fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
        Some(crate::query::expr::dict_expr(args.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args<'a>(nodes: &'a Map<String, NodeRef>, lhs: Type, rhs: Type) -> TypeArgs<'a> {
        let mut types = Map::new();
        types.insert("lhs".to_owned(), lhs);
        types.insert("rhs".to_owned(), rhs);
        TypeArgs { types, nodes }
    }

    #[test]
    fn numeric_output_widens() {
        let nodes = Map::new();
        assert_eq!(Add.output_type(&args(&nodes, Type::Int, Type::Int)), Type::Int);
        assert_eq!(Add.output_type(&args(&nodes, Type::Int, Type::Float)), Type::Float);
        assert_eq!(
            Multiply.output_type(&args(&nodes, Type::Int, Type::Number)),
            Type::Number
        );
        assert_eq!(
            Divide.output_type(&args(&nodes, Type::Int, Type::Int)),
            Type::Float
        );
    }

    #[test]
    fn dict_is_variadic() {
        let sig = MakeDict.signature();
        let mut inputs = Map::new();
        inputs.insert("a".to_owned(), Type::Int);
        inputs.insert("b".to_owned(), Type::String);
        assert_eq!(sig.distance(&inputs), Some(2 * crate::types::ANY_DISTANCE));
        let mut args = Map::new();
        args.insert("a".to_owned(), RowExpr::Row.pick("x"));
        let expr = MakeDict.row_expr(&args).unwrap();
        assert_eq!(expr.eval(&row! { "x" => 1i64 }), row! { "a" => 1i64 });
    }
}
