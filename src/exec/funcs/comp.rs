use super::*;

fn operand_params(ty: &Type) -> Signature {
    Signature::new([("lhs", ty.clone()), ("rhs", ty.clone())])
}

/// Evaluates a binary row expression over two already resolved operands.
pub(super) fn eval_binary(op: BinOp, call: &Call<'_>) -> Result<Datum> {
    let lhs = call.value("lhs")?.clone();
    let rhs = call.value("rhs")?.clone();
    Ok(Datum::Value(
        RowExpr::binary(op, RowExpr::Const(lhs), RowExpr::Const(rhs)).eval(&Value::Null),
    ))
}

pub(super) fn binary_expr(op: BinOp, args: &Map<String, RowExpr>) -> Option<RowExpr> {
    Some(RowExpr::binary(
        op,
        args.get("lhs")?.clone(),
        args.get("rhs")?.clone(),
    ))
}

macro_rules! cmp_op {
    ($name: ident, $op: expr) => {
        /// Comparison over operands of the given type.
        pub struct $name(pub Type);
        impl Function for $name {
            fn func_type(&self) -> FuncType {
                FuncType::Row
            }
            fn signature(&self) -> Signature {
                operand_params(&self.0)
            }
            fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
                Type::Boolean
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

cmp_op!(Equal, BinOp::Eq);
cmp_op!(NotEqual, BinOp::NotEq);
cmp_op!(Greater, BinOp::Gt);
cmp_op!(GreaterEqual, BinOp::GtEq);
cmp_op!(Less, BinOp::Lt);
cmp_op!(LessEqual, BinOp::LtEq);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_compile_to_binary_exprs() {
        let mut args = Map::new();
        args.insert("lhs".to_owned(), RowExpr::Row.pick("potass"));
        args.insert("rhs".to_owned(), RowExpr::Const(Value::Int(280)));
        let expr = Greater(Type::Number).row_expr(&args).unwrap();
        assert_eq!(expr.to_string(), "(row[\"potass\"] > 280)");
        let row = row! { "potass" => 320i64 };
        assert_eq!(expr.eval(&row), Value::Bool(true));
    }

    #[test]
    fn signatures_follow_operand_type() {
        let sig = Equal(Type::String).signature();
        let mut inputs = Map::new();
        inputs.insert("lhs".to_owned(), Type::String);
        inputs.insert("rhs".to_owned(), Type::String);
        assert_eq!(sig.distance(&inputs), Some(0));
        inputs.insert("rhs".to_owned(), Type::Int);
        assert_eq!(sig.distance(&inputs), None);
        assert_eq!(Equal(Type::Number).signature().distance(&inputs), None);
    }
}
