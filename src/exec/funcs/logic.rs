use super::comp::{binary_expr, eval_binary};
use super::*;

fn nullable_bool() -> Type {
    Type::optional(Type::Boolean)
}

macro_rules! bool_op {
    ($name: ident, $op: expr) => {
        /// Three-valued connective: null only when the other side does not
        /// decide the result.
        pub struct $name;
        impl Function for $name {
            fn func_type(&self) -> FuncType {
                FuncType::Row
            }
            fn signature(&self) -> Signature {
                Signature::new([("lhs", nullable_bool()), ("rhs", nullable_bool())])
            }
            fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
                nullable_bool()
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

bool_op!(And, BinOp::And);
bool_op!(Or, BinOp::Or);

pub struct Not;
impl Function for Not {
    fn func_type(&self) -> FuncType {
        FuncType::Row
    }
    fn signature(&self) -> Signature {
        Signature::new([("bool", nullable_bool())])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        nullable_bool()
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let v = call.value("bool")?.clone();
        Ok(Datum::Value(RowExpr::Const(v).not().eval(&Value::Null)))
    }
    fn row_expr(&self, args: &Map<String, RowExpr>) -> Option<RowExpr> {
        Some(args.get("bool")?.clone().not())
    }
}
