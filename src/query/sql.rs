use itertools::Itertools;
use rusqlite::types::Value as SqlValue;

use super::expr::{BinOp, RowExpr};
use crate::ram::types::Value;
use crate::types::Type;

/// Name of the single column a scalar-shaped query exposes.
pub const VALUE_COLUMN: &str = "__value";
pub const ROWID_COLUMN: &str = "__rowid";

/// What one row of a generated query looks like.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// A dict row, one column per field.
    Dict(Vec<(String, Type)>),
    /// A bare value held in `__value`.
    Scalar(Type),
}

impl Shape {
    pub fn row_type(&self) -> Type {
        match self {
            Shape::Dict(columns) => Type::dict(columns.iter().cloned()),
            Shape::Scalar(t) => t.clone(),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        match self {
            Shape::Dict(columns) => columns.iter().map(|(c, _)| c.clone()).collect(),
            Shape::Scalar(_) => vec![VALUE_COLUMN.to_owned()],
        }
    }
}

/// Positional parameters collected while rendering a statement.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<SqlValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders `expr` against a source of the given shape. `None` when some part
/// of the expression has no SQL counterpart.
pub fn compile(expr: &RowExpr, shape: &Shape, params: &mut Params) -> Option<String> {
    Some(match expr {
        RowExpr::Row => match shape {
            Shape::Scalar(_) => quote_ident(VALUE_COLUMN),
            Shape::Dict(_) => return None,
        },
        RowExpr::Const(v) => match to_sql_value(v)? {
            SqlValue::Null => "NULL".to_owned(),
            v => params.push(v),
        },
        RowExpr::Pick(inner, key) => match (&**inner, shape) {
            (RowExpr::Row, Shape::Dict(columns)) => {
                if columns.iter().any(|(c, _)| c == key) {
                    quote_ident(key)
                } else {
                    "NULL".to_owned()
                }
            }
            _ => return None,
        },
        RowExpr::Not(inner) => format!("(NOT {})", compile(inner, shape, params)?),
        RowExpr::Binary(op, lhs, rhs) => {
            let l = compile(lhs, shape, params)?;
            let r = compile(rhs, shape, params)?;
            match op {
                BinOp::Div => format!("(CAST({} AS REAL) / {})", l, r),
                BinOp::Add | BinOp::Sub | BinOp::Mul
                    if *expr.output_type(&shape.row_type()).untagged() == Type::Int =>
                {
                    // sqlite turns integer overflow into a real
                    let e = format!("({} {} {})", l, op.symbol(), r);
                    format!("(CASE WHEN typeof({}) = 'integer' THEN {} END)", e, e)
                }
                op => format!("({} {} {})", l, op.symbol(), r),
            }
        }
        RowExpr::Dict(_) => return None,
    })
}

/// Renders a filter predicate. Only boolean expressions with agreeing
/// operand kinds are rendered, since `WHERE` keeps any nonzero value and
/// coerces across types where row evaluation does neither.
pub fn compile_predicate(expr: &RowExpr, shape: &Shape, params: &mut Params) -> Option<String> {
    if !expr.is_boolean() || !expr.is_strict(&shape.row_type()) {
        return None;
    }
    compile(expr, shape, params)
}

/// Projection list for a map step. Dict expressions fan out into one column
/// per field, anything else lands in `__value`.
pub fn compile_projection(
    expr: &RowExpr,
    shape: &Shape,
    params: &mut Params,
) -> Option<(String, Shape)> {
    let row_type = shape.row_type();
    if !expr.is_strict(&row_type) {
        return None;
    }
    match expr {
        RowExpr::Dict(fields) => {
            let mut columns = Vec::with_capacity(fields.len());
            let mut parts = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                if matches!(field, RowExpr::Dict(_)) {
                    return None;
                }
                parts.push(format!(
                    "{} AS {}",
                    compile(field, shape, params)?,
                    quote_ident(name)
                ));
                columns.push((name.clone(), field.output_type(&row_type)));
            }
            Some((parts.join(", "), Shape::Dict(columns)))
        }
        expr => Some((
            format!(
                "{} AS {}",
                compile(expr, shape, params)?,
                quote_ident(VALUE_COLUMN)
            ),
            Shape::Scalar(expr.output_type(&row_type)),
        )),
    }
}

pub fn select_list(shape: &Shape) -> String {
    shape.column_names().iter().map(|c| quote_ident(c)).join(", ")
}

pub fn to_sql_value(value: &Value) -> Option<SqlValue> {
    Some(match value.untagged() {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cereal_shape() -> Shape {
        Shape::Dict(vec![
            ("name".to_owned(), Type::String),
            ("potass".to_owned(), Type::Int),
        ])
    }

    #[test]
    fn filters_become_parameterized_predicates() {
        let expr = RowExpr::binary(
            BinOp::And,
            RowExpr::binary(
                BinOp::Gt,
                RowExpr::Row.pick("potass"),
                RowExpr::Const(Value::Int(280)),
            ),
            RowExpr::binary(
                BinOp::NotEq,
                RowExpr::Row.pick("name"),
                RowExpr::Const(Value::from("x")),
            ),
        );
        let mut params = Params::new();
        let sql = compile(&expr, &cereal_shape(), &mut params).unwrap();
        assert_eq!(sql, "((\"potass\" > ?1) AND (\"name\" <> ?2))");
        assert_eq!(
            params.values(),
            &[SqlValue::Integer(280), SqlValue::Text("x".to_owned())]
        );
    }

    #[test]
    fn loose_predicates_stay_in_memory() {
        let mut params = Params::new();
        let bare_column = RowExpr::Row.pick("potass");
        assert!(compile_predicate(&bare_column, &cereal_shape(), &mut params).is_none());
        let mixed = RowExpr::binary(
            BinOp::Gt,
            RowExpr::Row.pick("name"),
            RowExpr::Const(Value::Int(5)),
        );
        assert!(compile_predicate(&mixed, &cereal_shape(), &mut params).is_none());
        let typed = RowExpr::binary(
            BinOp::Gt,
            RowExpr::Row.pick("potass"),
            RowExpr::Const(Value::Int(5)),
        );
        assert_eq!(
            compile_predicate(&typed, &cereal_shape(), &mut params).as_deref(),
            Some("(\"potass\" > ?1)")
        );
    }

    #[test]
    fn int_arithmetic_nulls_on_overflow() {
        let expr = RowExpr::binary(
            BinOp::Add,
            RowExpr::Row.pick("potass"),
            RowExpr::Const(Value::Int(1)),
        );
        let mut params = Params::new();
        assert_eq!(
            compile(&expr, &cereal_shape(), &mut params).as_deref(),
            Some(
                "(CASE WHEN typeof((\"potass\" + ?1)) = 'integer' THEN (\"potass\" + ?1) END)"
            )
        );
        assert_eq!(params.values(), &[SqlValue::Integer(1)]);
    }

    #[test]
    fn whole_row_needs_scalar_source() {
        let mut params = Params::new();
        assert!(compile(&RowExpr::Row, &cereal_shape(), &mut params).is_none());
        assert_eq!(
            compile(&RowExpr::Row, &Shape::Scalar(Type::Int), &mut params).as_deref(),
            Some("\"__value\"")
        );
    }

    #[test]
    fn dict_projection_fans_out() {
        let expr = RowExpr::Dict(vec![
            ("n".to_owned(), RowExpr::Row.pick("name")),
            (
                "half".to_owned(),
                RowExpr::binary(
                    BinOp::Div,
                    RowExpr::Row.pick("potass"),
                    RowExpr::Const(Value::Int(2)),
                ),
            ),
        ]);
        let mut params = Params::new();
        let (sql, shape) = compile_projection(&expr, &cereal_shape(), &mut params).unwrap();
        assert_eq!(
            sql,
            "\"name\" AS \"n\", (CAST(\"potass\" AS REAL) / ?1) AS \"half\""
        );
        assert_eq!(
            shape,
            Shape::Dict(vec![
                ("n".to_owned(), Type::String),
                ("half".to_owned(), Type::Float)
            ])
        );
    }
}
