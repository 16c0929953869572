use std::cmp::Ordering;
use std::fmt;

use itertools::Itertools;

use crate::ram::types::{Map, Tags, Value};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    And,
    Or,
    /// Null-safe equality.
    Is,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::GtEq | BinOp::Lt | BinOp::LtEq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "<>",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Concat => "||",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Is => "IS",
        }
    }
}

/// An expression over a single input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowExpr {
    Row,
    Const(Value),
    Pick(Box<RowExpr>, String),
    Binary(BinOp, Box<RowExpr>, Box<RowExpr>),
    Not(Box<RowExpr>),
    Dict(Vec<(String, RowExpr)>),
}

impl RowExpr {
    pub fn pick(self, key: impl Into<String>) -> RowExpr {
        RowExpr::Pick(Box::new(self), key.into())
    }

    pub fn binary(op: BinOp, lhs: RowExpr, rhs: RowExpr) -> RowExpr {
        RowExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn not(self) -> RowExpr {
        RowExpr::Not(Box::new(self))
    }

    /// `Some(name)` when this is a plain column read of the input row.
    pub fn column(&self) -> Option<&str> {
        match self {
            RowExpr::Pick(inner, key) if **inner == RowExpr::Row => Some(key),
            _ => None,
        }
    }

    /// Whether the expression is a predicate by construction rather than a
    /// value that merely happens to be truthy.
    pub fn is_boolean(&self) -> bool {
        match self {
            RowExpr::Binary(op, ..) => op.is_comparison() || matches!(op, BinOp::And | BinOp::Or | BinOp::Is),
            RowExpr::Not(_) => true,
            RowExpr::Const(v) => matches!(v.untagged(), Value::Bool(_)),
            _ => false,
        }
    }

    /// True when every operator sees operands of a kind it is defined on:
    /// comparisons one kind per side, connectives booleans, arithmetic
    /// numbers. Columns of unknown type fail the check when an operator
    /// reads them.
    pub fn is_strict(&self, row_type: &Type) -> bool {
        self.strict_kind(row_type).is_some()
    }

    fn strict_kind(&self, row_type: &Type) -> Option<Kind> {
        use Kind::*;
        let logical = |k: Kind| matches!(k, Boolean | Null);
        match self {
            RowExpr::Row | RowExpr::Const(_) | RowExpr::Pick(..) => {
                Some(Kind::of(&self.output_type(row_type)))
            }
            RowExpr::Dict(fields) => {
                for (_, field) in fields {
                    field.strict_kind(row_type)?;
                }
                Some(Other)
            }
            RowExpr::Not(inner) => logical(inner.strict_kind(row_type)?).then_some(Boolean),
            RowExpr::Binary(op, lhs, rhs) => {
                let l = lhs.strict_kind(row_type)?;
                let r = rhs.strict_kind(row_type)?;
                let ok = match op {
                    BinOp::And | BinOp::Or => logical(l) && logical(r),
                    BinOp::Concat => matches!((l, r), (String | Null, String | Null)),
                    op if op.is_arithmetic() => matches!((l, r), (Number | Null, Number | Null)),
                    _ => l != Other && r != Other && (l == r || l == Null || r == Null),
                };
                ok.then_some(match op {
                    BinOp::Concat => String,
                    op if op.is_arithmetic() => Number,
                    _ => Boolean,
                })
            }
        }
    }

    pub fn eval(&self, row: &Value) -> Value {
        match self {
            RowExpr::Row => row.clone(),
            RowExpr::Const(v) => v.clone(),
            RowExpr::Pick(inner, key) => inner.eval(row).pick(key),
            RowExpr::Dict(fields) => Value::Dict(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.eval(row)))
                    .collect(),
            ),
            RowExpr::Not(inner) => {
                let v = inner.eval(row);
                let tags = v.tags().cloned();
                let res = match v.untagged() {
                    Value::Null => Value::Null,
                    v => Value::Bool(!v.truthy()),
                };
                retag(res, tags.as_ref())
            }
            RowExpr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(row);
                let r = rhs.eval(row);
                let tags = l.tags().or_else(|| r.tags()).cloned();
                retag(apply_binary(*op, l.untagged(), r.untagged()), tags.as_ref())
            }
        }
    }

    pub fn output_type(&self, row_type: &Type) -> Type {
        match self {
            RowExpr::Row => row_type.clone(),
            RowExpr::Const(v) => Type::of(v),
            RowExpr::Pick(inner, key) => inner.output_type(row_type).field_type(key),
            RowExpr::Dict(fields) => Type::dict(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.output_type(row_type))),
            ),
            RowExpr::Not(_) => Type::Boolean,
            RowExpr::Binary(op, lhs, rhs) => match op {
                BinOp::Div => Type::Float,
                BinOp::Concat => Type::String,
                BinOp::Add | BinOp::Sub | BinOp::Mul => {
                    let l = lhs.output_type(row_type);
                    let r = rhs.output_type(row_type);
                    match (l.untagged(), r.untagged()) {
                        (Type::Int, Type::Int) => Type::Int,
                        (Type::Float, Type::Int | Type::Float) | (Type::Int, Type::Float) => {
                            Type::Float
                        }
                        _ => Type::Number,
                    }
                }
                _ => Type::Boolean,
            },
        }
    }
}

/// Coarse value classes for operand checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Null,
    Boolean,
    Number,
    String,
    Other,
}

impl Kind {
    fn of(ty: &Type) -> Kind {
        match ty.untagged() {
            Type::None => Kind::Null,
            Type::Boolean => Kind::Boolean,
            Type::Int | Type::Float | Type::Number => Kind::Number,
            Type::String => Kind::String,
            Type::Union(members) if members.contains(&Type::None) => {
                Kind::of(&ty.untagged().non_null())
            }
            _ => Kind::Other,
        }
    }
}

fn retag(value: Value, tags: Option<&Tags>) -> Value {
    match tags {
        Some(tags) => value.with_tags(tags),
        None => value,
    }
}

fn apply_binary(op: BinOp, l: &Value, r: &Value) -> Value {
    match op {
        BinOp::Is => return Value::Bool(values_equal(l, r)),
        BinOp::And => {
            return match (l.as_bool(), r.as_bool()) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }
        }
        BinOp::Or => {
            return match (l.as_bool(), r.as_bool()) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }
        }
        _ => {}
    }
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    match op {
        BinOp::Eq => Value::Bool(values_equal(l, r)),
        BinOp::NotEq => Value::Bool(!values_equal(l, r)),
        BinOp::Gt | BinOp::GtEq | BinOp::Lt | BinOp::LtEq => match compare_values(l, r) {
            Some(ord) => Value::Bool(match op {
                BinOp::Gt => ord == Ordering::Greater,
                BinOp::GtEq => ord != Ordering::Less,
                BinOp::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }),
            None => Value::Null,
        },
        BinOp::Concat => match (l, r) {
            (Value::String(a), Value::String(b)) => Value::String(format!("{}{}", a, b)),
            _ => Value::Null,
        },
        BinOp::Div => match (l.as_f64(), r.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Value::Null,
            (Some(a), Some(b)) => Value::Float(a / b),
            _ => Value::Null,
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul => match (l, r) {
            // overflow is null rather than a wrapped or promoted value
            (Value::Int(a), Value::Int(b)) => match op {
                BinOp::Add => a.checked_add(*b),
                BinOp::Sub => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            }
            .map_or(Value::Null, Value::Int),
            (Value::String(a), Value::String(b)) if op == BinOp::Add => {
                Value::String(format!("{}{}", a, b))
            }
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => Value::Float(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    _ => a * b,
                }),
                _ => Value::Null,
            },
        },
        BinOp::Is | BinOp::And | BinOp::Or => Value::Null,
    }
}

/// Equality with numeric promotion between ints and floats. Tags are ignored.
pub fn values_equal(l: &Value, r: &Value) -> bool {
    let (l, r) = (l.untagged(), r.untagged());
    match (l, r) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            l.as_f64() == r.as_f64()
        }
        _ => l == r,
    }
}

/// Total-ish ordering used for comparisons and for sorting group keys.
/// `None` when the two values are not comparable.
pub fn compare_values(l: &Value, r: &Value) -> Option<Ordering> {
    match (l.untagged(), r.untagged()) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

impl fmt::Display for RowExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowExpr::Row => write!(f, "row"),
            RowExpr::Const(v) => write!(f, "{}", v),
            RowExpr::Pick(inner, key) => write!(f, "{}[{:?}]", inner, key),
            RowExpr::Binary(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
            RowExpr::Not(inner) => write!(f, "NOT {}", inner),
            RowExpr::Dict(fields) => write!(
                f,
                "{{{}}}",
                fields.iter().map(|(k, e)| format!("{}: {}", k, e)).join(", ")
            ),
        }
    }
}

/// Builds a dict expression from named parts, keeping order.
pub fn dict_expr(fields: Map<String, RowExpr>) -> RowExpr {
    RowExpr::Dict(fields.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cereal() -> Value {
        row! { "name" => "100% Bran", "potass" => 280i64, "rating" => 68.402973f64 }
    }

    #[test]
    fn comparisons_and_nulls() {
        let gt = RowExpr::binary(
            BinOp::Gt,
            RowExpr::Row.pick("potass"),
            RowExpr::Const(Value::Int(280)),
        );
        assert_eq!(gt.eval(&cereal()), Value::Bool(false));
        let ge = RowExpr::binary(
            BinOp::GtEq,
            RowExpr::Row.pick("potass"),
            RowExpr::Const(Value::Float(279.5)),
        );
        assert_eq!(ge.eval(&cereal()), Value::Bool(true));
        let missing = RowExpr::binary(
            BinOp::Gt,
            RowExpr::Row.pick("sodium"),
            RowExpr::Const(Value::Int(1)),
        );
        assert_eq!(missing.eval(&cereal()), Value::Null);
        assert!(!missing.eval(&cereal()).truthy());
    }

    #[test]
    fn three_valued_logic() {
        let null = RowExpr::Const(Value::Null);
        let t = RowExpr::Const(Value::Bool(true));
        let f = RowExpr::Const(Value::Bool(false));
        let and = |a: &RowExpr, b: &RowExpr| RowExpr::binary(BinOp::And, a.clone(), b.clone());
        let or = |a: &RowExpr, b: &RowExpr| RowExpr::binary(BinOp::Or, a.clone(), b.clone());
        assert_eq!(and(&null, &f).eval(&Value::Null), Value::Bool(false));
        assert_eq!(and(&null, &t).eval(&Value::Null), Value::Null);
        assert_eq!(or(&null, &t).eval(&Value::Null), Value::Bool(true));
        assert_eq!(or(&f, &f).eval(&Value::Null), Value::Bool(false));
    }

    #[test]
    fn arithmetic_promotes() {
        let add = RowExpr::binary(
            BinOp::Add,
            RowExpr::Const(Value::Int(1)),
            RowExpr::Const(Value::Float(0.5)),
        );
        assert_eq!(add.eval(&Value::Null), Value::Float(1.5));
        let div = RowExpr::binary(
            BinOp::Div,
            RowExpr::Const(Value::Int(3)),
            RowExpr::Const(Value::Int(2)),
        );
        assert_eq!(div.eval(&Value::Null), Value::Float(1.5));
        let by_zero = RowExpr::binary(
            BinOp::Div,
            RowExpr::Const(Value::Int(3)),
            RowExpr::Const(Value::Int(0)),
        );
        assert_eq!(by_zero.eval(&Value::Null), Value::Null);
    }

    #[test]
    fn int_overflow_is_null() {
        let big = RowExpr::Const(Value::Int(i64::MAX));
        let one = RowExpr::Const(Value::Int(1));
        let add = RowExpr::binary(BinOp::Add, big.clone(), one.clone());
        assert_eq!(add.eval(&Value::Null), Value::Null);
        let mul = RowExpr::binary(BinOp::Mul, big.clone(), RowExpr::Const(Value::Int(2)));
        assert_eq!(mul.eval(&Value::Null), Value::Null);
        let sub = RowExpr::binary(BinOp::Sub, big, one);
        assert_eq!(sub.eval(&Value::Null), Value::Int(i64::MAX - 1));
    }

    #[test]
    fn strictness_follows_operand_kinds() {
        let row_type = Type::dict([
            ("name", Type::String),
            ("potass", Type::Int),
            ("rating", Type::Float),
            ("misc", Type::Any),
        ]);
        let cmp = |field: &str, v: Value| {
            RowExpr::binary(BinOp::Gt, RowExpr::Row.pick(field), RowExpr::Const(v))
        };
        assert!(cmp("potass", Value::Float(1.5)).is_strict(&row_type));
        assert!(cmp("name", Value::from("M")).is_strict(&row_type));
        assert!(cmp("potass", Value::Null).is_strict(&row_type));
        assert!(!cmp("name", Value::Int(5)).is_strict(&row_type));
        assert!(!cmp("misc", Value::Int(5)).is_strict(&row_type));
        let and = RowExpr::binary(
            BinOp::And,
            cmp("potass", Value::Int(1)),
            RowExpr::Row.pick("rating"),
        );
        assert!(!and.is_strict(&row_type));
        let concat = RowExpr::binary(
            BinOp::Add,
            RowExpr::Row.pick("name"),
            RowExpr::Row.pick("name"),
        );
        assert!(!concat.is_strict(&row_type));
        assert!(RowExpr::Row.pick("misc").is_strict(&row_type));
        assert!(!RowExpr::Row.pick("potass").is_boolean());
        assert!(cmp("potass", Value::Int(1)).is_boolean());
    }

    #[test]
    fn tags_flow_through_picks_and_ops() {
        let mut tags = Tags::new();
        tags.insert("run".to_owned(), Value::from("run-1"));
        let row = Value::tagged(tags.clone(), cereal());
        let expr = RowExpr::binary(
            BinOp::Mul,
            RowExpr::Row.pick("potass"),
            RowExpr::Const(Value::Int(2)),
        );
        let res = expr.eval(&row);
        assert_eq!(res.tags(), Some(&tags));
        assert_eq!(res.untagged(), &Value::Int(560));
    }

    #[test]
    fn output_types() {
        let row_type = Type::dict([("potass", Type::Int), ("rating", Type::Float)]);
        let expr = RowExpr::Dict(vec![
            ("p".to_owned(), RowExpr::Row.pick("potass")),
            (
                "double".to_owned(),
                RowExpr::binary(
                    BinOp::Add,
                    RowExpr::Row.pick("potass"),
                    RowExpr::Row.pick("rating"),
                ),
            ),
        ]);
        assert_eq!(
            expr.output_type(&row_type),
            Type::dict([("p", Type::Int), ("double", Type::Float)])
        );
        assert_eq!(RowExpr::Row.pick("potass").column(), Some("potass"));
    }
}
