//! Row expressions: the restricted lambda subset that backends can evaluate
//! without calling back into the engine.

pub mod expr;
pub mod sql;

pub use expr::{BinOp, RowExpr};
