// Expression DAG
pub mod dag;
// Runtime values flowing between nodes
pub mod datum;
// Table primitives and the sequence, frame and sql backends
pub mod backend;
// Op implementations
pub mod funcs;
// Op table and overload dispatch
pub mod registry;
// Typed node constructors
pub mod build;
// Graph evaluation
pub mod engines;
// Wire form of graphs
pub mod serialize;

pub use build::GraphBuilder;
pub use dag::{Node, NodeRef};
pub use datum::Datum;
pub use engines::{Engine, ExecContext, ExecOptions};
pub use registry::{OpRegistry, TieBreak, BUILTINS};
