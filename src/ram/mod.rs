#[macro_use]
pub mod types;
pub mod store;
