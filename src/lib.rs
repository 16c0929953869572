#![crate_type = "lib"]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

pub mod error;
pub mod types;
#[macro_use]
pub mod ram;
pub mod query;
pub mod exec;
pub mod server;
pub mod client;
pub mod utils;

pub use error::{Result, WeaveError};
