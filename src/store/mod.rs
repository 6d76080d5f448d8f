pub mod database;
pub mod types;

pub use database::*;
pub use types::*;
