pub mod classify;
pub mod connector;
pub mod derive;
pub mod sync;
pub mod types;

pub use classify::*;
pub use connector::*;
pub use sync::*;
pub use types::*;
