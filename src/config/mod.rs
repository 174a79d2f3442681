pub mod error;
pub mod loader;
pub mod model;
mod raw;

pub use loader::discover;
pub use model::*;
