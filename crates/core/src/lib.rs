// crates/core/src/lib.rs
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use jobs::*;
