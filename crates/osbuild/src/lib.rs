pub mod config;
pub mod error;
pub mod executor;
pub mod layout;
pub mod launch;
pub mod modules;
pub mod pipeline;
pub mod planner;
pub mod variant;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
