pub mod ddl;
pub mod engine;
pub mod error;
pub mod executor;
pub mod export;
pub mod orchestrator;
pub mod pyramid;
pub mod sql;
pub mod style;
pub mod tablespec;
pub mod writer;

pub use error::{ExportError, Result};
