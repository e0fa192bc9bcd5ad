pub mod config;
pub mod error;
pub mod meta;
pub mod node;
pub mod owner;
pub mod scheduler;
pub mod shutdown;
pub mod syncer;
pub mod worker;

pub use config::DdlConfig;
pub use error::{DdlError, Result};
pub use node::{Ddl, DdlBuilder};
