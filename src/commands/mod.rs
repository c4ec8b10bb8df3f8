//! CLI commands implementation

pub mod delete;
pub mod ingest;
pub mod init;
pub mod query;
pub mod rebuild;
pub mod status;

pub use delete::*;
pub use ingest::*;
pub use init::*;
pub use query::*;
pub use rebuild::*;
pub use status::*;
