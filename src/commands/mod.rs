//! CLI commands implementation

pub mod ingest;
pub mod init;
pub mod query;
pub mod serve;
pub mod status;
pub mod verify;

pub use ingest::*;
pub use init::*;
pub use query::*;
pub use serve::*;
pub use status::*;
pub use verify::*;
