pub mod config;
pub mod error;
pub mod exec;
pub mod instructions;
pub mod path_resolver;
pub mod session;
pub mod tools;

pub use config::ServerConfig;
pub use error::Result;
pub use error::ToolError;
pub use path_resolver::PathResolver;
pub use session::Session;
pub use session::SessionRegistry;
