pub mod config;
pub mod exec;
pub mod types;

pub use config::{Config, ConfigError};
pub use exec::{CommandOutput, ExecError};
pub use types::*;

/// Boxed future returned by the object-safe capability traits.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
