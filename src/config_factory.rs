//! The Config Factory boundary.
//!
//! Argument-parsing grammars and the sandboxed/delegated/proxy/retry config
//! variants are explicitly out of scope. This module defines
//! only the trait the Command Registry calls to turn an argument vector
//! into a `RunConfig`.

use async_trait::async_trait;

use crate::command::RunConfig;

/// Raised when an argument vector cannot be turned into a run-config.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigFactoryError(pub String);

/// The out-of-scope collaborator that parses argument vectors into
/// `RunConfig`s.
#[async_trait]
pub trait ConfigFactory: Send + Sync {
    /// Parses `argv` into a run-config. `key_store` is an opaque
    /// passthrough for credentials the factory may need (e.g. to resolve a
    /// proxy or delegated run) and is never inspected by the core.
    async fn create_config(
        &self,
        argv: &[String],
        key_store: Option<&str>,
    ) -> Result<Box<dyn RunConfig>, ConfigFactoryError>;
}
