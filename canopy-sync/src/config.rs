//! Session configuration.
//!
//! Every section has defaults, so a host only needs to spell out what it
//! changes:
//!
//! ```json
//! {
//!   "connection": { "endpoint": "ws://localhost:8501/ws" },
//!   "dispatch": { "debounce_ms": 100 }
//! }
//! ```

use serde::Deserialize;

use crate::client::{ConnectionConfig, ConnectionError};
use crate::decoder::DecoderConfig;
use crate::dispatch::DispatchConfig;
use crate::navigation::NavigationConfig;
use crate::offload::OffloadConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub decoder: DecoderConfig,
    pub offload: OffloadConfig,
    pub dispatch: DispatchConfig,
    pub navigation: NavigationConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Endpoint(#[from] ConnectionError),
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults, connecting to `/ws` on the given page origin.
    pub fn for_origin(origin: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            connection: ConnectionConfig::from_origin(origin)?,
            ..Self::default()
        })
    }
}
