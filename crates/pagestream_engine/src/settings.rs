//! Layered runtime settings: built-in defaults, an optional
//! `config/pagestream` file, then `PAGESTREAM__*` environment variables.
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, Map};
use serde::Deserialize;

use pagestream_core::TuningParams;

pub const ENV_PREFIX: &str = "PAGESTREAM";
pub const DEFAULT_CONFIG_FILE: &str = "config/pagestream";
pub const DEFAULT_TOPIC: &str = "pagestream_crawl_data";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineSettings,
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Explicit engine binary; skips the bundle and PATH lookup.
    pub path: Option<PathBuf>,
    /// Directory holding `bin/<os>_<arch>/`.
    pub bundle_dir: Option<PathBuf>,
    pub default_timeout_secs: u64,
    pub max_workers: usize,
}

impl EngineSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Clone, Deserialize)]
pub struct TransportSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub use_tls: bool,
    pub max_retry: u32,
    pub compression: String,
    /// Left unset, the request validator applies its own defaults.
    pub max_message_size: Option<usize>,
    pub buffer_memory: Option<usize>,
    pub max_request_size: Option<usize>,
}

impl TransportSettings {
    /// Tuning values to use when a request leaves them unset.
    pub fn tuning(&self) -> TuningParams {
        TuningParams {
            max_message_size: self.max_message_size,
            buffer_memory: self.buffer_memory,
            max_request_size: self.max_request_size,
            compression: Some(self.compression.clone()),
        }
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSettings")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("use_tls", &self.use_tls)
            .field("max_retry", &self.max_retry)
            .field("compression", &self.compression)
            .field("max_message_size", &self.max_message_size)
            .field("buffer_memory", &self.buffer_memory)
            .field("max_request_size", &self.max_request_size)
            .finish()
    }
}

impl Settings {
    /// Loads from `config/pagestream.*` (if present) and the process environment.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None, None)
    }

    /// `file` replaces the default config file location; `env` replaces the
    /// process environment as the variable source.
    pub fn load(file: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let builder = Config::builder()
            .set_default("engine.default_timeout_secs", 300)?
            .set_default("engine.max_workers", 8)?
            .set_default("transport.brokers", vec!["localhost:9092"])?
            .set_default("transport.topic", DEFAULT_TOPIC)?
            .set_default("transport.use_tls", false)?
            .set_default("transport.max_retry", 3)?
            .set_default("transport.compression", "gzip")?
            .add_source(file_source)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("transport.brokers")
                    .source(env),
            );

        builder.build()?.try_deserialize()
    }
}
