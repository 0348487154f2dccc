pub mod errors;
pub mod types;

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};

use errors::ConfigError;
use types::AppConfig;

impl AppConfig {
    /// Load from `./config`, see [`AppConfig::load_from`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Layers, lowest precedence first:
    /// 1. `<dir>/default.toml` (committed)
    /// 2. `<dir>/local.toml` (git-ignored overrides)
    /// 3. `SPREADARB_*` environment variables, nested with `__`
    pub fn load_from(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigError::MissingDir(dir.to_path_buf()));
        }
        let figment = Figment::new()
            .merge(Toml::file(dir.join("default.toml")))
            .merge(Toml::file(dir.join("local.toml")))
            .merge(Env::prefixed("SPREADARB_").split("__"));

        let config: AppConfig = figment.extract()?;

        let validation_errors = config.validate();
        if !validation_errors.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: validation_errors.join(", "),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dir_is_reported() {
        let err = AppConfig::load_from("/nonexistent/spreadarb-config").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDir(_)));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config");
        let config = AppConfig::load_from(dir).unwrap();
        assert_eq!(config.exchanges.len(), 2);
        assert_eq!(config.pairs[0].symbol, "BTCUSDT");
        assert!(config.pairs[0].start);
    }
}
