use super::schema::Config;
use crate::error::{ConfigError, Result};
use crate::worker::split_command_line;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "SNIFF_POOL_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("sniff-pool.toml"))
        .merge(Json::file("sniff-pool.json"))
        .merge(Yaml::file("sniff-pool.yaml"))
        .merge(Yaml::file("sniff-pool.yml"))
        // Multi-word keys arrive snake_case, e.g. SNIFF_POOL_POOL_SIZE
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into());
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pool_size == 0 {
        return Err(ConfigError::Validation("Pool size must be greater than 0".into()).into());
    }

    if config.executable.trim().is_empty() {
        return Err(ConfigError::Validation("Executable must not be empty".into()).into());
    }

    split_command_line(&config.executable)
        .map_err(|e| ConfigError::Validation(format!("Executable is not usable: {}", e)))?;

    if config.report.trim().is_empty() {
        return Err(ConfigError::Validation("Report must not be empty".into()).into());
    }

    Ok(())
}
