use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "AGENT_NETLOG_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("agent-netlog.toml"))
        .merge(Json::file("agent-netlog.json"))
        .merge(Yaml::file("agent-netlog.yaml"))
        .merge(Yaml::file("agent-netlog.yml"))
        // Override with environment variables (AGENT_NETLOG_ prefix, `__` nests)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
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
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.web_ui.enabled && config.proxy.port == config.web_ui.port {
        return Err(
            ConfigError::Validation("Proxy and Web UI ports must be different".into()).into(),
        );
    }

    let timeouts = [
        config.proxy.upstream_connect_timeout_ms,
        config.proxy.upstream_response_timeout_ms,
        config.proxy.upstream_body_idle_timeout_ms,
        config.proxy.client_idle_timeout_ms,
    ];
    if timeouts.contains(&0) {
        return Err(
            ConfigError::Validation("Proxy timeouts must be greater than 0".into()).into(),
        );
    }

    if config.audit.working_set_size == 0 {
        return Err(ConfigError::Validation(
            "Audit working set size must be greater than 0".into(),
        )
        .into());
    }

    if config.audit.body_limit_bytes == 0 {
        return Err(
            ConfigError::Validation("Audit body limit must be greater than 0".into()).into(),
        );
    }

    if !config.storage.capture_suffix.starts_with('.') || config.storage.capture_suffix.len() < 2 {
        return Err(ConfigError::Validation(format!(
            "Capture suffix '{}' must look like '.ext'",
            config.storage.capture_suffix
        ))
        .into());
    }

    if config.storage.log_file.is_empty()
        || config.storage.log_file.contains(['/', '\\'])
    {
        return Err(ConfigError::Validation(
            "Journal file name must be a bare file name".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.storage.logs_dir = substitute_path(&config.storage.logs_dir)?;

    if let Some(ca_dir) = &config.storage.ca_dir {
        config.storage.ca_dir = Some(substitute_path(ca_dir)?);
    }

    if let Some(ca_file) = &config.proxy.upstream_ca_file {
        config.proxy.upstream_ca_file = Some(substitute_path(ca_file)?);
    }

    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    substitute_env_vars(&path.to_string_lossy()).map(PathBuf::from)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];

        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }

        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}
