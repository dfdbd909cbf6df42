use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "CLOUDPROXY_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("cloudproxy.toml"))
        .merge(Json::file("cloudproxy.json"))
        .merge(Yaml::file("cloudproxy.yaml"))
        .merge(Yaml::file("cloudproxy.yml"))
        // CLOUDPROXY_TELEMETRY__GRAPHITE_SERVER=... etc.
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
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

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    apply_env_substitutions(config)
}

/// Checks the fully merged configuration. Run after CLI overrides are applied.
pub fn validate(config: &Config) -> Result<()> {
    if config.proxy.port == 0 {
        return Err(ConfigError::Validation("Proxy port must be greater than 0".into()).into());
    }

    if config.proxy.address.trim().is_empty() {
        return Err(ConfigError::Validation("Listen address must not be empty".into()).into());
    }

    if http::HeaderName::from_bytes(config.proxy.tracking_header.as_bytes()).is_err() {
        return Err(ConfigError::Validation(format!(
            "Tracking header '{}' is not a valid HTTP header name",
            config.proxy.tracking_header
        ))
        .into());
    }

    // tokio's bounded channel rejects a zero capacity
    if config.telemetry.queue_capacity == 0 {
        return Err(
            ConfigError::Validation("Telemetry queue capacity must be greater than 0".into())
                .into(),
        );
    }

    let prefix = &config.telemetry.metric_prefix;
    if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation(format!(
            "Metric prefix '{}' must be non-empty and contain no whitespace",
            prefix
        ))
        .into());
    }

    if let Some(server) = config.telemetry.backend() {
        let valid = server
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0))
            .unwrap_or(false);
        if !valid {
            return Err(ConfigError::Validation(format!(
                "Graphite server '{}' must be in host:port form",
                server
            ))
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.telemetry.graphite_server = substitute_env_vars(&config.telemetry.graphite_server)?;
    config.tls.ca_cert_path = substitute_path(&config.tls.ca_cert_path)?;
    config.tls.ca_key_path = substitute_path(&config.tls.ca_key_path)?;
    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(substitute_env_vars(&path.to_string_lossy())?))
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
