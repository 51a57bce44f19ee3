use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    /// Verbose logging of queue and dispatch activity
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Collector host, optionally with a port
    pub host: String,
    pub batch_path: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_batch_hits: usize,
    pub max_batch_bytes: usize,
    pub max_hit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Negative: manual only. Zero: immediate. Positive: periodic.
    pub interval_secs: f64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Zero keeps hits until they are delivered
    pub max_hit_age_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./hitline.db".to_string(),
            max_connections: 1,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "www.google-analytics.com".to_string(),
            batch_path: "/batch".to_string(),
            timeout_secs: 30,
            user_agent: concat!("hitline/", env!("CARGO_PKG_VERSION")).to_string(),
            max_batch_hits: 20,
            max_batch_bytes: 16 * 1024,
            max_hit_bytes: 8 * 1024,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120.0,
            initial_backoff_secs: 2,
            max_backoff_secs: 600,
            max_hit_age_secs: 4 * 60 * 60,
            channel_capacity: 10_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout_secs: 30.0 }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from `HITLINE_*` environment variables, reading a
    /// `.env` file first when one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let storage = StorageConfig {
            url: std::env::var("HITLINE_DATABASE_URL").unwrap_or(defaults.storage.url),
            max_connections: env_parse(
                "HITLINE_DATABASE_MAX_CONNECTIONS",
                defaults.storage.max_connections,
            )?,
        };

        let transport = TransportConfig {
            host: std::env::var("HITLINE_COLLECTOR_HOST").unwrap_or(defaults.transport.host),
            batch_path: std::env::var("HITLINE_COLLECTOR_PATH")
                .unwrap_or(defaults.transport.batch_path),
            timeout_secs: env_parse("HITLINE_HTTP_TIMEOUT_SECS", defaults.transport.timeout_secs)?,
            user_agent: std::env::var("HITLINE_USER_AGENT")
                .unwrap_or(defaults.transport.user_agent),
            max_batch_hits: env_parse("HITLINE_MAX_BATCH_HITS", defaults.transport.max_batch_hits)?,
            max_batch_bytes: env_parse(
                "HITLINE_MAX_BATCH_BYTES",
                defaults.transport.max_batch_bytes,
            )?,
            max_hit_bytes: env_parse("HITLINE_MAX_HIT_BYTES", defaults.transport.max_hit_bytes)?,
        };

        let dispatch = DispatchConfig {
            interval_secs: env_parse(
                "HITLINE_DISPATCH_INTERVAL_SECS",
                defaults.dispatch.interval_secs,
            )?,
            initial_backoff_secs: env_parse(
                "HITLINE_INITIAL_BACKOFF_SECS",
                defaults.dispatch.initial_backoff_secs,
            )?,
            max_backoff_secs: env_parse(
                "HITLINE_MAX_BACKOFF_SECS",
                defaults.dispatch.max_backoff_secs,
            )?,
            max_hit_age_secs: env_parse(
                "HITLINE_MAX_HIT_AGE_SECS",
                defaults.dispatch.max_hit_age_secs,
            )?,
            channel_capacity: env_parse(
                "HITLINE_CHANNEL_CAPACITY",
                defaults.dispatch.channel_capacity,
            )?,
        };

        let session = SessionConfig {
            timeout_secs: env_parse("HITLINE_SESSION_TIMEOUT_SECS", defaults.session.timeout_secs)?,
        };

        let debug = std::env::var("HITLINE_DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        if transport.max_batch_hits == 0 {
            tracing::warn!("HITLINE_MAX_BATCH_HITS is 0, falling back to 1");
        }

        let config = Config {
            storage,
            transport: TransportConfig {
                max_batch_hits: transport.max_batch_hits.max(1),
                ..transport
            },
            dispatch,
            session,
            debug,
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file (TOML, JSON or YAML by extension) and
    /// applies `HITLINE__SECTION__KEY` environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("HITLINE").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {path}"))?;

        let config = settings
            .try_deserialize::<Config>()
            .with_context(|| format!("invalid configuration in {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects intervals that cannot be turned into a schedule or timeout
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.dispatch.interval_secs.is_finite() {
            anyhow::bail!(
                "dispatch interval must be a finite number of seconds, got {}",
                self.dispatch.interval_secs
            );
        }
        if !self.session.timeout_secs.is_finite() || self.session.timeout_secs < 0.0 {
            anyhow::bail!(
                "session timeout must be a finite, non-negative number of seconds, got {}",
                self.session.timeout_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatch.interval_secs, 120.0);
        assert_eq!(config.session.timeout_secs, 30.0);
        assert_eq!(config.transport.max_batch_hits, 20);
        assert_eq!(config.dispatch.max_hit_age_secs, 14_400);
        assert!(!config.debug);
    }

    #[test]
    fn test_validate_rejects_non_finite_intervals() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.dispatch.interval_secs = f64::INFINITY;
        assert!(config.validate().is_err());
        config.dispatch.interval_secs = f64::NAN;
        assert!(config.validate().is_err());

        // Tiny and huge finite values are clamped by the schedule instead
        config.dispatch.interval_secs = 1e-12;
        assert!(config.validate().is_ok());

        config.session.timeout_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
debug = true

[dispatch]
interval_secs = -1.0

[transport]
host = "127.0.0.1:9000"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.debug);
        assert_eq!(config.dispatch.interval_secs, -1.0);
        assert_eq!(config.transport.host, "127.0.0.1:9000");
        // Untouched keys keep their defaults
        assert_eq!(config.transport.batch_path, "/batch");
        assert_eq!(config.session.timeout_secs, 30.0);
    }
}
