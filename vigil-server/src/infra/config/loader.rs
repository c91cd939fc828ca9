use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use super::{
    models::{
        Config, ConfigMetadata, ConfigWarnings, CorsConfig, DatabaseConfig,
        RedisConfig, ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["vigil.toml", "config/vigil.toml"];
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_MAX_CONNECTIONS: u32 = 20;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("DATABASE_URL is not set and no [database] url is configured")]
    MissingDatabaseUrl,
    #[error("database URL must use the postgres:// or postgresql:// scheme")]
    InvalidDatabaseUrl,
    #[error("redis URL must use the redis:// or rediss:// scheme")]
    InvalidRedisUrl,
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env = EnvConfig::gather();
        self.load_with(env, env_file_loaded)
    }

    /// Resolve against an already gathered environment.
    pub fn load_with(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());
        let (file, config_path) = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                (Some(read_file_config(&path)?), Some(path))
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => (Some(read_file_config(&path)?), Some(path)),
                None => (None, None),
            },
        };

        compose_config(
            file,
            env,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

fn compose_config(
    file: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();
    if file.is_none() {
        warnings.push_with_hint(
            "No vigil.toml detected; using environment variables and defaults",
            "Pass --config or set VIGIL_CONFIG to load a file",
        );
    }
    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        cors: file_cors,
        scan: mut scan,
    } = file.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(8080),
    };

    let url = env
        .database_url
        .or(file_database.url)
        .ok_or(ConfigLoadError::MissingDatabaseUrl)?;
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        return Err(ConfigLoadError::InvalidDatabaseUrl);
    }
    let database = DatabaseConfig {
        url,
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1),
    };

    let redis_url = match env.redis_url.or(file_redis.map(|r| r.url)) {
        Some(url) => url,
        None => {
            warnings.push(format!(
                "REDIS_URL not set; defaulting to {DEFAULT_REDIS_URL}"
            ));
            DEFAULT_REDIS_URL.to_string()
        }
    };
    if !(redis_url.starts_with("redis://") || redis_url.starts_with("rediss://"))
    {
        return Err(ConfigLoadError::InvalidRedisUrl);
    }

    let cors = CorsConfig {
        allowed_origins: env
            .cors_allowed_origins
            .or(file_cors.allowed_origins)
            .unwrap_or_default(),
    };

    if let Some(binary) = env.engine_binary {
        scan.engine.binary = binary;
    }
    if let Some(templates) = env.engine_templates {
        scan.engine.templates_dir = Some(templates);
    }
    if scan.probe.concurrency == 0 {
        warnings.push("scan.probe.concurrency is 0; probing one at a time");
    }

    Ok(ConfigLoad {
        config: Config {
            server,
            database,
            redis: RedisConfig { url: redis_url },
            cors,
            scan,
            metadata,
        },
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_with_database() -> EnvConfig {
        EnvConfig {
            database_url: Some("postgres://vigil@localhost/vigil".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let load = compose_config(
            None,
            env_with_database(),
            ConfigMetadata::default(),
        )
        .unwrap();

        assert_eq!(load.config.server.port, 8080);
        assert_eq!(load.config.redis.url, DEFAULT_REDIS_URL);
        assert_eq!(load.config.scan.lifecycle.default_page_size, 20);
        assert_eq!(load.warnings.items.len(), 2);
    }

    #[test]
    fn database_url_is_required_and_checked() {
        let missing =
            compose_config(None, EnvConfig::default(), ConfigMetadata::default());
        assert!(matches!(missing, Err(ConfigLoadError::MissingDatabaseUrl)));

        let env = EnvConfig {
            database_url: Some("mysql://localhost/vigil".into()),
            ..EnvConfig::default()
        };
        let invalid = compose_config(None, env, ConfigMetadata::default());
        assert!(matches!(invalid, Err(ConfigLoadError::InvalidDatabaseUrl)));
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
url = "postgresql://file@localhost/vigil"

[redis]
url = "redis://cache:6379"

[scan.lifecycle]
max_page_size = 50

[scan.reconcile]
task_sync_interval_secs = 5
"#
        )
        .unwrap();

        let env = EnvConfig {
            server_port: Some(9100),
            engine_binary: Some("/opt/nuclei".into()),
            ..EnvConfig::default()
        };
        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(env, false)
            .unwrap();
        let config = load.config;

        assert_eq!(config.server.bind_address(), "127.0.0.1:9100");
        assert_eq!(config.database.url, "postgresql://file@localhost/vigil");
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.scan.lifecycle.max_page_size, 50);
        assert_eq!(config.scan.lifecycle.default_page_size, 20);
        assert_eq!(config.scan.reconcile.task_sync_interval_secs, 5);
        assert_eq!(config.scan.engine.binary, PathBuf::from("/opt/nuclei"));
        assert_eq!(config.metadata.config_path.as_deref(), Some(file.path()));
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = ConfigLoader::new()
            .with_config_path("/nonexistent/vigil.toml")
            .load_with(env_with_database(), false);
        assert!(matches!(result, Err(ConfigLoadError::MissingConfig { .. })));
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server\nport = ").unwrap();

        let result = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(env_with_database(), false);
        assert!(matches!(result, Err(ConfigLoadError::Parse { .. })));
    }
}
