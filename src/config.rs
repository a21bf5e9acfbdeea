//! Configuration file
//!
//! A single JSON object. Every field is optional; defaults suit local
//! policy testing. Loaded once by the CLI and validated before use.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{JwtConfig, JwtManager, Role, RoleCatalog, RoleResolver};
use crate::cli::{CliError, CliResult};
use crate::engine::{Engine, EngineSettings};
use crate::eval::TableSource;
use crate::observability::LogFormat;
use crate::policy::PolicyRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HS256 secret used to verify and mint tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    /// Lifetime of tokens minted by the `token` command
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: i64,

    /// Roles added to the built-in catalog
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Abort statements running longer than this (optional)
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,

    /// Memoize context functions and uncorrelated subqueries per statement
    #[serde(default = "default_true")]
    pub session_cache: bool,

    /// Worker threads for fixture runs
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_jwt_secret() -> String {
    JwtConfig::default().secret
}
fn default_jwt_issuer() -> String {
    JwtConfig::default().issuer
}
fn default_jwt_audience() -> String {
    JwtConfig::default().audience
}
fn default_token_ttl_minutes() -> i64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
            token_ttl_minutes: default_token_ttl_minutes(),
            roles: Vec::new(),
            statement_timeout_ms: None,
            session_cache: true,
            workers: default_workers(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> CliResult<()> {
        if self.jwt_secret.is_empty() {
            return Err(CliError::config_error("jwt_secret must not be empty"));
        }

        if self.token_ttl_minutes <= 0 {
            return Err(CliError::config_error("token_ttl_minutes must be > 0"));
        }

        if self.workers == 0 {
            return Err(CliError::config_error("workers must be > 0"));
        }

        if self.statement_timeout_ms == Some(0) {
            return Err(CliError::config_error(
                "statement_timeout_ms must be > 0 when set",
            ));
        }

        // Duplicates and invalid names surface here rather than at first use
        self.role_catalog()?;

        Ok(())
    }

    pub fn jwt_config(&self) -> JwtConfig {
        JwtConfig {
            secret: self.jwt_secret.clone(),
            access_token_ttl: chrono::Duration::minutes(self.token_ttl_minutes),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
        }
    }

    pub fn role_catalog(&self) -> CliResult<RoleCatalog> {
        let mut catalog = RoleCatalog::default();
        for role in &self.roles {
            if catalog.get(&role.name).is_some() {
                return Err(CliError::config_error(format!(
                    "Role '{}' is already defined",
                    role.name
                )));
            }
            catalog
                .register(role.clone())
                .map_err(|e| CliError::config_error(format!("Invalid role: {}", e)))?;
        }
        Ok(catalog)
    }

    pub fn resolver(&self) -> CliResult<RoleResolver> {
        Ok(RoleResolver::new(
            JwtManager::new(self.jwt_config()),
            self.role_catalog()?,
        ))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            statement_timeout: self.statement_timeout_ms.map(Duration::from_millis),
            session_cache: self.session_cache,
        }
    }

    /// Build an engine over `registry` and `source`
    pub fn engine(
        &self,
        registry: Arc<PolicyRegistry>,
        source: Arc<dyn TableSource>,
    ) -> CliResult<Engine> {
        Ok(Engine::new(self.resolver()?, registry, source).with_settings(self.engine_settings()))
    }
}
