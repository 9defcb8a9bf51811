use crate::{env_optional, env_parse, ConfigError, FromEnv};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,

    /// Optional database number (0-15 for default Redis)
    pub database: Option<u8>,

    /// Optional username for Redis ACL
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Build the connection URL with credentials and database applied.
    ///
    /// Credentials already present in `url` win over `username`/`password`,
    /// and a database path already present wins over `database`.
    pub fn build_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("redis", self.url.as_str()),
        };

        let has_auth = rest.contains('@');
        let auth = match (&self.username, &self.password) {
            _ if has_auth => String::new(),
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };

        let rest = rest.trim_end_matches('/');
        let host_part = rest.rsplit('@').next().unwrap_or(rest);
        let db = match self.database {
            Some(db) if !host_part.contains('/') => format!("/{}", db),
            _ => String::new(),
        };

        format!("{}://{}{}{}", scheme, auth, rest, db)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl FromEnv for RedisConfig {
    /// Environment variables:
    /// - `REDIS_URL` or `REDIS_HOST` (required)
    /// - `REDIS_DATABASE` (optional)
    /// - `REDIS_USERNAME` (optional)
    /// - `REDIS_PASSWORD` (optional)
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_optional("REDIS_URL")
            .or_else(|| env_optional("REDIS_HOST"))
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        let database = match env_optional("REDIS_DATABASE") {
            Some(_) => Some(env_parse("REDIS_DATABASE", 0u8)?),
            None => None,
        };

        Ok(Self {
            url,
            database,
            username: env_optional("REDIS_USERNAME"),
            password: env_optional("REDIS_PASSWORD"),
        })
    }
}
