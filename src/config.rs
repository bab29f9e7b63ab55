use std::env;
use std::str::FromStr;

error_chain! {
    foreign_links {
        Var(env::VarError);
    }

    errors {
        InvalidValue(key: &'static str, value: String) {
            description("invalid configuration value")
            display("invalid value for {}: {:?}", key, value)
        }
    }
}

/// Runtime settings read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// Mixed into every token signing key alongside the user's password hash.
    pub secret_key: String,
    /// Base URL used when building verification and reset links.
    pub public_url: String,
    pub pool_size: u32,
    pub pool_timeout_secs: u64,
    pub auth_token_ttl_hours: i64,
    pub verify_token_ttl_hours: i64,
    pub reset_token_ttl_minutes: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "postgres://localhost/authors_haven".to_owned(),
            secret_key: "development-secret".to_owned(),
            public_url: "http://localhost:8000".to_owned(),
            pool_size: 10,
            pool_timeout_secs: 30,
            auth_token_ttl_hours: 24 * 7,
            verify_token_ttl_hours: 24,
            reset_token_ttl_minutes: 60,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        let defaults = Settings::default();
        Ok(Settings {
            database_url: env::var("DATABASE_URL")?,
            secret_key: env::var("SECRET_KEY")?,
            public_url: optional("PUBLIC_URL")?
                .unwrap_or(defaults.public_url)
                .trim_end_matches('/')
                .to_owned(),
            pool_size: parsed("DATABASE_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            pool_timeout_secs: parsed("DATABASE_POOL_TIMEOUT_SECS")?
                .unwrap_or(defaults.pool_timeout_secs),
            auth_token_ttl_hours: parsed("AUTH_TOKEN_TTL_HOURS")?
                .unwrap_or(defaults.auth_token_ttl_hours),
            verify_token_ttl_hours: parsed("VERIFY_TOKEN_TTL_HOURS")?
                .unwrap_or(defaults.verify_token_ttl_hours),
            reset_token_ttl_minutes: parsed("RESET_TOKEN_TTL_MINUTES")?
                .unwrap_or(defaults.reset_token_ttl_minutes),
        })
    }

    pub fn link(&self, path: &str) -> String {
        format!("{}/{}", self.public_url, path.trim_start_matches('/'))
    }
}

fn optional(key: &'static str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parsed<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match optional(key)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ErrorKind::InvalidValue(key, raw).into()),
        None => Ok(None),
    }
}
