//! Application configuration

use std::env;

/// Minimum accepted length for the webhook signing secret
const MIN_WEBHOOK_SECRET_LEN: usize = 16;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Webhooks
    pub polar_webhook_secret: String,
    pub max_webhook_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),

            // Webhooks
            polar_webhook_secret: {
                let secret = env::var("POLAR_WEBHOOK_SECRET")
                    .map_err(|_| ConfigError::Missing("POLAR_WEBHOOK_SECRET"))?;
                if secret.trim().len() < MIN_WEBHOOK_SECRET_LEN {
                    return Err(ConfigError::WeakSecret(
                        "POLAR_WEBHOOK_SECRET must be at least 16 characters",
                    ));
                }
                secret.trim().to_string()
            },
            max_webhook_body_bytes: env::var("MAX_WEBHOOK_BODY_BYTES")
                .unwrap_or_else(|_| "1048576".to_string()) // 1MB default
                .parse()
                .unwrap_or(1048576),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure config tests run serially (they modify shared env vars)
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("POLAR_WEBHOOK_SECRET");
        env::remove_var("BIND_ADDRESS");
    }

    #[test]
    fn test_webhook_secret_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        // === Missing secret ===
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Missing("POLAR_WEBHOOK_SECRET"))
        ));

        // === Short secret ===
        env::set_var("POLAR_WEBHOOK_SECRET", "too-short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        // === Valid secret, defaults elsewhere ===
        env::set_var("POLAR_WEBHOOK_SECRET", "whsec_c2VjcmV0LXNlY3JldC1zZWNyZXQ=");
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert!(config.run_migrations);

        cleanup_config();
    }

    #[test]
    fn test_database_url_required() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        cleanup_config();
        env::set_var("POLAR_WEBHOOK_SECRET", "a-long-enough-secret-value");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        cleanup_config();
    }
}
