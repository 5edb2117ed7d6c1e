use std::{env, path::PathBuf};

use crate::errors::AppError;

/// Minimum length accepted by `actix_web::cookie::Key::from`.
pub const MIN_SESSION_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub session_key: Vec<u8>,
    pub backup_dir: PathBuf,
    pub seed_test_data: bool,
    pub admin: Option<(String, String)>,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://tool_tracker.db".to_owned());
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = match lookup("PORT") {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| AppError::ConfigError(format!("PORT: {}", e)))?,
            None => 8080,
        };

        let session_key = lookup("SESSION_KEY")
            .ok_or_else(|| AppError::ConfigError("SESSION_KEY is not set".to_owned()))?
            .into_bytes();
        if session_key.len() < MIN_SESSION_KEY_LEN {
            return Err(AppError::ConfigError(format!(
                "SESSION_KEY must be at least {} bytes",
                MIN_SESSION_KEY_LEN
            )));
        }

        let backup_dir = PathBuf::from(lookup("BACKUP_DIR").unwrap_or_else(|| "backups".to_owned()));
        let seed_test_data = lookup("SEED_TEST_DATA")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let admin = match (lookup("ADMIN_USERNAME"), lookup("ADMIN_PASSWORD")) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        };

        Ok(Config {
            database_url,
            host,
            port,
            session_key,
            backup_dir,
            seed_test_data,
            admin,
        })
    }
}
