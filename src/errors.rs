use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use qrcode::types::QrError;
use sqlx::migrate::MigrateError;
use sqlx::Error as SqlxError;
use std::env::VarError;
use thiserror::Error;
use zip::result::ZipError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Tool not found")]
    ToolNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Tool is already lent out")]
    AlreadyLent,

    #[error("No active lending record found for this tool")]
    NoActiveLoan,

    #[error("Username already exists: {0}")]
    DuplicateUsername(String),

    #[error("A tool with this name already exists: {0}")]
    DuplicateToolName(String),

    #[error("Tool is currently lent out and cannot be removed")]
    ToolIsLent,

    #[error("User still has tools lent out and cannot be removed")]
    UserHasActiveLoan,

    #[error("Incorrect username or password")]
    InvalidCredentials,

    #[error("Admin access required")]
    Forbidden,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No backup files found")]
    NoBackupFound,

    #[error("Backup already exists: {0}")]
    BackupExists(String),

    #[error("Password error: {0}")]
    PasswordError(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),

    #[error("Migration error: {0}")]
    MigrationError(#[from] MigrateError),

    #[error("Template error: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] VarError),

    #[error("QR code error: {0}")]
    QrCodeError(#[from] QrError),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Archive error: {0}")]
    ArchiveError(#[from] ZipError),
}

impl AppError {
    /// True for conditions caused by the request rather than the server.
    pub fn is_user_facing(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ToolNotFound | AppError::UserNotFound | AppError::NoBackupFound => {
                StatusCode::NOT_FOUND
            }
            AppError::AlreadyLent
            | AppError::NoActiveLoan
            | AppError::DuplicateUsername(_)
            | AppError::DuplicateToolName(_)
            | AppError::ToolIsLent
            | AppError::UserHasActiveLoan
            | AppError::BackupExists(_) => StatusCode::CONFLICT,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::PasswordError(_)
            | AppError::IdentityError(_)
            | AppError::ConfigError(_)
            | AppError::DatabaseError(_)
            | AppError::MigrationError(_)
            | AppError::TemplateError(_)
            | AppError::IoError(_)
            | AppError::EnvVarError(_)
            | AppError::QrCodeError(_)
            | AppError::ImageError(_)
            | AppError::ArchiveError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = if self.is_user_facing() {
            self.to_string()
        } else {
            log::error!("{}", self);
            "Internal server error".to_owned()
        };
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(body)
    }
}

impl From<AppError> for std::io::Error {
    fn from(err: AppError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        assert_eq!(AppError::ToolNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::AlreadyLent.status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::NoActiveLoan.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::DuplicateUsername("alice".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(AppError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::BackupExists("database_backup_20250101000000.sql".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert!(AppError::UserNotFound.is_user_facing());
    }

    #[test]
    fn server_errors_hide_details() {
        let err = AppError::ConfigError("SESSION_KEY too short".into());
        assert!(!err.is_user_facing());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
