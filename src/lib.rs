#[macro_use]
extern crate lazy_static;

use std::path::PathBuf;

use sqlx::SqlitePool;
use tera::Tera;

pub mod admin;
pub mod backup;
pub mod config;
pub mod db;
pub mod errors;
pub mod lending;
pub mod qr;
pub mod routes;
pub mod structs;
pub mod utils;

pub use errors::AppError;

#[derive(Debug, Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub backup_dir: PathBuf,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, backup_dir: impl Into<PathBuf>) -> Self {
        AppState {
            db_pool,
            backup_dir: backup_dir.into(),
        }
    }
}

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = match Tera::new("templates/**/*") {
            Ok(t) => t,
            Err(e) => {
                log::error!("Parsing error(s): {}", e);
                ::std::process::exit(1);
            }
        };
        tera.autoescape_on(vec![".html"]);
        tera
    };
}
