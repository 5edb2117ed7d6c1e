#![allow(dead_code)]

use sqlx::sqlite::SqlitePoolOptions;
use tool_tracker::{db, AppState};

/// Single-connection in-memory database with the schema applied.
pub async fn memory_state() -> AppState {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    db::migrate(&pool).await.expect("migrations");
    AppState::new(pool, std::env::temp_dir())
}

/// File-backed database in `dir`, opened the same way the server opens it.
pub async fn file_state(dir: &std::path::Path) -> AppState {
    let url = format!("sqlite://{}", dir.join("tools.db").display());
    let pool = db::connect(&url).await.expect("file pool");
    AppState::new(pool, dir.join("backups"))
}
