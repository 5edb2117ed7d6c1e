//! Plain SQL backups.
//!
//! A dump holds one statement per line: `BEGIN TRANSACTION;`, then for each
//! table its `CREATE TABLE` followed by one `INSERT` per row, then indexes,
//! then `COMMIT;`. Replaying it against an empty database rebuilds the data.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;

use crate::{errors::AppError, AppState};

const BACKUP_PREFIX: &str = "database_backup_";
const BACKUP_EXT: &str = "sql";
const BEGIN: &str = "BEGIN TRANSACTION;";
const COMMIT: &str = "COMMIT;";

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL expression rendering a column as a literal; CR/LF are spliced in
/// with `char()` so each INSERT stays on one line.
fn literal_expr(column: &str) -> String {
    format!(
        "replace(replace(quote({}), char(13), '''||char(13)||'''), char(10), '''||char(10)||''')",
        quote_ident(column)
    )
}

fn one_line(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One `INSERT` statement per row of `table`, in rowid order.
async fn row_inserts(pool: &SqlitePool, table: &str) -> Result<Vec<String>, AppError> {
    let columns = sqlx::query_scalar::<_, String>(
        "SELECT name FROM pragma_table_info($1) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;
    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let values = columns
        .iter()
        .map(|c| literal_expr(c))
        .collect::<Vec<_>>()
        .join(" || ',' || ");
    let select = format!(
        "SELECT 'INSERT INTO ' || {} || ' VALUES(' || {} || ');' FROM {} ORDER BY rowid",
        // the table name itself is emitted as a quoted SQL string
        format!("'{}'", quote_ident(table).replace('\'', "''")),
        values,
        quote_ident(table)
    );
    let inserts = sqlx::query_scalar::<_, String>(&select)
        .fetch_all(pool)
        .await?;
    Ok(inserts)
}

pub async fn dump_database(pool: &SqlitePool) -> Result<String, AppError> {
    let mut lines = vec![BEGIN.to_owned()];

    let tables = sqlx::query_as::<_, (String, String)>(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY rowid",
    )
    .fetch_all(pool)
    .await?;

    for (table, create_sql) in &tables {
        lines.push(format!("{};", one_line(create_sql)));
        lines.extend(row_inserts(pool, table).await?);
    }

    // id high-water marks of AUTOINCREMENT tables
    let has_sequence = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
    )
    .fetch_one(pool)
    .await?
        > 0;
    if has_sequence {
        lines.push("DELETE FROM sqlite_sequence;".to_owned());
        lines.extend(row_inserts(pool, "sqlite_sequence").await?);
    }

    let extras = sqlx::query_scalar::<_, String>(
        "SELECT sql FROM sqlite_master
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL
         ORDER BY rowid",
    )
    .fetch_all(pool)
    .await?;
    lines.extend(extras.iter().map(|sql| format!("{};", one_line(sql))));

    lines.push(COMMIT.to_owned());
    Ok(lines.join("\n") + "\n")
}

/// Writes a timestamped dump into the configured backup directory.
pub async fn backup_database(state: &AppState) -> Result<PathBuf, AppError> {
    backup_database_at(state, Utc::now()).await
}

/// Never overwrites: a second backup within the same second is refused.
pub(crate) async fn backup_database_at(
    state: &AppState,
    taken_at: DateTime<Utc>,
) -> Result<PathBuf, AppError> {
    tokio::fs::create_dir_all(&state.backup_dir).await?;
    let file_name = format!(
        "{}{}.{}",
        BACKUP_PREFIX,
        taken_at.format("%Y%m%d%H%M%S"),
        BACKUP_EXT
    );
    let path = state.backup_dir.join(&file_name);
    let dump = dump_database(&state.db_pool).await?;

    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            log::warn!("Backup {} already exists, not overwriting", path.display());
            return Err(AppError::BackupExists(file_name));
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(dump.as_bytes()).await?;
    file.sync_all().await?;
    log::info!("Backup created at {}", path.display());
    Ok(path)
}

/// Most recent backup in `dir`, by the timestamp in its file name.
pub fn latest_backup(dir: &Path) -> Result<PathBuf, AppError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(AppError::NoBackupFound),
        Err(e) => return Err(e.into()),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_backup = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(&format!(".{}", BACKUP_EXT)))
            .unwrap_or(false);
        if is_backup {
            backups.push(path);
        }
    }
    backups.sort();
    backups.pop().ok_or(AppError::NoBackupFound)
}

/// Replaces the whole database with the contents of a dump.
///
/// Existing tables are dropped and the dump replayed inside one transaction;
/// a dump that fails to apply leaves the current data untouched.
pub async fn restore_from_sql(pool: &SqlitePool, dump: &str) -> Result<(), AppError> {
    let body = dump
        .lines()
        .filter(|line| {
            let line = line.trim();
            line != BEGIN && line != COMMIT
        })
        .collect::<Vec<_>>()
        .join("\n");
    if body.trim().is_empty() {
        return Err(AppError::InvalidInput("Backup file is empty".to_owned()));
    }

    let mut tx = pool.begin().await?;
    let existing = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY rowid DESC",
    )
    .fetch_all(&mut *tx)
    .await?;
    for table in &existing {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::raw_sql(&body).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn restore_database(state: &AppState, path: &Path) -> Result<(), AppError> {
    let dump = tokio::fs::read_to_string(path).await?;
    restore_from_sql(&state.db_pool, &dump).await?;
    log::info!("Database restored from {}", path.display());
    Ok(())
}

/// Restores the newest backup in the configured directory.
pub async fn restore_latest(state: &AppState) -> Result<PathBuf, AppError> {
    let path = latest_backup(&state.backup_dir)?;
    restore_database(state, &path).await?;
    Ok(path)
}
