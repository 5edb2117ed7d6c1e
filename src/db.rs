use std::str::FromStr;

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};

use crate::{
    errors::AppError,
    lending, qr,
    structs::{BorrowedItem, Tool, ToolLog, Transaction, User, ACTION_RESET},
    utils::{hash_password, verify_password},
    AppState,
};

pub async fn connect(database_url: &str) -> Result<SqlitePool, AppError> {
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .read_only(false)
        .busy_timeout(std::time::Duration::from_secs(5));

    let db_pool = SqlitePool::connect_with(opts).await?;
    migrate(&db_pool).await?;
    Ok(db_pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!().run(pool).await?;
    log::info!("Database migrated successfully");
    Ok(())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---- tools ----

pub async fn list_tools(state: &AppState) -> Result<Vec<Tool>, AppError> {
    let tools = sqlx::query_as::<_, Tool>("SELECT * FROM tools ORDER BY id")
        .fetch_all(&state.db_pool)
        .await?;
    Ok(tools)
}

pub async fn find_tool(state: &AppState, id: i64) -> Result<Option<Tool>, AppError> {
    let tool = sqlx::query_as::<_, Tool>("SELECT * FROM tools WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await?;
    Ok(tool)
}

pub async fn get_tool(state: &AppState, id: i64) -> Result<Tool, AppError> {
    find_tool(state, id).await?.ok_or(AppError::ToolNotFound)
}

pub async fn get_tool_by_name(state: &AppState, name: &str) -> Result<Option<Tool>, AppError> {
    let tool = sqlx::query_as::<_, Tool>("SELECT * FROM tools WHERE name = $1")
        .bind(name)
        .fetch_optional(&state.db_pool)
        .await?;
    Ok(tool)
}

pub async fn available_tools(state: &AppState) -> Result<Vec<Tool>, AppError> {
    let tools = sqlx::query_as::<_, Tool>(
        "SELECT * FROM tools WHERE rented_by IS NULL
         AND id NOT IN (SELECT tool_id FROM transactions WHERE return_date IS NULL)
         ORDER BY name",
    )
    .fetch_all(&state.db_pool)
    .await?;
    Ok(tools)
}

/// Adds a tool and stores a freshly generated QR payload for it.
pub async fn add_tool(state: &AppState, name: &str, location: &str) -> Result<Tool, AppError> {
    let name = name.trim();
    let location = location.trim();
    if name.is_empty() || location.is_empty() {
        return Err(AppError::InvalidInput(
            "Tool name and location are required".to_owned(),
        ));
    }

    let mut tx = state.db_pool.begin().await?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO tools (name, location) VALUES ($1, $2) RETURNING id",
    )
    .bind(name)
    .bind(location)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::DuplicateToolName(name.to_owned())
        } else {
            AppError::DatabaseError(e)
        }
    })?;

    let tool = sqlx::query_as::<_, Tool>("UPDATE tools SET qr_code = $1 WHERE id = $2 RETURNING *")
        .bind(qr::encode_payload(id, name))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("Tool '{}' added with QR code (id {})", tool.name, tool.id);
    Ok(tool)
}

/// Removes a tool. A tool that is currently lent out cannot be removed.
/// Its closed transactions stay in the ledger.
pub async fn remove_tool(state: &AppState, id: i64) -> Result<Tool, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let tool = sqlx::query_as::<_, Tool>("SELECT * FROM tools WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::ToolNotFound)?;

    let open = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM transactions WHERE tool_id = $1 AND return_date IS NULL",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    if tool.rented_by.is_some() || open > 0 {
        return Err(AppError::ToolIsLent);
    }

    sqlx::query("DELETE FROM tools WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("Tool '{}' (id {}) removed", tool.name, tool.id);
    Ok(tool)
}

/// Replaces every tool's QR payload with a new one.
pub async fn regenerate_qr_codes(state: &AppState) -> Result<usize, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let tools = sqlx::query_as::<_, Tool>("SELECT * FROM tools")
        .fetch_all(&mut *tx)
        .await?;
    for tool in &tools {
        sqlx::query("UPDATE tools SET qr_code = $1 WHERE id = $2")
            .bind(qr::encode_payload(tool.id, &tool.name))
            .bind(tool.id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    log::info!("QR codes regenerated for {} tools", tools.len());
    Ok(tools.len())
}

// ---- users ----

pub async fn list_users(state: &AppState) -> Result<Vec<User>, AppError> {
    let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY id")
        .fetch_all(&state.db_pool)
        .await?;
    Ok(users)
}

pub async fn get_user(state: &AppState, id: i64) -> Result<User, AppError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or(AppError::UserNotFound)
}

pub async fn get_user_by_username(
    state: &AppState,
    username: &str,
) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(&state.db_pool)
        .await?;
    Ok(user)
}

pub async fn add_user(
    state: &AppState,
    username: &str,
    password: &str,
    is_admin: bool,
) -> Result<User, AppError> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::InvalidInput(
            "Username and password are required".to_owned(),
        ));
    }
    if get_user_by_username(state, username).await?.is_some() {
        return Err(AppError::DuplicateUsername(username.to_owned()));
    }

    let password_hash = hash_password(password)?;
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, password_hash, is_admin) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(username)
    .bind(password_hash)
    .bind(is_admin)
    .fetch_one(&state.db_pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::DuplicateUsername(username.to_owned())
        } else {
            AppError::DatabaseError(e)
        }
    })?;

    log::info!(
        "User '{}' added{}",
        user.username,
        if user.is_admin { " as admin" } else { "" }
    );
    Ok(user)
}

/// Removes a user. Users holding an open loan cannot be removed. Their
/// closed transactions and audit log entries stay.
pub async fn remove_user(state: &AppState, id: i64) -> Result<User, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::UserNotFound)?;

    let open = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM transactions WHERE user_id = $1 AND return_date IS NULL",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    if open > 0 {
        return Err(AppError::UserHasActiveLoan);
    }

    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("User '{}' (id {}) removed", user.username, user.id);
    Ok(user)
}

pub async fn authenticate(state: &AppState, username: &str, password: &str) -> Result<User, AppError> {
    let user = get_user_by_username(state, username.trim())
        .await?
        .ok_or(AppError::InvalidCredentials)?;
    if verify_password(password, &user.password_hash)? {
        Ok(user)
    } else {
        log::warn!("Failed login for user '{}'", user.username);
        Err(AppError::InvalidCredentials)
    }
}

/// Creates the bootstrap admin account unless the username is already taken.
pub async fn ensure_admin(state: &AppState, username: &str, password: &str) -> Result<User, AppError> {
    match get_user_by_username(state, username).await? {
        Some(user) => {
            if !user.is_admin {
                log::warn!("Bootstrap admin '{}' exists but is not an admin", username);
            }
            Ok(user)
        }
        None => add_user(state, username, password, true).await,
    }
}

// ---- ledger ----

pub async fn open_transaction_for_tool(
    state: &AppState,
    tool_id: i64,
) -> Result<Option<Transaction>, AppError> {
    let tx = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE tool_id = $1 AND return_date IS NULL",
    )
    .bind(tool_id)
    .fetch_optional(&state.db_pool)
    .await?;
    Ok(tx)
}

pub async fn transactions_for_tool(
    state: &AppState,
    tool_id: i64,
) -> Result<Vec<Transaction>, AppError> {
    let txs = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE tool_id = $1 ORDER BY id",
    )
    .bind(tool_id)
    .fetch_all(&state.db_pool)
    .await?;
    Ok(txs)
}

pub async fn open_loans(state: &AppState) -> Result<Vec<BorrowedItem>, AppError> {
    let items = sqlx::query_as::<_, BorrowedItem>(
        "SELECT t.id AS transaction_id, tools.id AS tool_id, tools.name AS tool_name,
                tools.location AS location, users.id AS user_id, users.username AS username,
                t.borrow_date AS borrow_date
         FROM transactions t
         JOIN tools ON t.tool_id = tools.id
         JOIN users ON t.user_id = users.id
         WHERE t.return_date IS NULL
         ORDER BY t.borrow_date",
    )
    .fetch_all(&state.db_pool)
    .await?;
    Ok(items)
}

/// Audit log, newest first.
pub async fn list_logs(state: &AppState) -> Result<Vec<ToolLog>, AppError> {
    let logs = sqlx::query_as::<_, ToolLog>("SELECT * FROM tool_logs ORDER BY id DESC")
        .fetch_all(&state.db_pool)
        .await?;
    Ok(logs)
}

pub async fn export_logs(state: &AppState) -> Result<String, AppError> {
    let logs = list_logs(state).await?;
    Ok(logs
        .iter()
        .map(ToolLog::export_line)
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Closes every open loan and marks all tools available.
pub async fn reset_rented_items(state: &AppState) -> Result<usize, AppError> {
    let now = Utc::now();
    let mut tx = state.db_pool.begin().await?;
    let tools = sqlx::query_as::<_, Tool>(
        "SELECT * FROM tools
         WHERE rented_by IS NOT NULL
            OR id IN (SELECT tool_id FROM transactions WHERE return_date IS NULL)",
    )
    .fetch_all(&mut *tx)
    .await?;
    sqlx::query("UPDATE tools SET rented_by = NULL WHERE rented_by IS NOT NULL")
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE transactions SET return_date = $1 WHERE return_date IS NULL")
        .bind(now)
        .execute(&mut *tx)
        .await?;
    for tool in &tools {
        lending::append_log(
            &mut *tx,
            &tool.name,
            tool.rented_by.as_deref().unwrap_or("system"),
            ACTION_RESET,
            Some("Marked available by reset"),
        )
        .await?;
    }
    tx.commit().await?;
    log::info!("All rented items have been reset to not rented ({} tools)", tools.len());
    Ok(tools.len())
}

/// Demo data: three users and ten tools, two of them lent out.
/// Entries that already exist are left alone.
pub async fn seed_test_data(state: &AppState) -> Result<(), AppError> {
    let users = [
        ("Alice", "password1"),
        ("Bob", "password2"),
        ("Charlie", "password3"),
    ];
    let tools = [
        ("Hammer", "Drawer 1"),
        ("Screwdriver", "Drawer 2"),
        ("Wrench", "Drawer 3"),
        ("Drill", "Under Desk 1"),
        ("Saw", "Drawer 4"),
        ("Pliers", "Drawer 5"),
        ("Tape Measure", "Drawer 6"),
        ("Level", "Drawer 7"),
        ("Chisel", "Drawer 8"),
        ("Utility Knife", "Under Desk 2"),
    ];
    let lent = [("Hammer", "Alice"), ("Screwdriver", "Bob")];

    for (username, password) in users {
        if get_user_by_username(state, username).await?.is_none() {
            add_user(state, username, password, false).await?;
        }
    }
    for (name, location) in tools {
        if get_tool_by_name(state, name).await?.is_none() {
            add_tool(state, name, location).await?;
        }
    }
    for (tool_name, username) in lent {
        let (Some(tool), Some(user)) = (
            get_tool_by_name(state, tool_name).await?,
            get_user_by_username(state, username).await?,
        ) else {
            continue;
        };
        if tool.state().is_available() {
            lending::lend_tool(state, tool.id, user.id).await?;
        }
    }
    log::info!("Test data added: {} users and {} tools", users.len(), tools.len());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_state;
    use super::*;

    #[tokio::test]
    async fn add_tool_stores_a_payload_pointing_at_itself() {
        let state = memory_state().await;
        let tool = add_tool(&state, "Hammer", "Drawer 1").await.unwrap();
        let payload = tool.qr_code.clone().unwrap();
        assert!(payload.starts_with(&format!("{}:Hammer:", tool.id)));
        assert_eq!(qr::decode_payload(&payload), Some(tool.id));
        assert!(tool.rented_by.is_none());
    }

    #[tokio::test]
    async fn tool_names_are_unique() {
        let state = memory_state().await;
        add_tool(&state, "Hammer", "Drawer 1").await.unwrap();
        let err = add_tool(&state, "Hammer", "Drawer 9").await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateToolName(_)));
        assert_eq!(list_tools(&state).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_tool_fields_are_rejected() {
        let state = memory_state().await;
        let err = add_tool(&state, "  ", "Drawer 1").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let state = memory_state().await;
        add_user(&state, "alice", "pw", false).await.unwrap();
        let err = add_user(&state, "alice", "other", true).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateUsername(name) if name == "alice"));
    }

    #[tokio::test]
    async fn authenticate_checks_the_password() {
        let state = memory_state().await;
        let alice = add_user(&state, "alice", "secret", false).await.unwrap();
        assert_eq!(authenticate(&state, "alice", "secret").await.unwrap().id, alice.id);
        assert!(matches!(
            authenticate(&state, "alice", "wrong").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&state, "nobody", "secret").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn lent_tool_and_borrowing_user_cannot_be_removed() {
        let state = memory_state().await;
        let tool = add_tool(&state, "Drill", "Under Desk 1").await.unwrap();
        let bob = add_user(&state, "bob", "pw", false).await.unwrap();
        lending::lend_tool(&state, tool.id, bob.id).await.unwrap();

        assert!(matches!(remove_tool(&state, tool.id).await, Err(AppError::ToolIsLent)));
        assert!(matches!(remove_user(&state, bob.id).await, Err(AppError::UserHasActiveLoan)));
        assert!(find_tool(&state, tool.id).await.unwrap().is_some());
        assert_eq!(get_user(&state, bob.id).await.unwrap().username, "bob");

        lending::return_tool(&state, tool.id, bob.id).await.unwrap();
        remove_tool(&state, tool.id).await.unwrap();
        remove_user(&state, bob.id).await.unwrap();
        assert!(matches!(get_tool(&state, tool.id).await, Err(AppError::ToolNotFound)));
        // audit trail survives both deletions
        assert_eq!(list_logs(&state).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ledger_outlives_removed_users_and_tools() {
        let state = memory_state().await;
        let saw = add_tool(&state, "Saw", "Drawer 4").await.unwrap();
        let alice = add_user(&state, "alice", "pw", false).await.unwrap();
        lending::lend_tool(&state, saw.id, alice.id).await.unwrap();
        lending::return_tool(&state, saw.id, alice.id).await.unwrap();
        let before = transactions_for_tool(&state, saw.id).await.unwrap();
        assert_eq!(before.len(), 1);

        remove_user(&state, alice.id).await.unwrap();
        assert_eq!(transactions_for_tool(&state, saw.id).await.unwrap(), before);

        remove_tool(&state, saw.id).await.unwrap();
        assert_eq!(transactions_for_tool(&state, saw.id).await.unwrap(), before);

        // fresh rows never take over the removed ids
        let saw2 = add_tool(&state, "Saw", "Drawer 4").await.unwrap();
        let alice2 = add_user(&state, "alice", "pw", false).await.unwrap();
        assert_ne!(saw2.id, saw.id);
        assert_ne!(alice2.id, alice.id);
        assert!(transactions_for_tool(&state, saw2.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_unknown_rows_reports_not_found() {
        let state = memory_state().await;
        assert!(matches!(remove_tool(&state, 99).await, Err(AppError::ToolNotFound)));
        assert!(matches!(remove_user(&state, 99).await, Err(AppError::UserNotFound)));
    }

    #[tokio::test]
    async fn reset_closes_every_open_loan() {
        let state = memory_state().await;
        seed_test_data(&state).await.unwrap();
        assert_eq!(open_loans(&state).await.unwrap().len(), 2);

        assert_eq!(reset_rented_items(&state).await.unwrap(), 2);
        assert!(open_loans(&state).await.unwrap().is_empty());
        assert!(list_tools(&state)
            .await
            .unwrap()
            .iter()
            .all(|t| t.rented_by.is_none()));
        let logs = list_logs(&state).await.unwrap();
        assert_eq!(logs.iter().filter(|l| l.action == ACTION_RESET).count(), 2);
    }

    #[tokio::test]
    async fn seeding_twice_is_harmless() {
        let state = memory_state().await;
        seed_test_data(&state).await.unwrap();
        seed_test_data(&state).await.unwrap();
        assert_eq!(list_users(&state).await.unwrap().len(), 3);
        assert_eq!(list_tools(&state).await.unwrap().len(), 10);
        assert_eq!(available_tools(&state).await.unwrap().len(), 8);
        let hammer = get_tool_by_name(&state, "Hammer").await.unwrap().unwrap();
        assert_eq!(hammer.rented_by.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn regenerate_replaces_tokens_but_keeps_ids() {
        let state = memory_state().await;
        let tool = add_tool(&state, "Saw", "Drawer 4").await.unwrap();
        assert_eq!(regenerate_qr_codes(&state).await.unwrap(), 1);
        let again = get_tool(&state, tool.id).await.unwrap();
        assert_ne!(again.qr_code, tool.qr_code);
        assert_eq!(qr::decode_payload(again.qr_code.as_deref().unwrap()), Some(tool.id));
    }

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let state = memory_state().await;
        let first = ensure_admin(&state, "root", "pw").await.unwrap();
        let second = ensure_admin(&state, "root", "other").await.unwrap();
        assert!(first.is_admin);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn export_logs_formats_one_line_per_entry() {
        let state = memory_state().await;
        let tool = add_tool(&state, "Level", "Drawer 7").await.unwrap();
        let alice = add_user(&state, "alice", "pw", false).await.unwrap();
        lending::lend_tool(&state, tool.id, alice.id).await.unwrap();
        let text = export_logs(&state).await.unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with(" - alice - Level - Action: LEND - Details: None"));
    }
}
