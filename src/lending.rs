//! Lend/return lifecycle.
//!
//! Each tool is either available or lent. A lend is only accepted for an
//! available tool and a return only for a lent one; rejected calls leave no
//! trace. Every accepted call updates the tool, the ledger and the audit log
//! inside one database transaction that begins with a conditional write, so
//! two racing lends of the same tool serialise on SQLite's write lock and
//! the loser sees the tool as taken. The partial unique index on
//! `transactions(tool_id) WHERE return_date IS NULL` backs this up.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqliteConnection;

use crate::{
    db::{self, is_unique_violation},
    errors::AppError,
    structs::{Transaction, ACTION_LEND, ACTION_RETURN},
    AppState,
};

#[derive(Debug, Clone)]
pub struct ReturnReceipt {
    pub transaction: Transaction,
    pub tool_name: String,
    pub borrower: String,
    pub duration: TimeDelta,
}

/// Lends `tool_id` to `user_id`.
pub async fn lend_tool(state: &AppState, tool_id: i64, user_id: i64) -> Result<Transaction, AppError> {
    let user = db::get_user(state, user_id).await?;
    let now = Utc::now();

    let mut tx = state.db_pool.begin().await?;
    let claimed = sqlx::query("UPDATE tools SET rented_by = $1 WHERE id = $2 AND rented_by IS NULL")
        .bind(&user.username)
        .bind(tool_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if claimed == 0 {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tools WHERE id = $1")
            .bind(tool_id)
            .fetch_one(&mut *tx)
            .await?;
        return Err(if exists == 0 {
            AppError::ToolNotFound
        } else {
            AppError::AlreadyLent
        });
    }

    let transaction = sqlx::query_as::<_, Transaction>(
        "INSERT INTO transactions (user_id, tool_id, borrow_date) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(user.id)
    .bind(tool_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::AlreadyLent
        } else {
            AppError::DatabaseError(e)
        }
    })?;

    let tool_name = tool_name(&mut *tx, tool_id).await?;
    append_log(&mut *tx, &tool_name, &user.username, ACTION_LEND, None).await?;
    tx.commit().await?;

    log::info!(
        "LEND: User {} ({}) - Tool {} ({})",
        user.username,
        user.id,
        tool_name,
        tool_id
    );
    Ok(transaction)
}

/// Returns `tool_id`. `user_id` is whoever hands the tool back, which need
/// not be the borrower.
pub async fn return_tool(state: &AppState, tool_id: i64, user_id: i64) -> Result<ReturnReceipt, AppError> {
    let returner = db::get_user(state, user_id).await?;
    let now = Utc::now();

    let mut tx = state.db_pool.begin().await?;
    let closed = sqlx::query_as::<_, Transaction>(
        "UPDATE transactions SET return_date = $1
         WHERE tool_id = $2 AND return_date IS NULL
         RETURNING *",
    )
    .bind(now)
    .bind(tool_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(transaction) = closed else {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tools WHERE id = $1")
            .bind(tool_id)
            .fetch_one(&mut *tx)
            .await?;
        return Err(if exists == 0 {
            AppError::ToolNotFound
        } else {
            AppError::NoActiveLoan
        });
    };

    sqlx::query("UPDATE tools SET rented_by = NULL WHERE id = $1")
        .bind(tool_id)
        .execute(&mut *tx)
        .await?;

    let borrower = sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE id = $1")
        .bind(transaction.user_id)
        .fetch_one(&mut *tx)
        .await?;
    let tool_name = tool_name(&mut *tx, tool_id).await?;

    let duration = now - transaction.borrow_date;
    let mut details = format!("Duration: {}", format_duration(duration));
    if returner.username != borrower {
        details.push_str(&format!(", returned by {}", returner.username));
    }
    append_log(&mut *tx, &tool_name, &borrower, ACTION_RETURN, Some(&details)).await?;
    tx.commit().await?;

    log::info!(
        "RETURN: User {} ({}) - Tool {} ({}) - {}",
        borrower,
        transaction.user_id,
        tool_name,
        tool_id,
        details
    );
    Ok(ReturnReceipt {
        transaction,
        tool_name,
        borrower,
        duration,
    })
}

async fn tool_name(conn: &mut SqliteConnection, tool_id: i64) -> Result<String, AppError> {
    let name = sqlx::query_scalar::<_, String>("SELECT name FROM tools WHERE id = $1")
        .bind(tool_id)
        .fetch_one(conn)
        .await?;
    Ok(name)
}

pub(crate) async fn append_log(
    conn: &mut SqliteConnection,
    tool_name: &str,
    username: &str,
    action: &str,
    details: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO tool_logs (timestamp, tool_name, username, action, details)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Utc::now())
    .bind(tool_name)
    .bind(username)
    .bind(action)
    .bind(details)
    .execute(conn)
    .await?;
    Ok(())
}

/// Renders a loan duration as `"{days}d {hours}h {minutes}m"`.
pub fn format_duration(duration: TimeDelta) -> String {
    let secs = duration.num_seconds().max(0);
    format!(
        "{}d {}h {}m",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60
    )
}

/// Elapsed time of a loan that is still open.
pub fn loan_age(borrow_date: DateTime<Utc>) -> TimeDelta {
    Utc::now() - borrow_date
}
