use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Tool {
    pub id: i64,
    pub name: String,
    pub location: String,
    pub qr_code: Option<String>,
    pub rented_by: Option<String>,
}

impl Tool {
    pub fn state(&self) -> ToolState {
        match &self.rented_by {
            Some(username) => ToolState::Lent(username.clone()),
            None => ToolState::Available,
        }
    }
}

/// Lending state of a single tool.
///
/// The only transitions are `Available -> Lent` (lend) and
/// `Lent -> Available` (return).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolState {
    Available,
    Lent(String),
}

impl ToolState {
    pub fn is_available(&self) -> bool {
        matches!(self, ToolState::Available)
    }
}

#[derive(Serialize, Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub tool_id: i64,
    pub borrow_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        self.return_date.is_none()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ToolLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub username: String,
    pub action: String,
    pub details: Option<String>,
}

impl ToolLog {
    /// One line of the plain-text log export.
    pub fn export_line(&self) -> String {
        format!(
            "{} - {} - {} - Action: {} - Details: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.username,
            self.tool_name,
            self.action,
            self.details.as_deref().unwrap_or("None")
        )
    }
}

/// A currently borrowed tool joined with its borrower.
#[derive(Serialize, Debug, Clone, FromRow)]
pub struct BorrowedItem {
    pub transaction_id: i64,
    pub tool_id: i64,
    pub tool_name: String,
    pub location: String,
    pub user_id: i64,
    pub username: String,
    pub borrow_date: DateTime<Utc>,
}

pub const ACTION_LEND: &str = "LEND";
pub const ACTION_RETURN: &str = "RETURN";
pub const ACTION_RESET: &str = "RESET";
