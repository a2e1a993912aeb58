//! Users and friendship edges.

use gnode_shared::UserId;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::timestamps;

const USER_COLUMNS: &str = "id, username, api_token, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Register a new user with a freshly generated API token.
    pub fn create_user(&self, username: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Invalid("empty username".into()));
        }

        let token = Uuid::new_v4().simple().to_string();
        let now = timestamps::now();

        self.conn()
            .execute(
                "INSERT INTO users (username, api_token, created_at) VALUES (?1, ?2, ?3)",
                params![username, token, timestamps::encode(now)],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Duplicate(format!("username '{username}'"))
                }
                other => StoreError::Sqlite(other),
            })?;

        let id = UserId(self.conn().last_insert_rowid());
        tracing::info!(user_id = %id, username, "user created");

        Ok(User {
            id,
            username: username.to_string(),
            api_token: token,
            created_at: now,
        })
    }

    pub fn user_by_id(&self, id: UserId) -> Result<User> {
        self.query_user("id = ?1", params![id.0])
    }

    pub fn user_by_name(&self, username: &str) -> Result<User> {
        self.query_user("username = ?1", params![username])
    }

    /// Look up the owner of an API token. Returns `None` for unknown tokens.
    pub fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        match self.query_user("api_token = ?1", params![token]) {
            Ok(user) => Ok(Some(user)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn query_user(&self, condition: &str, args: &[&dyn rusqlite::ToSql]) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE {condition}"),
                args,
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Friendships
    // ------------------------------------------------------------------

    /// Create a symmetric friendship edge. Re-adding an edge is a no-op.
    pub fn add_friendship(&self, a: UserId, b: UserId) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let now = timestamps::encode(timestamps::now());
        self.atomic(|db| {
            for (user, friend) in [(a, b), (b, a)] {
                db.conn().execute(
                    "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![user.0, friend.0, now],
                )?;
            }
            Ok::<(), StoreError>(())
        })?;
        tracing::debug!(a = %a, b = %b, "friendship added");
        Ok(())
    }

    /// Remove a friendship edge. Returns `true` if one existed.
    pub fn remove_friendship(&self, a: UserId, b: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM friendships
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            params![a.0, b.0],
        )?;
        Ok(affected > 0)
    }

    pub fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
                params![a.0, b.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let api_token: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    Ok(User {
        id: UserId(id),
        username,
        api_token,
        created_at: timestamps::column(3, &created_str)?,
    })
}
