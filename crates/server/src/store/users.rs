// User profile and stats store. The sync engine only reads profiles and
// bumps counters; account management lives elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cinesync_common::types::{User, UserStat};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone)]
pub enum UserStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryUsers>>),
}

#[derive(Debug, Default)]
pub struct MemoryUsers {
    users: HashMap<Uuid, User>,
    stats: HashMap<Uuid, HashMap<&'static str, i64>>,
}

impl UserStore {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryUsers::default())))
    }

    pub async fn fetch(&self, user_id: Uuid) -> Result<Option<User>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
                    .context("failed to fetch user")?;
                row.as_ref().map(user_from_row).transpose()
            }
            Self::Memory(store) => Ok(store.read().await.users.get(&user_id).cloned()),
        }
    }

    /// Upsert-increment one of the closed set of per-user counters.
    pub async fn increment_stat(&self, user_id: Uuid, stat: UserStat) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                // Column comes from a closed enum, never from caller input.
                let column = stat.as_column();
                let sql = format!(
                    "INSERT INTO user_stats (user_id, {column}) VALUES ($1, 1) \
                     ON CONFLICT (user_id) DO UPDATE SET {column} = user_stats.{column} + 1"
                );
                sqlx::query(&sql)
                    .bind(user_id)
                    .execute(pool)
                    .await
                    .with_context(|| format!("failed to increment user stat {column}"))?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                *guard.stats.entry(user_id).or_default().entry(stat.as_column()).or_insert(0) +=
                    1;
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(&self, user: User) {
        if let Self::Memory(store) = self {
            store.write().await.users.insert(user.id, user);
        }
    }

    #[cfg(test)]
    pub(crate) async fn stat_for_tests(&self, user_id: Uuid, stat: UserStat) -> i64 {
        match self {
            Self::Memory(store) => store
                .read()
                .await
                .stats
                .get(&user_id)
                .and_then(|stats| stats.get(stat.as_column()))
                .copied()
                .unwrap_or(0),
            Self::Postgres(_) => 0,
        }
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id").context("missing id")?,
        username: row.try_get("username").context("missing username")?,
        display_name: row.try_get("display_name").context("missing display_name")?,
        avatar_url: row.try_get("avatar_url").context("missing avatar_url")?,
        created_at: row.try_get("created_at").context("missing created_at")?,
        last_active: row.try_get("last_active").context("missing last_active")?,
    })
}
