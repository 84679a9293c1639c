// Storage collaborators consumed by the sync engine.
//
// Each store is a Postgres-or-memory enum: Postgres in production, the
// memory variant as the test double with identical semantics. Writes are
// always persisted before anything is broadcast.

pub mod messages;
pub mod pool;
pub mod rooms;
pub mod users;

use anyhow::Result;

use self::messages::MessageStore;
use self::pool::{check_pool_health, create_pg_pool, PoolConfig};
use self::rooms::RoomStore;
use self::users::UserStore;

/// The three collaborator interfaces, sharing one connection pool.
#[derive(Clone)]
pub struct Stores {
    pub rooms: RoomStore,
    pub messages: MessageStore,
    pub users: UserStore,
}

impl Stores {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pg_pool(database_url, config).await?;
        check_pool_health(&pool).await?;

        Ok(Self {
            rooms: RoomStore::Postgres(pool.clone()),
            messages: MessageStore::Postgres(pool.clone()),
            users: UserStore::Postgres(pool),
        })
    }

    #[cfg(test)]
    pub(crate) fn memory() -> Self {
        Self {
            rooms: RoomStore::for_tests(),
            messages: MessageStore::for_tests(),
            users: UserStore::for_tests(),
        }
    }
}
