use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::storage::StorageMedium;

/// Redis-backed [`StorageMedium`], for coordinating holders across
/// processes and hosts.
///
/// Deliberately a plain key/value medium: no `SETNX`, no server-side TTLs.
/// Exclusion and expiry come from [`SharedStore`](crate::SharedStore)'s
/// settle protocol, which is what gets exercised against media that cannot
/// offer compare-and-swap at all.
#[derive(Clone)]
pub struct RedisMedium {
    client: ConnectionManager,
}

impl RedisMedium {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
    ) -> Result<Self> {
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { client: connection })
    }
}

#[async_trait]
impl StorageMedium for RedisMedium {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.client.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.client.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        Ok(keys)
    }
}
