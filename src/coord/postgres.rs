use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::CoordinationStore;
use crate::error::{LedgerError, LedgerResult};

/// Coordination store on `coord_kv` / `coord_counters`.
///
/// Each operation is one statement, so PostgreSQL row locking provides the
/// atomicity. Expired keys are treated as absent.
pub struct PgCoordStore {
    pool: PgPool,
}

impl PgCoordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> LedgerError {
    LedgerError::CoordinationUnavailable(e.to_string())
}

fn secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

#[async_trait]
impl CoordinationStore for PgCoordStore {
    async fn incr_counter(&self, key: &str, seed: i64, delta: i64) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"INSERT INTO coord_counters (key, value) VALUES ($1, $2 + $3)
               ON CONFLICT (key) DO UPDATE SET value = coord_counters.value + $3
               RETURNING value"#,
        )
        .bind(key)
        .bind(seed)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        row.try_get("value").map_err(unavailable)
    }

    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"INSERT INTO coord_kv (key, token, expires_at)
               VALUES ($1, $2, NOW() + make_interval(secs => $3))
               ON CONFLICT (key) DO UPDATE
                   SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                   WHERE coord_kv.expires_at <= NOW()
               RETURNING key"#,
        )
        .bind(key)
        .bind(token)
        .bind(secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.is_some())
    }

    async fn compare_and_renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"UPDATE coord_kv SET expires_at = NOW() + make_interval(secs => $3)
               WHERE key = $1 AND token = $2 AND expires_at > NOW()"#,
        )
        .bind(key)
        .bind(token)
        .bind(secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> LedgerResult<bool> {
        let result = sqlx::query("DELETE FROM coord_kv WHERE key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn store() -> PgCoordStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let db = Database::connect(&url, 2).await.expect("connect");
        let (_, coord) = db.open_stores().await.expect("schema");
        coord
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_set_nx_and_compare_and_delete() {
        let store = store().await;
        let key = format!("test:lock:{}", uuid::Uuid::new_v4());
        assert!(store.set_nx(&key, "a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.set_nx(&key, "b", Duration::from_secs(30)).await.unwrap());
        assert!(store.compare_and_renew(&key, "a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.compare_and_delete(&key, "b").await.unwrap());
        assert!(store.compare_and_delete(&key, "a").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_counter_seed() {
        let store = store().await;
        let key = format!("test:counter:{}", uuid::Uuid::new_v4());
        assert_eq!(store.incr_counter(&key, 1000, 7).await.unwrap(), 1007);
        assert_eq!(store.incr_counter(&key, 1000, 3).await.unwrap(), 1010);
    }
}
