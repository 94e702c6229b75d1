use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Executor, Pool, Postgres, Row};

use super::{AdmissionControl, Decision, Policy, SlidingWindow};
use crate::error::Error;

type Database = Postgres;

/// Admission store shared by every instance connected to the same database.
///
/// Each identifier owns one row; the check-and-consume holds that row's lock
/// for the length of one short transaction.
#[derive(Debug, Clone)]
pub struct PgAdmissionControl {
    pool: Pool<Database>,
    policy: Policy,
}

impl PgAdmissionControl {
    #[tracing::instrument(name = "PgAdmissionControl::new", skip(pool))]
    pub async fn new(pool: Pool<Database>, policy: Policy) -> Result<Self, Error> {
        pool.execute(
            "CREATE TABLE IF NOT EXISTS admission_windows (identifier VARCHAR PRIMARY KEY, data JSONB NOT NULL, expires_at TIMESTAMPTZ NOT NULL)",
        )
        .await?;
        pool.execute(
            "CREATE INDEX IF NOT EXISTS admission_windows_expires_at ON admission_windows (expires_at)",
        )
        .await?;

        Ok(Self { pool, policy })
    }

    /// Deletes a bounded batch of windows whose newest admission has left
    /// the window. Rows locked by an in-flight acquire are skipped.
    async fn sweep_expired(&self) -> Result<u64, Error> {
        let result = self
            .pool
            .execute(sqlx::query(
                "DELETE FROM admission_windows WHERE identifier IN (SELECT identifier FROM admission_windows WHERE expires_at < clock_timestamp() LIMIT 100 FOR UPDATE SKIP LOCKED)",
            ))
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AdmissionControl for PgAdmissionControl {
    #[tracing::instrument(skip(self))]
    async fn try_acquire(&self, identifier: &str) -> Result<Decision, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(Error::admission_unavailable_error)?;

        // the upsert takes the row lock even when a sweep has just removed
        // the row; clock_timestamp() is read after the lock is granted, so
        // every instance appends to the window in lock order with one clock
        let row = tx
            .fetch_one(
                sqlx::query(
                    "INSERT INTO admission_windows (identifier, data, expires_at) VALUES ($1, $2, clock_timestamp()) ON CONFLICT (identifier) DO UPDATE SET identifier = EXCLUDED.identifier RETURNING data, clock_timestamp() AS now",
                )
                .bind(identifier)
                .bind(Json(SlidingWindow::default())),
            )
            .await
            .map_err(Error::admission_unavailable_error)?;

        let Json(mut window): Json<SlidingWindow> = row
            .try_get("data")
            .map_err(Error::admission_unavailable_error)?;
        let now: DateTime<Utc> = row
            .try_get("now")
            .map_err(Error::admission_unavailable_error)?;

        let allowed = window.try_admit(&self.policy, now);

        let store = match window.expires_at(&self.policy) {
            Some(expires_at) => sqlx::query(
                "UPDATE admission_windows SET data = $2, expires_at = $3 WHERE identifier = $1",
            )
            .bind(identifier)
            .bind(Json(&window))
            .bind(expires_at),
            None => sqlx::query("DELETE FROM admission_windows WHERE identifier = $1")
                .bind(identifier),
        };

        tx.execute(store)
            .await
            .map_err(Error::admission_unavailable_error)?;

        tx.commit()
            .await
            .map_err(Error::admission_unavailable_error)?;

        // the decision is already durable; a failed sweep only delays cleanup
        if let Err(err) = self.sweep_expired().await {
            tracing::warn!(code = err.code, "expired window sweep failed");
        }

        Ok(Decision { allowed })
    }
}

#[test]
#[ignore = "requires DATABASE_URL pointing at a PostgreSQL instance"]
fn shared_store_never_over_admits() {
    use crate::db::PgPool;
    use std::sync::Arc;
    use tokio_test::block_on;

    block_on(async {
        let url = std::env::var("DATABASE_URL").unwrap();
        let PgPool(pool) = PgPool::new(&url, 5).await.unwrap();

        let admission = Arc::new(PgAdmissionControl::new(pool, Policy::default()).await.unwrap());
        let identifier = uuid::Uuid::new_v4().to_string();

        let attempts = (0..25).map(|_| {
            let admission = admission.clone();
            let identifier = identifier.clone();
            async move { admission.try_acquire(&identifier).await }
        });

        let admitted = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .filter(|decision| decision.allowed)
            .count();

        assert_eq!(admitted, 10);
    });
}

#[test]
#[ignore = "requires DATABASE_URL pointing at a PostgreSQL instance"]
fn expired_windows_are_deleted() {
    use crate::db::PgPool;
    use tokio_test::block_on;

    block_on(async {
        let url = std::env::var("DATABASE_URL").unwrap();
        let PgPool(pool) = PgPool::new(&url, 2).await.unwrap();

        let policy = Policy {
            capacity: 10,
            window: chrono::Duration::milliseconds(200),
        };
        let admission = PgAdmissionControl::new(pool.clone(), policy).await.unwrap();

        let stale = uuid::Uuid::new_v4().to_string();
        assert!(admission.try_acquire(&stale).await.unwrap().allowed);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        // any later acquire sweeps rows whose windows have fully decayed
        let fresh = uuid::Uuid::new_v4().to_string();
        assert!(admission.try_acquire(&fresh).await.unwrap().allowed);
        // rows left behind by other runs may fill the first batch
        while admission.sweep_expired().await.unwrap() > 0 {}

        let remaining = |identifier: String| {
            let pool = pool.clone();
            async move {
                sqlx::query("SELECT identifier FROM admission_windows WHERE identifier = $1")
                    .bind(identifier)
                    .fetch_optional(&pool)
                    .await
                    .unwrap()
                    .is_some()
            }
        };

        assert!(!remaining(stale.clone()).await);
        assert!(remaining(fresh).await);

        // a swept identifier starts over with a full quota
        assert!(admission.try_acquire(&stale).await.unwrap().allowed);
    });
}

#[tokio::test]
async fn unreachable_store_fails_closed() {
    use sqlx::postgres::PgPoolOptions;

    // nothing listens on port 1
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(std::time::Duration::from_millis(200))
        .connect_lazy("postgresql://nobody@127.0.0.1:1/nothing")
        .unwrap();

    let admission = PgAdmissionControl {
        pool,
        policy: Policy::default(),
    };

    let err = admission.try_acquire("global").await.unwrap_err();
    assert!(err.is_admission_unavailable_error());
}
