//! Durable FIFO job queue with a per-job visibility timeout.
//!
//! Jobs live in the `jobs` table of the state database. A reserved job stays
//! invisible until its time-to-run elapses, after which it is redelivered to
//! the next reserver; consumers must either delete or release every job they
//! reserve.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::time::sleep;

/// The single tube deployment jobs go through.
pub const DEPLOYMENT_JOBS_TUBE: &str = "deployer-deployments";

/// Some deployments include a lengthy pre-deploy step, so the visibility
/// timeout is generous.
pub const DEPLOYMENT_JOB_TIME_TO_RUN: Duration = Duration::from_secs(30 * 60);

const RESERVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("database request failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("bad job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The deploy id is the only field one should act upon. The names are carried
/// for log context only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentJob {
    pub deploy_id: i64,
    pub repository_name: String,
    pub environment_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobStats {
    pub releases: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    tube: String,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, tube: impl Into<String>) -> Self {
        Self {
            pool,
            tube: tube.into(),
        }
    }

    pub async fn put(&self, job: &DeploymentJob, ttr: Duration) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(job)?;
        let id = sqlx::query(
            "INSERT INTO jobs (tube, payload, ttr_seconds, ready_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&self.tube)
        .bind(payload)
        .bind(ttr.as_secs() as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Reserve the oldest visible job, waiting up to `block_timeout` for one
    /// to appear. Jobs whose reservation expired are redelivered here.
    pub async fn reserve(&self, block_timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            if let Some(job) = self.try_reserve().await? {
                return Ok(Some(job));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(RESERVE_POLL_INTERVAL).await;
        }
    }

    async fn try_reserve(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let row: Option<(i64, String, i64, i64)> = sqlx::query_as(
            "UPDATE jobs
             SET reserved_until = datetime(?1, '+' || ttr_seconds || ' seconds')
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE tube = ?2 AND ready_at <= ?1
                   AND (reserved_until IS NULL OR reserved_until < ?1)
                 ORDER BY id LIMIT 1
             )
             RETURNING id, payload, ttr_seconds, releases",
        )
        .bind(now)
        .bind(&self.tube)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, payload, _ttr, releases)) = row else {
            return Ok(None);
        };
        let body: DeploymentJob = serde_json::from_str(&payload)?;
        Ok(Some(Job {
            id,
            body,
            releases,
            pool: self.pool.clone(),
        }))
    }
}

/// A reserved job. Exactly one of [`Job::delete`] or [`Job::release`] must be
/// called before dropping it, otherwise the job only comes back after its
/// time-to-run elapses.
pub struct Job {
    id: i64,
    pub body: DeploymentJob,
    releases: i64,
    pool: SqlitePool,
}

impl Job {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            releases: self.releases,
        }
    }

    pub async fn delete(self) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(self.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Put the job back on the queue, visible again after `delay`.
    pub async fn release(self, delay: Duration) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET reserved_until = NULL, releases = releases + 1,
                 ready_at = datetime(?1, '+' || ?2 || ' seconds')
             WHERE id = ?3",
        )
        .bind(Utc::now())
        .bind(delay.as_secs() as i64)
        .bind(self.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dal::Sqlite;

    fn job(deploy_id: i64) -> DeploymentJob {
        DeploymentJob {
            deploy_id,
            repository_name: "webapp".into(),
            environment_name: "prod".into(),
        }
    }

    async fn queue() -> JobQueue {
        let dal = Sqlite::new_in_memory().await;
        JobQueue::new(dal.pool().clone(), DEPLOYMENT_JOBS_TUBE)
    }

    #[tokio::test]
    async fn jobs_come_out_in_fifo_order() {
        let queue = queue().await;
        queue.put(&job(1), DEPLOYMENT_JOB_TIME_TO_RUN).await.unwrap();
        queue.put(&job(2), DEPLOYMENT_JOB_TIME_TO_RUN).await.unwrap();

        let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body.deploy_id, 1);
        let second = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.body.deploy_id, 2);

        first.delete().await.unwrap();
        second.delete().await.unwrap();
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserved_jobs_are_invisible_until_ttr_elapses() {
        let queue = queue().await;
        queue.put(&job(1), Duration::from_secs(1)).await.unwrap();

        let reserved = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        // Past the TTR the job is redelivered.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let redelivered = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.body.deploy_id, 1);
        assert_eq!(redelivered.stats().releases, 0);

        redelivered.delete().await.unwrap();
        drop(reserved);
    }

    #[tokio::test]
    async fn release_counts_and_delays() {
        let queue = queue().await;
        queue.put(&job(7), DEPLOYMENT_JOB_TIME_TO_RUN).await.unwrap();

        let reserved = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        reserved.release(Duration::ZERO).await.unwrap();

        let again = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.stats().releases, 1);
        again.delete().await.unwrap();
    }

    #[tokio::test]
    async fn released_with_delay_is_not_immediately_visible() {
        let queue = queue().await;
        queue.put(&job(9), DEPLOYMENT_JOB_TIME_TO_RUN).await.unwrap();

        let reserved = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        reserved.release(Duration::from_secs(30)).await.unwrap();
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());
    }
}
