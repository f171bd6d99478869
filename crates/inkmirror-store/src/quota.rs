//! Quota ledger repository
//!
//! Atomic per-user counters with billing-period reset and durable threshold
//! events. The `consume` path is the only writer of `used`, and it mutates
//! through a conditional UPDATE checked by affected-row count, so concurrent
//! consumers can never push `used` past `limit`. The threshold event is
//! inserted in the same transaction as the counter update.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use inkmirror_core::domain::newtypes::UserId;
use inkmirror_core::domain::{
    threshold_crossing, NotifiedThreshold, QuotaCheck, QuotaKind, QuotaSnapshot,
    QuotaThresholdCrossed, UNLIMITED,
};

use crate::time::{fmt_ts, parse_ts};
use crate::StoreError;

/// Length of a quota period
const PERIOD_DAYS: i64 = 30;

/// Result of a successful consume
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeReceipt {
    /// Pages debited
    pub consumed: i64,
    /// Headroom left after the debit (`i64::MAX` when unlimited)
    pub remaining: i64,
    /// Threshold event recorded by this consume, if any
    pub crossed: Option<QuotaThresholdCrossed>,
}

/// A durable, undispatched threshold event
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuotaEvent {
    /// Row id, used to mark dispatch
    pub id: i64,
    /// User whose ledger crossed
    pub user_id: UserId,
    /// Metered resource
    pub kind: QuotaKind,
    /// The crossing itself
    pub event: QuotaThresholdCrossed,
}

/// Repository for quota ledgers and threshold events
pub struct QuotaRepository {
    pool: SqlitePool,
}

impl QuotaRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensures a ledger row exists for `(user, kind)` with the given limit
    ///
    /// Existing rows keep their counters; only the limit is refreshed (tier
    /// changes take effect without touching consumption).
    pub async fn ensure_ledger(
        &self,
        user_id: &UserId,
        kind: QuotaKind,
        limit: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO quota_ledgers \
             (user_id, kind, limit_pages, used, period_start, reset_at, last_notified_threshold) \
             VALUES (?, ?, ?, 0, ?, ?, 0) \
             ON CONFLICT (user_id, kind) DO UPDATE SET limit_pages = excluded.limit_pages",
        )
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .bind(limit)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now + Duration::days(PERIOD_DAYS)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read-only check whether `n` pages fit in the remaining headroom
    pub async fn check(
        &self,
        user_id: &UserId,
        kind: QuotaKind,
        n: i64,
    ) -> Result<QuotaCheck, StoreError> {
        let snapshot = self.observe(user_id, kind).await?;
        if snapshot.limit < 0 {
            return Ok(QuotaCheck::Ok);
        }
        let remaining = snapshot.remaining();
        Ok(if remaining >= n {
            QuotaCheck::Ok
        } else if remaining > 0 {
            QuotaCheck::Partial(remaining)
        } else {
            QuotaCheck::Exhausted
        })
    }

    /// Atomically debits `n` pages from the ledger
    ///
    /// The debit, the threshold bookkeeping, and the durable event insert all
    /// commit together. Returns `StoreError::Conflict` when the headroom is
    /// insufficient; the ledger is untouched in that case.
    pub async fn consume(
        &self,
        user_id: &UserId,
        kind: QuotaKind,
        n: i64,
    ) -> Result<ConsumeReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT used, limit_pages, last_notified_threshold FROM quota_ledgers \
             WHERE user_id = ? AND kind = ?",
        )
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("quota ledger for {user_id}")))?;

        let old_used: i64 = row.try_get("used")?;
        let limit: i64 = row.try_get("limit_pages")?;
        let last_notified = NotifiedThreshold::from_i64(row.try_get("last_notified_threshold")?)?;

        // The conditional update is the serialization point: it only lands
        // when the headroom still holds at write time.
        let result = sqlx::query(
            "UPDATE quota_ledgers SET used = used + ? \
             WHERE user_id = ? AND kind = ? AND (limit_pages < 0 OR used + ? <= limit_pages)",
        )
        .bind(n)
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .bind(n)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "quota exhausted for {user_id}: {old_used}/{limit}, requested {n}"
            )));
        }

        let new_used = old_used + n;
        let crossed = threshold_crossing(old_used, new_used, limit, last_notified).map(|t| {
            QuotaThresholdCrossed {
                threshold: t,
                used: new_used,
                limit,
                occurred_at: Utc::now(),
            }
        });

        if let Some(ref event) = crossed {
            sqlx::query(
                "UPDATE quota_ledgers SET last_notified_threshold = ? \
                 WHERE user_id = ? AND kind = ?",
            )
            .bind(event.threshold.as_i64())
            .bind(user_id.to_string())
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO quota_events \
                 (user_id, kind, threshold, used, limit_pages, occurred_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id.to_string())
            .bind(kind.as_str())
            .bind(event.threshold.as_i64())
            .bind(event.used)
            .bind(event.limit)
            .bind(fmt_ts(event.occurred_at))
            .execute(&mut *tx)
            .await?;

            info!(
                user_id = %user_id,
                threshold = event.threshold.as_i64(),
                used = event.used,
                limit = event.limit,
                "Quota threshold crossed"
            );
        }

        tx.commit().await?;

        debug!(user_id = %user_id, consumed = n, used = new_used, "Quota consumed");

        Ok(ConsumeReceipt {
            consumed: n,
            remaining: if limit < 0 {
                i64::MAX
            } else {
                (limit - new_used).max(0)
            },
            crossed,
        })
    }

    /// Resets the ledger: `used = 0`, fresh period, cleared notifications
    pub async fn reset(&self, user_id: &UserId, kind: QuotaKind) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE quota_ledgers SET used = 0, period_start = ?, reset_at = ?, \
             last_notified_threshold = 0 WHERE user_id = ? AND kind = ?",
        )
        .bind(fmt_ts(now))
        .bind(fmt_ts(now + Duration::days(PERIOD_DAYS)))
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("quota ledger for {user_id}")));
        }

        info!(user_id = %user_id, kind = %kind, "Quota ledger reset");
        Ok(())
    }

    /// Returns a read-only snapshot of the ledger
    pub async fn observe(
        &self,
        user_id: &UserId,
        kind: QuotaKind,
    ) -> Result<QuotaSnapshot, StoreError> {
        let row = sqlx::query(
            "SELECT used, limit_pages, reset_at FROM quota_ledgers \
             WHERE user_id = ? AND kind = ?",
        )
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("quota ledger for {user_id}")))?;

        let used: i64 = row.try_get("used")?;
        let limit: i64 = row.try_get("limit_pages")?;
        let reset_at: String = row.try_get("reset_at")?;
        Ok(QuotaSnapshot::from_ledger(used, limit, parse_ts(&reset_at)?))
    }

    /// Returns ledgers whose billing period has rolled over
    ///
    /// The periodic reset loop feeds these to the retroactive processor.
    pub async fn ledgers_due_for_reset(
        &self,
        limit: i64,
    ) -> Result<Vec<(UserId, QuotaKind)>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, kind FROM quota_ledgers WHERE reset_at <= ? LIMIT ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let user_id: String = row.try_get("user_id")?;
                let kind: String = row.try_get("kind")?;
                Ok((UserId::from_str(&user_id)?, QuotaKind::parse(&kind)?))
            })
            .collect()
    }

    /// Returns undispatched threshold events, oldest first
    pub async fn pending_events(&self, limit: i64) -> Result<Vec<PendingQuotaEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, threshold, used, limit_pages, occurred_at \
             FROM quota_events WHERE dispatched = 0 ORDER BY occurred_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let user_id: String = row.try_get("user_id")?;
                let kind: String = row.try_get("kind")?;
                let threshold: i64 = row.try_get("threshold")?;
                let used: i64 = row.try_get("used")?;
                let limit_pages: i64 = row.try_get("limit_pages")?;
                let occurred_at: String = row.try_get("occurred_at")?;
                Ok(PendingQuotaEvent {
                    id,
                    user_id: UserId::from_str(&user_id)?,
                    kind: QuotaKind::parse(&kind)?,
                    event: QuotaThresholdCrossed {
                        threshold: NotifiedThreshold::from_i64(threshold)?,
                        used,
                        limit: limit_pages,
                        occurred_at: parse_ts(&occurred_at)?,
                    },
                })
            })
            .collect()
    }

    /// Marks a threshold event as handed to the notification transport
    pub async fn mark_event_dispatched(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE quota_events SET dispatched = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
