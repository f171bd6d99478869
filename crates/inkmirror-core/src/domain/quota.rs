//! Quota ledger domain types
//!
//! The ledger itself lives in the store (atomic conditional updates on the
//! database row); this module holds the value types shared between the
//! store, the ingestion service, and the API surface, plus the pure
//! threshold-crossing computation used inside `consume`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;

/// Sentinel limit meaning "unlimited"
pub const UNLIMITED: i64 = -1;

/// Percent at which a ledger is considered near its limit
pub const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// Kinds of metered resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// OCR page transcriptions per billing period
    OcrPages,
}

impl QuotaKind {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OcrPages => "ocr_pages",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "ocr_pages" => Ok(Self::OcrPages),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown quota kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription tier, which sets the per-period OCR page limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free tier
    #[default]
    Free,
    /// Paid individual tier
    Pro,
    /// Organization tier; unlimited and exempt from threshold notifications
    Enterprise,
}

impl Tier {
    /// Default OCR page limit for this tier
    pub fn ocr_page_limit(&self) -> i64 {
        match self {
            Self::Free => 30,
            Self::Pro => 1000,
            Self::Enterprise => UNLIMITED,
        }
    }

    /// Whether threshold-crossing notifications apply to this tier
    pub fn notifications_enabled(&self) -> bool {
        !matches!(self, Self::Enterprise)
    }

    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown tier: {other}"
            ))),
        }
    }
}

/// The highest threshold already notified this period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifiedThreshold {
    /// Nothing notified yet this period
    #[default]
    None,
    /// The 90% warning was sent
    Ninety,
    /// The 100% exhaustion notice was sent
    Hundred,
}

impl NotifiedThreshold {
    /// Percent value of this threshold, if any
    pub fn percent(&self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Ninety => Some(90),
            Self::Hundred => Some(100),
        }
    }

    /// Stored integer form (0 = none)
    pub fn as_i64(&self) -> i64 {
        self.percent().map(i64::from).unwrap_or(0)
    }

    /// Parse the stored integer form
    pub fn from_i64(v: i64) -> Result<Self, DomainError> {
        match v {
            0 => Ok(Self::None),
            90 => Ok(Self::Ninety),
            100 => Ok(Self::Hundred),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown notified threshold: {other}"
            ))),
        }
    }
}

/// Outcome of a read-only quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    /// All `n` requested pages fit
    Ok,
    /// Nothing remains
    Exhausted,
    /// Fewer than the requested pages remain, but more than zero
    Partial(i64),
}

/// Read-only snapshot of a ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Pages consumed this period
    pub used: i64,
    /// Period limit (`-1` = unlimited)
    pub limit: i64,
    /// Percent consumed (0.0 when unlimited)
    pub percent: f64,
    /// When the period rolls over
    pub reset_at: DateTime<Utc>,
    /// True when nothing remains
    pub is_exhausted: bool,
    /// True when consumption is at or past 80%
    pub is_near_limit: bool,
}

impl QuotaSnapshot {
    /// Builds a snapshot from raw ledger fields
    pub fn from_ledger(used: i64, limit: i64, reset_at: DateTime<Utc>) -> Self {
        let (percent, is_exhausted, is_near_limit) = if limit < 0 {
            (0.0, false, false)
        } else if limit == 0 {
            (100.0, true, true)
        } else {
            let pct = (used as f64 / limit as f64) * 100.0;
            (pct, used >= limit, pct >= NEAR_LIMIT_PERCENT)
        };
        Self {
            used,
            limit,
            percent,
            reset_at,
            is_exhausted,
            is_near_limit,
        }
    }

    /// Remaining headroom (`i64::MAX` when unlimited)
    pub fn remaining(&self) -> i64 {
        if self.limit < 0 {
            i64::MAX
        } else {
            (self.limit - self.used).max(0)
        }
    }
}

/// A durable record that consumption crossed a notification boundary
///
/// Emitted inside `consume` in the same transaction as the counter update,
/// so a later notification-transport failure cannot silently drop it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaThresholdCrossed {
    /// Which boundary was crossed
    pub threshold: NotifiedThreshold,
    /// Consumption after the crossing
    pub used: i64,
    /// Period limit at the time
    pub limit: i64,
    /// When the crossing happened
    pub occurred_at: DateTime<Utc>,
}

/// Computes which notification boundary, if any, a consume crossed
///
/// Returns the new threshold only when the percent moved across 90 or 100
/// and that boundary has not already been notified this period. Unlimited
/// ledgers never cross.
pub fn threshold_crossing(
    old_used: i64,
    new_used: i64,
    limit: i64,
    last_notified: NotifiedThreshold,
) -> Option<NotifiedThreshold> {
    if limit <= 0 {
        return None;
    }
    let old_pct = (old_used as f64 / limit as f64) * 100.0;
    let new_pct = (new_used as f64 / limit as f64) * 100.0;

    let crossed = if old_pct < 100.0 && new_pct >= 100.0 {
        NotifiedThreshold::Hundred
    } else if old_pct < 90.0 && new_pct >= 90.0 {
        NotifiedThreshold::Ninety
    } else {
        return None;
    };

    (crossed > last_notified).then_some(crossed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_limits() {
        assert_eq!(Tier::Free.ocr_page_limit(), 30);
        assert_eq!(Tier::Pro.ocr_page_limit(), 1000);
        assert_eq!(Tier::Enterprise.ocr_page_limit(), UNLIMITED);
        assert!(!Tier::Enterprise.notifications_enabled());
        assert!(Tier::Free.notifications_enabled());
    }

    #[test]
    fn test_snapshot_limited() {
        let snap = QuotaSnapshot::from_ledger(24, 30, Utc::now());
        assert_eq!(snap.percent, 80.0);
        assert!(snap.is_near_limit);
        assert!(!snap.is_exhausted);
        assert_eq!(snap.remaining(), 6);
    }

    #[test]
    fn test_snapshot_exhausted() {
        let snap = QuotaSnapshot::from_ledger(30, 30, Utc::now());
        assert!(snap.is_exhausted);
        assert_eq!(snap.remaining(), 0);
    }

    #[test]
    fn test_snapshot_unlimited() {
        let snap = QuotaSnapshot::from_ledger(100_000, UNLIMITED, Utc::now());
        assert!(!snap.is_exhausted);
        assert!(!snap.is_near_limit);
        assert_eq!(snap.percent, 0.0);
        assert_eq!(snap.remaining(), i64::MAX);
    }

    #[test]
    fn test_threshold_crossing_ninety() {
        let crossed = threshold_crossing(26, 27, 30, NotifiedThreshold::None);
        assert_eq!(crossed, Some(NotifiedThreshold::Ninety));
    }

    #[test]
    fn test_threshold_crossing_hundred() {
        let crossed = threshold_crossing(29, 30, 30, NotifiedThreshold::Ninety);
        assert_eq!(crossed, Some(NotifiedThreshold::Hundred));
    }

    #[test]
    fn test_threshold_crossing_skips_straight_to_hundred() {
        // One large consume can jump both boundaries; only the highest fires.
        let crossed = threshold_crossing(0, 30, 30, NotifiedThreshold::None);
        assert_eq!(crossed, Some(NotifiedThreshold::Hundred));
    }

    #[test]
    fn test_threshold_no_duplicate_notification() {
        assert_eq!(threshold_crossing(27, 28, 30, NotifiedThreshold::Ninety), None);
        assert_eq!(
            threshold_crossing(29, 30, 30, NotifiedThreshold::Hundred),
            None
        );
    }

    #[test]
    fn test_threshold_unlimited_never_crosses() {
        assert_eq!(
            threshold_crossing(0, 1_000_000, UNLIMITED, NotifiedThreshold::None),
            None
        );
    }

    #[test]
    fn test_notified_threshold_roundtrip() {
        for t in [
            NotifiedThreshold::None,
            NotifiedThreshold::Ninety,
            NotifiedThreshold::Hundred,
        ] {
            assert_eq!(NotifiedThreshold::from_i64(t.as_i64()).unwrap(), t);
        }
        assert!(NotifiedThreshold::from_i64(50).is_err());
    }
}
