//! Billing calendar and attempt-window policy
//!
//! All period and window arithmetic happens on local dates in the business
//! time zone; stored instants stay UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::DEFAULT_ATTEMPT_DAY_OFFSETS;
use crate::error::{BillingError, BillingResult};

/// Calendar month being invoiced plus its collection deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_at: DateTime<Utc>,
    pub grace_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct BusinessCalendar {
    tz: Tz,
}

impl BusinessCalendar {
    /// Load a named IANA zone, falling back to UTC when it does not parse.
    pub fn load(name: &str) -> Self {
        match name.parse::<Tz>() {
            Ok(tz) => Self { tz },
            Err(e) => {
                warn!(timezone = %name, error = %e, "Unknown billing timezone, falling back to UTC");
                Self::utc()
            }
        }
    }

    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    /// First instant of a local date, as UTC
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        if let Some(local) = self.tz.from_local_datetime(&midnight).earliest() {
            return local.with_timezone(&Utc);
        }
        // Midnight skipped by a DST jump; the day starts one hour later
        let shifted = midnight + Duration::hours(1);
        self.tz
            .from_local_datetime(&shifted)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc())
    }

    /// Whole local days from `from` to `to`
    pub fn day_offset(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        (self.local_date(to) - self.local_date(from)).num_days()
    }

    /// The calendar month before the one containing `now`
    pub fn previous_month(
        &self,
        now: DateTime<Utc>,
        due_offset: Duration,
        grace_period: Duration,
    ) -> BillingResult<BillingPeriod> {
        let today = self.local_date(now);
        let current_month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
            .ok_or_else(|| BillingError::Internal(format!("no first day for {}", today)))?;
        let period_end = current_month_start
            .pred_opt()
            .ok_or_else(|| BillingError::Internal("date underflow".to_string()))?;
        let period_start = NaiveDate::from_ymd_opt(period_end.year(), period_end.month(), 1)
            .ok_or_else(|| BillingError::Internal(format!("no first day for {}", period_end)))?;

        let due_at = self.start_of_day(current_month_start) + due_offset;
        Ok(BillingPeriod {
            period_start,
            period_end,
            due_at,
            grace_until: due_at + grace_period,
        })
    }
}

/// Outcome of checking an invoice against the attempt cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptWindow {
    /// An attempt may run; at most one per window, which starts at `window_start`
    Open {
        offset: i64,
        window_start: DateTime<Utc>,
    },
    Closed {
        offset: i64,
    },
}

/// Whole-day offsets from the due date on which a debit may be attempted
#[derive(Debug, Clone)]
pub struct AttemptWindowPolicy {
    offsets: Vec<i64>,
}

impl Default for AttemptWindowPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_DAY_OFFSETS.to_vec())
    }
}

impl AttemptWindowPolicy {
    pub fn new(mut offsets: Vec<i64>) -> Self {
        offsets.sort_unstable();
        offsets.dedup();
        Self { offsets }
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    pub fn allows(&self, offset: i64) -> bool {
        self.offsets.binary_search(&offset).is_ok()
    }

    pub fn window_for(
        &self,
        calendar: &BusinessCalendar,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AttemptWindow {
        let offset = calendar.day_offset(due_at, now);
        if self.allows(offset) {
            AttemptWindow::Open {
                offset,
                window_start: calendar.start_of_day(calendar.local_date(now)),
            }
        } else {
            AttemptWindow::Closed { offset }
        }
    }
}
