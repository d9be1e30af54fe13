//! Schedule decision: which tenants must run now.
//!
//! Matching is hour-granular on purpose: a tenant scheduled at hour 3 runs
//! during any invocation whose local hour is 3, at most once per local
//! calendar day. The manual-run flag bypasses both the hour match and the
//! same-day dedup.

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::store::Tenant;

/// Fixed process-wide scheduling timezone. Also the reference zone for the
/// report date ("yesterday").
pub const SCHEDULE_TZ: Tz = chrono_tz::Europe::Rome;

/// Answers "did tenant T succeed at or after this UTC instant".
pub trait SuccessLookup {
    fn succeeded_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<bool>;
}

impl SuccessLookup for crate::store::RunLog {
    fn succeeded_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<bool> {
        crate::store::RunLog::succeeded_since(self, tenant_id, since)
    }
}

/// Start of the current local calendar day, in UTC.
pub fn local_day_start(now_local: DateTime<Tz>) -> Result<DateTime<Utc>> {
    let midnight = now_local
        .with_time(NaiveTime::MIN)
        .earliest()
        .ok_or_else(|| anyhow::anyhow!("no representable midnight for {now_local}"))?;
    Ok(midnight.with_timezone(&Utc))
}

/// Select the tenants due to run now, preserving input order.
///
/// Per active tenant: manual-run includes unconditionally; otherwise the
/// local hour must equal the scheduled hour and no success may exist since
/// local midnight. Inactive tenants are never selected, manual flag or not.
pub fn select_due<'a>(
    tenants: &'a [Tenant],
    now_local: DateTime<Tz>,
    lookup: &dyn SuccessLookup,
) -> Result<Vec<&'a Tenant>> {
    let day_start = local_day_start(now_local)?;
    let current_hour = now_local.hour() as u8;

    let mut due = Vec::new();
    for tenant in tenants {
        if !tenant.active {
            continue;
        }
        if tenant.manual_run {
            tracing::info!(tenant = %tenant.name, "manual run requested, bypassing schedule");
            due.push(tenant);
            continue;
        }
        if tenant.run_hour != current_hour {
            continue;
        }
        if lookup.succeeded_since(tenant.id, day_start)? {
            tracing::debug!(tenant = %tenant.name, "already succeeded today, skipping");
            continue;
        }
        due.push(tenant);
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    struct FixedLookup {
        succeeded: HashSet<i64>,
    }

    impl SuccessLookup for FixedLookup {
        fn succeeded_since(&self, tenant_id: i64, _since: DateTime<Utc>) -> Result<bool> {
            Ok(self.succeeded.contains(&tenant_id))
        }
    }

    fn tenant(id: i64, name: &str, hour: u8, active: bool, manual: bool) -> Tenant {
        Tenant {
            id,
            name: name.to_string(),
            username: "user".to_string(),
            password_enc: "blob".to_string(),
            pin_enc: None,
            run_hour: hour,
            sheet_id: "sheet".to_string(),
            scope_selector: None,
            active,
            manual_run: manual,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rome(h: u32, m: u32) -> DateTime<Tz> {
        SCHEDULE_TZ.with_ymd_and_hms(2026, 8, 29, h, m, 0).unwrap()
    }

    fn none_succeeded() -> FixedLookup {
        FixedLookup { succeeded: HashSet::new() }
    }

    #[test]
    fn test_hour_match_selects() {
        let tenants = vec![tenant(1, "a", 3, true, false)];
        let due = select_due(&tenants, rome(3, 17), &none_succeeded()).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_minute_is_ignored() {
        let tenants = vec![tenant(1, "a", 3, true, false)];
        assert_eq!(select_due(&tenants, rome(3, 0), &none_succeeded()).unwrap().len(), 1);
        assert_eq!(select_due(&tenants, rome(3, 59), &none_succeeded()).unwrap().len(), 1);
        assert!(select_due(&tenants, rome(4, 0), &none_succeeded()).unwrap().is_empty());
    }

    #[test]
    fn test_manual_run_bypasses_hour_and_dedup() {
        let tenants = vec![tenant(1, "a", 9, true, true)];
        let lookup = FixedLookup { succeeded: [1].into_iter().collect() };
        let due = select_due(&tenants, rome(3, 0), &lookup).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_success_today_excludes() {
        let tenants = vec![tenant(1, "a", 3, true, false)];
        let lookup = FixedLookup { succeeded: [1].into_iter().collect() };
        assert!(select_due(&tenants, rome(3, 0), &lookup).unwrap().is_empty());
    }

    #[test]
    fn test_inactive_never_selected_even_with_manual_flag() {
        let tenants = vec![tenant(1, "a", 3, false, true)];
        assert!(select_due(&tenants, rome(3, 0), &none_succeeded()).unwrap().is_empty());
    }

    #[test]
    fn test_input_order_preserved() {
        let tenants = vec![
            tenant(1, "zeta", 3, true, false),
            tenant(2, "alpha", 9, true, true),
            tenant(3, "mid", 3, true, false),
        ];
        let due = select_due(&tenants, rome(3, 0), &none_succeeded()).unwrap();
        let names: Vec<_> = due.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_local_day_start_is_utc_shifted() {
        // Rome is UTC+2 in August
        let start = local_day_start(rome(3, 0)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 28, 22, 0, 0).unwrap());
    }
}
