//! Retention selection.

use super::{id_sequence, BackupInfo};

/// Returns the backups to delete so that only the `keep` newest remain.
///
/// Ordering is by creation time, then collision counter, then ID, newest
/// first.
#[must_use]
pub fn expired(mut backups: Vec<BackupInfo>, keep: usize) -> Vec<BackupInfo> {
    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| id_sequence(&b.id).cmp(&id_sequence(&a.id)))
            .then_with(|| b.id.cmp(&a.id))
    });
    backups.into_iter().skip(keep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupKind, BackupLocation};
    use chrono::{Duration, TimeZone, Utc};

    fn info(id: &str, minutes: i64) -> BackupInfo {
        BackupInfo {
            id: id.to_string(),
            kind: BackupKind::Daily,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes),
            size: None,
            location: BackupLocation::Local,
        }
    }

    #[test]
    fn test_keeps_newest() {
        let backups = vec![info("b", 2), info("a", 1), info("d", 4), info("c", 3)];
        let ids: Vec<_> = expired(backups, 2).into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_collision_counter_orders_numerically() {
        let stamp = "daily-20240101T000000.000000Z";
        let backups: Vec<_> = ["", "-2", "-9", "-10", "-1"]
            .iter()
            .map(|suffix| info(&format!("{stamp}{suffix}"), 0))
            .collect();
        let ids: Vec<_> = expired(backups, 2).into_iter().map(|b| b.id).collect();
        assert_eq!(
            ids,
            vec![format!("{stamp}-2"), format!("{stamp}-1"), stamp.to_string()]
        );
    }

    #[test]
    fn test_nothing_expires_under_limit() {
        assert!(expired(vec![info("a", 1)], 3).is_empty());
        assert_eq!(expired(vec![info("a", 1)], 0).len(), 1);
    }
}
