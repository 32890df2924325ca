//! Property tests for the rotation schedule

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use tss_wallet_core::{KeyMetadata, SecurityLevel, should_rotate};

fn level() -> impl Strategy<Value = SecurityLevel> {
    prop_oneof![
        Just(SecurityLevel::Standard),
        Just(SecurityLevel::High),
        Just(SecurityLevel::Enterprise),
    ]
}

fn metadata(level: SecurityLevel, created_secs: i64, rotated_secs: Option<i64>) -> KeyMetadata {
    let mut metadata = KeyMetadata::new("w1", "chain-1", level);
    metadata.created_at = Utc.timestamp_opt(created_secs, 0).unwrap();
    metadata.last_rotated = rotated_secs.map(|secs| Utc.timestamp_opt(secs, 0).unwrap());
    metadata
}

proptest! {
    #[test]
    fn due_exactly_at_the_interval(level in level(), created in 0i64..2_000_000_000) {
        let metadata = metadata(level, created, None);
        let interval = level.rotation_interval().unwrap();
        let due_at = metadata.created_at + interval;

        prop_assert!(should_rotate(&metadata, due_at));
        prop_assert!(!should_rotate(&metadata, due_at - Duration::seconds(1)));
    }

    #[test]
    fn once_due_stays_due(
        level in level(),
        created in 0i64..2_000_000_000,
        a in 0i64..400 * 86_400,
        b in 0i64..400 * 86_400,
    ) {
        let metadata = metadata(level, created, None);
        let (early, late) = (a.min(b), a.max(b));
        let at = |secs: i64| metadata.created_at + Duration::seconds(secs);
        if should_rotate(&metadata, at(early)) {
            prop_assert!(should_rotate(&metadata, at(late)));
        }
    }

    #[test]
    fn last_rotation_resets_the_clock(
        level in level(),
        created in 0i64..1_000_000_000,
        rotated_after in 0i64..400 * 86_400,
    ) {
        let rotated = created + rotated_after;
        let metadata = metadata(level, created, Some(rotated));
        let rotated_at = Utc.timestamp_opt(rotated, 0).unwrap();
        let interval = level.rotation_interval().unwrap();

        prop_assert!(!should_rotate(&metadata, rotated_at));
        prop_assert!(!should_rotate(&metadata, rotated_at + interval - Duration::seconds(1)));
        prop_assert!(should_rotate(&metadata, rotated_at + interval));
    }

    #[test]
    fn unspecified_never_rotates(created in 0i64..2_000_000_000, age_days in 0i64..10_000) {
        let metadata = metadata(SecurityLevel::Unspecified, created, None);
        prop_assert!(!should_rotate(&metadata, metadata.created_at + Duration::days(age_days)));
    }
}
