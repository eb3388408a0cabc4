#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use roster_kernel_contracts::identity::{IdentityReport, ResolvedKey, VERIFIED_NAME_PLACEHOLDER};
use roster_kernel_contracts::UnixTimeMs;
use roster_storage::journal::{RegistryJournal, RegistryMutation};
use roster_storage::repo::{AllowGateRepo, IdentityReportRepo};
use roster_storage::{IdentityRegistry, RegistryConfig, ReportOutcome, StorageError};

fn key(k: &str) -> ResolvedKey {
    ResolvedKey::new(k).unwrap()
}

fn report(device_id: Option<&str>, address: &str) -> IdentityReport {
    IdentityReport::from_wire(device_id, Some(address), Some("srv1"), Some("bob"), None).unwrap()
}

fn labelled(device_id: Option<&str>, address: &str, i: usize) -> IdentityReport {
    IdentityReport::from_wire(
        device_id,
        Some(address),
        Some(format!("srv{i}").as_str()),
        Some(format!("name{i}").as_str()),
        Some(if i % 2 == 0 { "activated" } else { "expired" }),
    )
    .unwrap()
}

#[derive(Default)]
struct SwitchJournal {
    failing: AtomicBool,
    commits: AtomicUsize,
}

impl RegistryJournal for SwitchJournal {
    fn commit(&self, _mutation: &RegistryMutation) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::persistence("journal offline"));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn at_registry_db_01_device_keeps_one_row_across_address_change() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(Some("D"), "1.1.1.1"), UnixTimeMs(1_000))
        .await
        .unwrap();
    let commit = r
        .report(&report(Some("D"), "2.2.2.2"), UnixTimeMs(2_000))
        .await
        .unwrap();

    assert_eq!(commit.outcome, ReportOutcome::Updated);
    assert_eq!(r.len(), 1);
    let row = r.get(&key("D")).unwrap();
    assert_eq!(row.address.as_str(), "2.2.2.2");
    assert_eq!(row.first_seen, UnixTimeMs(1_000));
    assert_eq!(row.last_seen, UnixTimeMs(2_000));
}

#[tokio::test]
async fn at_registry_db_02_anonymous_reports_merge_by_address() {
    let r = IdentityRegistry::new_in_memory();
    let first = r
        .report(&report(Some("-"), "1.2.3.4"), UnixTimeMs(1_000))
        .await
        .unwrap();
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(5_000))
        .await
        .unwrap();

    assert_eq!(first.outcome, ReportOutcome::Inserted);
    assert_eq!(r.len(), 1);
    let row = r.get(&key("1.2.3.4")).unwrap();
    assert_eq!(row.last_seen, UnixTimeMs(5_000));
    assert!(row.device_id.is_none());
}

#[tokio::test]
async fn at_registry_db_03_upgrade_rekeys_anonymous_row() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(1_000))
        .await
        .unwrap();
    r.set_allowed(&key("1.2.3.4"), true).await.unwrap();
    r.set_verified_name(&key("1.2.3.4"), "alice").await.unwrap();

    let commit = r
        .report(&report(Some("D"), "1.2.3.4"), UnixTimeMs(2_000))
        .await
        .unwrap();

    assert_eq!(
        commit.outcome,
        ReportOutcome::Rekeyed {
            from: key("1.2.3.4")
        }
    );
    assert_eq!(r.len(), 1);
    assert!(r.get(&key("1.2.3.4")).is_none());
    let row = r.get(&key("D")).unwrap();
    assert_eq!(row.device_id.as_ref().map(|d| d.as_str()), Some("D"));
    assert!(row.allowed);
    assert_eq!(row.verified_name, "alice");
    assert_eq!(row.first_seen, UnixTimeMs(1_000));
    assert_eq!(row.last_seen, UnixTimeMs(2_000));
}

#[tokio::test]
async fn at_registry_db_04_unknown_keys_are_not_allowed() {
    let r = IdentityRegistry::new_in_memory();
    assert!(!r.is_allowed(&key("never-seen")));
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(1))
        .await
        .unwrap();
    assert!(!r.is_allowed(&key("1.2.3.4")));
    assert!(!r.is_allowed(&key("9.9.9.9")));
}

#[tokio::test]
async fn at_registry_db_05_reports_never_clear_the_allow_gate() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(Some("D"), "1.1.1.1"), UnixTimeMs(1))
        .await
        .unwrap();
    r.set_allowed(&key("D"), true).await.unwrap();

    for (i, now) in [2u64, 3, 4].into_iter().enumerate() {
        r.report(&labelled(Some("D"), "3.3.3.3", i), UnixTimeMs(now))
            .await
            .unwrap();
    }
    assert!(r.is_allowed(&key("D")));
    assert_eq!(r.get(&key("D")).unwrap().verified_name, VERIFIED_NAME_PLACEHOLDER);
}

#[tokio::test]
async fn at_registry_db_06_last_seen_never_moves_backward() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(Some("D"), "1.1.1.1"), UnixTimeMs(9_000))
        .await
        .unwrap();
    let late = r
        .report(&labelled(Some("D"), "2.2.2.2", 7), UnixTimeMs(3_000))
        .await
        .unwrap();

    assert_eq!(late.record.last_seen, UnixTimeMs(9_000));
    // Mutable fields still follow arrival order.
    assert_eq!(late.record.address.as_str(), "2.2.2.2");
    assert_eq!(late.record.display_name, "name7");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_registry_db_07_concurrent_same_key_reports_leave_one_whole_row() {
    let r = Arc::new(IdentityRegistry::new_in_memory());
    let mut tasks = Vec::new();
    for i in 0..32usize {
        let r = r.clone();
        tasks.push(tokio::spawn(async move {
            r.report(
                &labelled(Some("D"), &format!("10.0.0.{i}"), i),
                UnixTimeMs(1_000 + i as u64),
            )
            .await
        }));
    }
    let mut inserted = 0;
    for t in tasks {
        if t.await.unwrap().unwrap().outcome == ReportOutcome::Inserted {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(r.len(), 1);
    let row = r.get(&key("D")).unwrap();
    let i: usize = row.tag.trim_start_matches("srv").parse().unwrap();
    assert_eq!(row.display_name, format!("name{i}"));
    assert_eq!(row.address.as_str(), format!("10.0.0.{i}"));
    assert_eq!(row.license_active, i % 2 == 0);
    assert_eq!(row.last_seen, UnixTimeMs(1_031));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_registry_db_08_concurrent_upgrades_rekey_exactly_once() {
    let r = Arc::new(IdentityRegistry::new_in_memory());
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(1))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16usize {
        let r = r.clone();
        tasks.push(tokio::spawn(async move {
            r.report(&labelled(Some("D"), "1.2.3.4", i), UnixTimeMs(10))
                .await
        }));
    }
    let mut outcomes = Vec::new();
    for t in tasks {
        outcomes.push(t.await.unwrap().unwrap().outcome);
    }

    let rekeyed = outcomes
        .iter()
        .filter(|o| matches!(o, ReportOutcome::Rekeyed { .. }))
        .count();
    assert_eq!(rekeyed, 1);
    assert_eq!(r.len(), 1);
    assert!(r.get(&key("D")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_registry_db_09_distinct_clients_do_not_interfere() {
    let r = Arc::new(IdentityRegistry::new_in_memory());
    let mut tasks = Vec::new();
    for i in 0..24usize {
        let r = r.clone();
        tasks.push(tokio::spawn(async move {
            r.report(&report(Some(format!("dev-{i}").as_str()), "10.0.0.1"), UnixTimeMs(5))
                .await
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    let keys: BTreeSet<String> = r
        .list()
        .into_iter()
        .map(|row| row.resolved_key.as_str().to_string())
        .collect();
    assert_eq!(keys.len(), 24);
    assert!(!keys.contains("10.0.0.1"));
}

#[tokio::test]
async fn at_registry_db_10_journal_failure_applies_nothing() {
    let journal = Arc::new(SwitchJournal::default());
    let r = IdentityRegistry::with_journal(RegistryConfig::mvp_v1(), journal.clone());
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(1_000))
        .await
        .unwrap();
    let before = r.list();

    journal.failing.store(true, Ordering::SeqCst);
    for attempt in [
        report(None, "1.2.3.4"),
        report(Some("D"), "1.2.3.4"),
        report(Some("E"), "5.5.5.5"),
    ] {
        let err = r.report(&attempt, UnixTimeMs(2_000)).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert!(r.set_allowed(&key("1.2.3.4"), true).await.unwrap_err().is_retryable());
    assert_eq!(r.list(), before);

    journal.failing.store(false, Ordering::SeqCst);
    r.report(&report(Some("D"), "1.2.3.4"), UnixTimeMs(3_000))
        .await
        .unwrap();
    assert_eq!(r.len(), 1);
    assert_eq!(journal.commits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn at_registry_db_11_admin_ops_on_unknown_keys_report_not_found() {
    let r = IdentityRegistry::new_in_memory();
    assert!(matches!(
        r.set_allowed(&key("ghost"), true).await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        r.set_verified_name(&key("ghost"), "x").await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(r.is_empty());
}

#[tokio::test]
async fn at_registry_db_12_set_allowed_is_idempotent() {
    let journal = Arc::new(SwitchJournal::default());
    let r = IdentityRegistry::with_journal(RegistryConfig::mvp_v1(), journal.clone());
    r.report(&report(Some("D"), "1.1.1.1"), UnixTimeMs(1))
        .await
        .unwrap();

    assert!(r.set_allowed(&key("D"), true).await.unwrap().allowed);
    assert!(r.set_allowed(&key("D"), true).await.unwrap().allowed);
    assert_eq!(journal.commits.load(Ordering::SeqCst), 2);
    assert!(!r.set_allowed(&key("D"), false).await.unwrap().allowed);
    assert!(!r.is_allowed(&key("D")));
}

#[tokio::test]
async fn at_registry_db_13_device_rows_coexist_with_later_anonymous_rows() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(Some("D1"), "1.2.3.4"), UnixTimeMs(1))
        .await
        .unwrap();
    r.report(&report(None, "1.2.3.4"), UnixTimeMs(2))
        .await
        .unwrap();
    // The anonymous row is upgraded only by a device with no row of its own.
    r.report(&report(Some("D1"), "1.2.3.4"), UnixTimeMs(3))
        .await
        .unwrap();
    assert_eq!(r.len(), 2);

    let commit = r
        .report(&report(Some("D2"), "1.2.3.4"), UnixTimeMs(4))
        .await
        .unwrap();
    assert!(matches!(commit.outcome, ReportOutcome::Rekeyed { .. }));
    let keys: Vec<String> = r
        .list()
        .into_iter()
        .map(|row| row.resolved_key.as_str().to_string())
        .collect();
    assert_eq!(keys, vec!["D1".to_string(), "D2".to_string()]);
}

#[tokio::test]
async fn at_registry_db_14_restore_rejects_duplicate_keys() {
    let r = IdentityRegistry::new_in_memory();
    r.report(&report(Some("D"), "1.1.1.1"), UnixTimeMs(1))
        .await
        .unwrap();
    r.set_allowed(&key("D"), true).await.unwrap();
    let rows = r.list();

    let restored = IdentityRegistry::from_records(
        RegistryConfig::mvp_v1(),
        Arc::new(roster_storage::journal::NoopJournal),
        rows.clone(),
    )
    .unwrap();
    assert!(restored.is_allowed(&key("D")));

    let mut doubled = rows.clone();
    doubled.extend(rows);
    assert!(matches!(
        IdentityRegistry::from_records(
            RegistryConfig::mvp_v1(),
            Arc::new(roster_storage::journal::NoopJournal),
            doubled,
        ),
        Err(StorageError::DuplicateKey { .. })
    ));
}

#[tokio::test]
async fn at_registry_db_15_repo_traits_route_to_registry() {
    let r = IdentityRegistry::new_in_memory();
    let ingest: &dyn IdentityReportRepo = &r;
    let gate: &dyn AllowGateRepo = &r;

    ingest
        .report_row(&report(None, "1.2.3.4"), UnixTimeMs(1))
        .await
        .unwrap();
    assert_eq!(ingest.list_rows().len(), 1);
    assert!(!gate.is_allowed_row(&key("1.2.3.4")));

    gate.set_allowed_row(&key("1.2.3.4"), true).await.unwrap();
    gate.set_verified_name_row(&key("1.2.3.4"), " carol ")
        .await
        .unwrap();
    let row = ingest.get_row(&key("1.2.3.4")).unwrap();
    assert!(row.allowed);
    assert_eq!(row.verified_name, "carol");
    assert!(matches!(
        gate.set_verified_name_row(&key("1.2.3.4"), "  ").await,
        Err(StorageError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_registry_db_16_listing_sees_each_rekeyed_row_exactly_once() {
    let r = Arc::new(IdentityRegistry::new_in_memory());
    for i in 0..64 {
        r.report(&report(Some(format!("pad-{i}").as_str()), &format!("10.0.0.{i}")), UnixTimeMs(1))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let r = r.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let (mut both, mut shrank, mut last_len) = (0usize, 0usize, 0usize);
            while !stop.load(Ordering::SeqCst) {
                let rows = r.list();
                let anonymous = rows
                    .iter()
                    .find(|row| row.resolved_key.as_str() == "1.2.3.4")
                    .map(|row| row.display_name.replace("anon-", "dev-"));
                if let Some(upgraded_key) = anonymous {
                    if rows.iter().any(|row| row.resolved_key.as_str() == upgraded_key) {
                        both += 1;
                    }
                }
                if rows.len() < last_len {
                    shrank += 1;
                }
                last_len = rows.len();
            }
            (both, shrank)
        })
    };

    for i in 0..500u64 {
        let anon_name = format!("anon-{i}");
        let device = format!("dev-{i}");
        let anonymous = IdentityReport::from_wire(
            None,
            Some("1.2.3.4"),
            None,
            Some(anon_name.as_str()),
            None,
        )
        .unwrap();
        r.report(&anonymous, UnixTimeMs(10 + i)).await.unwrap();
        let commit = r
            .report(&report(Some(device.as_str()), "1.2.3.4"), UnixTimeMs(10 + i))
            .await
            .unwrap();
        assert_eq!(
            commit.outcome,
            ReportOutcome::Rekeyed {
                from: key("1.2.3.4")
            }
        );
    }
    stop.store(true, Ordering::SeqCst);
    let (both, shrank) = reader.join().unwrap();

    assert_eq!(both, 0, "a listing held a row under both keys");
    assert_eq!(shrank, 0, "a listing lost a row mid re-key");
    assert_eq!(r.len(), 564);
}
