mod support;

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use support::*;
use wt_core::ids::ServiceId;
use wt_core::model::{NewRosterAssignment, RosterAssignment};
use wt_sync::{
    AssignmentGuard, GatewayError, MemoryGateway, RosterGateway, SyncConfig, SyncError,
};

async fn stored(
    gateway: &impl RosterGateway,
    service: &str,
    volunteer_id: &str,
    instrument_id: &str,
) -> RosterAssignment {
    gateway
        .insert_assignment(NewRosterAssignment {
            service_id: svc(service),
            volunteer_id: volunteer(volunteer_id),
            instrument_id: instrument(instrument_id),
        })
        .await
        .expect("seed assignment")
}

#[tokio::test]
async fn instrument_held_in_another_service_is_refused_without_a_write() {
    let gateway = Arc::new(MemoryGateway::new());
    stored(gateway.as_ref(), "S1", "V1", "drums").await;

    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    guard.load_service(&svc("S1")).await.expect("load S1");
    guard.load_service(&svc("S2")).await.expect("load S2");
    let writes_before = gateway.write_count();

    let err = guard
        .assign(&svc("S2"), &volunteer("V2"), &instrument("drums"))
        .await
        .expect_err("drums already taken");
    match &err {
        SyncError::AlreadyAssigned {
            instrument_id,
            holder,
        } => {
            assert_eq!(instrument_id, &instrument("drums"));
            assert_eq!(holder, &volunteer("V1"));
        }
        other => panic!("expected AlreadyAssigned, got {other:?}"),
    }
    assert!(err.is_validation());
    assert_eq!(gateway.write_count(), writes_before);
    assert_eq!(gateway.roster_rows().len(), 1);
}

#[tokio::test]
async fn assign_then_release() {
    let gateway = Arc::new(MemoryGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let service_id = svc("S1");
    guard.load_service(&service_id).await.expect("load");

    assert!(guard.is_available(&instrument("keys")));
    let row = guard
        .assign(&service_id, &volunteer("V1"), &instrument("keys"))
        .await
        .expect("assign");
    assert_eq!(row.volunteer_id, volunteer("V1"));
    assert!(!guard.is_available(&instrument("keys")));
    assert_eq!(guard.holder(&instrument("keys")), Some(row.clone()));
    assert_eq!(guard.assignments(&service_id), vec![row]);

    guard
        .unassign(&volunteer("V1"), &instrument("keys"))
        .await
        .expect("unassign");
    assert!(guard.is_available(&instrument("keys")));
    assert!(gateway.roster_rows().is_empty());

    let err = guard
        .unassign(&volunteer("V1"), &instrument("keys"))
        .await
        .expect_err("nothing left to release");
    assert!(matches!(err, SyncError::NotAssigned { .. }));
}

#[tokio::test]
async fn failed_insert_leaves_the_pool_unchanged() {
    let gateway = Arc::new(FlakyGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let service_id = svc("S1");
    guard.load_service(&service_id).await.expect("load");
    gateway.fail_roster_insert.store(true, Ordering::SeqCst);

    let err = guard
        .assign(&service_id, &volunteer("V1"), &instrument("bass"))
        .await
        .expect_err("insert fails");
    assert!(matches!(err, SyncError::Gateway(GatewayError::Network(_))));
    assert!(!err.is_validation());
    assert!(guard.is_available(&instrument("bass")));
    assert!(guard.assignments(&service_id).is_empty());
}

#[tokio::test]
async fn failed_delete_keeps_the_assignment() {
    let gateway = Arc::new(FlakyGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let service_id = svc("S1");
    guard.load_service(&service_id).await.expect("load");
    guard
        .assign(&service_id, &volunteer("V1"), &instrument("bass"))
        .await
        .expect("assign");
    gateway.fail_roster_delete.store(true, Ordering::SeqCst);

    guard
        .unassign(&volunteer("V1"), &instrument("bass"))
        .await
        .expect_err("delete fails");
    assert_eq!(
        guard.holder(&instrument("bass")).map(|row| row.volunteer_id),
        Some(volunteer("V1"))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_insert_that_landed_keeps_the_instrument_taken() {
    let gateway = Arc::new(FlakyGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let service_id = svc("S1");
    guard.load_service(&service_id).await.expect("load");
    gateway.lose_acks.store(true, Ordering::SeqCst);

    let err = guard
        .assign(&service_id, &volunteer("V1"), &instrument("drums"))
        .await
        .expect_err("answer never arrives");
    assert!(matches!(err, SyncError::Timeout(_)));
    assert!(err.outcome_unknown());
    gateway.lose_acks.store(false, Ordering::SeqCst);

    assert!(!guard.is_available(&instrument("drums")));
    assert_eq!(
        guard.holder(&instrument("drums")).map(|row| row.volunteer_id),
        Some(volunteer("V1"))
    );

    let err = guard
        .assign(&service_id, &volunteer("V2"), &instrument("drums"))
        .await
        .expect_err("drums landed for V1");
    assert!(matches!(err, SyncError::AlreadyAssigned { .. }));
    assert_eq!(gateway.inner.roster_rows().len(), 1);
}

#[tokio::test]
async fn failed_delete_with_unknown_outcome_follows_the_store() {
    let gateway = Arc::new(FlakyGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let service_id = svc("S1");
    guard.load_service(&service_id).await.expect("load");
    guard
        .assign(&service_id, &volunteer("V1"), &instrument("bass"))
        .await
        .expect("assign");

    // Someone else released bass meanwhile; the refetch after our failed
    // delete picks that up.
    let row = gateway.inner.roster_rows().remove(0);
    gateway.inner.delete_assignment(&row.id).await.expect("external delete");
    gateway.fail_roster_delete.store(true, Ordering::SeqCst);

    guard
        .unassign(&volunteer("V1"), &instrument("bass"))
        .await
        .expect_err("delete fails");
    assert!(guard.is_available(&instrument("bass")));
}

#[tokio::test]
async fn assigning_requires_a_loaded_roster() {
    let gateway = Arc::new(MemoryGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());

    let err = guard
        .assign(&svc("S9"), &volunteer("V1"), &instrument("drums"))
        .await
        .expect_err("roster not loaded");
    assert!(matches!(err, SyncError::UnknownService(_)));
    assert_eq!(gateway.write_count(), 0);
}

#[tokio::test]
async fn roster_loads_merge_across_services_and_replace_within_one() {
    let gateway = Arc::new(MemoryGateway::new());
    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let s1 = svc("S1");
    let s2 = svc("S2");

    let drums = stored(gateway.as_ref(), "S1", "V1", "drums").await;
    let bass = stored(gateway.as_ref(), "S2", "V2", "bass").await;

    let report = guard.load_roster(&s1, vec![drums.clone()]).await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.replaced, 0);
    let report = guard.load_roster(&s2, vec![bass.clone()]).await;
    assert_eq!(report.merged, 1);

    assert!(!guard.is_available(&instrument("drums")));
    assert!(!guard.is_available(&instrument("bass")));
    assert_eq!(guard.loaded_services(), vec![s1.clone(), s2.clone()]);

    // A fresh S1 fetch without drums replaces S1 only.
    let report = guard.load_roster(&s1, Vec::new()).await;
    assert_eq!(report.merged, 0);
    assert_eq!(report.replaced, 1);
    assert!(guard.is_available(&instrument("drums")));
    assert!(!guard.is_available(&instrument("bass")));

    // Rows of another service in a load are ignored.
    let report = guard.load_roster(&s1, vec![bass]).await;
    assert_eq!(report.merged, 0);
    assert_eq!(guard.assignments(&s2).len(), 1);
    assert!(guard.assignments(&s1).is_empty());
}

#[tokio::test]
async fn conflicting_stored_rows_are_reported() {
    let gateway = Arc::new(MemoryGateway::new());
    stored(gateway.as_ref(), "S1", "V1", "drums").await;
    stored(gateway.as_ref(), "S1", "V2", "drums").await;

    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    let report = guard.load_service(&svc("S1")).await.expect("load");
    assert_eq!(report.merged, 2);
    assert_eq!(report.conflicts, vec![instrument("drums")]);
    assert!(!guard.is_available(&instrument("drums")));
}

#[tokio::test]
async fn remove_volunteer_deletes_every_stored_assignment() {
    let gateway = Arc::new(MemoryGateway::new());
    stored(gateway.as_ref(), "S1", "V1", "drums").await;
    stored(gateway.as_ref(), "S2", "V1", "vocals").await;
    stored(gateway.as_ref(), "S3", "V1", "keys").await;
    stored(gateway.as_ref(), "S1", "V2", "bass").await;

    let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
    guard.load_service(&svc("S1")).await.expect("load S1");
    guard.load_service(&svc("S2")).await.expect("load S2");

    let removed = guard
        .remove_volunteer(&volunteer("V1"))
        .await
        .expect("remove volunteer");
    assert_eq!(removed, 3);
    assert!(guard.is_available(&instrument("drums")));
    assert!(guard.is_available(&instrument("vocals")));
    assert!(!guard.is_available(&instrument("bass")));

    let left: Vec<String> = gateway
        .roster_rows()
        .into_iter()
        .map(|row| row.volunteer_id.into_string())
        .collect();
    assert_eq!(left, vec!["V2".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_assignments_hand_out_an_instrument_once() {
    let gateway = Arc::new(MemoryGateway::new());
    let guard = Arc::new(AssignmentGuard::new(
        Arc::clone(&gateway),
        &SyncConfig::default(),
    ));
    guard.load_service(&svc("S1")).await.expect("load S1");
    guard.load_service(&svc("S2")).await.expect("load S2");

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                let service = if i % 2 == 0 { "S1" } else { "S2" };
                guard
                    .assign(&svc(service), &volunteer(&format!("V{i}")), &instrument("drums"))
                    .await
            })
        })
        .collect();

    let mut granted = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => granted += 1,
            Err(err) => assert!(matches!(err, SyncError::AlreadyAssigned { .. })),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(gateway.roster_rows().len(), 1);
}

#[derive(Clone, Debug)]
enum Op {
    Assign {
        service: usize,
        volunteer: usize,
        instrument: usize,
    },
    Unassign {
        volunteer: usize,
        instrument: usize,
    },
    /// The insert lands but its answer is lost.
    LostAssign {
        service: usize,
        volunteer: usize,
        instrument: usize,
    },
    /// The insert fails before reaching the store.
    FailedAssign {
        service: usize,
        volunteer: usize,
        instrument: usize,
    },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, 0usize..4, 0usize..3).prop_map(|(service, volunteer, instrument)| Op::Assign {
            service,
            volunteer,
            instrument,
        }),
        (0usize..4, 0usize..3).prop_map(|(volunteer, instrument)| Op::Unassign {
            volunteer,
            instrument,
        }),
        (0usize..3, 0usize..4, 0usize..3).prop_map(|(service, volunteer, instrument)| {
            Op::LostAssign {
                service,
                volunteer,
                instrument,
            }
        }),
        (0usize..3, 0usize..4, 0usize..3).prop_map(|(service, volunteer, instrument)| {
            Op::FailedAssign {
                service,
                volunteer,
                instrument,
            }
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn loaded_rosters_never_share_an_instrument(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let gateway = Arc::new(FlakyGateway::new());
            let guard = AssignmentGuard::new(Arc::clone(&gateway), &SyncConfig::default());
            let services: Vec<ServiceId> = (0..3).map(|i| svc(&format!("S{i}"))).collect();
            for service_id in &services {
                guard.load_service(service_id).await.expect("load");
            }

            for op in ops {
                match op {
                    Op::Assign { service, volunteer: v, instrument: i } => {
                        let _ = guard
                            .assign(&services[service], &volunteer(&format!("V{v}")), &instrument(&format!("I{i}")))
                            .await;
                    }
                    Op::Unassign { volunteer: v, instrument: i } => {
                        let _ = guard
                            .unassign(&volunteer(&format!("V{v}")), &instrument(&format!("I{i}")))
                            .await;
                    }
                    Op::LostAssign { service, volunteer: v, instrument: i } => {
                        gateway.lose_acks.store(true, Ordering::SeqCst);
                        let _ = guard
                            .assign(&services[service], &volunteer(&format!("V{v}")), &instrument(&format!("I{i}")))
                            .await;
                        gateway.lose_acks.store(false, Ordering::SeqCst);
                    }
                    Op::FailedAssign { service, volunteer: v, instrument: i } => {
                        gateway.fail_roster_insert.store(true, Ordering::SeqCst);
                        let _ = guard
                            .assign(&services[service], &volunteer(&format!("V{v}")), &instrument(&format!("I{i}")))
                            .await;
                        gateway.fail_roster_insert.store(false, Ordering::SeqCst);
                    }
                }

                let stored = gateway.inner.roster_rows();
                let mut per_instrument: HashMap<String, usize> = HashMap::new();
                for row in &stored {
                    *per_instrument.entry(row.instrument_id.as_str().to_string()).or_default() += 1;
                }
                assert!(per_instrument.values().all(|count| *count <= 1), "{per_instrument:?}");

                let pooled: Vec<RosterAssignment> =
                    services.iter().flat_map(|s| guard.assignments(s)).collect();
                assert_eq!(pooled.len(), stored.len());

                for i in 0..3 {
                    let instrument_id = instrument(&format!("I{i}"));
                    let held = pooled.iter().any(|row| row.instrument_id == instrument_id);
                    assert_eq!(guard.is_available(&instrument_id), !held, "I{i}");
                }
            }
        });
    }
}
