use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use mockall::predicate::eq;
use tokio::time::timeout;

use super::node_registration::inspect_events;
use super::*;
use crate::test_utils::enable_logger;
use crate::test_utils::fast_registration_config;
use crate::test_utils::wait_for_state;
use crate::test_utils::wait_until;
use crate::test_utils::WAIT_TIMEOUT;
use crate::EventType;
use crate::KeyValue;
use crate::KvEvent;
use crate::KvStore;
use crate::MemStore;
use crate::MockKvStore;
use crate::PutResponse;
use crate::StoreError;

const PATH: &str = "svc/a";
const VALUE: &str = "1.2.3.4:80";

fn spawn_on(store: &MemStore) -> NodeRegistration {
    let store: Arc<dyn KvStore> = Arc::new(store.clone());
    NodeRegistration::spawn(store, PATH, VALUE, fast_registration_config())
}

fn active_lease(state: RegistrationState) -> (i64, i64) {
    match state {
        RegistrationState::Active {
            lease,
            create_revision,
        } => (lease, create_revision),
        other => panic!("expected active state, got {other}"),
    }
}

fn event(
    event_type: EventType,
    create_revision: i64,
    mod_revision: i64,
) -> KvEvent {
    KvEvent {
        event_type,
        kv: KeyValue {
            key: PATH.to_string(),
            value: VALUE.to_string(),
            create_revision,
            mod_revision,
            lease: 0,
        },
    }
}

#[tokio::test]
async fn test_registration_writes_key_under_lease() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();

    let (lease, create_revision) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    let kv = store.key_value(PATH).expect("key should be registered");
    assert_eq!(kv.value, VALUE);
    assert_eq!(kv.lease, lease);
    assert_eq!(kv.create_revision, create_revision);
    assert!(store.has_lease(lease));

    registration.close().await;
}

#[tokio::test]
async fn test_close_removes_key_and_lease() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    let (lease, _) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    registration.close().await;

    assert!(registration.is_finished());
    assert_eq!(registration.state(), RegistrationState::Closed);
    assert!(store.value_of(PATH).is_none());
    assert!(!store.has_lease(lease));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    wait_for_state(&mut rx, |s| s.is_active()).await;

    timeout(WAIT_TIMEOUT, async {
        registration.close().await;
        registration.close().await;
    })
    .await
    .expect("close should not hang");

    assert_eq!(registration.state(), RegistrationState::Closed);
    // Nothing was written after the first close
    let revision = store.revision();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.revision(), revision);
}

#[tokio::test]
async fn test_close_before_first_attempt_completes() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);

    timeout(WAIT_TIMEOUT, registration.close())
        .await
        .expect("close should not hang");

    assert_eq!(registration.state(), RegistrationState::Closed);
    assert!(store.value_of(PATH).is_none());
    assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
async fn test_deleted_key_is_recreated() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    let (first_lease, _) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    assert!(store.delete(PATH));

    let state = wait_for_state(&mut rx, |s| match s {
        RegistrationState::Active { lease, .. } => *lease != first_lease,
        _ => false,
    })
    .await;
    let (second_lease, _) = active_lease(state);
    assert_ne!(first_lease, second_lease);
    assert_eq!(store.value_of(PATH).as_deref(), Some(VALUE));
    // The previous attempt revoked its lease during cleanup
    assert!(!store.has_lease(first_lease));

    registration.close().await;
}

#[tokio::test]
async fn test_expired_lease_is_replaced() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    let (first_lease, _) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    assert!(store.expire_lease(first_lease));
    assert!(store.value_of(PATH).is_none());

    let state = wait_for_state(&mut rx, |s| match s {
        RegistrationState::Active { lease, .. } => *lease != first_lease,
        _ => false,
    })
    .await;
    let (second_lease, _) = active_lease(state);

    assert_eq!(store.key_value(PATH).map(|kv| kv.lease), Some(second_lease));

    registration.close().await;
}

#[tokio::test]
async fn test_superseded_registration_keeps_foreign_key() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    let (first_lease, _) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    let foreign = store.recreate_unleased(PATH, "10.0.0.9:80");

    wait_for_state(&mut rx, |s| *s == RegistrationState::Superseded).await;
    let (second_lease, reclaimed_create_revision) =
        active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    // Re-claiming overwrote the foreign key; had cleanup deleted it, the put
    // would have created a fresh key with a new creation revision.
    assert_eq!(reclaimed_create_revision, foreign.create_revision);
    assert_ne!(second_lease, first_lease);
    assert_eq!(store.value_of(PATH).as_deref(), Some(VALUE));

    registration.close().await;
    assert!(store.value_of(PATH).is_none());
}

#[tokio::test]
async fn test_registration_recovers_after_store_outage() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    let (first_lease, _) = active_lease(wait_for_state(&mut rx, |s| s.is_active()).await);

    store.set_available(false);
    wait_for_state(&mut rx, |s| !s.is_active()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.set_available(true);

    let state = wait_for_state(&mut rx, |s| match s {
        RegistrationState::Active { lease, .. } => *lease != first_lease,
        _ => false,
    })
    .await;
    let (second_lease, _) = active_lease(state);

    // The orphaned lease expires on its own without taking the key along
    wait_until(|| !store.has_lease(first_lease)).await;
    let kv = store.key_value(PATH).expect("key should survive old lease expiry");
    assert_eq!(kv.lease, second_lease);

    registration.close().await;
}

#[tokio::test]
async fn test_close_while_store_unavailable_still_terminates() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    wait_for_state(&mut rx, |s| s.is_active()).await;

    store.set_available(false);

    timeout(WAIT_TIMEOUT, registration.close())
        .await
        .expect("close should not hang");
    assert_eq!(registration.state(), RegistrationState::Closed);
}

#[tokio::test]
async fn test_dropping_handle_stops_task() {
    enable_logger();
    let store = MemStore::new();
    let registration = spawn_on(&store);
    let mut rx = registration.subscribe();
    wait_for_state(&mut rx, |s| s.is_active()).await;

    drop(registration);

    wait_for_state(&mut rx, |s| s.is_closed()).await;
    assert!(store.value_of(PATH).is_none());
}

#[tokio::test]
async fn test_grant_failures_are_retried_silently() {
    enable_logger();
    let grants = Arc::new(AtomicUsize::new(0));
    let mut store = MockKvStore::new();
    let counter = grants.clone();
    store.expect_grant().returning(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::unavailable("connection refused"))
    });
    store.expect_put().never();
    store.expect_revoke().never();

    let registration = NodeRegistration::spawn(Arc::new(store), PATH, VALUE, fast_registration_config());

    wait_until(|| grants.load(Ordering::SeqCst) >= 3).await;
    assert_eq!(registration.state(), RegistrationState::Registering);

    registration.close().await;
    assert_eq!(registration.state(), RegistrationState::Closed);
}

#[tokio::test]
async fn test_put_failure_revokes_lease_without_conditional_delete() {
    enable_logger();
    let revokes = Arc::new(AtomicUsize::new(0));
    let mut store = MockKvStore::new();
    store.expect_grant().returning(|_| Ok(7));
    store
        .expect_put()
        .returning(|_, _, _| Err(StoreError::unavailable("put rejected")));
    let counter = revokes.clone();
    store.expect_revoke().with(eq(7)).returning(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    store.expect_delete_if_created_at().never();

    let registration = NodeRegistration::spawn(Arc::new(store), PATH, VALUE, fast_registration_config());

    wait_until(|| revokes.load(Ordering::SeqCst) >= 2).await;
    registration.close().await;
}

#[tokio::test]
async fn test_keep_alive_end_triggers_guarded_cleanup() {
    enable_logger();
    let deletes = Arc::new(AtomicUsize::new(0));
    let mut store = MockKvStore::new();
    store.expect_grant().returning(|_| Ok(9));
    store.expect_put().returning(|_, _, _| {
        Ok(PutResponse {
            revision: 42,
            create_revision: 42,
        })
    });
    // Renewal stream that ends right away: the lease is gone
    store
        .expect_keep_alive()
        .returning(|_| Ok(stream::empty().boxed()));
    store
        .expect_watch()
        .withf(|key, scope, from| key == PATH && *scope == crate::WatchScope::Key && *from == 43)
        .returning(|_, _, _| Ok(stream::pending().boxed()));
    store
        .expect_revoke()
        .returning(|lease| Err(StoreError::LeaseNotFound(lease)));
    let counter = deletes.clone();
    store
        .expect_delete_if_created_at()
        .withf(|key, create_revision| key == PATH && *create_revision == 42)
        .returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });

    let registration = NodeRegistration::spawn(Arc::new(store), PATH, VALUE, fast_registration_config());

    wait_until(|| deletes.load(Ordering::SeqCst) >= 1).await;
    registration.close().await;
}

#[test]
fn test_inspect_events_ignores_own_puts() {
    let events = vec![event(EventType::Put, 10, 12), event(EventType::Put, 10, 13)];

    assert_eq!(inspect_events(&events, 10), None);
    assert_eq!(inspect_events(&[], 10), None);
}

#[test]
fn test_inspect_events_detects_delete() {
    let events = vec![event(EventType::Put, 10, 12), event(EventType::Delete, 0, 13)];

    assert_eq!(
        inspect_events(&events, 10),
        Some(AttemptExit::Lost(LossReason::KeyDeleted))
    );
}

#[test]
fn test_inspect_events_prefers_superseded_over_delete() {
    let events = vec![event(EventType::Delete, 0, 20), event(EventType::Put, 20, 20)];

    assert_eq!(inspect_events(&events, 10), Some(AttemptExit::Superseded));
}

#[test]
fn test_attempt_exit_labels() {
    assert_eq!(AttemptExit::Stopped.label(), "stopped");
    assert_eq!(AttemptExit::Superseded.label(), "superseded");
    assert_eq!(AttemptExit::Lost(LossReason::LeaseExpired).label(), "lost");
    assert_eq!(
        AttemptExit::Failed(StoreError::unavailable("x")).label(),
        "failed"
    );
    assert!(AttemptExit::Superseded.was_active());
    assert!(!AttemptExit::Failed(StoreError::unavailable("x")).was_active());
}
