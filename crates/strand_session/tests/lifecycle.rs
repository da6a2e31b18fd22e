//! Session lifecycle: registry identity, login, logout and close.

use std::sync::Arc;
use std::time::Duration;
use strand_session::{LocalStore, SessionState, SyncError};
use strand_testkit::prelude::*;

#[test]
fn concurrent_opens_share_one_session() {
    let fixture = SyncFixture::new();
    let store = Arc::new(MemoryStore::new("/tmp/shared.db"));
    let identity = fixture.identity("/tmp/shared.db", "alice");

    let opened: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let identity = identity.clone();
                let store = store.clone();
                let manager = &fixture.manager;
                s.spawn(move || manager.open(identity, store).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = opened[0].session();
    assert!(opened.iter().all(|synced| synced.session().same_session(first)));
    assert_eq!(fixture.manager.session_count(), 1);
    assert_eq!(fixture.connector.created(), 1);

    for synced in &opened {
        synced.close();
    }
    assert_eq!(fixture.manager.session_count(), 0);
    assert!(!store.is_open());
}

#[test]
fn different_users_get_different_sessions() {
    let fixture = SyncFixture::new();
    let store = Arc::new(MemoryStore::new("/tmp/shared.db"));

    let alice = fixture.open_store(&store, "alice");
    let bob = fixture
        .manager
        .open(fixture.identity("/tmp/shared.db", "bob"), store.clone())
        .unwrap();

    assert!(!alice.session().same_session(bob.session()));
    assert_eq!(fixture.manager.session_count(), 2);
}

#[test]
fn session_stays_active_until_logout() {
    let fixture = SyncFixture::new();
    let (_store, synced) = fixture.open("/tmp/dogs.db", "alice");
    let session = synced.session();

    assert!(session
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());
    assert_eq!(session.state().unwrap(), SessionState::Active);
    assert!(session.has_access_token().unwrap());

    session.logout().unwrap();
    assert!(session
        .wait_for_state(SessionState::Inactive, TEST_TIMEOUT)
        .unwrap());
    assert!(!session.has_access_token().unwrap());

    // Logged out for good: the session never comes back to ACTIVE
    assert!(!session
        .wait_for_state(SessionState::Active, Duration::from_millis(100))
        .unwrap());
    assert_eq!(session.state().unwrap(), SessionState::Inactive);
    assert!(session.last_error().unwrap().is_none());
}

#[test]
fn closing_the_store_kills_the_session() {
    let fixture = SyncFixture::new();
    let (store, synced) = fixture.open("/tmp/dogs.db", "alice");
    let session = synced.session().clone();
    let identity = synced.identity().clone();
    assert!(session
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());

    synced.close();

    assert_eq!(session.state(), Err(SyncError::ClosedSession));
    assert_eq!(
        session.upload_all_local_changes(&wait_options()),
        Err(SyncError::ClosedSession)
    );
    assert_eq!(
        session.download_all_server_changes(&wait_options()),
        Err(SyncError::ClosedSession)
    );
    assert_eq!(session.logout(), Err(SyncError::ClosedSession));
    assert!(matches!(
        fixture.manager.get_session(&identity),
        Err(SyncError::SessionNotFound(_))
    ));
    assert!(!store.is_open());
}

#[test]
fn session_lives_until_last_handle_closes() {
    let fixture = SyncFixture::new();
    let (store, first) = fixture.open("/tmp/dogs.db", "alice");
    let second = fixture.open_store(&store, "alice");
    let session = first.session().clone();

    first.close();
    assert!(session.state().is_ok());
    assert!(store.is_open());

    drop(second);
    assert_eq!(session.state(), Err(SyncError::ClosedSession));
    assert!(!store.is_open());
}

#[test]
fn reopening_starts_a_fresh_session_with_the_same_client() {
    let fixture = SyncFixture::new();
    let (store, synced) = fixture.open("/tmp/dogs.db", "alice");
    let old = synced.session().clone();
    let client = old.client_id().unwrap();
    synced.close();

    let reopened = Arc::new(store.reopen());
    let synced = fixture.open_store(&reopened, "alice");

    assert!(!synced.session().same_session(&old));
    assert_eq!(synced.session().client_id().unwrap(), client);
    assert!(synced
        .session()
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());
}

#[test]
fn identity_must_name_the_store() {
    let fixture = SyncFixture::new();
    let store = Arc::new(MemoryStore::new("/tmp/dogs.db"));

    let result = fixture
        .manager
        .open(fixture.identity("/tmp/cats.db", "alice"), store);
    assert!(matches!(result, Err(SyncError::InvalidIdentity(_))));
    assert_eq!(fixture.manager.session_count(), 0);
}

#[test]
fn shutdown_closes_every_session() {
    let fixture = SyncFixture::new();
    let (_a, synced_a) = fixture.open("/tmp/a.db", "alice");
    let (_b, synced_b) = fixture.open("/tmp/b.db", "bob");

    fixture.manager.shutdown();

    assert_eq!(fixture.manager.session_count(), 0);
    assert_eq!(synced_a.session().state(), Err(SyncError::ClosedSession));
    assert_eq!(synced_b.session().state(), Err(SyncError::ClosedSession));

    let store = Arc::new(MemoryStore::new("/tmp/c.db"));
    let result = fixture
        .manager
        .open(fixture.identity("/tmp/c.db", "carol"), store);
    assert!(matches!(result, Err(SyncError::WorkerUnavailable(_))));
}

#[test]
fn store_closed_underneath_the_session_ends_it() {
    let fixture = SyncFixture::new();
    let (store, synced) = fixture.open("/tmp/dogs.db", "alice");
    let session = synced.session().clone();
    assert!(session
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());

    store.close();

    assert_eq!(session.state(), Err(SyncError::ClosedSession));
    assert_eq!(
        session.upload_all_local_changes(&wait_options()),
        Err(SyncError::ClosedSession)
    );
    assert!(matches!(
        fixture.manager.get_session(synced.identity()),
        Err(SyncError::SessionNotFound(_))
    ));
    assert_eq!(fixture.manager.session_count(), 0);

    let reopened = Arc::new(store.reopen());
    let fresh = fixture.open_store(&reopened, "alice");
    assert!(!fresh.session().same_session(&session));
    assert!(fresh
        .session()
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());

    // Closing the stale handle leaves the new session alone
    drop(synced);
    assert_eq!(fixture.manager.session_count(), 1);
    assert!(reopened.is_open());
    assert_eq!(fresh.session().state().unwrap(), SessionState::Active);
}

#[test]
fn removed_session_does_not_detach_its_successor() {
    let fixture = SyncFixture::new();
    let store = Arc::new(MemoryStore::new("/tmp/dogs.db"));
    let shared: Arc<dyn LocalStore> = store.clone();
    let identity = fixture.identity("/tmp/dogs.db", "alice");
    let registry = fixture.manager.registry();

    let old = registry.get_or_create(&identity, &shared).unwrap();
    assert!(old.wait_for_state(SessionState::Active, TEST_TIMEOUT).unwrap());
    assert!(registry.remove(&identity));

    let fresh = registry.get_or_create(&identity, &shared).unwrap();
    assert!(fresh
        .wait_for_state(SessionState::Active, TEST_TIMEOUT)
        .unwrap());
    // Give the replaced driver time to wind down
    std::thread::sleep(Duration::from_millis(100));
    assert!(store.has_commit_listener());

    // No checkpoint: only the listener can trigger this upload
    store.put("Dog", "fido", vec![1]).unwrap();
    assert!(eventually(TEST_TIMEOUT, || fixture.server.changeset_count() == 1));
    assert!(eventually(TEST_TIMEOUT, || {
        fresh.upload_cursor().unwrap().get() == 1
    }));
    assert!(registry.remove(&identity));
}
