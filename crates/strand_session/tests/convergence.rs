//! Two stores converge on the same objects after a round of checkpoints.

use proptest::prelude::*;
use strand_session::{LocalStore, Version};
use strand_testkit::prelude::*;

const CLASSES: [&str; 3] = ["Dog", "Person", "Task"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn downloaded_store_matches_uploader(history in commit_history_strategy(12)) {
        let fixture = SyncFixture::new();
        let (alice_store, alice) = fixture.open("/tmp/alice.db", "alice");
        let (bob_store, bob) = fixture.open("/tmp/bob.db", "bob");

        let mut last = Version::ZERO;
        for changes in history {
            let version = alice_store.commit(changes).unwrap();
            prop_assert!(version > last);
            last = version;
        }
        alice.session().upload_all_local_changes(&wait_options()).unwrap();
        prop_assert_eq!(alice.session().upload_cursor().unwrap(), alice_store.current_version());

        bob.session().download_all_server_changes(&wait_options()).unwrap();
        for class in CLASSES {
            prop_assert_eq!(bob_store.count(class), alice_store.count(class));
            for n in 0..16 {
                let id = format!("obj-{n}");
                prop_assert_eq!(bob_store.get(class, &id), alice_store.get(class, &id));
            }
        }
    }

    #[test]
    fn upload_cursor_only_moves_forward(batches in prop::collection::vec(commit_history_strategy(4), 1..4)) {
        let fixture = SyncFixture::new();
        let (store, synced) = fixture.open("/tmp/alice.db", "alice");

        let mut previous = Version::ZERO;
        for batch in batches {
            for changes in batch {
                store.commit(changes).unwrap();
            }
            synced.session().upload_all_local_changes(&wait_options()).unwrap();
            let cursor = synced.session().upload_cursor().unwrap();
            prop_assert!(cursor > previous);
            prop_assert_eq!(cursor, store.current_version());
            previous = cursor;
        }
        prop_assert_eq!(fixture.server.changeset_count() as u64, previous.get());
    }
}
