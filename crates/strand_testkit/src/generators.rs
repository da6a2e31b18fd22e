//! Property-based test generators using proptest.

use proptest::prelude::*;
use strand_protocol::ObjectChange;

/// Strategy for object class names.
pub fn class_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["Dog", "Person", "Task"]).prop_map(str::to_string)
}

/// Strategy for object ids drawn from a small pool, so puts and deletes
/// collide.
pub fn object_id_strategy() -> impl Strategy<Value = String> {
    (0u8..16).prop_map(|n| format!("obj-{n}"))
}

/// Strategy for a single put or delete.
pub fn object_change_strategy() -> impl Strategy<Value = ObjectChange> {
    prop_oneof![
        3 => (class_strategy(), object_id_strategy(), prop::collection::vec(any::<u8>(), 0..32))
            .prop_map(|(class, id, payload)| ObjectChange::put(class, id, payload)),
        1 => (class_strategy(), object_id_strategy())
            .prop_map(|(class, id)| ObjectChange::delete(class, id)),
    ]
}

/// Strategy for the changes of one local commit.
pub fn commit_strategy() -> impl Strategy<Value = Vec<ObjectChange>> {
    prop::collection::vec(object_change_strategy(), 1..4)
}

/// Strategy for a sequence of local commits.
pub fn commit_history_strategy(max_commits: usize) -> impl Strategy<Value = Vec<Vec<ObjectChange>>> {
    prop::collection::vec(commit_strategy(), 1..=max_commits.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn commits_are_never_empty(commit in commit_strategy()) {
            prop_assert!(!commit.is_empty());
            prop_assert!(commit.len() < 4);
        }

        #[test]
        fn ids_come_from_the_pool(change in object_change_strategy()) {
            prop_assert!(change.object_id().starts_with("obj-"));
        }
    }
}
