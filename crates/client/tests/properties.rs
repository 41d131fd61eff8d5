use std::time::Duration;

use chatline_client::{ConversationState, Reconciler};
use chatline_shared::{Message, MessageEvent};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

fn reconciler() -> Reconciler {
    Reconciler::new(Duration::from_secs(1), "[deleted]")
}

/// Server messages with unique ids and colliding timestamps.
fn messages() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::btree_map(1i64..500, (0i64..20, 0usize..3, "[a-z]{1,8}"), 1..30).prop_map(
        |entries| {
            let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
            entries
                .into_iter()
                .map(|(id, (offset, sender, content))| {
                    let sender = ["alice", "bob", "carol"][sender];
                    let at = base + chrono::Duration::seconds(offset);
                    Message::new(id, sender, None, content, at)
                })
                .collect()
        },
    )
}

/// The same messages in arbitrary order, each delivered one to three times.
fn deliveries() -> impl Strategy<Value = (Vec<Message>, Vec<Message>)> {
    messages().prop_flat_map(|messages| {
        let repeats = prop::collection::vec(1usize..=3, messages.len());
        (Just(messages), repeats).prop_flat_map(|(messages, repeats)| {
            let delivered: Vec<Message> = messages
                .iter()
                .zip(repeats)
                .flat_map(|(m, n)| std::iter::repeat(m.clone()).take(n))
                .collect();
            (Just(messages), Just(delivered).prop_shuffle())
        })
    })
}

fn apply_all(order: &[Message]) -> ConversationState {
    let reconciler = reconciler();
    let mut state = ConversationState::new();
    for message in order {
        reconciler.apply(&mut state, MessageEvent::Created(message.clone()));
    }
    state
}

proptest! {
    #[test]
    fn state_is_sorted_and_unique_for_any_arrival_order((messages, delivered) in deliveries()) {
        let state = apply_all(&delivered);

        prop_assert_eq!(state.len(), messages.len());
        let keys: Vec<_> = state.iter().map(Message::ordering_key).collect();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn arrival_order_does_not_matter((messages, delivered) in deliveries()) {
        let mut expected = messages.clone();
        expected.sort_by_key(Message::ordering_key);

        let snapshot = apply_all(&delivered).snapshot();
        prop_assert_eq!(&*snapshot, &expected);
    }

    #[test]
    fn redelivering_everything_changes_nothing((_, delivered) in deliveries()) {
        let reconciler = reconciler();
        let mut state = apply_all(&delivered);
        let before = state.snapshot();
        for message in &delivered {
            let outcome = reconciler.apply(&mut state, MessageEvent::Created(message.clone()));
            prop_assert!(!outcome.changed());
        }
        prop_assert_eq!(state.snapshot(), before);
    }
}
