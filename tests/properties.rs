use std::sync::Arc;

use observable::{Observable, Subscription};
use parking_lot::Mutex;
use proptest::prelude::*;

type Log = Arc<Mutex<Vec<(usize, i64)>>>;

fn subscribe_all(
    observable: &Observable<i64>,
    count: usize,
    log: &Log,
) -> Vec<Subscription<i64>> {
    (0..count)
        .map(|index| {
            let log = log.clone();
            observable.subscribe(move |value: &i64| log.lock().push((index, *value)))
        })
        .collect()
}

proptest! {
    #[test]
    fn every_subscriber_receives_each_value_in_order(
        count in 0_usize..16,
        values in proptest::collection::vec(any::<i64>(), 0..8),
    ) {
        let log = Log::default();
        let observable = Observable::new();
        let _subscriptions = subscribe_all(&observable, count, &log);

        for value in &values {
            observable.next(*value);
        }

        let expected: Vec<(usize, i64)> = values
            .iter()
            .flat_map(|value| (0..count).map(move |index| (index, *value)))
            .collect();
        prop_assert_eq!(log.lock().clone(), expected);
    }

    #[test]
    fn unsubscribing_only_affects_the_removed_subscribers(
        removed in proptest::collection::vec(any::<bool>(), 1..16),
        twice in any::<bool>(),
        value in any::<i64>(),
    ) {
        let log = Log::default();
        let observable = Observable::new();
        let subscriptions = subscribe_all(&observable, removed.len(), &log);

        for (subscription, remove) in subscriptions.iter().zip(&removed) {
            if *remove {
                subscription.unsubscribe();
                if twice {
                    observable.unsubscribe(subscription);
                }
            }
        }
        observable.next(value);

        let expected: Vec<(usize, i64)> = removed
            .iter()
            .enumerate()
            .filter(|(_, remove)| !**remove)
            .map(|(index, _)| (index, value))
            .collect();
        prop_assert_eq!(log.lock().clone(), expected.clone());
        prop_assert_eq!(observable.subscribers(), expected.len());
        for (subscription, remove) in subscriptions.iter().zip(&removed) {
            prop_assert_eq!(subscription.is_valid(), !*remove);
        }
    }
}
