//! Orderbook differ: ADD / UPDATE / REMOVE events from two consecutive
//! depth snapshots of the same market.
//!
//! All events from one snapshot pair share `event_time = current.captured_at`
//! and carry no intra-timestamp order beyond a deterministic (side, price)
//! sort.

use std::collections::HashMap;

use crate::models::{BookEventType, BookLevel, BookSide, OrderbookEvent, OrderbookSnapshot};

fn ladder_map(levels: &[BookLevel]) -> HashMap<i64, i64> {
    levels.iter().map(|l| (l.price, l.size)).collect()
}

fn diff_side(
    market_id: &str,
    event_time: i64,
    side: BookSide,
    prior: &[BookLevel],
    current: &[BookLevel],
    out: &mut Vec<OrderbookEvent>,
) {
    let prior = ladder_map(prior);
    let current = ladder_map(current);

    for (&price, &size) in &current {
        match prior.get(&price) {
            None => out.push(OrderbookEvent::new(
                market_id,
                event_time,
                side,
                price,
                size,
                BookEventType::Add,
            )),
            Some(&old) if old != size => out.push(OrderbookEvent::new(
                market_id,
                event_time,
                side,
                price,
                size,
                BookEventType::Update,
            )),
            Some(_) => {}
        }
    }

    for &price in prior.keys() {
        if !current.contains_key(&price) {
            out.push(OrderbookEvent::new(
                market_id,
                event_time,
                side,
                price,
                0,
                BookEventType::Remove,
            ));
        }
    }
}

/// Diff `prior` -> `current`. Levels present only in `current` emit ADD with
/// the new size; only in `prior` emit REMOVE with size 0; present in both
/// with differing sizes emit UPDATE; equal sizes emit nothing.
pub fn diff_snapshots(
    prior: &OrderbookSnapshot,
    current: &OrderbookSnapshot,
) -> Vec<OrderbookEvent> {
    let mut events = Vec::new();
    diff_side(
        &current.market_id,
        current.captured_at,
        BookSide::Yes,
        &prior.yes_levels,
        &current.yes_levels,
        &mut events,
    );
    diff_side(
        &current.market_id,
        current.captured_at,
        BookSide::No,
        &prior.no_levels,
        &current.no_levels,
        &mut events,
    );
    events.sort_by_key(|e| (e.side == BookSide::No, e.price));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(yes: &[(i64, i64)], no: &[(i64, i64)], ts: i64) -> OrderbookSnapshot {
        OrderbookSnapshot::from_ladders(
            "MKT-A",
            ts,
            yes.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
            no.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
        )
    }

    /// Replay `events` over the prior ladder for one side.
    fn apply(prior: &[BookLevel], events: &[OrderbookEvent], side: BookSide) -> Vec<BookLevel> {
        let mut ladder: std::collections::HashMap<i64, i64> =
            prior.iter().map(|l| (l.price, l.size)).collect();
        for event in events.iter().filter(|e| e.side == side) {
            match event.kind {
                BookEventType::Add | BookEventType::Update => {
                    ladder.insert(event.price, event.size);
                }
                BookEventType::Remove => {
                    ladder.remove(&event.price);
                }
            }
        }
        let mut out: Vec<BookLevel> = ladder
            .into_iter()
            .map(|(price, size)| BookLevel { price, size })
            .collect();
        out.sort_by_key(|l| l.price);
        out
    }

    #[test]
    fn add_remove_update_emitted_per_level() {
        let prior = book(&[(40, 10), (41, 5)], &[], 100);
        let current = book(&[(40, 10), (42, 7)], &[], 200);

        let events = diff_snapshots(&prior, &current);
        assert_eq!(events.len(), 2);

        let removed = events.iter().find(|e| e.kind == BookEventType::Remove).unwrap();
        assert_eq!((removed.price, removed.size), (41, 0));

        let added = events.iter().find(|e| e.kind == BookEventType::Add).unwrap();
        assert_eq!((added.price, added.size), (42, 7));

        // Untouched level (40, 10) emits nothing.
        assert!(!events.iter().any(|e| e.price == 40));
        assert!(events.iter().all(|e| e.event_time == 200));
    }

    #[test]
    fn size_change_is_update() {
        let prior = book(&[(40, 10)], &[(55, 3)], 100);
        let current = book(&[(40, 12)], &[(55, 3)], 200);

        let events = diff_snapshots(&prior, &current);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BookEventType::Update);
        assert_eq!(events[0].size, 12);
        assert_eq!(events[0].side, BookSide::Yes);
    }

    #[test]
    fn identical_snapshots_emit_nothing() {
        let snap = book(&[(40, 10), (41, 5)], &[(55, 3)], 100);
        assert!(diff_snapshots(&snap, &snap).is_empty());
    }

    #[test]
    fn event_invariants_hold() {
        let prior = book(&[(40, 10), (41, 5)], &[(50, 1)], 100);
        let current = book(&[(40, 3), (42, 7)], &[(50, 1), (51, 9)], 200);

        for event in diff_snapshots(&prior, &current) {
            match event.kind {
                BookEventType::Remove => assert_eq!(event.size, 0),
                BookEventType::Add => assert!(event.size > 0),
                BookEventType::Update => assert!(event.size > 0),
            }
        }
    }

    #[test]
    fn replaying_events_reproduces_current_ladder() {
        let prior = book(&[(40, 10), (41, 5), (43, 2)], &[(50, 8), (52, 4)], 100);
        let current = book(&[(40, 3), (42, 7)], &[(50, 8), (51, 9), (52, 1)], 200);

        let events = diff_snapshots(&prior, &current);

        let yes = apply(&prior.yes_levels, &events, BookSide::Yes);
        let no = apply(&prior.no_levels, &events, BookSide::No);

        let mut expected_yes = current.yes_levels.clone();
        expected_yes.sort_by_key(|l| l.price);
        let mut expected_no = current.no_levels.clone();
        expected_no.sort_by_key(|l| l.price);

        assert_eq!(yes, expected_yes);
        assert_eq!(no, expected_no);
    }
}
