use std::sync::Arc;

use futures_util::future::BoxFuture;
use proptest::prelude::*;
use rust_decimal::Decimal;

use book_sync::config::CalibrationConfig;
use book_sync::events::EventSender;
use book_sync::observation::Observation;
use book_sync::orderbook::OrderBook;
use book_sync::types::{Diff, Side, Snapshot};
use book_sync::{Error, SnapshotProvider};

const SYM: &str = "PROP";

proptest! {
    #[test]
    fn duplicate_delivery_is_idempotent(diffs in diff_stream(1..300)) {
        let mut once = OrderBook::new();
        let mut twice = OrderBook::new();

        for diff in &diffs {
            once.apply_diff(diff).unwrap();
            twice.apply_diff(diff).unwrap();
            twice.apply_diff(diff).unwrap();
        }
        prop_assert_eq!(levels(&once), levels(&twice));
        prop_assert_eq!(once.sequence(), twice.sequence());
    }

    #[test]
    fn replaying_older_diffs_changes_nothing(diffs in diff_stream(1..200), cut in 0usize..200) {
        let mut book = OrderBook::new();
        for diff in &diffs {
            book.apply_diff(diff).unwrap();
        }
        let before = levels(&book);

        let cut = cut.min(diffs.len());
        for diff in &diffs[..cut] {
            book.apply_diff(diff).unwrap();
        }
        prop_assert_eq!(levels(&book), before);
    }

    #[test]
    fn calibration_timing_does_not_change_the_book(
        diffs in diff_stream(1..200),
        snapshot_at in 0usize..200,
        arrived_before in 0usize..200,
    ) {
        let snapshot_at = snapshot_at.min(diffs.len());
        let arrived_before = arrived_before.min(diffs.len());

        let mut expected = OrderBook::new();
        for diff in &diffs {
            expected.apply_diff(diff).unwrap();
        }

        let mut at_snapshot = OrderBook::new();
        for diff in &diffs[..snapshot_at] {
            at_snapshot.apply_diff(diff).unwrap();
        }
        let snapshot = snapshot_of(&at_snapshot, snapshot_at as u64);

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let obs = Observation::new(
            SYM,
            Arc::new(NoSnapshots),
            CalibrationConfig::default(),
            EventSender::default(),
            runtime.handle().clone(),
        );

        for diff in &diffs[..arrived_before] {
            obs.on_next(diff.clone()).unwrap();
        }
        obs.calibrate_with(&snapshot).unwrap();
        for diff in &diffs[arrived_before..] {
            obs.on_next(diff.clone()).unwrap();
        }

        let book = obs.book().unwrap();
        prop_assert_eq!(levels(&book), levels(&expected));
        prop_assert_eq!(book.sequence(), expected.sequence());
    }

    #[test]
    fn no_zero_size_level_survives(diffs in diff_stream(1..300)) {
        let mut book = OrderBook::new();
        for diff in &diffs {
            book.apply_diff(diff).unwrap();
            if diff.is_removal() {
                let present = match diff.side {
                    Side::Ask => book.asks().contains(diff.price),
                    Side::Bid => book.bids().contains(diff.price),
                };
                prop_assert!(!present);
            }
        }
        prop_assert!(book.asks().iter().all(|l| l.size > Decimal::ZERO));
        prop_assert!(book.bids().iter().all(|l| l.size > Decimal::ZERO));
    }
}

struct NoSnapshots;

impl SnapshotProvider for NoSnapshots {
    fn fetch_snapshot(&self, _symbol: &str) -> BoxFuture<'static, book_sync::Result<Snapshot>> {
        Box::pin(async { Err(Error::ConnectionClosed) })
    }
}

/// Diffs with sequences 1..=n over a narrow price band, so levels are hit
/// repeatedly and removals often target absent levels
fn diff_stream(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<Diff>> {
    prop::collection::vec((any_side(), 1i64..20, 0i64..4), len).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (side, tick, qty))| {
                Diff::new(SYM, side, Decimal::new(tick, 1), Decimal::new(qty, 0), i as u64 + 1)
            })
            .collect()
    })
}

fn any_side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Bid), Just(Side::Ask)]
}

fn snapshot_of(book: &OrderBook, sequence: u64) -> Snapshot {
    let mut snapshot = Snapshot::new(SYM, sequence);
    for level in book.asks().iter() {
        snapshot = snapshot.with_ask(level.price, level.size);
    }
    for level in book.bids().iter() {
        snapshot = snapshot.with_bid(level.price, level.size);
    }
    snapshot
}

fn levels(book: &OrderBook) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
    (
        book.asks().iter().map(|l| (l.price, l.size)).collect(),
        book.bids().iter().map(|l| (l.price, l.size)).collect(),
    )
}
