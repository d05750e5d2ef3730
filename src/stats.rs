use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// The three counters tracked both in aggregate (`sum`) and per interval (each `Snapshot`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub total: u64,
    pub answered: u64,
    pub noerror: u64,
}

/// A per-interval counter record, held in a plain `VecDeque` rather than a hand-rolled linked
/// list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub counters: Counters,
}

/// The statistics ledger: a monotonically-growing `sum` plus a chain of per-interval
/// snapshots. Every increment against the current snapshot is mirrored against `sum`.
#[derive(Debug)]
pub struct Stats {
    sum: Counters,
    snapshots: VecDeque<Snapshot>,
    processed: u64,
    discarded: u64,
    ongoing: u64,
    timed_out: u64,
    interval: Option<Duration>,
    next_tick: Option<Instant>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            sum: Counters::default(),
            snapshots: VecDeque::from([Snapshot::default()]),
            processed: 0,
            discarded: 0,
            ongoing: 0,
            timed_out: 0,
            interval: None,
            next_tick: None,
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a recurring interval. The first tick happens `interval` from now; `Engine::run_nowait`
    /// is responsible for calling `tick` often enough to observe it.
    pub fn collect(&mut self, interval: Duration, now: Instant) {
        self.interval = Some(interval);
        self.next_tick = Some(now + interval);
    }

    /// Disarms the interval. Existing snapshots are kept; only the timer stops.
    pub fn finish(&mut self) {
        self.interval = None;
        self.next_tick = None;
    }

    /// Advances the interval timer. Returns `true` (and logs one line) each time an interval
    /// elapses, pushing a fresh current snapshot.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(next_tick) = self.next_tick else {
            return false;
        };

        if now < next_tick {
            return false;
        }

        let current = self.current();
        tracing::info!(
            processed = self.processed,
            answered = current.counters.answered,
            discarded = self.discarded,
            ongoing = self.ongoing,
            "stats tick"
        );

        self.snapshots.push_back(Snapshot::default());

        let interval = self
            .interval
            .expect("next_tick is only Some while interval is armed");
        self.next_tick = Some(next_tick + interval);

        true
    }

    fn current_mut(&mut self) -> &mut Snapshot {
        self.snapshots
            .back_mut()
            .expect("snapshots chain always has at least one entry")
    }

    pub fn current(&self) -> &Snapshot {
        self.snapshots
            .back()
            .expect("snapshots chain always has at least one entry")
    }

    pub fn sum(&self) -> Counters {
        self.sum
    }

    pub fn snapshots(&self) -> &VecDeque<Snapshot> {
        &self.snapshots
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn ongoing(&self) -> u64 {
        self.ongoing
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out
    }

    /// The instant of the next scheduled tick, if the interval is armed.
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn record_discarded(&mut self) {
        self.discarded += 1;
    }

    pub fn record_query_started(&mut self) {
        self.ongoing += 1;
    }

    pub fn record_query_ended(&mut self) {
        self.ongoing -= 1;
    }

    pub fn record_timed_out(&mut self) {
        self.timed_out += 1;
    }

    pub fn record_total(&mut self) {
        self.sum.total += 1;
        self.current_mut().counters.total += 1;
    }

    pub fn record_answered(&mut self) {
        self.sum.answered += 1;
        self.current_mut().counters.answered += 1;
    }

    pub fn record_noerror(&mut self) {
        self.sum.noerror += 1;
        self.current_mut().counters.noerror += 1;
    }

    /// `true` iff `sum.total` equals the sum of every snapshot's `total`.
    pub fn sum_matches_snapshot_total(&self) -> bool {
        let snapshot_sum: u64 = self.snapshots.iter().map(|s| s.counters.total).sum();
        snapshot_sum == self.sum.total
    }

    /// `true` iff every processed packet ends up exactly one of answered, discarded, timed
    /// out, or still in flight.
    pub fn processed_matches_ledger(&self, in_flight: u64) -> bool {
        self.processed == self.sum.answered + self.discarded + self.timed_out + in_flight
    }
}
