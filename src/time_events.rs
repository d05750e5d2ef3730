use std::cmp::Ordering;
use std::time::Instant;

/// A collection of actions scheduled to trigger at a specific instant.
///
/// It is the caller's responsibility to track time passing and call `pending_actions` often
/// enough (see `Engine::run_nowait`). Keyed on `Instant` rather than wall-clock time, since
/// nothing here reasons about deadlines across a process restart.
#[derive(Debug)]
pub struct TimeEvents<A> {
    events: Vec<TimeEvent<A>>,
}

impl<A> TimeEvents<A>
where
    A: PartialEq,
{
    /// Schedules `action` to fire at `trigger`, replacing any existing entry for the same
    /// action (re-arming a timeout moves it, it does not duplicate it).
    pub fn add(&mut self, trigger: Instant, action: A) {
        self.events.retain(|event| event.action != action);
        self.events.push(TimeEvent {
            time: trigger,
            action,
        });
        self.events.sort_unstable();
    }

    /// Cancels a previously-scheduled action, if any.
    pub fn cancel(&mut self, action: &A) {
        self.events.retain(|event| &event.action != action);
    }

    /// Removes and returns every action whose trigger time has passed.
    pub fn pending_actions(&mut self, now: Instant) -> Vec<A> {
        let split_index = self
            .events
            .partition_point(|event| event.time <= now);

        self.events.drain(..split_index).map(|e| e.action).collect()
    }

    /// The instant at which the next action becomes ready, if any are scheduled.
    pub fn next_trigger(&self) -> Option<Instant> {
        self.events.first().map(|e| e.time)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<A> Default for TimeEvents<A> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

#[derive(Debug)]
struct TimeEvent<A> {
    time: Instant,
    action: A,
}

impl<A> Eq for TimeEvent<A> {}

impl<A> PartialEq for TimeEvent<A> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl<A> Ord for TimeEvent<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl<A> PartialOrd for TimeEvent<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
