//! The single-threaded cooperative event loop.
//!
//! The loop owns two registries: *watches* binding a poll token to the
//! thing it drives (the listener, a connection slot, the signal pipe) and
//! *timeouts* binding deadlines to typed payloads. One iteration blocks in
//! the readiness primitive until a watch fires or the nearest deadline
//! expires, then hands ready events back to the caller in watch
//! registration order. A generation counter is bumped on every watch-set
//! mutation; the caller abandons the rest of an event batch when the
//! generation moved under it, since the remaining events may refer to
//! recycled slots.

use crate::ConnId;
use hashbrown::HashSet;
use indexmap::IndexMap;
use mio::{Events, Poll, Ready, Token};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

const EVENTS_CAPACITY: usize = 1024;

/// What a registered poll token drives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WatchKind {
    Listener,
    Connection(ConnId),
    SignalPipe,
}

/// Typed payload of a timeout.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    AuthExpired(ConnId),
    ActivationExpired(String),
    MemoryRetry(ConnId),
}

pub type TimeoutId = u64;

/// One ready watch reported by `wait`.
#[derive(Debug, Copy, Clone)]
pub struct ReadyEvent {
    pub kind: WatchKind,
    pub readable: bool,
    pub writable: bool,
}

struct TimeoutEntry {
    deadline: Instant,
    id: TimeoutId,
    kind: TimeoutKind,
}

// Min-heap ordering on (deadline, id): BinaryHeap is a max-heap, so the
// comparison is reversed here instead of wrapping every entry.
impl Ord for TimeoutEntry {
    fn cmp(&self, other: &TimeoutEntry) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &TimeoutEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &TimeoutEntry) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimeoutEntry {}

pub struct MainLoop {
    poll: Poll,
    events: Events,

    watches: IndexMap<Token, WatchKind>,
    generation: u64,

    timeouts: BinaryHeap<TimeoutEntry>,
    live_timeouts: HashSet<TimeoutId>,
    next_timeout_id: TimeoutId,

    quit: bool,
}

impl MainLoop {
    pub fn new() -> io::Result<MainLoop> {
        Ok(MainLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            watches: IndexMap::new(),
            generation: 0,
            timeouts: BinaryHeap::new(),
            live_timeouts: HashSet::new(),
            next_timeout_id: 0,
            quit: false,
        })
    }

    /// The readiness primitive handles are registered on.
    #[inline]
    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Track `token` as a watch. The caller registers the actual handle on
    /// `poll()` itself; the loop only keeps the ordering and the mapping.
    pub fn add_watch(&mut self, token: Token, kind: WatchKind) {
        let previous = self.watches.insert(token, kind);
        debug_assert!(previous.is_none(), "watch token registered twice");
        self.generation += 1;
    }

    /// Forget a watch. The caller deregisters the handle itself.
    pub fn remove_watch(&mut self, token: Token) {
        // shift_remove keeps registration order for the surviving watches.
        if self.watches.shift_remove(&token).is_some() {
            self.generation += 1;
        }
    }

    #[inline]
    pub fn watch_kind(&self, token: Token) -> Option<WatchKind> {
        self.watches.get(&token).copied()
    }

    #[inline]
    pub fn has_watches(&self) -> bool {
        !self.watches.is_empty()
    }

    /// Bumped on every watch-set mutation; used by callers to notice that
    /// an event batch went stale mid-dispatch.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arm a timeout `delay` from `now`. Returns the id used to cancel it.
    pub fn add_timeout(&mut self, kind: TimeoutKind, delay: Duration, now: Instant) -> TimeoutId {
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;

        self.timeouts.push(TimeoutEntry {
            deadline: now + delay,
            id,
            kind,
        });
        self.live_timeouts.insert(id);

        id
    }

    /// Cancel a pending timeout. Unknown or already-fired ids are ignored;
    /// the heap entry is dropped lazily when it surfaces.
    #[inline]
    pub fn cancel_timeout(&mut self, id: TimeoutId) {
        self.live_timeouts.remove(&id);
    }

    /// Duration until the nearest live deadline, zero if already due.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Duration> {
        loop {
            match self.timeouts.peek() {
                Some(entry) if !self.live_timeouts.contains(&entry.id) => {
                    self.timeouts.pop();
                }
                Some(entry) => {
                    return Some(if entry.deadline > now {
                        entry.deadline - now
                    } else {
                        Duration::from_millis(0)
                    });
                }
                None => return None,
            }
        }
    }

    /// Pop every timeout whose deadline has passed.
    pub fn due_timeouts(&mut self, now: Instant) -> Vec<TimeoutKind> {
        let mut due = Vec::new();

        loop {
            match self.timeouts.peek() {
                Some(entry) if entry.deadline <= now => {
                    let entry = self.timeouts.pop().unwrap();
                    if self.live_timeouts.remove(&entry.id) {
                        due.push(entry.kind);
                    }
                }
                _ => break,
            }
        }

        due
    }

    /// Request loop termination. Takes effect before the next block.
    #[inline]
    pub fn quit(&mut self) {
        self.quit = true;
    }

    #[inline]
    pub fn is_quitting(&self) -> bool {
        self.quit
    }

    /// Block until a watch becomes ready or the nearest deadline expires.
    /// Ready events come back in watch registration order; readiness for
    /// tokens whose watch was removed since registration is dropped.
    pub fn wait(&mut self, now: Instant) -> io::Result<Vec<ReadyEvent>> {
        if self.quit {
            return Ok(Vec::new());
        }

        let timeout = self.next_deadline(now);
        self.poll.poll(&mut self.events, timeout)?;

        let mut ready: IndexMap<Token, Ready> = IndexMap::new();
        for event in &self.events {
            let merged = ready
                .get(&event.token())
                .map(|existing| *existing | event.readiness())
                .unwrap_or_else(|| event.readiness());
            ready.insert(event.token(), merged);
        }

        let mut ordered = Vec::with_capacity(ready.len());
        for (token, kind) in self.watches.iter() {
            if let Some(readiness) = ready.get(token) {
                ordered.push(ReadyEvent {
                    kind: *kind,
                    readable: readiness.is_readable(),
                    writable: readiness.is_writable(),
                });
            }
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{PollOpt, Registration};

    #[test]
    fn test_watch_bookkeeping_and_generation() {
        let mut main_loop = MainLoop::new().unwrap();
        assert!(!main_loop.has_watches());

        main_loop.add_watch(Token(0), WatchKind::Listener);
        main_loop.add_watch(Token(1), WatchKind::Connection(0));
        assert_eq!(main_loop.generation(), 2);
        assert_eq!(main_loop.watch_kind(Token(1)), Some(WatchKind::Connection(0)));

        main_loop.remove_watch(Token(0));
        assert_eq!(main_loop.generation(), 3);
        assert_eq!(main_loop.watch_kind(Token(0)), None);

        // Removing an unknown token does not bump the generation.
        main_loop.remove_watch(Token(9));
        assert_eq!(main_loop.generation(), 3);

        assert!(main_loop.has_watches());
    }

    #[test]
    fn test_timeout_ordering_and_cancellation() {
        let mut main_loop = MainLoop::new().unwrap();
        let now = Instant::now();

        let slow = main_loop.add_timeout(TimeoutKind::MemoryRetry(7), Duration::from_secs(10), now);
        let fast = main_loop.add_timeout(
            TimeoutKind::AuthExpired(3),
            Duration::from_millis(5),
            now,
        );
        let _ = slow;

        let deadline = main_loop.next_deadline(now).unwrap();
        assert!(deadline <= Duration::from_millis(5));

        main_loop.cancel_timeout(fast);
        let deadline = main_loop.next_deadline(now).unwrap();
        assert!(deadline > Duration::from_secs(9));

        let due = main_loop.due_timeouts(now + Duration::from_secs(11));
        assert_eq!(due, vec![TimeoutKind::MemoryRetry(7)]);
        assert_eq!(main_loop.next_deadline(now), None);
    }

    #[test]
    fn test_due_timeouts_fire_in_deadline_order() {
        let mut main_loop = MainLoop::new().unwrap();
        let now = Instant::now();

        main_loop.add_timeout(
            TimeoutKind::ActivationExpired("b".to_string()),
            Duration::from_millis(20),
            now,
        );
        main_loop.add_timeout(
            TimeoutKind::ActivationExpired("a".to_string()),
            Duration::from_millis(10),
            now,
        );
        main_loop.add_timeout(TimeoutKind::MemoryRetry(1), Duration::from_millis(30), now);

        let due = main_loop.due_timeouts(now + Duration::from_millis(25));
        assert_eq!(
            due,
            vec![
                TimeoutKind::ActivationExpired("a".to_string()),
                TimeoutKind::ActivationExpired("b".to_string()),
            ]
        );

        let due = main_loop.due_timeouts(now + Duration::from_millis(35));
        assert_eq!(due, vec![TimeoutKind::MemoryRetry(1)]);
    }

    #[test]
    fn test_wait_returns_events_in_watch_order() {
        let mut main_loop = MainLoop::new().unwrap();

        let (first_reg, first_ready) = Registration::new2();
        let (second_reg, second_ready) = Registration::new2();

        main_loop
            .poll()
            .register(&first_reg, Token(10), Ready::readable(), PollOpt::level())
            .unwrap();
        main_loop
            .poll()
            .register(&second_reg, Token(11), Ready::readable(), PollOpt::level())
            .unwrap();

        // Watches registered in the opposite order of the tokens firing.
        main_loop.add_watch(Token(11), WatchKind::Connection(1));
        main_loop.add_watch(Token(10), WatchKind::Connection(0));

        second_ready.set_readiness(Ready::readable()).unwrap();
        first_ready.set_readiness(Ready::readable()).unwrap();

        let events = main_loop.wait(Instant::now()).unwrap();
        let kinds: Vec<_> = events.iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![WatchKind::Connection(1), WatchKind::Connection(0)]
        );
        assert!(events.iter().all(|event| event.readable));
    }

    #[test]
    fn test_wait_drops_stale_tokens() {
        let mut main_loop = MainLoop::new().unwrap();

        let (registration, set_ready) = Registration::new2();
        main_loop
            .poll()
            .register(&registration, Token(5), Ready::readable(), PollOpt::level())
            .unwrap();
        main_loop.add_watch(Token(5), WatchKind::Connection(2));
        main_loop.remove_watch(Token(5));

        set_ready.set_readiness(Ready::readable()).unwrap();

        // A deadline keeps the wait from blocking forever.
        let now = Instant::now();
        main_loop.add_timeout(TimeoutKind::MemoryRetry(2), Duration::from_millis(10), now);

        let events = main_loop.wait(now).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_quit_short_circuits_wait() {
        let mut main_loop = MainLoop::new().unwrap();
        main_loop.quit();
        assert!(main_loop.is_quitting());

        let events = main_loop.wait(Instant::now()).unwrap();
        assert!(events.is_empty());
    }
}
