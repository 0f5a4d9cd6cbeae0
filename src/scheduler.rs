//! Cooperative run-to-completion scheduler.
//!
//! Every periodic duty of a mesh node (topology re-sync, clock sync,
//! bridge monitoring, queue draining) is an entry in a [`Scheduler`].
//! A turn hands out the entries that are due; the owner runs them one
//! after another and then closes the turn.
//!
//! While a turn is open the entry table is never restructured in place.
//! Adding, cancelling or clearing entries from inside a running task goes
//! to a command buffer that is applied when the turn ends, and work that
//! would tear down the caller's own context is handed to [`Scheduler::defer`]
//! and only runs on the following turn.
//!
//! ```
//! use std::time::Duration;
//! use treemesh::{Scheduler, Timestamp};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum Job { Ping, Restart }
//!
//! let mut sched = Scheduler::new();
//! sched.every(Job::Ping, Duration::from_secs(1), Timestamp::ZERO);
//!
//! let due = sched.begin_turn(Timestamp::ZERO);
//! assert_eq!(due, vec![Job::Ping]);
//! sched.defer(Job::Restart);
//! sched.clear();
//! sched.end_turn();
//!
//! // The restart runs on the next turn; the cleared table no longer pings.
//! assert_eq!(sched.begin_turn(Timestamp::from_secs(1)), vec![Job::Restart]);
//! sched.end_turn();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::types::Timestamp;

/// Handle of a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry<T> {
    id: TaskId,
    task: T,
    interval: Option<Duration>,
    next_run: Timestamp,
}

#[derive(Debug)]
enum Command<T> {
    Insert(Entry<T>),
    Cancel(TaskId),
    CancelTask(T),
    Clear,
}

/// Scheduler of periodic, one-shot and deferred work items.
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
    commands: Vec<Command<T>>,
    deferred: VecDeque<T>,
    next_id: u64,
    in_turn: bool,
    turns: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            commands: Vec::new(),
            deferred: VecDeque::new(),
            next_id: 1,
            in_turn: false,
            turns: 0,
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug> Scheduler<T> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn submit(&mut self, command: Command<T>) {
        if self.in_turn {
            self.commands.push(command);
        } else {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command<T>) {
        match command {
            Command::Insert(entry) => self.entries.push(entry),
            Command::Cancel(id) => self.entries.retain(|e| e.id != id),
            Command::CancelTask(task) => self.entries.retain(|e| e.task != task),
            Command::Clear => self.entries.clear(),
        }
    }

    /// Run `task` every `interval`, first at `first_run`.
    pub fn every(&mut self, task: T, interval: Duration, first_run: Timestamp) -> TaskId {
        let id = self.allocate();
        self.submit(Command::Insert(Entry {
            id,
            task,
            interval: Some(interval),
            next_run: first_run,
        }));
        id
    }

    /// Run `task` once at `when`.
    pub fn at(&mut self, task: T, when: Timestamp) -> TaskId {
        let id = self.allocate();
        self.submit(Command::Insert(Entry {
            id,
            task,
            interval: None,
            next_run: when,
        }));
        id
    }

    /// Run `task` at the start of the next turn.
    ///
    /// Deferred work is never handed out by the turn that deferred it and
    /// survives [`clear`](Self::clear).
    pub fn defer(&mut self, task: T) {
        tracing::trace!(?task, "deferred to next turn");
        self.deferred.push_back(task);
    }

    /// Cancel one entry.
    pub fn cancel(&mut self, id: TaskId) {
        self.submit(Command::Cancel(id));
    }

    /// Cancel every entry running `task`.
    pub fn cancel_task(&mut self, task: &T) {
        self.submit(Command::CancelTask(task.clone()));
    }

    /// Drop all periodic and one-shot entries.
    pub fn clear(&mut self) {
        self.submit(Command::Clear);
    }

    /// Open a turn and return the work due at `now`.
    ///
    /// Deferred items come first in submission order, then due entries
    /// ordered by deadline. Periodic entries are re-armed `interval`
    /// after `now`; one-shot entries are removed.
    pub fn begin_turn(&mut self, now: Timestamp) -> Vec<T> {
        debug_assert!(!self.in_turn, "turn already open");
        self.in_turn = true;
        self.turns += 1;

        let mut due: Vec<T> = std::mem::take(&mut self.deferred).into_iter().collect();

        let mut ready: Vec<(Timestamp, TaskId, T)> = self
            .entries
            .iter()
            .filter(|e| e.next_run <= now)
            .map(|e| (e.next_run, e.id, e.task.clone()))
            .collect();
        ready.sort_by_key(|(at, id, _)| (*at, *id));

        self.entries.retain_mut(|e| {
            if e.next_run > now {
                return true;
            }
            match e.interval {
                Some(interval) => {
                    e.next_run = now + interval;
                    true
                }
                None => false,
            }
        });

        due.extend(ready.into_iter().map(|(_, _, task)| task));
        due
    }

    /// Close the turn and apply buffered structural changes.
    pub fn end_turn(&mut self) {
        self.in_turn = false;
        let commands = std::mem::take(&mut self.commands);
        for command in commands {
            self.apply(command);
        }
    }

    /// Whether a turn is open.
    pub fn in_turn(&self) -> bool {
        self.in_turn
    }

    /// Earliest time anything is due, `None` when idle.
    ///
    /// Pending deferred work is due immediately.
    pub fn next_deadline(&self, now: Timestamp) -> Option<Timestamp> {
        if !self.deferred.is_empty() {
            return Some(now);
        }
        self.entries.iter().map(|e| e.next_run).min()
    }

    /// Whether any entry runs `task`.
    pub fn is_scheduled(&self, task: &T) -> bool {
        self.entries.iter().any(|e| &e.task == task)
    }

    /// Scheduled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deferred items waiting for the next turn.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Turns opened so far.
    pub fn turns(&self) -> u64 {
        self.turns
    }
}

impl<T: fmt::Debug> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.entries.len())
            .field("deferred", &self.deferred)
            .field("pending_commands", &self.commands.len())
            .field("turns", &self.turns)
            .finish()
    }
}
