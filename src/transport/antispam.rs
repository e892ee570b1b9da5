//! Antispam gate
//!
//! Paces submissions so they reach the command queue no faster than the
//! configured interval. Backlogged commands keep their submission order and
//! are never dropped.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::queue::PendingCommand;

pub(crate) struct AntispamGate {
    interval: Option<Duration>,
    backlog: VecDeque<PendingCommand>,
    last_release: Option<Instant>,
}

impl AntispamGate {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            backlog: VecDeque::new(),
            last_release: None,
        }
    }

    /// Offer a submission; it is handed straight back when it may pass now
    pub fn offer(&mut self, pending: PendingCommand, now: Instant) -> Option<PendingCommand> {
        if self.backlog.is_empty() && self.next_slot().is_none_or(|slot| slot <= now) {
            self.last_release = Some(now);
            return Some(pending);
        }
        self.backlog.push_back(pending);
        None
    }

    /// When the head of the backlog may be released
    pub fn ready_at(&self) -> Option<Instant> {
        if self.backlog.is_empty() {
            return None;
        }
        self.next_slot()
    }

    /// Release the head of the backlog if its slot has come
    pub fn release(&mut self, now: Instant) -> Option<PendingCommand> {
        if self.next_slot().is_some_and(|slot| slot > now) {
            return None;
        }
        let pending = self.backlog.pop_front()?;
        self.last_release = Some(now);
        Some(pending)
    }

    /// Remove every backlogged command in submission order
    pub fn drain(&mut self) -> impl Iterator<Item = PendingCommand> + '_ {
        self.backlog.drain(..)
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    fn next_slot(&self) -> Option<Instant> {
        let interval = self.interval?;
        self.last_release.map(|last| last + interval)
    }
}
