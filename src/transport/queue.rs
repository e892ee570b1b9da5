//! Command queue with a single in-flight slot
//!
//! Commands are written strictly one at a time: the next command only goes out
//! once the previous one has received its status line. Completions therefore
//! happen in submission order.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{Command, QueryResponse, Row, StatusLine};
use crate::transport::{ParseError, QueryError};

pub(crate) type Responder = oneshot::Sender<Result<QueryResponse, QueryError>>;

/// Where a command's outcome goes
pub(crate) enum Completion {
    Caller(Responder),
    /// Internal keepalive; the outcome is only logged
    Keepalive,
}

impl Completion {
    fn complete(self, command: &str, result: Result<QueryResponse, QueryError>) {
        match self {
            Completion::Caller(tx) => {
                // The caller may have dropped its handle
                let _ = tx.send(result);
            }
            Completion::Keepalive => match result {
                Ok(_) => log::trace!("keepalive `{}` acknowledged", command),
                Err(e) => log::warn!("keepalive `{}` failed: {}", command, e),
            },
        }
    }
}

/// A submitted command waiting for its status line
pub(crate) struct PendingCommand {
    pub command: Command,
    pub submitted_at: Instant,
    completion: Completion,
}

impl PendingCommand {
    pub fn new(command: Command, completion: Completion) -> Self {
        Self {
            command,
            submitted_at: Instant::now(),
            completion,
        }
    }

    /// Pending command whose outcome is delivered to the returned receiver
    pub fn caller(
        command: Command,
    ) -> (Self, oneshot::Receiver<Result<QueryResponse, QueryError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(command, Completion::Caller(tx)), rx)
    }

    pub fn keepalive(command: Command) -> Self {
        Self::new(command, Completion::Keepalive)
    }

    pub fn fail(self, error: QueryError) {
        self.completion.complete(self.command.name(), Err(error));
    }
}

struct Queued {
    pending: PendingCommand,
    enqueued_at: Instant,
    deadline: Option<Instant>,
}

struct InFlight {
    name: String,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    /// `None` once the caller was failed by a timeout; the late reply is discarded
    completion: Option<Completion>,
    rows: Vec<Row>,
}

pub(crate) struct CommandQueue {
    timeout: Option<Duration>,
    in_flight: Option<InFlight>,
    waiting: VecDeque<Queued>,
}

impl CommandQueue {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            in_flight: None,
            waiting: VecDeque::new(),
        }
    }

    /// Enqueue a command. Returns the command to write when the wire was idle.
    pub fn push(&mut self, pending: PendingCommand, now: Instant) -> Option<Command> {
        self.waiting.push_back(Queued {
            pending,
            enqueued_at: now,
            deadline: self.timeout.map(|t| now + t),
        });
        if self.in_flight.is_none() {
            self.advance(now)
        } else {
            None
        }
    }

    /// Accumulate result rows for the command in flight
    pub fn on_rows(&mut self, rows: Vec<Row>) -> Result<(), ParseError> {
        let in_flight = self
            .in_flight
            .as_mut()
            .ok_or(ParseError::Unsolicited("result rows"))?;
        in_flight.rows.extend(rows);
        Ok(())
    }

    /// Complete the command in flight and return the next command to write
    pub fn on_status(
        &mut self,
        status: StatusLine,
        now: Instant,
    ) -> Result<Option<Command>, ParseError> {
        let in_flight = self
            .in_flight
            .take()
            .ok_or(ParseError::Unsolicited("status line"))?;

        match in_flight.completion {
            Some(completion) => {
                let result = if status.is_ok() {
                    Ok(QueryResponse {
                        rows: in_flight.rows,
                        status,
                    })
                } else {
                    Err(QueryError::Command(status))
                };
                completion.complete(&in_flight.name, result);
            }
            None => {
                log::debug!(
                    "discarding late status for timed out `{}`: {}",
                    in_flight.name,
                    status
                );
            }
        }

        Ok(self.advance(now))
    }

    /// Earliest pending deadline that still has a caller to fail
    pub fn next_deadline(&self) -> Option<Instant> {
        let in_flight = self
            .in_flight
            .as_ref()
            .filter(|f| f.completion.is_some())
            .and_then(|f| f.deadline);
        let waiting = self.waiting.iter().filter_map(|q| q.deadline).min();
        match (in_flight, waiting) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fail every command whose deadline has passed.
    ///
    /// An expired in-flight command keeps the wire slot until its late status
    /// line arrives; expired waiting commands are never written.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;

        if let Some(in_flight) = self.in_flight.as_mut()
            && in_flight.deadline.is_some_and(|d| d <= now)
            && let Some(completion) = in_flight.completion.take()
        {
            completion.complete(
                &in_flight.name,
                Err(QueryError::Timeout {
                    command: in_flight.name.clone(),
                    elapsed: now - in_flight.enqueued_at,
                }),
            );
            expired += 1;
        }

        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for queued in self.waiting.drain(..) {
            if queued.deadline.is_some_and(|d| d <= now) {
                let error = QueryError::Timeout {
                    command: queued.pending.command.name().to_string(),
                    elapsed: now - queued.enqueued_at,
                };
                queued.pending.fail(error);
                expired += 1;
            } else {
                kept.push_back(queued);
            }
        }
        self.waiting = kept;

        expired
    }

    /// Fail everything in FIFO order with `ConnectionClosed`
    pub fn teardown(&mut self) {
        if let Some(in_flight) = self.in_flight.take()
            && let Some(completion) = in_flight.completion
        {
            completion.complete(&in_flight.name, Err(QueryError::ConnectionClosed));
        }
        for queued in self.waiting.drain(..) {
            queued.pending.fail(QueryError::ConnectionClosed);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.waiting.is_empty()
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.name.as_str())
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Put the next live waiting command in flight; expired ones are failed, never written
    fn advance(&mut self, now: Instant) -> Option<Command> {
        debug_assert!(self.in_flight.is_none());
        while let Some(queued) = self.waiting.pop_front() {
            let Queued {
                pending,
                enqueued_at,
                deadline,
            } = queued;

            if deadline.is_some_and(|d| d <= now) {
                let error = QueryError::Timeout {
                    command: pending.command.name().to_string(),
                    elapsed: now - enqueued_at,
                };
                pending.fail(error);
                continue;
            }

            let command = pending.command;
            self.in_flight = Some(InFlight {
                name: command.name().to_string(),
                enqueued_at,
                deadline,
                completion: Some(pending.completion),
                rows: Vec::new(),
            });
            return Some(command);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    type Rx = oneshot::Receiver<Result<QueryResponse, QueryError>>;

    fn submit(queue: &mut CommandQueue, name: &str, now: Instant) -> (Option<Command>, Rx) {
        let (pending, rx) = PendingCommand::caller(Command::new(name));
        (queue.push(pending, now), rx)
    }

    fn row(key: &str, value: &str) -> Row {
        [(key, value)].into_iter().collect()
    }

    #[test]
    fn test_first_command_goes_in_flight_immediately() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();

        let (write, _rx) = submit(&mut queue, "whoami", now);
        assert_eq!(write.unwrap().name(), "whoami");

        let (write, _rx2) = submit(&mut queue, "version", now);
        assert!(write.is_none());
        assert_eq!(queue.in_flight(), Some("whoami"));
        assert_eq!(queue.waiting_len(), 1);
    }

    #[test]
    fn test_status_completes_head_with_rows_and_advances() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        let (_, mut first) = submit(&mut queue, "clientlist", now);
        let (_, mut second) = submit(&mut queue, "version", now);

        queue.on_rows(vec![row("clid", "1"), row("clid", "2")]).unwrap();
        let next = queue.on_status(StatusLine::ok(), now).unwrap();
        assert_eq!(next.unwrap().name(), "version");

        let response = first.try_recv().unwrap().unwrap();
        assert_eq!(response.rows.len(), 2);
        assert_eq!(response.rows[1].get("clid"), Some("2"));
        assert!(matches!(second.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_success_with_zero_rows() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        let (_, mut rx) = submit(&mut queue, "servergroupaddperm", now);

        assert!(queue.on_status(StatusLine::ok(), now).unwrap().is_none());
        let response = rx.try_recv().unwrap().unwrap();
        assert!(response.rows.is_empty());
        assert!(response.status.is_ok());
        assert!(queue.is_idle());
    }

    #[test]
    fn test_error_status_rejects_with_exact_status() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        let (_, mut rx) = submit(&mut queue, "servergroupaddperm", now);

        let status = StatusLine {
            id: 2562,
            msg: "invalid permission ID".to_string(),
            extra_msg: None,
            failed_permid: None,
        };
        queue.on_status(status.clone(), now).unwrap();

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.status(), Some(&status));
    }

    #[test]
    fn test_unsolicited_lines_are_errors() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        assert_eq!(
            queue.on_status(StatusLine::ok(), now),
            Err(ParseError::Unsolicited("status line"))
        );
        assert_eq!(
            queue.on_rows(vec![Row::new()]),
            Err(ParseError::Unsolicited("result rows"))
        );
    }

    #[test]
    fn test_completions_follow_submission_order() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (_, rx) = submit(&mut queue, &format!("cmd{}", i), now);
            receivers.push(rx);
        }

        for i in 0..5 {
            assert_eq!(queue.in_flight(), Some(format!("cmd{}", i).as_str()));
            queue.on_rows(vec![row("n", &i.to_string())]).unwrap();
            queue.on_status(StatusLine::ok(), now).unwrap();
        }

        for (i, mut rx) in receivers.into_iter().enumerate() {
            let response = rx.try_recv().unwrap().unwrap();
            assert_eq!(response.rows[0].get("n"), Some(i.to_string().as_str()));
        }
    }

    #[test]
    fn test_teardown_fails_in_flight_and_waiting() {
        let mut queue = CommandQueue::new(None);
        let now = Instant::now();
        let (_, mut a) = submit(&mut queue, "a", now);
        let (_, mut b) = submit(&mut queue, "b", now);
        let (_, mut c) = submit(&mut queue, "c", now);

        queue.teardown();

        for rx in [&mut a, &mut b, &mut c] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(QueryError::ConnectionClosed)
            ));
        }
        assert!(queue.is_idle());
    }

    #[test]
    fn test_timeout_discards_late_status() {
        let timeout = Duration::from_secs(5);
        let mut queue = CommandQueue::new(Some(timeout));
        let start = Instant::now();
        let (_, mut slow) = submit(&mut queue, "slow", start);
        let (_, mut next) = submit(&mut queue, "next", start + Duration::from_secs(4));

        assert_eq!(queue.next_deadline(), Some(start + timeout));
        assert_eq!(queue.expire(start + timeout), 1);
        assert!(matches!(
            slow.try_recv().unwrap(),
            Err(QueryError::Timeout { ref command, .. }) if command == "slow"
        ));

        // The abandoned command still owns the wire; its late reply must not reach `next`
        assert_eq!(queue.in_flight(), Some("slow"));
        queue.on_rows(vec![row("late", "1")]).unwrap();
        let write = queue
            .on_status(StatusLine::ok(), start + Duration::from_secs(6))
            .unwrap();
        assert_eq!(write.unwrap().name(), "next");
        assert!(next.try_recv().is_err());

        queue
            .on_status(StatusLine::ok(), start + Duration::from_secs(7))
            .unwrap();
        let response = next.try_recv().unwrap().unwrap();
        assert!(response.rows.is_empty());
    }

    #[test]
    fn test_status_after_deadline_skips_expired_waiting_command() {
        let mut queue = CommandQueue::new(Some(Duration::from_secs(1)));
        let start = Instant::now();
        let (_, mut first) = submit(&mut queue, "first", start);
        let (_, mut second) = submit(&mut queue, "second", start);
        let (_, mut third) = submit(&mut queue, "third", start + Duration::from_millis(1500));

        // The status line is handled before the deadline timer had a chance to fire
        let write = queue
            .on_status(StatusLine::ok(), start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(write.unwrap().name(), "third");
        assert_eq!(queue.in_flight(), Some("third"));

        assert!(first.try_recv().unwrap().is_ok());
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(QueryError::Timeout { ref command, .. }) if command == "second"
        ));
        assert!(matches!(third.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_status_after_deadline_with_only_expired_waiting() {
        let mut queue = CommandQueue::new(Some(Duration::from_secs(1)));
        let start = Instant::now();
        let (_, _first) = submit(&mut queue, "first", start);
        let (_, mut second) = submit(&mut queue, "second", start);

        let write = queue
            .on_status(StatusLine::ok(), start + Duration::from_secs(2))
            .unwrap();
        assert!(write.is_none());
        assert!(queue.is_idle());
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(QueryError::Timeout { .. })
        ));
    }

    #[test]
    fn test_waiting_commands_expire_without_being_written() {
        let mut queue = CommandQueue::new(Some(Duration::from_secs(1)));
        let start = Instant::now();
        let (_, _first) = submit(&mut queue, "first", start);
        let (_, mut second) = submit(&mut queue, "second", start);

        assert_eq!(queue.expire(start + Duration::from_secs(2)), 2);
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(QueryError::Timeout { .. })
        ));
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.next_deadline(), None);

        let write = queue
            .on_status(StatusLine::ok(), start + Duration::from_secs(3))
            .unwrap();
        assert!(write.is_none());
    }
}
