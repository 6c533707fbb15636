//! 单次赋值的完成凭据（ticket）。
//!
//! 传输模块在自己的线程里回调 `established` / `complete` / `fail`，
//! 读数据的一方通过 `await_established` / `await_close` 把异步回调
//! 转换为同步的流语义。终态只能写入一次，先到者为准。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use tracing::{debug, warn};

use super::error::{RetrievalError, RetrievalResult};
use super::latch::Latch;

static NEXT_TICKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketState {
    Pending,
    Established,
    Completed,
    Failed(String),
}

impl TicketState {
    fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Completed | TicketState::Failed(_))
    }
}

#[derive(Debug)]
struct TicketInner {
    id: u64,
    state: Mutex<TicketState>,
    remote_host: Mutex<Option<String>>,
    /// 状态离开 Pending 时触发。
    established: Latch,
    /// 进入终态时触发。
    done: Latch,
}

/// 可在线程间共享的完成凭据；克隆得到的是同一个 ticket。
#[derive(Debug, Clone)]
pub struct RetrievalTicket {
    inner: Arc<TicketInner>,
}

impl Default for RetrievalTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrievalTicket {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TicketInner {
                id: NEXT_TICKET_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(TicketState::Pending),
                remote_host: Mutex::new(None),
                established: Latch::new(),
                done: Latch::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        // A poisoned ticket still holds a valid state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TicketState {
        self.lock().clone()
    }

    /// 远端读通道已建立。
    pub fn established(&self) {
        let mut state = self.lock();
        if *state == TicketState::Pending {
            *state = TicketState::Established;
            drop(state);
            self.inner.established.fire();
        }
    }

    pub fn complete(&self) {
        let mut state = self.lock();
        if state.is_terminal() {
            debug!(target: "ticket", id = self.id(), "Already completed");
            return;
        }
        *state = TicketState::Completed;
        drop(state);
        debug!(target: "ticket", id = self.id(), "Ticket completed");
        self.inner.done.fire();
    }

    pub fn fail(&self, message: impl Into<String>) {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "no-message".to_string();
        }
        let mut state = self.lock();
        if state.is_terminal() {
            debug!(target: "ticket", id = self.id(), "Error ignored: {} (ticket already completed)", message);
            return;
        }
        *state = TicketState::Failed(message);
        drop(state);
        self.inner.done.fire();
    }

    pub fn is_completed(&self) -> bool {
        self.lock().is_terminal()
    }

    pub fn error(&self) -> Option<String> {
        match &*self.lock() {
            TicketState::Failed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    pub fn set_remote_host(&self, name: impl Into<String>) {
        if let Ok(mut host) = self.inner.remote_host.lock() {
            *host = Some(name.into());
        }
    }

    pub fn remote_host(&self) -> Option<String> {
        self.inner.remote_host.lock().ok().and_then(|h| h.clone())
    }

    /// 等待通道建立（或直接完成）。失败或超时都视为打开失败。
    pub fn await_established(&self, timeout: Duration) -> RetrievalResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                TicketState::Established | TicketState::Completed => return Ok(()),
                TicketState::Failed(msg) => return Err(RetrievalError::transient(msg)),
                TicketState::Pending => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RetrievalError::transient(format!(
                    "channel not established within {:?}",
                    timeout
                )));
            }
            // Failure skips Established, so the done latch wakes us too.
            select! {
                recv(self.inner.established.receiver()) -> _ => {}
                recv(self.inner.done.receiver()) -> _ => {}
                default(remaining) => {}
            }
        }
    }

    /// 等待传输完成（最多 `timeout`），然后若记录了错误则返回错误。
    ///
    /// 超时本身不算失败：只有传输模块显式报告的错误会被抛出。
    pub fn await_close(&self, timeout: Duration) -> RetrievalResult<()> {
        let start = Instant::now();
        if !self.inner.done.wait_timeout(timeout) {
            warn!(target: "ticket", id = self.id(), "Ticket not completed within {:?}", timeout);
        }
        debug!(target: "ticket", id = self.id(), "Duration on check: {:?}", start.elapsed());
        match &*self.lock() {
            TicketState::Failed(msg) => Err(RetrievalError::transient(msg.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_terminal_state_wins() {
        let ticket = RetrievalTicket::new();
        ticket.fail("boom");
        ticket.complete();
        ticket.fail("second");
        assert_eq!(ticket.error().as_deref(), Some("boom"));

        let ok = RetrievalTicket::new();
        ok.complete();
        ok.fail("late");
        assert!(ok.error().is_none());
        assert!(ok.await_close(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn empty_failure_message_is_replaced() {
        let ticket = RetrievalTicket::new();
        ticket.fail("  ");
        assert_eq!(ticket.error().as_deref(), Some("no-message"));
    }

    #[test]
    fn await_close_wakes_on_completion_from_other_thread() {
        let ticket = RetrievalTicket::new();
        let remote = ticket.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.fail("remote failure");
        });
        let err = ticket.await_close(Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("remote failure"));
        handle.join().unwrap();
    }

    #[test]
    fn await_close_timeout_without_error_is_ok() {
        let ticket = RetrievalTicket::new();
        let start = Instant::now();
        assert!(ticket.await_close(Duration::from_millis(30)).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!ticket.is_completed());
    }

    #[test]
    fn await_established_times_out_and_reports_failure() {
        let ticket = RetrievalTicket::new();
        assert!(ticket.await_established(Duration::from_millis(10)).is_err());
        ticket.established();
        assert!(ticket.await_established(Duration::from_millis(10)).is_ok());
        assert_eq!(ticket.state(), TicketState::Established);

        let failed = RetrievalTicket::new();
        failed.fail("refused");
        let err = failed.await_established(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn await_established_wakes_on_failure_from_other_thread() {
        let ticket = RetrievalTicket::new();
        let remote = ticket.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.fail("connection refused");
        });
        let start = Instant::now();
        let err = ticket.await_established(Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
