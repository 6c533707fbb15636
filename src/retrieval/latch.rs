//! 一次性触发的信号（latch）。
//!
//! 内部持有一个从不发送数据的 `crossbeam_channel` 发送端；`fire` 时丢弃它，
//! 所有阻塞在接收端上的线程都会因通道断开而被唤醒。可用于 `select!`。

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel as channel;

#[derive(Debug)]
pub(crate) struct Latch {
    tx: Mutex<Option<channel::Sender<()>>>,
    rx: channel::Receiver<()>,
    fired: AtomicBool,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            fired: AtomicBool::new(false),
        }
    }

    /// 触发信号；返回 true 表示本次调用是第一次触发。
    pub(crate) fn fire(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        let mut tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tx.take();
        first
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// 触发后立即就绪（返回 `Err(RecvError)`）的接收端。
    pub(crate) fn receiver(&self) -> &channel::Receiver<()> {
        &self.rx
    }

    /// 最多等待 `timeout`；返回是否已触发。
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_fired() {
            return true;
        }
        let _ = self.rx.recv_timeout(timeout);
        self.is_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fire_wakes_every_waiter_once() {
        let latch = Arc::new(Latch::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        assert!(latch.fire());
        assert!(!latch.fire());
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn unfired_latch_times_out() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        assert!(latch.receiver().try_recv().is_err());
        assert!(!latch.is_fired());
    }
}
