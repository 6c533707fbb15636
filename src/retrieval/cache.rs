//! 分片预读缓存。
//!
//! 包装一个已打开的分片流，由内部复制线程尽快把数据搬进固定大小的管道，
//! 消费方从管道另一端读取，从而不必等待慢速的远端 I/O。

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, warn};

use super::error::{RetrievalError, RetrievalResult};
use super::pipe::{self, PipeHandle, PipeReader};
use super::stream::TicketStream;

#[derive(Debug, Default)]
struct CacheShared {
    error: Mutex<Option<RetrievalError>>,
    closed: AtomicBool,
}

impl CacheShared {
    fn error(&self) -> Option<RetrievalError> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    fn record(&self, err: RetrievalError) {
        if let Ok(mut slot) = self.error.lock()
            && slot.is_none()
        {
            *slot = Some(err);
        }
    }
}

#[derive(Debug)]
pub struct ReadAheadCache {
    source: String,
    reader: PipeReader,
    inner_pipe: PipeHandle,
    shared: Arc<CacheShared>,
    done_rx: channel::Receiver<()>,
    close_timeout: Duration,
    close_result: Option<RetrievalResult<()>>,
}

impl ReadAheadCache {
    /// 启动复制线程。`close_timeout` 限制 close 时等待复制线程收尾的时间。
    pub fn new(
        mut inner: TicketStream,
        cache_size: usize,
        close_timeout: Duration,
    ) -> RetrievalResult<Self> {
        let source = inner.source().to_string();
        let inner_pipe = inner.pipe_handle();
        let (mut writer, reader) = pipe::pipe(cache_size);
        let shared = Arc::new(CacheShared::default());
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let worker_shared = Arc::clone(&shared);
        let worker_source = source.clone();
        thread::Builder::new()
            .name("read-ahead".to_string())
            .spawn(move || {
                match io::copy(&mut inner, &mut writer) {
                    Ok(n) => {
                        // Record the close error before the reader can see EOF.
                        if let Err(e) = inner.close() {
                            worker_shared.record(e);
                        } else {
                            debug!(target: "cache", "Cached {} bytes of {}", n, worker_source);
                        }
                        writer.close();
                    }
                    Err(e) => {
                        // A close from the consumer side is not a failure of the part.
                        if !worker_shared.closed.load(Ordering::SeqCst) {
                            warn!(target: "cache", "Read-ahead of {} failed: {}", worker_source, e);
                            worker_shared.record(RetrievalError::from_io(e));
                        }
                        writer.close();
                        let _ = inner.close();
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| RetrievalError::transient(format!("spawn read-ahead worker: {e}")))?;

        Ok(Self {
            source,
            reader,
            inner_pipe,
            shared,
            done_rx,
            close_timeout,
            close_result: None,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn check(&self) -> RetrievalResult<()> {
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RetrievalError::stream_closed());
        }
        Ok(())
    }

    pub fn available(&self) -> RetrievalResult<usize> {
        self.check()?;
        self.reader.available().map_err(RetrievalError::from_io)
    }

    /// 幂等：重复调用返回与第一次相同的结果。
    pub fn close(&mut self) -> RetrievalResult<()> {
        if let Some(result) = &self.close_result {
            debug!(target: "cache", "Already closed");
            return result.clone();
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader.close();
        self.inner_pipe.close_reader();
        if self.done_rx.recv_timeout(self.close_timeout).is_err() {
            warn!(target: "cache", "Read-ahead worker for {} did not finish in time", self.source);
        }
        let result = match self.shared.error() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        self.close_result = Some(result.clone());
        result
    }
}

impl Read for ReadAheadCache {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let n = self.reader.read(buf)?;
        if n == 0 && !buf.is_empty() {
            // EOF after a failed copy must not look like a clean end.
            self.check()?;
        }
        Ok(n)
    }
}

impl Drop for ReadAheadCache {
    fn drop(&mut self) {
        if self.close_result.is_none() {
            let _ = self.close();
        }
    }
}
