//! 多分片（索引）源的聚合读取流。
//!
//! 两个工作线程通过容量为 Q 的有界队列协作：
//! - `ConnectionPool`：按顺序打开各分片（可选预读缓存包装），阻塞地放入队列；
//! - `TransferManager`：按顺序取出分片，完整复制到聚合管道后关闭，再处理下一个。
//!
//! 两个线程只共享队列与两个标志（closed / failure）；失败“先到者为准”。
//! 任意一方失败时，另一方会被唤醒退出，队列中尚未读取的分片全部关闭。

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use tracing::{debug, info, warn};

use super::cache::ReadAheadCache;
use super::error::{RetrievalError, RetrievalResult};
use super::models::{HostCandidate, MultiPartOptions, PartName};
use super::opener::PartOpener;
use super::pipe::{self, PipeHandle, PipeReader, PipeWriter};
use super::stream::{StreamSettings, TicketStream};
use super::transport::Transport;

/// 队列中的一个已打开分片。
#[derive(Debug)]
enum QueuedPart {
    Direct(TicketStream),
    Cached(ReadAheadCache),
}

impl QueuedPart {
    fn source(&self) -> &str {
        match self {
            QueuedPart::Direct(s) => s.source(),
            QueuedPart::Cached(c) => c.source(),
        }
    }

    fn close(&mut self) -> RetrievalResult<()> {
        match self {
            QueuedPart::Direct(s) => s.close(),
            QueuedPart::Cached(c) => c.close(),
        }
    }
}

impl Read for QueuedPart {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            QueuedPart::Direct(s) => s.read(buf),
            QueuedPart::Cached(c) => c.read(buf),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    failure: Mutex<Option<RetrievalError>>,
    closed: AtomicBool,
    opened: AtomicUsize,
    drained: AtomicUsize,
    max_queued: AtomicUsize,
}

impl Shared {
    fn failure(&self) -> Option<RetrievalError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// 记录失败；已有失败时忽略并返回 false。
    fn record_failure(&self, err: RetrievalError) -> bool {
        match self.failure.lock() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(err);
                true
            }
            _ => false,
        }
    }

    fn should_stop(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.failure().is_some()
    }
}

/// 工作线程运行期间的计数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiPartStats {
    pub opened: usize,
    pub drained: usize,
    pub max_queued: usize,
}

pub struct MultiPartStream {
    host: HostCandidate,
    total: usize,
    reader: PipeReader,
    pipe: PipeHandle,
    shared: Arc<Shared>,
    skip: u64,
    done_rx: channel::Receiver<()>,
    close_result: Option<RetrievalResult<()>>,
}

impl MultiPartStream {
    /// 创建聚合流并立即启动两个工作线程。
    pub fn start(
        transport: Arc<dyn Transport>,
        host: HostCandidate,
        parts: Vec<PartName>,
        offset: u64,
        delete_after: bool,
        options: &MultiPartOptions,
        settings: StreamSettings,
    ) -> RetrievalResult<Self> {
        let total = parts.len();
        let queue_size = options.queue_size.max(1);
        let (tx, rx) = channel::bounded::<QueuedPart>(queue_size);
        let (writer, reader) = pipe::pipe(settings.pipe_buffer_size);
        let pipe = reader.handle();
        let shared = Arc::new(Shared::default());
        let (done_tx, done_rx) = channel::bounded::<()>(2);

        let opener = PartOpener::new(
            Arc::clone(&transport),
            host.clone(),
            settings.clone(),
            options.retry_count,
            options.retry_frequency(),
        );

        let pool = ConnectionPool {
            opener,
            parts: parts.clone(),
            tx,
            shared: Arc::clone(&shared),
            use_cache: options.use_cache,
            cache_size: options.cache_size.max(1),
            close_timeout: settings.ticket_timeout,
            nick: host.display_name().to_string(),
        };
        let manager = TransferManager {
            rx,
            writer,
            pipe: pipe.clone(),
            shared: Arc::clone(&shared),
            transport,
            host: host.clone(),
            parts,
            delete_after,
            nick: host.display_name().to_string(),
        };

        let pool_done = done_tx.clone();
        thread::Builder::new()
            .name("connection-pool".to_string())
            .spawn(move || {
                pool.run();
                let _ = pool_done.send(());
            })
            .map_err(|e| RetrievalError::fatal(format!("spawn connection pool: {e}")))?;

        let manager_spawn = thread::Builder::new()
            .name("transfer-manager".to_string())
            .spawn(move || {
                manager.run();
                let _ = done_tx.send(());
            });
        if let Err(e) = manager_spawn {
            // The pool must not keep opening parts nobody will read.
            let err = RetrievalError::fatal(format!("spawn transfer manager: {e}"));
            shared.record_failure(err.clone());
            shared.closed.store(true, Ordering::SeqCst);
            pipe.close_both();
            return Err(err);
        }

        Ok(Self {
            host,
            total,
            reader,
            pipe,
            shared,
            skip: offset,
            done_rx,
            close_result: None,
        })
    }

    pub fn host(&self) -> &HostCandidate {
        &self.host
    }

    pub fn total_parts(&self) -> usize {
        self.total
    }

    pub fn stats(&self) -> MultiPartStats {
        MultiPartStats {
            opened: self.shared.opened.load(Ordering::SeqCst),
            drained: self.shared.drained.load(Ordering::SeqCst),
            max_queued: self.shared.max_queued.load(Ordering::SeqCst),
        }
    }

    /// 等待两个工作线程结束，超时返回 false。
    pub fn wait_workers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for _ in 0..2 {
            let left = deadline.saturating_duration_since(Instant::now());
            if self.done_rx.recv_timeout(left).is_err() {
                return false;
            }
        }
        true
    }

    fn check(&self) -> RetrievalResult<()> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }
        if self.close_result.is_some() || self.shared.closed.load(Ordering::SeqCst) {
            return Err(RetrievalError::stream_closed());
        }
        Ok(())
    }

    fn map_read(&self, result: io::Result<usize>, requested: usize) -> io::Result<usize> {
        match result {
            Ok(0) if requested > 0 => match self.shared.failure() {
                Some(err) => Err(err.into()),
                None => Ok(0),
            },
            Ok(n) => Ok(n),
            Err(e) => Err(self.shared.failure().map(io::Error::from).unwrap_or(e)),
        }
    }

    fn skip_offset(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while self.skip > 0 {
            let want = usize::try_from(self.skip).map_or(scratch.len(), |s| s.min(scratch.len()));
            let result = self.reader.read(&mut scratch[..want]);
            let n = self.map_read(result, want)?;
            if n == 0 {
                break;
            }
            self.skip -= n as u64;
        }
        Ok(())
    }

    /// 可无阻塞读取的字节数；尚未跳过的起始偏移不计入。
    pub fn available(&self) -> RetrievalResult<usize> {
        self.check()?;
        let buffered = self.reader.available().map_err(RetrievalError::from_io)?;
        let skip = usize::try_from(self.skip).unwrap_or(usize::MAX);
        Ok(buffered.saturating_sub(skip))
    }

    /// 幂等关闭；记录过失败时，每次调用都返回同一个错误。
    pub fn close(&mut self) -> RetrievalResult<()> {
        if let Some(result) = &self.close_result {
            debug!(target: "transfer", "Already closed");
            return result.clone();
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        let result = match self.shared.failure() {
            Some(err) => {
                self.pipe.close_both();
                Err(err)
            }
            None => {
                self.pipe.close_writer();
                self.pipe.close_reader();
                Ok(())
            }
        };
        self.close_result = Some(result.clone());
        result
    }
}

impl Read for MultiPartStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        if self.skip > 0 {
            self.skip_offset()?;
        }
        let result = self.reader.read(buf);
        self.map_read(result, buf.len())
    }
}

impl Drop for MultiPartStream {
    fn drop(&mut self) {
        if self.close_result.is_none() {
            let _ = self.close();
        }
    }
}

/// 生产者：按顺序打开分片并放入队列。
struct ConnectionPool {
    opener: PartOpener,
    parts: Vec<PartName>,
    tx: channel::Sender<QueuedPart>,
    shared: Arc<Shared>,
    use_cache: bool,
    cache_size: usize,
    close_timeout: Duration,
    nick: String,
}

impl ConnectionPool {
    fn run(self) {
        let total = self.parts.len();
        let mut queued = 0usize;
        match self.open_all(&mut queued) {
            Ok(true) => info!(target: "pool", "{} input stream(s) created using {}", queued, self.nick),
            Ok(false) => warn!(
                target: "pool",
                "Only {}/{} input stream(s) created using {}",
                queued,
                total,
                self.nick
            ),
            Err(e) => {
                warn!(target: "pool", "Could not create all input streams using {}: {}", self.nick, e);
                if !self.shared.record_failure(e) {
                    debug!(target: "pool", "Exception ignored (use original exception)");
                }
                warn!(
                    target: "pool",
                    "Only {}/{} input stream(s) created using {}",
                    queued,
                    total,
                    self.nick
                );
            }
        }
        // Dropping the sender wakes a TransferManager blocked on the queue.
    }

    /// 返回 Ok(false) 表示因关闭或对方失败而提前结束。
    fn open_all(&self, queued: &mut usize) -> RetrievalResult<bool> {
        for (i, part) in self.parts.iter().enumerate() {
            let index = i + 1;
            if let Some(err) = self.shared.failure() {
                warn!(target: "pool", "TransferManager failed: {}", err);
                return Ok(false);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                warn!(target: "pool", "ConnectionPool ends (stream is closed)");
                return Ok(false);
            }
            let start = Instant::now();
            let Some(stream) = self.opener.open_unless(part, || self.shared.should_stop())? else {
                return Ok(false);
            };
            self.shared.opened.fetch_add(1, Ordering::SeqCst);
            let item = if self.use_cache {
                QueuedPart::Cached(ReadAheadCache::new(
                    stream,
                    self.cache_size,
                    self.close_timeout,
                )?)
            } else {
                QueuedPart::Direct(stream)
            };
            info!(
                target: "pool",
                "Add {}stream for file {} {} on {} to the queue (wait: {:?})",
                if self.use_cache { "cached " } else { "" },
                index,
                part,
                self.nick,
                start.elapsed()
            );
            let start = Instant::now();
            if let Err(channel::SendError(mut item)) = self.tx.send(item) {
                // The manager is gone: nobody will ever close this part.
                let _ = item.close();
                return Ok(false);
            }
            *queued += 1;
            let len = self.tx.len();
            self.shared.max_queued.fetch_max(len, Ordering::SeqCst);
            debug!(target: "pool", "Queued (wait: {:?}, size: {})", start.elapsed(), len);
        }
        Ok(true)
    }
}

/// 消费者：按顺序取出分片并复制到聚合管道。
struct TransferManager {
    rx: channel::Receiver<QueuedPart>,
    writer: PipeWriter,
    pipe: PipeHandle,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    host: HostCandidate,
    parts: Vec<PartName>,
    delete_after: bool,
    nick: String,
}

impl TransferManager {
    fn run(mut self) {
        let total = self.parts.len();
        let mut count = 0usize;
        let mut length = 0u64;
        let outcome = self.drain_all(&mut count, &mut length);

        if let Ok(true) = outcome {
            info!(
                target: "transfer",
                "{} file(s) retrieved from {} ({} bytes)",
                total,
                self.nick,
                length
            );
            if self.delete_after {
                self.delete_parts();
            }
            return;
        }

        if let Err(e) = outcome {
            warn!(target: "transfer", "Could not read all files using {}: {}", self.nick, e);
            if !self.shared.record_failure(e) {
                debug!(target: "transfer", "Exception ignored (use original exception)");
            }
        }
        warn!(
            target: "transfer",
            "Only {}/{} file(s) retrieved from {} ({} bytes)",
            count,
            total,
            self.nick,
            length
        );
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            // Force the reader of the aggregated stream to fail instead of waiting.
            self.pipe.close_both();
        } else {
            debug!(target: "transfer", "Already closed");
        }
        let mut closed = 0usize;
        while let Ok(mut part) = self.rx.try_recv() {
            let _ = part.close();
            closed += 1;
        }
        debug!(target: "transfer", "Closed {} stream(s)", closed);
    }

    /// 返回 Ok(false) 表示因关闭或对方失败而提前结束。
    fn drain_all(&mut self, count: &mut usize, length: &mut u64) -> RetrievalResult<bool> {
        let start = Instant::now();
        for index in 1..=self.parts.len() {
            if let Some(err) = self.shared.failure() {
                debug!(target: "transfer", "ConnectionPool failed: {}", err);
                return Ok(false);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                warn!(target: "transfer", "TransferManager ends (stream is closed)");
                return Ok(false);
            }
            let take = Instant::now();
            let Ok(mut part) = self.rx.recv() else {
                // ConnectionPool exited early.
                return Ok(false);
            };
            info!(
                target: "transfer",
                "Retrieve file {} {} from {} (wait: {:?})",
                index,
                part.source(),
                self.nick,
                take.elapsed()
            );
            let copied = io::copy(&mut part, &mut self.writer).map_err(RetrievalError::from_io);
            match copied.and_then(|n| part.close().map(|_| n)) {
                Ok(n) => {
                    *length += n;
                    *count += 1;
                    self.shared.drained.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    // Quiet close keeps the original cause.
                    let _ = part.close();
                    return Err(e);
                }
            }
            info!(
                target: "transfer",
                "File {} {} retrieved from {} in {:?}",
                index,
                part.source(),
                self.nick,
                start.elapsed()
            );
        }
        self.writer.close();
        Ok(true)
    }

    fn delete_parts(&self) {
        for part in &self.parts {
            if let Err(e) = self.transport.delete(&self.host, part.as_str()) {
                warn!(target: "transfer", "Could not delete file {} from {}: {}", part, self.nick, e);
            }
        }
    }
}
