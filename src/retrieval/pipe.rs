//! 进程内有界字节管道，基于 `crossbeam_channel` 的有界块队列。
//!
//! 写端把数据切成块放入队列，队列满时阻塞；读端从队列取块，队列空时阻塞。
//! 任意一端关闭都会唤醒另一端：读端关闭后写入返回 `BrokenPipe`，
//! 写端关闭后读端读完剩余数据再返回 EOF。

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{self as channel, TryRecvError, select};

use super::latch::Latch;

/// 管道缓冲区的默认大小（64KB）。
pub const DEFAULT_PIPE_SIZE: usize = 64 * 1024;

const MAX_CHUNK: usize = 8 * 1024;
/// 小容量管道按约 16 个队列槽位切块。
const TARGET_SLOTS: usize = 16;

#[derive(Debug)]
struct Shared {
    writer_closed: Latch,
    reader_closed: Latch,
    /// 已入队但尚未被读端取走的字节数。
    queued: AtomicUsize,
}

fn pipe_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Pipe closed")
}

/// 创建容量约为 `capacity` 字节的管道。
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let capacity = capacity.max(1);
    let chunk = capacity.div_ceil(TARGET_SLOTS).min(MAX_CHUNK);
    let slots = capacity.div_ceil(chunk);
    let (tx, rx) = channel::bounded::<Vec<u8>>(slots);
    let shared = Arc::new(Shared {
        writer_closed: Latch::new(),
        reader_closed: Latch::new(),
        queued: AtomicUsize::new(0),
    });
    (
        PipeWriter {
            tx,
            chunk,
            shared: Arc::clone(&shared),
        },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            shared,
        },
    )
}

/// 可跨线程关闭管道任意一端的句柄。
#[derive(Debug, Clone)]
pub struct PipeHandle {
    shared: Arc<Shared>,
}

impl PipeHandle {
    pub fn close_writer(&self) {
        self.shared.writer_closed.fire();
    }

    pub fn close_reader(&self) {
        self.shared.reader_closed.fire();
    }

    /// 先关读端：被唤醒的读者看到的是错误而不是 EOF。
    pub fn close_both(&self) {
        self.shared.reader_closed.fire();
        self.shared.writer_closed.fire();
    }

    pub fn is_reader_closed(&self) -> bool {
        self.shared.reader_closed.is_fired()
    }

    pub fn is_writer_closed(&self) -> bool {
        self.shared.writer_closed.is_fired()
    }
}

#[derive(Debug)]
pub struct PipeWriter {
    tx: channel::Sender<Vec<u8>>,
    chunk: usize,
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn close(&self) {
        self.shared.writer_closed.fire();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        if shared.reader_closed.is_fired() || shared.writer_closed.is_fired() {
            return Err(pipe_closed());
        }
        let n = data.len().min(self.chunk);
        // Counted before the send so the reader never subtracts first.
        shared.queued.fetch_add(n, Ordering::SeqCst);
        let sent = select! {
            send(self.tx, data[..n].to_vec()) -> res => res.is_ok(),
            recv(shared.reader_closed.receiver()) -> _ => false,
            recv(shared.writer_closed.receiver()) -> _ => false,
        };
        if sent {
            Ok(n)
        } else {
            shared.queued.fetch_sub(n, Ordering::SeqCst);
            Err(pipe_closed())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.writer_closed.fire();
    }
}

#[derive(Debug)]
pub struct PipeReader {
    rx: channel::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn available(&self) -> io::Result<usize> {
        if self.shared.reader_closed.is_fired() {
            return Err(pipe_closed());
        }
        Ok(self.pending.len() - self.pos + self.shared.queued.load(Ordering::SeqCst))
    }

    pub fn close(&self) {
        self.shared.reader_closed.fire();
    }

    fn take(&mut self, chunk: Vec<u8>) {
        self.shared.queued.fetch_sub(chunk.len(), Ordering::SeqCst);
        self.pending = chunk;
        self.pos = 0;
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.shared.reader_closed.is_fired() {
                return Err(pipe_closed());
            }
            if self.pos < self.pending.len() {
                let n = out.len().min(self.pending.len() - self.pos);
                out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            // Read the flag first: every chunk sent before the close is then visible.
            let writer_done = self.shared.writer_closed.is_fired();
            match self.rx.try_recv() {
                Ok(chunk) => {
                    self.take(chunk);
                    continue;
                }
                Err(TryRecvError::Disconnected) => return Ok(0),
                Err(TryRecvError::Empty) if writer_done => return Ok(0),
                Err(TryRecvError::Empty) => {}
            }
            let woke = select! {
                recv(self.rx) -> msg => Some(msg),
                recv(self.shared.writer_closed.receiver()) -> _ => None,
                recv(self.shared.reader_closed.receiver()) -> _ => None,
            };
            match woke {
                Some(Ok(chunk)) => self.take(chunk),
                Some(Err(_)) => return Ok(0),
                None => {}
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.reader_closed.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn writer_blocks_until_reader_drains() {
        let (mut writer, mut reader) = pipe(4);
        let handle = thread::spawn(move || {
            writer.write_all(b"0123456789").unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn closing_reader_unblocks_writer_with_error() {
        let (mut writer, reader) = pipe(2);
        let handle = reader.handle();
        let t = thread::spawn(move || writer.write_all(b"abcdef"));
        thread::sleep(Duration::from_millis(20));
        handle.close_reader();
        let err = t.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        drop(reader);
    }

    #[test]
    fn closed_reader_reports_error_not_eof() {
        let (writer, mut reader) = pipe(8);
        let handle = writer.handle();
        let t = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        handle.close_both();
        assert!(t.join().unwrap().is_err());
        drop(writer);
    }

    #[test]
    fn data_written_before_close_is_still_delivered() {
        let (mut writer, mut reader) = pipe(64);
        writer.write_all(b"tail").unwrap();
        writer.close();
        assert!(writer.write(b"late").is_err());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tail");
    }

    #[test]
    fn available_tracks_buffered_bytes() {
        let (mut writer, mut reader) = pipe(16);
        writer.write_all(b"abc").unwrap();
        assert_eq!(reader.available().unwrap(), 3);
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).unwrap();
        assert_eq!(reader.available().unwrap(), 2);
        reader.close();
        assert!(reader.available().is_err());
    }
}
