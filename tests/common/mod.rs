#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mover_retrieval::retrieval::index::parse_index;
use mover_retrieval::retrieval::pipe::PipeWriter;
use mover_retrieval::retrieval::{
    HostCandidate, MultiPartOptions, PartName, ReadRequest, RetrievalError, RetrievalResult,
    RetrievalTicket, StreamSettings, Transport,
};

pub const MODULE: &str = "mock";

/// 脚本化的内存传输模块。文件按 `主机:路径` 存放。
pub struct MockTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    probes: Mutex<HashMap<String, Option<u64>>>,
    open_failures: Mutex<HashMap<String, u32>>,
    fail_mid: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    chunk: usize,
    opens: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<(String, ReadRequest)>>,
    deleted: Mutex<Vec<String>>,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

pub fn key(host: &str, path: &str) -> String {
    format!("{host}:{path}")
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            open_failures: Mutex::new(HashMap::new()),
            fail_mid: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            chunk: 64,
            opens: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn put(&self, host: &str, path: &str, data: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(key(host, path), data.into());
    }

    /// 覆盖 probe_size 的返回值。
    pub fn probe_as(&self, host: &str, path: &str, size: Option<u64>) {
        self.probes.lock().unwrap().insert(key(host, path), size);
    }

    /// 接下来 `times` 次打开失败；`u32::MAX` 表示一直失败。
    pub fn fail_opens(&self, host: &str, path: &str, times: u32) {
        self.open_failures.lock().unwrap().insert(key(host, path), times);
    }

    /// 写出一半数据后报告失败。
    pub fn fail_mid_transfer(&self, host: &str, path: &str) {
        self.fail_mid.lock().unwrap().insert(key(host, path));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn opens(&self, host: &str, path: &str) -> u32 {
        self.opens
            .lock()
            .unwrap()
            .get(&key(host, path))
            .copied()
            .unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<(String, ReadRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// 等待所有写线程退出；写线程只有在数据写完或读端关闭后才会退出。
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.started.load(Ordering::SeqCst) == self.finished.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn body_for(&self, host: &str, request: &ReadRequest) -> Option<Vec<u8>> {
        let files = self.files.lock().unwrap();
        let data = files.get(&key(host, &request.path))?;
        if !request.expand_index {
            return Some(data.clone());
        }
        let text = String::from_utf8_lossy(data);
        let mut out = Vec::new();
        for name in parse_index(&text) {
            out.extend_from_slice(files.get(&key(host, name.as_str()))?);
        }
        Some(out)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        MODULE
    }

    fn probe_size(&self, host: &HostCandidate, path: &str) -> RetrievalResult<Option<u64>> {
        let k = key(&host.host, path);
        if let Some(size) = self.probes.lock().unwrap().get(&k) {
            return Ok(*size);
        }
        match self.files.lock().unwrap().get(&k) {
            Some(data) => Ok(Some(data.len() as u64)),
            None => Err(RetrievalError::transient(format!("No such file {k}"))),
        }
    }

    fn open_read(
        &self,
        host: &HostCandidate,
        request: &ReadRequest,
        sink: PipeWriter,
        ticket: RetrievalTicket,
    ) -> RetrievalResult<()> {
        let k = key(&host.host, &request.path);
        *self.opens.lock().unwrap().entry(k.clone()).or_default() += 1;
        self.requests
            .lock()
            .unwrap()
            .push((host.host.clone(), request.clone()));

        {
            let mut failures = self.open_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&k)
                && *left > 0
            {
                if *left != u32::MAX {
                    *left -= 1;
                }
                ticket.fail(format!("connection refused for {k}"));
                return Ok(());
            }
        }

        let Some(data) = self.body_for(&host.host, request) else {
            return Err(RetrievalError::transient(format!("No such file {k}")));
        };
        let fail_mid = self.fail_mid.lock().unwrap().contains(&k);
        let latency = *self.latency.lock().unwrap();
        let chunk = self.chunk;
        let offset = (request.offset as usize).min(data.len());
        let remote = format!("remote-{}", host.host);
        let finished = Arc::clone(&self.finished);
        self.started.fetch_add(1, Ordering::SeqCst);

        thread::spawn(move || {
            let mut sink = sink;
            ticket.set_remote_host(remote);
            ticket.established();
            thread::sleep(latency);
            let body = &data[offset..];
            let half = body.len() / 2;
            let mut written = 0usize;
            let mut result: Result<(), String> = Ok(());
            for piece in body.chunks(chunk) {
                if fail_mid && written >= half {
                    result = Err("remote reset".to_string());
                    break;
                }
                if let Err(e) = sink.write_all(piece) {
                    result = Err(e.to_string());
                    break;
                }
                written += piece.len();
            }
            if fail_mid && result.is_ok() {
                result = Err("remote reset".to_string());
            }
            match result {
                Ok(()) => {
                    drop(sink);
                    ticket.complete();
                }
                Err(msg) => {
                    ticket.fail(msg);
                    drop(sink);
                }
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn delete(&self, host: &HostCandidate, path: &str) -> RetrievalResult<()> {
        self.deleted.lock().unwrap().push(key(&host.host, path));
        Ok(())
    }
}

/// 测试用的小管道与短超时。
pub fn settings() -> StreamSettings {
    StreamSettings {
        pipe_buffer_size: 16,
        open_timeout: Duration::from_secs(2),
        ticket_timeout: Duration::from_secs(2),
    }
}

pub fn options(queue_size: usize, use_cache: bool) -> MultiPartOptions {
    MultiPartOptions {
        retry_count: 0,
        retry_frequency_ms: 10,
        use_cache,
        cache_size: 32,
        queue_size,
    }
}

pub fn host(name: &str) -> HostCandidate {
    HostCandidate::new(name, name, MODULE)
}

/// 第 i 个分片的内容，各分片字节模式互不相同。
pub fn part_bytes(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| ((i * 31 + j * 7) % 251) as u8).collect()
}

/// 在 `host` 上放好 `sizes.len()` 个分片，返回分片名与拼接后的期望内容。
pub fn seed_parts(mock: &MockTransport, host: &str, sizes: &[usize]) -> (Vec<PartName>, Vec<u8>) {
    let mut names = Vec::new();
    let mut expected = Vec::new();
    for (i, len) in sizes.iter().enumerate() {
        let name = format!("/data/part.{}", i + 1);
        let data = part_bytes(i, *len);
        expected.extend_from_slice(&data);
        mock.put(host, &name, data);
        names.push(PartName::new(name));
    }
    (names, expected)
}

pub fn as_transport(mock: &Arc<MockTransport>) -> Arc<dyn Transport> {
    mock.clone()
}
