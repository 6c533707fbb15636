//! 本地文件系统传输模块。
//!
//! 配置了根目录时，路径解析为 `<root>/<host>/<path>`；否则直接使用 `path`。

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, warn};

use super::Transport;
use crate::retrieval::error::{RetrievalError, RetrievalResult};
use crate::retrieval::index::parse_index;
use crate::retrieval::models::{HostCandidate, ReadRequest};
use crate::retrieval::pipe::PipeWriter;
use crate::retrieval::ticket::RetrievalTicket;

#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    root: Option<PathBuf>,
}

impl LocalTransport {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, host: &HostCandidate, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root
                .join(host.host.trim_matches('/'))
                .join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

fn io_failure(action: &str, path: &Path, err: io::Error) -> RetrievalError {
    RetrievalError::transient(format!("{action} {}: {err}", path.display()))
}

fn copy_file(path: &Path, offset: u64, sink: &mut PipeWriter) -> io::Result<u64> {
    let mut file = File::open(path)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    io::copy(&mut file, sink)
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn probe_size(&self, host: &HostCandidate, path: &str) -> RetrievalResult<Option<u64>> {
        let full = self.resolve(host, path);
        let meta = fs::metadata(&full).map_err(|e| io_failure("size of", &full, e))?;
        Ok(Some(meta.len()))
    }

    fn open_read(
        &self,
        host: &HostCandidate,
        request: &ReadRequest,
        mut sink: PipeWriter,
        ticket: RetrievalTicket,
    ) -> RetrievalResult<()> {
        let full = self.resolve(host, &request.path);
        // Fail synchronously when the file is not there at all.
        fs::metadata(&full).map_err(|e| io_failure("open", &full, e))?;

        let parts: Vec<PathBuf> = if request.expand_index {
            let text = fs::read_to_string(&full).map_err(|e| io_failure("read index", &full, e))?;
            parse_index(&text)
                .iter()
                .map(|name| self.resolve(host, name.as_str()))
                .collect()
        } else {
            vec![full]
        };
        let offset = request.offset;
        let remote = host.host.clone();

        thread::Builder::new()
            .name("local-read".to_string())
            .spawn(move || {
                ticket.set_remote_host(remote);
                ticket.established();
                let mut skip = offset;
                let mut total = 0u64;
                for path in &parts {
                    // Offset applies to the concatenated output.
                    let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                    let start = skip.min(len);
                    skip -= start;
                    match copy_file(path, start, &mut sink) {
                        Ok(n) => total += n,
                        Err(e) => {
                            warn!(target: "transport", "local read of {} failed: {}", path.display(), e);
                            ticket.fail(format!("{}: {}", path.display(), e));
                            return;
                        }
                    }
                }
                let _ = sink.flush();
                drop(sink);
                debug!(target: "transport", "local read completed ({} bytes)", total);
                ticket.complete();
            })
            .map_err(|e| RetrievalError::transient(format!("spawn local reader: {e}")))?;
        Ok(())
    }

    fn delete(&self, host: &HostCandidate, path: &str) -> RetrievalResult<()> {
        let full = self.resolve(host, path);
        fs::remove_file(&full).map_err(|e| io_failure("delete", &full, e))
    }
}
