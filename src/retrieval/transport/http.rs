//! HTTP 传输模块（reqwest blocking）。

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use tracing::{debug, warn};

use super::Transport;
use crate::retrieval::error::{RetrievalError, RetrievalResult};
use crate::retrieval::models::{HostCandidate, ReadRequest};
use crate::retrieval::pipe::PipeWriter;
use crate::retrieval::ticket::RetrievalTicket;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> RetrievalResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::fatal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

/// `host` 可以是 `name:port` 或完整的 `scheme://name:port` 前缀。
pub(crate) fn build_url(host: &HostCandidate, path: &str) -> String {
    let base = host.host.trim().trim_end_matches('/');
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    format!("{}/{}", base, path.trim_start_matches('/'))
}

fn request_failure(url: &str, err: reqwest::Error) -> RetrievalError {
    RetrievalError::transient(format!("{url}: {err}"))
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn probe_size(&self, host: &HostCandidate, path: &str) -> RetrievalResult<Option<u64>> {
        let url = build_url(host, path);
        let resp = self
            .client
            .head(&url)
            .send()
            .map_err(|e| request_failure(&url, e))?;
        if !resp.status().is_success() {
            return Err(RetrievalError::transient(format!(
                "HEAD {url} failed with status {}",
                resp.status()
            )));
        }
        Ok(resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok()))
    }

    fn open_read(
        &self,
        host: &HostCandidate,
        request: &ReadRequest,
        mut sink: PipeWriter,
        ticket: RetrievalTicket,
    ) -> RetrievalResult<()> {
        if request.expand_index {
            return Err(RetrievalError::transient(
                "index expansion is not supported by the http module",
            ));
        }
        let url = build_url(host, &request.path);
        let mut builder = self.client.get(&url);
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
        }
        let remote = host.host.clone();
        let offset = request.offset;

        thread::Builder::new()
            .name("http-read".to_string())
            .spawn(move || {
                let mut resp = match builder.send() {
                    Ok(r) => r,
                    Err(e) => {
                        ticket.fail(request_failure(&url, e).to_string());
                        return;
                    }
                };
                let status = resp.status();
                if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
                    ticket.fail(format!("GET {url} failed with status {status}"));
                    return;
                }
                ticket.set_remote_host(remote);
                ticket.established();
                // Server ignored the Range header.
                if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
                    let skipped = io::copy(&mut (&mut resp).take(offset), &mut io::sink());
                    if let Err(e) = skipped {
                        ticket.fail(format!("GET {url} interrupted: {e}"));
                        return;
                    }
                }
                match io::copy(&mut resp, &mut sink) {
                    Ok(n) => {
                        drop(sink);
                        debug!(target: "transport", "GET {} completed ({} bytes)", url, n);
                        ticket.complete();
                    }
                    Err(e) => {
                        warn!(target: "transport", "GET {} interrupted: {}", url, e);
                        ticket.fail(format!("GET {url} interrupted: {e}"));
                    }
                }
            })
            .map_err(|e| RetrievalError::transient(format!("spawn http reader: {e}")))?;
        Ok(())
    }

    fn delete(&self, host: &HostCandidate, path: &str) -> RetrievalResult<()> {
        let url = build_url(host, path);
        let resp = self
            .client
            .delete(&url)
            .send()
            .map_err(|e| request_failure(&url, e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RetrievalError::transient(format!(
                "DELETE {url} failed with status {}",
                resp.status()
            )))
        }
    }
}
