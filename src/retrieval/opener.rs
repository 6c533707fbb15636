//! 分片打开：带有限次数重试与固定间隔退避。

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::error::{RetrievalError, RetrievalResult};
use super::models::{HostCandidate, PartName, ReadRequest};
use super::stream::{StreamSettings, TicketStream};
use super::transport::Transport;

#[derive(Clone)]
pub struct PartOpener {
    transport: Arc<dyn Transport>,
    host: HostCandidate,
    settings: StreamSettings,
    retry_count: u32,
    retry_frequency: Duration,
}

impl PartOpener {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: HostCandidate,
        settings: StreamSettings,
        retry_count: u32,
        retry_frequency: Duration,
    ) -> Self {
        Self {
            transport,
            host,
            settings,
            retry_count,
            retry_frequency,
        }
    }

    pub fn host(&self) -> &HostCandidate {
        &self.host
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// 打开分片；初次尝试加 `retry_count` 次重试都失败后返回最后一次的原因。
    pub fn open(&self, part: &PartName) -> RetrievalResult<TicketStream> {
        self.open_unless(part, || false)?
            .ok_or_else(|| RetrievalError::fatal("part opening stopped"))
    }

    /// 同 [`open`](Self::open)，但每次尝试前检查 `stop`；返回 `Ok(None)` 表示被叫停。
    pub fn open_unless<F>(&self, part: &PartName, stop: F) -> RetrievalResult<Option<TicketStream>>
    where
        F: Fn() -> bool,
    {
        let mut retry = 0u32;
        loop {
            if stop() {
                return Ok(None);
            }
            info!(
                target: "pool",
                "Create stream for file {} on {}",
                part,
                self.host.display_name()
            );
            let request = ReadRequest::new(part.as_str());
            match TicketStream::open(&self.transport, &self.host, request, &self.settings) {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) => {
                    if retry >= self.retry_count {
                        warn!(target: "pool", "Every retry failed for {}", part);
                        return Err(RetrievalError::ExhaustedRetries {
                            part: part.to_string(),
                            attempts: retry + 1,
                            last: e.to_string(),
                        });
                    }
                    retry += 1;
                    warn!(
                        target: "pool",
                        "Retry {}/{} for {} in {:?}: {}",
                        retry,
                        self.retry_count,
                        part,
                        self.retry_frequency,
                        e
                    );
                    thread::sleep(self.retry_frequency);
                }
            }
        }
    }
}
