//! 由 ticket 支撑的单文件读取流。
//!
//! 打开时等待传输模块报告“通道已建立”，关闭时等待其报告“传输完成”，
//! 并把远端记录的错误作为关闭错误返回。

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::error::{RetrievalError, RetrievalResult};
use super::models::{HostCandidate, ReadRequest};
use super::pipe::{self, PipeHandle, PipeReader};
use super::ticket::RetrievalTicket;
use super::transport::Transport;
use crate::base_system::context::Config;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub pipe_buffer_size: usize,
    pub open_timeout: Duration,
    pub ticket_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl StreamSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pipe_buffer_size: cfg.pipe_buffer_size,
            open_timeout: cfg.open_timeout(),
            ticket_timeout: cfg.ticket_timeout(),
        }
    }
}

#[derive(Debug)]
pub struct TicketStream {
    reader: PipeReader,
    ticket: RetrievalTicket,
    host: String,
    source: String,
    close_timeout: Duration,
    closed: bool,
    /// 第一次 close 的结果；之后的 close 原样返回。
    close_result: Option<RetrievalResult<()>>,
}

impl TicketStream {
    pub fn open(
        transport: &Arc<dyn Transport>,
        host: &HostCandidate,
        request: ReadRequest,
        settings: &StreamSettings,
    ) -> RetrievalResult<Self> {
        let (writer, reader) = pipe::pipe(settings.pipe_buffer_size);
        let ticket = RetrievalTicket::new();
        // On error the writer has been dropped by the transport, and the reader is dropped here.
        transport.open_read(host, &request, writer, ticket.clone())?;
        if let Err(e) = ticket.await_established(settings.open_timeout) {
            reader.close();
            return Err(e);
        }
        debug!(
            target: "transport",
            ticket = ticket.id(),
            "Channel established for {} on {}",
            request.path,
            host.display_name()
        );
        Ok(Self {
            reader,
            ticket,
            host: host.label(),
            source: request.path,
            close_timeout: settings.ticket_timeout,
            closed: false,
            close_result: None,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 传输模块报告的远端主机名（若有）。
    pub fn remote_host_name(&self) -> Option<String> {
        self.ticket.remote_host()
    }

    pub fn available(&self) -> RetrievalResult<usize> {
        if self.closed {
            return Err(RetrievalError::stream_closed());
        }
        self.reader.available().map_err(RetrievalError::from_io)
    }

    /// 用于从其他线程强制关闭读端。
    pub(crate) fn pipe_handle(&self) -> PipeHandle {
        self.reader.handle()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) -> RetrievalResult<()> {
        if let Some(result) = &self.close_result {
            debug!(target: "transport", "Already closed");
            return result.clone();
        }
        self.closed = true;
        self.reader.close();
        let result = self.ticket.await_close(self.close_timeout).map_err(|e| {
            RetrievalError::transient(format!(
                "Could not get source from {} : {}",
                self.host, e
            ))
        });
        self.close_result = Some(result.clone());
        result
    }
}

impl Read for TicketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(RetrievalError::stream_closed().into());
        }
        let n = self.reader.read(buf)?;
        if n == 0
            && !buf.is_empty()
            && let Some(msg) = self.ticket.error()
        {
            return Err(RetrievalError::transient(format!(
                "Could not get source from {} : {}",
                self.host, msg
            ))
            .into());
        }
        Ok(n)
    }
}

impl Drop for TicketStream {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.reader.close();
        }
    }
}
