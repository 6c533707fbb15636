//! 候选主机选择：按顺序尝试每个候选主机，直到某个主机能提供该文件。
//!
//! 单文件按远端大小判定是否接受；索引文件先读取分片列表，再交给
//! [`MultiPartStream`] 聚合。所有候选都失败时返回 `SourceNotAvailable`，
//! 其中带有每个主机的失败原因。

use std::io::{self, Read};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::{ErrorKind, FailureRecord, RetrievalError, RetrievalResult};
use super::index::load_index;
use super::models::{
    ECAUTH_HOST, ECAUTH_USER, HostCandidate, MultiPartOptions, ReadRequest, SourceDescriptor,
};
use super::multipart::MultiPartStream;
use super::stream::{StreamSettings, TicketStream};
use super::transport::{Transport, TransportRegistry};
use crate::base_system::context::Config;

/// 远端大小与声明大小的匹配方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMatch {
    Exact,
    /// 远端大小为 0 且声明大小未知。
    Fifo,
    /// 声明大小未知，远端给出了大小。
    Link,
    /// 最后一个候选且为采集主机，不论大小都接受。
    LastResort,
}

pub fn match_size(
    declared: Option<u64>,
    remote: Option<u64>,
    last_acquisition: bool,
) -> Option<SizeMatch> {
    match (declared, remote) {
        (None, Some(0)) => Some(SizeMatch::Fifo),
        (None, Some(_)) => Some(SizeMatch::Link),
        (Some(d), Some(r)) if d == r => Some(SizeMatch::Exact),
        _ if last_acquisition => Some(SizeMatch::LastResort),
        _ => None,
    }
}

enum Body {
    Single(TicketStream),
    Multi(MultiPartStream),
}

/// 选中主机后返回给调用方的字节流。
pub struct RetrievalStream {
    host: HostCandidate,
    body: Body,
    close_result: Option<RetrievalResult<()>>,
}

impl RetrievalStream {
    pub fn host(&self) -> &HostCandidate {
        &self.host
    }

    pub fn is_multi_part(&self) -> bool {
        matches!(self.body, Body::Multi(_))
    }

    pub fn multi_part(&self) -> Option<&MultiPartStream> {
        match &self.body {
            Body::Multi(m) => Some(m),
            Body::Single(_) => None,
        }
    }

    /// 传输模块报告的远端主机名（仅单文件）。
    pub fn remote_host_name(&self) -> Option<String> {
        match &self.body {
            Body::Single(s) => s.remote_host_name(),
            Body::Multi(_) => None,
        }
    }

    pub fn available(&self) -> RetrievalResult<usize> {
        if self.close_result.is_some() {
            return Err(RetrievalError::stream_closed());
        }
        match &self.body {
            Body::Single(s) => s.available(),
            Body::Multi(m) => m.available(),
        }
    }

    pub fn close(&mut self) -> RetrievalResult<()> {
        if let Some(result) = &self.close_result {
            return result.clone();
        }
        let result = match &mut self.body {
            Body::Single(s) => s.close(),
            Body::Multi(m) => m.close(),
        };
        self.close_result = Some(result.clone());
        result
    }
}

impl Read for RetrievalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.close_result.is_some() {
            return Err(RetrievalError::stream_closed().into());
        }
        match &mut self.body {
            Body::Single(s) => s.read(buf),
            Body::Multi(m) => m.read(buf),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSelector {
    registry: TransportRegistry,
    settings: StreamSettings,
    multipart: MultiPartOptions,
}

impl SourceSelector {
    pub fn new(registry: TransportRegistry, cfg: &Config) -> Self {
        Self::with_options(
            registry,
            StreamSettings::from_config(cfg),
            MultiPartOptions::from_config(cfg),
        )
    }

    pub fn with_options(
        registry: TransportRegistry,
        settings: StreamSettings,
        multipart: MultiPartOptions,
    ) -> Self {
        Self {
            registry,
            settings,
            multipart,
        }
    }

    pub fn open(
        &self,
        descriptor: &SourceDescriptor,
        candidates: &[HostCandidate],
    ) -> RetrievalResult<(RetrievalStream, HostCandidate)> {
        self.open_at(descriptor, candidates, 0)
    }

    /// 从 `offset` 处开始读取。
    pub fn open_at(
        &self,
        descriptor: &SourceDescriptor,
        candidates: &[HostCandidate],
        offset: u64,
    ) -> RetrievalResult<(RetrievalStream, HostCandidate)> {
        let mut hosts: Vec<String> = Vec::new();
        let mut failures: Vec<FailureRecord> = Vec::new();
        let last = candidates.len().saturating_sub(1);

        for (i, candidate) in candidates.iter().enumerate() {
            if is_generic(candidate, descriptor) {
                debug!(
                    target: "selector",
                    "Discarding generic source host {} (file was pushed through the data portal)",
                    candidate.display_name()
                );
                continue;
            }
            debug!(target: "selector", "Trying getting source from {}", candidate.display_name());
            let host = substitute(candidate, descriptor);
            let label = host.label();
            hosts.push(label.clone());

            match self.try_host(descriptor, host, i == last, offset) {
                Ok(found) => return Ok(found),
                Err(e) if e.kind() == ErrorKind::SourceNotAvailable => return Err(e),
                Err(e) => {
                    warn!(
                        target: "selector",
                        "File {} not retrieved from {}: {}",
                        descriptor.source,
                        candidate.display_name(),
                        e
                    );
                    failures.push(FailureRecord {
                        host: label,
                        cause: e.to_string(),
                    });
                }
            }
        }

        let mut message = if hosts.is_empty() {
            "Not retrieved (hosts list empty)".to_string()
        } else {
            format!("Not retrieved using {}", hosts.join(", "))
        };
        if let Some(auth_host) = descriptor.ecauth_host.as_deref().filter(|h| !h.is_empty()) {
            message.push_str(&format!(" with source {auth_host}"));
        }
        if let Some(last_failure) = failures.last() {
            message.push_str(&format!(": {}", last_failure.cause));
        }
        Err(RetrievalError::SourceNotAvailable {
            message,
            hosts,
            failures,
        })
    }

    fn try_host(
        &self,
        descriptor: &SourceDescriptor,
        mut host: HostCandidate,
        is_last: bool,
        offset: u64,
    ) -> RetrievalResult<(RetrievalStream, HostCandidate)> {
        let transport = self.registry.get(&host.module)?;
        let backup = host.is_backup();
        let path = if !backup && (host.use_source_path || host.is_acquisition()) {
            descriptor.source.clone()
        } else {
            descriptor.mover_path.clone()
        };

        if descriptor.index > 0 && !backup && host.use_source_path {
            if host.options.use_mget {
                let mut request = ReadRequest::new(path.as_str()).at(offset);
                request.expand_index = true;
                let stream = TicketStream::open(&transport, &host, request, &self.settings)?;
                info!(
                    target: "selector",
                    "Files in {} will be retrieved from {} (index managed by transfer module {})",
                    path,
                    host.display_name(),
                    host.module
                );
                return Ok(self.single(stream, host));
            }
            return self.open_index(descriptor, &transport, host, &path, offset);
        }

        let remote = transport.probe_size(&host, &path)?;
        let Some(matched) = match_size(descriptor.size, remote, is_last && host.is_acquisition())
        else {
            let size = remote.map_or_else(|| "unknown".to_string(), |s| s.to_string());
            return Err(RetrievalError::transient(format!(
                "Incorrect size ({} bytes) on {}",
                size,
                host.label()
            )));
        };
        if matched == SizeMatch::Fifo {
            debug!(
                target: "selector",
                "Fifo detected on the remote host (removing {}.hostList)",
                host.module
            );
            host.options.host_list = None;
        }
        let stream = TicketStream::open(
            &transport,
            &host,
            ReadRequest::new(path.as_str()).at(offset),
            &self.settings,
        )?;
        info!(
            target: "selector",
            "File {} will be retrieved from {} ({:?})",
            path,
            host.display_name(),
            matched
        );
        Ok(self.single(stream, host))
    }

    fn open_index(
        &self,
        descriptor: &SourceDescriptor,
        transport: &Arc<dyn Transport>,
        host: HostCandidate,
        path: &str,
        offset: u64,
    ) -> RetrievalResult<(RetrievalStream, HostCandidate)> {
        let names = load_index(transport, &host, path, &self.settings)?;
        if names.len() != descriptor.index {
            return Err(RetrievalError::transient(format!(
                "Wrong number of files in index ({}!={})",
                names.len(),
                descriptor.index
            )));
        }
        info!(target: "selector", "Index file {} contains {} name(s)", path, names.len());
        let options = host
            .options
            .multipart
            .clone()
            .unwrap_or_else(|| self.multipart.clone());
        let stream = MultiPartStream::start(
            Arc::clone(transport),
            host.clone(),
            names,
            offset,
            descriptor.delete_original,
            &options,
            self.settings.clone(),
        )?;
        info!(
            target: "selector",
            "Files in {} will be retrieved from {}",
            path,
            host.display_name()
        );
        Ok((
            RetrievalStream {
                host: host.clone(),
                body: Body::Multi(stream),
                close_result: None,
            },
            host,
        ))
    }

    fn single(&self, stream: TicketStream, host: HostCandidate) -> (RetrievalStream, HostCandidate) {
        (
            RetrievalStream {
                host: host.clone(),
                body: Body::Single(stream),
                close_result: None,
            },
            host,
        )
    }
}

/// 含占位符但描述中缺少替换值的候选主机。
fn is_generic(candidate: &HostCandidate, descriptor: &SourceDescriptor) -> bool {
    !descriptor.has_ecauth()
        && (candidate.login.contains(ECAUTH_USER) || candidate.host.contains(ECAUTH_HOST))
}

fn substitute(candidate: &HostCandidate, descriptor: &SourceDescriptor) -> HostCandidate {
    let mut host = candidate.clone();
    if let Some(user) = descriptor.ecauth_user.as_deref()
        && !host.login.is_empty()
    {
        host.login = host.login.replace(ECAUTH_USER, user);
        debug!(target: "selector", "Using login: {}", host.login);
    }
    if let Some(name) = descriptor.ecauth_host.as_deref()
        && !host.host.is_empty()
    {
        host.host = host.host.replace(ECAUTH_HOST, name);
        debug!(target: "selector", "Using host: {}", host.host);
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::models::HostRole;

    #[test]
    fn size_rules() {
        assert_eq!(match_size(Some(10), Some(10), false), Some(SizeMatch::Exact));
        assert_eq!(match_size(Some(10), Some(5), false), None);
        assert_eq!(match_size(None, Some(0), false), Some(SizeMatch::Fifo));
        assert_eq!(match_size(None, Some(42), false), Some(SizeMatch::Link));
        assert_eq!(match_size(None, None, false), None);
        assert_eq!(match_size(Some(10), Some(5), true), Some(SizeMatch::LastResort));
        assert_eq!(match_size(Some(10), None, true), Some(SizeMatch::LastResort));
    }

    #[test]
    fn generic_hosts_need_ecauth_values() {
        let generic = HostCandidate::new("portal", ECAUTH_HOST, "local").with_login(ECAUTH_USER);
        let plain = SourceDescriptor::new(1, "/data/f", Some(1));
        assert!(is_generic(&generic, &plain));

        let pushed = plain.clone().with_ecauth("alice", "node7");
        assert!(!is_generic(&generic, &pushed));
        let host = substitute(&generic, &pushed);
        assert_eq!(host.login, "alice");
        assert_eq!(host.host, "node7");
        assert_eq!(host.role, HostRole::Source);
    }
}
