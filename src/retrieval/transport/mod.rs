//! 远端传输模块接口与注册表。
//!
//! 传输模块对取数流程是不透明的阻塞调用：探测大小、打开读取、删除。
//! 打开读取是异步的——模块在自己的线程中把数据写入 `PipeWriter`，
//! 并通过 [`RetrievalTicket`] 报告“通道已建立 / 完成 / 失败”。
//!
//! 子模块：
//! - `local` — 本地文件系统
//! - `http`  — HTTP（HEAD 探测大小、GET + Range 读取、DELETE 删除）

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{RetrievalError, RetrievalResult};
use super::models::{HostCandidate, ReadRequest};
use super::pipe::PipeWriter;
use super::ticket::RetrievalTicket;
use crate::base_system::context::Config;

pub mod http;
pub mod local;

pub use http::HttpTransport;
pub use local::LocalTransport;

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// 远端文件大小；`None` 表示远端无法给出大小。
    fn probe_size(&self, host: &HostCandidate, path: &str) -> RetrievalResult<Option<u64>>;

    /// 开始异步读取。
    ///
    /// 实现方接管 `sink`：数据写完后关闭（drop）它，并在 `ticket` 上调用
    /// `complete`；出错时调用 `fail` 并同样关闭 `sink`。通道建立后应调用
    /// `ticket.established()`。同步返回的错误表示请求根本没有发出。
    fn open_read(
        &self,
        host: &HostCandidate,
        request: &ReadRequest,
        sink: PipeWriter,
        ticket: RetrievalTicket,
    ) -> RetrievalResult<()>;

    fn delete(&self, host: &HostCandidate, path: &str) -> RetrievalResult<()>;
}

/// 按模块名查找传输模块。
#[derive(Clone, Default)]
pub struct TransportRegistry {
    modules: HashMap<String, Arc<dyn Transport>>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("TransportRegistry")
            .field("modules", &names)
            .finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置的 `local` 与 `http` 模块。
    pub fn from_config(cfg: &Config) -> RetrievalResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalTransport::new(cfg.local_root_dir())));
        registry.register(Arc::new(HttpTransport::new(cfg.http_timeout())?));
        Ok(registry)
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.modules.insert(transport.name().to_string(), transport);
    }

    pub fn get(&self, module: &str) -> RetrievalResult<Arc<dyn Transport>> {
        self.modules
            .get(module)
            .cloned()
            .ok_or_else(|| RetrievalError::transient(format!("unknown transfer module: {module}")))
    }
}
