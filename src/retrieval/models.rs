//! 取数相关的数据模型定义。
//!
//! 包含源文件描述、候选主机、分片名、多分片参数等核心数据结构。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::base_system::context::Config;

/// 登录名中的用户占位符，由描述中的 `ecauth_user` 替换。
pub const ECAUTH_USER: &str = "$dataFile[ecauthUser]";
/// 主机名中的主机占位符，由描述中的 `ecauth_host` 替换。
pub const ECAUTH_HOST: &str = "$dataFile[ecauthHost]";

/// 一次取数请求对应的逻辑文件。整个取数过程中不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: u64,
    /// 声明的大小；`None` 表示未知（符号链接/FIFO）。
    #[serde(default)]
    pub size: Option<u64>,
    /// 源主机上的原始路径。
    pub source: String,
    /// 备份主机（其他 mover）上的路径。
    #[serde(default)]
    pub mover_path: String,
    /// >0 表示源文件是列出 N 个分片名的索引文件。
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub ecauth_user: Option<String>,
    #[serde(default)]
    pub ecauth_host: Option<String>,
    /// 多分片全部读取成功后删除源分片。
    #[serde(default)]
    pub delete_original: bool,
}

impl SourceDescriptor {
    pub fn new(id: u64, source: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            id,
            size,
            source: source.into(),
            mover_path: String::new(),
            index: 0,
            ecauth_user: None,
            ecauth_host: None,
            delete_original: false,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_mover_path(mut self, path: impl Into<String>) -> Self {
        self.mover_path = path.into();
        self
    }

    pub fn with_ecauth(mut self, user: impl Into<String>, host: impl Into<String>) -> Self {
        self.ecauth_user = Some(user.into());
        self.ecauth_host = Some(host.into());
        self
    }

    pub fn with_delete_original(mut self, delete: bool) -> Self {
        self.delete_original = delete;
        self
    }

    pub fn has_ecauth(&self) -> bool {
        self.ecauth_user.is_some() && self.ecauth_host.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    /// 源主机（数据来源方）。
    #[default]
    Source,
    /// 副本所在的 mover。
    Backup,
    /// 从数据产生地直接采集。
    Acquisition,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostOptions {
    /// 传输模块的主机列表选项（会话亲和）。
    #[serde(default)]
    pub host_list: Option<String>,
    /// 由传输模块自己展开索引文件。
    #[serde(default)]
    pub use_mget: bool,
    /// 覆盖全局配置的多分片参数。
    #[serde(default)]
    pub multipart: Option<MultiPartOptions>,
}

/// 上游主机选择策略给出的一个候选主机。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCandidate {
    pub name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub login: String,
    pub host: String,
    #[serde(default)]
    pub role: HostRole,
    #[serde(default = "default_true")]
    pub use_source_path: bool,
    /// 传输模块名（如 `local`、`http`）。
    pub module: String,
    #[serde(default)]
    pub options: HostOptions,
}

impl HostCandidate {
    pub fn new(name: impl Into<String>, host: impl Into<String>, module: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            nickname: name.clone(),
            name,
            login: String::new(),
            host: host.into(),
            role: HostRole::Source,
            use_source_path: true,
            module: module.into(),
            options: HostOptions::default(),
        }
    }

    pub fn with_role(mut self, role: HostRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_login(mut self, login: impl Into<String>) -> Self {
        self.login = login.into();
        self
    }

    pub fn with_use_source_path(mut self, use_source_path: bool) -> Self {
        self.use_source_path = use_source_path;
        self
    }

    pub fn with_options(mut self, options: HostOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_backup(&self) -> bool {
        self.role == HostRole::Backup
    }

    pub fn is_acquisition(&self) -> bool {
        self.role == HostRole::Acquisition
    }

    /// 日志与诊断用的显示名。
    pub fn label(&self) -> String {
        if self.nickname.is_empty() || self.nickname == self.name {
            format!("Host={}", self.name)
        } else {
            format!("Host={} ({})", self.name, self.nickname)
        }
    }

    pub fn display_name(&self) -> &str {
        if self.nickname.is_empty() {
            &self.name
        } else {
            &self.nickname
        }
    }
}

/// 索引文件中的一个分片名。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartName(String);

impl PartName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 多分片取数参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPartOptions {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_frequency_ms")]
    pub retry_frequency_ms: u64,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for MultiPartOptions {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_frequency_ms: default_retry_frequency_ms(),
            use_cache: false,
            cache_size: default_cache_size(),
            queue_size: default_queue_size(),
        }
    }
}

impl MultiPartOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            retry_count: cfg.retry_count,
            retry_frequency_ms: cfg.retry_frequency_ms,
            use_cache: cfg.use_cache,
            cache_size: cfg.cache_size,
            queue_size: cfg.queue_size,
        }
    }

    pub fn retry_frequency(&self) -> Duration {
        Duration::from_millis(self.retry_frequency_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_frequency_ms() -> u64 {
    1000
}

fn default_cache_size() -> usize {
    10 * crate::retrieval::pipe::DEFAULT_PIPE_SIZE
}

fn default_queue_size() -> usize {
    3
}

/// 一次远端读取请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub path: String,
    pub offset: u64,
    /// 路径是索引文件，由传输模块展开并依次输出各分片。
    pub expand_index: bool,
}

impl ReadRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            expand_index: false,
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}
