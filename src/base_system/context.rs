//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `mover.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // 分片重试
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_frequency_ms")]
    pub retry_frequency_ms: u64,

    // 预读缓存与队列
    #[serde(default = "default_false")]
    pub use_cache: bool,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,

    // 超时配置
    #[serde(default = "default_ticket_timeout_secs")]
    pub ticket_timeout_secs: u64,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    // 传输模块
    #[serde(default)]
    pub local_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_frequency_ms: default_retry_frequency_ms(),
            use_cache: default_false(),
            cache_size: default_cache_size(),
            queue_size: default_queue_size(),
            pipe_buffer_size: default_pipe_buffer_size(),
            ticket_timeout_secs: default_ticket_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            local_root: String::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "mover.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 10] = [
            FieldMeta {
                name: "retry_count",
                description: "分片打开失败后的重试次数",
            },
            FieldMeta {
                name: "retry_frequency_ms",
                description: "两次重试之间的等待时间, 单位ms",
            },
            FieldMeta {
                name: "use_cache",
                description: "是否为每个分片启用预读缓存",
            },
            FieldMeta {
                name: "cache_size",
                description: "每个分片预读缓存大小（字节）",
            },
            FieldMeta {
                name: "queue_size",
                description: "已打开但尚未读取的分片数上限",
            },
            FieldMeta {
                name: "pipe_buffer_size",
                description: "远端读取管道缓冲区大小（字节）",
            },
            FieldMeta {
                name: "ticket_timeout_secs",
                description: "关闭流时等待传输完成的最长时间（秒）",
            },
            FieldMeta {
                name: "open_timeout_secs",
                description: "打开远端读取通道的最长等待时间（秒）",
            },
            FieldMeta {
                name: "http_timeout_secs",
                description: "http 传输模块请求超时时间（秒）",
            },
            FieldMeta {
                name: "local_root",
                description: "local 传输模块的根目录（留空表示使用绝对路径）",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::Validation("queue_size must be >= 1".into()));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::Validation("cache_size must be >= 1".into()));
        }
        if self.pipe_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "pipe_buffer_size must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn ticket_timeout(&self) -> Duration {
        Duration::from_secs(self.ticket_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn local_root_dir(&self) -> Option<PathBuf> {
        let root = self.local_root.trim();
        if root.is_empty() {
            None
        } else {
            Some(PathBuf::from(root))
        }
    }
}

fn default_false() -> bool {
    false
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_frequency_ms() -> u64 {
    1000
}

fn default_cache_size() -> usize {
    10 * 64 * 1024
}

fn default_queue_size() -> usize {
    3
}

fn default_pipe_buffer_size() -> usize {
    64 * 1024
}

fn default_ticket_timeout_secs() -> u64 {
    30
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    300
}
