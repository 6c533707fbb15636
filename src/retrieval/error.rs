//! 取数流程的错误类型。
//!
//! 调用方按 [`ErrorKind`] 分支，而不是按具体类型判断；错误可克隆，
//! 以便后台线程记录的首个失败在之后每次 read/close 时原样抛出。

use std::fmt;
use std::io;

use thiserror::Error;

/// 失败的分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 单个主机或单次打开失败，可换主机/重试。
    Transient,
    /// 分片打开重试次数用尽。
    ExhaustedRetries,
    /// 所有候选主机都失败。
    SourceNotAvailable,
    /// 流已开始输出后的致命错误，或流已关闭。
    Fatal,
}

/// 某个候选主机失败的诊断记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub host: String,
    pub cause: String,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.cause)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("{0}")]
    Transient(String),
    #[error("every retry failed for {part} ({attempts} attempt(s)): {last}")]
    ExhaustedRetries {
        part: String,
        attempts: u32,
        last: String,
    },
    #[error("{message}")]
    SourceNotAvailable {
        message: String,
        hosts: Vec<String>,
        failures: Vec<FailureRecord>,
    },
    #[error("{0}")]
    Fatal(String),
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::Transient(_) => ErrorKind::Transient,
            RetrievalError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            RetrievalError::SourceNotAvailable { .. } => ErrorKind::SourceNotAvailable,
            RetrievalError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        RetrievalError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        RetrievalError::Fatal(msg.into())
    }

    pub fn stream_closed() -> Self {
        RetrievalError::Fatal("Stream closed".to_string())
    }

    /// 从 `io::Error` 中还原后台记录的错误；否则按瞬时错误包装。
    pub fn from_io(err: io::Error) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<RetrievalError>()) {
            return inner.clone();
        }
        RetrievalError::Transient(err.to_string())
    }

    /// 参与聚合的主机列表（仅 SourceNotAvailable 有）。
    pub fn attempted_hosts(&self) -> &[String] {
        match self {
            RetrievalError::SourceNotAvailable { hosts, .. } => hosts,
            _ => &[],
        }
    }
}

impl From<RetrievalError> for io::Error {
    fn from(err: RetrievalError) -> Self {
        io::Error::other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_round_trip_keeps_kind() {
        let err = RetrievalError::ExhaustedRetries {
            part: "p1".into(),
            attempts: 3,
            last: "refused".into(),
        };
        let io_err: io::Error = err.into();
        let back = RetrievalError::from_io(io_err);
        assert_eq!(back.kind(), ErrorKind::ExhaustedRetries);
        assert!(back.to_string().contains("refused"));
    }

    #[test]
    fn plain_io_error_is_transient() {
        let back = RetrievalError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(back.kind(), ErrorKind::Transient);
    }
}
