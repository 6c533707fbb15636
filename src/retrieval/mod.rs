//! 多源取数流程模块入口。
//!
//! 子模块：
//! - `models`     — 数据模型（SourceDescriptor / HostCandidate / PartName 等）
//! - `error`      — 带分类标签的错误类型
//! - `ticket`     — 单次赋值的完成凭据，桥接异步传输回调
//! - `latch`      — 一次性触发信号（管道关闭、ticket 状态变更的唤醒）
//! - `pipe`       — 进程内有界字节管道
//! - `transport`  — 远端传输模块接口（local / http）
//! - `stream`     — 由 ticket 支撑的单文件读取流
//! - `opener`     — 带重试的分片打开
//! - `cache`      — 分片预读缓存
//! - `multipart`  — 多分片聚合流（ConnectionPool + TransferManager）
//! - `index`      — 索引文件解析
//! - `selector`   — 候选主机选择与源类型判定

pub mod cache;
pub mod error;
pub mod index;
pub(crate) mod latch;
pub mod models;
pub mod multipart;
pub mod opener;
pub mod pipe;
pub mod selector;
pub mod stream;
pub mod ticket;
pub mod transport;

pub use error::{ErrorKind, FailureRecord, RetrievalError, RetrievalResult};
pub use models::{
    HostCandidate, HostOptions, HostRole, MultiPartOptions, PartName, ReadRequest,
    SourceDescriptor,
};
pub use multipart::{MultiPartStats, MultiPartStream};
pub use selector::{RetrievalStream, SourceSelector};
pub use stream::StreamSettings;
pub use ticket::RetrievalTicket;
pub use transport::{Transport, TransportRegistry};
