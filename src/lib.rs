//! 气象文件分发平台中 data mover 节点的取数核心。
//!
//! 给定逻辑文件描述与有序的候选主机列表：选出可用主机，判定单文件还是多分片索引，
//! 并把多分片源按顺序聚合为一个字节流。任意一侧失败都会传播到读取方，
//! 不会死锁，也不会泄漏已打开的资源。
//!
//! 代码结构：
//! - `base_system`：配置/日志等基础设施
//! - `retrieval`：取数流程（主机选择、分片打开、预读、聚合）

pub mod base_system;
pub mod retrieval;
