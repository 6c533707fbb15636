//! 索引文件解析与加载。
//!
//! 格式：纯文本，每行一个分片名；`#` 之后为注释；去掉注释后的空行跳过。

use std::io::{BufRead, BufReader};
use std::sync::Arc;

use tracing::debug;

use super::error::{RetrievalError, RetrievalResult};
use super::models::{HostCandidate, PartName, ReadRequest};
use super::stream::{StreamSettings, TicketStream};
use super::transport::Transport;

/// 解析一行；返回 None 表示该行应跳过。
pub fn parse_line(line: &str) -> Option<PartName> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(PartName::new(line))
    }
}

pub fn parse_index(text: &str) -> Vec<PartName> {
    text.lines().filter_map(parse_line).collect()
}

/// 从主机上读取索引文件并解析出分片名列表。
pub fn load_index(
    transport: &Arc<dyn Transport>,
    host: &HostCandidate,
    path: &str,
    settings: &StreamSettings,
) -> RetrievalResult<Vec<PartName>> {
    let mut stream = TicketStream::open(transport, host, ReadRequest::new(path), settings)?;
    let mut names = Vec::new();
    let read_result = {
        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    if let Some(name) = parse_line(&line) {
                        debug!(target: "selector", "For index {} -> {}", path, name);
                        names.push(name);
                    }
                }
                Err(e) => break Err(RetrievalError::from_io(e)),
            }
        }
    };
    // Close even after a read error so the ticket reports the remote cause.
    let close_result = stream.close();
    read_result
        .and(close_result)
        .map_err(|e| {
            RetrievalError::transient(format!(
                "Loading index file ({} entries): {}",
                names.len(),
                e
            ))
        })?;
    Ok(names)
}
