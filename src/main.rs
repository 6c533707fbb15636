//! mover-retrieval 命令行入口。
//!
//! 读取一个取数请求（YAML：文件描述 + 候选主机列表），按顺序尝试候选主机，
//! 把选中主机提供的字节流写入输出文件。
//!
//! 请求文件示例：
//!
//! ```yaml
//! descriptor:
//!   id: 42
//!   source: /data/in/fc.grib
//!   size: 1048576
//! candidates:
//!   - name: acq1
//!     host: node1
//!     module: local
//!     role: acquisition
//! ```

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{info, warn};

use mover_retrieval::base_system::config::load_or_create;
use mover_retrieval::base_system::context::Config;
use mover_retrieval::base_system::logging::{LogOptions, RetrievalLog};
use mover_retrieval::retrieval::{
    HostCandidate, RetrievalStream, SourceDescriptor, SourceSelector, TransportRegistry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "mover-retrieval")]
#[command(about = "Retrieve a file from the first candidate host able to serve it")]
struct Cli {
    /// 取数请求文件（YAML）
    #[arg(long)]
    request: Option<PathBuf>,

    /// 输出文件路径
    #[arg(long)]
    output: Option<PathBuf>,

    /// 从该字节偏移处开始读取
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 mover.yml 和 logs）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 配置文件路径（优先于 --data-dir）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 不显示进度条
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,
}

#[derive(Debug, Deserialize)]
struct RetrievalRequest {
    descriptor: SourceDescriptor,
    #[serde(default)]
    candidates: Vec<HostCandidate>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("mover-retrieval v{}", VERSION);
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref();
    let _log = init_logging(cli.debug, data_dir)?;

    let config = load_or_create::<Config>(cli.config.as_deref(), data_dir)
        .map_err(|e| anyhow!(e.to_string()))?;

    let (Some(request_path), Some(output)) = (cli.request.as_deref(), cli.output.as_deref())
    else {
        info!(target: "startup", "配置已就绪；需要 --request 与 --output 才会执行取数");
        return Ok(());
    };

    let request = read_request(request_path)?;
    let registry = TransportRegistry::from_config(&config)?;
    let selector = SourceSelector::new(registry, &config);

    info!(
        target: "startup",
        "Retrieving DataFile-{} ({}) from {} candidate host(s)",
        request.descriptor.id,
        request.descriptor.source,
        request.candidates.len()
    );

    let (mut stream, host) = selector.open_at(&request.descriptor, &request.candidates, cli.offset)?;
    info!(target: "startup", "Selected {}", host.label());
    if let Some(remote) = stream.remote_host_name() {
        info!(target: "startup", "Remote host name: {remote}");
    }

    let expected = request
        .descriptor
        .size
        .map(|s| s.saturating_sub(cli.offset));
    let copied = match copy_to_file(&mut stream, output, expected, cli.quiet) {
        Ok(n) => n,
        Err(e) => {
            if let Err(close_err) = stream.close() {
                warn!(target: "startup", "Close after failed copy: {close_err}");
            }
            return Err(e);
        }
    };
    stream.close()?;

    info!(
        target: "startup",
        "{} bytes written to {} from {}",
        copied,
        output.display(),
        host.display_name()
    );
    Ok(())
}

fn read_request(path: &Path) -> Result<RetrievalRequest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read request {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parse request {}", path.display()))
}

fn copy_to_file(
    stream: &mut RetrievalStream,
    output: &Path,
    expected: Option<u64>,
    quiet: bool,
) -> Result<u64> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let bar = progress_bar(expected, quiet);
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                bar.abandon();
                return Err(e).context("read retrieval stream");
            }
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
        bar.inc(n as u64);
    }
    writer.flush()?;
    bar.finish_and_clear();
    Ok(total)
}

fn progress_bar(expected: Option<u64>, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    match expected {
        Some(len) => {
            let bar = ProgressBar::new(len);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
            bar.set_style(style);
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(style);
            bar
        }
    }
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<RetrievalLog> {
    let opts = LogOptions {
        verbose: debug,
        ..LogOptions::default()
    };
    RetrievalLog::init(opts, base_dir).map_err(|e| anyhow!(e))
}
