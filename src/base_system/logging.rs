//! 取数进程的日志：控制台 + 日志目录双输出。
//!
//! 日志目录下只有一个活动文件 `retrieval.log`（始终 DEBUG 级别），
//! 进程结束（正常退出、Ctrl-C、panic）时把它封存为 `retrieval-<时间>.zip`，
//! 并只保留最近的若干个封存包。启动时活动文件过大也会先封存。

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const ACTIVE_LOG: &str = "retrieval.log";
const ARCHIVE_PREFIX: &str = "retrieval-";
const SEAL_AT_BYTES: u64 = 10 * 1024 * 1024;
const FLUSH_GRACE: Duration = Duration::from_millis(200);

/// 这些 target 来自取数流程本身，控制台上单独控制级别。
const PIPELINE_TARGETS: [&str; 5] = ["pool", "transfer", "ticket", "transport", "cache"];

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("cannot install log subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[error("log directory: {0}")]
    Io(#[from] io::Error),
    #[error("log archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive timestamp: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    /// 控制台输出取数流程的 DEBUG 日志。
    pub verbose: bool,
    pub color: bool,
    /// false 时控制台不输出，只写日志文件。
    pub console: bool,
    pub seal_on_exit: bool,
    /// 保留的封存包数量，0 表示不清理。
    pub keep_archives: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            color: true,
            console: true,
            seal_on_exit: true,
            keep_archives: 10,
        }
    }
}

/// 日志目录布局。
#[derive(Debug, Clone)]
pub struct LogDir {
    root: PathBuf,
}

impl LogDir {
    pub fn under(base_dir: Option<&Path>) -> Self {
        let root = match base_dir {
            Some(base) => base.join("logs"),
            None => PathBuf::from("logs"),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active(&self) -> PathBuf {
        self.root.join(ACTIVE_LOG)
    }

    /// 已有的封存包，按文件名（即时间）升序。
    pub fn archives(&self) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_archive = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
                n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".zip")
            });
            if is_archive {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// 把活动日志打包；空文件直接删除。返回新封存包路径。
    pub fn seal(&self) -> Result<Option<PathBuf>, LogError> {
        let active = self.active();
        let len = match fs::metadata(&active) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len == 0 {
            fs::remove_file(&active)?;
            return Ok(None);
        }

        let stamp = OffsetDateTime::now_utc().format(format_description!(
            "[year][month][day]-[hour][minute][second]"
        ))?;
        let mut target = self.root.join(format!("{ARCHIVE_PREFIX}{stamp}.zip"));
        let mut n = 1;
        while target.exists() {
            target = self.root.join(format!("{ARCHIVE_PREFIX}{stamp}.{n}.zip"));
            n += 1;
        }

        let mut zip = zip::ZipWriter::new(File::create(&target)?);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(ACTIVE_LOG, opts)?;
        io::copy(&mut File::open(&active)?, &mut zip)?;
        zip.finish()?;
        fs::remove_file(&active)?;

        info!("log sealed into {}", target.display());
        Ok(Some(target))
    }

    /// 删除最旧的封存包，只留下 `keep` 个。
    pub fn prune(&self, keep: usize) -> io::Result<usize> {
        if keep == 0 {
            return Ok(0);
        }
        let archives = self.archives()?;
        let excess = archives.len().saturating_sub(keep);
        for old in &archives[..excess] {
            fs::remove_file(old)?;
            debug!("removed old log archive {}", old.display());
        }
        Ok(excess)
    }
}

/// 已安装的日志系统；drop 时刷新并封存。
pub struct RetrievalLog {
    shutdown: Arc<Shutdown>,
}

impl RetrievalLog {
    pub fn init(options: LogOptions, base_dir: Option<&Path>) -> Result<Self, LogError> {
        let dir = LogDir::under(base_dir);
        fs::create_dir_all(dir.root())?;
        if fs::metadata(dir.active()).is_ok_and(|m| m.len() >= SEAL_AT_BYTES) {
            dir.seal()?;
        }

        let (file_writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("retrieval-log")
            .finish(rolling::never(dir.root(), ACTIVE_LOG));

        let console_writer = if options.console {
            BoxMakeWriter::new(io::stderr)
        } else {
            BoxMakeWriter::new(io::sink)
        };
        let pipeline_level = if options.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let console_filter = PIPELINE_TARGETS
            .iter()
            .fold(Targets::new().with_default(LevelFilter::INFO), |f, t| {
                f.with_target(*t, pipeline_level)
            })
            .with_target("reqwest", LevelFilter::WARN);

        let console_layer = fmt::layer()
            .with_ansi(options.color)
            .with_thread_names(true)
            .with_writer(console_writer)
            .with_filter(console_filter);
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(file_writer)
            .with_filter(LevelFilter::DEBUG);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()?;

        let shutdown = Arc::new(Shutdown {
            dir,
            guard: Mutex::new(Some(guard)),
            done: AtomicBool::new(false),
            seal: options.seal_on_exit,
            keep_archives: options.keep_archives,
        });
        shutdown.hook_ctrlc();
        shutdown.hook_panic();
        Ok(Self { shutdown })
    }

    pub fn dir(&self) -> &LogDir {
        &self.shutdown.dir
    }

    /// 刷新并封存日志；只生效一次。
    pub fn finish(&self) {
        self.shutdown.run();
    }
}

impl Drop for RetrievalLog {
    fn drop(&mut self) {
        self.shutdown.run();
    }
}

struct Shutdown {
    dir: LogDir,
    guard: Mutex<Option<WorkerGuard>>,
    done: AtomicBool,
    seal: bool,
    keep_archives: usize,
}

impl Shutdown {
    fn hook_ctrlc(self: &Arc<Self>) {
        let shutdown = Arc::clone(self);
        let installed = ctrlc::set_handler(move || {
            warn!("retrieval interrupted");
            shutdown.run();
            std::process::exit(130);
        });
        if let Err(e) = installed {
            warn!("Ctrl-C handler not installed: {e}");
        }
    }

    fn hook_panic(self: &Arc<Self>) {
        let shutdown = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let current = thread::current();
            error!("thread '{}' panicked: {info}", current.name().unwrap_or("<unnamed>"));
            shutdown.run();
            previous(info);
        }));
    }

    fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the guard flushes the background writer.
        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }
        if !self.seal {
            return;
        }
        thread::sleep(FLUSH_GRACE);
        if let Err(e) = self.dir.seal() {
            eprintln!("cannot seal retrieval log: {e}");
        }
        if let Err(e) = self.dir.prune(self.keep_archives) {
            eprintln!("cannot prune log archives: {e}");
        }
    }
}
