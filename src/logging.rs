//! Tracing setup.
//!
//! Stdout carries the MCP protocol, so logs go to stderr, or to a file when
//! one is given. `RUST_LOG` overrides the configured level.

use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Rotated log files kept next to the active one.
const KEEP_ROTATED_LOGS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// With `log_file`:
/// 1. Rotates existing logs (`x.log` → `x.log.1` → .2 → .3, keeps last 3).
/// 2. Opens a fresh file with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the file path for discoverability.
///
/// `json` switches the output to one JSON object per event.
pub fn init_tracing(level: &str, log_file: Option<&Path>, json: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;

    let writer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, KEEP_ROTATED_LOGS);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(FlushingWriter::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ctxrelay={level},warn")));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    // A subscriber may already be installed (e.g. by an embedding host).
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_file.map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== ctxrelay starting ==="
    );
    Ok(())
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so log
/// lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
