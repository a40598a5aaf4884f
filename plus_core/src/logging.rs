//! Logging: console output plus optional rotating debug and error files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, Result};
use crate::settings::{LogFormat, Settings};

/// Size at which a log file is rolled over.
pub const MAX_LOG_BYTES: u64 = 100_000;
/// Number of rolled-over files kept next to the live one.
pub const LOG_BACKUP_COUNT: usize = 10;

/// Install the global subscriber described by `settings`.
///
/// Returns `false` when a global subscriber was already installed; the
/// existing one is kept.
pub fn configure_logging(settings: &Settings) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let console = match settings.log_format {
        LogFormat::Json => fmt::layer().json().with_filter(filter).boxed(),
        LogFormat::Pretty => fmt::layer().with_filter(filter).boxed(),
    };

    let debug_file = settings
        .debug_log
        .as_deref()
        .map(|path| RotatingFileWriter::open(path, MAX_LOG_BYTES, LOG_BACKUP_COUNT))
        .transpose()?
        .map(|writer| file_layer(writer, LevelFilter::DEBUG));

    let error_file = settings
        .error_log
        .as_deref()
        .map(|path| RotatingFileWriter::open(path, MAX_LOG_BYTES, LOG_BACKUP_COUNT))
        .transpose()?
        .map(|writer| file_layer(writer, LevelFilter::ERROR));

    Ok(tracing_subscriber::registry()
        .with(console)
        .with(debug_file)
        .with(error_file)
        .try_init()
        .is_ok())
}

/// Plain-text lines with timestamp, level, message and source location.
fn file_layer<S>(writer: RotatingFileWriter, level: LevelFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_filter(level)
}

/// A log file that rolls over to `file.1`, `file.2`, ... once it would grow
/// past `max_bytes`. The oldest backup beyond `backups` is dropped.
#[derive(Clone, Debug)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

#[derive(Debug)]
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    size: u64,
}

impl RotatingFileWriter {
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = open_append(path).map_err(|e| Error::io(path, e))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile {
                path: path.to_path_buf(),
                max_bytes,
                backups,
                file,
                size,
            })),
        })
    }

    /// Path of the `index`-th backup, `file.<index>`.
    pub fn backup_path(path: &Path, index: usize) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFile {
    fn should_roll(&self, incoming: usize) -> bool {
        self.max_bytes > 0
            && self.backups > 0
            && self.size > 0
            && self.size + incoming as u64 >= self.max_bytes
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let oldest = RotatingFileWriter::backup_path(&self.path, self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.backups).rev() {
            let src = RotatingFileWriter::backup_path(&self.path, index);
            if src.exists() {
                fs::rename(&src, RotatingFileWriter::backup_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, RotatingFileWriter::backup_path(&self.path, 1))?;

        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        if inner.should_roll(buf.len()) {
            inner.roll()?;
        }
        let written = inner.file.write(buf)?;
        inner.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .file
            .flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
