//! Tees messages into a size bounded log file.
//!
//! Every message is appended to the current file as `<unixNanos>:<origin>:<body>`.
//! Unmasked messages are then passed on.
//!
//! When the current file has grown to the size limit a new file is started,
//! and the full one is moved into the archive directory in the background.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::message::Message;

/// Rotate files when they reach this many bytes, unless told otherwise.
pub const DEFAULT_MAX_SIZE: u64 = 1_000_000;

const INPUT_CAPACITY: usize = 10;
const OUTPUT_CAPACITY: usize = 10;

// Two files created within the same nanosecond get the same name.
// Then we simply ask the clock again.
const CREATE_ATTEMPTS: usize = 8;

/// Builder for an [`ArchiverHandle`].
#[derive(Debug, Clone)]
pub struct ArchiverBuilder {
    template: PathBuf,
    max_size: u64,
    archive_dir: Option<PathBuf>,
}

impl ArchiverBuilder {
    /// Log into files named after `template`.
    /// A template of `/var/log/nmea.log` gives files such as `/var/log/nmea-2024-05-01T10:00:00.000000000Z.log`.
    pub fn new<P: AsRef<Path>>(template: P, max_size: u64) -> Self {
        Self {
            template: template.as_ref().into(),
            max_size,
            archive_dir: None,
        }
    }

    /// Move full files into this directory.
    /// If it is not a writable directory, files are left where they are.
    pub fn set_archive_dir<P: AsRef<Path>>(mut self, archive_dir: P) -> Self {
        self.archive_dir = Some(archive_dir.as_ref().into());
        self
    }

    /// Create the first file and start archiving.
    #[must_use]
    pub fn build(self) -> ArchiverHandle {
        let span = info_span!("archiver", template = ?self.template);

        let archive_dir = span.in_scope(|| {
            self.archive_dir
                .filter(|dir| is_writable_directory(dir))
        });

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);

        let archiver = Archiver {
            template: self.template,
            max_size: self.max_size,
            archive_dir,
            current: None,
            moves: JoinSet::new(),
            downstream_gone: false,
        };

        let task = tokio::spawn(archiver.run(input_rx, output_tx).instrument(span));

        ArchiverHandle {
            input: input_tx,
            output: output_rx,
            task,
        }
    }
}

/// A running archiver.
#[derive(Debug)]
pub struct ArchiverHandle {
    /// Messages to archive.
    /// Close this (drop it) to stop the archiver.
    pub input: mpsc::Sender<Message>,

    /// The bodies of the unmasked messages, after they were archived.
    /// Closes after the archiver is done.
    pub output: mpsc::Receiver<String>,

    /// Finishes after the last file has been archived.
    pub task: JoinHandle<()>,
}

/// The file currently written to.
struct LogFile {
    path: PathBuf,
    file: File,
    written: u64,
}

struct Archiver {
    template: PathBuf,
    max_size: u64,
    archive_dir: Option<PathBuf>,
    current: Option<LogFile>,
    moves: JoinSet<()>,
    downstream_gone: bool,
}

impl Archiver {
    async fn run(mut self, mut input: mpsc::Receiver<Message>, output: mpsc::Sender<String>) {
        self.current = create_file(&self.template).await;

        while let Some(message) = input.recv().await {
            self.rotate_if_full().await;
            self.write(&message).await;

            if message.masked {
                debug!(%message, "Masked, archived only");
                continue;
            }

            if output.send(message.body).await.is_err() && !self.downstream_gone {
                warn!("Nobody receives archived messages anymore, archiving only");
                self.downstream_gone = true;
            }
        }

        info!("Input closed, stopping");

        if let Some(current) = self.current.take() {
            let path = close(current).await;
            if let Some(archive_dir) = &self.archive_dir {
                archive(path, archive_dir.clone()).await;
            }
        }

        while self.moves.join_next().await.is_some() {}

        info!("Archiver done");
    }

    async fn rotate_if_full(&mut self) {
        let full = matches!(&self.current, Some(current) if current.written >= self.max_size);
        if !full {
            return;
        }

        if let Some(current) = self.current.take() {
            let path = close(current).await;

            if let Some(archive_dir) = &self.archive_dir {
                // Never hold up the messages for this.
                self.moves.spawn(archive(path, archive_dir.clone()).in_current_span());
            }
        }

        self.current = create_file(&self.template).await;

        // Reap finished moves.
        while self.moves.try_join_next().is_some() {}
    }

    async fn write(&mut self, message: &Message) {
        let Some(current) = &mut self.current else {
            return;
        };

        let line = format!("{}\n", message.archive_line());

        let written = async {
            current.file.write_all(line.as_bytes()).await?;
            current.file.flush().await
        }
        .await;

        match written {
            Ok(()) => current.written += line.len() as u64,
            Err(e) => error!(?e, path = ?current.path, "Could not write to log file"),
        }
    }
}

/// Where the log file for the given template and timestamp goes:
/// `<base>-<timestamp><ext>`.
pub(crate) fn timestamped_path(template: &Path, timestamp: &str) -> PathBuf {
    let stem = template
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = match template.extension() {
        Some(ext) => format!("{stem}-{timestamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{timestamp}"),
    };

    template.with_file_name(name)
}

async fn create_file(template: &Path) -> Option<LogFile> {
    for _ in 0..CREATE_ATTEMPTS {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let path = timestamped_path(template, &timestamp);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                info!(?path, %timestamp, "Log file created");
                return Some(LogFile {
                    path,
                    file,
                    written: 0,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(?path, "Log file exists, trying a new timestamp");
                tokio::task::yield_now().await;
            }
            Err(e) => {
                error!(?e, ?path, "Could not create log file, messages will not be logged");
                return None;
            }
        }
    }

    error!("Could not find a free log file name, messages will not be logged");
    None
}

async fn close(mut current: LogFile) -> PathBuf {
    if let Err(e) = current.file.flush().await {
        error!(?e, path = ?current.path, "Could not flush log file");
    }

    current.path
}

/// Move the file into the archive directory, keeping its name.
async fn archive(path: PathBuf, archive_dir: PathBuf) {
    let Some(name) = path.file_name() else {
        error!(?path, "Log file has no name, not archiving");
        return;
    };
    let destination = archive_dir.join(name);

    info!(?path, ?archive_dir, "Archiving");

    match move_file(&path, &destination).await {
        Ok(()) => debug!(?destination, "Archived"),
        Err(e) => error!(?e, ?path, ?destination, "Could not archive log file"),
    }
}

/// Copy, then remove.
/// Works across file systems, which a rename does not.
async fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(source, destination).await?;
    fs::remove_file(source).await
}

/// Is this an existing directory we are allowed to create files in?
fn is_writable_directory(dir: &Path) -> bool {
    let metadata = match std::fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(?e, ?dir, "Archive directory unusable, archiving disabled");
            return false;
        }
    };

    if !metadata.is_dir() {
        warn!(?dir, "Archive directory is not a directory, archiving disabled");
        return false;
    }

    let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            if let Err(e) = std::fs::remove_file(&probe) {
                warn!(?e, ?probe, "Could not remove probe file");
            }
            info!(?dir, "Archive directory is writable");
            true
        }
        Err(e) => {
            warn!(?e, ?dir, "Archive directory is not writable, archiving disabled");
            false
        }
    }
}
