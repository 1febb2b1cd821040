use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace period after the watched file is renamed away, during which the old
/// handle is still drained so the producer can flush its buffers into it.
const DEFAULT_TEARDOWN: Duration = Duration::from_secs(10);

/// How often the blocking loop wakes to check the shutdown flag and the
/// reappearance of a rotated file.
const POLL: Duration = Duration::from_millis(500);
const REOPEN_POLL: Duration = Duration::from_millis(100);

/// Pause before re-entering a watch pass that failed with an I/O error.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("io error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl FollowError {
    fn io(offset: u64, source: std::io::Error) -> Self {
        Self::Io { offset, source }
    }
}

/// One full line read from a file instance, with the byte offset of its
/// first byte. The terminating newline is retained.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub inode: u64,
    pub offset: u64,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowMode {
    /// Seek to the end and follow new content.
    Tail,
    /// Read from the beginning, then follow.
    FromStart,
    /// Read to the current end and stop; no watch.
    OneShot,
}

enum FileEvent {
    Modified,
    Moved,
}

/// Tails a file that an external rotator may rename or truncate, yielding
/// complete lines with their positions.
///
/// One watch pass covers one file instance: open, seek, drain on kernel
/// modification events, and, once a rename is seen, linger for the teardown
/// period before closing the handle and re-opening the path. Offsets carry
/// over between passes of the same inode so an in-place truncation rewinds
/// to zero while an untouched file resumes where it left off.
///
/// A pass that fails with an I/O error is logged and restarted, resuming at
/// the last recorded offset. Only failing to open the file before anything
/// was ever read is fatal.
pub struct Follower {
    path: PathBuf,
    mode: FollowMode,
    teardown: Duration,
    last_inode: Option<u64>,
    last_offset: u64,
}

impl Follower {
    pub fn new(path: impl Into<PathBuf>, mode: FollowMode) -> Self {
        Self {
            path: path.into(),
            mode,
            teardown: DEFAULT_TEARDOWN,
            last_inode: None,
            last_offset: 0,
        }
    }

    /// Shorten or lengthen the post-rename linger. Mainly for tests; the
    /// production default matches what log rotators expect.
    pub fn with_teardown(mut self, teardown: Duration) -> Self {
        self.teardown = teardown;
        self
    }

    /// Start following on a blocking worker. Lines arrive on the returned
    /// bounded channel; the consumer's pace is the reader's pace.
    pub fn spawn(
        self,
        capacity: usize,
    ) -> (
        mpsc::Receiver<RawLine>,
        watch::Sender<bool>,
        JoinHandle<Result<(), FollowError>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::task::spawn_blocking(move || self.run(tx, shutdown_rx));
        (rx, shutdown_tx, handle)
    }

    fn run(
        mut self,
        tx: mpsc::Sender<RawLine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), FollowError> {
        loop {
            match self.watch_pass(&tx, &shutdown) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(error) => {
                    // before the first successful open this is a startup
                    // failure; afterwards the pass is idempotent and safe
                    // to restart from the recorded offset
                    if self.last_inode.is_none() {
                        return Err(error);
                    }
                    error!(%error, offset = self.last_offset, "watch pass failed, restarting");
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    std::thread::sleep(RESTART_DELAY);
                }
            }
        }
    }

    /// One pass over one file instance. Returns `true` when following should
    /// stop (one-shot EOF, consumer gone, or shutdown requested).
    fn watch_pass(
        &mut self,
        tx: &mpsc::Sender<RawLine>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool, FollowError> {
        let file = match self.open_current(shutdown)? {
            Some(file) => file,
            None => return Ok(true),
        };

        let metadata = file
            .metadata()
            .map_err(|e| FollowError::io(self.last_offset, e))?;
        let inode = get_inode(&metadata);
        let mut reader = BufReader::new(file);

        let offset = if let Some(last) = self.last_inode {
            if inode == last {
                if metadata.len() < self.last_offset {
                    warn!(
                        inode,
                        last_offset = self.last_offset,
                        "file shrank in place, rewinding to start"
                    );
                    0
                } else {
                    self.last_offset
                }
            } else {
                0
            }
        } else {
            match self.mode {
                FollowMode::Tail => metadata.len(),
                FollowMode::FromStart | FollowMode::OneShot => 0,
            }
        };
        self.last_inode = Some(inode);
        self.last_offset = offset;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FollowError::io(offset, e))?;

        if self.mode == FollowMode::OneShot {
            self.drain_to_eof(&mut reader, inode, tx)?;
            return Ok(true);
        }

        let (event_tx, event_rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), inode, "starting watch pass");

        if !self.drain_to_eof(&mut reader, inode, tx)? {
            return Ok(true);
        }

        let mut moved_at: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                info!(inode, offset = self.last_offset, "shutdown requested, closing watch");
                return Ok(true);
            }

            let timeout = match moved_at {
                Some(at) => {
                    let elapsed = at.elapsed();
                    if elapsed >= self.teardown {
                        break;
                    }
                    (self.teardown - elapsed).min(POLL)
                }
                None => POLL,
            };

            match event_rx.recv_timeout(timeout) {
                Ok(Ok(event)) => match classify(&event.kind) {
                    Some(FileEvent::Modified) => {
                        self.check_truncation(&mut reader)?;
                        if !self.drain_to_eof(&mut reader, inode, tx)? {
                            return Ok(true);
                        }
                    }
                    Some(FileEvent::Moved) => {
                        if moved_at.is_none() {
                            info!(
                                inode,
                                offset = self.last_offset,
                                "file renamed, lingering before reopen"
                            );
                            moved_at = Some(Instant::now());
                        }
                    }
                    None => {}
                },
                Ok(Err(error)) => return Err(error.into()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // teardown elapsed: take what the producer flushed into the old
        // handle, then hand over to the next pass
        self.drain_to_eof(&mut reader, inode, tx)?;
        info!(inode, offset = self.last_offset, "finished watch pass");
        Ok(false)
    }

    /// Open the watched path. After a rotation the same-name file may not
    /// exist yet; keep polling for it. A missing file on the very first pass
    /// is an error.
    fn open_current(&self, shutdown: &watch::Receiver<bool>) -> Result<Option<File>, FollowError> {
        loop {
            match File::open(&self.path) {
                Ok(file) => return Ok(Some(file)),
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound && self.last_inode.is_some() =>
                {
                    if *shutdown.borrow() {
                        return Ok(None);
                    }
                    std::thread::sleep(REOPEN_POLL);
                }
                Err(e) => return Err(FollowError::io(self.last_offset, e)),
            }
        }
    }

    /// A copy-truncate rotation leaves the inode in place but shrinks the
    /// file under our feet; rewind before draining.
    fn check_truncation(&mut self, reader: &mut BufReader<File>) -> Result<(), FollowError> {
        let len = reader
            .get_ref()
            .metadata()
            .map_err(|e| FollowError::io(self.last_offset, e))?
            .len();
        if len < self.last_offset {
            warn!(offset = self.last_offset, len, "file truncated, rewinding to start");
            reader
                .seek(SeekFrom::Start(0))
                .map_err(|e| FollowError::io(self.last_offset, e))?;
            self.last_offset = 0;
        }
        Ok(())
    }

    /// Read complete lines up to EOF, advancing the recorded offset. A line
    /// without its terminating newline is not emitted: the reader rewinds to
    /// the line start and the bytes are picked up whole on a later event.
    /// Returns `false` when the consumer side is gone.
    fn drain_to_eof(
        &mut self,
        reader: &mut BufReader<File>,
        inode: u64,
        tx: &mpsc::Sender<RawLine>,
    ) -> Result<bool, FollowError> {
        loop {
            let start = self.last_offset;
            let mut buf = Vec::new();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| FollowError::io(start, e))?;
            if n == 0 {
                return Ok(true);
            }
            if buf.last() != Some(&b'\n') {
                debug!(offset = start, "partial line, waiting for newline");
                reader
                    .seek(SeekFrom::Start(start))
                    .map_err(|e| FollowError::io(start, e))?;
                return Ok(true);
            }
            self.last_offset = start + n as u64;
            let line = String::from_utf8_lossy(&buf).into_owned();
            let sent = tx.blocking_send(RawLine {
                inode,
                offset: start,
                line,
            });
            if sent.is_err() {
                return Ok(false);
            }
        }
    }
}

/// Lines from standard input, with `inode = 0` and accumulated offsets.
/// There is no rotation to track; the channel closes on EOF.
pub fn spawn_stdin(
    capacity: usize,
) -> (mpsc::Receiver<RawLine>, JoinHandle<Result<(), FollowError>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut reader = BufReader::new(stdin.lock());
        let mut offset: u64 = 0;
        loop {
            let mut buf = Vec::new();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| FollowError::io(offset, e))?;
            if n == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            let raw = RawLine {
                inode: 0,
                offset,
                line,
            };
            offset += n as u64;
            if tx.blocking_send(raw).is_err() {
                return Ok(());
            }
        }
    });
    (rx, handle)
}

fn classify(kind: &EventKind) -> Option<FileEvent> {
    match kind {
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => Some(FileEvent::Moved),
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any => Some(FileEvent::Modified),
        _ => None,
    }
}

#[cfg(unix)]
fn get_inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn get_inode(metadata: &Metadata) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        modified.hash(&mut hasher);
    }
    hasher.finish()
}
