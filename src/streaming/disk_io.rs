//! Deferred disk I/O
//!
//! A [`DeferredFile`] owns one file handle and one worker thread. Callers
//! queue [`DeferredIo`] operations; the worker performs them one at a time
//! under the stream lock and either runs the operation's callback on the I/O
//! thread or parks it on a completion queue for the owning thread to drain.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::types::TocId;
use crate::streaming::semaphore::Semaphore;

/// Direction of a deferred operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    /// Write at the operation offset, or at end of file when `append` is set.
    Write { append: bool },
}

/// Identifies what a completed operation belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoTag {
    ChunkWrite { toc: TocId, stub: usize },
    StubWrite { toc: TocId, stub: usize },
    Untracked,
}

impl IoTag {
    pub fn toc(&self) -> Option<TocId> {
        match *self {
            IoTag::ChunkWrite { toc, .. } | IoTag::StubWrite { toc, .. } => Some(toc),
            IoTag::Untracked => None,
        }
    }
}

/// Callback run on the I/O thread as soon as an operation finishes.
pub type IoCallback = Box<dyn FnOnce(DeferredIo) + Send + 'static>;

enum Completion {
    /// Parked on the completion queue until drained.
    Deferred(IoTag),
    /// Handed straight to a callback on the I/O thread.
    OnIoThread(IoCallback),
}

/// One queued read or write
pub struct DeferredIo {
    kind: IoKind,
    offset: u64,
    length: u32,
    data: Vec<u8>,
    error: Option<io::Error>,
    completion: Completion,
}

impl std::fmt::Debug for DeferredIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredIo")
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("tag", &self.tag())
            .field("error", &self.error)
            .finish()
    }
}

impl DeferredIo {
    /// Read `length` bytes at `offset`; the result is parked for draining.
    pub fn read(offset: u64, length: u32, tag: IoTag) -> Self {
        Self::new(IoKind::Read, offset, length, Vec::new(), Completion::Deferred(tag))
    }

    /// Read `length` bytes at `offset` and hand the result to `callback` on the I/O thread.
    pub fn read_then(offset: u64, length: u32, callback: IoCallback) -> Self {
        Self::new(IoKind::Read, offset, length, Vec::new(), Completion::OnIoThread(callback))
    }

    /// Overwrite bytes at `offset`.
    pub fn write_at(offset: u64, data: Vec<u8>, tag: IoTag) -> Self {
        Self::write(IoKind::Write { append: false }, offset, data, tag)
    }

    /// Append bytes at the end of the file. The completed operation carries
    /// the offset the bytes actually landed at.
    pub fn append(data: Vec<u8>, tag: IoTag) -> Self {
        Self::write(IoKind::Write { append: true }, 0, data, tag)
    }

    /// Buffers too long for a `u32` length are rejected: the operation
    /// completes with an error and nothing is written.
    fn write(kind: IoKind, offset: u64, data: Vec<u8>, tag: IoTag) -> Self {
        match checked_length(data.len()) {
            Ok(length) => Self::new(kind, offset, length, data, Completion::Deferred(tag)),
            Err(e) => {
                let mut op = Self::new(kind, offset, 0, Vec::new(), Completion::Deferred(tag));
                op.error = Some(e);
                op
            }
        }
    }

    fn new(kind: IoKind, offset: u64, length: u32, data: Vec<u8>, completion: Completion) -> Self {
        Self {
            kind,
            offset,
            length,
            data,
            error: None,
            completion,
        }
    }

    pub fn kind(&self) -> IoKind {
        self.kind
    }

    pub fn is_write(&self) -> bool {
        matches!(self.kind, IoKind::Write { .. })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Tag of a deferred operation; callback operations report `Untracked`.
    pub fn tag(&self) -> IoTag {
        match &self.completion {
            Completion::Deferred(tag) => *tag,
            Completion::OnIoThread(_) => IoTag::Untracked,
        }
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    /// Run the operation against `file`. Failures are stored on the operation.
    fn perform(&mut self, file: &mut File) {
        if self.error.is_some() {
            return;
        }
        let result = match self.kind {
            IoKind::Read => {
                self.data.resize(self.length as usize, 0);
                file.seek(SeekFrom::Start(self.offset))
                    .and_then(|_| file.read_exact(&mut self.data))
            }
            IoKind::Write { append } => {
                let position = if append {
                    file.seek(SeekFrom::End(0))
                } else {
                    file.seek(SeekFrom::Start(self.offset))
                };
                position.and_then(|pos| {
                    self.offset = pos;
                    file.write_all(&self.data)
                })
            }
        };

        if let Err(e) = result {
            self.error = Some(e);
        }
    }
}

fn checked_length(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} bytes exceeds the largest frame of {} bytes", len, u32::MAX),
        )
    })
}

struct IoShared {
    stream: Mutex<File>,
    requests: Mutex<VecDeque<DeferredIo>>,
    completed: Mutex<VecDeque<DeferredIo>>,
    wake: Semaphore,
    stop: AtomicBool,
    running: AtomicBool,
    /// Operations queued but not yet finished.
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl IoShared {
    fn execute(&self, mut op: DeferredIo) {
        {
            let mut file = self.stream.lock();
            op.perform(&mut file);
        }
        if let Some(e) = op.error() {
            log::error!("deferred {:?} at offset {} failed: {}", op.kind, op.offset, e);
        }

        let completion = std::mem::replace(&mut op.completion, Completion::Deferred(IoTag::Untracked));
        match completion {
            Completion::OnIoThread(callback) => callback(op),
            Completion::Deferred(tag) => {
                op.completion = Completion::Deferred(tag);
                self.completed.lock().push_back(op);
            }
        }

        self.finish_one();
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn run(self: Arc<Self>) {
        log::debug!("deferred I/O thread started");
        loop {
            self.wake.acquire();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let next = self.requests.lock().pop_front();
            match next {
                Some(op) => self.execute(op),
                None => log::warn!("deferred I/O thread woken with an empty queue"),
            }
        }
        log::debug!("deferred I/O thread stopped");
    }
}

/// Cloneable handle for queueing operations, usable from any thread.
#[derive(Clone)]
pub struct IoQueue {
    shared: Arc<IoShared>,
}

impl IoQueue {
    /// Queue an operation. When the worker thread is not running the
    /// operation executes on the calling thread before this returns.
    pub fn queue(&self, op: DeferredIo) {
        *self.shared.outstanding.lock() += 1;
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.requests.lock().push_back(op);
            self.shared.wake.release();
        } else {
            self.shared.execute(op);
        }
    }
}

/// A file with a background worker performing queued I/O
pub struct DeferredFile {
    path: PathBuf,
    writable: bool,
    queue: IoQueue,
    worker: Option<JoinHandle<()>>,
}

impl DeferredFile {
    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_file(path, file, true))
    }

    /// Open an existing file, optionally for writing.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self::from_file(path, file, writable))
    }

    fn from_file(path: &Path, file: File, writable: bool) -> Self {
        let shared = Arc::new(IoShared {
            stream: Mutex::new(file),
            requests: Mutex::new(VecDeque::new()),
            completed: Mutex::new(VecDeque::new()),
            wake: Semaphore::new(0),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });
        Self {
            path: path.to_path_buf(),
            writable,
            queue: IoQueue { shared },
            worker: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Handle for queueing from other threads
    pub fn handle(&self) -> IoQueue {
        self.queue.clone()
    }

    pub fn queue(&self, op: DeferredIo) {
        self.queue.queue(op);
    }

    /// Perform an operation on the calling thread, bypassing the queue but
    /// still serialized by the stream lock. Completion handling is skipped.
    pub fn execute_immediate(&self, mut op: DeferredIo) -> DeferredIo {
        let mut file = self.queue.shared.stream.lock();
        op.perform(&mut file);
        op
    }

    /// Read `length` bytes at `offset` on the calling thread.
    pub fn read_immediate(&self, offset: u64, length: u32) -> io::Result<Vec<u8>> {
        let mut op = self.execute_immediate(DeferredIo::read(offset, length, IoTag::Untracked));
        match op.take_error() {
            Some(e) => Err(e),
            None => Ok(op.into_data()),
        }
    }

    /// Exclusive access to the underlying stream
    pub fn lock_stream(&self) -> MutexGuard<'_, File> {
        self.queue.shared.stream.lock()
    }

    pub fn stream_len(&self) -> io::Result<u64> {
        Ok(self.lock_stream().metadata()?.len())
    }

    /// Start the worker thread. Does nothing if it is already running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.queue.shared);
        shared.stop.store(false, Ordering::Release);
        shared.running.store(true, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name("atlas-io".into())
            .spawn(move || shared.run());
        match handle {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.queue.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stop and join the worker thread. Writes still queued are performed on
    /// the calling thread; queued reads are dropped.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let shared = &self.queue.shared;
        shared.running.store(false, Ordering::Release);
        shared.stop.store(true, Ordering::Release);
        shared.wake.release();
        if worker.join().is_err() {
            log::error!("deferred I/O thread panicked");
        }
        while shared.wake.try_acquire() {}

        let leftover: Vec<DeferredIo> = shared.requests.lock().drain(..).collect();
        let mut dropped_reads = 0;
        for op in leftover {
            if op.is_write() {
                shared.execute(op);
            } else {
                dropped_reads += 1;
                shared.finish_one();
            }
        }
        if dropped_reads > 0 {
            log::debug!("dropped {} queued reads on shutdown", dropped_reads);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// True while any queued operation has not finished
    pub fn has_pending_io(&self) -> bool {
        *self.queue.shared.outstanding.lock() > 0
    }

    /// Block until every queued operation has finished.
    pub fn wait_until_idle(&self) {
        let shared = &self.queue.shared;
        let mut outstanding = shared.outstanding.lock();
        while *outstanding > 0 {
            shared.idle.wait(&mut outstanding);
        }
    }

    /// Take every parked completion.
    pub fn sync(&self) -> Vec<DeferredIo> {
        self.queue.shared.completed.lock().drain(..).collect()
    }

    /// Take the parked completions whose tag satisfies `keep`, leaving the rest queued.
    pub fn drain_completed_matching(&self, mut keep: impl FnMut(&IoTag) -> bool) -> Vec<DeferredIo> {
        let mut completed = self.queue.shared.completed.lock();
        let (taken, rest): (VecDeque<_>, VecDeque<_>) =
            completed.drain(..).partition(|op| keep(&op.tag()));
        *completed = rest;
        taken.into_iter().collect()
    }

    pub fn has_completions(&self) -> bool {
        !self.queue.shared.completed.lock().is_empty()
    }
}

impl Drop for DeferredFile {
    fn drop(&mut self) {
        self.stop();
        self.queue.shared.requests.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_file(dir: &TempDir) -> DeferredFile {
        DeferredFile::create(dir.path().join("io.bin")).expect("failed to create file")
    }

    #[test]
    fn test_inline_append_reports_offset() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = temp_file(&temp_dir);

        let tag = IoTag::ChunkWrite { toc: TocId(0), stub: 3 };
        file.queue(DeferredIo::append(vec![1, 2, 3, 4], tag));
        file.queue(DeferredIo::append(vec![5, 6], tag));

        let done = file.sync();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].offset(), 0);
        assert_eq!(done[1].offset(), 4);
        assert_eq!(done[1].tag(), tag);
        assert_eq!(file.read_immediate(2, 4).unwrap(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_threaded_writes_complete_in_order() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut file = temp_file(&temp_dir);
        file.start().expect("failed to start I/O thread");
        assert!(file.is_running());

        for i in 0..16u8 {
            file.queue(DeferredIo::append(vec![i; 8], IoTag::StubWrite { toc: TocId(1), stub: i as usize }));
        }
        file.wait_until_idle();
        assert!(!file.has_pending_io());

        let done = file.sync();
        let offsets: Vec<u64> = done.iter().map(|op| op.offset()).collect();
        let expected: Vec<u64> = (0..16).map(|i| i * 8).collect();
        assert_eq!(offsets, expected);

        file.stop();
        assert!(!file.is_running());
        assert_eq!(file.stream_len().unwrap(), 128);
    }

    #[test]
    fn test_read_callback_runs() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut file = temp_file(&temp_dir);
        file.queue(DeferredIo::write_at(0, b"hello world".to_vec(), IoTag::Untracked));
        file.start().expect("failed to start I/O thread");

        let (tx, rx) = std::sync::mpsc::channel();
        file.queue(DeferredIo::read_then(6, 5, Box::new(move |op| {
            let _ = tx.send(op.into_data());
        })));
        let bytes = rx.recv_timeout(std::time::Duration::from_secs(5)).expect("callback never ran");
        assert_eq!(bytes, b"world");
    }

    #[test]
    fn test_drain_matching_leaves_others() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = temp_file(&temp_dir);
        file.queue(DeferredIo::append(vec![0; 4], IoTag::ChunkWrite { toc: TocId(0), stub: 0 }));
        file.queue(DeferredIo::append(vec![0; 4], IoTag::ChunkWrite { toc: TocId(1), stub: 0 }));

        let mine = file.drain_completed_matching(|tag| tag.toc() == Some(TocId(1)));
        assert_eq!(mine.len(), 1);
        assert!(file.has_completions());
        assert_eq!(file.sync()[0].tag().toc(), Some(TocId(0)));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_buffer_is_rejected() {
        assert_eq!(checked_length(u32::MAX as usize).unwrap(), u32::MAX);
        let err = checked_length(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rejected_write_touches_nothing() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = temp_file(&temp_dir);
        let mut op = DeferredIo::append(vec![1, 2, 3], IoTag::Untracked);
        op.error = Some(io::Error::new(io::ErrorKind::InvalidInput, "too long"));
        file.queue(op);

        let mut done = file.sync();
        assert!(done[0].take_error().is_some());
        assert_eq!(file.stream_len().unwrap(), 0);
    }

    #[test]
    fn test_read_past_end_reports_error() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = temp_file(&temp_dir);
        assert!(file.read_immediate(100, 4).is_err());
    }
}
