//! Background load pipeline
//!
//! Reads flow through three hand-offs: the scheduler picks a candidate and
//! the I/O thread reads its frame, the deserializer thread decodes the bytes
//! into a [`Chunk`], and the main thread takes decoded notes and instates
//! them. Exactly one read is in flight at a time; the next read is issued as
//! soon as the previous bytes reach the deserializer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::config::PagerConfig;
use crate::core::types::{Result, TocId};
use crate::streaming::chunk::{self, Chunk};
use crate::streaming::disk_io::{DeferredIo, IoQueue};
use crate::streaming::registry::TocKind;
use crate::streaming::scheduler::{LoadCandidate, LoadScheduler};
use crate::streaming::semaphore::Semaphore;

/// One stub's trip through the pipeline
#[derive(Debug)]
pub struct ReadNote {
    pub toc: TocId,
    pub stub: usize,
    pub kind: TocKind,
    pub offset: u64,
    pub priority: f32,
    bytes: Vec<u8>,
    io_error: Option<std::io::Error>,
    /// Decoded chunk, set by the deserializer
    outcome: Option<Result<Chunk>>,
}

impl ReadNote {
    fn new(candidate: &LoadCandidate, mut op: DeferredIo) -> Self {
        let io_error = op.take_error();
        Self {
            toc: candidate.toc,
            stub: candidate.stub,
            kind: candidate.kind,
            offset: candidate.offset,
            priority: candidate.priority,
            bytes: op.into_data(),
            io_error,
            outcome: None,
        }
    }

    /// Decode the frame read from disk. Frees the raw bytes.
    fn deserialize(&mut self) {
        let outcome = self.decode();
        self.outcome = Some(outcome);
    }

    fn decode(&mut self) -> Result<Chunk> {
        let bytes = std::mem::take(&mut self.bytes);
        match self.io_error.take() {
            Some(e) => Err(e.into()),
            None => chunk::read_framed(self.kind, &bytes, self.offset),
        }
    }

    /// The decoded chunk or the reason there is none
    pub fn into_outcome(mut self) -> Result<Chunk> {
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.decode(),
        }
    }
}

/// State shared by the container, the I/O thread and the deserializer
pub struct LoadPipeline {
    config: PagerConfig,
    scheduler: Mutex<LoadScheduler>,
    pending_deserialize: Mutex<VecDeque<ReadNote>>,
    deserialize_ready: Semaphore,
    pending_process: Mutex<VecDeque<ReadNote>>,
    read_in_flight: AtomicBool,
    /// Reads issued whose notes have not been taken by the main thread
    in_pipeline: AtomicUsize,
    active: AtomicBool,
    progress: Mutex<()>,
    progressed: Condvar,
}

impl LoadPipeline {
    pub fn new(config: PagerConfig) -> Self {
        Self {
            config,
            scheduler: Mutex::new(LoadScheduler::new()),
            pending_deserialize: Mutex::new(VecDeque::new()),
            deserialize_ready: Semaphore::new(0),
            pending_process: Mutex::new(VecDeque::new()),
            read_in_flight: AtomicBool::new(false),
            in_pipeline: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            progress: Mutex::new(()),
            progressed: Condvar::new(),
        }
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    /// Lock the shared scheduler
    pub fn scheduler(&self) -> parking_lot::MutexGuard<'_, LoadScheduler> {
        self.scheduler.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start the deserializer thread and allow reads to be issued.
    pub fn activate(self: &Arc<Self>, io: IoQueue) -> std::io::Result<JoinHandle<()>> {
        self.active.store(true, Ordering::Release);
        let pipeline = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("atlas-deserialize".into())
            .spawn(move || pipeline.run_deserializer(io));
        if spawned.is_err() {
            self.active.store(false, Ordering::Release);
        }
        spawned
    }

    /// Stop issuing reads and tell the deserializer thread to exit.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.deserialize_ready.release();
        self.notify_progress();
    }

    /// Issue the next scheduled read unless one is already in flight.
    pub fn enqueue_next_pending_load(self: &Arc<Self>, io: &IoQueue) {
        if !self.is_active() {
            return;
        }
        if self
            .read_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let candidate = {
            let mut scheduler = self.scheduler.lock();
            let next = scheduler.next();
            if let Some(c) = &next {
                scheduler.mark_started(c.toc, c.stub);
                self.in_pipeline.fetch_add(1, Ordering::AcqRel);
            }
            next
        };
        let Some(candidate) = candidate else {
            self.read_in_flight.store(false, Ordering::Release);
            return;
        };

        log::trace!(
            "reading stub {} of {} ({} bytes at {})",
            candidate.stub,
            candidate.toc,
            candidate.length,
            candidate.offset
        );

        let pipeline = Arc::clone(self);
        let next_io = io.clone();
        io.queue(DeferredIo::read_then(
            candidate.offset,
            candidate.length,
            Box::new(move |op| {
                pipeline.pending_deserialize.lock().push_back(ReadNote::new(&candidate, op));
                pipeline.deserialize_ready.release();
                pipeline.read_in_flight.store(false, Ordering::Release);
                pipeline.enqueue_next_pending_load(&next_io);
            }),
        ));
    }

    fn run_deserializer(self: Arc<Self>, io: IoQueue) {
        log::debug!("deserializer thread started");
        let pause = self.config.deserializer_pause();
        loop {
            self.deserialize_ready.acquire();
            if !self.is_active() {
                break;
            }
            let Some(mut note) = self.pending_deserialize.lock().pop_front() else {
                continue;
            };

            note.deserialize();
            if self.config.log_stub_load_status {
                log::debug!(
                    "  {} - priority {}, stub {} deserialized ({})",
                    note.kind,
                    note.priority,
                    note.stub,
                    if matches!(note.outcome, Some(Ok(_))) { "ok" } else { "failed" }
                );
            }
            self.pending_process.lock().push_back(note);
            self.notify_progress();

            self.enqueue_next_pending_load(&io);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
        log::debug!("deserializer thread stopped");
    }

    /// Decode anything the deserializer thread left behind, on the calling thread.
    pub fn deserialize_leftovers(&self) -> usize {
        let leftovers: Vec<ReadNote> = self.pending_deserialize.lock().drain(..).collect();
        let count = leftovers.len();
        let mut process = self.pending_process.lock();
        for mut note in leftovers {
            note.deserialize();
            process.push_back(note);
        }
        while self.deserialize_ready.try_acquire() {}
        count
    }

    /// Take every decoded note, oldest first.
    pub fn take_processed(&self) -> Vec<ReadNote> {
        let notes: Vec<ReadNote> = self.pending_process.lock().drain(..).collect();
        self.in_pipeline.fetch_sub(notes.len(), Ordering::AcqRel);
        notes
    }

    /// Drop a queued candidate whose interest went away.
    pub fn forget(&self, toc: TocId, stub: usize) {
        self.scheduler.lock().forget(toc, stub);
    }

    /// True when nothing is queued, being read, or waiting to be decoded or instated.
    pub fn is_idle(&self) -> bool {
        self.scheduler.lock().is_empty() && self.in_pipeline.load(Ordering::Acquire) == 0
    }

    /// (queued, deserialize, process) lengths
    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        (
            self.scheduler.lock().len(),
            self.pending_deserialize.lock().len(),
            self.pending_process.lock().len(),
        )
    }

    fn notify_progress(&self) {
        let _guard = self.progress.lock();
        self.progressed.notify_all();
    }

    /// Sleep until the deserializer produces something or `timeout` passes.
    pub fn wait_for_progress(&self, timeout: Duration) {
        let mut guard = self.progress.lock();
        if !self.pending_process.lock().is_empty() {
            return;
        }
        self.progressed.wait_for(&mut guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::chunk::{Texel, TextureChunk, TextureFormat};
    use crate::streaming::disk_io::{DeferredFile, IoTag};
    use tempfile::TempDir;

    fn fast_config() -> PagerConfig {
        PagerConfig {
            deserializer_pause_ms: 0,
            ..Default::default()
        }
    }

    /// Append framed texture chunks and return their candidates
    fn write_frames(file: &DeferredFile, values: &[u8]) -> Vec<LoadCandidate> {
        values
            .iter()
            .enumerate()
            .map(|(stub, &v)| {
                let chunk = Chunk::texture(TextureChunk::filled(2, Texel::splat(v), TextureFormat::Raw));
                let frame = chunk::prepare_write(&chunk).unwrap();
                let length = frame.len() as u32;
                let op = file.execute_immediate(DeferredIo::append(frame, IoTag::Untracked));
                LoadCandidate {
                    toc: TocId(0),
                    stub,
                    kind: TocKind::Texture,
                    offset: op.offset(),
                    length,
                    priority: 1.0,
                }
            })
            .collect()
    }

    fn drain(pipeline: &LoadPipeline, expected: usize) -> Vec<ReadNote> {
        let mut notes = Vec::new();
        for _ in 0..500 {
            notes.extend(pipeline.take_processed());
            if notes.len() >= expected {
                break;
            }
            pipeline.wait_for_progress(Duration::from_millis(10));
        }
        notes
    }

    #[test]
    fn test_reads_flow_through_threads() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut file = DeferredFile::create(temp_dir.path().join("pipe.atlas")).unwrap();
        file.execute_immediate(DeferredIo::write_at(0, vec![0; 8], IoTag::Untracked));
        let candidates = write_frames(&file, &[3, 5, 7]);
        file.start().unwrap();

        let pipeline = Arc::new(LoadPipeline::new(fast_config()));
        let worker = pipeline.activate(file.handle()).unwrap();
        pipeline.scheduler().rebuild(vec![candidates]);
        pipeline.enqueue_next_pending_load(&file.handle());

        let notes = drain(&pipeline, 3);
        assert_eq!(notes.len(), 3);
        for (i, note) in notes.into_iter().enumerate() {
            assert_eq!(note.stub, i);
            let chunk = note.into_outcome().unwrap();
            let texel = chunk.as_texture().unwrap().texel(0, 0).unwrap();
            assert_eq!(texel, Texel::splat([3, 5, 7][i]));
        }
        assert_eq!(pipeline.scheduler().take_started().len(), 3);

        pipeline.deactivate();
        worker.join().unwrap();
        file.stop();
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_inactive_pipeline_issues_nothing() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = DeferredFile::create(temp_dir.path().join("pipe.atlas")).unwrap();
        file.execute_immediate(DeferredIo::write_at(0, vec![0; 8], IoTag::Untracked));
        let candidates = write_frames(&file, &[1]);

        let pipeline = Arc::new(LoadPipeline::new(fast_config()));
        pipeline.scheduler().rebuild(vec![candidates]);
        pipeline.enqueue_next_pending_load(&file.handle());
        assert_eq!(pipeline.queue_lengths(), (1, 0, 0));
        assert!(!pipeline.scheduler().has_started());
    }

    #[test]
    fn test_corrupt_frame_reported_by_note() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file = DeferredFile::create(temp_dir.path().join("pipe.atlas")).unwrap();
        file.execute_immediate(DeferredIo::write_at(0, vec![0; 8], IoTag::Untracked));
        let mut candidates = write_frames(&file, &[1]);
        // Point the read one byte late so the magic no longer lines up.
        candidates[0].offset += 1;
        candidates[0].length -= 1;

        let pipeline = Arc::new(LoadPipeline::new(fast_config()));
        pipeline.active.store(true, Ordering::Release);
        pipeline.scheduler().rebuild(vec![candidates]);
        // No worker threads: the read runs inline and the note waits for decoding.
        pipeline.enqueue_next_pending_load(&file.handle());
        assert_eq!(pipeline.deserialize_leftovers(), 1);

        let note = pipeline.take_processed().pop().unwrap();
        let err = note.into_outcome().unwrap_err();
        assert!(err.is_corruption());
    }
}
