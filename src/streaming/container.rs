//! Container files
//!
//! A [`Container`] owns the ordered TOCs of one file, the deferred I/O
//! worker and the load pipeline. TOCs are only ever touched on the thread
//! that owns the container; worker threads see raw bytes and decoded notes.

use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::config::PagerConfig;
use crate::core::error::Error;
use crate::core::types::{Result, TocId};
use crate::math::RectI;
use crate::streaming::chunk::{Chunk, ConfigChunk};
use crate::streaming::chunk_loader::LoadPipeline;
use crate::streaming::disk_io::{DeferredFile, DeferredIo, IoTag};
use crate::streaming::format::{CONTAINER_MAGIC, read_short_string, read_u8, read_u32};
use crate::streaming::priority::LoadReason;
use crate::streaming::registry::{TocKind, TocRegistry};
use crate::streaming::toc::Toc;

/// Lifecycle of a container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    /// No file; TOCs may be registered
    Closed,
    /// Header read or written, no worker threads
    Open,
    /// Loader threads running
    Active,
    /// Shutting down; flushing writes
    Draining,
}

pub struct Container {
    config: PagerConfig,
    state: ContainerState,
    tocs: Vec<Toc>,
    file: Option<DeferredFile>,
    pipeline: Arc<LoadPipeline>,
    deserializer: Option<JoinHandle<()>>,
    since_sync: Duration,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::with_config(PagerConfig::default())
    }

    pub fn with_config(config: PagerConfig) -> Self {
        Self {
            pipeline: Arc::new(LoadPipeline::new(config.clone())),
            config,
            state: ContainerState::Closed,
            tocs: Vec::new(),
            file: None,
            deserializer: None,
            since_sync: Duration::ZERO,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn pager_config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(DeferredFile::path)
    }

    /// Add a TOC before `create_new`. Its position is its on-disk order.
    pub fn register_toc(&mut self, mut toc: Toc) -> Result<TocId> {
        if self.state != ContainerState::Closed {
            return Err(Error::InvalidState("TOCs can only be registered on a closed container".into()));
        }
        if self.tocs.len() >= u8::MAX as usize {
            return Err(Error::InvalidState("a container holds at most 255 TOCs".into()));
        }
        let id = TocId(self.tocs.len());
        toc.attach(id, self.config.heat);
        self.tocs.push(toc);
        Ok(id)
    }

    // --- Bring-up ---

    /// Create (or truncate) `path` and write the header for every registered TOC.
    pub fn create_new(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.state != ContainerState::Closed {
            return Err(Error::InvalidState(format!("create_new in state {:?}", self.state)));
        }

        let mut header = Vec::new();
        header.extend_from_slice(CONTAINER_MAGIC);
        header.push(self.tocs.len() as u8);
        for toc in &mut self.tocs {
            toc.write_header(&mut header, 0)?;
        }

        let file = DeferredFile::create(path).map_err(|source| Error::OpenFailure {
            path: path.to_path_buf(),
            source,
        })?;
        let size = header.len();
        let mut op = file.execute_immediate(DeferredIo::write_at(0, header, IoTag::Untracked));
        if let Some(source) = op.take_error() {
            return Err(Error::OpenFailure {
                path: path.to_path_buf(),
                source,
            });
        }

        log::info!(
            "created container {} ({} TOCs, {} header bytes)",
            path.display(),
            self.tocs.len(),
            size
        );
        self.file = Some(file);
        self.state = ContainerState::Open;
        Ok(())
    }

    /// Open an existing container read-only.
    pub fn open(&mut self, path: impl AsRef<Path>, registry: &TocRegistry) -> Result<()> {
        self.open_with(path.as_ref(), registry, false)
    }

    /// Open an existing container for reading and appending chunks.
    pub fn open_for_update(&mut self, path: impl AsRef<Path>, registry: &TocRegistry) -> Result<()> {
        self.open_with(path.as_ref(), registry, true)
    }

    fn open_with(&mut self, path: &Path, registry: &TocRegistry, writable: bool) -> Result<()> {
        if self.state != ContainerState::Closed {
            return Err(Error::InvalidState(format!("open in state {:?}", self.state)));
        }
        if !self.tocs.is_empty() {
            return Err(Error::InvalidState("open rebuilds TOCs from the file; none may be registered".into()));
        }

        let file = DeferredFile::open(path, writable).map_err(|source| Error::OpenFailure {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tocs = read_header(&file, registry)?;
        for (index, toc) in tocs.iter_mut().enumerate() {
            toc.attach(TocId(index), self.config.heat);
        }

        log::info!(
            "opened container {} ({} TOCs{})",
            path.display(),
            tocs.len(),
            if writable { ", writable" } else { "" }
        );
        self.tocs = tocs;
        self.file = Some(file);
        self.state = ContainerState::Open;
        Ok(())
    }

    /// Start the I/O and deserializer threads.
    pub fn start_loader_threads(&mut self) -> Result<()> {
        match self.state {
            ContainerState::Active => return Ok(()),
            ContainerState::Open => {}
            state => return Err(Error::InvalidState(format!("start_loader_threads in state {:?}", state))),
        }
        let file = self.file.as_mut().ok_or_else(|| Error::InvalidState("no file".into()))?;
        file.start()?;
        match self.pipeline.activate(file.handle()) {
            Ok(handle) => self.deserializer = Some(handle),
            Err(e) => {
                file.stop();
                return Err(e.into());
            }
        }
        log::debug!("loader threads started");
        self.state = ContainerState::Active;
        Ok(())
    }

    /// Stop the worker threads after letting in-flight I/O finish. Chunks
    /// already read are still instated.
    pub fn stop_loader_threads(&mut self) -> Result<()> {
        if self.state != ContainerState::Active {
            return Ok(());
        }
        self.state = ContainerState::Draining;

        self.pipeline.deactivate();
        if let Some(handle) = self.deserializer.take() {
            if handle.join().is_err() {
                log::error!("deserializer thread panicked");
            }
        }

        let flushed = self.wait_for_pending_writes();
        if let Some(file) = self.file.as_mut() {
            file.stop();
        }

        let leftovers = self.pipeline.deserialize_leftovers();
        if leftovers > 0 {
            log::debug!("decoded {} reads left over at shutdown", leftovers);
        }
        self.mark_started_reads();
        let instated = instate_processed(&mut self.tocs, &self.pipeline);

        self.state = ContainerState::Open;
        log::debug!("loader threads stopped");
        flushed.and(instated)
    }

    // --- Tick ---

    /// Run a scheduler pass once at least the configured interval has
    /// accumulated.
    pub fn sync_threads(&mut self, dt: Duration) -> Result<()> {
        self.since_sync += dt;
        if self.since_sync < self.config.sync_interval() {
            return Ok(());
        }
        let elapsed = std::mem::take(&mut self.since_sync);
        self.sync_now(elapsed)
    }

    /// One scheduler pass: route finished writes, cool heat, rebuild the load
    /// queue and instate decoded chunks.
    pub fn sync_now(&mut self, elapsed: Duration) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        dispatch_completions(file, &mut self.tocs)?;

        let dt = elapsed.as_secs_f32();
        for toc in &mut self.tocs {
            toc.decay_heat(dt);
        }

        {
            let mut scheduler = self.pipeline.scheduler();
            for (id, stub) in scheduler.take_started() {
                if let Some(toc) = self.tocs.get_mut(id.index()) {
                    toc.on_chunk_read_started(stub);
                }
            }
            let per_toc = self.config.candidates_per_toc;
            let lists = self
                .tocs
                .iter_mut()
                .map(|toc| toc.recalculate_updates(per_toc))
                .collect();
            scheduler.rebuild(lists);
        }

        let instated = instate_processed(&mut self.tocs, &self.pipeline);
        self.pipeline.enqueue_next_pending_load(&file.handle());
        instated
    }

    fn mark_started_reads(&mut self) {
        for (id, stub) in self.pipeline.scheduler().take_started() {
            if let Some(toc) = self.tocs.get_mut(id.index()) {
                toc.on_chunk_read_started(stub);
            }
        }
    }

    // --- Blocking operations ---

    /// Block until every queued write has landed and its stub record has
    /// been rewritten.
    pub fn wait_for_pending_writes(&mut self) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let mut first_error = None;
        loop {
            file.wait_until_idle();
            if !file.has_completions() {
                break;
            }
            if let Err(e) = dispatch_completions(file, &mut self.tocs) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until every requested, written stub has been loaded.
    pub fn precache(&mut self) -> Result<()> {
        if self.state != ContainerState::Active {
            return Err(Error::InvalidState("precache needs running loader threads".into()));
        }
        let wait = self.config.precache_wait();
        loop {
            self.sync_now(Duration::ZERO)?;
            if self.pipeline.is_idle() {
                return Ok(());
            }
            self.pipeline.wait_for_progress(wait);
        }
    }

    // --- Lookup ---

    pub fn tocs(&self) -> &[Toc] {
        &self.tocs
    }

    pub fn toc(&self, id: TocId) -> Result<&Toc> {
        self.tocs.get(id.index()).ok_or_else(|| no_such_toc(id, self.tocs.len()))
    }

    pub fn toc_mut(&mut self, id: TocId) -> Result<&mut Toc> {
        let count = self.tocs.len();
        self.tocs.get_mut(id.index()).ok_or_else(|| no_such_toc(id, count))
    }

    /// The `slot`-th TOC of `kind`, in file order
    pub fn toc_by_slot(&self, kind: TocKind, slot: usize) -> Option<TocId> {
        self.tocs
            .iter()
            .enumerate()
            .filter(|(_, toc)| toc.kind() == kind)
            .nth(slot)
            .map(|(index, _)| TocId(index))
    }

    fn parts(&mut self, id: TocId) -> Result<(&DeferredFile, &mut Toc)> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::InvalidState("container is not open".into()))?;
        let count = self.tocs.len();
        let toc = self
            .tocs
            .get_mut(id.index())
            .ok_or_else(|| no_such_toc(id, count))?;
        Ok((file, toc))
    }

    // --- Per-TOC operations ---

    pub fn request_load(&mut self, toc: TocId, stub: usize, reason: LoadReason, priority: f32) -> Result<()> {
        self.toc_mut(toc)?.request_load(stub, reason, priority)
    }

    pub fn cancel_load_request(&mut self, toc: TocId, stub: usize, reason: LoadReason) -> Result<()> {
        let t = self.toc_mut(toc)?;
        t.cancel_load_request(stub, reason)?;
        if t.stub(stub).is_some_and(|s| s.requests.ref_count() == 0) {
            self.pipeline.forget(toc, stub);
        }
        Ok(())
    }

    pub fn immediate_load(&mut self, toc: TocId, stub: usize, reason: LoadReason) -> Result<()> {
        let (file, t) = self.parts(toc)?;
        t.immediate_load(file, stub, reason)
    }

    pub fn generate(&mut self, toc: TocId, region: RectI) -> Result<()> {
        let (file, t) = self.parts(toc)?;
        t.generate(file, region)
    }

    pub fn instate_new_chunk(&mut self, toc: TocId, stub: usize, chunk: Chunk, block: bool) -> Result<()> {
        let (file, t) = self.parts(toc)?;
        t.instate_new_chunk(file, stub, chunk, block)
    }

    pub fn add_config(&mut self, toc: TocId, name: &str, chunk: ConfigChunk) -> Result<usize> {
        let (file, t) = self.parts(toc)?;
        t.add_config(file, name, chunk)
    }

    pub fn config(&mut self, toc: TocId, name: &str) -> Result<Option<&ConfigChunk>> {
        let (file, t) = self.parts(toc)?;
        t.config(file, name)
    }

    /// Copy every written chunk of `src` into `dst_toc` of `dst`, which must
    /// share its layout. Returns the number of chunks copied.
    pub fn copy_chunks_to(&mut self, src: TocId, dst: &mut Container, dst_toc: TocId) -> Result<usize> {
        let (src_file, from) = self.parts(src)?;
        let (dst_file, to) = dst.parts(dst_toc)?;
        if from.kind() != to.kind() || from.stub_count() != to.stub_count() {
            return Err(Error::InvalidState(format!(
                "cannot copy {} ({} stubs) into {} ({} stubs)",
                from.type_name(),
                from.stub_count(),
                to.type_name(),
                to.stub_count()
            )));
        }

        let mut copied = 0;
        for stub in 0..from.stub_count() {
            if !from.stubs()[stub].is_written() {
                continue;
            }
            from.immediate_load(src_file, stub, LoadReason::Editor)?;
            let chunk = from.stubs()[stub]
                .chunk()
                .cloned()
                .ok_or_else(|| Error::InvalidState(format!("stub {} did not load", stub)))?;
            to.instate_new_chunk(dst_file, stub, chunk, true)?;
            from.purge(stub);
            to.purge(stub);
            copied += 1;
        }
        log::info!("copied {} chunks from {} to {}", copied, from.type_name(), to.type_name());
        Ok(copied)
    }

    // --- Diagnostics ---

    pub fn dump_load_queue(&self) {
        for toc in &self.tocs {
            log::info!(
                "{} ({}): {} stubs wanted",
                toc.type_name(),
                toc.id().map_or_else(|| "-".to_string(), |id| id.to_string()),
                toc.load_queue().len()
            );
        }
        let scheduler = self.pipeline.scheduler();
        for (i, c) in scheduler.queue().iter().enumerate() {
            log::info!(
                "  [{}] {} stub {} priority {} ({} bytes at {})",
                i,
                c.toc,
                c.stub,
                c.priority,
                c.length,
                c.offset
            );
        }
    }

    pub fn dump_stub_load_status(&self, toc: TocId, stub: usize) {
        if let Some(t) = self.tocs.get(toc.index()) {
            t.dump_stub_load_status(stub);
        }
    }

    /// Whether the load pipeline has nothing queued or in flight
    pub fn is_load_idle(&self) -> bool {
        self.pipeline.is_idle()
    }

    // --- Shutdown ---

    /// Stop threads, flush writes and drop the file and its TOCs.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ContainerState::Closed {
            return Ok(());
        }
        let stopped = self.stop_loader_threads();
        let flushed = self.wait_for_pending_writes();

        self.file = None;
        self.tocs.clear();
        self.pipeline.scheduler().clear();
        self.since_sync = Duration::ZERO;
        self.state = ContainerState::Closed;
        stopped.and(flushed)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("error closing container: {}", e);
        }
    }
}

fn no_such_toc(id: TocId, count: usize) -> Error {
    Error::InvalidState(format!("{} does not exist ({} TOCs)", id, count))
}

/// Hand parked write completions back to their TOCs. Every completion is
/// handled; the first failure is returned.
fn dispatch_completions(file: &DeferredFile, tocs: &mut [Toc]) -> Result<()> {
    let mut first_error = None;
    for mut op in file.sync() {
        let outcome = match op.tag().toc().and_then(|id| tocs.get_mut(id.index())) {
            Some(toc) => toc.handle_completion(file, op),
            None => match op.take_error() {
                Some(e) => {
                    log::error!("untracked write at offset {} failed: {}", op.offset(), e);
                    Err(e.into())
                }
                None => Ok(()),
            },
        };
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Instate every decoded chunk. All notes are handled; the first failure is returned.
fn instate_processed(tocs: &mut [Toc], pipeline: &LoadPipeline) -> Result<()> {
    let log_status = pipeline.config().log_stub_load_status;
    let mut first_error = None;

    for note in pipeline.take_processed() {
        let Some(toc) = tocs.get_mut(note.toc.index()) else {
            continue;
        };
        let (note_toc, stub) = (note.toc, note.stub);
        let outcome = note.into_outcome().and_then(|chunk| toc.on_chunk_read_complete(stub, chunk));
        match outcome {
            Ok(true) if log_status => toc.dump_stub_load_status(stub),
            Ok(_) => {}
            Err(e) => {
                log::error!("{}: load of stub {} failed: {}", toc.type_name(), stub, e);
                if e.is_corruption() {
                    toc.on_chunk_corrupt(stub);
                    pipeline.forget(note_toc, stub);
                } else {
                    toc.on_chunk_read_failed(stub);
                }
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Parse the container header, skipping TOCs whose type is not registered.
fn read_header(file: &DeferredFile, registry: &TocRegistry) -> Result<Vec<Toc>> {
    let file_len = file.stream_len()?;
    let mut stream = file.lock_stream();
    stream.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *stream);

    let mut magic = [0u8; 4];
    if file_len < 5 {
        return Err(Error::BadHeader {
            offset: 0,
            reason: format!("file of {} bytes is too short", file_len),
        });
    }
    reader.read_exact(&mut magic)?;
    if &magic != CONTAINER_MAGIC {
        return Err(Error::BadMagic { found: magic });
    }
    let count = read_u8(&mut reader)?;
    let mut position = 5u64;

    let mut tocs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_name = read_short_string(&mut reader)?;
        let size = read_u32(&mut reader)? as u64;
        position += 1 + type_name.len() as u64 + 4;
        let body_start = position;
        if body_start + size > file_len {
            return Err(Error::BadHeader {
                offset: body_start,
                reason: format!("{} declares {} bytes past end of file", type_name, size),
            });
        }

        let mut body = vec![0u8; size as usize];
        reader.read_exact(&mut body)?;
        position += size;

        match registry.resolve(&type_name) {
            Ok(kind) => {
                let toc = Toc::read_body(kind, type_name, &body, body_start)?;
                log::debug!(
                    "{}: depth {}, {} stubs",
                    toc.type_name(),
                    toc.tree_depth(),
                    toc.stub_count()
                );
                tocs.push(toc);
            }
            Err(e) => {
                log::warn!("skipping TOC: {} ({} bytes)", e, size);
            }
        }
    }
    Ok(tocs)
}
