//! Tables of contents
//!
//! A [`Toc`] owns the stub array of one dataset. Quadtree TOCs hold a
//! complete tree of `tree_depth` levels; config TOCs hold a flat list of
//! named records. The TOC tracks load interest per stub, ranks candidates
//! for the container's scheduler, instates chunks handed back by the loader
//! and rebuilds interior levels from the leaves.

use std::io::Cursor;

use crate::core::config::HeatConfig;
use crate::core::error::Error;
use crate::core::types::{Result, TocId, UVec2};
use crate::math::{Aabb, RectI};
use crate::streaming::chunk::{self, Chunk, ChunkBody, ConfigChunk, GenerateParams};
use crate::streaming::disk_io::{DeferredFile, DeferredIo, IoTag};
use crate::streaming::format::{FORMAT_VERSION, read_u8, read_u32, write_short_string};
use crate::streaming::priority::{CandidateQueue, LoadReason, StubRank};
use crate::streaming::quadtree::{self, MAX_TREE_DEPTH};
use crate::streaming::registry::TocKind;
use crate::streaming::scheduler::LoadCandidate;
use crate::streaming::stub::{Stub, StubExtra, StubState};

/// Default vertex budget for generated geometry chunks
pub const DEFAULT_GOAL_BATCH_SIZE: u32 = 4096;

/// Snapshot of a TOC's stub states
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TocStats {
    pub stubs: usize,
    pub written: usize,
    pub pending: usize,
    pub loading: usize,
    pub loaded: usize,
    pub queued: usize,
}

/// One dataset inside a container
#[derive(Debug)]
pub struct Toc {
    id: Option<TocId>,
    kind: TocKind,
    type_name: String,
    tree_depth: u32,
    is_quadtree: bool,
    version: u32,
    goal_batch_size: u32,
    stubs: Vec<Stub>,
    /// Stubs with outstanding interest that may still need loading
    load_queue: Vec<usize>,
    heat: HeatConfig,
}

impl Toc {
    /// Quadtree TOC of `tree_depth` levels. Config kinds are rejected.
    pub fn new_quadtree(kind: TocKind, tree_depth: u32) -> Result<Self> {
        if !kind.is_quadtree() {
            return Err(Error::NotQuadtree);
        }
        if tree_depth == 0 || tree_depth > MAX_TREE_DEPTH {
            return Err(Error::InvalidState(format!(
                "tree depth {} outside 1..={}",
                tree_depth, MAX_TREE_DEPTH
            )));
        }

        let mut toc = Self::blank(kind, kind.default_type_name().to_string());
        toc.tree_depth = tree_depth;
        toc.stubs = (0..quadtree::node_count(tree_depth)).map(|_| Stub::new(kind)).collect();
        toc.assign_positions();
        Ok(toc)
    }

    /// Config TOC with `count` unnamed records
    pub fn new_config(count: usize) -> Self {
        let mut toc = Self::blank(TocKind::Config, TocKind::Config.default_type_name().to_string());
        toc.initialize_config(count);
        toc
    }

    fn blank(kind: TocKind, type_name: String) -> Self {
        Self {
            id: None,
            kind,
            type_name,
            tree_depth: 0,
            is_quadtree: kind.is_quadtree(),
            version: FORMAT_VERSION,
            goal_batch_size: DEFAULT_GOAL_BATCH_SIZE,
            stubs: Vec::new(),
            load_queue: Vec::new(),
            heat: HeatConfig::default(),
        }
    }

    /// Use a different header type name; it must resolve to this kind when reopened.
    pub fn with_type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = name.into();
        self
    }

    pub fn with_goal_batch_size(mut self, goal: u32) -> Self {
        self.goal_batch_size = goal;
        self
    }

    fn assign_positions(&mut self) {
        for (index, stub) in self.stubs.iter_mut().enumerate() {
            let (level, pos) = quadtree::node_position(index);
            stub.level = level;
            stub.pos = pos;
        }
    }

    pub(crate) fn attach(&mut self, id: TocId, heat: HeatConfig) {
        self.id = Some(id);
        self.heat = heat;
    }

    pub fn id(&self) -> Option<TocId> {
        self.id
    }

    fn require_id(&self) -> Result<TocId> {
        self.id
            .ok_or_else(|| Error::InvalidState("TOC is not registered with a container".into()))
    }

    pub fn kind(&self) -> TocKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn tree_depth(&self) -> u32 {
        self.tree_depth
    }

    pub fn is_quadtree(&self) -> bool {
        self.is_quadtree
    }

    /// Format version the stub table was read with
    pub fn format_version(&self) -> u32 {
        self.version
    }

    pub fn goal_batch_size(&self) -> u32 {
        self.goal_batch_size
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    pub fn stubs(&self) -> &[Stub] {
        &self.stubs
    }

    pub fn stub(&self, index: usize) -> Option<&Stub> {
        self.stubs.get(index)
    }

    fn stub_mut(&mut self, index: usize) -> Result<&mut Stub> {
        let count = self.stubs.len();
        self.stubs
            .get_mut(index)
            .ok_or(Error::InvalidStub { stub: index, count })
    }

    /// Linear index of the node at `(level, pos)`
    pub fn stub_index(&self, level: u32, pos: UVec2) -> Result<usize> {
        if !self.is_quadtree {
            return Err(Error::NotQuadtree);
        }
        let width = quadtree::level_width(level.min(31));
        if level >= self.tree_depth || pos.x >= width || pos.y >= width {
            return Err(Error::InvalidStub {
                stub: usize::MAX,
                count: self.stubs.len(),
            });
        }
        Ok(quadtree::node_index(level, pos))
    }

    pub fn stub_at(&self, level: u32, pos: UVec2) -> Result<&Stub> {
        let index = self.stub_index(level, pos)?;
        Ok(&self.stubs[index])
    }

    /// Leaf tiles along one side
    pub fn leaf_tiles(&self) -> u32 {
        quadtree::leaf_tiles(self.tree_depth)
    }

    pub fn load_queue(&self) -> &[usize] {
        &self.load_queue
    }

    pub fn stats(&self) -> TocStats {
        let mut stats = TocStats {
            stubs: self.stubs.len(),
            queued: self.load_queue.len(),
            ..Default::default()
        };
        for stub in &self.stubs {
            if stub.is_written() {
                stats.written += 1;
            }
            match stub.state {
                StubState::Unloaded => {}
                StubState::Pending => stats.pending += 1,
                StubState::Loading => stats.loading += 1,
                StubState::Loaded => stats.loaded += 1,
            }
        }
        stats
    }

    // --- Load interest ---

    /// Register interest in a stub. The first request queues it for loading.
    pub fn request_load(&mut self, stub: usize, reason: LoadReason, priority: f32) -> Result<()> {
        let on_request = self.heat.on_request;
        let s = self.stub_mut(stub)?;
        if s.requests.add(reason, priority) == 1 && s.state == StubState::Unloaded && !s.corrupt {
            s.state = StubState::Pending;
            s.heat += on_request;
            self.load_queue.push(stub);
        }
        Ok(())
    }

    /// Drop one request. When interest reaches zero the stub leaves the load
    /// queue and its chunk is purged.
    pub fn cancel_load_request(&mut self, stub: usize, reason: LoadReason) -> Result<()> {
        let s = self.stub_mut(stub)?;
        match s.requests.remove(reason) {
            None => {
                log::warn!("cancel of stub {} for {:?} without a matching request", stub, reason);
            }
            Some(0) => {
                self.load_queue.retain(|&i| i != stub);
                self.purge(stub);
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Up to `max_items` best candidates for loading, best first.
    ///
    /// Stubs already loading or holding a chunk leave the load queue. Stubs
    /// that were never written stay queued but are not offered.
    pub fn recalculate_updates(&mut self, max_items: usize) -> Vec<LoadCandidate> {
        let Some(toc) = self.id else {
            return Vec::new();
        };
        if self.load_queue.is_empty() {
            return Vec::new();
        }

        let stubs = &self.stubs;
        self.load_queue
            .retain(|&i| stubs[i].state <= StubState::Pending && !stubs[i].has_chunk() && !stubs[i].corrupt);

        let mut ranked = CandidateQueue::new();
        for &i in &self.load_queue {
            let stub = &mut self.stubs[i];
            stub.priority = stub.requests.cumulative_priority();
            if stub.is_written() {
                ranked.push(StubRank {
                    stub: i,
                    priority: stub.priority,
                    heat: stub.heat,
                });
            }
        }

        ranked
            .take_best(max_items)
            .into_iter()
            .map(|rank| {
                let stub = &self.stubs[rank.stub];
                LoadCandidate {
                    toc,
                    stub: rank.stub,
                    kind: self.kind,
                    offset: stub.offset,
                    length: stub.length,
                    priority: rank.priority,
                }
            })
            .collect()
    }

    /// Clamp and cool every stub's heat.
    pub fn decay_heat(&mut self, dt: f32) {
        let cap = self.heat.cap;
        for stub in &mut self.stubs {
            stub.decay_heat(cap, dt);
        }
    }

    // --- Loader callbacks ---

    /// A disk read for `stub` was issued.
    pub fn on_chunk_read_started(&mut self, stub: usize) {
        if let Some(s) = self.stubs.get_mut(stub) {
            if s.state == StubState::Pending {
                s.state = StubState::Loading;
            }
        }
    }

    /// A deserialized chunk arrived. Returns whether it was instated; loads
    /// for stubs that already hold a chunk or lost all interest are dropped.
    pub fn on_chunk_read_complete(&mut self, stub: usize, chunk: Chunk) -> Result<bool> {
        let count = self.stubs.len();
        let s = self.stubs.get_mut(stub).ok_or(Error::InvalidStub { stub, count })?;
        if s.has_chunk() {
            log::warn!(
                "{}: discarding already-loaded chunk ({} @ {}, {})",
                self.type_name, s.level, s.pos.x, s.pos.y
            );
            return Ok(false);
        }
        if s.requests.ref_count() == 0 {
            log::warn!(
                "{}: discarding cancelled chunk ({} @ {}, {})",
                self.type_name, s.level, s.pos.x, s.pos.y
            );
            if s.state == StubState::Loading {
                s.state = StubState::Unloaded;
            }
            return Ok(false);
        }

        self.instate_loaded_chunk(stub, chunk)?;
        Ok(true)
    }

    /// A read for `stub` failed or was abandoned; put it back in line if still wanted.
    pub fn on_chunk_read_failed(&mut self, stub: usize) {
        let Some(s) = self.stubs.get_mut(stub) else {
            return;
        };
        if s.has_chunk() || s.state == StubState::Loaded {
            return;
        }
        if s.requests.ref_count() > 0 {
            s.state = StubState::Pending;
            if !self.load_queue.contains(&stub) {
                self.load_queue.push(stub);
            }
        } else {
            s.state = StubState::Unloaded;
        }
    }

    /// The frame read for `stub` is corrupt. The stub leaves the load queue
    /// and is not offered again until a new chunk is written for it.
    pub fn on_chunk_corrupt(&mut self, stub: usize) {
        let Some(s) = self.stubs.get_mut(stub) else {
            return;
        };
        s.corrupt = true;
        if !s.has_chunk() {
            s.state = StubState::Unloaded;
        }
        self.load_queue.retain(|&i| i != stub);
    }

    /// Make `chunk` the stub's resident chunk, replacing any previous one.
    pub fn instate_loaded_chunk(&mut self, stub: usize, mut chunk: Chunk) -> Result<()> {
        let id = self.id;
        let heat = self.heat;
        let s = self.stub_mut(stub)?;
        s.purge(&heat);

        chunk.toc = id;
        chunk.process()?;
        if let ChunkBody::Geometry(geom) = &chunk.body {
            s.extra = StubExtra::Bounds(geom.effective_bounds());
        }

        s.state = StubState::Loaded;
        s.heat += heat.on_instate;
        s.set_chunk(chunk);
        Ok(())
    }

    /// Forcibly drop a stub's chunk.
    pub fn purge(&mut self, stub: usize) {
        let heat = self.heat;
        if let Some(s) = self.stubs.get_mut(stub) {
            s.purge(&heat);
        }
    }

    /// Drop every resident chunk.
    pub fn purge_all(&mut self) {
        let heat = self.heat;
        for s in &mut self.stubs {
            s.purge(&heat);
        }
        self.load_queue.clear();
    }

    // --- Writing ---

    /// Route a finished write back to its stub.
    pub fn handle_completion(&mut self, file: &DeferredFile, mut op: DeferredIo) -> Result<()> {
        match op.tag() {
            IoTag::ChunkWrite { stub, .. } => {
                if let Some(e) = op.take_error() {
                    log::error!("{}: chunk write for stub {} failed: {}", self.type_name, stub, e);
                    return Err(e.into());
                }
                self.on_chunk_write_complete(file, stub, op.offset(), op.length())
            }
            IoTag::StubWrite { stub, .. } => match op.take_error() {
                Some(e) => {
                    log::error!("{}: stub record write for stub {} failed: {}", self.type_name, stub, e);
                    Err(e.into())
                }
                None => Ok(()),
            },
            IoTag::Untracked => Ok(()),
        }
    }

    /// Record where a chunk landed and rewrite the stub's header record.
    pub fn on_chunk_write_complete(&mut self, file: &DeferredFile, stub: usize, offset: u64, length: u32) -> Result<()> {
        if offset == 0 {
            return Err(Error::InvalidState(format!("chunk for stub {} written at offset 0", stub)));
        }
        let s = self.stub_mut(stub)?;
        s.offset = offset;
        s.length = length;
        s.generation += 1;
        s.corrupt = false;
        self.queue_stub_update(file, stub)
    }

    /// Queue a rewrite of the stub's fixed-size header record.
    pub fn queue_stub_update(&self, file: &DeferredFile, stub: usize) -> Result<()> {
        let toc = self.require_id()?;
        let s = self.stubs.get(stub).ok_or(Error::InvalidStub {
            stub,
            count: self.stubs.len(),
        })?;
        if s.stub_offset == 0 {
            return Err(Error::InvalidState(format!(
                "stub {} has no header record; write the container header first",
                stub
            )));
        }

        let mut record = Vec::with_capacity(Stub::record_size(self.kind));
        s.write_record(&mut record, self.kind)?;
        file.queue(DeferredIo::write_at(s.stub_offset, record, IoTag::StubWrite { toc, stub }));
        Ok(())
    }

    /// Append the stub's resident chunk to the file.
    ///
    /// The frame's history back-offset is the stub's offset at queue time.
    /// A write queued before an earlier write to the same stub has completed
    /// links past that earlier frame; use `instate_new_chunk` with `block`
    /// to keep the history chain complete.
    pub fn queue_chunk_update(&mut self, file: &DeferredFile, stub: usize) -> Result<()> {
        let toc = self.require_id()?;
        if !file.is_writable() {
            return Err(Error::InvalidState("container is open read-only".into()));
        }
        let s = self.stub_mut(stub)?;
        let previous = s.offset;
        let resident = s
            .chunk_mut()
            .ok_or_else(|| Error::InvalidState(format!("stub {} has no chunk to write", stub)))?;
        resident.previous_offset = previous;

        let frame = chunk::prepare_write(resident)?;
        file.queue(DeferredIo::append(frame, IoTag::ChunkWrite { toc, stub }));
        Ok(())
    }

    /// Instate a new chunk and queue it for writing. With `block`, waits
    /// until the write has landed and the stub has been updated.
    pub fn instate_new_chunk(&mut self, file: &DeferredFile, stub: usize, chunk: Chunk, block: bool) -> Result<()> {
        let toc = self.require_id()?;
        if !file.is_writable() {
            return Err(Error::InvalidState("container is open read-only".into()));
        }
        if chunk.kind() != self.kind {
            return Err(Error::Payload(format!("cannot instate a {} chunk into a {}", chunk.kind(), self.kind)));
        }
        let generation = self.stub_mut(stub)?.generation;

        self.instate_loaded_chunk(stub, chunk)?;
        self.queue_chunk_update(file, stub)?;

        if block {
            loop {
                file.wait_until_idle();
                for op in file.drain_completed_matching(|tag| tag.toc() == Some(toc)) {
                    self.handle_completion(file, op)?;
                }
                if self.stubs[stub].generation != generation {
                    break;
                }
                if !file.has_pending_io() && !file.has_completions() {
                    return Err(Error::InvalidState(format!("write of stub {} never completed", stub)));
                }
            }
        }
        Ok(())
    }

    // --- Reading ---

    /// Read a stub's chunk on the calling thread and instate it, replacing
    /// any resident chunk.
    pub fn immediate_load(&mut self, file: &DeferredFile, stub: usize, reason: LoadReason) -> Result<()> {
        let s = self.stub_mut(stub)?;
        if !s.is_written() {
            return Err(Error::EmptyStub { toc: self.id, stub });
        }
        let (offset, length) = (s.offset, s.length);
        log::trace!("{}: immediate load of stub {} for {:?}", self.type_name, stub, reason);

        self.purge(stub);
        let frame = file.read_immediate(offset, length)?;
        let chunk = chunk::read_framed(self.kind, &frame, offset).inspect_err(|e| {
            log::error!("{}: stub {}: {}", self.type_name, stub, e);
        })?;
        self.instate_loaded_chunk(stub, chunk)
    }

    // --- Generation ---

    /// Rebuild every interior node whose children overlap `region`, given in
    /// leaf tiles, from the level above the leaves up to the root.
    ///
    /// Every child of a rebuilt node must already be written. For a partial
    /// region that includes the siblings outside it at each level, so a
    /// fresh tree needs one full generation first; otherwise this fails
    /// with `EmptyStub`.
    pub fn generate(&mut self, file: &DeferredFile, region: RectI) -> Result<()> {
        if !self.is_quadtree {
            return Err(Error::NotQuadtree);
        }
        if self.tree_depth < 2 || region.is_empty() {
            return Ok(());
        }

        let params = GenerateParams {
            goal_batch_size: self.goal_batch_size,
        };

        for shift in (0..=self.tree_depth - 2).rev() {
            let span = 1u32 << (self.tree_depth - (shift + 1));
            let (xs, ys) = region.cell_span(span, quadtree::level_width(shift));
            log::info!(
                "{}: generating level {} ({} x {} nodes)",
                self.type_name,
                shift,
                xs.len(),
                ys.len()
            );

            for x in xs {
                for y in ys.clone() {
                    self.generate_node(file, shift, UVec2::new(x, y), &params)?;
                }
            }
        }
        Ok(())
    }

    fn generate_node(&mut self, file: &DeferredFile, level: u32, pos: UVec2, params: &GenerateParams) -> Result<()> {
        let children = quadtree::children(level, pos).map(|(l, p)| quadtree::node_index(l, p));
        log::debug!(
            " generating ({} @ {}, {}) from {:?}",
            level,
            pos.x,
            pos.y,
            quadtree::children(level, pos).map(|(_, p)| (p.x, p.y))
        );

        for &child in &children {
            self.immediate_load(file, child, LoadReason::Editor)?;
        }

        let parent = {
            let kids = children.map(|i| self.stubs[i].chunk());
            let [Some(a), Some(b), Some(c), Some(d)] = kids else {
                return Err(Error::InvalidState("child chunk missing after load".into()));
            };
            Chunk::generate(self.kind, [a, b, c, d], params)?
        };

        let index = quadtree::node_index(level, pos);
        self.instate_new_chunk(file, index, parent, true)?;

        self.purge(index);
        for child in children {
            self.purge(child);
        }
        Ok(())
    }

    // --- Config records ---

    /// Reset to `count` unnamed, unwritten records.
    pub fn initialize_config(&mut self, count: usize) {
        self.tree_depth = 0;
        self.is_quadtree = false;
        self.load_queue.clear();
        self.stubs = (0..count)
            .map(|_| {
                let mut stub = Stub::new(TocKind::Config);
                stub.level = u32::MAX;
                stub
            })
            .collect();
    }

    /// Index of the record called `name`
    pub fn find_config(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        self.stubs.iter().position(|s| s.name() == Some(name))
    }

    /// Store `chunk` under `name` in the first free record, writing it
    /// synchronously. Returns the record index.
    pub fn add_config(&mut self, file: &DeferredFile, name: &str, chunk: ConfigChunk) -> Result<usize> {
        if self.kind != TocKind::Config {
            return Err(Error::Config(format!("{} cannot hold config records", self.kind)));
        }
        if name.is_empty() || name.len() > crate::streaming::registry::CONFIG_NAME_LEN {
            return Err(Error::Config(format!("invalid config name '{}'", name)));
        }
        if self.find_config(name).is_some() {
            return Err(Error::Config(format!("config '{}' already exists", name)));
        }
        let slot = self
            .stubs
            .iter()
            .position(|s| s.name() == Some(""))
            .ok_or_else(|| Error::Config("no free config records".into()))?;

        self.stubs[slot].extra = StubExtra::Name(name.to_string());
        self.instate_new_chunk(file, slot, Chunk::config(chunk), true)?;
        Ok(slot)
    }

    /// The config record called `name`, loading it if necessary.
    pub fn config(&mut self, file: &DeferredFile, name: &str) -> Result<Option<&ConfigChunk>> {
        let Some(slot) = self.find_config(name) else {
            return Ok(None);
        };
        if !self.stubs[slot].has_chunk() {
            self.immediate_load(file, slot, LoadReason::Editor)?;
        }
        Ok(self.stubs[slot].chunk().and_then(Chunk::as_config))
    }

    // --- Copying ---

    /// Take stub layout and kind parameters from `src`. Chunks, file
    /// locations and load state are not copied.
    pub fn copy_from_toc(&mut self, src: &Toc) -> Result<()> {
        if src.kind != self.kind {
            return Err(Error::InvalidState(format!("cannot copy a {} into a {}", src.kind, self.kind)));
        }
        self.version = FORMAT_VERSION;
        self.tree_depth = src.tree_depth;
        self.is_quadtree = src.is_quadtree;
        self.goal_batch_size = src.goal_batch_size;
        self.stubs = src.stubs.iter().map(Stub::layout_copy).collect();
        self.load_queue.clear();
        Ok(())
    }

    // --- Header serialization ---

    /// Append this TOC's header entry to `out`, whose first byte sits at
    /// file offset `base`. Records each stub's `stub_offset`.
    pub(crate) fn write_header(&mut self, out: &mut Vec<u8>, base: u64) -> Result<()> {
        write_short_string(out, &self.type_name)?;
        let body_start = base + out.len() as u64 + 4;
        let body = self.encode_body(body_start)?;
        let size = u32::try_from(body.len())
            .map_err(|_| Error::InvalidState(format!("TOC header of {} bytes is too large", body.len())))?;
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(())
    }

    fn encode_body(&mut self, body_start: u64) -> Result<Vec<u8>> {
        let count = u32::try_from(self.stubs.len())
            .map_err(|_| Error::InvalidState("too many stubs".into()))?;
        let mut body = Vec::with_capacity(9 + self.stubs.len() * Stub::record_size(self.kind) + 4);
        body.push(self.tree_depth as u8);
        body.extend_from_slice(&count.to_le_bytes());
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

        for stub in &mut self.stubs {
            stub.stub_offset = body_start + body.len() as u64;
            stub.write_record(&mut body, self.kind)?;
        }

        if self.kind == TocKind::Geometry {
            body.extend_from_slice(&self.goal_batch_size.to_le_bytes());
        }
        Ok(body)
    }

    /// Parse a TOC body of `kind` that starts at file offset `body_start`.
    pub(crate) fn read_body(kind: TocKind, type_name: String, body: &[u8], body_start: u64) -> Result<Self> {
        let bad = |reason: String| Error::BadHeader {
            offset: body_start,
            reason: format!("{}: {}", type_name, reason),
        };
        let mut input = Cursor::new(body);

        let tree_depth = read_u8(&mut input)? as u32;
        let count = read_u32(&mut input)? as usize;
        let version = read_u32(&mut input)?;

        if kind.is_quadtree() {
            if tree_depth == 0 || tree_depth > MAX_TREE_DEPTH {
                return Err(bad(format!("tree depth {} outside 1..={}", tree_depth, MAX_TREE_DEPTH)));
            }
            if count != quadtree::node_count(tree_depth) {
                return Err(bad(format!("{} stubs for a depth-{} tree", count, tree_depth)));
            }
        }
        let needed = count.saturating_mul(Stub::record_size(kind));
        if needed > body.len() {
            return Err(bad(format!("{} stubs do not fit in {} bytes", count, body.len())));
        }

        let mut toc = Self::blank(kind, type_name.clone());
        toc.tree_depth = tree_depth;
        toc.version = version;
        toc.stubs.reserve(count);
        for _ in 0..count {
            let record_at = body_start + input.position();
            let mut stub = Stub::read_record(&mut input, kind)?;
            stub.stub_offset = record_at;
            toc.stubs.push(stub);
        }

        if kind.is_quadtree() {
            toc.assign_positions();
        } else {
            for stub in &mut toc.stubs {
                stub.level = u32::MAX;
            }
        }
        if kind == TocKind::Geometry {
            toc.goal_batch_size = read_u32(&mut input)?;
        }

        let consumed = input.position() as usize;
        if consumed != body.len() {
            log::warn!(
                "{}: {} trailing header bytes ignored",
                toc.type_name,
                body.len() - consumed
            );
        }
        Ok(toc)
    }

    // --- Diagnostics ---

    pub fn dump_stub_load_status(&self, stub: usize) {
        let Some(s) = self.stubs.get(stub) else {
            log::warn!("{}: no stub {}", self.type_name, stub);
            return;
        };
        log::info!(
            "  {} - priority {}, pos = {}@({}, {}), refCount={}",
            self.type_name,
            s.requests.cumulative_priority(),
            s.level,
            s.pos.x,
            s.pos.y,
            s.requests.ref_count()
        );
    }

    /// Union of the stored bounds of every geometry stub
    pub fn bounds(&self) -> Option<Aabb> {
        if self.kind != TocKind::Geometry {
            return None;
        }
        let merged = self
            .stubs
            .iter()
            .filter_map(Stub::bounds)
            .fold(Aabb::EMPTY, |acc, b| acc.merged(&b));
        (!merged.is_empty()).then_some(merged)
    }
}
