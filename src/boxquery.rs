//! The box query engine: translate a logic box plus a resolution range
//! into an ordered stream of block queries, merge the results, refine
//! progressively.
//!
//! One query walks `begin → (execute → next)*`; every `execute` produces
//! the full result for the next resolution in `end_resolutions`. Blocks
//! are visited in strictly ascending id (which is ascending resolution),
//! and handles are awaited in issue order, so partial progress is
//! deterministic and monotonic no matter how the I/O pool interleaves.
//!
//! Progressive stages reuse the previous buffer: only blocks of levels
//! above the already-delivered resolution are read, and the coarser
//! samples are re-scattered into the finer lattice. When the field
//! declares an available filter the engine instead assembles every level
//! over a halo-enlarged box, runs the inverse filter, and crops — filter
//! inversion happens before any merge-mode policy is applied.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::access::Access;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::header::Field;
use crate::query::{Aborted, BlockQuery, MergeMode, QueryStatus};
use crate::space::{BoxN, LogicSamples, PointN};

/// Block reads kept in flight per query.
const MAX_INFLIGHT: usize = 32;
/// Minimum delay between two incremental publishes.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Hook receiving `(lattice, partial buffer)` snapshots during a stage.
pub type PublishHook = Box<dyn FnMut(&LogicSamples, &[u8]) + Send>;

// ── BoxQuery ─────────────────────────────────────────────────────────────────

pub struct BoxQuery {
    pub field:            Field,
    pub time:             f64,
    pub logic_box:        BoxN,
    pub merge_mode:       MergeMode,
    pub start_resolution: u32,
    /// Strictly ascending stage list; empty means "max resolution only".
    pub end_resolutions:  Vec<u32>,
    pub aborted:          Aborted,
    pub incremental_publish: Option<PublishHook>,

    status:         QueryStatus,
    stage:          usize,
    cur_resolution: Option<u32>,
    logic_samples:  Option<LogicSamples>,
    buffer:         Vec<u8>,
    written:        Vec<bool>,
    /// Block ids whose read or write failed non-fatally this query.
    pub failed_blocks:  Vec<u64>,
    /// A filter is declared but unavailable; results were produced
    /// without filter inversion.
    pub filter_skipped: bool,
}

impl std::fmt::Debug for BoxQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxQuery")
            .field("field", &self.field.name)
            .field("time", &self.time)
            .field("logic_box", &self.logic_box)
            .field("status", &self.status)
            .field("cur_resolution", &self.cur_resolution)
            .finish_non_exhaustive()
    }
}

impl BoxQuery {
    pub fn new(field: Field, time: f64, logic_box: BoxN) -> BoxQuery {
        BoxQuery {
            field,
            time,
            logic_box,
            merge_mode: MergeMode::default(),
            start_resolution: 0,
            end_resolutions: Vec::new(),
            aborted: Aborted::new(),
            incremental_publish: None,
            status: QueryStatus::Created,
            stage: 0,
            cur_resolution: None,
            logic_samples: None,
            buffer: Vec::new(),
            written: Vec::new(),
            failed_blocks: Vec::new(),
            filter_skipped: false,
        }
    }

    /// Single-stage resolution range.
    pub fn set_resolution_range(&mut self, start: u32, end: u32) {
        self.start_resolution = start;
        self.end_resolutions = vec![end];
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Highest resolution fully delivered so far.
    pub fn current_resolution(&self) -> Option<u32> {
        self.cur_resolution
    }

    pub fn logic_samples(&self) -> Option<&LogicSamples> {
        self.logic_samples.as_ref()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Stage the samples a write query will store; sized for the lattice
    /// at the single end resolution.
    pub fn set_buffer(&mut self, buffer: Vec<u8>) {
        self.buffer = buffer;
    }

    fn publish(&mut self, last: &mut Instant, ls: &LogicSamples, buf: &[u8], force: bool) {
        if let Some(hook) = self.incremental_publish.as_mut() {
            if force || last.elapsed() >= PUBLISH_INTERVAL {
                hook(ls, buf);
                *last = Instant::now();
            }
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

impl Dataset {
    /// Every second stage from `start` up to and including `end`; the
    /// usual progressive schedule when the caller has no better idea.
    pub fn guess_end_resolutions(&self, start: u32, end: u32) -> Vec<u32> {
        let mut out: Vec<u32> = (start..=end).rev().step_by(2).collect();
        out.reverse();
        out
    }

    /// Validate the query and arm its stage list.
    pub fn begin_box_query(&self, q: &mut BoxQuery) -> Result<()> {
        if q.status != QueryStatus::Created {
            return Err(Error::OutOfRange("query was already begun".into()));
        }
        let header = self.header();

        // The header's own field definition is authoritative.
        let field = header.field_by_name(&q.field.name)?.clone();
        q.field = field;
        header.check_time(q.time)?;

        if q.logic_box.is_empty() || !header.logic_box.contains_box(&q.logic_box) {
            return Err(Error::OutOfRange(format!(
                "query box {:?} outside the dataset box {:?}",
                q.logic_box, header.logic_box
            )));
        }

        if q.end_resolutions.is_empty() {
            q.end_resolutions = vec![header.max_h()];
        }
        let ok_order = q.end_resolutions.windows(2).all(|w| w[0] < w[1]);
        let last = *q.end_resolutions.last().unwrap();
        if !ok_order || last > header.max_h() || q.start_resolution > q.end_resolutions[0] {
            return Err(Error::OutOfRange(format!(
                "bad resolution range {:?} (max_h {})",
                q.end_resolutions,
                header.max_h()
            )));
        }

        q.filter_skipped = q.field.filter_unavailable();
        q.status = QueryStatus::Running;
        q.stage = 0;
        Ok(())
    }

    /// Perform the work for the next resolution in the stage list.
    pub fn execute_box_query(&self, access: &Arc<Access>, q: &mut BoxQuery) -> Result<()> {
        if q.status != QueryStatus::Running {
            return Err(Error::OutOfRange("query is not running".into()));
        }
        let h_target = *q
            .end_resolutions
            .get(q.stage)
            .ok_or_else(|| Error::OutOfRange("query stages are exhausted".into()))?;
        if q.aborted.get() {
            q.status = QueryStatus::Aborted;
            return Err(Error::Aborted);
        }

        let header = self.header();
        let dtype_size = q.field.dtype.size();
        let filter = if q.filter_skipped { None } else { q.field.parsed_filter() };

        // Filtered reads assemble a halo around the requested box so the
        // inverse kernel has its sliding window everywhere.
        let assembly_box = match &filter {
            Some(f) => {
                let mut halo = PointN::zero(header.bitmask.pdim());
                for i in 0..halo.pdim() {
                    halo[i] = (f.window as i64) << (header.max_h() - h_target).min(62);
                }
                q.logic_box.enlarge_clamped(&halo, &header.logic_box)
            }
            None => q.logic_box,
        };
        let ls = header
            .bitmask
            .samples_at_level(h_target, &assembly_box, &header.logic_box)
            .ok_or_else(|| Error::OutOfRange("no samples in the query box".into()))?;

        // Carry the previous stage forward unless a filter forces a full
        // reassembly of every level.
        let carry = filter.is_none();
        let h_from = match (q.cur_resolution, carry) {
            (Some(prev), true) => prev + 1,
            _ => 0,
        };

        let mut buffer = vec![0u8; ls.total() * dtype_size];
        let mut written = vec![false; ls.total()];
        if carry {
            if let Some(prev_ls) = q.logic_samples {
                scatter_lattice(&prev_ls, &q.buffer, &ls, &mut buffer, &mut written, dtype_size);
            }
        }

        let blocks = self.blocks_for_levels(&ls.logic_box, h_from, h_target);
        debug!(
            field = %q.field.name,
            h_target,
            nblocks = blocks.len(),
            "executing box query stage"
        );

        let mut last_publish =
            Instant::now().checked_sub(PUBLISH_INTERVAL).unwrap_or_else(Instant::now);
        let mut pending: VecDeque<(u64, crate::pool::Handle<BlockQuery>)> = VecDeque::new();
        let mut iter = blocks.into_iter();
        let mut attempted = 0u64;
        let mut succeeded = 0u64;
        let mut first_error: Option<Error> = None;
        let mut aborted = false;

        loop {
            // Keep the window full; stop feeding once aborted.
            while pending.len() < MAX_INFLIGHT && !aborted {
                if q.aborted.get() {
                    aborted = true;
                    break;
                }
                match iter.next() {
                    Some(k) => {
                        let (a1, a2) = header.bitmask.block_range(k, header.bitsperblock);
                        let bq =
                            BlockQuery::new(q.field.clone(), q.time, a1, a2, q.aborted.clone());
                        attempted += 1;
                        pending.push_back((k, access.read_block(bq)));
                    }
                    None => break,
                }
            }
            let Some((k, handle)) = pending.pop_front() else { break };
            let bq = handle.wait().unwrap_or_else(|| {
                let mut dead =
                    BlockQuery::new(q.field.clone(), q.time, 0, 1, q.aborted.clone());
                dead.fail(Error::Io(std::io::Error::other("i/o worker died")));
                dead
            });
            match bq.status {
                QueryStatus::Ok => {
                    succeeded += 1;
                    if !bq.was_hole {
                        self.merge_block(&bq, k, &ls, &mut buffer, &mut written, q.merge_mode);
                        q.publish(&mut last_publish, &ls, &buffer, false);
                    }
                }
                _ => match bq.error {
                    Some(Error::Aborted) => aborted = true,
                    Some(e) if e.is_fatal() => {
                        q.status = QueryStatus::Failed;
                        return Err(e);
                    }
                    Some(e) => {
                        q.failed_blocks.push(k);
                        first_error.get_or_insert(e);
                    }
                    None => q.failed_blocks.push(k),
                },
            }
            if q.aborted.get() {
                aborted = true;
            }
        }

        if aborted {
            // Keep the partial stage buffer; cur_resolution stays behind
            // the target.
            q.buffer = buffer;
            q.written = written;
            q.logic_samples = Some(ls);
            q.status = QueryStatus::Aborted;
            return Err(Error::Aborted);
        }
        if attempted > 0 && succeeded == 0 {
            q.status = QueryStatus::Failed;
            return Err(first_error.unwrap_or(Error::NotFound));
        }

        let (mut ls, mut buffer, mut written) = (ls, buffer, written);
        if let Some(f) = filter {
            // Inversion runs on the halo lattice before any merge-mode
            // policy sees the samples.
            f.inverse(&mut buffer, q.field.dtype, &ls.nsamples);
            let target = header
                .bitmask
                .samples_at_level(h_target, &q.logic_box, &header.logic_box)
                .ok_or_else(|| Error::OutOfRange("no samples in the query box".into()))?;
            let (cropped, cropped_written) =
                crop_lattice(&ls, &buffer, &written, &target, dtype_size);
            ls = target;
            buffer = cropped;
            written = cropped_written;
        }

        if q.merge_mode == MergeMode::InterpolateSamples && h_target < header.max_h() {
            self.interpolate_fill(&ls, &mut buffer, &written, h_target, dtype_size);
        }

        q.publish(&mut last_publish, &ls, &buffer, true);
        q.buffer = buffer;
        q.written = written;
        q.logic_samples = Some(ls);
        q.cur_resolution = Some(h_target);
        Ok(())
    }

    /// Advance to the next stage; `false` when the list is exhausted (the
    /// query is then `Ok`).
    pub fn next_box_query(&self, q: &mut BoxQuery) -> bool {
        if q.status != QueryStatus::Running {
            return false;
        }
        q.stage += 1;
        if q.stage >= q.end_resolutions.len() {
            q.status = QueryStatus::Ok;
            return false;
        }
        true
    }

    /// Write the query buffer (sized for its lattice at the single target
    /// resolution) through `access`, read-modifying partially covered
    /// blocks.
    pub fn execute_box_query_write(&self, access: &Arc<Access>, q: &mut BoxQuery) -> Result<()> {
        if q.status != QueryStatus::Running {
            return Err(Error::OutOfRange("query is not running".into()));
        }
        if q.end_resolutions.len() != 1 {
            return Err(Error::OutOfRange(
                "write queries take exactly one end resolution".into(),
            ));
        }
        let h = q.end_resolutions[0];
        let header = self.header();
        let dtype_size = q.field.dtype.size();
        let ls = header
            .bitmask
            .samples_at_level(h, &q.logic_box, &header.logic_box)
            .ok_or_else(|| Error::OutOfRange("no samples in the query box".into()))?;
        if q.buffer.len() != ls.total() * dtype_size {
            return Err(Error::OutOfRange(format!(
                "write buffer holds {} bytes, the lattice needs {}",
                q.buffer.len(),
                ls.total() * dtype_size
            )));
        }

        // Forward filtering happens on the staged buffer; it needs the
        // whole refinement pyramid below it, hence max resolution only.
        let staged: Vec<u8> = match q.field.parsed_filter() {
            Some(f) => {
                if h != header.max_h() {
                    return Err(Error::OutOfRange(
                        "writes to filtered fields must target max resolution".into(),
                    ));
                }
                let mut copy = q.buffer.clone();
                f.forward(&mut copy, q.field.dtype, &ls.nsamples);
                copy
            }
            None => {
                q.filter_skipped = q.field.filter_unavailable();
                q.buffer.clone()
            }
        };

        let blocks = self.blocks_for_levels(&ls.logic_box, 0, h);
        let mut handles: VecDeque<(u64, crate::pool::Handle<BlockQuery>)> = VecDeque::new();
        let mut first_error: Option<Error> = None;
        let mut attempted = 0u64;
        let mut succeeded = 0u64;

        for k in blocks {
            if q.aborted.get() {
                break;
            }
            let (a1, a2) = header.bitmask.block_range(k, header.bitsperblock);
            let block_ls = self.block_samples(k);
            let mut bq = BlockQuery::new(q.field.clone(), q.time, a1, a2, q.aborted.clone());

            attempted += 1;
            let fully_covered = ls.logic_box.contains_box(&block_ls.logic_box);
            if fully_covered {
                bq.allocate_buffer();
            } else {
                // Read-modify-write for blocks the box only grazes.
                match access.read_sync(&mut bq) {
                    Ok(()) | Err(Error::NotFound) => bq.allocate_buffer(),
                    Err(e) => {
                        q.failed_blocks.push(k);
                        first_error.get_or_insert(e);
                        continue;
                    }
                }
            }

            // Gather samples from the staged buffer into hz order.
            for (offset, a) in (a1..a2).enumerate() {
                let p = self.point_of_hz(k, a);
                if ls.contains_sample(&p) {
                    let src = ls.index_of(&p) * dtype_size;
                    bq.buffer[offset * dtype_size..][..dtype_size]
                        .copy_from_slice(&staged[src..src + dtype_size]);
                }
            }
            handles.push_back((k, access.write_block(bq)));
        }

        for (k, handle) in handles {
            match handle.wait() {
                Some(bq) if bq.status == QueryStatus::Ok => succeeded += 1,
                Some(bq) => {
                    q.failed_blocks.push(k);
                    if let Some(e) = bq.error {
                        if e.is_fatal() {
                            q.status = QueryStatus::Failed;
                            return Err(e);
                        }
                        first_error.get_or_insert(e);
                    }
                }
                None => {
                    q.failed_blocks.push(k);
                }
            }
        }

        if q.aborted.get() {
            q.status = QueryStatus::Aborted;
            return Err(Error::Aborted);
        }
        if attempted > 0 && succeeded == 0 {
            q.status = QueryStatus::Failed;
            return Err(first_error.unwrap_or(Error::NotFound));
        }
        q.logic_samples = Some(ls);
        q.cur_resolution = Some(h);
        Ok(())
    }

    // ── internals ────────────────────────────────────────────────────────────

    /// Point of hz address `a`, using the block-0 table when possible.
    #[inline]
    fn point_of_hz(&self, block: u64, a: u64) -> PointN {
        if block == 0 {
            self.block0_points()[a as usize]
        } else {
            self.header().bitmask.hz_to_p(a)
        }
    }

    /// Ascending ids of the blocks holding levels `[h_from, h_to]` whose
    /// sample box intersects `bbox`.
    fn blocks_for_levels(&self, bbox: &BoxN, h_from: u32, h_to: u32) -> Vec<u64> {
        let header = self.header();
        let bpb = header.bitsperblock;
        let mut out = Vec::new();
        if h_from <= bpb.min(h_to) {
            out.push(0);
        }
        for h in (bpb + 1)..=h_to {
            if h < h_from {
                continue;
            }
            let k1 = 1u64 << (h - 1 - bpb);
            let k2 = 1u64 << (h - bpb);
            for k in k1..k2 {
                if self.block_box(k).intersects(bbox) {
                    out.push(k);
                }
            }
        }
        out
    }

    /// Scatter one completed block into the stage buffer.
    fn merge_block(
        &self,
        bq: &BlockQuery,
        block: u64,
        ls: &LogicSamples,
        buffer: &mut [u8],
        written: &mut [bool],
        merge_mode: MergeMode,
    ) {
        let dtype_size = bq.field.dtype.size();
        for (offset, a) in (bq.a1..bq.a2).enumerate() {
            let p = self.point_of_hz(block, a);
            if !ls.contains_sample(&p) {
                continue;
            }
            let dst = ls.index_of(&p);
            let keep_existing = matches!(
                merge_mode,
                MergeMode::InsertSamples | MergeMode::InterpolateSamples
            );
            if keep_existing && written[dst] {
                continue;
            }
            buffer[dst * dtype_size..][..dtype_size]
                .copy_from_slice(&bq.buffer[offset * dtype_size..][..dtype_size]);
            written[dst] = true;
        }
    }

    /// Fill unassigned positions from the nearest coarser sample present.
    fn interpolate_fill(
        &self,
        ls: &LogicSamples,
        buffer: &mut [u8],
        written: &[bool],
        h_target: u32,
        dtype_size: usize,
    ) {
        let bitmask = &self.header().bitmask;
        for idx in 0..ls.total() {
            if written[idx] {
                continue;
            }
            let p = ls.point_of(idx);
            for h in (0..h_target).rev() {
                let delta = bitmask.level_delta(h);
                let mut src = p;
                for i in 0..src.pdim() {
                    src[i] = p[i].div_euclid(delta[i]) * delta[i];
                }
                if src == p || !ls.contains_sample(&src) {
                    continue;
                }
                let s = ls.index_of(&src);
                if written[s] {
                    let (dst_off, src_off) = (idx * dtype_size, s * dtype_size);
                    buffer.copy_within(src_off..src_off + dtype_size, dst_off);
                    break;
                }
            }
        }
    }
}

// ── lattice plumbing ─────────────────────────────────────────────────────────

/// Copy every sample of `src` that also belongs to `dst`, marking it
/// written.
fn scatter_lattice(
    src_ls: &LogicSamples,
    src: &[u8],
    dst_ls: &LogicSamples,
    dst: &mut [u8],
    written: &mut [bool],
    dtype_size: usize,
) {
    for idx in 0..src_ls.total() {
        let p = src_ls.point_of(idx);
        if dst_ls.contains_sample(&p) {
            let d = dst_ls.index_of(&p);
            dst[d * dtype_size..][..dtype_size]
                .copy_from_slice(&src[idx * dtype_size..][..dtype_size]);
            written[d] = true;
        }
    }
}

/// Re-window a buffer onto a sub-lattice, carrying the written mask.
fn crop_lattice(
    src_ls: &LogicSamples,
    src: &[u8],
    src_written: &[bool],
    dst_ls: &LogicSamples,
    dtype_size: usize,
) -> (Vec<u8>, Vec<bool>) {
    let mut out = vec![0u8; dst_ls.total() * dtype_size];
    let mut written = vec![false; dst_ls.total()];
    for idx in 0..dst_ls.total() {
        let p = dst_ls.point_of(idx);
        if src_ls.contains_sample(&p) {
            let s = src_ls.index_of(&p);
            out[idx * dtype_size..][..dtype_size]
                .copy_from_slice(&src[s * dtype_size..][..dtype_size]);
            written[idx] = src_written[s];
        }
    }
    (out, written)
}

// ── hz-order conversion ──────────────────────────────────────────────────────
//
// The `readbox` wire body carries samples in increasing hz order; these
// two functions convert between that order and row-major lattices.

/// Hz addresses of every sample of `ls`, ascending.
fn hz_order(dataset: &Dataset, ls: &LogicSamples) -> Vec<(u64, usize)> {
    let bitmask = &dataset.header().bitmask;
    let mut order: Vec<(u64, usize)> = (0..ls.total())
        .map(|idx| (bitmask.p_to_hz(&ls.point_of(idx)), idx))
        .collect();
    order.sort_unstable();
    order
}

/// Row-major lattice buffer → samples in increasing hz order.
pub fn hz_gather(dataset: &Dataset, ls: &LogicSamples, row_major: &[u8], dtype_size: usize) -> Vec<u8> {
    let order = hz_order(dataset, ls);
    let mut out = vec![0u8; row_major.len()];
    for (rank, (_, idx)) in order.iter().enumerate() {
        out[rank * dtype_size..][..dtype_size]
            .copy_from_slice(&row_major[idx * dtype_size..][..dtype_size]);
    }
    out
}

/// Samples in increasing hz order → row-major lattice buffer.
pub fn hz_scatter(dataset: &Dataset, ls: &LogicSamples, hz_ordered: &[u8], dtype_size: usize) -> Vec<u8> {
    let order = hz_order(dataset, ls);
    let mut out = vec![0u8; hz_ordered.len()];
    for (rank, (_, idx)) in order.iter().enumerate() {
        out[idx * dtype_size..][..dtype_size]
            .copy_from_slice(&hz_ordered[rank * dtype_size..][..dtype_size]);
    }
    out
}
