//! Query plan objects: the cooperative abort token, the block query (the
//! atomic unit of I/O), and the merge-mode vocabulary shared with the box
//! query engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::CodecTag;
use crate::error::Error;
use crate::header::Field;

// ── Aborted ──────────────────────────────────────────────────────────────────

/// Shared cancellation token. Checked between blocks, inside codec decode,
/// and on every HTTP chunk; setting it never interrupts an in-flight
/// syscall, it only stops further work.
#[derive(Clone, Debug, Default)]
pub struct Aborted(Arc<AtomicBool>);

impl Aborted {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── Status and merge mode ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Created,
    Running,
    Ok,
    Failed,
    /// Cancellation observed; box queries only — block queries report an
    /// abort as `Failed` with an `Aborted` error.
    Aborted,
}

/// How samples land in a box query's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Only assign positions not yet written at this stage.
    #[default]
    InsertSamples,
    /// Assign unconditionally.
    OverwriteSamples,
    /// Like insert, then fill unassigned positions from the nearest
    /// lower-resolution sample already present.
    InterpolateSamples,
}

// ── BlockQuery ───────────────────────────────────────────────────────────────

/// The atomic unit of I/O: one field, one time step, one contiguous hz
/// range, and (after a successful read) a buffer of samples in hz order.
#[derive(Debug)]
pub struct BlockQuery {
    pub field:   Field,
    pub time:    f64,
    pub a1:      u64,
    pub a2:      u64,
    pub aborted: Aborted,

    /// Overrides the field's default codec when set (the HTTP service
    /// passes the wire `compression=` through here).
    pub codec:    Option<CodecTag>,

    pub status:   QueryStatus,
    /// Allocated lazily to `nsamples * dtype.size()` bytes.
    pub buffer:   Vec<u8>,
    /// Set when the read completed against an absent block; the buffer is
    /// then all zeros.
    pub was_hole: bool,
    /// Populated if and only if `status == Failed`.
    pub error:    Option<Error>,
}

impl BlockQuery {
    pub fn new(field: Field, time: f64, a1: u64, a2: u64, aborted: Aborted) -> Self {
        debug_assert!(a1 < a2);
        Self {
            field,
            time,
            a1,
            a2,
            aborted,
            codec: None,
            status: QueryStatus::Created,
            buffer: Vec::new(),
            was_hole: false,
            error: None,
        }
    }

    /// The codec this query's payload travels in.
    pub fn effective_codec(&self) -> CodecTag {
        self.codec.unwrap_or_else(|| self.field.codec())
    }

    pub fn complete_ok(&mut self) {
        self.status = QueryStatus::Ok;
        self.error = None;
    }

    pub fn fail(&mut self, error: Error) {
        self.status = QueryStatus::Failed;
        self.error = Some(error);
    }

    #[inline]
    pub fn nsamples(&self) -> u64 {
        self.a2 - self.a1
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.nsamples() as usize * self.field.dtype.size()
    }

    /// Block id assuming the range is block-aligned.
    #[inline]
    pub fn block_id(&self, bitsperblock: u32) -> u64 {
        self.a1 >> bitsperblock
    }

    pub fn allocate_buffer(&mut self) {
        if self.buffer.is_empty() {
            self.buffer = vec![0u8; self.nbytes()];
        }
    }
}
