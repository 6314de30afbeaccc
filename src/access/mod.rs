//! The access layer: locate, read, write, and cache blocks.
//!
//! [`Access`] is a sealed set of variants — disk, RAM cache, mosaic,
//! multiplex, remote — behind one calling convention:
//!
//! - `begin_read` … `read_block`* … `end_read`
//! - `begin_write` … `write_block`* … `end_write`
//!
//! `read_block`/`write_block` submit to the shared I/O pool and return a
//! [`Handle`] the engine awaits in issue order. Session brackets are
//! enforced here at the public surface; the internal `*_sync` entry
//! points composite variants call on their children are bracket-free.
//!
//! Misses surface internally as `NotFound` and are translated at this
//! boundary into a zero-filled buffer with `was_hole` set, so callers
//! above never see a hole as an error. Transient I/O errors retry with
//! bounded exponential backoff before they are allowed to surface.

pub mod disk;
pub mod mosaic;
pub mod multiplex;
pub mod ram;
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::warn;

pub use disk::DiskAccess;
pub use mosaic::{MosaicAccess, MosaicPiece};
pub use multiplex::{MultiplexAccess, WritePolicy};
pub use ram::RamAccess;
pub use remote::{RemoteAccess, RemoteDataset};

use crate::cache::{IoCounters, OpenFileCache, DEFAULT_OPEN_FILES};
use crate::dataset::DatasetRegistry;
use crate::error::{Error, Result};
use crate::header::Field;
use crate::pool::{Handle, IoPool};
use crate::query::{BlockQuery, QueryStatus};

/// Bounded retry for transient failures: attempts after the first try.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_CAP: Duration = Duration::from_millis(100);

// ── IoContext ────────────────────────────────────────────────────────────────

/// The shared machinery every access needs, constructed once at program
/// start and threaded through explicitly.
#[derive(Debug)]
pub struct IoContext {
    pub pool:       Arc<IoPool>,
    pub file_cache: Arc<OpenFileCache>,
    pub counters:   Arc<IoCounters>,
    pub registry:   Arc<DatasetRegistry>,
}

impl IoContext {
    pub fn new() -> Arc<IoContext> {
        let counters = IoCounters::new();
        Arc::new(IoContext {
            pool:       IoPool::new(0),
            file_cache: OpenFileCache::new(DEFAULT_OPEN_FILES, Arc::clone(&counters)),
            counters,
            registry:   DatasetRegistry::new(),
        })
    }
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Statistics {
    pub rok:   AtomicU64,
    pub rfail: AtomicU64,
    pub wok:   AtomicU64,
    pub wfail: AtomicU64,
}

impl Statistics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.rok.load(Ordering::Relaxed),
            self.rfail.load(Ordering::Relaxed),
            self.wok.load(Ordering::Relaxed),
            self.wfail.load(Ordering::Relaxed),
        )
    }
}

// ── Access ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Idle,
    Read,
    Write,
}

#[derive(Debug)]
pub enum AccessKind {
    Disk(DiskAccess),
    Ram(RamAccess),
    Mosaic(MosaicAccess),
    Multiplex(MultiplexAccess),
    Remote(RemoteAccess),
}

#[derive(Debug)]
pub struct Access {
    kind:    AccessKind,
    ctx:     Arc<IoContext>,
    session: Mutex<Session>,
    stats:   Statistics,
    /// Back-reference handed to pool jobs so `read_block` can take `&self`.
    this:    Weak<Access>,
}

impl Access {
    pub fn new(ctx: &Arc<IoContext>, kind: AccessKind) -> Arc<Access> {
        Arc::new_cyclic(|this| Access {
            kind,
            ctx: Arc::clone(ctx),
            session: Mutex::new(Session::Idle),
            stats: Statistics::default(),
            this: this.clone(),
        })
    }

    pub fn kind(&self) -> &AccessKind {
        &self.kind
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn context(&self) -> &Arc<IoContext> {
        &self.ctx
    }

    // ── Session brackets ─────────────────────────────────────────────────────

    fn transition(&self, from: Session, to: Session, what: &'static str) -> Result<()> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if *session != from {
            return Err(Error::BadSession(what));
        }
        *session = to;
        Ok(())
    }

    fn children(&self) -> Vec<Arc<Access>> {
        match &self.kind {
            AccessKind::Multiplex(m) => m.children().to_vec(),
            AccessKind::Mosaic(m) => m.children(),
            _ => Vec::new(),
        }
    }

    pub fn begin_read(&self) -> Result<()> {
        self.transition(Session::Idle, Session::Read, "begin_read outside an idle session")?;
        for child in self.children() {
            child.begin_read()?;
        }
        Ok(())
    }

    pub fn end_read(&self) -> Result<()> {
        self.transition(Session::Read, Session::Idle, "end_read outside a read session")?;
        for child in self.children() {
            child.end_read()?;
        }
        Ok(())
    }

    pub fn begin_write(&self) -> Result<()> {
        self.transition(Session::Idle, Session::Write, "begin_write outside an idle session")?;
        for child in self.children() {
            child.begin_write()?;
        }
        Ok(())
    }

    pub fn end_write(&self) -> Result<()> {
        self.transition(Session::Write, Session::Idle, "end_write outside a write session")?;
        for child in self.children() {
            child.end_write()?;
        }
        Ok(())
    }

    fn in_session(&self, wanted: Session) -> bool {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) == wanted
    }

    // ── Block I/O ────────────────────────────────────────────────────────────

    /// Submit a block read; resolves to the completed query. Callable only
    /// inside a read session.
    pub fn read_block(&self, mut q: BlockQuery) -> Handle<BlockQuery> {
        if !self.in_session(Session::Read) {
            q.fail(Error::BadSession("read_block outside a read session"));
            return Handle::ready(q);
        }
        // The weak self always upgrades: `&self` proves an Arc is alive.
        let this = self.this.upgrade().expect("access outlives its jobs");
        self.ctx.pool.submit(move || this.read_job(q))
    }

    /// Submit a block write; the query's buffer holds the samples in hz
    /// order. Callable only inside a write session.
    pub fn write_block(&self, mut q: BlockQuery) -> Handle<BlockQuery> {
        if !self.in_session(Session::Write) {
            q.fail(Error::BadSession("write_block outside a write session"));
            return Handle::ready(q);
        }
        let this = self.this.upgrade().expect("access outlives its jobs");
        self.ctx.pool.submit(move || this.write_job(q))
    }

    fn read_job(&self, mut q: BlockQuery) -> BlockQuery {
        q.status = QueryStatus::Running;
        if q.aborted.get() {
            q.fail(Error::Aborted);
            return q;
        }
        match self.with_retry(&mut q, Access::read_sync) {
            Ok(()) => q.complete_ok(),
            Err(Error::NotFound) => {
                // A hole: success with zeros; the caller sees `was_hole`.
                q.buffer.clear();
                q.allocate_buffer();
                q.was_hole = true;
                self.stats.rok.fetch_add(1, Ordering::Relaxed);
                q.complete_ok();
            }
            Err(e) => q.fail(e),
        }
        q
    }

    fn write_job(&self, mut q: BlockQuery) -> BlockQuery {
        q.status = QueryStatus::Running;
        if q.aborted.get() {
            q.fail(Error::Aborted);
            return q;
        }
        match self.with_retry(&mut q, Access::write_sync) {
            Ok(()) => q.complete_ok(),
            Err(e) => q.fail(e),
        }
        q
    }

    fn with_retry(
        &self,
        q: &mut BlockQuery,
        op: fn(&Access, &mut BlockQuery) -> Result<()>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match op(self, q) {
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let backoff = RETRY_CAP.min(RETRY_BASE * 2u32.pow(attempt));
                    warn!(error = %e, attempt, "transient block i/o failure, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Variant dispatch, bracket-free: composite variants call this on
    /// their children from inside their own jobs. `Err(NotFound)` means
    /// miss/hole. Statistics are tallied here so that child accesses under
    /// a mosaic or multiplex count their own traffic; misses and aborts
    /// count as neither success nor failure.
    pub(crate) fn read_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let result = match &self.kind {
            AccessKind::Disk(a) => a.read_sync(&self.ctx, q),
            AccessKind::Ram(a) => a.read_sync(q),
            AccessKind::Mosaic(a) => a.read_sync(q),
            AccessKind::Multiplex(a) => a.read_sync(q),
            AccessKind::Remote(a) => a.read_sync(&self.ctx, q),
        };
        match &result {
            Ok(()) => self.stats.rok.fetch_add(1, Ordering::Relaxed),
            Err(Error::NotFound) | Err(Error::Aborted) => 0,
            Err(_) => self.stats.rfail.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub(crate) fn write_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let result = match &self.kind {
            AccessKind::Disk(a) => a.write_sync(&self.ctx, q),
            AccessKind::Ram(a) => a.write_sync(q),
            AccessKind::Mosaic(a) => a.write_sync(q),
            AccessKind::Multiplex(a) => a.write_sync(q),
            AccessKind::Remote(a) => a.write_sync(&self.ctx, q),
        };
        match &result {
            Ok(()) => self.stats.wok.fetch_add(1, Ordering::Relaxed),
            Err(Error::Aborted) => 0,
            Err(_) => self.stats.wfail.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// The block file a `(field, time, block)` triple resolves to, for the
    /// variants that have one.
    pub fn block_file_name(&self, field: &Field, time: f64, block: u64) -> Option<String> {
        match &self.kind {
            AccessKind::Disk(a) => a.block_file_name(&self.ctx, field, time, block),
            AccessKind::Mosaic(a) => a.block_file_name(field, time, block),
            AccessKind::Multiplex(a) => a
                .children()
                .iter()
                .find_map(|c| c.block_file_name(field, time, block)),
            _ => None,
        }
    }
}

