//! In-process block cache: strict LRU over `(field, time, block)` keys,
//! bounded by a byte budget rather than an entry count. Entries hold
//! decoded sample bytes; concurrent readers share them behind an `Arc`.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::access::{Access, AccessKind, IoContext};
use crate::error::{Error, Result};
use crate::query::BlockQuery;

type Key = (String, u64, u64); // (field name, time bits, first hz address)

struct RamState {
    entries:    LruCache<Key, Arc<Vec<u8>>>,
    used_bytes: usize,
}

pub struct RamAccess {
    budget_bytes: usize,
    state:        Mutex<RamState>,
}

impl std::fmt::Debug for RamAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamAccess")
            .field("budget_bytes", &self.budget_bytes)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

pub const DEFAULT_RAM_BUDGET: usize = 256 * 1024 * 1024;

impl RamAccess {
    pub fn create(ctx: &Arc<IoContext>, budget_bytes: usize) -> Arc<Access> {
        Access::new(ctx, AccessKind::Ram(RamAccess::with_budget(budget_bytes)))
    }

    pub(crate) fn with_budget(budget_bytes: usize) -> RamAccess {
        RamAccess {
            budget_bytes,
            state: Mutex::new(RamState { entries: LruCache::unbounded(), used_bytes: 0 }),
        }
    }

    fn key(q: &BlockQuery) -> Key {
        (q.field.name.clone(), q.time.to_bits(), q.a1)
    }

    pub(crate) fn read_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.entries.get(&Self::key(q)) {
            Some(entry) => {
                q.buffer = entry.as_ref().clone();
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Synchronous store; inserting past the budget evicts least-recently
    /// used entries until the cache fits again.
    pub(crate) fn write_sync(&self, q: &mut BlockQuery) -> Result<()> {
        if q.buffer.len() != q.nbytes() {
            return Err(Error::OutOfRange(format!(
                "cache store of {} bytes where the block holds {}",
                q.buffer.len(),
                q.nbytes()
            )));
        }
        let key = Self::key(q);
        let bytes = Arc::new(q.buffer.clone());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = state.entries.push(key, Arc::clone(&bytes)) {
            // push returns the displaced value for an existing key
            state.used_bytes -= old.1.len();
        }
        state.used_bytes += bytes.len();
        while state.used_bytes > self.budget_bytes {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.used_bytes -= evicted.len(),
                None => break,
            }
        }
        Ok(())
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::header::Field;
    use crate::query::Aborted;

    fn q(name: &str, a1: u64, fill: u8, len_samples: u64) -> BlockQuery {
        let mut q = BlockQuery::new(
            Field::new(name, DType::parse("u8").unwrap()),
            0.0,
            a1,
            a1 + len_samples,
            Aborted::new(),
        );
        q.buffer = vec![fill; len_samples as usize];
        q
    }

    #[test]
    fn store_then_hit() {
        let ram = RamAccess::with_budget(1024);
        let mut w = q("data", 0, 7, 16);
        ram.write_sync(&mut w).unwrap();

        let mut r = q("data", 0, 0, 16);
        r.buffer.clear();
        ram.read_sync(&mut r).unwrap();
        assert_eq!(r.buffer, vec![7u8; 16]);

        let mut miss = q("data", 16, 0, 16);
        miss.buffer.clear();
        assert!(matches!(ram.read_sync(&mut miss), Err(Error::NotFound)));
    }

    #[test]
    fn distinct_fields_do_not_collide() {
        let ram = RamAccess::with_budget(1024);
        ram.write_sync(&mut q("a", 0, 1, 16)).unwrap();
        ram.write_sync(&mut q("b", 0, 2, 16)).unwrap();
        let mut r = q("b", 0, 0, 16);
        ram.read_sync(&mut r).unwrap();
        assert_eq!(r.buffer[0], 2);
    }

    #[test]
    fn byte_budget_evicts_lru() {
        let ram = RamAccess::with_budget(48);
        ram.write_sync(&mut q("f", 0, 1, 16)).unwrap();
        ram.write_sync(&mut q("f", 16, 2, 16)).unwrap();
        ram.write_sync(&mut q("f", 32, 3, 16)).unwrap();
        assert_eq!(ram.used_bytes(), 48);
        // One more insert pushes out the oldest entry.
        ram.write_sync(&mut q("f", 48, 4, 16)).unwrap();
        assert_eq!(ram.used_bytes(), 48);
        let mut r = q("f", 0, 0, 16);
        assert!(matches!(ram.read_sync(&mut r), Err(Error::NotFound)));
        let mut r = q("f", 16, 0, 16);
        assert!(ram.read_sync(&mut r).is_ok());
    }

    #[test]
    fn rewrite_same_key_replaces() {
        let ram = RamAccess::with_budget(1024);
        ram.write_sync(&mut q("f", 0, 1, 16)).unwrap();
        ram.write_sync(&mut q("f", 0, 9, 16)).unwrap();
        assert_eq!(ram.used_bytes(), 16);
        let mut r = q("f", 0, 0, 16);
        ram.read_sync(&mut r).unwrap();
        assert_eq!(r.buffer, vec![9u8; 16]);
    }
}
