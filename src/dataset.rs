//! Open datasets and the registry that hands them to accesses.
//!
//! A [`Dataset`] is a validated [`DatasetHeader`] plus the tables that are
//! worth paying for exactly once at open time — most importantly the
//! explicit `(hz → point)` table for block 0, whose samples span several
//! coarse levels and do not form a regular stride.
//!
//! Accesses never hold a `Dataset` pointer; they hold a [`DatasetId`] and
//! resolve it through a [`DatasetRegistry`], which keeps the coupling
//! acyclic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::header::DatasetHeader;
use crate::space::{BoxN, LogicSamples, PointN};

// ── DatasetId ────────────────────────────────────────────────────────────────

/// Opaque handle identifying one open dataset within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetId(Uuid);

impl DatasetId {
    fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Dataset ──────────────────────────────────────────────────────────────────

/// An open dataset: immutable after construction.
#[derive(Debug)]
pub struct Dataset {
    id:       DatasetId,
    header:   DatasetHeader,
    /// Directory block file paths are resolved against; `None` for
    /// datasets that never touch the local filesystem (remote).
    base_dir: Option<PathBuf>,
    /// `block0[hz] = p` for every hz address in block 0.
    block0:   Vec<PointN>,
}

impl Dataset {
    pub fn open(header: DatasetHeader, base_dir: Option<PathBuf>) -> Arc<Dataset> {
        let block_size = header.block_size() as usize;
        let block0 = (0..block_size)
            .map(|a| header.bitmask.hz_to_p(a as u64))
            .collect();
        Arc::new(Dataset { id: DatasetId::fresh(), header, base_dir, block0 })
    }

    pub fn from_text(text: &str) -> Result<Arc<Dataset>> {
        Ok(Self::open(DatasetHeader::parse(text)?, None))
    }

    /// Load a descriptor file; relative `filename_template` paths resolve
    /// against its directory.
    pub fn load(path: &Path) -> Result<Arc<Dataset>> {
        let text = std::fs::read_to_string(path)?;
        let header = DatasetHeader::parse(&text)?;
        let base_dir = path.parent().map(|p| p.to_owned());
        Ok(Self::open(header, base_dir))
    }

    /// Write the descriptor next to where its block files will live.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.header.to_text())?;
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> DatasetId {
        self.id
    }

    #[inline]
    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    /// The precomputed point of each hz address in block 0.
    #[inline]
    pub fn block0_points(&self) -> &[PointN] {
        &self.block0
    }

    /// Resolve a block file path against the descriptor's directory.
    pub fn resolve_block_path(&self, name: &str) -> PathBuf {
        let p = PathBuf::from(name);
        match (&self.base_dir, p.is_absolute()) {
            (Some(dir), false) => dir.join(p),
            _ => p,
        }
    }

    // ── Debug tooling ────────────────────────────────────────────────────────

    /// Cumulative sample lattice of level `h` over the logic box.
    pub fn level_box(&self, h: u32) -> Option<LogicSamples> {
        let b = &self.header.bitmask;
        b.samples_at_level(h, &self.header.logic_box, &self.header.logic_box)
    }

    /// Bounding lattices of the hz range `[a1, a2)`.
    pub fn address_range_box(&self, a1: u64, a2: u64) -> Vec<LogicSamples> {
        self.header.bitmask.address_range_samples(a1, a2)
    }

    /// The sample lattice of block `k`, clipped to nothing — callers clip.
    pub fn block_samples(&self, k: u64) -> LogicSamples {
        self.header.bitmask.block_samples(k, self.header.bitsperblock)
    }

    pub fn block_box(&self, k: u64) -> BoxN {
        self.block_samples(k).logic_box
    }
}

// ── DatasetRegistry ──────────────────────────────────────────────────────────

/// Id-keyed table of open datasets. Constructed once at program start and
/// threaded through explicitly; there is no process-global registry.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    map: RwLock<HashMap<DatasetId, Arc<Dataset>>>,
}

impl DatasetRegistry {
    pub fn new() -> Arc<DatasetRegistry> {
        Arc::new(Self::default())
    }

    pub fn register(&self, dataset: &Arc<Dataset>) -> DatasetId {
        let id = dataset.id();
        self.map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(dataset));
        id
    }

    pub fn get(&self, id: DatasetId) -> Result<Arc<Dataset>> {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::OutOfRange(format!("dataset {id} is not registered")))
    }

    pub fn unregister(&self, id: DatasetId) {
        self.map.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
version 6
logic_box 0 16 0 16
bitmask V01010101
bitsperblock 4
blocksperfile 1
filename_template %field.%block.blk
fields
  data u8
timesteps *
";

    #[test]
    fn block0_table_matches_hz() {
        let ds = Dataset::from_text(SAMPLE).unwrap();
        assert_eq!(ds.block0_points().len(), 16);
        for (a, p) in ds.block0_points().iter().enumerate() {
            assert_eq!(ds.header().bitmask.hz_to_p(a as u64), *p);
            assert_eq!(ds.header().bitmask.p_to_hz(p), a as u64);
        }
    }

    #[test]
    fn registry_lookup() {
        let registry = DatasetRegistry::new();
        let ds = Dataset::from_text(SAMPLE).unwrap();
        let id = registry.register(&ds);
        assert_eq!(registry.get(id).unwrap().id(), id);
        registry.unregister(id);
        assert!(registry.get(id).is_err());
    }

    #[test]
    fn level_box_counts() {
        let ds = Dataset::from_text(SAMPLE).unwrap();
        assert_eq!(ds.level_box(8).unwrap().total(), 256);
        assert_eq!(ds.level_box(4).unwrap().total(), 16);
        assert_eq!(ds.level_box(0).unwrap().total(), 1);
    }
}
