//! Disk access: block files resolved through the dataset's filename
//! template, random I/O through the shared open-file cache.

use std::sync::Arc;

use tracing::debug;

use crate::access::{Access, AccessKind, IoContext};
use crate::blockfile::{self, DirEntry, FLAG_LOSSY, FLAG_PRESENT};
use crate::cache::FileMode;
use crate::codec::{get_codec, CodecError};
use crate::dataset::{Dataset, DatasetId};
use crate::error::{Error, Result};
use crate::header::Field;
use crate::query::BlockQuery;

/// Convert a codec-layer failure into the engine error vocabulary; a
/// cooperative abort inside decode surfaces as `Aborted`, not as a codec
/// defect.
pub(crate) fn codec_err(e: CodecError) -> Error {
    match e {
        CodecError::Aborted => Error::Aborted,
        other => Error::Codec(other),
    }
}

#[derive(Debug)]
pub struct DiskAccess {
    dataset_id: DatasetId,
}

impl DiskAccess {
    pub fn create(ctx: &Arc<IoContext>, dataset: &Arc<Dataset>) -> Arc<Access> {
        ctx.registry.register(dataset);
        Access::new(ctx, AccessKind::Disk(DiskAccess { dataset_id: dataset.id() }))
    }

    fn locate(
        &self,
        ctx: &IoContext,
        q: &BlockQuery,
    ) -> Result<(Arc<Dataset>, u64, u32, std::path::PathBuf)> {
        let dataset = ctx.registry.get(self.dataset_id)?;
        let header = dataset.header();
        let block = q.a1 >> header.bitsperblock;
        if q.a1 % header.block_size() != 0
            || q.a2 != q.a1 + header.block_size()
            || block >= header.total_blocks()
        {
            return Err(Error::OutOfRange(format!(
                "hz range [{}, {}) is not a block of this dataset",
                q.a1, q.a2
            )));
        }
        let group = header.file_group_of(block);
        let name = header.block_file_name(group, q.time, &q.field);
        let block_in_file = header.block_in_file(block);
        let path = dataset.resolve_block_path(&name);
        Ok((dataset, block, block_in_file, path))
    }

    pub(crate) fn read_sync(&self, ctx: &IoContext, q: &mut BlockQuery) -> Result<()> {
        let (dataset, block, index, path) = self.locate(ctx, q)?;

        let read = ctx
            .file_cache
            .with_file(&path, FileMode::Read, None, |file| {
                let n = blockfile::read_header(file)?;
                let entry = blockfile::read_entry(file, n, index)?;
                if !entry.present() {
                    return Err(Error::NotFound);
                }
                let payload = blockfile::read_payload(file, &entry)?;
                Ok((entry, payload))
            });
        let (entry, payload) = match read {
            // A missing file is a hole, same as an absent directory entry.
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound)
            }
            other => other?,
        };
        ctx.counters.add_read(payload.len() as u64);

        let tag = entry.codec_tag().ok_or_else(|| {
            Error::Codec(CodecError::Decode(format!(
                "unknown on-disk codec id {}",
                entry.codec
            )))
        })?;
        let dims = dataset.block_samples(block).nsamples;
        let decoded = get_codec(tag)
            .map_err(codec_err)?
            .decode(&payload, q.field.dtype, &dims, &q.aborted)
            .map_err(codec_err)?;
        debug!(block, codec = tag.name(), bytes = payload.len(), "read block");
        q.buffer = decoded;
        Ok(())
    }

    pub(crate) fn write_sync(&self, ctx: &IoContext, q: &mut BlockQuery) -> Result<()> {
        let (dataset, block, index, path) = self.locate(ctx, q)?;
        if q.buffer.len() != q.nbytes() {
            return Err(Error::OutOfRange(format!(
                "write buffer holds {} bytes, block needs {}",
                q.buffer.len(),
                q.nbytes()
            )));
        }

        let tag = q.effective_codec();
        let dims = dataset.block_samples(block).nsamples;
        let codec = get_codec(tag).map_err(codec_err)?;
        codec.check_compatible(q.field.dtype, &dims).map_err(codec_err)?;
        let payload = codec.encode(&q.buffer, q.field.dtype, &dims).map_err(codec_err)?;

        let blocksperfile = dataset.header().blocksperfile;
        let init = move |file: &mut std::fs::File| -> Result<()> {
            blockfile::create(file, blocksperfile)?;
            Ok(())
        };
        let written = payload.len() as u64;
        ctx.file_cache
            .with_file(&path, FileMode::ReadWrite, Some(&init), |file| {
                let n = blockfile::read_header(file)?;
                let existing = blockfile::read_entry(file, n, index)?;
                // A block that was written lossily is married to that codec.
                if existing.present()
                    && existing.lossy()
                    && tag.is_lossy()
                    && existing.codec != tag.disk_id()
                {
                    return Err(Error::Codec(CodecError::Mismatch(tag.name())));
                }
                let (offset, checksum) = blockfile::append_payload(file, n, &payload)?;
                let mut flags = FLAG_PRESENT;
                if tag.is_lossy() {
                    flags |= FLAG_LOSSY;
                }
                let entry = DirEntry {
                    codec: tag.disk_id(),
                    flags,
                    comp_size: payload.len() as u32,
                    offset,
                    checksum,
                };
                blockfile::write_entry(file, index, &entry)
            })?;
        ctx.counters.add_write(written);
        debug!(block, codec = tag.name(), bytes = written, "wrote block");
        Ok(())
    }

    pub(crate) fn block_file_name(
        &self,
        ctx: &IoContext,
        field: &Field,
        time: f64,
        block: u64,
    ) -> Option<String> {
        let dataset = ctx.registry.get(self.dataset_id).ok()?;
        let header = dataset.header();
        let name = header.block_file_name(header.file_group_of(block), time, field);
        Some(dataset.resolve_block_path(&name).display().to_string())
    }
}
