//! Mosaic access: many small datasets tiled side by side presented as one
//! logical dataset. The global block id space is the concatenation of the
//! pieces; reads rebase the id and delegate to the owning piece.

use std::sync::Arc;

use crate::access::{Access, AccessKind, IoContext};
use crate::error::{Error, Result};
use crate::header::Field;
use crate::query::BlockQuery;

#[derive(Debug)]
pub struct MosaicPiece {
    pub access:      Arc<Access>,
    /// First global block id this piece owns.
    pub first_block: u64,
    pub nblocks:     u64,
}

#[derive(Debug)]
pub struct MosaicAccess {
    pieces:       Vec<MosaicPiece>,
    bitsperblock: u32,
}

impl MosaicAccess {
    /// `pieces` must cover disjoint, ascending block ranges.
    pub fn create(
        ctx: &Arc<IoContext>,
        mut pieces: Vec<MosaicPiece>,
        bitsperblock: u32,
    ) -> Arc<Access> {
        debug_assert!(!pieces.is_empty());
        pieces.sort_by_key(|p| p.first_block);
        Access::new(ctx, AccessKind::Mosaic(MosaicAccess { pieces, bitsperblock }))
    }

    pub(crate) fn children(&self) -> Vec<Arc<Access>> {
        self.pieces.iter().map(|p| Arc::clone(&p.access)).collect()
    }

    fn piece_for(&self, block: u64) -> Result<&MosaicPiece> {
        let i = self
            .pieces
            .partition_point(|p| p.first_block <= block)
            .checked_sub(1)
            .ok_or_else(|| Error::OutOfRange(format!("block {block} before the mosaic")))?;
        let piece = &self.pieces[i];
        if block >= piece.first_block + piece.nblocks {
            return Err(Error::OutOfRange(format!("block {block} falls between mosaic tiles")));
        }
        Ok(piece)
    }

    fn rebase(&self, q: &BlockQuery, piece: &MosaicPiece) -> BlockQuery {
        let shift = piece.first_block << self.bitsperblock;
        let mut sub = BlockQuery::new(
            q.field.clone(),
            q.time,
            q.a1 - shift,
            q.a2 - shift,
            q.aborted.clone(),
        );
        sub.codec = q.codec;
        sub
    }

    pub(crate) fn read_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let piece = self.piece_for(q.a1 >> self.bitsperblock)?;
        let mut sub = self.rebase(q, piece);
        piece.access.read_sync(&mut sub)?;
        q.buffer = sub.buffer;
        Ok(())
    }

    pub(crate) fn write_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let piece = self.piece_for(q.a1 >> self.bitsperblock)?;
        let mut sub = self.rebase(q, piece);
        sub.buffer = std::mem::take(&mut q.buffer);
        let result = piece.access.write_sync(&mut sub);
        q.buffer = sub.buffer;
        result
    }

    pub(crate) fn block_file_name(
        &self,
        field: &Field,
        time: f64,
        block: u64,
    ) -> Option<String> {
        let piece = self.piece_for(block).ok()?;
        piece.access.block_file_name(field, time, block - piece.first_block)
    }
}
