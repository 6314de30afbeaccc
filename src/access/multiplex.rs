//! Multiplex access: an ordered list of children. Reads try each child in
//! turn and back-fill RAM tiers in front of the one that answered; writes
//! fan out according to the policy.

use std::sync::Arc;

use tracing::debug;

use crate::access::{Access, AccessKind, IoContext};
use crate::error::{Error, Result};
use crate::query::BlockQuery;

/// Where writes land in the child list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Only the first child receives the block.
    First,
    /// Every child receives the block; the first failure is reported
    /// after all children were attempted.
    All,
}

#[derive(Debug)]
pub struct MultiplexAccess {
    children: Vec<Arc<Access>>,
    policy:   WritePolicy,
}

impl MultiplexAccess {
    pub fn create(
        ctx: &Arc<IoContext>,
        children: Vec<Arc<Access>>,
        policy: WritePolicy,
    ) -> Arc<Access> {
        debug_assert!(!children.is_empty());
        Access::new(ctx, AccessKind::Multiplex(MultiplexAccess { children, policy }))
    }

    pub(crate) fn children(&self) -> &[Arc<Access>] {
        &self.children
    }

    fn clone_plan(q: &BlockQuery) -> BlockQuery {
        let mut c = BlockQuery::new(q.field.clone(), q.time, q.a1, q.a2, q.aborted.clone());
        c.codec = q.codec;
        c
    }

    pub(crate) fn read_sync(&self, q: &mut BlockQuery) -> Result<()> {
        let mut first_err: Option<Error> = None;
        for (i, child) in self.children.iter().enumerate() {
            if q.aborted.get() {
                return Err(Error::Aborted);
            }
            match child.read_sync(q) {
                Ok(()) => {
                    self.backfill(&self.children[..i], q);
                    return Ok(());
                }
                Err(Error::NotFound) => continue,
                Err(e) => {
                    debug!(child = i, error = %e, "multiplex child read failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or(Error::NotFound))
    }

    /// Populate RAM tiers that missed with the block a later child served.
    fn backfill(&self, misses: &[Arc<Access>], q: &BlockQuery) {
        for tier in misses {
            if matches!(tier.kind(), AccessKind::Ram(_)) {
                let mut copy = Self::clone_plan(q);
                copy.buffer = q.buffer.clone();
                let _ = tier.write_sync(&mut copy);
            }
        }
    }

    pub(crate) fn write_sync(&self, q: &mut BlockQuery) -> Result<()> {
        match self.policy {
            WritePolicy::First => self.children[0].write_sync(q),
            WritePolicy::All => {
                let mut first_err: Option<Error> = None;
                for child in &self.children {
                    let mut copy = Self::clone_plan(q);
                    copy.buffer = q.buffer.clone();
                    if let Err(e) = child.write_sync(&mut copy) {
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}
