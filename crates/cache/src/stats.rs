//! Cache-wide counters.
//!
//! Everything here is observable state only; no behavior depends on it
//! except the conflict-pair table, whose impossible entries are asserted.

use crate::transaction::{TransactionSource, TreeKind};

/// Count/bytes accumulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStat {
    pub num: u64,
    pub bytes: u64,
}

impl IoStat {
    pub fn increment(&mut self, bytes: u64) {
        self.num += 1;
        self.bytes += bytes;
    }

    pub fn increment_stat(&mut self, other: IoStat) {
        self.num += other.num;
        self.bytes += other.bytes;
    }

    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for IoStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}B)", self.num, self.bytes)
    }
}

/// Index-tree operation counters carried per transaction and folded into
/// the cache totals at commit or invalidation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: u64,
    pub num_inserts: u64,
    pub num_erases: u64,
    pub num_updates: u64,
    pub extents_num_delta: i64,
}

impl TreeStats {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }

    pub fn increment(&mut self, other: &TreeStats) {
        if other.depth != 0 {
            self.depth = other.depth;
        }
        self.num_inserts += other.num_inserts;
        self.num_erases += other.num_erases;
        self.num_updates += other.num_updates;
        self.extents_num_delta += other.extents_num_delta;
    }
}

/// Efforts wasted by an invalidated transaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct InvalidatedEfforts {
    pub num_trans: u64,
    pub read: IoStat,
    pub retire: IoStat,
    pub fresh: IoStat,
    pub mutate: IoStat,
    pub mutate_delta_bytes: u64,
    pub num_ool_records: u64,
    pub ool_record_bytes: u64,
}

/// Efforts of successfully committed transactions.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommittedEfforts {
    pub num_trans: u64,
    pub read: IoStat,
    pub mutate: IoStat,
    pub retire: IoStat,
    pub fresh_inline: IoStat,
    pub fresh_ool: IoStat,
    pub fresh_invalid: IoStat,
    pub existing: IoStat,
    pub delta_bytes: u64,
    pub num_ool_records: u64,
    pub ool_record_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SuccessReadEfforts {
    pub num_trans: u64,
    pub read: IoStat,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RewriteStats {
    pub num_dirty: u64,
    pub dirty_bytes: u64,
    pub num_reclaim: u64,
    pub reclaim_bytes: u64,
}

const NUM_SRCS: usize = TransactionSource::ALL.len();

#[derive(Default)]
pub struct CacheStats {
    /// Conflicts by (source of the invalidating transaction, source of the
    /// invalidated reader).
    conflicts: [[u64; NUM_SRCS]; NUM_SRCS],
    pub(crate) invalidated: [InvalidatedEfforts; NUM_SRCS],
    pub(crate) committed: [CommittedEfforts; NUM_SRCS],
    pub(crate) success_read: SuccessReadEfforts,
    pub(crate) trans_conflicts_by_unknown: [u64; NUM_SRCS],
    pub(crate) rewrites: RewriteStats,
    pub(crate) committed_tree: [TreeStats; 4],
    pub(crate) invalidated_tree: [TreeStats; 4],
    pub(crate) cache_accesses: u64,
    pub(crate) cache_hits: u64,
}

fn tree_index(kind: TreeKind) -> usize {
    match kind {
        TreeKind::Laddr => 0,
        TreeKind::Backref => 1,
        TreeKind::Onode => 2,
        TreeKind::Omap => 3,
    }
}

impl CacheStats {
    /// Record a conflict between `cause` (the invalidating transaction) and
    /// `reader` (the invalidated one).
    ///
    /// Same-source pairs other than (Mutate, Mutate) cannot occur: readers
    /// are serialized per source for the background sources, and read-only
    /// transactions never invalidate anything.
    pub(crate) fn account_conflict(
        &mut self,
        cause: TransactionSource,
        reader: TransactionSource,
    ) {
        assert!(
            cause == TransactionSource::Mutate || cause != reader,
            "impossible conflict pair ({cause:?}, {reader:?})"
        );
        self.conflicts[cause.index()][reader.index()] += 1;
    }

    pub fn conflicts(&self, cause: TransactionSource, reader: TransactionSource) -> u64 {
        self.conflicts[cause.index()][reader.index()]
    }

    pub fn invalidated(&self, src: TransactionSource) -> &InvalidatedEfforts {
        &self.invalidated[src.index()]
    }

    pub fn committed(&self, src: TransactionSource) -> &CommittedEfforts {
        &self.committed[src.index()]
    }

    pub fn success_read(&self) -> &SuccessReadEfforts {
        &self.success_read
    }

    pub fn rewrites(&self) -> &RewriteStats {
        &self.rewrites
    }

    pub(crate) fn fold_committed_tree(&mut self, kind: TreeKind, stats: &TreeStats) {
        self.committed_tree[tree_index(kind)].increment(stats);
    }

    pub(crate) fn fold_invalidated_tree(&mut self, kind: TreeKind, stats: &TreeStats) {
        self.invalidated_tree[tree_index(kind)].increment(stats);
    }

    pub fn committed_tree(&self, kind: TreeKind) -> &TreeStats {
        &self.committed_tree[tree_index(kind)]
    }

    pub fn invalidated_tree(&self, kind: TreeKind) -> &TreeStats {
        &self.invalidated_tree[tree_index(kind)]
    }

    /// Conflicts detected against already-invalid extents, where the
    /// invalidating transaction is no longer known.
    pub fn trans_conflicts_by_unknown(&self, src: TransactionSource) -> u64 {
        self.trans_conflicts_by_unknown[src.index()]
    }

    pub fn cache_accesses(&self) -> u64 {
        self.cache_accesses
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutate_mutate_conflicts_are_counted() {
        let mut stats = CacheStats::default();
        stats.account_conflict(TransactionSource::Mutate, TransactionSource::Mutate);
        stats.account_conflict(TransactionSource::Mutate, TransactionSource::Read);
        assert_eq!(
            stats.conflicts(TransactionSource::Mutate, TransactionSource::Mutate),
            1
        );
        assert_eq!(
            stats.conflicts(TransactionSource::Mutate, TransactionSource::Read),
            1
        );
    }

    #[test]
    #[should_panic(expected = "impossible conflict pair")]
    fn read_read_conflict_is_impossible() {
        let mut stats = CacheStats::default();
        stats.account_conflict(TransactionSource::Read, TransactionSource::Read);
    }
}
