use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use sqlite_dispatch::PoolStats;

use crate::model::INITIAL_BALANCE;

/// Committed effects as seen by the workers.
#[derive(Debug)]
pub(crate) struct Oracle {
    accounts: i64,
    deposited: AtomicI64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// One consistent read of the ledger.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub(crate) total: i64,
    pub(crate) deposits: i64,
    pub(crate) entries: i64,
}

impl Oracle {
    pub(crate) fn new(accounts: usize) -> Self {
        Self {
            accounts: i64::try_from(accounts).unwrap_or(i64::MAX),
            deposited: AtomicI64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        }
    }

    pub(crate) fn initial_total(&self) -> i64 {
        self.accounts * INITIAL_BALANCE
    }

    pub(crate) fn record_commit(&self, deposit: i64) {
        self.deposited.fetch_add(deposit, Ordering::SeqCst);
        self.committed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    pub(crate) fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Money only enters the ledger through journaled deposits.
    pub(crate) fn check_snapshot(&self, snap: Snapshot) -> Result<(), String> {
        let expected = self.initial_total() + snap.deposits;
        if snap.total != expected {
            return Err(format!(
                "ledger total {} but journal deposits imply {expected}",
                snap.total
            ));
        }
        Ok(())
    }

    /// After all workers stop, the database must hold exactly what was committed.
    pub(crate) fn check_final(&self, snap: Snapshot) -> Result<(), String> {
        self.check_snapshot(snap)?;
        let deposited = self.deposited.load(Ordering::SeqCst);
        if snap.deposits != deposited {
            return Err(format!(
                "journal deposits {} but workers committed {deposited}",
                snap.deposits
            ));
        }
        let committed = self.committed();
        if u64::try_from(snap.entries).ok() != Some(committed) {
            return Err(format!(
                "journal has {} entries but workers committed {committed}",
                snap.entries
            ));
        }
        Ok(())
    }

    pub(crate) fn check_pool(stats: &PoolStats) -> Result<(), String> {
        if stats.available + stats.in_use > stats.max_connections {
            return Err(format!(
                "pool holds {} idle + {} in use over a maximum of {}",
                stats.available, stats.in_use, stats.max_connections
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_must_balance_against_deposits() {
        let oracle = Oracle::new(2);
        oracle.record_commit(10);
        let good = Snapshot {
            total: 2_010,
            deposits: 10,
            entries: 1,
        };
        assert!(oracle.check_snapshot(good).is_ok());
        assert!(oracle.check_final(good).is_ok());

        let leaked = Snapshot { total: 2_015, ..good };
        assert!(oracle.check_snapshot(leaked).is_err());

        let lost = Snapshot {
            total: 2_000,
            deposits: 0,
            entries: 0,
        };
        assert!(oracle.check_snapshot(lost).is_ok());
        assert!(oracle.check_final(lost).is_err());
    }
}
