use rand::Rng;
use rand_chacha::ChaCha8Rng;
use sqlite_dispatch::DbError;

use crate::args::SimConfig;

pub(crate) const INITIAL_BALANCE: i64 = 1_000;

pub(crate) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id      INTEGER PRIMARY KEY,
        balance INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS journal (
        id      INTEGER PRIMARY KEY,
        kind    TEXT NOT NULL,
        amount  INTEGER NOT NULL
    );
    DELETE FROM accounts;
    DELETE FROM journal;
";

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Deposit { account: i64, amount: i64 },
    Transfer { from: i64, to: i64, amount: i64 },
    /// Applies a transfer, then fails the body so it must roll back.
    AbortedTransfer { from: i64, to: i64, amount: i64 },
    /// Applies a deposit, then panics inside the transaction.
    PanickedDeposit { account: i64, amount: i64 },
    Audit,
    Sleep(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Writer,
    Auditor,
}

/// Body failures that are not engine errors.
#[derive(Debug)]
pub(crate) enum StepError {
    Db(DbError),
    Aborted,
}

impl From<DbError> for StepError {
    fn from(err: DbError) -> Self {
        StepError::Db(err)
    }
}

pub(crate) fn next_op(role: Role, config: &SimConfig, rng: &mut ChaCha8Rng) -> Op {
    if rng.random::<f64>() < config.sleep_rate {
        return Op::Sleep(rng.random_range(1..=5));
    }
    if role == Role::Auditor {
        return Op::Audit;
    }

    let accounts = i64::try_from(config.accounts).unwrap_or(i64::MAX);
    let account = rng.random_range(1..=accounts);
    let amount = rng.random_range(1..=50);
    let roll = rng.random::<f64>();
    if roll < config.panic_rate {
        return Op::PanickedDeposit { account, amount };
    }
    let from = account;
    let mut to = rng.random_range(1..=accounts);
    if to == from {
        to = from % accounts + 1;
    }
    if roll < config.panic_rate + config.abort_rate {
        return Op::AbortedTransfer { from, to, amount };
    }
    if rng.random_bool(0.5) {
        Op::Deposit { account, amount }
    } else {
        Op::Transfer { from, to, amount }
    }
}
