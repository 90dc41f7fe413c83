use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sqlite_dispatch::{
    Connection, Database, DbError, StorageLocation, TableLockPolicy, TransactionKind, params,
};

use crate::args::SimConfig;
use crate::logging::EventLog;
use crate::model::{INITIAL_BALANCE, Op, Role, SCHEMA, StepError, next_op};
use crate::oracle::{Oracle, Snapshot};

pub(crate) const SIMULATED_PANIC: &str = "simulated panic inside a write transaction";

struct Shared<'a> {
    config: &'a SimConfig,
    db: &'a Database,
    oracle: Oracle,
    events: Mutex<EventLog>,
    steps: AtomicU64,
    stop: AtomicBool,
    failure: Mutex<Option<String>>,
    started: Instant,
}

impl Shared<'_> {
    fn claim_step(&self) -> Option<u64> {
        if self.stop.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(limit) = self.config.duration_ms {
            if self.started.elapsed() >= Duration::from_millis(limit) {
                return None;
            }
        }
        let step = self.steps.fetch_add(1, Ordering::SeqCst);
        match self.config.iterations {
            Some(limit) if step >= limit => None,
            _ => Some(step),
        }
    }

    fn record(&self, message: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(message);
    }

    fn fail(&self, reason: String) {
        self.stop.store(true, Ordering::SeqCst);
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
    }
}

pub(crate) fn run(config: &SimConfig, rng: &mut ChaCha8Rng) -> Result<(), String> {
    let location = config
        .db
        .as_ref()
        .map_or(StorageLocation::Temporary, StorageLocation::on_disk);
    let db = Database::builder(location)
        .lock_policy(TableLockPolicy::Retry {
            max_retries: 50,
            backoff: Duration::from_millis(1),
        })
        .max_readers(config.max_readers)
        .drain_delay(config.drain_delay())
        .open()
        .map_err(|err| format!("open failed: {err}"))?;
    seed_ledger(&db, config.accounts).map_err(|err| format!("seeding failed: {err}"))?;

    let shared = Shared {
        config,
        db: &db,
        oracle: Oracle::new(config.accounts),
        events: Mutex::new(EventLog::new(config.first_steps, config.tail_steps)),
        steps: AtomicU64::new(0),
        stop: AtomicBool::new(false),
        failure: Mutex::new(None),
        started: Instant::now(),
    };

    let roles = std::iter::repeat_n(Role::Writer, config.writers)
        .chain(std::iter::repeat_n(Role::Auditor, config.auditors));
    thread::scope(|scope| {
        for (worker, role) in roles.enumerate() {
            let worker_rng = ChaCha8Rng::seed_from_u64(rng.random());
            let shared = &shared;
            scope.spawn(move || work(shared, worker, role, worker_rng));
        }
    });

    let failure = shared
        .failure
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let outcome = match failure {
        Some(reason) => Err(reason),
        None => audit(&db)
            .map_err(|err| format!("final audit failed: {err}"))
            .and_then(|snap| shared.oracle.check_final(snap)),
    };
    if let Err(reason) = &outcome {
        shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dump_failure(reason);
        return outcome;
    }

    let stats = db.pool_stats();
    tracing::info!(
        "complete: steps={} elapsed={:?} committed={} rolled_back={} readers_created={} pool={}",
        shared.steps.load(Ordering::SeqCst).min(config.iterations.unwrap_or(u64::MAX)),
        shared.started.elapsed(),
        shared.oracle.committed(),
        shared.oracle.rolled_back(),
        stats.created,
        serde_json::to_string(&stats).unwrap_or_default()
    );
    Ok(())
}

fn seed_ledger(db: &Database, accounts: usize) -> Result<(), DbError> {
    db.execute_script(SCHEMA)?;
    db.write(|conn| {
        let mut insert = conn.prepare(
            "INSERT INTO accounts (id, balance) VALUES (?, ?)",
            &params![0, INITIAL_BALANCE],
        )?;
        for id in 1..=i64::try_from(accounts).unwrap_or(i64::MAX) {
            insert.bind(&params![id, INITIAL_BALANCE])?;
            insert.run()?;
        }
        Ok(())
    })
}

fn work(shared: &Shared<'_>, worker: usize, role: Role, mut rng: ChaCha8Rng) {
    while let Some(step) = shared.claim_step() {
        let op = next_op(role, shared.config, &mut rng);
        let result = apply(shared, &op);
        shared.record(format!(
            "step={step} worker={worker} op={op:?} result={}",
            match &result {
                Ok(label) => (*label).to_string(),
                Err(reason) => format!("Err({reason})"),
            }
        ));
        if let Err(reason) = result {
            shared.fail(reason);
            return;
        }
        if let Err(reason) = Oracle::check_pool(&shared.db.pool_stats()) {
            shared.fail(reason);
            return;
        }
    }
}

fn apply(shared: &Shared<'_>, op: &Op) -> Result<&'static str, String> {
    let db = shared.db;
    match *op {
        Op::Sleep(ms) => {
            thread::sleep(Duration::from_millis(ms));
            Ok("slept")
        }
        Op::Audit => {
            let snap = audit(db).map_err(|err| format!("audit failed: {err}"))?;
            shared.oracle.check_snapshot(snap)?;
            Ok("balanced")
        }
        Op::Deposit { account, amount } => {
            db.execute_write(TransactionKind::Immediate, |c| deposit(c, account, amount))
                .map_err(|err| format!("deposit failed: {err}"))?;
            shared.oracle.record_commit(amount);
            Ok("committed")
        }
        Op::Transfer { from, to, amount } => {
            db.execute_write(TransactionKind::Immediate, |c| {
                transfer(c, from, to, amount)
            })
            .map_err(|err| format!("transfer failed: {err}"))?;
            shared.oracle.record_commit(0);
            Ok("committed")
        }
        Op::AbortedTransfer { from, to, amount } => {
            let res = db.execute_write(TransactionKind::Immediate, |c| {
                transfer(c, from, to, amount)?;
                Err::<(), _>(StepError::Aborted)
            });
            match res {
                Err(StepError::Aborted) => {
                    shared.oracle.record_rollback();
                    Ok("rolled back")
                }
                Err(StepError::Db(err)) => Err(format!("aborted transfer failed: {err}")),
                Ok(()) => Err("aborted transfer committed".to_string()),
            }
        }
        Op::PanickedDeposit { account, amount } => {
            let res = panic::catch_unwind(AssertUnwindSafe(|| {
                db.write(|c| -> Result<(), DbError> {
                    deposit(c, account, amount)?;
                    panic!("{SIMULATED_PANIC}");
                })
            }));
            if res.is_ok() {
                return Err("panicking deposit returned normally".to_string());
            }
            shared.oracle.record_rollback();
            Ok("rolled back by panic")
        }
    }
}

fn deposit(conn: &Connection, account: i64, amount: i64) -> Result<(), DbError> {
    conn.run(
        "UPDATE accounts SET balance = balance + ? WHERE id = ?",
        &params![amount, account],
    )?;
    conn.run(
        "INSERT INTO journal (kind, amount) VALUES ('deposit', ?)",
        &params![amount],
    )?;
    Ok(())
}

fn transfer(conn: &Connection, from: i64, to: i64, amount: i64) -> Result<(), DbError> {
    conn.run(
        "UPDATE accounts SET balance = balance - ? WHERE id = ?",
        &params![amount, from],
    )?;
    conn.run(
        "UPDATE accounts SET balance = balance + ? WHERE id = ?",
        &params![amount, to],
    )?;
    conn.run(
        "INSERT INTO journal (kind, amount) VALUES ('transfer', ?)",
        &params![amount],
    )?;
    Ok(())
}

fn audit(db: &Database) -> Result<Snapshot, DbError> {
    let snap = db.read(|c| {
        c.query_row(
            "SELECT (SELECT coalesce(sum(balance), 0) FROM accounts),
                    (SELECT coalesce(sum(amount), 0) FROM journal WHERE kind = 'deposit'),
                    (SELECT count(*) FROM journal)",
            &[],
            |row| {
                Ok(Snapshot {
                    total: row.get(0)?,
                    deposits: row.get(1)?,
                    entries: row.get(2)?,
                })
            },
        )
    })?;
    snap.ok_or_else(|| DbError::ExtractionError("audit query returned no row".to_string()))
}
