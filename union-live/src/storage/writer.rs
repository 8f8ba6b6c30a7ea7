//! Serialized writer: the one execution context allowed to open a write transaction.
//!
//! ```text
//! caller ──submit(body)──┐
//! caller ──submit(body)──┼──► bounded mpsc ──► writer thread ──► RocksDB
//! caller ──submit(body)──┘         (FIFO)        │ run_txn(body)
//!    ▲                                          │
//!    └──────────── oneshot reply ◄──────────────┘
//! ```
//!
//! The worker is a dedicated OS thread that executes one job to completion
//! before taking the next, so mutations are totally ordered and no write
//! locks are needed. Every job answers its caller exactly once, including
//! when the body fails or panics. Dropping the queue sender is the only
//! termination signal.

use rocksdb::WriteOptions;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

use super::store::{run_txn, write_options, Db, StoreError, WriteTxn};

type Job = Box<dyn FnOnce(&Db, &WriteOptions) + Send>;

pub struct SerialWriter {
    /// `None` once shut down
    queue: RwLock<Option<mpsc::Sender<Job>>>,
    /// Fires after the worker has released its database handle
    exited: Mutex<Option<oneshot::Receiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialWriter {
    pub(crate) fn spawn(
        db: Arc<Db>,
        capacity: usize,
        sync_writes: bool,
    ) -> Result<Self, StoreError> {
        let (queue, jobs) = mpsc::channel(capacity.max(1));
        let (exited_tx, exited_rx) = oneshot::channel();

        let worker = thread::Builder::new()
            .name("union-store-writer".into())
            .spawn(move || {
                Self::run(db, jobs, sync_writes);
                let _ = exited_tx.send(());
            })?;

        Ok(Self {
            queue: RwLock::new(Some(queue)),
            exited: Mutex::new(Some(exited_rx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(db: Arc<Db>, mut jobs: mpsc::Receiver<Job>, sync_writes: bool) {
        let opts = write_options(sync_writes);
        let mut executed = 0u64;
        while let Some(job) = jobs.blocking_recv() {
            job(&db, &opts);
            executed += 1;
        }
        log::debug!("Store writer exiting after {executed} transactions");
    }

    /// Queue `body` and wait for its result.
    ///
    /// Waits for queue space when the writer is behind. Fails with
    /// [`StoreError::Closed`] once the writer has been shut down.
    pub async fn submit<T, F>(&self, body: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, StoreError> + Send + 'static,
    {
        let queue = self
            .queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::Closed)?;

        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |db: &Db, opts: &WriteOptions| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_txn(db, opts, body)))
                .unwrap_or_else(|_| Err(StoreError::Aborted("transaction body panicked".into())));
            // The caller may have stopped waiting; the transaction ran regardless.
            let _ = reply.send(outcome);
        });

        let sent = queue.send(job).await;
        // Holding a sender keeps the worker alive; release it before waiting.
        drop(queue);
        sent.map_err(|_| StoreError::Closed)?;

        result.await.map_err(|_| StoreError::Closed)?
    }

    /// Stop accepting work and wait for the worker to drain and exit.
    pub async fn shutdown(&self) {
        self.detach();
        let exited = self
            .exited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Store writer thread panicked");
            }
        }
    }

    /// Stop accepting work without waiting for the worker.
    pub fn detach(&self) {
        self.queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::Partition;
    use rocksdb::Options;
    use std::path::Path;

    fn open_db(path: &Path) -> Arc<Db> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        Arc::new(Db::open_cf(&opts, path, Partition::ALL.iter().map(|p| p.name())).unwrap())
    }

    fn get(db: &Db, key: &[u8]) -> Option<Vec<u8>> {
        let cf = db.cf_handle(Partition::Users.name()).unwrap();
        db.get_cf(cf, key).unwrap()
    }

    #[tokio::test]
    async fn test_submit_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db.clone(), 4, false).unwrap();

        writer
            .submit(|txn| txn.put(Partition::Users, b"alice", b"1"))
            .await
            .unwrap();
        assert_eq!(get(&db, b"alice"), Some(b"1".to_vec()));

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_body_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db.clone(), 4, false).unwrap();

        let err = writer
            .submit(|txn| -> Result<(), StoreError> {
                txn.put(Partition::Users, b"half", b"written")?;
                Err(StoreError::Rejected("abort".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(get(&db, b"half"), None);

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_body_reports_and_worker_survives() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db.clone(), 4, false).unwrap();

        let err = writer
            .submit(|_txn| -> Result<(), StoreError> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));

        // Next job still runs
        writer
            .submit(|txn| txn.put(Partition::Users, b"after", b"ok"))
            .await
            .unwrap();
        assert_eq!(get(&db, b"after"), Some(b"ok".to_vec()));

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db, 4, false).unwrap();

        let seen = writer
            .submit(|txn| {
                txn.put(Partition::Users, b"k", b"v")?;
                txn.get(Partition::Users, b"k")
            })
            .await
            .unwrap();
        assert_eq!(seen, b"v");

        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db, 4, false).unwrap();
        writer.shutdown().await;

        let err = writer.submit(|_txn| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = SerialWriter::spawn(db.clone(), 2, false).unwrap();

        for i in 0u8..20 {
            writer
                .submit(move |txn| {
                    let mut log = match txn.get(Partition::Users, b"log") {
                        Ok(v) => v,
                        Err(StoreError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(e),
                    };
                    log.push(i);
                    txn.put(Partition::Users, b"log", &log)
                })
                .await
                .unwrap();
        }
        assert_eq!(get(&db, b"log"), Some((0u8..20).collect()));

        writer.shutdown().await;
    }
}
