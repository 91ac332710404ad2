//! Worker pool.
//!
//! A fixed number of workers are pre-spawned at startup. A free-list —
//! here an `mpsc` channel of free worker ids — is popped to find an idle
//! worker; the accepted socket is handed to that worker via its own job
//! channel; the worker pushes its id back onto the free list once it's
//! done serving the connection. Grounded on
//! `original_source/robin/src/robin_thread.c` (`rt_free_list_push/pop`,
//! the `RT_FREE`/`RT_BUSY` loop, `rt_cleanup`). Tokio tasks stand in for
//! the original's pthreads.

use std::sync::Arc;

use log::info;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cips::CipLog;
use crate::config::Limits;
use crate::connection;
use crate::users::UserStore;

struct Job {
    stream: TcpStream,
    peer: String,
}

pub struct WorkerPool {
    job_txs: Vec<mpsc::Sender<Job>>,
    free_rx: mpsc::Receiver<usize>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns `count` workers, each idle until a job is dispatched to it.
    pub fn spawn(count: usize, users: Arc<UserStore>, cips: Arc<CipLog>, limits: Limits) -> Self {
        let shutdown = CancellationToken::new();
        let (free_tx, free_rx) = mpsc::channel(count);

        let mut job_txs = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (job_tx, job_rx) = mpsc::channel::<Job>(1);
            job_txs.push(job_tx);

            let handle = tokio::spawn(worker_loop(
                id,
                job_rx,
                free_tx.clone(),
                users.clone(),
                cips.clone(),
                limits,
                shutdown.clone(),
            ));
            handles.push(handle);
        }

        // Every worker starts free; populate the free list up front so the
        // first `dispatch` doesn't have to wait on a worker announcing
        // itself.
        for id in 0..count {
            let _ = free_tx.try_send(id);
        }

        info!(target: "cips::pool", "spawned {count} workers");

        WorkerPool {
            job_txs,
            free_rx,
            handles,
            shutdown,
        }
    }

    /// Blocks until a worker is free, then hands it `stream`. Mirrors
    /// `robin_thread_pool_dispatch`'s free-list pop + wake.
    pub async fn dispatch(&mut self, stream: TcpStream, peer: String) {
        let Some(id) = self.free_rx.recv().await else {
            // All workers have exited (shutdown in progress); drop the
            // connection rather than block forever.
            return;
        };
        let _ = self.job_txs[id].send(Job { stream, peer }).await;
    }

    /// Cancels every worker, releasing any `uid` they hold, and waits for
    /// them to terminate. Idempotent — cancelling an already-cancelled
    /// token is a no-op and a second `close()` just re-joins finished
    /// handles.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        self.job_txs.clear(); // closes every job channel

        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// One worker's lifetime: wait for a job (cancellable), serve it to
/// completion, push back onto the free list, repeat. There are two
/// suspension points — waiting for work, and waiting inside a frame read
/// during service — and both must unblock on shutdown, so `shutdown` is
/// threaded into `connection::serve` itself and raced against its frame
/// read there, mirroring `pthread_cancel` interrupting a blocking `read()`
/// at its POSIX cancellation point in `robin_thread.c`.
async fn worker_loop(
    id: usize,
    mut job_rx: mpsc::Receiver<Job>,
    free_tx: mpsc::Sender<usize>,
    users: Arc<UserStore>,
    cips: Arc<CipLog>,
    limits: Limits,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = job_rx.recv() => job,
        };

        let Some(Job { stream, peer }) = job else {
            break; // channel closed: pool is shutting down
        };

        info!(target: "cips::pool", "worker {id} serving {peer}");
        connection::serve(stream, peer, users.clone(), cips.clone(), limits, shutdown.clone()).await;

        if free_tx.send(id).await.is_err() {
            break; // pool has shut down while we were serving
        }
    }
}
