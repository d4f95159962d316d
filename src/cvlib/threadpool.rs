use crate::{
    cverr,
    result::{to_cv, CvResult},
};
use parking_lot::Mutex;
use tracing::{error, info};

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

pub(crate) const WORKER_THREAD_PREFIX: &str = "cvimage-worker-";

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Terminate,
    NewJob((u64, Job)),
}

fn worker_loop(
    idx_thread: usize,
    rx_to_pool: Arc<Mutex<Receiver<Message>>>,
    n_busy: Arc<AtomicUsize>,
) -> CvResult<()> {
    info!("spawning worker thread {idx_thread}");
    loop {
        // the lock is released before the job runs
        let received_msg = rx_to_pool.lock().recv().map_err(to_cv)?;
        match received_msg {
            Message::Terminate => {
                info!("shut down worker thread {idx_thread}");
                return Ok(());
            }
            Message::NewJob((job_id, f)) => {
                n_busy.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("worker thread {idx_thread} runs job {job_id}");
                f();
                n_busy.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Fixed number of threads that pick jobs from one shared queue. Jobs report their results
/// themselves, the pool only runs them.
pub struct WorkerPool {
    tx_to_pool: Sender<Message>,
    handles: Vec<JoinHandle<CvResult<()>>>,
    job_id: AtomicU64,
    n_busy: Arc<AtomicUsize>,
}
impl WorkerPool {
    pub fn new(n_threads: usize) -> CvResult<Self> {
        let n_threads = n_threads.max(1);
        let (tx_to_pool, rx_to_pool) = mpsc::channel();
        let rx_to_pool = Arc::new(Mutex::new(rx_to_pool));
        let n_busy = Arc::new(AtomicUsize::new(0));
        let handles = (0..n_threads)
            .map(|idx_thread| {
                let rx = rx_to_pool.clone();
                let n_busy = n_busy.clone();
                thread::Builder::new()
                    .name(format!("{WORKER_THREAD_PREFIX}{idx_thread}"))
                    .spawn(move || worker_loop(idx_thread, rx, n_busy))
                    .map_err(|e| cverr!("could not spawn worker thread {}, {:?}", idx_thread, e))
            })
            .collect::<CvResult<Vec<_>>>()?;
        Ok(WorkerPool {
            tx_to_pool,
            handles,
            job_id: AtomicU64::new(0),
            n_busy,
        })
    }
    /// Queues the job and returns its id.
    pub fn apply(&self, f: Job) -> CvResult<u64> {
        let job_id = self.job_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("sending job {job_id}");
        self.tx_to_pool
            .send(Message::NewJob((job_id, f)))
            .map_err(|e| cverr!("worker pool is gone, could not send job {}. {:?}", job_id, e))?;
        Ok(job_id)
    }
    pub fn n_threads(&self) -> usize {
        self.handles.len()
    }
    /// Number of jobs currently executing.
    pub fn n_busy(&self) -> usize {
        self.n_busy.load(Ordering::SeqCst)
    }
}

fn terminate_all_threads(tp: &WorkerPool) -> CvResult<()> {
    for _ in &tp.handles {
        tp.tx_to_pool.send(Message::Terminate).map_err(to_cv)?;
    }
    Ok(())
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // queued jobs run before the terminate messages are picked up
        if let Err(e) = terminate_all_threads(self) {
            error!("error when dropping worker pool, {e:?}");
        }
    }
}

#[cfg(test)]
use std::time::Duration;

#[test]
fn test_pool_runs_all_jobs() -> CvResult<()> {
    let tp = WorkerPool::new(3)?;
    assert_eq!(tp.n_threads(), 3);
    let (tx, rx) = mpsc::channel();
    for i in 0..20 {
        let tx = tx.clone();
        let job_id = tp.apply(Box::new(move || {
            thread::sleep(Duration::from_millis(2));
            tx.send(i).unwrap();
        }))?;
        assert_eq!(job_id, i as u64);
    }
    let mut results = (0..20)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).map_err(to_cv))
        .collect::<CvResult<Vec<i32>>>()?;
    results.sort();
    assert_eq!(results, (0..20).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_slow_job_does_not_block_others() -> CvResult<()> {
    let tp = WorkerPool::new(2)?;
    let (tx_gate, rx_gate) = mpsc::channel::<()>();
    let (tx, rx) = mpsc::channel();
    let tx_slow = tx.clone();
    tp.apply(Box::new(move || {
        rx_gate.recv_timeout(Duration::from_secs(5)).ok();
        tx_slow.send("slow").unwrap();
    }))?;
    tp.apply(Box::new(move || tx.send("fast").unwrap()))?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).map_err(to_cv)?, "fast");
    let mut n_polls = 0;
    while tp.n_busy() != 1 && n_polls < 500 {
        thread::sleep(Duration::from_millis(1));
        n_polls += 1;
    }
    assert_eq!(tp.n_busy(), 1);
    tx_gate.send(()).map_err(to_cv)?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).map_err(to_cv)?, "slow");
    Ok(())
}

#[test]
fn test_zero_threads() -> CvResult<()> {
    let tp = WorkerPool::new(0)?;
    assert_eq!(tp.n_threads(), 1);
    Ok(())
}
