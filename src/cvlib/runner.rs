use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
        Arc,
    },
};

use tracing::{debug, error};

use crate::{
    cfg::Cfg,
    decode::{Decode, ImageDecoder},
    fetch::{Fetch, SchemeFetcher},
    result::CvResult,
    task::{Completion, LoadTask},
    threadpool::WorkerPool,
};

/// Called from the worker thread after a completion has been queued for a controller.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Runs load tasks of all controllers of an application on a shared worker pool.
pub struct TaskRunner {
    pool: WorkerPool,
    fetcher: Arc<dyn Fetch>,
    decoder: Arc<dyn Decode>,
    next_task_id: AtomicU64,
}

impl TaskRunner {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        decoder: Arc<dyn Decode>,
        n_threads: usize,
    ) -> CvResult<Self> {
        Ok(Self {
            pool: WorkerPool::new(n_threads)?,
            fetcher,
            decoder,
            next_task_id: AtomicU64::new(0),
        })
    }
    pub fn from_cfg(cfg: &Cfg) -> CvResult<Self> {
        Self::new(
            Arc::new(SchemeFetcher::from_cfg(cfg)?),
            Arc::new(ImageDecoder),
            cfg.n_threads(),
        )
    }
    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }
    /// Number of tasks that are running right now, cancelled ones included.
    pub fn n_busy(&self) -> usize {
        self.pool.n_busy()
    }
    pub fn n_threads(&self) -> usize {
        self.pool.n_threads()
    }

    /// Queues the task. Its completion is sent to `tx_completion` unless the task is cancelled.
    pub fn spawn(
        &self,
        task: LoadTask,
        tx_completion: Sender<Completion>,
        waker: Option<Waker>,
    ) -> CvResult<()> {
        let fetcher = self.fetcher.clone();
        let decoder = self.decoder.clone();
        let task_id = task.id();
        let job = move || {
            let run = panic::catch_unwind(AssertUnwindSafe(|| task.run(&*fetcher, &*decoder)));
            let completion = match run {
                Ok(completion) => completion,
                Err(_) => {
                    error!("load task {task_id} panicked");
                    task.fail()
                }
            };
            if let Some(completion) = completion {
                if tx_completion.send(completion).is_err() {
                    debug!("controller of task {task_id} is gone, dropping its result");
                    return;
                }
                if let Some(waker) = waker {
                    waker();
                }
            }
        };
        self.pool.apply(Box::new(job))?;
        debug!("queued load task {task_id}");
        Ok(())
    }
}

#[cfg(test)]
use {
    crate::{
        cverr,
        result::to_cv,
        test_helpers::{png_bytes, MockFetcher},
        types::{FidelityMode, ResourceKey},
    },
    std::{
        sync::{atomic::AtomicUsize, mpsc},
        time::Duration,
    },
};

#[test]
fn test_spawn_delivers_and_wakes() -> CvResult<()> {
    let fetcher = Arc::new(MockFetcher::default());
    fetcher.add("https://x/img.png", png_bytes(8, 8)?);
    let runner = TaskRunner::new(fetcher, Arc::new(ImageDecoder), 2)?;
    let n_wakes = Arc::new(AtomicUsize::new(0));
    let n_wakes_ = n_wakes.clone();
    let waker: Waker = Arc::new(move || {
        n_wakes_.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, rx) = mpsc::channel();
    let id = runner.next_task_id();
    let task = LoadTask::new(
        id,
        ResourceKey::parse("https://x/img.png")?,
        FidelityMode::FullSize,
    );
    runner.spawn(task, tx, Some(waker))?;
    let completion = rx.recv_timeout(Duration::from_secs(5)).map_err(to_cv)?;
    assert_eq!(completion.task_id, id);
    assert!(completion.resource.is_some());
    // the waker runs right after sending
    for _ in 0..500 {
        if n_wakes.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(n_wakes.load(Ordering::SeqCst), 1);
    assert_ne!(runner.next_task_id(), id);
    Ok(())
}

#[test]
fn test_panicking_decoder_fails_task() -> CvResult<()> {
    struct PanicDecoder;
    impl Decode for PanicDecoder {
        fn decode(&self, _: &[u8], _: FidelityMode) -> Option<image::DynamicImage> {
            panic!("decoder bug");
        }
    }
    let fetcher = Arc::new(MockFetcher::default());
    fetcher.add("https://x/img.png", png_bytes(8, 8)?);
    let runner = TaskRunner::new(fetcher, Arc::new(PanicDecoder), 1)?;
    let (tx, rx) = mpsc::channel();
    let task = LoadTask::new(0, ResourceKey::parse("https://x/img.png")?, FidelityMode::FullSize);
    runner.spawn(task, tx, None)?;
    let completion = rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|e| cverr!("no completion {:?}", e))?;
    assert!(completion.resource.is_none());
    Ok(())
}
