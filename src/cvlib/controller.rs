use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, info};

use crate::{
    cache::ResourceCache,
    result::CvResult,
    runner::{TaskRunner, Waker},
    surface::Surface,
    task::{Completion, LoadTask, TaskHandle},
    types::{FidelityMode, LoadOutcome, ResourceKey},
};

/// Counters of a [`LoadController`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub requests: usize,
    pub invalid_keys: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub tasks_cancelled: usize,
    /// completions bound with a resource
    pub loaded: usize,
    /// completions bound without a resource since fetching or decoding failed
    pub failed: usize,
    /// completions that arrived after a newer request and were not bound
    pub superseded: usize,
}

/// Loads resources into one surface. At most one load task is authoritative at any time, a new
/// request cancels the previous one, and results of outdated tasks never reach the surface.
///
/// The controller is owned by a single thread. Completions of the background tasks are queued
/// and only applied by [`process_completions`](LoadController::process_completions) or
/// [`wait_for_completion`](LoadController::wait_for_completion) on the owning thread, so checking
/// whether a task is still current and binding its result cannot interleave with a request.
pub struct LoadController<S, C>
where
    S: Surface,
    C: ResourceCache + ?Sized,
{
    surface: S,
    cache: Arc<C>,
    runner: Arc<TaskRunner>,
    current: Option<TaskHandle>,
    tx_completion: Sender<Completion>,
    rx_completion: Receiver<Completion>,
    waker: Option<Waker>,
    stats: LoadStats,
}

impl<S, C> LoadController<S, C>
where
    S: Surface,
    C: ResourceCache + ?Sized,
{
    pub fn new(surface: S, cache: Arc<C>, runner: Arc<TaskRunner>) -> Self {
        let (tx_completion, rx_completion) = mpsc::channel();
        Self {
            surface,
            cache,
            runner,
            current: None,
            tx_completion,
            rx_completion,
            waker: None,
            stats: LoadStats::default(),
        }
    }

    /// `waker` is called from a worker thread whenever a completion is ready to be processed,
    /// e.g., to request a repaint of the gui that then calls
    /// [`process_completions`](LoadController::process_completions).
    pub fn with_waker<F>(mut self, waker: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.waker = Some(Arc::new(waker));
        self
    }

    /// Binds the resource of `key` synchronously if the cache has it. Otherwise, the surface is
    /// cleared and a load task is started. Only an invalid key is an error, failing loads end up
    /// as an empty surface.
    pub fn request_load(&mut self, key: &str, fidelity: FidelityMode) -> CvResult<LoadOutcome> {
        self.stats.requests += 1;
        let key = ResourceKey::parse(key).map_err(|e| {
            self.stats.invalid_keys += 1;
            e
        })?;
        // results that are ready belong to the cache before we look into it
        self.process_completions();
        self.cancel();

        if let Some(resource) = self.cache.get(&key).filter(|r| r.has_valid_payload()) {
            debug!("cache hit for {key}");
            self.stats.cache_hits += 1;
            self.surface.bind(Some(resource));
            return Ok(LoadOutcome::HitSync);
        }
        self.stats.cache_misses += 1;
        self.surface.bind(None);

        let task = LoadTask::new(self.runner.next_task_id(), key, fidelity);
        let handle = task.handle();
        match self
            .runner
            .spawn(task, self.tx_completion.clone(), self.waker.clone())
        {
            Ok(_) => {
                debug!("task {} loads {}", handle.id(), handle.key());
                self.current = Some(handle);
            }
            Err(e) => {
                error!("could not start loading {}, {e:?}", handle.key());
                self.stats.failed += 1;
            }
        }
        Ok(LoadOutcome::MissAsync)
    }

    /// Cancels the current task, if any. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.current.take() {
            Some(handle) => {
                if handle.cancel() {
                    debug!("cancelled task {} for {}", handle.id(), handle.key());
                    self.stats.tasks_cancelled += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Applies all queued completions. Returns how many of them were bound to the surface, which
    /// is at most one.
    pub fn process_completions(&mut self) -> usize {
        let completions = self.rx_completion.try_iter().collect::<Vec<_>>();
        completions
            .into_iter()
            .map(|c| self.apply_completion(c))
            .filter(|bound| *bound)
            .count()
    }

    /// Blocks until the current task's result is bound or `timeout` elapsed. Returns `true` if no
    /// task is outstanding anymore.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.process_completions();
        while self.current.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.rx_completion.recv_timeout(deadline - now) {
                Ok(completion) => {
                    self.apply_completion(completion);
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("completion channel disconnected");
                    return false;
                }
            }
        }
        true
    }

    fn apply_completion(&mut self, completion: Completion) -> bool {
        let Completion {
            task_id,
            key,
            resource,
        } = completion;
        let is_current = self.current.as_ref().map(|h| h.id()) == Some(task_id);
        if is_current {
            self.current = None;
            if resource.is_some() {
                self.stats.loaded += 1;
            } else {
                self.stats.failed += 1;
            }
            self.surface.bind(resource.clone());
        } else {
            debug!("task {task_id} for {key} was superseded, not binding its result");
            self.stats.superseded += 1;
        }
        if let Some(resource) = resource.filter(|r| r.has_valid_payload()) {
            info!("caching {key}");
            self.cache.put(resource);
        }
        is_current
    }

    pub fn is_loading(&self) -> bool {
        self.current.is_some()
    }
    /// Key of the task that is in flight.
    pub fn loading_key(&self) -> Option<&ResourceKey> {
        self.current.as_ref().map(|h| h.key())
    }
    pub fn current_task(&self) -> Option<&TaskHandle> {
        self.current.as_ref()
    }
    pub fn surface(&self) -> &S {
        &self.surface
    }
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }
    pub fn stats(&self) -> LoadStats {
        self.stats
    }
}

impl<S, C> Drop for LoadController<S, C>
where
    S: Surface,
    C: ResourceCache + ?Sized,
{
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
use {
    crate::{
        cache::MemoryCache,
        cverr,
        decode::ImageDecoder,
        result::ErrorKind,
        task::TaskState,
        test_helpers::{
            png_bytes, rgb_resource, wait_until, CountingCache, MockFetcher, RecordingSurface,
        },
    },
    image::GenericImageView,
    std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    },
};

#[cfg(test)]
const TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
type Ctrl = LoadController<RecordingSurface, CountingCache>;

#[cfg(test)]
fn setup(n_threads: usize) -> CvResult<(Ctrl, Arc<MockFetcher>, Arc<TaskRunner>)> {
    crate::tracing_setup::init_tracing_for_tests();
    let fetcher = Arc::new(MockFetcher::default());
    let runner = Arc::new(TaskRunner::new(
        fetcher.clone(),
        Arc::new(ImageDecoder),
        n_threads,
    )?);
    let cache = Arc::new(CountingCache::default());
    let ctrl = LoadController::new(RecordingSurface::default(), cache, runner.clone());
    Ok((ctrl, fetcher, runner))
}

#[test]
fn test_invalid_key() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(1)?;
    let release = fetcher.add_gated("https://x/a.png", png_bytes(2, 2)?);
    ctrl.request_load("https://x/a.png", FidelityMode::FullSize)?;
    let n_binds = ctrl.surface().n_binds();
    let err = ctrl.request_load("  ", FidelityMode::FullSize).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    // nothing changed, the running task is still current
    assert_eq!(ctrl.surface().n_binds(), n_binds);
    assert_eq!(ctrl.cache().n_gets(), 1);
    assert_eq!(ctrl.loading_key().map(|k| k.as_str()), Some("https://x/a.png"));
    assert_eq!(ctrl.stats().invalid_keys, 1);
    release.send(()).ok();
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert!(ctrl.surface().is_bound());
    Ok(())
}

#[test]
fn test_wait_times_out_while_loading() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(1)?;
    let release = fetcher.add_gated("https://x/slow.png", png_bytes(4, 4)?);
    ctrl.request_load("https://x/slow.png", FidelityMode::FullSize)?;
    assert!(!ctrl.wait_for_completion(Duration::from_millis(20)));
    assert!(ctrl.is_loading());
    assert!(!ctrl.surface().is_bound());
    release.send(()).map_err(|e| cverr!("gate closed {:?}", e))?;
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert!(!ctrl.is_loading());
    assert!(ctrl.surface().is_bound());
    Ok(())
}

#[test]
fn test_cache_hit_is_sync() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(1)?;
    let res = rgb_resource("https://x/img.png", 3, 3)?;
    ctrl.cache().put(res.clone());
    for fidelity in [FidelityMode::FullSize, FidelityMode::Reduced] {
        let outcome = ctrl.request_load("https://x/img.png", fidelity)?;
        assert_eq!(outcome, LoadOutcome::HitSync);
        assert!(!ctrl.is_loading());
        assert!(ctrl.surface().current().map(|r| r.ptr_eq(&res)) == Some(true));
    }
    assert_eq!(fetcher.n_opened(), 0);
    assert_eq!(ctrl.stats().cache_hits, 2);
    Ok(())
}

#[test]
fn test_miss_starts_one_task() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(2)?;
    fetcher.add("https://x/img.png", png_bytes(200, 200)?);
    let outcome = ctrl.request_load("https://x/img.png", FidelityMode::Reduced)?;
    assert_eq!(outcome, LoadOutcome::MissAsync);
    let task = ctrl.current_task().ok_or_else(|| cverr!("no task"))?;
    assert_eq!(task.fidelity(), FidelityMode::Reduced);
    assert_eq!(task.key().as_str(), "https://x/img.png");
    // cleared while loading
    assert_eq!(ctrl.surface().bound_keys(), vec![None]);
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert_eq!(fetcher.opened(), vec!["https://x/img.png".to_string()]);
    let bound = ctrl.surface().current().ok_or_else(|| cverr!("not bound"))?;
    assert_eq!(bound.image().dimensions(), (100, 100));
    assert_eq!(ctrl.cache().put_keys(), vec!["https://x/img.png".to_string()]);
    assert_eq!(ctrl.stats().loaded, 1);
    Ok(())
}

#[test]
fn test_rerequest_hits_after_completion() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(1)?;
    fetcher.add("https://x/img.png", png_bytes(10, 10)?);
    assert_eq!(
        ctrl.request_load("https://x/img.png", FidelityMode::FullSize)?,
        LoadOutcome::MissAsync
    );
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert_eq!(
        ctrl.request_load("https://x/img.png", FidelityMode::FullSize)?,
        LoadOutcome::HitSync
    );
    assert_eq!(fetcher.n_opened(), 1);
    Ok(())
}

#[test]
fn test_rerequest_picks_up_unprocessed_completion() -> CvResult<()> {
    let (mut ctrl, fetcher, runner) = setup(1)?;
    fetcher.add("https://x/img.png", png_bytes(10, 10)?);
    ctrl.request_load("https://x/img.png", FidelityMode::FullSize)?;
    wait_until(TIMEOUT, || fetcher.n_opened() == 1 && runner.n_busy() == 0)?;
    // the result sits in the queue, the request applies it before consulting the cache
    assert_eq!(
        ctrl.request_load("https://x/img.png", FidelityMode::FullSize)?,
        LoadOutcome::HitSync
    );
    assert_eq!(fetcher.n_opened(), 1);
    assert_eq!(ctrl.stats().superseded, 0);
    Ok(())
}

#[test]
fn test_supersession_late_first() -> CvResult<()> {
    let (mut ctrl, fetcher, runner) = setup(2)?;
    let release_1 = fetcher.add_gated("https://x/1.png", png_bytes(10, 10)?);
    fetcher.add("https://x/2.png", png_bytes(20, 20)?);
    ctrl.request_load("https://x/1.png", FidelityMode::FullSize)?;
    let first = ctrl.current_task().cloned().ok_or_else(|| cverr!("no task"))?;
    ctrl.request_load("https://x/2.png", FidelityMode::FullSize)?;
    assert_eq!(first.state(), TaskState::Cancelled);
    assert!(ctrl.wait_for_completion(TIMEOUT));
    // 1 finishes after 2
    release_1.send(()).ok();
    wait_until(TIMEOUT, || runner.n_busy() == 0 && fetcher.n_opened() == 2)?;
    ctrl.process_completions();
    let bound = ctrl.surface().current().ok_or_else(|| cverr!("not bound"))?;
    assert_eq!(bound.key().as_str(), "https://x/2.png");
    assert_eq!(ctrl.cache().put_keys(), vec!["https://x/2.png".to_string()]);
    assert_eq!(ctrl.stats().tasks_cancelled, 1);
    Ok(())
}

#[test]
fn test_supersession_late_second() -> CvResult<()> {
    let (mut ctrl, fetcher, runner) = setup(2)?;
    let release_1 = fetcher.add_gated("https://x/1.png", png_bytes(10, 10)?);
    let release_2 = fetcher.add_gated("https://x/2.png", png_bytes(20, 20)?);
    ctrl.request_load("https://x/1.png", FidelityMode::FullSize)?;
    ctrl.request_load("https://x/2.png", FidelityMode::FullSize)?;
    release_1.send(()).ok();
    wait_until(TIMEOUT, || fetcher.n_opened() == 2 && runner.n_busy() == 1)?;
    assert_eq!(ctrl.process_completions(), 0);
    assert!(!ctrl.surface().is_bound());
    release_2.send(()).ok();
    assert!(ctrl.wait_for_completion(TIMEOUT));
    let bound = ctrl.surface().current().ok_or_else(|| cverr!("not bound"))?;
    assert_eq!(bound.key().as_str(), "https://x/2.png");
    // only clears and the final bind
    assert_eq!(
        ctrl.surface().bound_keys(),
        vec![None, None, Some("https://x/2.png".to_string())]
    );
    Ok(())
}

#[test]
fn test_completed_but_superseded_is_cached_not_bound() -> CvResult<()> {
    let (mut ctrl, fetcher, runner) = setup(1)?;
    fetcher.add("https://x/1.png", png_bytes(10, 10)?);
    ctrl.request_load("https://x/1.png", FidelityMode::FullSize)?;
    let first = ctrl.current_task().cloned().ok_or_else(|| cverr!("no task"))?;
    wait_until(TIMEOUT, || first.state() == TaskState::Completed && runner.n_busy() == 0)?;
    // too late to cancel, the result is on its way
    assert!(ctrl.cancel());
    assert_eq!(first.state(), TaskState::Completed);
    assert_eq!(ctrl.process_completions(), 0);
    assert!(!ctrl.surface().is_bound());
    assert_eq!(ctrl.cache().put_keys(), vec!["https://x/1.png".to_string()]);
    assert_eq!(ctrl.stats().superseded, 1);
    assert_eq!(ctrl.stats().tasks_cancelled, 0);
    Ok(())
}

#[test]
fn test_failures_bind_nothing_and_cache_nothing() -> CvResult<()> {
    let (mut ctrl, fetcher, _) = setup(1)?;
    fetcher.add_failing("bad-url", ErrorKind::MalformedUrl);
    fetcher.add_failing("https://x/down.png", ErrorKind::Io);
    fetcher.add("https://x/garbage.png", b"<html>".to_vec());
    fetcher.add("https://x/ok.png", png_bytes(4, 4)?);
    for key in ["bad-url", "https://x/down.png", "https://x/garbage.png"] {
        // something is bound before, the failure clears it
        ctrl.request_load("https://x/ok.png", FidelityMode::FullSize)?;
        assert!(ctrl.wait_for_completion(TIMEOUT));
        assert!(ctrl.surface().is_bound());
        assert_eq!(
            ctrl.request_load(key, FidelityMode::FullSize)?,
            LoadOutcome::MissAsync
        );
        assert!(ctrl.wait_for_completion(TIMEOUT));
        assert!(!ctrl.surface().is_bound());
    }
    assert_eq!(ctrl.cache().put_keys(), vec!["https://x/ok.png".to_string()]);
    assert_eq!(ctrl.stats().failed, 3);
    Ok(())
}

#[test]
fn test_drop_cancels() -> CvResult<()> {
    let (mut ctrl, fetcher, runner) = setup(1)?;
    let release = fetcher.add_gated("https://x/a.png", png_bytes(2, 2)?);
    ctrl.request_load("https://x/a.png", FidelityMode::FullSize)?;
    let task = ctrl.current_task().cloned().ok_or_else(|| cverr!("no task"))?;
    let cache = ctrl.cache().clone();
    drop(ctrl);
    assert_eq!(task.state(), TaskState::Cancelled);
    release.send(()).ok();
    wait_until(TIMEOUT, || runner.n_busy() == 0 && fetcher.n_opened() == 1)?;
    assert!(cache.put_keys().is_empty());
    Ok(())
}

#[test]
fn test_waker() -> CvResult<()> {
    let (ctrl, fetcher, _) = setup(1)?;
    fetcher.add("https://x/a.png", png_bytes(2, 2)?);
    let n_wakes = Arc::new(AtomicUsize::new(0));
    let n_wakes_ = n_wakes.clone();
    let mut ctrl = ctrl.with_waker(move || {
        n_wakes_.fetch_add(1, Ordering::SeqCst);
    });
    ctrl.request_load("https://x/a.png", FidelityMode::FullSize)?;
    wait_until(TIMEOUT, || n_wakes.load(Ordering::SeqCst) == 1)?;
    assert_eq!(ctrl.process_completions(), 1);
    assert!(!ctrl.is_loading());
    assert!(ctrl.surface().is_bound());
    assert_eq!(ctrl.process_completions(), 0);
    Ok(())
}

#[test]
fn test_controllers_share_cache_and_runner() -> CvResult<()> {
    let (mut ctrl_a, fetcher, runner) = setup(2)?;
    fetcher.add("https://x/a.png", png_bytes(6, 6)?);
    fetcher.add("https://x/b.png", png_bytes(8, 8)?);
    let mut ctrl_b = LoadController::new(
        RecordingSurface::default(),
        ctrl_a.cache().clone(),
        runner.clone(),
    );
    ctrl_a.request_load("https://x/a.png", FidelityMode::FullSize)?;
    // b is owned by another thread
    let handle = thread::spawn(move || -> CvResult<bool> {
        ctrl_b.request_load("https://x/b.png", FidelityMode::FullSize)?;
        let waited = ctrl_b.wait_for_completion(TIMEOUT);
        let bound_b = ctrl_b.surface().current().map(|r| r.key().as_str() == "https://x/b.png");
        Ok(waited && bound_b == Some(true))
    });
    assert!(ctrl_a.wait_for_completion(TIMEOUT));
    assert!(handle.join().map_err(|_| cverr!("thread panicked"))??);
    let bound_a = ctrl_a.surface().current().ok_or_else(|| cverr!("a not bound"))?;
    assert_eq!(bound_a.key().as_str(), "https://x/a.png");
    let mut ctrl_c =
        LoadController::new(RecordingSurface::default(), ctrl_a.cache().clone(), runner);
    for key in ["https://x/a.png", "https://x/b.png"] {
        assert_eq!(
            ctrl_c.request_load(key, FidelityMode::FullSize)?,
            LoadOutcome::HitSync
        );
    }
    Ok(())
}

#[test]
fn test_with_memory_cache_as_trait_object() -> CvResult<()> {
    let (_, fetcher, runner) = setup(1)?;
    fetcher.add("https://x/a.png", png_bytes(6, 6)?);
    let cache: Arc<dyn ResourceCache> = Arc::new(MemoryCache::with_limits(4, usize::MAX));
    let mut ctrl = LoadController::new(RecordingSurface::default(), cache, runner);
    ctrl.request_load("https://x/a.png", FidelityMode::FullSize)?;
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert!(ctrl
        .cache()
        .get(&ResourceKey::parse("https://x/a.png")?)
        .is_some());
    Ok(())
}
