use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use tracing::{debug, warn};

use crate::{
    cverr,
    decode::Decode,
    fetch::Fetch,
    result::{CvResult, ErrorKind},
    types::{FidelityMode, Resource, ResourceKey},
};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

const CHUNK_SIZE: usize = 16 * 1024;

/// `Pending` moves exactly once, either to `Completed` or to `Cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Completed,
    Cancelled,
}

/// Result of a task that reached [`TaskState::Completed`]. `resource` is `None` if fetching or
/// decoding failed.
#[derive(Clone, Debug)]
pub struct Completion {
    pub task_id: u64,
    pub key: ResourceKey,
    pub resource: Option<Resource>,
}

/// Shared view on a [`LoadTask`], kept by the controller to cancel the task and to recognize its
/// completion.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: u64,
    key: ResourceKey,
    fidelity: FidelityMode,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
    pub fn fidelity(&self) -> FidelityMode {
        self.fidelity
    }
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            PENDING => TaskState::Pending,
            COMPLETED => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }
    /// Returns `true` if the task was pending and is cancelled now. Cancelling a completed task
    /// has no effect.
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }
    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Fetches and decodes one resource. Cancellation is cooperative, the flag is checked before
/// opening the stream, between chunks, after reading and after decoding.
#[derive(Debug)]
pub struct LoadTask {
    handle: TaskHandle,
}

impl LoadTask {
    pub fn new(id: u64, key: ResourceKey, fidelity: FidelityMode) -> Self {
        Self {
            handle: TaskHandle {
                id,
                key,
                fidelity,
                state: Arc::new(AtomicU8::new(PENDING)),
            },
        }
    }
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }
    pub fn id(&self) -> u64 {
        self.handle.id
    }
    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    /// Reads the stream until the end. `Ok(None)` means the task was cancelled in between.
    fn read_all(&self, stream: &mut dyn Read) -> CvResult<Option<Vec<u8>>> {
        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if self.handle.is_cancelled() {
                return Ok(None);
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(Some(bytes)),
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(cverr!(
                        ErrorKind::Io; "reading {} failed after {} bytes, {:?}",
                        self.handle.key,
                        bytes.len(),
                        e
                    ))
                }
            }
        }
    }

    fn cancelled(&self) -> Option<Completion> {
        debug!("task {} for {} was cancelled", self.id(), self.handle.key);
        None
    }

    /// Moves to `Completed` unless the task was cancelled in the meantime.
    fn complete(&self, resource: Option<Resource>) -> Option<Completion> {
        if self.handle.transition(COMPLETED) {
            Some(Completion {
                task_id: self.id(),
                key: self.handle.key.clone(),
                resource,
            })
        } else {
            self.cancelled()
        }
    }

    /// Completes the task without a resource, used if running it went wrong unexpectedly.
    pub fn fail(&self) -> Option<Completion> {
        self.complete(None)
    }

    /// Runs on a worker thread. Returns the completion to deliver or `None` if the task was
    /// cancelled, in which case nothing must be delivered.
    pub fn run(&self, fetcher: &dyn Fetch, decoder: &dyn Decode) -> Option<Completion> {
        let TaskHandle { key, fidelity, .. } = &self.handle;
        if self.handle.is_cancelled() {
            return self.cancelled();
        }
        let fetched = fetcher
            .open(key)
            .and_then(|mut stream| self.read_all(&mut *stream));
        let resource = match fetched {
            Ok(Some(bytes)) => {
                debug!("task {} read {} bytes from {key}", self.id(), bytes.len());
                if self.handle.is_cancelled() {
                    return self.cancelled();
                }
                let im = decoder.decode(&bytes, *fidelity);
                if self.handle.is_cancelled() {
                    return self.cancelled();
                }
                match im.map(|im| Resource::new(key.clone(), im)) {
                    Some(resource) if resource.has_valid_payload() => Some(resource),
                    _ => {
                        warn!("could not decode {key}");
                        None
                    }
                }
            }
            Ok(None) => return self.cancelled(),
            Err(e) => {
                warn!("could not fetch {key}, {e}");
                None
            }
        };
        self.complete(resource)
    }
}

#[cfg(test)]
use crate::{
    decode::ImageDecoder,
    test_helpers::{png_bytes, MockFetcher},
};
#[cfg(test)]
use image::GenericImageView;
#[cfg(test)]
use std::{thread, time::Duration};

#[cfg(test)]
fn make_task(id: u64, key: &str, fidelity: FidelityMode) -> CvResult<LoadTask> {
    Ok(LoadTask::new(id, ResourceKey::parse(key)?, fidelity))
}

#[test]
fn test_run_success() -> CvResult<()> {
    let fetcher = MockFetcher::default();
    fetcher.add("https://x/img.png", png_bytes(200, 200)?);
    let task = make_task(7, "https://x/img.png", FidelityMode::Reduced)?;
    let completion = task
        .run(&fetcher, &ImageDecoder)
        .ok_or_else(|| cverr!("no completion"))?;
    assert_eq!(completion.task_id, 7);
    assert_eq!(completion.key.as_str(), "https://x/img.png");
    let resource = completion.resource.ok_or_else(|| cverr!("no resource"))?;
    assert_eq!(resource.image().dimensions(), (100, 100));
    assert_eq!(task.state(), TaskState::Completed);
    // a completed task cannot be cancelled anymore
    assert!(!task.handle().cancel());
    assert_eq!(task.state(), TaskState::Completed);
    Ok(())
}

#[test]
fn test_run_failures() -> CvResult<()> {
    let fetcher = MockFetcher::default();
    fetcher.add("https://x/garbage.png", b"garbage".to_vec());
    fetcher.add_failing("bad-url", ErrorKind::MalformedUrl);
    for key in ["https://x/garbage.png", "bad-url", "https://x/unknown.png"] {
        let task = make_task(1, key, FidelityMode::FullSize)?;
        let completion = task
            .run(&fetcher, &ImageDecoder)
            .ok_or_else(|| cverr!("no completion for {}", key))?;
        assert!(completion.resource.is_none());
        assert_eq!(task.state(), TaskState::Completed);
    }
    Ok(())
}

#[test]
fn test_cancel_before_run() -> CvResult<()> {
    let fetcher = MockFetcher::default();
    fetcher.add("https://x/img.png", png_bytes(4, 4)?);
    let task = make_task(1, "https://x/img.png", FidelityMode::FullSize)?;
    assert!(task.handle().cancel());
    assert!(!task.handle().cancel());
    assert!(task.run(&fetcher, &ImageDecoder).is_none());
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(fetcher.n_opened(), 0);
    // failing a cancelled task does not revive it
    assert!(task.fail().is_none());
    Ok(())
}

#[test]
fn test_cancel_while_fetching() -> CvResult<()> {
    let fetcher = MockFetcher::default();
    let release = fetcher.add_gated("https://x/slow.png", png_bytes(4, 4)?);
    let task = make_task(3, "https://x/slow.png", FidelityMode::FullSize)?;
    let handle = task.handle();
    let worker = thread::spawn(move || task.run(&fetcher, &ImageDecoder).is_some());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(handle.state(), TaskState::Pending);
    assert!(handle.cancel());
    release.send(()).ok();
    let delivered = worker.join().map_err(|_| cverr!("worker panicked"))?;
    assert!(!delivered);
    assert_eq!(handle.state(), TaskState::Cancelled);
    Ok(())
}

#[test]
fn test_read_stops_between_chunks() -> CvResult<()> {
    struct EndlessStream {
        handle: TaskHandle,
        n_reads: usize,
    }
    impl Read for EndlessStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.n_reads += 1;
            if self.n_reads == 3 {
                self.handle.cancel();
            }
            Ok(buf.len())
        }
    }
    let task = make_task(1, "https://x/endless.png", FidelityMode::FullSize)?;
    let mut stream = EndlessStream {
        handle: task.handle(),
        n_reads: 0,
    };
    assert_eq!(task.read_all(&mut stream)?, None);
    assert_eq!(stream.n_reads, 3);
    Ok(())
}
