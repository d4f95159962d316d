use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use parking_lot::Mutex;

use crate::{
    cache::{MemoryCache, ResourceCache},
    cverr,
    fetch::{ByteStream, Fetch},
    result::{to_cv, CvResult, ErrorKind},
    surface::Surface,
    types::{Resource, ResourceKey},
};

const GATE_TIMEOUT: Duration = Duration::from_secs(5);

fn gradient(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    }))
}

pub fn rgb_resource(key: &str, w: u32, h: u32) -> CvResult<Resource> {
    Ok(Resource::new(ResourceKey::parse(key)?, gradient(w, h)))
}

pub fn png_bytes(w: u32, h: u32) -> CvResult<Vec<u8>> {
    let mut bytes = vec![];
    gradient(w, h)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .map_err(to_cv)?;
    Ok(bytes)
}

/// Polls `f` until it returns `true`.
pub fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> CvResult<()> {
    let start = Instant::now();
    while !f() {
        if start.elapsed() > timeout {
            return Err(cverr!("condition not met within {:?}", timeout));
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

enum Source {
    Bytes(Vec<u8>),
    Gated(Vec<u8>, Arc<Mutex<Receiver<()>>>),
    Failing(ErrorKind),
}

/// In-memory transport. Unknown keys fail with [`ErrorKind::Io`]. Gated sources block in `open`
/// until the gate is released.
#[derive(Default)]
pub struct MockFetcher {
    sources: Mutex<HashMap<String, Source>>,
    opened: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn add(&self, key: &str, bytes: Vec<u8>) {
        self.sources
            .lock()
            .insert(key.to_string(), Source::Bytes(bytes));
    }
    pub fn add_failing(&self, key: &str, kind: ErrorKind) {
        self.sources
            .lock()
            .insert(key.to_string(), Source::Failing(kind));
    }
    /// Sending on the returned channel lets the pending `open` continue.
    pub fn add_gated(&self, key: &str, bytes: Vec<u8>) -> Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.sources.lock().insert(
            key.to_string(),
            Source::Gated(bytes, Arc::new(Mutex::new(rx))),
        );
        tx
    }
    pub fn n_opened(&self) -> usize {
        self.opened.lock().len()
    }
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl Fetch for MockFetcher {
    fn open(&self, key: &ResourceKey) -> CvResult<ByteStream> {
        self.opened.lock().push(key.as_str().to_string());
        let (bytes, gate) = match self.sources.lock().get(key.as_str()) {
            Some(Source::Bytes(bytes)) => (bytes.clone(), None),
            Some(Source::Gated(bytes, gate)) => (bytes.clone(), Some(gate.clone())),
            Some(Source::Failing(kind)) => {
                return Err(cverr!(*kind; "mock failure for {}", key));
            }
            None => return Err(cverr!(ErrorKind::Io; "{} not found", key)),
        };
        if let Some(gate) = gate {
            gate.lock().recv_timeout(GATE_TIMEOUT).ok();
        }
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Keeps the bound resource and the keys of all binds, `None` for clears.
#[derive(Default)]
pub struct RecordingSurface {
    current: Option<Resource>,
    bound_keys: Vec<Option<String>>,
}

impl RecordingSurface {
    pub fn current(&self) -> Option<&Resource> {
        self.current.as_ref()
    }
    pub fn is_bound(&self) -> bool {
        self.current.is_some()
    }
    pub fn n_binds(&self) -> usize {
        self.bound_keys.len()
    }
    pub fn bound_keys(&self) -> Vec<Option<String>> {
        self.bound_keys.clone()
    }
}

impl Surface for RecordingSurface {
    fn bind(&mut self, resource: Option<Resource>) {
        self.bound_keys
            .push(resource.as_ref().map(|r| r.key().as_str().to_string()));
        self.current = resource;
    }
}

/// Memory cache that records its traffic.
pub struct CountingCache {
    inner: MemoryCache,
    n_gets: AtomicUsize,
    put_keys: Mutex<Vec<String>>,
}

impl Default for CountingCache {
    fn default() -> Self {
        Self {
            inner: MemoryCache::with_limits(64, usize::MAX),
            n_gets: AtomicUsize::new(0),
            put_keys: Mutex::new(vec![]),
        }
    }
}

impl CountingCache {
    pub fn n_gets(&self) -> usize {
        self.n_gets.load(Ordering::SeqCst)
    }
    pub fn put_keys(&self) -> Vec<String> {
        self.put_keys.lock().clone()
    }
}

impl ResourceCache for CountingCache {
    fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.n_gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }
    fn put(&self, resource: Resource) {
        self.put_keys
            .lock()
            .push(resource.key().as_str().to_string());
        self.inner.put(resource);
    }
    fn clear(&self) -> CvResult<()> {
        self.put_keys.lock().clear();
        self.inner.clear()
    }
}
