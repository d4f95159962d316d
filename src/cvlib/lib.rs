pub mod cache;
pub mod cfg;
mod controller;
mod decode;
pub mod fetch;
pub mod file_util;
pub mod result;
mod runner;
mod surface;
mod task;
#[cfg(test)]
mod test_helpers;
mod threadpool;
pub mod tracing_setup;
mod types;
pub use controller::{LoadController, LoadStats};
pub use decode::{downsample, Decode, ImageDecoder};
pub use runner::{TaskRunner, Waker};
pub use surface::{ImageSurface, Surface};
pub use task::{Completion, LoadTask, TaskHandle, TaskState};
pub use threadpool::WorkerPool;
pub use types::{FidelityMode, LoadOutcome, Resource, ResourceKey, REDUCED_SAMPLE_FACTOR};
