use crate::{cfg::get_default_log_folder, threadpool::WORKER_THREAD_PREFIX};
use backtrace::Backtrace;
use std::{cell::RefCell, io, path::Path, sync::Once, thread};
use tracing::{error, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{writer::MakeWriterExt, Layer},
    prelude::*,
};

thread_local! {
    pub static BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

#[cfg(not(feature = "print_debug"))]
const STDOUT_LEVEL: Level = Level::INFO;
#[cfg(feature = "print_debug")]
const STDOUT_LEVEL: Level = Level::DEBUG;

fn is_worker_thread(thread_name: Option<&str>) -> bool {
    thread_name.is_some_and(|name| name.starts_with(WORKER_THREAD_PREFIX))
}

/// Load tasks run under `catch_unwind` on worker threads, nobody picks up their backtrace later.
/// Hence, it is logged right away. Other threads keep it for `main` in [`BACKTRACE`].
fn panic_hook(msg: &str) {
    let trace = Backtrace::new();
    let current = thread::current();
    if is_worker_thread(current.name()) {
        error!(
            "{} panicked, {msg}\n{trace:?}",
            current.name().unwrap_or_default()
        );
    }
    BACKTRACE.with(move |b| b.borrow_mut().replace(trace));
}

/// Logs to `cvimage.log.<date>` files in `log_folder` and to stdout. Lines carry the thread name
/// such that output of load tasks can be told apart. Keep the returned guard alive until the end of
/// `main`, otherwise buffered log lines are lost.
///
/// # Panics
/// In case a global subscriber has been set already.
pub fn tracing_setup_in(log_folder: &Path) -> WorkerGuard {
    let (file_writer, guard_flush_file) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_folder, "cvimage.log"));
    let file_layer = Layer::new()
        .with_writer(file_writer.with_max_level(Level::INFO))
        .compact()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    let stdout_layer = Layer::new()
        .with_writer(io::stdout.with_max_level(STDOUT_LEVEL))
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();
    std::panic::set_hook(Box::new(|info| panic_hook(&info.to_string())));
    guard_flush_file
}

/// Like [`tracing_setup_in`] with `~/.cvimage/logs` as log folder.
pub fn tracing_setup() -> WorkerGuard {
    tracing_setup_in(&get_default_log_folder())
}

static INIT: Once = Once::new();

pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_thread_names(true)
            .with_test_writer()
            .init();
    });
}

#[test]
fn test_worker_thread_detection() {
    assert!(is_worker_thread(Some(&format!("{WORKER_THREAD_PREFIX}3"))));
    assert!(!is_worker_thread(Some("main")));
    assert!(!is_worker_thread(None));
}
