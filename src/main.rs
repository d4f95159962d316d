#![deny(clippy::all)]
#![forbid(unsafe_code)]

use std::{ops::Deref, panic, sync::Arc, time::Duration};

use clap::Parser;
use cvlib::{
    cache::{cache_from_cfg, ResourceCache},
    cfg::{get_cfg, get_cfg_path, write_cfg},
    result::{trace_ok_err, CvResult},
    tracing_setup, FidelityMode, ImageSurface, LoadController, LoadOutcome, TaskRunner,
};
use tracing::{error, info};

/// Loads images into a headless surface through the configured cache and prints what was bound.
#[derive(Parser)]
struct Cli {
    /// http(s) or file urls
    urls: Vec<String>,
    /// load with half the width and height
    #[arg(short, long)]
    reduced: bool,
    #[arg(short, long, default_value_t = 30000)]
    timeout_ms: u64,
    /// write the active config to ~/.cvimage/cv_cfg.toml, e.g., to create an editable default
    #[arg(long)]
    write_cfg: bool,
}

fn load_all(cli: Cli) -> CvResult<()> {
    let cfg = get_cfg()?;
    if cli.write_cfg {
        write_cfg(&cfg)?;
        info!("wrote config to {:?}", get_cfg_path()?);
    }
    let cache = cache_from_cfg(&cfg)?;
    let runner = Arc::new(TaskRunner::from_cfg(&cfg)?);
    let mut ctrl = LoadController::new(ImageSurface::new(), cache.clone(), runner);
    let fidelity = if cli.reduced {
        FidelityMode::Reduced
    } else {
        FidelityMode::FullSize
    };
    let timeout = Duration::from_millis(cli.timeout_ms);
    for url in &cli.urls {
        let Some(outcome) = trace_ok_err(ctrl.request_load(url, fidelity)) else {
            continue;
        };
        if outcome == LoadOutcome::MissAsync && !ctrl.wait_for_completion(timeout) {
            error!("loading {url} timed out");
            ctrl.cancel();
            continue;
        }
        match ctrl.surface().resource() {
            Some(res) => {
                let (w, h) = res.dimensions();
                println!("{url} {w}x{h} {outcome:?}");
            }
            None => println!("{url} failed"),
        }
    }
    let stats = ctrl.stats();
    info!("{stats:?}");
    cache.flush(timeout)?;
    Ok(())
}

fn main() {
    let _guard_flush_to_logfile = tracing_setup::tracing_setup();
    if let Err(e) = panic::catch_unwind(|| {
        let cli = Cli::parse();
        trace_ok_err(load_all(cli));
    }) {
        let panic_s = e
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| e.downcast_ref::<&'static str>().map(Deref::deref));
        error!("{:?}", panic_s);
        let b = tracing_setup::BACKTRACE.with(|b| b.borrow_mut().take());
        error!("{:?}", b);
    }
}
