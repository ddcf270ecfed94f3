mod api;
mod config;
mod processing;
mod types;
mod version;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use config::Config;
use processing::launcher::is_launch_rejection;

fn main() {
    if let Err(err) = run() {
        if is_launch_rejection(&err) {
            // Already reported as a warning.
            std::process::exit(2);
        }
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    processing::run(&cfg, shutdown)
}
