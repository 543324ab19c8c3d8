//! Spinning triangle demo.
//!
//! Run with `cargo run -p tessera-demos --bin triangle`, or add
//! `-- --headless --frames 60` to exercise the frame loop without a GPU.

use std::process::ExitCode;

use clap::Parser;

use tessera_demos::{app, Args};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("Tessera demos v{}", tessera_demos::VERSION);
    tessera_graphics::init();

    match app::run(&args) {
        Ok(stats) => {
            log::info!(
                "Presented {} frames ({} retried, {} swapchain recreations)",
                stats.presented,
                stats.retries,
                stats.recreations
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Triangle demo failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
