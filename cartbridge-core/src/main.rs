//! Cartbridge - headless cartridge runner
//!
//! Loads a cartridge, runs `start` once and `update` for a fixed number of
//! frames against the [`Headless`] platform, then tears it down.
//!
//! # Usage
//!
//! ```bash
//! # Run 60 frames of a cartridge
//! CART_PATH=game.wasm cartbridge
//!
//! # Run longer, with a custom name in logs
//! CART_PATH=game.wasm CART_FRAMES=600 CART_DEBUG_NAME=game cartbridge
//!
//! # Show cartridge trace output only
//! RUST_LOG=cart=info CART_PATH=game.wasm cartbridge
//! ```

use std::env;
use std::time::Instant;

use cartbridge_core::{BridgeConfig, Headless, Runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Environment variable for the cartridge file
const ENV_CART_PATH: &str = "CART_PATH";

/// Environment variable for the number of frames to run
const ENV_CART_FRAMES: &str = "CART_FRAMES";

/// Environment variable for the cartridge name used in logs
const ENV_CART_DEBUG_NAME: &str = "CART_DEBUG_NAME";

/// Environment variable for the guest stack limit, in bytes
const ENV_CART_STACK_SIZE: &str = "CART_STACK_SIZE";

const DEFAULT_FRAMES: u64 = 60;

fn main() {
    init_tracing();

    let Ok(path) = env::var(ENV_CART_PATH) else {
        error!(var = ENV_CART_PATH, "No cartridge given");
        std::process::exit(1);
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %path, error = %e, "Failed to read cartridge");
            std::process::exit(1);
        }
    };

    let frames = env::var(ENV_CART_FRAMES)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_FRAMES);

    if let Err(e) = run(build_config(), &bytes, frames) {
        error!(error = %e, "Cartridge run failed");
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cartbridge_core=debug,info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Build bridge configuration from environment.
fn build_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();

    if let Ok(name) = env::var(ENV_CART_DEBUG_NAME) {
        config.debug_name = name;
    }

    if let Some(stack) = env::var(ENV_CART_STACK_SIZE)
        .ok()
        .and_then(|s| s.parse().ok())
    {
        config.max_wasm_stack = stack;
    }

    config
}

fn run(config: BridgeConfig, bytes: &[u8], frames: u64) -> cartbridge_core::Result<()> {
    let mut runtime = Runtime::new(config, Headless::new())?;
    runtime.load_module(bytes)?;
    runtime.call_start()?;

    let started = Instant::now();
    for _ in 0..frames {
        runtime.call_update()?;
    }
    let elapsed = started.elapsed();

    let platform = runtime.platform();
    info!(
        frames = frames,
        elapsed_ms = elapsed.as_millis() as u64,
        draw_calls = platform.draw_calls,
        tones = platform.tones,
        traces = platform.traces,
        disk_bytes = platform.disk().len(),
        "Cartridge run complete"
    );

    runtime.destroy();
    Ok(())
}
