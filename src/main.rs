//! typometer - keyboard-to-screen latency meter for Wayland
//!
//! Presses a key through a virtual keyboard, watches a screen region through
//! zero-copy dmabuf captures and prints how long it took for the region to
//! change, in nanoseconds, one sample per line on stdout. Then erases the
//! character and starts over, until something goes wrong.

mod args;
mod capture;
mod config;
mod detector;
mod engine;
mod error;
mod event_loop;
mod frame;
mod gpu;
mod keyboard;
mod region;
mod session;

use anyhow::{Context, Result};
use std::io::{self, Stdout};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::capture::CaptureSource;
use crate::config::Config;
use crate::engine::{Engine, Jitter};
use crate::error::FatalError;
use crate::event_loop::{LoopHandler, Timer};
use crate::frame::FrameAssembler;
use crate::gpu::GpuContext;
use crate::keyboard::VirtualKeyboard;
use crate::region::{RegionBuffers, WatchRegion};
use crate::session::Session;

/// Main application state
///
/// Owned by the event loop and handed to every protocol callback.
pub struct App {
    /// Measurement state machine, injecting through the virtual keyboard
    engine: Engine<VirtualKeyboard, Stdout>,

    /// EGL/GLES importer for captured frames
    gpu: GpuContext,

    /// Capture currently in flight
    assembler: FrameAssembler,

    capture: CaptureSource,

    /// First fatal error; stops the loop
    error: Option<FatalError>,
}

impl App {
    /// Record a fatal error; the first one wins and is reported by `main`
    fn flag_error(&mut self, err: FatalError) {
        if self.error.is_some() {
            debug!("Additional error after failure: {}", err);
            return;
        }
        debug!(
            "Failed in state {:?} after {} sample(s)",
            self.engine.state(),
            self.engine.samples()
        );
        self.error = Some(err);
    }
}

impl LoopHandler for App {
    fn timer(&mut self) -> &mut Timer {
        self.engine.timer_mut()
    }

    fn on_timer(&mut self) {
        if let Err(err) = self.engine.timer_fired() {
            self.flag_error(err);
        }
    }

    fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    fn take_error(&mut self) -> Option<FatalError> {
        self.error.take()
    }
}

fn main() -> ExitCode {
    // Initialize logging; stdout is reserved for samples
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "typometer=info,warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().map(String::as_str).unwrap_or("typometer");

    let region = match args::parse(argv.get(1..).unwrap_or_default()) {
        Ok(region) => region,
        Err(e) => {
            error!("Invalid arguments: {}", e);
            eprintln!("{}", args::usage(program));
            return ExitCode::FAILURE;
        }
    };

    match run(region) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Set everything up and measure until a fatal error stops the loop
fn run(region: WatchRegion) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    info!(
        "Starting typometer on region {}x{} at {},{}",
        region.width, region.height, region.x, region.y
    );

    // Before touching the display, so an impossible region fails fast
    let buffers = RegionBuffers::allocate(&region)?;

    let session = Session::connect(&config)?;
    let gpu = GpuContext::new(&session.conn).context("Failed to set up GPU import")?;

    let jitter = Jitter::new(config.timing.jitter_min_ms, config.timing.jitter_max_ms);
    let engine = Engine::new(region, buffers, session.keyboard, io::stdout(), jitter);

    let mut queue = session.conn.new_event_queue();
    let mut app = App {
        engine,
        gpu,
        assembler: FrameAssembler::new(),
        capture: session.capture,
        error: None,
    };

    // The baseline frame
    app.capture.request(&queue.handle());

    let err = event_loop::run(&session.conn, &mut queue, &mut app);
    Err(err).context("Measurement stopped")
}
