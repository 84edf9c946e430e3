//! Entry point: parses the CLI surface (spec.md §6), loads the requested
//! image, and drives the emulator (or the tracer, for `.trace` inputs) in
//! a fixed-step loop.

use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dreamkit::audio::AudioSink;
use dreamkit::cli::{self, ImageKind};
use dreamkit::config::Config;
use dreamkit::emulator::{Configuration, Emulator};
use dreamkit::error::DcError;
use dreamkit::frontend::sh4::Sh4Frontend;
use dreamkit::frontend::Frontend;
use dreamkit::logging::{diagnostic, init_logging, Severity};
use dreamkit::render::{RenderBackend, Surface, TextureDescriptor, TextureHandle, Vertex};

/// One `dc_tick` slice; small enough that render-done/VBLANK timers stay
/// responsive without pinning a core spinning on an idle guest.
const TICK_NS: u64 = 1_000_000; // 1ms

/// How often the render thread polls for a pending tile context when the
/// core thread isn't actively signalling it (spec.md §5: the render
/// thread "lazily takes ownership of the latest pending context" rather
/// than being woken for every frame).
const RENDER_POLL_INTERVAL: Duration = Duration::from_millis(4);

/// How long the core thread backs off once its audio sink reports its
/// buffer isn't low yet, rather than busy-looping `dc_tick` ahead of
/// playback (spec.md §5 "emulation is paced by the audio sink's
/// low-water mark").
const CORE_BACKOFF_INTERVAL: Duration = Duration::from_micros(500);

/// No window, no speakers: headless stand-ins for the two interfaces
/// spec.md §6 says the host platform supplies. A real host binary swaps
/// these for a windowing/audio crate; this binary still drives the full
/// three-thread topology (spec.md §5) against them.
struct HeadlessRenderBackend;

impl RenderBackend for HeadlessRenderBackend {
    fn register_texture(&mut self, _descriptor: TextureDescriptor, _bytes: &[u8]) -> TextureHandle {
        0
    }
    fn free_texture(&mut self, _handle: TextureHandle) {}
    fn begin_frame(&mut self) {}
    fn end_frame(&mut self) {}
    fn draw_batch(&mut self, _projection: &[f32; 16], _vertices: &[Vertex], _surfaces: &[Surface], _surface_order: &[u32]) {}
}

struct HeadlessAudioSink;

impl AudioSink for HeadlessAudioSink {
    fn push(&mut self, _samples: &[i16]) {}
    fn buffer_low(&self) -> bool {
        // No real playback buffer to drain: always ready for another
        // slice, so the core thread free-runs instead of backing off.
        true
    }
}

/// Core-thread body (spec.md §5): advances `dc_tick` whenever the audio
/// sink says its buffer has room, backing off briefly otherwise. Runs
/// until the process exits.
fn core_loop(emulator: Arc<Mutex<Emulator>>, audio: Arc<dyn AudioSink + Send + Sync>) {
    loop {
        if audio.buffer_low() {
            emulator.lock().unwrap().dc_tick(TICK_NS);
        } else {
            thread::sleep(CORE_BACKOFF_INTERVAL);
        }
    }
}

/// Render-thread body (spec.md §5): periodically takes ownership of the
/// latest pending tile context, if any, and draws it. The pending-context
/// handoff inside `Emulator::render_pending` is what actually separates
/// this from the core thread's `dc_tick`; the poll interval just bounds
/// how stale a picked-up frame can be.
fn render_loop(emulator: Arc<Mutex<Emulator>>) {
    let mut backend = HeadlessRenderBackend;
    loop {
        thread::sleep(RENDER_POLL_INTERVAL);
        emulator.lock().unwrap().render_pending(&mut backend);
    }
}

fn run(args: cli::Args) -> Result<(), DcError> {
    let config = Config::load(&args.image.with_file_name("dreamkit.cfg")).unwrap_or_else(|err| {
        diagnostic(Severity::Warning, "config", &format!("{err}, continuing with defaults"));
        Config::new()
    });
    for (key, value) in &args.options {
        diagnostic(Severity::Info, "cli", &format!("option override {key}={value} (config overrides not yet wired to a section)"));
    }

    match args.kind {
        ImageKind::Bin => {
            let bytes = fs::read(&args.image).map_err(|source| DcError::ImageIo { path: args.image.clone(), source })?;
            let configuration = Configuration::from_config(&config);
            let mut emulator = Emulator::new(&configuration);
            emulator.load_bin(&bytes);
            diagnostic(Severity::Info, "main", &format!("loaded {} bytes, entering free-run", bytes.len()));

            // spec.md §5's three-thread topology: this (main) thread is
            // the orchestrator, and spawns the core and render threads,
            // which share the emulator only through the mutex guarding
            // it and, within that, the pending-context handoff.
            let emulator = Arc::new(Mutex::new(emulator));
            let audio: Arc<dyn AudioSink + Send + Sync> = Arc::new(HeadlessAudioSink);

            let core_handle = {
                let emulator = Arc::clone(&emulator);
                thread::spawn(move || core_loop(emulator, audio))
            };
            let render_handle = {
                let emulator = Arc::clone(&emulator);
                thread::spawn(move || render_loop(emulator))
            };

            core_handle.join().expect("core thread panicked");
            render_handle.join().expect("render thread panicked");
            Ok(())
        }
        ImageKind::Trace => {
            let bytes = fs::read(&args.image).map_err(|source| DcError::ImageIo { path: args.image.clone(), source })?;
            trace_blocks(&bytes);
            Ok(())
        }
        ImageKind::Disc => {
            // GDI/CDI/CHD are bit-exact format parsers this crate doesn't
            // implement (spec.md §6); the host binary would normally hand
            // a `DiscReader` to `GdRom::set_disc` here.
            diagnostic(Severity::Fatal, "main", &format!("{:?}: no disc reader backend is linked into this binary", args.image));
            Err(DcError::UnsupportedImage(args.image))
        }
    }
}

/// A minimal static disassembly trace: decodes one block at a time from
/// the image's load address and logs its size and idle-loop flag, standing
/// in for the tracer spec.md §6 says a `.trace` input invokes instead of
/// the emulator.
fn trace_blocks(bytes: &[u8]) {
    use std::collections::HashMap;

    struct FlatGuest<'a>(&'a [u8]);
    impl<'a> dreamkit::frontend::Guest for FlatGuest<'a> {
        fn read16(&mut self, addr: u32) -> u16 {
            let i = addr as usize;
            if i + 1 < self.0.len() { u16::from_be_bytes([self.0[i], self.0[i + 1]]) } else { 0 }
        }
        fn read32(&mut self, addr: u32) -> u32 {
            let hi = self.read16(addr) as u32;
            let lo = self.read16(addr + 2) as u32;
            (hi << 16) | lo
        }
    }

    let frontend = Sh4Frontend::new(false, false);
    let mut guest = FlatGuest(bytes);
    let mut pc = 0u32;
    let mut seen = HashMap::new();
    let mut blocks = 0u32;
    while (pc as usize) < bytes.len() && blocks < 10_000 {
        let shape = frontend.analyze_code(&mut guest, pc);
        if shape.size == 0 || seen.insert(pc, ()).is_some() {
            break;
        }
        diagnostic(Severity::Info, "trace", &format!("block {pc:#010x} size={} idle_loop={}", shape.size, shape.idle_loop));
        pc += shape.size;
        blocks += 1;
    }
}

fn main() -> ExitCode {
    init_logging();
    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match cli::parse(&argv) {
        Ok(args) => args,
        Err(err) => {
            diagnostic(Severity::Fatal, "cli", &err.to_string());
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            diagnostic(Severity::Fatal, "main", &err.to_string());
            ExitCode::FAILURE
        }
    }
}

