//! Render-thread backpressure across real OS threads (spec.md §8 "Render
//! handoff backpressure"): while the render thread is busy with the
//! context it already took ownership of, the core thread's further
//! `STARTRENDER` calls must be skipped and counted rather than queued.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use dreamkit::emulator::{Configuration, Emulator};
use dreamkit::pvr::ta::{BackgroundState, RenderOutcome};

#[test]
fn three_startrender_calls_while_the_render_thread_sleeps_accept_only_the_first() {
    let mut emulator = Emulator::new(&Configuration::default());
    emulator.ta_mut().poly_fifo_write(0x1000, &[]);
    emulator.ta_mut().poly_fifo_write(0x2000, &[]);
    emulator.ta_mut().poly_fifo_write(0x3000, &[]);

    let outcome1 = emulator.start_render(0x1000, BackgroundState::default());
    assert!(matches!(outcome1, RenderOutcome::Accepted { .. }), "first STARTRENDER must be accepted");

    // Stand-in for the render thread: takes ownership of the pending
    // context's lock and holds it for 100ms, the way a real render thread
    // would hold it for the duration of drawing (spec.md §5's pending-
    // context handoff). Synchronized with a channel so the core-thread
    // calls below are only issued once the lock is actually held.
    let pending = emulator.ta_mut().pending_context_handle();
    let (locked_tx, locked_rx) = mpsc::channel();
    let render_thread = thread::spawn(move || {
        let _guard = pending.lock().unwrap();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
    });
    locked_rx.recv().unwrap();

    let outcome2 = emulator.start_render(0x2000, BackgroundState::default());
    let outcome3 = emulator.start_render(0x3000, BackgroundState::default());
    assert!(matches!(outcome2, RenderOutcome::Skipped), "second STARTRENDER during the busy window must be skipped");
    assert!(matches!(outcome3, RenderOutcome::Skipped), "third STARTRENDER during the busy window must be skipped");
    assert_eq!(emulator.ta_mut().frames_skipped(), 2);

    render_thread.join().unwrap();
}
