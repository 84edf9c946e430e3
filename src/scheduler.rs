//! The machine scheduler (spec.md §3 "Scheduler", §4.2): a virtual clock
//! in nanoseconds, a registration-ordered device list, and a deadline-
//! ordered min-heap of one-shot timers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// A device advanced by the scheduler. `run` receives the number of guest
/// cycles it owes this tick (derived from its clock frequency) and returns
/// how many it actually consumed — devices may under-consume but never
/// over-consume (spec.md §4.2).
pub trait Device {
    fn clock_hz(&self) -> u64;
    fn run(&mut self, cycles: u64, timers: &mut TimerQueue) -> u64;
}

pub type TimerHandle = u64;

type TimerCallback = Box<dyn FnMut(&mut TimerQueue) + Send>;

struct TimerEntry {
    deadline_ns: u64,
    seq: u64,
    handle: TimerHandle,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // on ties, the earliest enqueue) sorts first (spec.md §4.2:
        // "timers fire strictly in deadline order; ties broken by enqueue
        // order").
        other.deadline_ns.cmp(&self.deadline_ns).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The timer min-heap plus the bookkeeping `start_timer`/`cancel_timer`
/// need. Devices receive a `&mut TimerQueue` while running so they may
/// enqueue their own timers mid-tick (spec.md §4.2).
pub struct TimerQueue {
    now_ns: u64,
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<TimerHandle>,
    next_handle: TimerHandle,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self { now_ns: 0, heap: BinaryHeap::new(), cancelled: HashSet::new(), next_handle: 0, next_seq: 0 }
    }

    pub fn now(&self) -> u64 {
        self.now_ns
    }

    pub fn start_timer(&mut self, ns_from_now: u64, callback: impl FnMut(&mut TimerQueue) + Send + 'static) -> TimerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { deadline_ns: self.now_ns + ns_from_now, seq, handle, callback: Box::new(callback) });
        handle
    }

    /// Idempotent: cancelling twice, or cancelling a timer that already
    /// fired, is a no-op (spec.md §4.2).
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle);
    }

    fn fire_due(&mut self, deadline: u64) {
        loop {
            match self.heap.peek() {
                Some(entry) if entry.deadline_ns <= deadline => {
                    let mut entry = self.heap.pop().unwrap();
                    if self.cancelled.remove(&entry.handle) {
                        continue;
                    }
                    self.now_ns = entry.deadline_ns;
                    (entry.callback)(self);
                }
                _ => break,
            }
        }
    }
}

/// One entry in the scheduler's device list, in registration order
/// (spec.md §4.2: "within a single tick, devices run in registration
/// order").
struct Registered {
    name: String,
    device: Box<dyn Device + Send>,
}

pub struct Scheduler {
    devices: Vec<Registered>,
    timers: TimerQueue,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { devices: Vec::new(), timers: TimerQueue::new() }
    }

    pub fn register(&mut self, name: &str, device: Box<dyn Device + Send>) {
        self.devices.push(Registered { name: name.to_string(), device });
    }

    pub fn clock_ns(&self) -> u64 {
        self.timers.now_ns
    }

    pub fn start_timer(&mut self, ns_from_now: u64, callback: impl FnMut(&mut TimerQueue) + Send + 'static) -> TimerHandle {
        self.timers.start_timer(ns_from_now, callback)
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.cancel_timer(handle)
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|r| r.name.as_str()).collect()
    }

    /// Advances every device by its share of `delta_ns`, then fires every
    /// timer due by `old_clock + delta_ns` in deadline order, including
    /// timers newly enqueued by a device's own `run` (spec.md §4.2).
    pub fn tick(&mut self, delta_ns: u64) {
        let end = self.timers.now_ns + delta_ns;
        for reg in self.devices.iter_mut() {
            let cycles = ((delta_ns as u128 * reg.device.clock_hz() as u128) / 1_000_000_000u128) as u64;
            if cycles == 0 {
                continue;
            }
            let consumed = reg.device.run(cycles, &mut self.timers);
            debug_assert!(consumed <= cycles, "device {} over-consumed its cycle budget", reg.name);
        }
        self.timers.fire_due(end);
        self.timers.now_ns = end;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct NullDevice;
    impl Device for NullDevice {
        fn clock_hz(&self) -> u64 {
            0
        }
        fn run(&mut self, _cycles: u64, _timers: &mut TimerQueue) -> u64 {
            0
        }
    }

    #[test]
    fn timers_fire_in_deadline_order_with_nested_scheduling() {
        let mut sched = Scheduler::new();
        sched.register("null", Box::new(NullDevice));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        sched.start_timer(50, move |_| order_a.lock().unwrap().push("A"));
        let order_b = Arc::clone(&order);
        sched.start_timer(30, move |timers| {
            order_b.lock().unwrap().push("B");
            let order_inner_early = Arc::clone(&order_b);
            timers.start_timer(10, move |_| order_inner_early.lock().unwrap().push("inner@40"));
            let order_inner_late = Arc::clone(&order_b);
            timers.start_timer(170, move |_| order_inner_late.lock().unwrap().push("inner@200"));
        });

        sched.tick(100);

        let observed = order.lock().unwrap().clone();
        assert_eq!(observed, vec!["B", "inner@40", "A"]);
    }

    #[test]
    fn cancel_timer_is_idempotent_and_suppresses_firing() {
        let mut sched = Scheduler::new();
        sched.register("null", Box::new(NullDevice));
        let fired = Arc::new(Mutex::new(false));
        let fired2 = Arc::clone(&fired);
        let handle = sched.start_timer(10, move |_| *fired2.lock().unwrap() = true);
        sched.cancel_timer(handle);
        sched.cancel_timer(handle);
        sched.tick(100);
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn clock_advances_by_exactly_delta() {
        let mut sched = Scheduler::new();
        sched.register("null", Box::new(NullDevice));
        sched.tick(1_000_000);
        assert_eq!(sched.clock_ns(), 1_000_000);
        sched.tick(500);
        assert_eq!(sched.clock_ns(), 1_000_500);
    }
}
