//! Integration tests for the reactor dispatch loop: timeout ordering,
//! interrupts from other threads, removal during dispatch, and the group
//! timer.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::PipeDevice;
use netwire_reactor::DeviceGroup;

#[test]
fn test_timeouts_deliver_in_ascending_order() {
    let mut group = DeviceGroup::new();
    let a = group
        .append(PipeDevice::with_timeout(10))
        .ok()
        .expect("append failed");
    let b = group
        .append(PipeDevice::with_timeout(50))
        .ok()
        .expect("append failed");
    let c = group
        .append(PipeDevice::with_timeout(100))
        .ok()
        .expect("append failed");

    let mut order = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while order.len() < 3 && Instant::now() < deadline {
        if let Some(event) = group.wait() {
            assert!(event.timed_out);
            assert!(!event.readable);
            assert!(!event.writable);
            order.push(event.id);
        }
    }

    assert_eq!(order, vec![a, b, c]);
}

#[test]
fn test_interrupt_wakes_blocked_wait() {
    let mut group = DeviceGroup::new();
    // Safety net: bounds the wait if the interrupt is lost.
    group
        .append(PipeDevice::with_timeout(5_000))
        .ok()
        .expect("append failed");

    let interrupter = group.interrupter().expect("interrupter unavailable");
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interrupter.interrupt();
    });

    let started = Instant::now();
    let event = group.wait();
    waker.join().expect("waker thread panicked");

    assert!(event.is_none(), "a bare interrupt is not a device event");
    assert!(group.interrupted());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "wait did not return promptly after interrupt"
    );
}

#[test]
fn test_removed_batchmate_is_never_delivered() {
    let mut group = DeviceGroup::new();
    let a = group.append(PipeDevice::new()).ok().expect("append failed");
    let b = group.append(PipeDevice::new()).ok().expect("append failed");

    // Make both devices ready before the same wait cycle.
    group.get(a).expect("device must exist").feed(b"x");
    group.get(b).expect("device must exist").feed(b"x");

    let first = group.wait().expect("one device must be ready");
    assert!(first.readable);
    let other = if first.id == a { b } else { a };

    // Removing the batch-mate while handling the first event must purge its
    // pending kernel event.
    assert!(group.remove(other).is_some());
    assert!(group.next().is_none(), "stale event leaked through");
    assert_eq!(group.count(), 1);

    // The surviving handle still works.
    assert!(group.remove(first.id).is_some());
    assert_eq!(group.count(), 0);
}

#[test]
fn test_ready_device_takes_precedence_over_its_timeout() {
    let mut group = DeviceGroup::new();
    // A zero timeout expires on every cycle, so the device is guaranteed to
    // be simultaneously expired and present in the kernel batch.
    let id = group
        .append(PipeDevice::with_timeout(0))
        .ok()
        .expect("append failed");
    group.get(id).expect("device must exist").feed(b"x");

    let event = group.wait().expect("device must be delivered");
    assert_eq!(event.id, id);
    assert!(event.readable, "ready path must win over the timeout path");
    assert!(!event.timed_out, "no separate timeout notification");
}

#[test]
fn test_periodic_timer_fires_repeatedly() {
    let mut group: DeviceGroup<PipeDevice> = DeviceGroup::new();
    let ticks = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ticks);
    assert!(group.set_timer(Duration::from_millis(20), false, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        group.wait();
    }

    assert!(ticks.load(Ordering::SeqCst) >= 3);
    assert!(group.clear_timer());
    assert!(!group.clear_timer(), "timer was already cleared");
}

#[test]
fn test_one_shot_timer_fires_once() {
    let mut group = DeviceGroup::new();
    // Bounds the second wait.
    group
        .append(PipeDevice::with_timeout(200))
        .ok()
        .expect("append failed");

    let ticks = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ticks);
    assert!(group.set_timer(Duration::from_millis(20), true, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    // First cycle: the timer fires and disarms itself; no device event.
    let deadline = Instant::now() + Duration::from_secs(5);
    while ticks.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        group.wait();
    }
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(!group.clear_timer(), "one-shot timer must disarm itself");

    // Second cycle: only the device timeout remains.
    let event = group.wait().expect("device timeout expected");
    assert!(event.timed_out);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}
