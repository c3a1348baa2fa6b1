//! The reactor: a single-threaded device multiplexer.
//!
//! A [`DeviceGroup`] owns the kernel readiness handle, an interrupt channel,
//! an optional periodic timer, and every appended device.  One thread drives
//! the loop `wait()` → handle event → `next()` → … → `wait()`.  All device
//! mutation happens on that thread; the sole thread-safe escape hatch is
//! [`Interrupter::interrupt`], which wakes a blocked `wait()` from outside.
//!
//! Devices live in a generational slab and are addressed by [`DeviceId`].
//! Timeouts are kept in an intrusive doubly linked list threaded through the
//! slab entries, sorted ascending by remaining time; `wait()` uses the head
//! as its blocking deadline and every cycle charges the elapsed wall time to
//! all queued devices, which is what lets an inactive device expire without
//! any socket event.

use std::io;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::{
    InterruptChannel, PollEvent, Poller, TimerHandle, TOKEN_INTERRUPT, TOKEN_TIMER,
};
use crate::device::{Mode, Pollable};

/// How the kernel reports readiness for registered devices.
///
/// Edge-triggered (the default) reports only transitions into readiness, so
/// handlers must drain until `WouldBlock`.  Level-triggered reports on every
/// wait while the condition persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    EdgeTriggered,
    LevelTriggered,
}

/// Stable handle of a device inside its group.
///
/// Handles carry a generation and become stale once the device is removed; a
/// stale handle is detected and never dereferences a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

impl DeviceId {
    fn pack(self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }

    fn unpack(token: u64) -> Self {
        DeviceId {
            index: (token >> 32) as u32,
            generation: token as u32,
        }
    }
}

/// One delivery from [`DeviceGroup::wait`]/[`DeviceGroup::next`]: either
/// kernel readiness or an expired per-device timeout, never both.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub id: DeviceId,
    pub readable: bool,
    pub writable: bool,
    pub timed_out: bool,
}

struct Entry<D> {
    dev: D,
    /// Interest last registered with the kernel.
    active_mode: Mode,
    /// Timeout last folded into the queue, to detect changes on sync.
    applied_timeout: i64,
    /// Remaining milliseconds until expiry.
    ticker: i64,
    queued: bool,
    q_prev: Option<u32>,
    q_next: Option<u32>,
}

struct Timer {
    handle: TimerHandle,
    callback: Box<dyn FnMut()>,
    one_shot: bool,
}

/// Thread-safe handle that wakes a blocked [`DeviceGroup::wait`].
///
/// Clones share the underlying kernel primitive; signalling is idempotent
/// per drain (concurrent calls coalesce).
#[derive(Clone)]
pub struct Interrupter {
    channel: InterruptChannel,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if let Err(e) = self.channel.signal() {
            error!("[reactor] interrupt failed: {e}");
        }
    }
}

/// The reactor.  See the module documentation for the threading contract.
pub struct DeviceGroup<D: Pollable> {
    poller: Option<Poller>,
    interrupt: Option<InterruptChannel>,
    trigger: TriggerMode,

    entries: Vec<Option<Entry<D>>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    count: usize,

    /// Head of the ticker-sorted intrusive timeout queue.
    queue: Option<u32>,
    /// Walk cursor of the current expiry pass.
    next_queue: Option<u32>,

    /// Kernel events read by the last `wait()`, consumed one per `next()`.
    batch: Vec<PollEvent>,
    batch_pos: usize,
    last_wait_ms: i64,

    interrupted: bool,
    timer: Option<Timer>,
}

impl<D: Pollable> DeviceGroup<D> {
    pub fn new() -> Self {
        DeviceGroup {
            poller: None,
            interrupt: None,
            trigger: TriggerMode::EdgeTriggered,
            entries: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            count: 0,
            queue: None,
            next_queue: None,
            batch: Vec::new(),
            batch_pos: 0,
            last_wait_ms: 0,
            interrupted: false,
            timer: None,
        }
    }

    /// Whether the kernel handles have been created.
    pub fn is_valid(&self) -> bool {
        self.poller.is_some()
    }

    /// Allocates the kernel multiplexer and the interrupt channel.  Called
    /// lazily by the first `append`; calling it again on a set-up group
    /// fails.  On any resource failure every descriptor opened so far is
    /// closed again and the group stays unconfigured.
    pub fn setup(&mut self) -> bool {
        if self.poller.is_some() {
            error!("[reactor] already set up");
            return false;
        }

        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(e) => {
                error!("[reactor] multiplexer creation failed: {e}");
                return false;
            }
        };
        let interrupt = match InterruptChannel::new() {
            Ok(channel) => channel,
            Err(e) => {
                error!("[reactor] interrupt channel creation failed: {e}");
                return false;
            }
        };
        if let Err(e) = poller.add(
            interrupt.read_fd(),
            TOKEN_INTERRUPT,
            Mode::READ,
            self.edge(),
        ) {
            error!("[reactor] interrupt channel registration failed: {e}");
            return false;
        }

        self.poller = Some(poller);
        self.interrupt = Some(interrupt);
        true
    }

    fn ensure_setup(&mut self) -> bool {
        self.poller.is_some() || self.setup()
    }

    fn edge(&self) -> bool {
        self.trigger == TriggerMode::EdgeTriggered
    }

    /// Selects the kernel trigger behaviour for subsequently added devices.
    /// Must be called before the first `append` (the interrupt channel is
    /// registered with the same flags).
    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> bool {
        if self.poller.is_some() {
            warn!("[reactor] trigger mode must be set before the first append");
            return false;
        }
        self.trigger = mode;
        true
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger
    }

    /// Number of devices currently appended.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Moves a device into the group and registers it with the kernel.  On
    /// failure the device is handed back unchanged; the cause is logged.
    pub fn append(&mut self, dev: D) -> Result<DeviceId, D> {
        if !dev.device().is_valid() {
            warn!("[reactor] cannot append a device without a descriptor");
            return Err(dev);
        }
        if !self.ensure_setup() {
            return Err(dev);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(None);
                self.generations.push(0);
                (self.entries.len() - 1) as u32
            }
        };
        let id = DeviceId {
            index,
            generation: self.generations[index as usize],
        };

        let fd = dev.device().fd();
        let mode = dev.device().mode();
        let timeout = dev.device().timeout();
        let edge = self.edge();

        let registered = match &self.poller {
            Some(poller) => poller.add(fd, id.pack(), mode, edge),
            None => return Err(dev),
        };
        if let Err(e) = registered {
            error!("[reactor] registration of fd {fd} failed: {e}");
            self.free.push(index);
            return Err(dev);
        }

        self.entries[index as usize] = Some(Entry {
            dev,
            active_mode: mode,
            applied_timeout: timeout,
            ticker: timeout,
            queued: false,
            q_prev: None,
            q_next: None,
        });
        self.count += 1;

        if timeout >= 0 {
            self.apply_timeout(index);
        }

        Ok(id)
    }

    /// Detaches a device and returns it.  All pending references are purged
    /// synchronously: the kernel registration, the timeout queue, and any
    /// still-unconsumed entries of the current event batch, so a removal
    /// from within the dispatch loop can never yield a stale handle.
    pub fn remove(&mut self, id: DeviceId) -> Option<D> {
        let index = id.index as usize;
        if self.generations.get(index).copied() != Some(id.generation)
            || self.entries.get(index).map_or(true, |slot| slot.is_none())
        {
            warn!("[reactor] device is not part of this group");
            return None;
        }

        let token = id.pack();
        let mut i = self.batch_pos;
        while i < self.batch.len() {
            if self.batch[i].token == token {
                self.batch.remove(i);
            } else {
                i += 1;
            }
        }

        self.unlink(id.index);
        let entry = self.entries[index].take()?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free.push(id.index);
        self.count -= 1;

        if entry.dev.device().is_valid() && !entry.active_mode.contains(Mode::CLOSED) {
            if let Some(poller) = &self.poller {
                if let Err(e) = poller.delete(entry.dev.device().fd(), entry.active_mode) {
                    warn!(
                        "[reactor] deregistration of fd {} failed: {e}",
                        entry.dev.device().fd()
                    );
                }
            }
        }

        Some(entry.dev)
    }

    /// Drops every device and closes the kernel handles, returning the group
    /// to its unconfigured state.
    pub fn clear(&mut self) {
        self.clear_timer();
        self.entries.clear();
        self.generations.clear();
        self.free.clear();
        self.count = 0;
        self.queue = None;
        self.next_queue = None;
        self.batch.clear();
        self.batch_pos = 0;
        self.poller = None;
        self.interrupt = None;
    }

    /// Immutable access to an appended device.
    pub fn get(&self, id: DeviceId) -> Option<&D> {
        let index = id.index as usize;
        if self.generations.get(index).copied() != Some(id.generation) {
            return None;
        }
        self.entries.get(index)?.as_ref().map(|entry| &entry.dev)
    }

    /// Mutable access to an appended device.  When the returned guard drops,
    /// mode and timeout changes made through it are synchronised with the
    /// kernel registration and the timeout queue; unchanged state costs
    /// nothing.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<DeviceRef<'_, D>> {
        let index = id.index as usize;
        if self.generations.get(index).copied() != Some(id.generation) {
            return None;
        }
        self.entries.get(index)?.as_ref()?;
        Some(DeviceRef {
            group: self,
            index: id.index,
        })
    }

    /// Wakes a blocked `wait()` from the reactor thread itself.  For other
    /// threads, obtain an [`Interrupter`] instead.
    pub fn interrupt(&self) {
        if let Some(channel) = &self.interrupt {
            if let Err(e) = channel.signal() {
                error!("[reactor] interrupt failed: {e}");
            }
        }
    }

    /// Returns a cloneable, thread-safe wake-up handle.
    pub fn interrupter(&mut self) -> Option<Interrupter> {
        if !self.ensure_setup() {
            return None;
        }
        self.interrupt
            .clone()
            .map(|channel| Interrupter { channel })
    }

    /// Whether the last `wait()` cycle was woken by an interrupt.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Arms the group timer: `callback` runs on the reactor thread on every
    /// period (or once, for a one-shot timer).  Replaces any armed timer.
    pub fn set_timer<F>(&mut self, interval: Duration, one_shot: bool, callback: F) -> bool
    where
        F: FnMut() + 'static,
    {
        if !self.ensure_setup() {
            return false;
        }
        self.clear_timer();

        let Some(poller) = self.poller.as_ref() else {
            return false;
        };
        match poller.set_timer(interval.as_millis() as u64, one_shot) {
            Ok(handle) => {
                self.timer = Some(Timer {
                    handle,
                    callback: Box::new(callback),
                    one_shot,
                });
                true
            }
            Err(e) => {
                error!("[reactor] timer setup failed: {e}");
                false
            }
        }
    }

    /// Disarms the group timer and purges any queued timer event from the
    /// in-flight batch.
    pub fn clear_timer(&mut self) -> bool {
        let Some(timer) = self.timer.take() else {
            return false;
        };
        if let Some(poller) = &self.poller {
            if let Err(e) = poller.clear_timer(&timer.handle) {
                warn!("[reactor] timer teardown failed: {e}");
            }
        }

        let mut i = self.batch_pos;
        while i < self.batch.len() {
            if self.batch[i].token == TOKEN_TIMER {
                self.batch.remove(i);
            } else {
                i += 1;
            }
        }
        true
    }

    /// Blocks until a device is ready or times out, then returns the first
    /// delivery via [`DeviceGroup::next`].  The blocking deadline is the
    /// smallest remaining ticker; with an empty timeout queue the wait is
    /// unbounded.  Returns `None` when nothing has been appended yet, on a
    /// wait failure, or when the cycle produced no device (e.g. a bare
    /// interrupt).
    pub fn wait(&mut self) -> Option<Event> {
        self.interrupted = false;
        self.batch.clear();
        self.batch_pos = 0;

        if self.poller.is_none() {
            return None;
        }

        let timeout = match self.queue {
            Some(head) => self.slot(head).map_or(-1, |entry| entry.ticker.max(0)),
            None => -1,
        };

        let started = Instant::now();
        let mut batch = std::mem::take(&mut self.batch);
        let wait_result = match self.poller.as_ref() {
            Some(poller) => poller.wait(&mut batch, timeout),
            None => Ok(0),
        };
        self.batch = batch;

        let (ready, signalled) = match wait_result {
            Ok(n) => (n, false),
            // A signal interruption counts as an empty batch; queued tickers
            // are still charged for the real elapsed time below.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (0, true),
            Err(e) => {
                error!("[reactor] wait failed: {e}");
                return None;
            }
        };

        if self.queue.is_some() {
            if ready == 0 && timeout >= 0 && !signalled {
                // The deadline elapsed in full; charge exactly the timeout
                // so the head device reliably expires regardless of clock
                // granularity.
                self.last_wait_ms = timeout;
            } else {
                self.last_wait_ms = started.elapsed().as_millis() as i64;
            }
        } else {
            self.last_wait_ms = 0;
        }

        self.next_queue = self.queue;
        self.next()
    }

    /// Returns the next delivery of the current cycle, or `None` when the
    /// cycle is drained and `wait()` must run again.
    ///
    /// Expired timeouts are checked first: a device whose ticker reached
    /// zero is reported as timed out only if it does not also appear in the
    /// unconsumed kernel batch; when it does, the ready delivery takes
    /// precedence and its timeout is simply re-armed.  The interrupt channel
    /// and the timer are handled internally and never surface as events.
    pub fn next(&mut self) -> Option<Event> {
        let elapsed = self.last_wait_ms;

        // Expiry pass over the timeout queue.
        while let Some(index) = self.next_queue {
            let Some(entry) = self.slot_mut(index) else {
                self.next_queue = None;
                break;
            };
            entry.ticker -= elapsed;
            let expired = entry.ticker <= 0;
            let follow = entry.q_next;
            self.next_queue = follow;

            if expired {
                self.unlink(index);
                let id = DeviceId {
                    index,
                    generation: self.generations[index as usize],
                };
                let token = id.pack();
                let pending = self.batch[self.batch_pos..]
                    .iter()
                    .any(|ev| ev.token == token);
                if !pending {
                    debug!("[reactor] device {index} timed out");
                    return Some(Event {
                        id,
                        readable: false,
                        writable: false,
                        timed_out: true,
                    });
                }
            }
        }

        // Kernel batch.
        while self.batch_pos < self.batch.len() {
            let ev = self.batch[self.batch_pos];
            self.batch_pos += 1;

            if ev.token == TOKEN_INTERRUPT {
                if let Some(channel) = &self.interrupt {
                    channel.drain();
                }
                self.interrupted = true;
                continue;
            }

            if ev.token == TOKEN_TIMER {
                let mut one_shot = false;
                if let Some(timer) = self.timer.as_mut() {
                    timer.handle.drain();
                    (timer.callback)();
                    one_shot = timer.one_shot;
                }
                if one_shot {
                    self.clear_timer();
                }
                continue;
            }

            let id = DeviceId::unpack(ev.token);
            let index = id.index as usize;
            if self.generations.get(index).copied() != Some(id.generation) {
                continue;
            }
            let Some(entry) = self.slot(id.index) else {
                continue;
            };

            // Activity re-arms the timeout and repositions the device.
            if entry.dev.device().timeout() >= 0 {
                self.apply_timeout(id.index);
            }

            if !ev.readable && ev.error {
                if let Some(entry) = self.slot_mut(id.index) {
                    debug!(
                        "[reactor] closing erroneous device {index} with fd {}",
                        entry.dev.device().fd()
                    );
                    entry.dev.close();
                }
                self.sync_device(id.index);
            }

            return Some(Event {
                id,
                readable: ev.readable,
                writable: ev.writable,
                timed_out: false,
            });
        }

        self.batch.clear();
        self.batch_pos = 0;
        None
    }

    // ── Slab access ───────────────────────────────────────────────────────────

    fn slot(&self, index: u32) -> Option<&Entry<D>> {
        self.entries.get(index as usize)?.as_ref()
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Entry<D>> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    fn ticker_of(&self, index: u32) -> i64 {
        self.slot(index).map_or(i64::MAX, |entry| entry.ticker)
    }

    fn prev_of(&self, index: u32) -> Option<u32> {
        self.slot(index).and_then(|entry| entry.q_prev)
    }

    fn next_of(&self, index: u32) -> Option<u32> {
        self.slot(index).and_then(|entry| entry.q_next)
    }

    /// Reconciles a device's desired state with the kernel registration and
    /// the timeout queue.  Runs when a [`DeviceRef`] guard drops and after a
    /// reactor-initiated close.
    fn sync_device(&mut self, index: u32) {
        let Some(entry) = self.slot(index) else {
            return;
        };
        let valid = entry.dev.device().is_valid();
        let mode = entry.dev.device().mode();
        let timeout = entry.dev.device().timeout();
        let active = entry.active_mode;
        let fd = entry.dev.device().fd();

        if mode.contains(Mode::CLOSED) || !valid {
            self.unlink(index);
            if valid && !active.contains(Mode::CLOSED) {
                if let Some(poller) = &self.poller {
                    if let Err(e) = poller.delete(fd, active) {
                        warn!("[reactor] deregistration of fd {fd} failed: {e}");
                    }
                }
            }
            if let Some(entry) = self.slot_mut(index) {
                entry.active_mode = Mode::CLOSED;
            }
            return;
        }

        if mode != active {
            let token = DeviceId {
                index,
                generation: self.generations[index as usize],
            }
            .pack();
            let edge = self.edge();
            let updated = match &self.poller {
                Some(poller) => poller.modify(fd, token, active, mode, edge),
                None => Ok(()),
            };
            match updated {
                Ok(()) => {
                    if let Some(entry) = self.slot_mut(index) {
                        entry.active_mode = mode;
                    }
                }
                Err(e) => error!("[reactor] interest update for fd {fd} failed: {e}"),
            }
        }

        let applied = self.slot(index).map_or(timeout, |entry| entry.applied_timeout);
        if timeout != applied {
            self.apply_timeout(index);
        }
    }

    // ── Timeout queue ─────────────────────────────────────────────────────────

    /// Re-arms the device's ticker from its configured timeout and moves it
    /// to its sorted position: a bounded relocation that walks only as far
    /// as the neighbours require, not a full re-sort.
    fn apply_timeout(&mut self, index: u32) {
        let (timeout, queued) = match self.slot_mut(index) {
            Some(entry) => {
                let timeout = entry.dev.device().timeout();
                entry.ticker = timeout;
                entry.applied_timeout = timeout;
                (timeout, entry.queued)
            }
            None => return,
        };

        if queued {
            if timeout >= 0 {
                self.reposition(index);
            } else {
                self.unlink(index);
            }
        } else if timeout >= 0 {
            self.insert_sorted(index);
        }
    }

    fn reposition(&mut self, index: u32) {
        let Some(entry) = self.slot(index) else {
            return;
        };
        let ticker = entry.ticker;
        let prev = entry.q_prev;
        let next = entry.q_next;

        // Towards the front.
        if let Some(first) = prev {
            if self.ticker_of(first) > ticker {
                let mut pos = first;
                while let Some(candidate) = self.prev_of(pos) {
                    if self.ticker_of(candidate) > ticker {
                        pos = candidate;
                    } else {
                        break;
                    }
                }
                self.unlink(index);
                self.insert_before(index, pos);
                return;
            }
        }

        // Towards the back.
        if let Some(first) = next {
            if ticker > self.ticker_of(first) {
                let mut pos = first;
                while let Some(candidate) = self.next_of(pos) {
                    if ticker > self.ticker_of(candidate) {
                        pos = candidate;
                    } else {
                        break;
                    }
                }
                self.unlink(index);
                self.insert_after(index, pos);
            }
        }
    }

    fn insert_sorted(&mut self, index: u32) {
        let ticker = self.ticker_of(index);

        let Some(head) = self.queue else {
            self.queue = Some(index);
            if let Some(entry) = self.slot_mut(index) {
                entry.q_prev = None;
                entry.q_next = None;
                entry.queued = true;
            }
            return;
        };

        let mut pos = Some(head);
        let mut last = head;
        while let Some(current) = pos {
            if self.ticker_of(current) > ticker {
                self.insert_before(index, current);
                return;
            }
            last = current;
            pos = self.next_of(current);
        }
        self.insert_after(index, last);
    }

    fn insert_before(&mut self, index: u32, pos: u32) {
        let pos_prev = self.prev_of(pos);
        if let Some(entry) = self.slot_mut(index) {
            entry.q_prev = pos_prev;
            entry.q_next = Some(pos);
            entry.queued = true;
        }
        if let Some(entry) = self.slot_mut(pos) {
            entry.q_prev = Some(index);
        }
        match pos_prev {
            Some(prev) => {
                if let Some(entry) = self.slot_mut(prev) {
                    entry.q_next = Some(index);
                }
            }
            None => self.queue = Some(index),
        }
    }

    fn insert_after(&mut self, index: u32, pos: u32) {
        let pos_next = self.next_of(pos);
        if let Some(entry) = self.slot_mut(index) {
            entry.q_prev = Some(pos);
            entry.q_next = pos_next;
            entry.queued = true;
        }
        if let Some(entry) = self.slot_mut(pos) {
            entry.q_next = Some(index);
        }
        if let Some(next) = pos_next {
            if let Some(entry) = self.slot_mut(next) {
                entry.q_prev = Some(index);
            }
        }
    }

    fn unlink(&mut self, index: u32) {
        let Some(entry) = self.slot(index) else {
            return;
        };
        if !entry.queued {
            return;
        }
        let prev = entry.q_prev;
        let next = entry.q_next;

        if self.next_queue == Some(index) {
            self.next_queue = next;
        }
        match prev {
            Some(p) => {
                if let Some(entry) = self.slot_mut(p) {
                    entry.q_next = next;
                }
            }
            None => self.queue = next,
        }
        if let Some(n) = next {
            if let Some(entry) = self.slot_mut(n) {
                entry.q_prev = prev;
            }
        }
        if let Some(entry) = self.slot_mut(index) {
            entry.q_prev = None;
            entry.q_next = None;
            entry.queued = false;
        }
    }
}

impl<D: Pollable> Default for DeviceGroup<D> {
    fn default() -> Self {
        DeviceGroup::new()
    }
}

/// Mutable borrow of an appended device.  On drop, mode and timeout changes
/// are pushed to the kernel registration and the timeout queue.
pub struct DeviceRef<'a, D: Pollable> {
    group: &'a mut DeviceGroup<D>,
    index: u32,
}

impl<D: Pollable> Deref for DeviceRef<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        match self.group.entries[self.index as usize].as_ref() {
            Some(entry) => &entry.dev,
            None => unreachable!("device entry vanished while borrowed"),
        }
    }
}

impl<D: Pollable> DerefMut for DeviceRef<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        match self.group.entries[self.index as usize].as_mut() {
            Some(entry) => &mut entry.dev,
            None => unreachable!("device entry vanished while borrowed"),
        }
    }
}

impl<D: Pollable> Drop for DeviceRef<'_, D> {
    fn drop(&mut self) {
        self.group.sync_device(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    /// Minimal pipe-backed device for queue bookkeeping tests.
    #[derive(Debug)]
    struct PipeDevice {
        dev: Device,
        _write_end: Device,
    }

    impl PipeDevice {
        fn with_timeout(ms: i64) -> Self {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            let mut dev = Device::from_raw_fd(fds[0]);
            dev.set_mode(Mode::READ);
            dev.set_timeout(ms);
            PipeDevice {
                dev,
                _write_end: Device::from_raw_fd(fds[1]),
            }
        }
    }

    impl Pollable for PipeDevice {
        fn device(&self) -> &Device {
            &self.dev
        }

        fn device_mut(&mut self) -> &mut Device {
            &mut self.dev
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::read(self.dev.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    /// Walks the intrusive queue from head to tail.
    fn queue_tickers(group: &DeviceGroup<PipeDevice>) -> Vec<i64> {
        let mut tickers = Vec::new();
        let mut cursor = group.queue;
        while let Some(index) = cursor {
            let entry = group.entries[index as usize]
                .as_ref()
                .expect("queued entry must exist");
            tickers.push(entry.ticker);
            cursor = entry.q_next;
        }
        tickers
    }

    fn assert_sorted(group: &DeviceGroup<PipeDevice>) {
        let tickers = queue_tickers(group);
        let mut sorted = tickers.clone();
        sorted.sort();
        assert_eq!(tickers, sorted, "queue must stay ascending by ticker");
    }

    #[test]
    fn test_append_keeps_queue_sorted() {
        let mut group = DeviceGroup::new();
        for ms in [500i64, 10, 100, 50, 1000, 50] {
            group.append(PipeDevice::with_timeout(ms)).expect("append failed");
            assert_sorted(&group);
        }
        assert_eq!(group.count(), 6);
        assert_eq!(queue_tickers(&group), vec![10, 50, 50, 100, 500, 1000]);
    }

    #[test]
    fn test_devices_without_timeout_stay_out_of_queue() {
        let mut group = DeviceGroup::new();
        group.append(PipeDevice::with_timeout(-1)).ok().expect("append failed");
        group.append(PipeDevice::with_timeout(20)).ok().expect("append failed");
        assert_eq!(group.count(), 2);
        assert_eq!(queue_tickers(&group).len(), 1);
    }

    #[test]
    fn test_set_timeout_repositions_device() {
        let mut group = DeviceGroup::new();
        let _a = group.append(PipeDevice::with_timeout(10)).ok().expect("append failed");
        let b = group.append(PipeDevice::with_timeout(50)).ok().expect("append failed");
        let _c = group.append(PipeDevice::with_timeout(100)).ok().expect("append failed");

        // Move the middle device to the back, then off the queue entirely.
        group
            .get_mut(b)
            .expect("device must exist")
            .device_mut()
            .set_timeout(500);
        assert_sorted(&group);
        assert_eq!(queue_tickers(&group), vec![10, 100, 500]);

        group
            .get_mut(b)
            .expect("device must exist")
            .device_mut()
            .set_timeout(-1);
        assert_eq!(queue_tickers(&group), vec![10, 100]);

        // And back to the front.
        group
            .get_mut(b)
            .expect("device must exist")
            .device_mut()
            .set_timeout(1);
        assert_eq!(queue_tickers(&group), vec![1, 10, 100]);
    }

    #[test]
    fn test_remove_unlinks_and_invalidates_id() {
        let mut group = DeviceGroup::new();
        let a = group.append(PipeDevice::with_timeout(10)).ok().expect("append failed");
        let b = group.append(PipeDevice::with_timeout(50)).ok().expect("append failed");
        let c = group.append(PipeDevice::with_timeout(100)).ok().expect("append failed");

        assert!(group.remove(b).is_some());
        assert_eq!(group.count(), 2);
        assert_eq!(queue_tickers(&group), vec![10, 100]);

        // The handle is stale now.
        assert!(group.get(b).is_none());
        assert!(group.remove(b).is_none());

        // A recycled slot does not resurrect the old handle.
        let d = group.append(PipeDevice::with_timeout(25)).ok().expect("append failed");
        assert!(group.get(b).is_none());
        assert!(group.get(d).is_some());
        assert_sorted(&group);

        assert!(group.remove(a).is_some());
        assert!(group.remove(c).is_some());
        assert!(group.remove(d).is_some());
        assert_eq!(group.count(), 0);
        assert!(queue_tickers(&group).is_empty());
    }

    #[test]
    fn test_trigger_mode_is_fixed_after_setup() {
        let mut group: DeviceGroup<PipeDevice> = DeviceGroup::new();
        assert!(group.set_trigger_mode(TriggerMode::LevelTriggered));
        assert!(group.setup());
        assert!(!group.set_trigger_mode(TriggerMode::EdgeTriggered));
        assert_eq!(group.trigger_mode(), TriggerMode::LevelTriggered);
    }

    #[test]
    fn test_setup_twice_fails() {
        let mut group: DeviceGroup<PipeDevice> = DeviceGroup::new();
        assert!(group.setup());
        assert!(!group.setup());
        assert!(group.is_valid());
    }

    #[test]
    fn test_device_id_pack_round_trip() {
        let id = DeviceId {
            index: 7,
            generation: 3,
        };
        assert_eq!(DeviceId::unpack(id.pack()), id);
    }
}
