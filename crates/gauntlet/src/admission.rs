// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Admission control: bounded queue, adaptive concurrency gate, resource gate.
//!
//! Requests pass three gates in order:
//!
//! 1. **Queue gate** — a bounded count of requests waiting for a slot;
//!    overflowing it fails fast with `queue_full`.
//! 2. **Concurrency gate** — a counted gate whose capacity the adaptive
//!    throttle resizes at runtime; waiting is bounded by the admission
//!    timeout (`overloaded`) and honors cancellation.
//! 3. **Resource gate** — when the latest resource snapshot exceeds the
//!    configured ceilings, or critical reservations are active, non-critical
//!    requests are rejected with `throttled`. Critical requests bypass the
//!    gate and may overcommit the concurrency gate by a bounded number of
//!    reservation slots; at the reservation limit they queue like everyone
//!    else.
//!
//! Slots are released by dropping the returned [`AdmissionPermit`], which
//! makes release unconditional on every exit path.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use verdict::ValidateError;

use crate::config::{ResourceLimits, ThrottleOptions};
use crate::metrics::MetricsHub;
use crate::sampler::{LoadView, ResourceSnapshot};

#[derive(Debug)]
struct GateState {
    capacity: usize,
    in_use: usize,
    generation: u64,
    throttle_steps: u32,
}

/// Counted concurrency gate whose capacity can shrink and grow at runtime.
///
/// Shrinking never revokes slots already handed out; occupancy drains down
/// to the new capacity as permits are released. The generation counter
/// advances on every resize so releases can be attributed to the capacity
/// regime they were issued under.
#[derive(Debug)]
pub struct AdaptiveGate {
    state: Mutex<GateState>,
    notify: Notify,
    nominal: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum GateAcquire {
    TimedOut,
    Cancelled,
}

impl AdaptiveGate {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                capacity,
                in_use: 0,
                generation: 0,
                throttle_steps: 0,
            }),
            notify: Notify::new(),
            nominal: capacity,
        }
    }

    fn try_acquire(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.in_use < state.capacity {
            state.in_use += 1;
            Some(state.generation)
        } else {
            None
        }
    }

    /// Takes a slot beyond capacity; used for critical reservations only.
    fn overcommit_acquire(&self) -> u64 {
        let mut state = self.state.lock();
        state.in_use += 1;
        state.generation
    }

    async fn acquire(&self, deadline: Instant, token: &CancellationToken) -> Result<u64, GateAcquire> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register interest before checking so a release between the
            // check and the await cannot be lost.
            let _ = notified.as_mut().enable();

            if let Some(generation) = self.try_acquire() {
                return Ok(generation);
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return Err(GateAcquire::TimedOut),
                () = token.cancelled() => return Err(GateAcquire::Cancelled),
            }
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if generation != state.generation {
            tracing::trace!(
                name: "gauntlet.admission",
                issued = generation,
                current = state.generation,
                "released permit from an earlier capacity generation",
            );
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn shrink(&self, factor: f64) -> usize {
        let mut state = self.state.lock();
        let shrunk = (state.capacity as f64 * factor).floor() as usize;
        state.capacity = shrunk.max(1);
        state.throttle_steps += 1;
        state.generation += 1;
        state.capacity
    }

    fn expand(&self, factor: f64) -> usize {
        let mut state = self.state.lock();
        if state.throttle_steps == 0 {
            return state.capacity;
        }

        let grown = (state.capacity as f64 / factor).ceil() as usize;
        state.capacity = grown.min(self.nominal);
        state.throttle_steps -= 1;
        state.generation += 1;
        let capacity = state.capacity;
        drop(state);
        self.notify.notify_waiters();
        capacity
    }

    fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

/// RAII execution slot. Dropping it releases the slot (and the reservation,
/// for critical overcommits).
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    generation: u64,
    reservation: bool,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.gate.release(self.generation);
        if self.reservation {
            let _ = self.controller.reservations.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission front door for the pipeline.
#[derive(Debug)]
pub struct AdmissionController {
    gate: AdaptiveGate,
    queued: AtomicUsize,
    max_queue: usize,
    wait_timeout: Duration,
    limits: ResourceLimits,
    reservation_limit: usize,
    reservations: AtomicUsize,
    snapshot: watch::Receiver<Option<ResourceSnapshot>>,
}

impl AdmissionController {
    /// Creates a controller.
    ///
    /// `snapshot` carries the sampler's latest resource snapshot; a channel
    /// that never produces one effectively disables the resource gate.
    #[must_use]
    pub fn new(
        max_concurrent: usize,
        max_queue: usize,
        wait_timeout: Duration,
        limits: ResourceLimits,
        reservation_pct: u8,
        snapshot: watch::Receiver<Option<ResourceSnapshot>>,
    ) -> Self {
        let reservation_limit = (max_concurrent * usize::from(reservation_pct)).div_ceil(100);
        Self {
            gate: AdaptiveGate::new(max_concurrent.max(1)),
            queued: AtomicUsize::new(0),
            max_queue,
            wait_timeout,
            limits,
            reservation_limit,
            reservations: AtomicUsize::new(0),
            snapshot,
        }
    }

    /// Runs a request through the three gates.
    pub async fn admit(
        self: &Arc<Self>,
        critical: bool,
        token: &CancellationToken,
    ) -> Result<AdmissionPermit, ValidateError> {
        let queue_slot = self.enter_queue()?;

        if !critical && self.under_pressure() {
            return Err(ValidateError::Throttled);
        }

        if critical && let Some(permit) = self.try_admit_critical() {
            drop(queue_slot);
            return Ok(permit);
        }

        let deadline = Instant::now() + self.wait_timeout;
        let generation = self.gate.acquire(deadline, token).await.map_err(|error| match error {
            GateAcquire::TimedOut => ValidateError::Overloaded,
            GateAcquire::Cancelled => ValidateError::Cancelled,
        })?;
        drop(queue_slot);

        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            generation,
            reservation: false,
        })
    }

    fn enter_queue(&self) -> Result<QueueSlot<'_>, ValidateError> {
        let entered = self.queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
            (queued < self.max_queue).then_some(queued + 1)
        });

        match entered {
            Ok(_) => Ok(QueueSlot(&self.queued)),
            Err(_) => Err(ValidateError::QueueFull),
        }
    }

    fn try_admit_critical(self: &Arc<Self>) -> Option<AdmissionPermit> {
        if let Some(generation) = self.gate.try_acquire() {
            return Some(AdmissionPermit {
                controller: Arc::clone(self),
                generation,
                reservation: false,
            });
        }

        let reserved = self.reservations.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            (count < self.reservation_limit).then_some(count + 1)
        });

        match reserved {
            Ok(_) => Some(AdmissionPermit {
                controller: Arc::clone(self),
                generation: self.gate.overcommit_acquire(),
                reservation: true,
            }),
            // Reservation limit reached: critical requests queue normally.
            Err(_) => None,
        }
    }

    fn under_pressure(&self) -> bool {
        if self.reservations.load(Ordering::Acquire) > 0 {
            return true;
        }

        let latest = self.snapshot.borrow().clone();
        latest.is_some_and(|snapshot| self.limits_exceeded(&snapshot))
    }

    fn limits_exceeded(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.cpu_pct > self.limits.max_cpu_pct
            || self
                .limits
                .max_memory_bytes
                .is_some_and(|limit| snapshot.rss_bytes > limit)
            || self
                .limits
                .max_disk_bps
                .is_some_and(|limit| snapshot.disk_rate_bps > limit)
    }

    /// Requests currently waiting at the concurrency gate.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Queue capacity.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.max_queue
    }

    /// Active critical reservations.
    #[must_use]
    pub fn reservations(&self) -> usize {
        self.reservations.load(Ordering::Acquire)
    }

    /// Reservation ceiling.
    #[must_use]
    pub const fn reservation_limit(&self) -> usize {
        self.reservation_limit
    }

    /// Current concurrency capacity, as adjusted by the throttle.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.gate.capacity()
    }

    /// Spawns the adaptive throttle loop.
    ///
    /// Each interval the CPU trend over the retained window is estimated by
    /// least squares; a rising trend contracts the gate by one factor step
    /// (never below one slot), a falling trend undoes one step (never above
    /// the configured maximum).
    pub fn spawn_throttle(self: &Arc<Self>, hub: Arc<MetricsHub>, options: ThrottleOptions) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let _ = ticker.tick().await; // immediate first tick carries no data

            loop {
                let _ = ticker.tick().await;
                let Some(slope) = hub.cpu_slope(options.interval) else {
                    continue;
                };

                if slope > options.slope_threshold {
                    if controller.reservations() < controller.reservation_limit() {
                        let capacity = controller.gate.shrink(options.adjustment_factor);
                        tracing::warn!(
                            name: "gauntlet.admission",
                            slope,
                            capacity,
                            "cpu trend rising; contracted concurrency gate",
                        );
                    }
                } else if slope < -options.slope_threshold {
                    let capacity = controller.gate.expand(options.adjustment_factor);
                    tracing::info!(
                        name: "gauntlet.admission",
                        slope,
                        capacity,
                        "cpu trend falling; expanded concurrency gate",
                    );
                }
            }
        })
    }
}

impl LoadView for AdmissionController {
    fn in_flight(&self) -> usize {
        self.gate.in_use()
    }

    fn capacity(&self) -> usize {
        self.gate.capacity()
    }
}
