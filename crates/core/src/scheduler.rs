//! Two-gate admission state for one session.
//!
//! Gate one: strict FIFO per target, one running operation at a time, the
//! queue advanced by an explicit dequeue-on-completion step. Gate two:
//! global slot acquisition against the governor's effective cap; requests
//! over the cap park as [`Waiter`]s and are granted FIFO as slots release
//! or the cap re-samples upward.
//!
//! All state here is private to the owning session and mutated only under
//! the engine's registry lock; the async orchestration (parking, timers,
//! settlement) lives in [`engine`](crate::engine).

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::OpsError;
use crate::governor::Pressure;

/// Diagnostics attached to a `parallelism_backpressure` rejection.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureInfo {
	pub effective_parallel_cap: u32,
	pub in_flight: u32,
	pub wait_queue_depth: usize,
	pub wait_queue_age_ms: u64,
	pub pressure: Pressure,
	pub timeout_ms: u64,
}

/// A parked slot acquisition. Settles exactly once: granted, timed out, or
/// force-rejected on session teardown. Removal from the waiter list is the
/// settlement point; the timer is aborted on any settlement so it never
/// fires against a freed waiter.
#[derive(Debug)]
pub(crate) struct Waiter {
	pub id: u64,
	pub target_id: String,
	pub enqueued_at: Instant,
	pub tx: oneshot::Sender<Result<(), OpsError>>,
	pub timer: Option<AbortHandle>,
}

#[derive(Debug)]
struct QueuedTurn {
	tx: oneshot::Sender<()>,
	enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct TargetQueue {
	running: bool,
	waiting: VecDeque<QueuedTurn>,
}

/// Scheduling arena for one session: slot count, waiter list, and the
/// per-target turn queues, plus the unthrottled control-plane lane.
#[derive(Debug)]
pub(crate) struct SchedulerState {
	pub in_flight: u32,
	waiters: VecDeque<Waiter>,
	queues: HashMap<String, TargetQueue>,
	control: TargetQueue,
	next_waiter_id: u64,
}

impl SchedulerState {
	pub fn new() -> Self {
		Self {
			in_flight: 0,
			waiters: VecDeque::new(),
			queues: HashMap::new(),
			control: TargetQueue::default(),
			next_waiter_id: 1,
		}
	}

	/// Takes a turn on the target's FIFO. `None` means the caller runs now;
	/// otherwise the receiver resolves when every earlier request on the
	/// same target has fully completed.
	pub fn begin_turn(&mut self, target_id: &str, now: Instant) -> Option<oneshot::Receiver<()>> {
		let queue = self.queues.entry(target_id.to_string()).or_default();
		if !queue.running {
			queue.running = true;
			return None;
		}
		let (tx, rx) = oneshot::channel();
		queue.waiting.push_back(QueuedTurn {
			tx,
			enqueued_at: now,
		});
		Some(rx)
	}

	/// Advances the target's FIFO after an operation fully completes.
	pub fn finish_turn(&mut self, target_id: &str) {
		let Some(queue) = self.queues.get_mut(target_id) else {
			return;
		};
		loop {
			match queue.waiting.pop_front() {
				// A dropped receiver means that request already gave up
				// (session teardown raced completion); skip to the next.
				Some(next) => match next.tx.send(()) {
					Ok(()) => return,
					Err(()) => continue,
				},
				None => {
					queue.running = false;
					self.queues.remove(target_id);
					return;
				}
			}
		}
	}

	pub fn begin_control_turn(&mut self, now: Instant) -> Option<oneshot::Receiver<()>> {
		if !self.control.running {
			self.control.running = true;
			return None;
		}
		let (tx, rx) = oneshot::channel();
		self.control.waiting.push_back(QueuedTurn {
			tx,
			enqueued_at: now,
		});
		Some(rx)
	}

	pub fn finish_control_turn(&mut self) {
		loop {
			match self.control.waiting.pop_front() {
				Some(next) => match next.tx.send(()) {
					Ok(()) => return,
					Err(()) => continue,
				},
				None => {
					self.control.running = false;
					return;
				}
			}
		}
	}

	/// Claims a slot if one is free under `cap`.
	pub fn try_acquire_slot(&mut self, cap: u32) -> bool {
		if self.in_flight < cap {
			self.in_flight += 1;
			true
		} else {
			false
		}
	}

	pub fn release_slot(&mut self) {
		self.in_flight = self.in_flight.saturating_sub(1);
	}

	/// Parks a waiter at the back of the FIFO and returns its id so the
	/// caller can arm the backpressure timer.
	pub fn park_waiter(
		&mut self,
		target_id: &str,
		tx: oneshot::Sender<Result<(), OpsError>>,
		now: Instant,
	) -> u64 {
		let id = self.next_waiter_id;
		self.next_waiter_id += 1;
		self.waiters.push_back(Waiter {
			id,
			target_id: target_id.to_string(),
			enqueued_at: now,
			tx,
			timer: None,
		});
		id
	}

	pub fn arm_waiter_timer(&mut self, id: u64, timer: AbortHandle) {
		if let Some(waiter) = self.waiters.iter_mut().find(|w| w.id == id) {
			waiter.timer = Some(timer);
		} else {
			// Settled before the timer task was registered.
			timer.abort();
		}
	}

	/// Removes a waiter by id, if it is still parked.
	pub fn remove_waiter(&mut self, id: u64) -> Option<Waiter> {
		let index = self.waiters.iter().position(|w| w.id == id)?;
		self.waiters.remove(index)
	}

	/// Pops waiters FIFO while slots are free under `cap`, claiming a slot
	/// for each. The caller settles each grant outside the lock.
	pub fn take_grantable(&mut self, cap: u32) -> Vec<Waiter> {
		let mut granted = Vec::new();
		while self.in_flight < cap {
			match self.waiters.pop_front() {
				Some(waiter) => {
					self.in_flight += 1;
					granted.push(waiter);
				}
				None => break,
			}
		}
		granted
	}

	/// Empties the waiter list for session teardown.
	pub fn drain_waiters(&mut self) -> Vec<Waiter> {
		self.waiters.drain(..).collect()
	}

	/// Waiters currently parked on global slots.
	pub fn wait_queue_depth(&self) -> usize {
		self.waiters.len()
	}

	/// Milliseconds since the oldest still-queued target-scoped request,
	/// across parked waiters and per-target turn queues.
	pub fn wait_queue_age_ms(&self, now: Instant) -> u64 {
		let oldest_waiter = self.waiters.front().map(|w| w.enqueued_at);
		let oldest_turn = self
			.queues
			.values()
			.flat_map(|q| q.waiting.front().map(|t| t.enqueued_at))
			.min();
		match (oldest_waiter, oldest_turn) {
			(Some(a), Some(b)) => now.duration_since(a.min(b)).as_millis() as u64,
			(Some(a), None) => now.duration_since(a).as_millis() as u64,
			(None, Some(b)) => now.duration_since(b).as_millis() as u64,
			(None, None) => 0,
		}
	}

	/// Target-scoped operations admitted through gate one but not yet
	/// completed, plus everything still queued.
	pub fn pending_ops(&self) -> usize {
		self.waiters.len()
			+ self
				.queues
				.values()
				.map(|q| q.waiting.len())
				.sum::<usize>()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_turn_runs_immediately_then_queues() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		assert!(state.begin_turn("t1", now).is_none());
		assert!(state.begin_turn("t1", now).is_some());
		assert!(state.begin_turn("t1", now).is_some());
		// Independent target is not blocked by t1's queue.
		assert!(state.begin_turn("t2", now).is_none());
	}

	#[tokio::test]
	async fn finish_turn_grants_in_submission_order() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		assert!(state.begin_turn("t1", now).is_none());
		let second = state.begin_turn("t1", now).unwrap();
		let third = state.begin_turn("t1", now).unwrap();

		state.finish_turn("t1");
		second.await.unwrap();
		// Third is still parked until another completion.
		let mut third = third;
		assert!(third.try_recv().is_err());
		state.finish_turn("t1");
		third.await.unwrap();
		state.finish_turn("t1");
		// Queue is fully drained and removed.
		assert!(state.begin_turn("t1", now).is_none());
	}

	#[test]
	fn finish_turn_skips_abandoned_entries() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		assert!(state.begin_turn("t1", now).is_none());
		let abandoned = state.begin_turn("t1", now).unwrap();
		let live = state.begin_turn("t1", now).unwrap();
		drop(abandoned);
		state.finish_turn("t1");
		assert!(live.blocking_recv().is_ok());
	}

	#[test]
	fn slots_respect_cap() {
		let mut state = SchedulerState::new();
		assert!(state.try_acquire_slot(2));
		assert!(state.try_acquire_slot(2));
		assert!(!state.try_acquire_slot(2));
		state.release_slot();
		assert!(state.try_acquire_slot(2));
	}

	#[test]
	fn grants_are_fifo_and_bounded() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		assert!(state.try_acquire_slot(1));
		let (tx_a, _rx_a) = oneshot::channel();
		let (tx_b, _rx_b) = oneshot::channel();
		let (tx_c, _rx_c) = oneshot::channel();
		let a = state.park_waiter("t1", tx_a, now);
		let _b = state.park_waiter("t2", tx_b, now);
		let _c = state.park_waiter("t3", tx_c, now);

		state.release_slot();
		let granted = state.take_grantable(2);
		assert_eq!(granted.len(), 2);
		assert_eq!(granted[0].id, a);
		assert_eq!(state.in_flight, 2);
		assert_eq!(state.wait_queue_depth(), 1);
	}

	#[test]
	fn removed_waiter_cannot_be_granted() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		assert!(state.try_acquire_slot(1));
		let (tx_a, _rx_a) = oneshot::channel();
		let (tx_b, _rx_b) = oneshot::channel();
		let a = state.park_waiter("t1", tx_a, now);
		let b = state.park_waiter("t2", tx_b, now);
		assert!(state.remove_waiter(a).is_some());
		assert!(state.remove_waiter(a).is_none());
		state.release_slot();
		let granted = state.take_grantable(1);
		assert_eq!(granted.len(), 1);
		assert_eq!(granted[0].id, b);
	}

	#[tokio::test(start_paused = true)]
	async fn queue_age_tracks_oldest_entry() {
		let mut state = SchedulerState::new();
		let start = Instant::now();
		assert!(state.try_acquire_slot(1));
		let (tx, _rx) = oneshot::channel();
		state.park_waiter("t1", tx, start);
		tokio::time::advance(std::time::Duration::from_millis(3_000)).await;
		assert_eq!(state.wait_queue_age_ms(Instant::now()), 3_000);
		assert_eq!(state.pending_ops(), 1);
	}

	#[test]
	fn control_lane_is_independent_of_slots() {
		let mut state = SchedulerState::new();
		let now = Instant::now();
		// Saturate the global slots entirely.
		assert!(state.try_acquire_slot(1));
		assert!(state.begin_control_turn(now).is_none());
		let queued = state.begin_control_turn(now).unwrap();
		state.finish_control_turn();
		assert!(queued.blocking_recv().is_ok());
		state.finish_control_turn();
		assert!(state.begin_control_turn(now).is_none());
	}
}
