//! Hysteresis-based admission governor.
//!
//! Computes, per session, how many target-scoped operations may run
//! concurrently. Pressure signals are sampled at most once per
//! `sample_interval_ms`; any degraded sample drops the cap immediately,
//! while recovery requires `recovery_stable_windows` consecutive clean
//! samples before the cap returns to the mode ceiling.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::OperatingMode;

/// Ordinal pressure severity. Classification takes the worst ordinal across
/// all signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
	Ok,
	Medium,
	High,
	Critical,
}

/// Host probe for memory signals. Injected so hosts and tests control the
/// readings; [`SystemSampler`] is the best-effort Linux implementation.
pub trait ResourceSampler: Send + Sync {
	/// Free physical memory as a percentage of total.
	fn free_memory_pct(&self) -> f64;
	/// Resident set size of this process, in megabytes.
	fn rss_mb(&self) -> f64;
}

/// Reads `/proc/meminfo` and `/proc/self/statm`. Off-Linux (or on read
/// failure) it reports no pressure at all.
pub struct SystemSampler;

impl ResourceSampler for SystemSampler {
	fn free_memory_pct(&self) -> f64 {
		read_meminfo().unwrap_or(100.0)
	}

	fn rss_mb(&self) -> f64 {
		read_rss_mb().unwrap_or(0.0)
	}
}

fn read_meminfo() -> Option<f64> {
	let text = std::fs::read_to_string("/proc/meminfo").ok()?;
	let mut total = None;
	let mut available = None;
	for line in text.lines() {
		if let Some(rest) = line.strip_prefix("MemTotal:") {
			total = parse_kb(rest);
		} else if let Some(rest) = line.strip_prefix("MemAvailable:") {
			available = parse_kb(rest);
		}
	}
	let (total, available) = (total?, available?);
	if total == 0.0 {
		return None;
	}
	Some(available / total * 100.0)
}

fn read_rss_mb() -> Option<f64> {
	let text = std::fs::read_to_string("/proc/self/statm").ok()?;
	let pages: f64 = text.split_whitespace().nth(1)?.parse().ok()?;
	Some(pages * 4096.0 / (1024.0 * 1024.0))
}

fn parse_kb(rest: &str) -> Option<f64> {
	rest.trim().trim_end_matches(" kB").trim().parse().ok()
}

/// Static per-session admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorPolicy {
	/// The cap never drops below this.
	pub floor: u32,
	pub backpressure_timeout_ms: u64,
	pub sample_interval_ms: u64,
	/// Consecutive clean samples required before the cap recovers.
	pub recovery_stable_windows: u32,
	/// Free-memory ladder, percent of total. Lower is worse.
	pub free_mem_medium_pct: f64,
	pub free_mem_high_pct: f64,
	pub free_mem_critical_pct: f64,
	/// RSS ladder, percent of `rss_budget_mb`. Higher is worse.
	pub rss_budget_mb: f64,
	pub rss_soft_pct: f64,
	pub rss_high_pct: f64,
	pub rss_critical_pct: f64,
	/// Wait-queue age ladder.
	pub queue_age_high_ms: u64,
	pub queue_age_critical_ms: u64,
	/// Per-mode concurrency ceilings.
	pub headed_managed_cap: u32,
	pub headless_managed_cap: u32,
	pub cdp_connect_headed_cap: u32,
	pub cdp_connect_headless_cap: u32,
	pub extension_headed_cap: u32,
	pub legacy_extension_headed_cap: u32,
}

impl Default for GovernorPolicy {
	fn default() -> Self {
		Self {
			floor: 1,
			backpressure_timeout_ms: 10_000,
			sample_interval_ms: 1_000,
			recovery_stable_windows: 3,
			free_mem_medium_pct: 25.0,
			free_mem_high_pct: 15.0,
			free_mem_critical_pct: 8.0,
			rss_budget_mb: 4096.0,
			rss_soft_pct: 60.0,
			rss_high_pct: 80.0,
			rss_critical_pct: 92.0,
			queue_age_high_ms: 5_000,
			queue_age_critical_ms: 15_000,
			headed_managed_cap: 4,
			headless_managed_cap: 8,
			cdp_connect_headed_cap: 4,
			cdp_connect_headless_cap: 6,
			extension_headed_cap: 2,
			legacy_extension_headed_cap: 1,
		}
	}
}

impl GovernorPolicy {
	pub fn mode_cap(&self, mode: OperatingMode) -> u32 {
		let cap = match mode {
			OperatingMode::HeadedManaged => self.headed_managed_cap,
			OperatingMode::HeadlessManaged => self.headless_managed_cap,
			OperatingMode::CdpConnectHeaded => self.cdp_connect_headed_cap,
			OperatingMode::CdpConnectHeadless => self.cdp_connect_headless_cap,
			OperatingMode::ExtensionHeaded => self.extension_headed_cap,
			OperatingMode::LegacyExtensionHeaded => self.legacy_extension_headed_cap,
		};
		cap.max(self.floor)
	}
}

/// Memoized result of one sampling window.
#[derive(Debug, Clone, Copy)]
pub struct GovernorSnapshot {
	pub effective_cap: u32,
	pub pressure: Pressure,
}

/// Per-session governor: policy + mutable state. Mutated only by the
/// scheduler's admission path, on the session's own lock.
#[derive(Debug)]
pub struct Governor {
	policy: GovernorPolicy,
	mode: OperatingMode,
	effective_cap: u32,
	last_pressure: Pressure,
	last_sample_at: Option<Instant>,
	ok_streak: u32,
	discarded_since_sample: u32,
	frozen_since_sample: u32,
}

impl Governor {
	pub fn new(policy: GovernorPolicy, mode: OperatingMode) -> Self {
		let effective_cap = policy.mode_cap(mode);
		Self {
			policy,
			mode,
			effective_cap,
			last_pressure: Pressure::Ok,
			last_sample_at: None,
			ok_streak: 0,
			discarded_since_sample: 0,
			frozen_since_sample: 0,
		}
	}

	pub fn policy(&self) -> &GovernorPolicy {
		&self.policy
	}

	pub fn effective_cap(&self) -> u32 {
		self.effective_cap
	}

	pub fn last_pressure(&self) -> Pressure {
		self.last_pressure
	}

	/// Records a host memory-saver "discarded tab" signal; consumed and
	/// reset by the next sample.
	pub fn note_discarded(&mut self) {
		self.discarded_since_sample += 1;
	}

	pub fn note_frozen(&mut self) {
		self.frozen_since_sample += 1;
	}

	/// Re-evaluates the cap, at most once per `sample_interval_ms`.
	///
	/// Calls landing inside the window return the memoized snapshot, so a
	/// burst of waiters woken together observes one consistent cap.
	pub fn sample(
		&mut self,
		now: Instant,
		queue_age_ms: u64,
		queue_depth: usize,
		sampler: &dyn ResourceSampler,
	) -> GovernorSnapshot {
		if let Some(last) = self.last_sample_at {
			if now.duration_since(last).as_millis() < u128::from(self.policy.sample_interval_ms) {
				return GovernorSnapshot {
					effective_cap: self.effective_cap,
					pressure: self.last_pressure,
				};
			}
		}
		self.last_sample_at = Some(now);

		let pressure = self.classify(queue_age_ms, queue_depth, sampler);
		self.discarded_since_sample = 0;
		self.frozen_since_sample = 0;

		let mode_cap = self.policy.mode_cap(self.mode);
		match pressure {
			Pressure::Ok => {
				self.ok_streak += 1;
				if self.ok_streak >= self.policy.recovery_stable_windows {
					if self.effective_cap < mode_cap {
						debug!(
							target = "tabops.governor",
							cap = mode_cap,
							"cap recovered after stable window"
						);
					}
					self.effective_cap = mode_cap;
					self.ok_streak = 0;
				}
			}
			degraded => {
				self.ok_streak = 0;
				let dropped = match degraded {
					Pressure::Medium => self.effective_cap.saturating_sub(1),
					Pressure::High => self.effective_cap / 2,
					_ => self.policy.floor,
				};
				self.effective_cap = dropped.clamp(self.policy.floor, mode_cap);
				debug!(
					target = "tabops.governor",
					pressure = ?degraded,
					cap = self.effective_cap,
					queue_age_ms,
					queue_depth,
					"cap dropped under pressure"
				);
			}
		}
		self.last_pressure = pressure;

		GovernorSnapshot {
			effective_cap: self.effective_cap,
			pressure,
		}
	}

	// Queue depth carries no thresholds of its own: depth tracks the cap
	// deficit that queue age already measures, so it feeds logging and
	// backpressure diagnostics only.
	fn classify(
		&self,
		queue_age_ms: u64,
		_queue_depth: usize,
		sampler: &dyn ResourceSampler,
	) -> Pressure {
		let p = &self.policy;
		let mut worst = Pressure::Ok;

		let free = sampler.free_memory_pct();
		worst = worst.max(if free < p.free_mem_critical_pct {
			Pressure::Critical
		} else if free < p.free_mem_high_pct {
			Pressure::High
		} else if free < p.free_mem_medium_pct {
			Pressure::Medium
		} else {
			Pressure::Ok
		});

		if p.rss_budget_mb > 0.0 {
			let rss_pct = sampler.rss_mb() / p.rss_budget_mb * 100.0;
			worst = worst.max(if rss_pct >= p.rss_critical_pct {
				Pressure::Critical
			} else if rss_pct >= p.rss_high_pct {
				Pressure::High
			} else if rss_pct >= p.rss_soft_pct {
				Pressure::Medium
			} else {
				Pressure::Ok
			});
		}

		worst = worst.max(if queue_age_ms >= p.queue_age_critical_ms {
			Pressure::Critical
		} else if queue_age_ms >= p.queue_age_high_ms {
			Pressure::High
		} else {
			Pressure::Ok
		});

		// Memory-saver interventions mean the host is already shedding tabs.
		worst = worst.max(if self.discarded_since_sample >= 3 {
			Pressure::Critical
		} else if self.discarded_since_sample > 0 {
			Pressure::High
		} else if self.frozen_since_sample > 0 {
			Pressure::Medium
		} else {
			Pressure::Ok
		});

		worst
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::time::Duration;

	use super::*;

	/// Sampler returning a scripted sequence of free-memory readings.
	struct ScriptedSampler {
		free_pct: Mutex<Vec<f64>>,
	}

	impl ScriptedSampler {
		fn new(readings: Vec<f64>) -> Self {
			Self {
				free_pct: Mutex::new(readings),
			}
		}
	}

	impl ResourceSampler for ScriptedSampler {
		fn free_memory_pct(&self) -> f64 {
			let mut readings = self.free_pct.lock().unwrap();
			if readings.len() > 1 {
				readings.remove(0)
			} else {
				readings[0]
			}
		}

		fn rss_mb(&self) -> f64 {
			0.0
		}
	}

	fn policy() -> GovernorPolicy {
		GovernorPolicy {
			floor: 1,
			recovery_stable_windows: 3,
			sample_interval_ms: 1_000,
			..GovernorPolicy::default()
		}
	}

	#[tokio::test(start_paused = true)]
	async fn recovery_requires_three_stable_windows() {
		// critical, ok, ok, ok -> caps 1, 1, 1, mode_cap
		let sampler = ScriptedSampler::new(vec![2.0, 90.0, 90.0, 90.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		let mode_cap = governor.policy().mode_cap(OperatingMode::HeadlessManaged);
		let mut caps = Vec::new();
		for _ in 0..4 {
			let snap = governor.sample(Instant::now(), 0, 0, &sampler);
			caps.push(snap.effective_cap);
			tokio::time::advance(Duration::from_millis(1_000)).await;
		}
		assert_eq!(caps, vec![1, 1, 1, mode_cap]);
	}

	#[tokio::test(start_paused = true)]
	async fn single_ok_after_critical_does_not_raise_cap() {
		let sampler = ScriptedSampler::new(vec![2.0, 90.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.effective_cap, 1);
		tokio::time::advance(Duration::from_millis(1_000)).await;
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.effective_cap, 1);
		assert_eq!(snap.pressure, Pressure::Ok);
	}

	#[tokio::test(start_paused = true)]
	async fn calls_within_window_memoize() {
		let sampler = ScriptedSampler::new(vec![2.0, 90.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		let first = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(first.pressure, Pressure::Critical);
		// Still inside the window: the clean reading must not be consumed.
		tokio::time::advance(Duration::from_millis(200)).await;
		let second = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(second.pressure, Pressure::Critical);
		assert_eq!(second.effective_cap, first.effective_cap);
	}

	#[tokio::test(start_paused = true)]
	async fn medium_pressure_steps_down_by_one() {
		let sampler = ScriptedSampler::new(vec![20.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		let before = governor.effective_cap();
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.pressure, Pressure::Medium);
		assert_eq!(snap.effective_cap, before - 1);
	}

	#[tokio::test(start_paused = true)]
	async fn high_pressure_halves_and_clamps_to_floor() {
		let sampler = ScriptedSampler::new(vec![10.0]);
		let mut governor = Governor::new(policy(), OperatingMode::LegacyExtensionHeaded);
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.pressure, Pressure::High);
		assert_eq!(snap.effective_cap, governor.policy().floor);
	}

	#[tokio::test(start_paused = true)]
	async fn queue_age_alone_degrades_pressure() {
		let sampler = ScriptedSampler::new(vec![90.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		let snap = governor.sample(Instant::now(), 20_000, 4, &sampler);
		assert_eq!(snap.pressure, Pressure::Critical);
		assert_eq!(snap.effective_cap, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn discard_signals_reset_after_sample() {
		let sampler = ScriptedSampler::new(vec![90.0]);
		let mut governor = Governor::new(policy(), OperatingMode::HeadlessManaged);
		governor.note_discarded();
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.pressure, Pressure::High);
		// Counter consumed: the next window classifies clean.
		tokio::time::advance(Duration::from_millis(1_000)).await;
		let snap = governor.sample(Instant::now(), 0, 0, &sampler);
		assert_eq!(snap.pressure, Pressure::Ok);
	}

	#[test]
	fn mode_cap_never_below_floor() {
		let policy = GovernorPolicy {
			floor: 3,
			legacy_extension_headed_cap: 1,
			..GovernorPolicy::default()
		};
		assert_eq!(policy.mode_cap(OperatingMode::LegacyExtensionHeaded), 3);
	}
}
