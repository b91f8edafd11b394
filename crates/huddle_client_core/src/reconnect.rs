#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff for reconnect `attempt` (1-based): `base * 2^(attempt-1)` with
/// +/-10% jitter, never above `max`. Returns the deadline and the delay in ms.
pub fn schedule_reconnect(attempt: u32, base: Duration, max: Duration) -> (Instant, u64) {
	let final_ms = backoff_ms(attempt, base, max, &mut rand::rng());
	(Instant::now() + Duration::from_millis(final_ms), final_ms)
}

fn backoff_ms(attempt: u32, base: Duration, max: Duration, rng: &mut impl Rng) -> u64 {
	let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
	let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(1);
	let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
	let delay_ms = base_ms.saturating_mul(pow).clamp(1, max_ms);
	let jitter_window = (delay_ms / 10).max(1);
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));
	delay_ms
		.saturating_sub(jitter_window)
		.saturating_add(jitter_offset)
		.clamp(1, max_ms)
}

#[cfg(test)]
mod tests {
	use super::*;

	const BASE: Duration = Duration::from_secs(1);
	const MAX: Duration = Duration::from_secs(5);

	#[test]
	fn delays_grow_and_stay_bounded() {
		let mut rng = rand::rng();
		for _ in 0..200 {
			let first = backoff_ms(1, BASE, MAX, &mut rng);
			assert!((900..=1100).contains(&first), "attempt 1: {first}");

			let second = backoff_ms(2, BASE, MAX, &mut rng);
			assert!((1800..=2200).contains(&second), "attempt 2: {second}");

			for attempt in 3..=40 {
				let ms = backoff_ms(attempt, BASE, MAX, &mut rng);
				assert!(ms <= 5000, "attempt {attempt}: {ms}");
				assert!(ms >= 3600, "attempt {attempt}: {ms}");
			}
		}
	}

	#[test]
	fn zero_base_still_waits() {
		let ms = backoff_ms(1, Duration::ZERO, MAX, &mut rand::rng());
		assert!(ms >= 1);
	}

	#[test]
	fn deadline_matches_reported_delay() {
		let before = Instant::now();
		let (deadline, ms) = schedule_reconnect(1, Duration::from_millis(100), Duration::from_millis(500));
		assert!(deadline >= before + Duration::from_millis(ms));
		assert!(ms <= 500);
	}
}
