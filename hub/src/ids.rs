//! Misc glue: jitter and the other small helpers too minor to deserve their
//! own module (spec §2 "Misc glue"). Stable-hash IDs live in `beszel_core`
//! since the wire protocol and the pipeline both need `fnv32`.

use std::time::Duration;

use rand::Rng;

/// Random jitter in the 51-95% band of `interval`, used by `SystemWorker` to
/// de-cluster fleet startup (spec §4.5).
pub fn startup_jitter(interval: Duration) -> Duration {
    let frac: f64 = rand::thread_rng().gen_range(0.51..=0.95);
    Duration::from_secs_f64(interval.as_secs_f64() * frac)
}

/// Delay before the first tick when no WS transport is attached at startup,
/// giving an inbound WS connection a chance to beat SSH dial-on-demand.
pub const SSH_STARTUP_DELAY: Duration = Duration::from_secs(11);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let interval = Duration::from_secs(60_000 / 1000);
        for _ in 0..50 {
            let j = startup_jitter(interval).as_secs_f64();
            assert!(j >= interval.as_secs_f64() * 0.51 - 1e-9);
            assert!(j <= interval.as_secs_f64() * 0.95 + 1e-9);
        }
    }
}
