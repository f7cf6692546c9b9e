use std::time::Duration;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 12;
const SLEEP_STEP_US: u64 = 50;
const SLEEP_STEPS_MAX: u64 = 20;

/// Bounded-progress waiting used at every suspension point: a lookup waiting
/// for a bucket's stale-to-copied transition, an assistant waiting for the
/// resize owner to publish the successor, reclamation waiting for hazard
/// quiescence.
///
/// Spins with a pause a bounded number of iterations, then yields the
/// processor, then sleeps with linearly increasing (capped) delay. Never an
/// unbounded busy-wait and never a hard timeout; the protocols guarantee
/// eventual completion, not bounded latency.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn wait(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let steps = u64::from(self.step - YIELD_LIMIT).min(SLEEP_STEPS_MAX);
            std::thread::sleep(Duration::from_micros(steps * SLEEP_STEP_US));
        }
        self.step = self.step.saturating_add(1);
    }
}
