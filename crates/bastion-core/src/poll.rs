use std::time::Duration;
use tracing::debug;

use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts } | PollOutcome::TimedOut { attempts } => *attempts,
        }
    }
}

/// Evaluate `predicate` up to `max_attempts` times, sleeping `interval` between tries.
///
/// The sleep goes through the host so simulated hosts never block.
pub fn poll_until<F>(host: &dyn Host, interval: Duration, max_attempts: u32, mut predicate: F) -> PollOutcome
where
    F: FnMut() -> bool,
{
    for attempt in 1..=max_attempts {
        if predicate() {
            debug!(attempt, "poll condition met");
            return PollOutcome::Ready { attempts: attempt };
        }
        if attempt < max_attempts {
            host.sleep(interval);
        }
    }
    PollOutcome::TimedOut {
        attempts: max_attempts,
    }
}
