use std::time::{Duration, Instant};

use crate::error::{Result, ScanError};

/// How a requester waits for the compute side to hand a segment back.
///
/// The wait spins for `spin_iterations` checks, then polls every
/// `poll_interval`. Without a `deadline` it waits forever, so a compute task
/// that dies leaves the requester waiting until someone reads the server log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub spin_iterations: u32,
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            spin_iterations: 4096,
            poll_interval: Duration::from_micros(200),
            deadline: None,
        }
    }
}

impl WaitPolicy {
    /// Pure busy-wait, never sleeps.
    pub fn busy() -> Self {
        Self {
            spin_iterations: u32::MAX,
            poll_interval: Duration::ZERO,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Blocks until `ready` returns `Ok(true)`, an error, or the deadline passes.
    pub fn wait_until(&self, mut ready: impl FnMut() -> Result<bool>) -> Result<()> {
        let start = Instant::now();
        let mut spins = 0u32;

        loop {
            if ready()? {
                return Ok(());
            }

            if let Some(limit) = self.deadline {
                if start.elapsed() >= limit {
                    return Err(ScanError::Timeout(limit));
                }
            }

            if spins < self.spin_iterations {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.poll_interval);
            }
        }
    }
}
