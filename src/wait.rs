//! Poll-until-settled waits
//!
//! Several vendor operations are asynchronous server-side: the API call is
//! acknowledged immediately and the work (boot, teardown of networking and
//! storage) finishes later. Every backend settles such operations through
//! one primitive instead of duplicating the loop per call site.
//!
//! The probe returns `Ok(Some(v))` when the operation has settled,
//! `Ok(None)` to keep polling, and `Err` to abort. Destructive operations
//! observe deadlines on the order of minutes, not seconds.

use crate::error::{Result, ShoesError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Bounded wait parameters: poll interval plus an overall deadline.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            poll_interval,
            deadline,
        }
    }

    /// Boot waits: servers report ACTIVE within a few minutes.
    pub fn for_boot() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(3 * 60))
    }

    /// Teardown waits: the substrate releases networking and storage
    /// asynchronously, which can take minutes.
    pub fn for_teardown() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5 * 60))
    }

    /// Poll `probe` until it settles or the deadline passes.
    ///
    /// `backend` and `step` only feed error context and logs.
    pub async fn poll_until<F, Fut, T>(
        &self,
        backend: &'static str,
        step: &'static str,
        mut probe: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        loop {
            match probe().await? {
                Some(settled) => return Ok(settled),
                None => {
                    if started.elapsed() >= self.deadline {
                        warn!(
                            "{}: {} not settled after {:?}, giving up",
                            backend, step, self.deadline
                        );
                        return Err(ShoesError::WaitTimeout {
                            backend,
                            step,
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
