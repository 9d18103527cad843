use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Stand-in expiry for budgets too large to add to an `Instant` (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Wall-clock budget for one run, anchored when the run starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started_at: Instant,
    expires_at: Instant,
}

/// Which side of the race finished first.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Race<T> {
    Finished(T),
    Expired,
}

impl Deadline {
    pub(crate) fn start(budget: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            started_at,
            expires_at: started_at
                .checked_add(budget)
                .unwrap_or_else(|| started_at + FAR_FUTURE),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Runs `work` until it completes or the deadline passes.
    ///
    /// Completion wins a tie: if `work` is ready on the same poll in which
    /// the deadline has passed, the result is `Finished`.
    pub(crate) async fn race<F: Future>(&self, work: F) -> Race<F::Output> {
        tokio::select! {
            biased;
            out = work => Race::Finished(out),
            _ = sleep_until(self.expires_at) => Race::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ready_work_wins_against_expired_deadline() {
        for _ in 0..100 {
            let deadline = Deadline::start(Duration::from_millis(10));
            tokio::time::advance(Duration::from_millis(10)).await;

            let outcome = deadline.race(std::future::ready(7)).await;
            assert_eq!(outcome, Race::Finished(7));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_work_expires() {
        let deadline = Deadline::start(Duration::from_millis(50));

        let outcome = deadline.race(std::future::pending::<()>()).await;

        assert_eq!(outcome, Race::Expired);
        assert!(deadline.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_does_not_overflow() {
        let deadline = Deadline::start(Duration::MAX);

        let outcome = deadline.race(std::future::ready("quick")).await;

        assert_eq!(outcome, Race::Finished("quick"));
        assert!(deadline.expires_at > deadline.started_at + Duration::from_secs(86400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_finishing_before_deadline() {
        let deadline = Deadline::start(Duration::from_secs(1));

        let outcome = deadline
            .race(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "done"
            })
            .await;

        assert_eq!(outcome, Race::Finished("done"));
        assert!(deadline.elapsed() < Duration::from_secs(1));
    }
}
