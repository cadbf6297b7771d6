use std::time::{Duration, Instant};

/// Outcome of one scrape, kept so overlapping scrape requests can be
/// served from the last successful pass instead of hammering the database.
#[derive(Clone, Copy, Debug)]
pub struct ScrapeResult {
    started_at: Instant,
    successful: bool,
}

impl ScrapeResult {
    pub fn successful(start: Instant) -> Self {
        Self {
            started_at: start,
            successful: true,
        }
    }

    pub fn failed(start: Instant) -> Self {
        Self {
            started_at: start,
            successful: false,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Too old to serve to a coalesced caller.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}
