// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

use async_trait::async_trait;

// Monotonic time source injected into the trigger controller and the
// diagnostics so both can be exercised in tests without waiting on wall
// time.
#[async_trait]
pub trait ClockTrait: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, deadline: Instant);
}

pub struct SystemClock;

#[async_trait]
impl ClockTrait for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}
