// Copyright 2025 The Inlet Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exponential backoff with optional full jitter.

use std::time::Duration;

/// Computes retry delays: the envelope doubles from `base` up to `cap`, and
/// with jitter enabled each delay is drawn uniformly from `0..=envelope`
/// (full jitter), which spreads reconnecting clients apart after a broker
/// restart.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            base,
            cap,
            jitter,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(31);
        let envelope_ms = self
            .base
            .as_millis()
            .saturating_mul(1u128 << shift)
            .min(self.cap.as_millis());
        let envelope_ms = u64::try_from(envelope_ms).unwrap_or(u64::MAX);

        self.attempt = self.attempt.saturating_add(1);

        if self.jitter {
            Duration::from_millis(fastrand::u64(0..=envelope_ms))
        } else {
            Duration::from_millis(envelope_ms)
        }
    }

    /// Restore the initial delay after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
