/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod endpoints;
pub mod node_monitor;

use std::error::Error;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::stratus::logger::{log_error, log_info};

/// Run `tick` every `period` until the token is cancelled. The first tick
/// fires one period after start; a tick error is logged and the loop keeps
/// going. Cancellation lets an in-flight tick finish.
pub fn spawn_tick_loop<F>(
    label: &'static str,
    period: Duration,
    cancel: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Result<(), Box<dyn Error + Send + Sync>> + Send + 'static,
{
    tokio::spawn(async move {
        log_info(label, "Controller started", &[]);
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; swallow that so the first real tick
        // lands one full period from now.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info(label, "Controller stopped", &[]);
                    return;
                }
                _ = timer.tick() => {
                    if let Err(err) = tick() {
                        log_error(label, "Tick failed", &[("error", err.to_string().as_str())]);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_periodically_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cancel = CancellationToken::new();

        let handle = spawn_tick_loop(
            "test-loop",
            Duration::from_secs(5),
            cancel.clone(),
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_secs(16)).await;
        cancel.cancel();
        handle.await.expect("join");

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_tick_does_not_stop_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cancel = CancellationToken::new();

        let handle = spawn_tick_loop(
            "test-loop",
            Duration::from_secs(1),
            cancel.clone(),
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Err(crate::stratus::util::new_error("boom"))
            },
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.expect("join");

        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
