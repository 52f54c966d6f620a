//! Bounded polling.
//!
//! Lock acquisition and boot readiness are both "probe until ready or give
//! up". [`await_condition`] is the one loop they share.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Condition holds; stop polling with this value.
    Ready(T),
    /// Not yet; sleep one interval before probing again.
    Wait,
    /// Something was cleared out of the way; probe again without sleeping.
    Retry,
}

/// The timeout elapsed before the condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("condition not met within {waited:?}")]
pub struct Elapsed {
    pub waited: Duration,
}

/// Probe repeatedly until it reports [`Probe::Ready`] or `timeout` elapses.
///
/// The probe always runs at least once. A sleep never overshoots the
/// deadline by more than one probe: when the remaining budget is shorter
/// than `interval`, the loop sleeps only for the remainder and probes one
/// final time.
pub async fn await_condition<T, F, Fut>(
    mut probe: F,
    interval: Duration,
    timeout: Duration,
) -> Result<T, Elapsed>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        match probe().await {
            Probe::Ready(value) => return Ok(value),
            Probe::Retry => {}
            Probe::Wait => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Elapsed { waited: now - started });
                }
                tokio::time::sleep(interval.min(deadline - now)).await;
            }
        }

        if Instant::now() >= deadline {
            // One last look so a condition that turned true during the
            // final sleep is not reported as a timeout.
            return match probe().await {
                Probe::Ready(value) => Ok(value),
                _ => Err(Elapsed { waited: started.elapsed() }),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_ready_on_first_probe() {
        let result = await_condition(
            || async { Probe::Ready(7) },
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_becomes_ready_after_waits() {
        let calls = Cell::new(0u32);
        let result = await_condition(
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n >= 3 { Probe::Ready(n) } else { Probe::Wait } }
            },
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_times_out() {
        let result: Result<(), Elapsed> = await_condition(
            || async { Probe::Wait },
            Duration::from_millis(10),
            Duration::from_millis(60),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.waited >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_retry_does_not_sleep() {
        let calls = Cell::new(0u32);
        let started = std::time::Instant::now();
        let result = await_condition(
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n >= 50 { Probe::Ready(()) } else { Probe::Retry } }
            },
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
