//! Metrics derivation.
//!
//! Turns a raw status sample into a [`DerivedSnapshot`]: throughput since the
//! previous sample, busy/idle counts, per-thread stuck streaks and the health
//! issues those numbers imply. Everything here is pure; the caller keeps the
//! previous snapshot for the next call.

use std::time::Duration;

use poolwatch_types::{DerivedSnapshot, HealthCheckConfig, HealthIssue, RawStatusSample};

/// Compute the derived view of `raw`.
///
/// `previous` is the snapshot derived from the prior sample of the same
/// connection, if any. `interval` is the configured poll interval and must be
/// non-zero.
pub fn derive(
    raw: RawStatusSample,
    previous: Option<&DerivedSnapshot>,
    interval: Duration,
    cfg: &HealthCheckConfig,
) -> DerivedSnapshot {
    let speed = compute_speed(&raw, previous, interval);
    let working = raw.working();
    let idle = raw.idle();
    let threads_working_times = compute_streaks(&raw, previous);

    let mut health_issues = Vec::new();

    for (thread_id, &streak) in threads_working_times.iter().enumerate() {
        if streak >= cfg.max_working_interval_times {
            health_issues.push(HealthIssue::thread_blocking(
                thread_id,
                streak,
                cfg.max_working_interval_times,
            ));
        }
    }

    if working == 0 {
        health_issues.push(HealthIssue::no_threads_working());
    } else {
        let usage = working as f32 / raw.threads.len() as f32;
        if usage < cfg.min_usage_rate {
            health_issues.push(HealthIssue::low_thread_usage(usage, cfg.min_usage_rate));
        }
    }

    DerivedSnapshot {
        status: raw,
        speed,
        idle,
        working,
        threads_working_times,
        health_issues,
    }
}

/// Results per second since the previous sample.
fn compute_speed(
    raw: &RawStatusSample,
    previous: Option<&DerivedSnapshot>,
    interval: Duration,
) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let secs = interval.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }

    // A counter that went backwards means the core restarted.
    let delta = raw.total_result.saturating_sub(previous.status.total_result);
    delta as f64 / secs
}

/// Consecutive samples each thread has spent busy without finishing a task.
fn compute_streaks(raw: &RawStatusSample, previous: Option<&DerivedSnapshot>) -> Vec<u32> {
    raw.threads
        .iter()
        .enumerate()
        .map(|(i, thread)| {
            if !thread.busy {
                return 0;
            }

            let before = previous.and_then(|p| {
                let state = p.status.threads.get(i)?;
                Some((state.processed, p.streak(i).unwrap_or(0)))
            });

            match before {
                Some((processed, streak)) if processed == thread.processed => streak + 1,
                Some(_) => 0,
                None => 1,
            }
        })
        .collect()
}
