//! The status transition function and the rolling uptime window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::UptimeWindow;
use crate::db::{PingResult, ServerStatus, StatusKind};

/// Status implied by a failure streak under `threshold`.
pub fn kind_for(consecutive_failures: u32, threshold: u32) -> StatusKind {
    match consecutive_failures {
        0 => StatusKind::Up,
        n if n >= threshold.max(1) => StatusKind::Down,
        _ => StatusKind::Degraded,
    }
}

/// Fold one result into the previous status.
///
/// Pure: the caller supplies the uptime percentage for the window that
/// already includes `result`.
pub fn next_status(
    previous: Option<&ServerStatus>,
    result: &PingResult,
    threshold: u32,
    uptime_percentage: f64,
) -> ServerStatus {
    let threshold = threshold.max(1);
    let at = result.checked_at;
    let last_check = previous.map_or(at, |p| p.last_check.max(at));

    let mut next = ServerStatus {
        server_id: result.server_id,
        status: StatusKind::Up,
        uptime_percentage,
        last_check,
        last_up: previous.and_then(|p| p.last_up),
        last_down: previous.and_then(|p| p.last_down),
        consecutive_failures: 0,
        failure_threshold: threshold,
        message: "OK".to_string(),
        updated_at: Utc::now().max(last_check),
    };

    if result.status.is_success() {
        next.last_up = Some(at);
    } else {
        next.consecutive_failures = previous.map_or(0, |p| p.consecutive_failures).saturating_add(1);
        next.status = kind_for(next.consecutive_failures, threshold);
        next.last_down = Some(at);
        next.message = result
            .error_message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| result.status.as_str().to_string());
    }
    next
}

/// Success ratio over the last N results or the last T of time.
#[derive(Debug, Clone)]
pub struct RollingUptime {
    window: UptimeWindow,
    samples: VecDeque<(DateTime<Utc>, bool)>,
}

impl RollingUptime {
    pub fn new(window: UptimeWindow) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Seed from history given oldest first.
    pub fn from_history<I>(window: UptimeWindow, history: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, bool)>,
    {
        let mut uptime = Self::new(window);
        for (at, ok) in history {
            uptime.record(at, ok);
        }
        uptime
    }

    pub fn record(&mut self, at: DateTime<Utc>, success: bool) {
        self.samples.push_back((at, success));
        match self.window {
            UptimeWindow::Count(n) => {
                while self.samples.len() > n.max(1) {
                    self.samples.pop_front();
                }
            }
            UptimeWindow::Time(span) => {
                let newest = self.samples.iter().map(|(t, _)| *t).max().unwrap_or(at);
                let cutoff = chrono::Duration::from_std(span)
                    .ok()
                    .and_then(|span| newest.checked_sub_signed(span));
                if let Some(cutoff) = cutoff {
                    self.samples.retain(|(t, _)| *t >= cutoff);
                }
            }
        }
    }

    /// Percentage of successes, rounded to two decimals. 100 when empty.
    pub fn percentage(&self) -> f64 {
        if self.samples.is_empty() {
            return 100.0;
        }
        let ok = self.samples.iter().filter(|(_, s)| *s).count();
        let pct = ok as f64 * 100.0 / self.samples.len() as f64;
        (pct * 100.0).round() / 100.0
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckStatus;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn result(status: CheckStatus, at: DateTime<Utc>) -> PingResult {
        PingResult {
            server_id: 1,
            status,
            response_time_ms: 5.0,
            status_code: None,
            error_message: match status {
                CheckStatus::Success => None,
                _ => Some(format!("{} happened", status.as_str())),
            },
            checked_at: at,
        }
    }

    fn fold(outcomes: &[CheckStatus], threshold: u32) -> Vec<ServerStatus> {
        let start = Utc::now();
        let mut previous: Option<ServerStatus> = None;
        let mut out = Vec::new();
        for (i, outcome) in outcomes.iter().enumerate() {
            let r = result(*outcome, start + Duration::seconds(i as i64));
            let next = next_status(previous.as_ref(), &r, threshold, 100.0);
            out.push(next.clone());
            previous = Some(next);
        }
        out
    }

    #[test]
    fn test_consecutive_failures_property() {
        use CheckStatus::*;
        let outcomes = [Failure, Timeout, Success, Failure, Failure, Failure, Failure, Success];
        let mut streak = 0;
        for (outcome, status) in outcomes.iter().zip(fold(&outcomes, 3)) {
            streak = if outcome.is_success() { 0 } else { streak + 1 };
            assert_eq!(status.consecutive_failures, streak);
        }
    }

    #[test]
    fn test_threshold_property() {
        use CheckStatus::*;
        let outcomes = [Failure, Failure, Failure, Failure, Failure, Success, Timeout];
        for threshold in 1..=6 {
            for status in fold(&outcomes, threshold) {
                let n = status.consecutive_failures;
                let expected = if n == 0 {
                    StatusKind::Up
                } else if n >= threshold {
                    StatusKind::Down
                } else {
                    StatusKind::Degraded
                };
                assert_eq!(status.status, expected, "threshold {threshold}, failures {n}");
            }
        }
    }

    #[test]
    fn test_three_timeouts_then_recovery() {
        use CheckStatus::*;
        let states: Vec<_> = fold(&[Success, Timeout, Timeout, Timeout, Success], 3)
            .into_iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(
            states,
            vec![
                StatusKind::Up,
                StatusKind::Degraded,
                StatusKind::Degraded,
                StatusKind::Down,
                StatusKind::Up
            ]
        );
    }

    #[test]
    fn test_zero_threshold_clamps_to_one() {
        let statuses = fold(&[CheckStatus::Failure], 0);
        assert_eq!(statuses[0].status, StatusKind::Down);
        assert_eq!(statuses[0].failure_threshold, 1);
    }

    #[test]
    fn test_messages_and_timestamps() {
        let t0 = Utc::now();
        let fail = PingResult {
            error_message: None,
            ..result(CheckStatus::Timeout, t0)
        };
        let down = next_status(None, &fail, 3, 0.0);
        assert_eq!(down.message, "timeout");
        assert_eq!(down.last_down, Some(t0));
        assert_eq!(down.last_up, None);

        let ok = result(CheckStatus::Success, t0 + Duration::seconds(5));
        let up = next_status(Some(&down), &ok, 3, 50.0);
        assert_eq!(up.message, "OK");
        assert_eq!(up.last_down, Some(t0));
        assert_eq!(up.last_up, Some(t0 + Duration::seconds(5)));
        assert_eq!(up.uptime_percentage, 50.0);
    }

    #[test]
    fn test_last_check_never_regresses() {
        let t0 = Utc::now();
        let newer = next_status(None, &result(CheckStatus::Success, t0), 3, 100.0);
        let stale = result(CheckStatus::Success, t0 - Duration::seconds(30));
        assert_eq!(next_status(Some(&newer), &stale, 3, 100.0).last_check, t0);
    }

    #[test]
    fn test_uptime_count_window() {
        let t0 = Utc::now();
        let mut uptime = RollingUptime::new(UptimeWindow::Count(4));
        assert_eq!(uptime.percentage(), 100.0);
        for (i, ok) in [false, false, true, true, true, false].iter().enumerate() {
            uptime.record(t0 + Duration::seconds(i as i64), *ok);
        }
        assert_eq!(uptime.len(), 4);
        assert_eq!(uptime.percentage(), 75.0);
    }

    #[test]
    fn test_uptime_time_window() {
        let t0 = Utc::now();
        let window = UptimeWindow::Time(StdDuration::from_secs(60));
        let uptime = RollingUptime::from_history(
            window,
            [
                (t0, false),
                (t0 + Duration::seconds(50), true),
                (t0 + Duration::seconds(100), true),
                (t0 + Duration::seconds(110), false),
            ],
        );
        assert_eq!(uptime.len(), 3);
        assert_eq!(uptime.percentage(), 66.67);
    }
}
