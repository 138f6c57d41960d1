use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Timezones the provider is known to report reset times in. Anything else
/// falls back to `DEFAULT_TZ`.
const ALLOWED_TIMEZONES: &[&str] = &[
    "America/Los_Angeles",
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Phoenix",
    "UTC",
    "Europe/London",
    "Europe/Paris",
    "Asia/Tokyo",
];

const DEFAULT_TZ: Tz = chrono_tz::America::Los_Angeles;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Limit reached.*resets\s+(?P<time>[0-9:apm]+)\s*\((?P<tz>[^)]+)\)")
        .expect("rate-limit regex is valid")
});

/// Scan free-form generator output for a provider rate-limit notice.
///
/// Returns the epoch second at which the limit is expected to clear, or `None`
/// when no notice is present. `now` anchors the reset computation and is
/// `Utc::now()` outside tests.
pub fn detect_rate_limit(text: &str, now: DateTime<Utc>) -> Option<i64> {
    let caps = RATE_LIMIT_RE.captures(text)?;
    Some(parse_reset_epoch(&caps["time"], &caps["tz"], now))
}

/// Compute the next occurrence of `time_str` in zone `tz`, as an epoch second.
///
/// `now` is injected so the roll-over behavior is testable. An unrecognized
/// zone falls back to the default zone; an unparseable time fails open with
/// "retry in one hour" rather than blocking indefinitely.
pub fn parse_reset_epoch(time_str: &str, tz: &str, now: DateTime<Utc>) -> i64 {
    let zone: Tz = if ALLOWED_TIMEZONES.contains(&tz) {
        tz.parse().unwrap_or(DEFAULT_TZ)
    } else {
        DEFAULT_TZ
    };

    let (hour, minute) = match parse_clock(time_str) {
        Some(hm) => hm,
        None => return now.timestamp() + 3600,
    };

    let local_now = now.with_timezone(&zone);
    let mut local = match zone
        .with_ymd_and_hms(local_now.year(), local_now.month(), local_now.day(), hour, minute, 0)
        .single()
    {
        Some(t) => t,
        // DST gap or fold made the local time ambiguous; fail open.
        None => return now.timestamp() + 3600,
    };

    // The reset is always the next occurrence of that wall-clock time.
    if local < local_now {
        local = local + chrono::Duration::days(1);
    }

    local.timestamp()
}

/// Parse `H[:MM][am|pm]` into a 24-hour (hour, minute) pair.
fn parse_clock(time_str: &str) -> Option<(u32, u32)> {
    static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^(\d{1,2})(?::(\d{2}))?(am|pm)?$").expect("clock regex is valid")
    });

    let caps = CLOCK_RE.captures(time_str.trim())?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;

    if let Some(ampm) = caps.get(3) {
        match ampm.as_str().to_ascii_lowercase().as_str() {
            "pm" if hour < 12 => hour += 12,
            "am" if hour == 12 => hour = 0,
            _ => {}
        }
    }

    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Block until `epoch` has passed, ticking once per second.
///
/// A non-positive remaining duration returns immediately. The wait is
/// unbounded but cancellable: when the watch flips to `true` the whole run is
/// being torn down, so propagate `Interrupted`.
pub async fn wait_until(epoch: i64, cancel: &mut watch::Receiver<bool>) -> Result<()> {
    loop {
        if *cancel.borrow() {
            return Err(AppError::Interrupted);
        }

        let remaining = epoch - Utc::now().timestamp();
        if remaining <= 0 {
            return Ok(());
        }

        let h = remaining / 3600;
        let m = (remaining % 3600) / 60;
        let s = remaining % 60;
        tracing::info!("Rate limit resets in {h:02}:{m:02}:{s:02}");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return Err(AppError::Interrupted),
                Ok(()) => {}
                // Sender gone; no cancellation can arrive anymore.
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn detects_notice_with_time_and_zone() {
        let text = "blah blah\nLimit reached for today. Your limit resets 3pm (America/New_York).";
        assert!(detect_rate_limit(text, Utc::now()).is_some());
    }

    #[test]
    fn no_notice_returns_none() {
        assert_eq!(detect_rate_limit("all good, plan follows", Utc::now()), None);
        assert_eq!(detect_rate_limit("", Utc::now()), None);
    }

    #[test]
    fn detected_reset_is_always_in_the_future() {
        for time in ["1am", "12pm", "11:59pm", "6:30am", "23:00"] {
            for tz in ["UTC", "Asia/Tokyo", "America/Los_Angeles"] {
                let now = Utc::now();
                let epoch = parse_reset_epoch(time, tz, now);
                assert!(
                    epoch > now.timestamp(),
                    "reset {time} ({tz}) not in the future"
                );
            }
        }
    }

    #[test]
    fn reset_one_minute_ahead_stays_today() {
        // 23:58 UTC, reset at 11:59pm UTC -> 60 seconds away.
        let now = utc(2025, 6, 1, 23, 58, 0);
        let epoch = parse_reset_epoch("11:59pm", "UTC", now);
        assert_eq!(epoch - now.timestamp(), 60);
    }

    #[test]
    fn reset_just_passed_rolls_to_next_day() {
        // 23:59:30 UTC, reset at 11:59pm UTC -> tomorrow.
        let now = utc(2025, 6, 1, 23, 59, 30);
        let epoch = parse_reset_epoch("11:59pm", "UTC", now);
        let expected = utc(2025, 6, 2, 23, 59, 0).timestamp();
        assert_eq!(epoch, expected);
    }

    #[test]
    fn unknown_zone_falls_back_to_default() {
        let now = utc(2025, 6, 1, 12, 0, 0);
        let fallback = parse_reset_epoch("6pm", "Mars/Olympus_Mons", now);
        let default = parse_reset_epoch("6pm", "America/Los_Angeles", now);
        assert_eq!(fallback, default);
    }

    #[test]
    fn unparseable_time_fails_open_one_hour() {
        let now = utc(2025, 6, 1, 12, 0, 0);
        let epoch = parse_reset_epoch("whenever", "UTC", now);
        assert_eq!(epoch, now.timestamp() + 3600);
    }

    #[test]
    fn twelve_hour_clock_edges() {
        assert_eq!(parse_clock("12am"), Some((0, 0)));
        assert_eq!(parse_clock("12pm"), Some((12, 0)));
        assert_eq!(parse_clock("12:30am"), Some((0, 30)));
        assert_eq!(parse_clock("3pm"), Some((15, 0)));
        assert_eq!(parse_clock("15:45"), Some((15, 45)));
        assert_eq!(parse_clock("25:00"), None);
    }

    #[tokio::test]
    async fn wait_until_past_epoch_returns_immediately() {
        let (_tx, mut rx) = watch::channel(false);
        let start = std::time::Instant::now();
        wait_until(Utc::now().timestamp() - 10, &mut rx).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_until_short_window_blocks_for_roughly_that_long() {
        let (_tx, mut rx) = watch::channel(false);
        let start = std::time::Instant::now();
        wait_until(Utc::now().timestamp() + 2, &mut rx).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "returned before the window");
        assert!(elapsed < Duration::from_millis(3500), "overshot the window");
    }

    #[tokio::test]
    async fn wait_until_is_cancellable() {
        let (tx, mut rx) = watch::channel(false);
        let far_future = Utc::now().timestamp() + 3600;

        let waiter = tokio::spawn(async move { wait_until(far_future, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AppError::Interrupted)));
    }
}
