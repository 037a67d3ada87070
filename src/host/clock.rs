//! Guest clock skew detection and correction.
//!
//! A guest whose clock drifts from the local machine will reject (or hand
//! out) certificates outside their validity window. After boot we read the
//! guest's epoch time over its runner and, if it is off by more than
//! [`MAX_CLOCK_DESYNC_SECONDS`], set it to the local epoch second.
//!
//! Transport latency is not accounted for; the tolerance absorbs it. The
//! measurement and the correction each sample the local clock when they run.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use crate::host::runner::CommandRunner;

/// Largest guest/local skew, in either direction, that is left alone.
pub const MAX_CLOCK_DESYNC_SECONDS: f64 = 2.1;

/// Guest command printing `<epoch seconds>.<nanoseconds>`.
const GUEST_CLOCK_CMD: &str = "date +%s.%N";

/// Source of "now" on the local machine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse the output of `date +%s.%N`.
pub fn parse_guest_clock(out: &str) -> Result<DateTime<Utc>> {
    let trimmed = out.trim();
    let (secs, nanos) = trimmed
        .split_once('.')
        .ok_or_else(|| anyhow!("guest clock {trimmed:?} has no fractional part"))?;
    let secs: i64 = secs.trim().parse().with_context(|| format!("atoi {secs:?}"))?;
    let nanos: u32 = nanos.trim().parse().with_context(|| format!("atoi {nanos:?}"))?;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| anyhow!("guest clock {trimmed:?} is out of range"))
}

/// Guest time minus `local`.
pub async fn guest_clock_delta(runner: &dyn CommandRunner, local: DateTime<Utc>) -> Result<TimeDelta> {
    let out = runner.run(GUEST_CLOCK_CMD).await.context("get clock")?;
    info!(guest_clock = %out.trim(), "read guest clock");

    let remote = parse_guest_clock(&out)?;
    let delta = remote.signed_duration_since(local);
    info!(guest = %remote, local = %local, delta = ?delta, "guest clock delta");
    Ok(delta)
}

/// Set the guest clock to `t`, truncated to the second.
pub async fn adjust_guest_clock(runner: &dyn CommandRunner, t: DateTime<Utc>) -> Result<()> {
    let out = runner.run(&format!("sudo date -s @{}", t.timestamp())).await;
    info!(result = ?out, "clock set");
    out.map(|_| ())
}

/// Bring the guest clock within tolerance of `clock`.
///
/// Failing to measure is only logged. Failing to correct is returned.
pub async fn ensure_synced_guest_clock(runner: &dyn CommandRunner, clock: &dyn Clock) -> Result<()> {
    let delta = match guest_clock_delta(runner, clock.now()).await {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "unable to measure system clock delta");
            return Ok(());
        }
    };

    if within_tolerance(delta) {
        info!(delta = ?delta, "guest clock delta is within tolerance");
        return Ok(());
    }

    adjust_guest_clock(runner, clock.now())
        .await
        .context("adjusting system clock")
}

fn within_tolerance(delta: TimeDelta) -> bool {
    let secs = delta.num_seconds() as f64 + f64::from(delta.subsec_nanos()) / 1e9;
    secs.abs() < MAX_CLOCK_DESYNC_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Fixed(DateTime<Utc>);

    impl Clock for Fixed {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Answers the clock query with a fixed string and records everything.
    struct Guest {
        clock_out: Result<String, String>,
        set_fails: bool,
        commands: Mutex<Vec<String>>,
    }

    impl Guest {
        fn new(clock_out: &str) -> Self {
            Self { clock_out: Ok(clock_out.to_string()), set_fails: false, commands: Mutex::new(vec![]) }
        }

        fn sets(&self) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with("sudo date -s"))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for Guest {
        async fn run(&self, cmd: &str) -> Result<String> {
            self.commands.lock().unwrap().push(cmd.to_string());
            if cmd == GUEST_CLOCK_CMD {
                return self.clock_out.clone().map_err(|e| anyhow!(e));
            }
            if self.set_fails {
                return Err(anyhow!("sudo: permission denied"));
            }
            Ok(String::new())
        }
    }

    fn local() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap()
    }

    #[test]
    fn parse_reads_seconds_and_nanoseconds() {
        let t = parse_guest_clock("1700000000.123456789\n").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn parse_rejects_malformed_output() {
        assert!(parse_guest_clock("1700000000").is_err());
        assert!(parse_guest_clock("1700000000.N").is_err());
        assert!(parse_guest_clock("abc.123").is_err());
        assert!(parse_guest_clock("").is_err());
    }

    #[tokio::test]
    async fn delta_just_inside_tolerance_is_left_alone() {
        // local - 2.09s
        let guest = Guest::new("1699999998.410000000");
        ensure_synced_guest_clock(&guest, &Fixed(local())).await.unwrap();
        assert!(guest.sets().is_empty());
    }

    #[tokio::test]
    async fn delta_outside_tolerance_sets_local_epoch_second() {
        // local - 2.2s
        let guest = Guest::new("1699999998.300000000");
        ensure_synced_guest_clock(&guest, &Fixed(local())).await.unwrap();
        assert_eq!(guest.sets(), vec!["sudo date -s @1700000000".to_string()]);
    }

    #[tokio::test]
    async fn guest_ahead_is_corrected_too() {
        let guest = Guest::new("1700000003.000000000");
        ensure_synced_guest_clock(&guest, &Fixed(local())).await.unwrap();
        assert_eq!(guest.sets().len(), 1);
    }

    #[tokio::test]
    async fn measurement_failure_is_advisory() {
        let guest = Guest {
            clock_out: Err("ssh: connection refused".to_string()),
            set_fails: true,
            commands: Mutex::new(vec![]),
        };
        ensure_synced_guest_clock(&guest, &Fixed(local())).await.unwrap();
        assert!(guest.sets().is_empty());

        let busybox = Guest::new("1700000000.N");
        ensure_synced_guest_clock(&busybox, &Fixed(local())).await.unwrap();
        assert!(busybox.sets().is_empty());
    }

    #[tokio::test]
    async fn correction_failure_is_returned() {
        let guest = Guest {
            clock_out: Ok("1600000000.000000000".to_string()),
            set_fails: true,
            commands: Mutex::new(vec![]),
        };
        let err = ensure_synced_guest_clock(&guest, &Fixed(local())).await.unwrap_err();
        assert!(format!("{err:#}").contains("adjusting system clock"));
    }

    #[tokio::test]
    async fn delta_is_guest_minus_local() {
        let guest = Guest::new("1700000001.500000000");
        let d = guest_clock_delta(&guest, local()).await.unwrap();
        assert_eq!(d, TimeDelta::seconds(1));
    }
}
