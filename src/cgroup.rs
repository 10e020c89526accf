//! CPU detection for sizing the query pool inside containers.

use std::fs;
use std::sync::OnceLock;

/// Environment variable that pins the detected CPU count.
pub const CPU_OVERRIDE_ENV: &str = "SINKBUF_MAX_CPUS";

const CGROUP_V2_CPU_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";
const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// CPUs this process may use: the override variable if set, else the
/// cgroup quota (rounded up) when it is below the logical CPU count.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(|| {
        if let Some(n) = cpu_override(CPU_OVERRIDE_ENV) {
            return n;
        }
        let logical = num_cpus::get();
        match cpu_quota() {
            Some(quota) if quota > 0.0 && (quota.ceil() as usize) < logical => quota.ceil() as usize,
            _ => logical,
        }
    })
}

/// Default size of the query worker pool.
pub fn default_query_threads() -> usize {
    available_cpus().max(1)
}

fn cpu_override(var_name: &str) -> Option<usize> {
    std::env::var(var_name)
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
}

fn cpu_quota() -> Option<f64> {
    if let Ok(cpu_max) = fs::read_to_string(CGROUP_V2_CPU_MAX) {
        return parse_cpu_max(&cpu_max);
    }

    let quota = fs::read_to_string(CGROUP_V1_QUOTA).ok()?;
    let period = fs::read_to_string(CGROUP_V1_PERIOD).unwrap_or_default();
    parse_cfs_quota(&quota, &period).or_else(|| {
        let online = fs::read_to_string(ONLINE_CPUS).ok()?;
        Some(count_cpu_ranges(&online) as f64).filter(|n| *n > 0.0)
    })
}

/// Parses cgroup v2 `cpu.max` (`"<quota> <period>"` or `"max <period>"`).
fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut fields = content.split_whitespace();
    let quota = fields.next()?.parse::<f64>().ok()?;
    let period = fields.next()?.parse::<f64>().ok()?;
    (period > 0.0).then(|| quota / period)
}

/// Parses the cgroup v1 quota and period files; a quota of -1 means unlimited.
fn parse_cfs_quota(quota: &str, period: &str) -> Option<f64> {
    let quota = quota.trim().parse::<i64>().ok().filter(|q| *q > 0)?;
    let period = period.trim().parse::<i64>().ok().filter(|p| *p > 0)?;
    Some(quota as f64 / period as f64)
}

/// Counts CPUs in a list such as `0-3,5,7-9`.
fn count_cpu_ranges(list: &str) -> usize {
    list.trim()
        .split(',')
        .map(|part| match part.split_once('-') {
            Some((start, end)) => match (start.parse::<usize>(), end.parse::<usize>()) {
                (Ok(start), Ok(end)) if end >= start => end - start + 1,
                _ => 0,
            },
            None => usize::from(part.parse::<usize>().is_ok()),
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_cpu_ranges() {
        assert_eq!(count_cpu_ranges("0-3"), 4);
        assert_eq!(count_cpu_ranges("0-3,5,7-9\n"), 8);
        assert_eq!(count_cpu_ranges("0"), 1);
        assert_eq!(count_cpu_ranges(""), 0);
        assert_eq!(count_cpu_ranges("3-1"), 0);
    }

    #[test]
    fn test_parse_cpu_max() {
        assert_eq!(parse_cpu_max("200000 100000\n"), Some(2.0));
        assert_eq!(parse_cpu_max("50000 100000"), Some(0.5));
        assert_eq!(parse_cpu_max("max 100000"), None);
        assert_eq!(parse_cpu_max("100 0"), None);
    }

    #[test]
    fn test_parse_cfs_quota() {
        assert_eq!(parse_cfs_quota("300000\n", "100000\n"), Some(3.0));
        assert_eq!(parse_cfs_quota("-1", "100000"), None);
        assert_eq!(parse_cfs_quota("100000", ""), None);
    }

    #[test]
    fn test_available_cpus() {
        let cpus = available_cpus();
        assert!(cpus > 0);
        assert!(default_query_threads() >= 1);
    }

    #[test]
    fn test_override_rejects_zero_and_garbage() {
        // SAFETY: the variables are unique to this test.
        unsafe {
            std::env::set_var("SINKBUF_TEST_CPUS_ZERO", "0");
            std::env::set_var("SINKBUF_TEST_CPUS_BAD", "many");
            std::env::set_var("SINKBUF_TEST_CPUS_OK", "3");
        }
        assert_eq!(cpu_override("SINKBUF_TEST_CPUS_ZERO"), None);
        assert_eq!(cpu_override("SINKBUF_TEST_CPUS_BAD"), None);
        assert_eq!(cpu_override("SINKBUF_TEST_CPUS_OK"), Some(3));
        assert_eq!(cpu_override("SINKBUF_TEST_CPUS_UNSET"), None);
    }
}
