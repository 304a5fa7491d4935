/// Container-aware CPU detection for sizing the tokio worker pool.
///
/// Order: `TRELLIS_CPU_LIMIT` env override, cgroup v2 `cpu.max`, cgroup
/// v1 quota/period, host CPU count. Without this, tokio spawns one
/// worker per host core even when the container is capped far below
/// that.
pub fn worker_threads() -> usize {
    if let Ok(value) = std::env::var("TRELLIS_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            return cores.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            return cores.max(1);
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_quota(&quota, &period) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        millis.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_cgroup_quota(quota, period)
}

fn parse_cgroup_quota(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_value_formats() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("  8  "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // caller clamps to 1
        assert_eq!(parse_cpu_value("x"), None);
    }

    #[test]
    fn cgroup_v2_format() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
    }

    #[test]
    fn cgroup_v1_format() {
        assert_eq!(parse_cgroup_quota("200000", "100000"), Some(2));
        assert_eq!(parse_cgroup_quota("-1", "100000"), None);
    }
}
