/// Container-aware sizing for the tokio worker pool.
///
/// Order: `VESTIBULE_CPU_LIMIT` env override, cgroup v2 quota, host CPU
/// count. Without this, tokio sizes its pool from the host, which
/// over-provisions threads when a container is limited to a few cores on a
/// large machine.
pub fn worker_thread_count() -> usize {
    if let Ok(v) = std::env::var("VESTIBULE_CPU_LIMIT") {
        if let Ok(n) = v.trim().parse::<usize>() {
            return n.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&max) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Parse cgroup v2 `cpu.max` — "quota period" or "max period".
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None; // unlimited
    }
    let quota: i64 = quota.parse().ok()?;
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
    fn test_parse_cgroup_cpu_max() {
        assert_eq!(parse_cgroup_cpu_max("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_cpu_max("200000 100000"), Some(2));
        assert_eq!(parse_cgroup_cpu_max("max 100000"), None);
        assert_eq!(parse_cgroup_cpu_max(""), None);
        assert_eq!(parse_cgroup_cpu_max("-1 100000"), None);
    }
}
