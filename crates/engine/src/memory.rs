//! Process memory probe used for job-complete snapshots.

use serde::{Deserialize, Serialize};

/// Memory in use when a job finished, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Heap and data segment of the process.
    pub job: u64,
    /// Resident set size of the process.
    pub system: u64,
}

impl MemorySnapshot {
    pub fn job_mb(&self) -> u64 {
        self.job / 1024 / 1024
    }

    pub fn system_mb(&self) -> u64 {
        self.system / 1024 / 1024
    }
}

/// Read the current process's memory usage.
///
/// Returns zeros where `/proc/self/statm` is unavailable.
pub fn snapshot() -> MemorySnapshot {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| parse_statm(&statm, page_size()))
        .unwrap_or_default()
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions and only reads static configuration.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// statm: size resident shared text lib data dt, all in pages.
fn parse_statm(statm: &str, page: u64) -> Option<MemorySnapshot> {
    let fields: Vec<u64> = statm
        .split_whitespace()
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    Some(MemorySnapshot {
        job: fields.get(5)? * page,
        system: fields.get(1)? * page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statm_fields_are_scaled_by_page_size() {
        let snap = parse_statm("1000 200 50 10 0 300 0\n", 4096).unwrap();
        assert_eq!(snap.system, 200 * 4096);
        assert_eq!(snap.job, 300 * 4096);
    }

    #[test]
    fn malformed_statm_is_ignored() {
        assert!(parse_statm("garbage", 4096).is_none());
        assert!(parse_statm("1 2", 4096).is_none());
    }
}
