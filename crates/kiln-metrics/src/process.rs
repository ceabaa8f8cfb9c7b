//! Sidecar process collector.
//!
//! Tracks resident memory of named supervisor processes (by default the
//! container daemons) by scanning `/proc`. Only works on Linux; on other
//! platforms the collector finds no pids and renders nothing, which is
//! fine.

use std::fs;
use std::path::Path;

/// Default commands to track when the operator does not configure any.
pub const DEFAULT_TRACKED: &[&str] = &["dockerd", "docker-containerd"];

/// Parse a `process-collector-list` value.
///
/// `None` (unset) yields the defaults; an empty string disables tracking.
pub fn tracked_from_config(value: Option<&str>) -> Vec<String> {
    match value {
        None => DEFAULT_TRACKED.iter().map(|s| s.to_string()).collect(),
        Some(v) => v.split_whitespace().map(|s| s.to_string()).collect(),
    }
}

/// Render resident-memory gauges for each tracked command that has a
/// running process. Commands without a match are skipped silently;
/// permission errors are treated the same way.
pub fn render(tracked: &[String]) -> String {
    let mut out = String::new();
    if tracked.is_empty() {
        return out;
    }
    out.push_str(
        "# HELP kiln_process_resident_memory_bytes Resident memory of tracked sidecar processes.\n\
         # TYPE kiln_process_resident_memory_bytes gauge\n",
    );
    for cmd in tracked {
        if let Some(pid) = find_pid(cmd) {
            if let Some(rss) = read_rss_bytes(pid) {
                out.push_str(&format!(
                    "kiln_process_resident_memory_bytes{{process=\"{}\"}} {}\n",
                    sanitize(cmd),
                    rss
                ));
            }
        }
    }
    out
}

/// Find the first pid whose argv[0] basename matches `cmd`.
fn find_pid(cmd: &str) -> Option<u32> {
    let dir = fs::read_dir("/proc").ok()?;
    for entry in dir.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid_matches_cmd(pid, cmd) {
            return Some(pid);
        }
    }
    None
}

fn pid_matches_cmd(pid: u32, cmd: &str) -> bool {
    let Ok(cmdline) = fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
    let argv0 = String::from_utf8_lossy(argv0);
    Path::new(argv0.as_ref())
        .file_name()
        .map(|f| f.to_string_lossy() == cmd)
        .unwrap_or(false)
}

/// VmRSS from `/proc/<pid>/status`, in bytes.
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Prometheus only allows [a-zA-Z0-9:_] in names; label values are freer
/// but we keep command names plain.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ':' { c } else { '_' })
        .collect()
}
