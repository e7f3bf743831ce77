// src/profiler.rs
//! Host Profiler (C3, spec §4.3).
//!
//! Runs a small fixed battery of read-only probes over a connected
//! [`CommandRunner`] and synthesizes a [`HostProfile`]. Every probe is
//! best-effort: a failed or timed-out probe degrades to a safe default
//! rather than failing the whole profile, generalizing the teacher's
//! "try live data, fall back to a safe default" pattern from
//! `env_manager.rs`'s libvirt connection handling into a battery of
//! independent per-probe fallbacks instead of one all-or-nothing connect.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ssh::CommandRunner;

const PROBE_DEADLINE: Duration = Duration::from_secs(5);

const TOOL_INVENTORY: &[&str] = &[
    "apt", "apt-get", "dnf", "yum", "pacman", "apk", "zypper", "systemctl", "service", "ufw",
    "iptables", "nftables", "docker", "podman", "nginx", "curl", "wget", "jq", "git", "python3",
    "node", "make", "gcc", "tar", "gzip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OsFamily {
    Debian,
    Rhel,
    Arch,
    Alpine,
    Suse,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceManager {
    Systemd,
    Sysvinit,
    Openrc,
    Upstart,
    #[default]
    None,
}

/// An immutable snapshot of a target host. Re-profiling always produces a
/// new value; nothing here is ever mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub os_family: OsFamily,
    pub distribution: String,
    pub version: String,
    pub kernel: String,
    pub arch: String,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub disk_free_bytes: u64,
    pub tools: BTreeSet<String>,
    pub service_manager: ServiceManager,
    pub listening_ports: Vec<(u16, String)>,
    pub captured_at: SystemTime,
}

/// Runs the full probe battery against a live, connected transport.
pub async fn profile(transport: &dyn CommandRunner) -> HostProfile {
    let (os_family, distribution, version, kernel, arch) = probe_identity(transport).await;
    let (memory_total_bytes, memory_available_bytes) = probe_memory(transport).await;
    let disk_free_bytes = probe_disk(transport).await;
    let tools = probe_tools(transport).await;
    let service_manager = detect_service_manager(&tools, transport).await;
    let listening_ports = probe_listening_ports(transport).await;

    HostProfile {
        os_family,
        distribution,
        version,
        kernel,
        arch,
        memory_total_bytes,
        memory_available_bytes,
        disk_free_bytes,
        tools,
        service_manager,
        listening_ports,
        captured_at: SystemTime::now(),
    }
}

async fn run_probe(transport: &dyn CommandRunner, command: &str) -> Option<String> {
    match transport.run(command, PROBE_DEADLINE).await {
        Ok(result) if result.exit_code == 0 => Some(String::from_utf8_lossy(&result.stdout).to_string()),
        Ok(result) => {
            debug!(command, exit_code = result.exit_code, "profiling probe exited non-zero");
            None
        }
        Err(e) => {
            warn!(command, "profiling probe failed: {e}");
            None
        }
    }
}

async fn probe_identity(transport: &dyn CommandRunner) -> (OsFamily, String, String, String, String) {
    let mut os_family = OsFamily::Unknown;
    let mut distribution = "unknown".to_string();
    let mut version = "unknown".to_string();

    if let Some(os_release) = run_probe(transport, "cat /etc/os-release").await {
        for line in os_release.lines() {
            if let Some(value) = line.strip_prefix("ID=") {
                let id = value.trim_matches('"');
                distribution = id.to_string();
                os_family = match id {
                    "ubuntu" | "debian" => OsFamily::Debian,
                    "rhel" | "centos" | "fedora" | "rocky" | "almalinux" => OsFamily::Rhel,
                    "arch" => OsFamily::Arch,
                    "alpine" => OsFamily::Alpine,
                    "opensuse" | "opensuse-leap" | "sles" => OsFamily::Suse,
                    _ => OsFamily::Unknown,
                };
            }
            if let Some(value) = line.strip_prefix("VERSION_ID=") {
                version = value.trim_matches('"').to_string();
            }
        }
    } else {
        warn!("could not read /etc/os-release; os_family will remain unknown");
    }

    let (kernel, arch) = match run_probe(transport, "uname -srm").await {
        Some(out) => {
            let mut parts = out.trim().splitn(3, ' ');
            let kernel = parts.next().unwrap_or("unknown").to_string();
            let release = parts.next().unwrap_or("");
            let arch = parts.next().unwrap_or("unknown").to_string();
            (format!("{kernel} {release}").trim().to_string(), arch)
        }
        None => ("unknown".to_string(), "unknown".to_string()),
    };

    (os_family, distribution, version, kernel, arch)
}

async fn probe_memory(transport: &dyn CommandRunner) -> (u64, u64) {
    match run_probe(transport, "cat /proc/meminfo").await {
        Some(out) => {
            let mut total_kb = 0u64;
            let mut available_kb = 0u64;
            for line in out.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    total_kb = parse_kib(rest);
                } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    available_kb = parse_kib(rest);
                }
            }
            (total_kb * 1024, available_kb * 1024)
        }
        None => (0, 0),
    }
}

fn parse_kib(field: &str) -> u64 {
    field
        .trim()
        .trim_end_matches(" kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

async fn probe_disk(transport: &dyn CommandRunner) -> u64 {
    match run_probe(transport, "df -kP /").await {
        Some(out) => out
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(3))
            .and_then(|avail_kb| avail_kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0),
        None => 0,
    }
}

async fn probe_tools(transport: &dyn CommandRunner) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for tool in TOOL_INVENTORY {
        let command = format!("command -v {tool} >/dev/null 2>&1");
        if let Ok(result) = transport.run(&command, PROBE_DEADLINE).await {
            if result.exit_code == 0 {
                found.insert((*tool).to_string());
            }
        }
    }
    found
}

async fn detect_service_manager(tools: &BTreeSet<String>, transport: &dyn CommandRunner) -> ServiceManager {
    if tools.contains("systemctl") {
        return ServiceManager::Systemd;
    }
    if run_probe(transport, "command -v service >/dev/null 2>&1 && echo yes")
        .await
        .is_some()
    {
        return ServiceManager::Sysvinit;
    }
    if run_probe(transport, "command -v rc-service >/dev/null 2>&1 && echo yes")
        .await
        .is_some()
    {
        return ServiceManager::Openrc;
    }
    ServiceManager::None
}

async fn probe_listening_ports(transport: &dyn CommandRunner) -> Vec<(u16, String)> {
    let output = match run_probe(transport, "ss -tulnH 2>/dev/null || netstat -tuln 2>/dev/null").await {
        Some(out) => out,
        None => return Vec::new(),
    };

    let mut ports = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let protocol = match fields.next() {
            Some(p) if p.starts_with("tcp") => "tcp",
            Some(p) if p.starts_with("udp") => "udp",
            _ => continue,
        };
        let local_address = match fields.nth(3) {
            Some(addr) => addr,
            None => continue,
        };
        if let Some(port_str) = local_address.rsplit(':').next() {
            if let Ok(port) = port_str.parse::<u16>() {
                ports.push((port, protocol.to_string()));
            }
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kib_handles_typical_meminfo_line() {
        assert_eq!(parse_kib(" 16374840 kB"), 16374840);
    }

    #[test]
    fn parse_kib_defaults_to_zero_on_garbage() {
        assert_eq!(parse_kib(" not-a-number"), 0);
    }
}
