//! Guest network identity: MAC normalization, vmnet lease lookup, and the
//! bounded polling loop that turns a MAC into an IP address.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use pkg_constants::paths::VMNET_PREFERENCES;

use crate::error::MachineError;
use crate::supervisor::MachineState;

/// Strip leading zeros from every byte group (`0a:00:...` becomes `a:0:...`),
/// which is how the vmnet lease table renders addresses.
pub fn trim_mac(mac: &str) -> String {
    mac.trim()
        .split(':')
        .map(|group| {
            let trimmed = group.trim_start_matches('0');
            if trimmed.is_empty() { "0" } else { trimmed }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// One `{ ... }` block of the DHCP lease table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub ip_address: String,
    pub hw_address: String,
    /// Expiry, as the hex timestamp vmnet writes.
    pub lease: u64,
}

/// Parse the vmnet lease table.
pub fn parse_leases(content: &str) -> Vec<Lease> {
    let mut leases = Vec::new();
    let mut current: Option<Lease> = None;

    for line in content.lines().map(str::trim) {
        if line == "{" {
            current = Some(Lease::default());
            continue;
        }
        if line == "}" {
            if let Some(lease) = current.take() {
                leases.push(lease);
            }
            continue;
        }
        let (Some(lease), Some((key, value))) = (current.as_mut(), line.split_once('=')) else {
            continue;
        };
        match key {
            "name" => lease.name = value.to_string(),
            "ip_address" => lease.ip_address = value.to_string(),
            // `1,` is the hardware type (ethernet).
            "hw_address" => {
                lease.hw_address = value.split_once(',').map(|(_, a)| a).unwrap_or(value).to_string()
            }
            "lease" => {
                lease.lease = u64::from_str_radix(value.trim_start_matches("0x"), 16).unwrap_or(0)
            }
            _ => {}
        }
    }
    leases
}

/// The address leased to `mac`. With several leases the newest one wins.
pub fn ip_from_leases(content: &str, mac: &str) -> Option<String> {
    parse_leases(content)
        .into_iter()
        .filter(|l| l.hw_address == mac && !l.ip_address.is_empty())
        .reduce(|best, l| if l.lease > best.lease { l } else { best })
        .map(|l| l.ip_address)
}

/// Read `leases_path` and look up `mac`.
pub fn lookup_ip(leases_path: &Path, mac: &str) -> Result<String> {
    let content = std::fs::read_to_string(leases_path)
        .with_context(|| format!("failed to read {}", leases_path.display()))?;
    ip_from_leases(&content, mac)
        .ok_or_else(|| anyhow::anyhow!("could not find an IP address for {}", mac))
}

/// Attempt budget for [`resolve_ip`].
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval: Duration,
}

/// Poll for the guest's address.
///
/// Every attempt first checks the guest is still alive: a stopped guest fails
/// at once with `HypervisorCrashed`, and a failing state query is returned
/// as is. Lookup failures are transient and retried until the budget is
/// exhausted, which yields `AddressNeverFound`.
pub async fn resolve_ip<L, S>(
    mut lookup: L,
    mut state: S,
    budget: PollBudget,
    cmdline: &str,
) -> Result<String>
where
    L: FnMut() -> Result<String>,
    S: FnMut() -> Result<MachineState>,
{
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=budget.attempts {
        debug!(attempt, "resolving guest address");

        match state().context("get state")? {
            MachineState::Running => {}
            MachineState::Stopped | MachineState::Error => {
                return Err(MachineError::HypervisorCrashed {
                    cmdline: cmdline.to_string(),
                }
                .into());
            }
        }

        match lookup() {
            Ok(ip) => {
                info!(ip = %ip, attempt, "guest address resolved");
                return Ok(ip);
            }
            Err(e) => last_error = format!("{:#}", e),
        }

        if attempt < budget.attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }
    Err(MachineError::AddressNeverFound { last_error }.into())
}

/// The host's address on the vmnet shared network, as seen by the guest.
///
/// Read from the vmnet preferences; falls back to the `.1` of the guest's /24.
pub async fn host_address(guest_ip: &str) -> Result<String> {
    let output = tokio::process::Command::new("defaults")
        .args(["read", VMNET_PREFERENCES, "Shared_Net_Address"])
        .output()
        .await;
    if let Ok(out) = output
        && out.status.success()
    {
        let addr = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if addr.parse::<Ipv4Addr>().is_ok() {
            return Ok(addr);
        }
    }
    gateway_of(guest_ip)
}

fn gateway_of(guest_ip: &str) -> Result<String> {
    let ip: Ipv4Addr = guest_ip
        .parse()
        .with_context(|| format!("invalid guest address '{}'", guest_ip))?;
    let [a, b, c, _] = ip.octets();
    Ok(Ipv4Addr::new(a, b, c, 1).to_string())
}
