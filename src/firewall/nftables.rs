// SPDX-License-Identifier: MIT

//! An nftables firewall backend driven through the nft CLI.
//!
//! The ruleset lives in its own `inet sesame` table so it can be created and
//! torn down without disturbing other rules on the host:
//!
//! ```text
//! table inet sesame {
//!     set allowed_clients {
//!         type ipv4_addr . inet_service
//!         flags interval,timeout
//!     }
//!
//!     set allowed_clients6 {
//!         type ipv6_addr . inet_service
//!         flags interval,timeout
//!     }
//!
//!     chain input {
//!         type filter hook input priority filter; policy drop;
//!         ct state established,related accept
//!         ip saddr . tcp dport @allowed_clients accept
//!         ip6 saddr . tcp dport @allowed_clients6 accept
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Firewall, IpRange};

const TABLE: &str = "sesame";
const SET_ALLOWED4: &str = "allowed_clients";
const SET_ALLOWED6: &str = "allowed_clients6";

#[derive(Debug, Default)]
pub struct NfTables {}

impl NfTables {
    pub fn new() -> Self {
        Self {}
    }

    fn set_name(range: &IpRange) -> &'static str {
        if range.is_ipv4() {
            SET_ALLOWED4
        } else {
            SET_ALLOWED6
        }
    }

    fn element(range: &IpRange, port: u16, timeout: Option<Duration>) -> String {
        let timeout = timeout
            .map(|t| format!(" timeout {}s", t.as_secs().max(1)))
            .unwrap_or_default();
        if range.start == range.end {
            format!("{{ {} . {port}{timeout} }}", range.start)
        } else {
            format!("{{ {}-{} . {port}{timeout} }}", range.start, range.end)
        }
    }
}

async fn run_nft(args: &[&str], stdin: Option<&str>) -> anyhow::Result<()> {
    use std::process::Stdio;

    use tokio::io::AsyncWriteExt;

    let mut command = Command::new("nft");
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|error| {
        anyhow::anyhow!("failed spawning nft (is nftables installed?): {error}")
    })?;

    if let Some(input) = stdin {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("nft command is missing stdin"))?;
        handle.write_all(input.as_bytes()).await?;
        drop(handle);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!(
            "nft exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        ));
    }

    Ok(())
}

#[async_trait]
impl Firewall for NfTables {
    async fn init(&self) -> anyhow::Result<()> {
        // `add` is idempotent for tables, sets, chains, and rules expressed
        // through a full ruleset file, so a restart doesn't disturb entries
        // that are already in place.
        let ruleset = format!(
            "add table inet {TABLE}\n\
            add set inet {TABLE} {SET_ALLOWED4} {{ type ipv4_addr . inet_service ; flags interval,timeout ; }}\n\
            add set inet {TABLE} {SET_ALLOWED6} {{ type ipv6_addr . inet_service ; flags interval,timeout ; }}\n\
            add chain inet {TABLE} input {{ type filter hook input priority filter ; policy drop ; }}\n\
            flush chain inet {TABLE} input\n\
            add rule inet {TABLE} input ct state established,related accept\n\
            add rule inet {TABLE} input ip saddr . tcp dport @{SET_ALLOWED4} accept\n\
            add rule inet {TABLE} input ip6 saddr . tcp dport @{SET_ALLOWED6} accept\n"
        );
        run_nft(&["-f", "-"], Some(&ruleset)).await?;
        tracing::info!("firewall initialized");
        Ok(())
    }

    async fn allow(&self, range: IpRange, port: u16, timeout: Duration) -> anyhow::Result<()> {
        let set = Self::set_name(&range);
        let element = Self::element(&range, port, Some(timeout));

        // nftables refuses to add an element that already exists, so refresh
        // the timeout by removing the old entry first.
        let stale = Self::element(&range, port, None);
        _ = run_nft(
            &["delete", "element", "inet", TABLE, set, &stale],
            None,
        )
        .await;

        run_nft(&["add", "element", "inet", TABLE, set, &element], None).await
    }

    async fn deny(&self, range: IpRange, port: u16) -> anyhow::Result<()> {
        let set = Self::set_name(&range);
        let element = Self::element(&range, port, None);
        // Removing an entry that isn't present is fine.
        _ = run_nft(
            &["delete", "element", "inet", TABLE, set, &element],
            None,
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_syntax() {
        let single = IpRange::parse("10.0.0.1").unwrap();
        assert_eq!(
            "{ 10.0.0.1 . 8080 timeout 300s }",
            NfTables::element(&single, 8080, Some(Duration::from_secs(300)))
        );

        let range = IpRange::parse("10.0.0.0/30").unwrap();
        assert_eq!(
            "{ 10.0.0.0-10.0.0.3 . 22 }",
            NfTables::element(&range, 22, None)
        );
    }

    #[test]
    fn sub_second_timeouts_round_up() {
        let single = IpRange::parse("10.0.0.1").unwrap();
        assert_eq!(
            "{ 10.0.0.1 . 80 timeout 1s }",
            NfTables::element(&single, 80, Some(Duration::from_millis(10)))
        );
    }

    #[test]
    fn set_selection_by_family() {
        assert_eq!(
            SET_ALLOWED4,
            NfTables::set_name(&IpRange::parse("192.0.2.1").unwrap())
        );
        assert_eq!(
            SET_ALLOWED6,
            NfTables::set_name(&IpRange::parse("2001:db8::/64").unwrap())
        );
    }
}
