// SPDX-License-Identifier: MIT

//! An in-memory firewall backend.
//!
//! Records the rules it is asked to apply without touching the system, which
//! makes it useful for tests and dry runs.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;

use super::{Firewall, IpRange};

/// A recorded access entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub range: IpRange,
    pub port: u16,
}

#[derive(Debug, Default)]
pub struct Mock {
    entries: Mutex<HashMap<Entry, Duration>>,
}

impl Mock {
    /// The granted timeout for an entry, if one exists.
    pub fn allowed(&self, range: &IpRange, port: u16) -> Option<Duration> {
        self.entries
            .lock()
            .expect("mock firewall lock poisoned")
            .get(&Entry { range: *range, port })
            .copied()
    }

    /// A snapshot of all current entries.
    pub fn entries(&self) -> Vec<(Entry, Duration)> {
        self.entries
            .lock()
            .expect("mock firewall lock poisoned")
            .iter()
            .map(|(entry, timeout)| (entry.clone(), *timeout))
            .collect()
    }
}

#[async_trait]
impl Firewall for Mock {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn allow(&self, range: IpRange, port: u16, timeout: Duration) -> anyhow::Result<()> {
        // Inserting over an existing entry refreshes its timeout, matching
        // the timeout semantics of real backends.
        self.entries
            .lock()
            .expect("mock firewall lock poisoned")
            .insert(Entry { range, port }, timeout);
        Ok(())
    }

    async fn deny(&self, range: IpRange, port: u16) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("mock firewall lock poisoned")
            .remove(&Entry { range, port });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_refreshes_existing_entries() {
        let mock = Mock::default();
        let range = IpRange::parse("192.0.2.1").unwrap();

        mock.allow(range, 22, Duration::from_secs(60)).await.unwrap();
        mock.allow(range, 22, Duration::from_secs(300)).await.unwrap();

        assert_eq!(Some(Duration::from_secs(300)), mock.allowed(&range, 22));
        assert_eq!(1, mock.entries().len());
    }

    #[tokio::test]
    async fn entries_are_keyed_by_range_and_port() {
        let mock = Mock::default();
        let range = IpRange::parse("192.0.2.0/24").unwrap();

        mock.allow(range, 80, Duration::from_secs(60)).await.unwrap();
        mock.allow(range, 443, Duration::from_secs(60)).await.unwrap();
        assert_eq!(2, mock.entries().len());

        mock.deny(range, 80).await.unwrap();
        assert!(mock.allowed(&range, 80).is_none());
        assert!(mock.allowed(&range, 443).is_some());
    }
}
