//! Per-site version cursor.
//!
//! Maps every site ever observed to the highest version durably applied
//! locally. The local site's entry is the local write version. Entries only
//! move forward.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::site::SiteId;

/// A cursor would have moved backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegressionError {
    pub site_id: SiteId,
    pub current: u64,
    pub attempted: u64,
}

impl std::fmt::Display for RegressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Version regression for site {}: cursor at {}, attempted {}",
            self.site_id, self.current, self.attempted
        )
    }
}

impl std::error::Error for RegressionError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionClock {
    local_site: SiteId,
    sites: BTreeMap<SiteId, u64>,
}

impl VersionClock {
    pub fn new(local_site: SiteId) -> Self {
        Self {
            local_site,
            sites: BTreeMap::new(),
        }
    }

    pub fn local_site(&self) -> SiteId {
        self.local_site
    }

    /// Highest version applied for `site`, 0 if never seen.
    pub fn get(&self, site: &SiteId) -> u64 {
        self.sites.get(site).copied().unwrap_or(0)
    }

    /// Move the cursor for `site` forward to `version`.
    ///
    /// Equal versions are accepted. Lower versions fail and leave the cursor
    /// untouched.
    pub fn advance(&mut self, site: SiteId, version: u64) -> Result<(), RegressionError> {
        let current = self.get(&site);
        if version < current {
            return Err(RegressionError {
                site_id: site,
                current,
                attempted: version,
            });
        }
        if version > current {
            self.sites.insert(site, version);
        }
        Ok(())
    }

    /// Current local write version.
    pub fn local_version(&self) -> u64 {
        self.get(&self.local_site)
    }

    /// Reserve the next local version. Only stores call this, inside their
    /// commit critical section.
    pub(crate) fn next_local_version(&self) -> u64 {
        self.local_version() + 1
    }

    /// All known sites in site order.
    pub fn sites(&self) -> impl Iterator<Item = (SiteId, u64)> + '_ {
        self.sites.iter().map(|(s, v)| (*s, *v))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (clock, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_site_is_zero() {
        let clock = VersionClock::new(SiteId::new());
        assert_eq!(clock.get(&SiteId::new()), 0);
        assert_eq!(clock.local_version(), 0);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_advance_forward() {
        let mut clock = VersionClock::new(SiteId::new());
        let remote = SiteId::new();
        clock.advance(remote, 3).unwrap();
        clock.advance(remote, 7).unwrap();
        assert_eq!(clock.get(&remote), 7);
    }

    #[test]
    fn test_advance_equal_is_idempotent() {
        let mut clock = VersionClock::new(SiteId::new());
        let remote = SiteId::new();
        clock.advance(remote, 4).unwrap();
        clock.advance(remote, 4).unwrap();
        assert_eq!(clock.get(&remote), 4);
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn test_regression_leaves_cursor_unchanged() {
        let mut clock = VersionClock::new(SiteId::new());
        let remote = SiteId::new();
        clock.advance(remote, 9).unwrap();

        let err = clock.advance(remote, 2).unwrap_err();
        assert_eq!(err.current, 9);
        assert_eq!(err.attempted, 2);
        assert_eq!(clock.get(&remote), 9);
    }

    #[test]
    fn test_monotonic_over_sequence() {
        let mut clock = VersionClock::new(SiteId::new());
        let remote = SiteId::new();
        let mut last = 0;
        for v in [1, 5, 3, 5, 8, 2, 13] {
            let _ = clock.advance(remote, v);
            assert!(clock.get(&remote) >= last);
            last = clock.get(&remote);
        }
        assert_eq!(last, 13);
    }

    #[test]
    fn test_local_version_tracks_local_entry() {
        let local = SiteId::new();
        let mut clock = VersionClock::new(local);
        assert_eq!(clock.next_local_version(), 1);
        clock.advance(local, 1).unwrap();
        assert_eq!(clock.local_version(), 1);
        assert_eq!(clock.next_local_version(), 2);
    }

    #[test]
    fn test_encode_decode() {
        let mut clock = VersionClock::new(SiteId::new());
        clock.advance(SiteId::new(), 11).unwrap();
        let bytes = clock.encode().unwrap();
        assert_eq!(VersionClock::decode(&bytes).unwrap(), clock);
    }
}
