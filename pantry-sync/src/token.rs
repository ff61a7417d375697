//! Shareable connect tokens.
//!
//! A token names a site on the signaling layer: `pantry:<site id as 32 hex>`.
//! Users exchange tokens out of band (QR code, copy/paste).

use pantry_core::SiteId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

const PREFIX: &str = "pantry:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectToken(SiteId);

impl ConnectToken {
    pub fn for_site(site_id: SiteId) -> Self {
        Self(site_id)
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        let hex = s
            .trim()
            .strip_prefix(PREFIX)
            .ok_or_else(|| SyncError::InvalidToken(format!("missing '{PREFIX}' prefix: {s}")))?;
        SiteId::parse(hex)
            .map(Self)
            .ok_or_else(|| SyncError::InvalidToken(format!("bad site id: {hex}")))
    }

    pub fn site_id(&self) -> SiteId {
        self.0
    }
}

impl fmt::Display for ConnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl FromStr for ConnectToken {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let token = ConnectToken::for_site(SiteId::new());
        let text = token.to_string();
        assert!(text.starts_with("pantry:"));
        assert_eq!(text.len(), "pantry:".len() + 32);
        assert_eq!(ConnectToken::parse(&text).unwrap(), token);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let token = ConnectToken::for_site(SiteId::new());
        let parsed: ConnectToken = format!("  {token}\n").parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let site = SiteId::new();
        assert!(matches!(
            ConnectToken::parse(&site.to_string()),
            Err(SyncError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(ConnectToken::parse("pantry:not-a-site").is_err());
    }
}
