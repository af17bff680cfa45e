/* morphgate/src/auth.rs

Session verification for the management API.

Credential management is owner-scoped: every request under /api/ carries an
`Authorization: Bearer <token>` header, and a `SessionVerifier` resolves the
token to the owner it acts for. Chat traffic (/v1/messages) is not verified
here.

The bundled `StaticTokenVerifier` reads a fixed token table:

- MORPHGATE_ACCESS_TOKENS = "<token>=<owner_id>,<token>=<owner_id>,..."

With no table configured every management request is refused.
*/

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::warn;

/// Identity behind a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    pub owner_id: u64,
}

#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Session>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, u64>,
}

impl StaticTokenVerifier {
    /// Parse `token=owner,token=owner`.
    pub fn parse(table: &str) -> Result<Self> {
        let mut tokens = HashMap::new();
        for part in table.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (token, owner) = part
                .rsplit_once('=')
                .ok_or_else(|| anyhow!("access token entry '{}' is missing '=owner_id'", part))?;
            let token = token.trim();
            if token.is_empty() {
                return Err(anyhow!("access token entry '{}' has an empty token", part));
            }
            let owner_id: u64 = owner
                .trim()
                .parse()
                .map_err(|_| anyhow!("access token entry '{}' has a non-numeric owner", part))?;
            tokens.insert(token.to_string(), owner_id);
        }
        Ok(Self { tokens })
    }

    /// Build from an optional table; a malformed table is logged and refuses everything.
    pub fn from_table(table: Option<&str>) -> Self {
        match table {
            Some(s) => Self::parse(s).unwrap_or_else(|e| {
                warn!("Ignoring MORPHGATE_ACCESS_TOKENS: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Session> {
        self.tokens
            .get(token)
            .map(|&owner_id| Session { owner_id })
    }
}

/// Token part of an `Authorization: Bearer <token>` header.
pub fn bearer_token(auth_header: Option<&str>) -> Option<&str> {
    let s = auth_header?.trim();
    if s.len() < 7 {
        return None;
    }
    let (scheme, rest) = s.split_at(6);
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let t = rest.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_table() {
        let v = StaticTokenVerifier::parse("alpha=1, beta=22,").unwrap();
        assert_eq!(v.tokens.get("alpha"), Some(&1));
        assert_eq!(v.tokens.get("beta"), Some(&22));
        assert!(StaticTokenVerifier::parse("alpha").is_err());
        assert!(StaticTokenVerifier::parse("alpha=x").is_err());
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("bearer   abc ")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[tokio::test]
    async fn verifies_known_tokens_only() {
        let v = StaticTokenVerifier::parse("alpha=7").unwrap();
        assert_eq!(v.verify("alpha").await, Some(Session { owner_id: 7 }));
        assert_eq!(v.verify("beta").await, None);
        assert!(StaticTokenVerifier::from_table(None).is_empty());
    }
}
