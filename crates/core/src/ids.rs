//! Identifier formats
//!
//! Session ids embed their owner (`sess_{username}_{8 lower-hex}`) so that
//! routers and load balancers can derive the owner without a lookup. The
//! retrieval collection name is a pure function of `(owner, persona_id)`.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Printable, no whitespace, and crucially no `_` so the session-id and
/// collection-name encodings stay unambiguous.
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]{0,63}$").expect("static regex"));

static SESSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{8}$").expect("static regex"));

/// Lowercase slug charset; also the charset mention parsing recognizes
/// after an `@`.
static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]{0,31}$").expect("static regex"));

/// Validate a persona mention handle.
pub fn validate_handle(handle: &str) -> Result<(), Error> {
    if HANDLE_RE.is_match(handle) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid handle: {:?}", handle)))
    }
}

/// Validate a tenant username.
pub fn validate_username(username: &str) -> Result<(), Error> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid username: {:?}",
            username
        )))
    }
}

/// A session identifier of the form `sess_{username}_{8 lower-hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh id for `owner` with a random 8-hex-char suffix.
    pub fn generate(owner: &str) -> Result<Self, Error> {
        validate_username(owner)?;
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
                .collect()
        };
        Ok(Self(format!("sess_{}_{}", owner, suffix)))
    }

    /// Parse and validate an externally supplied id.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let rest = raw
            .strip_prefix("sess_")
            .ok_or_else(|| Error::Validation(format!("bad session id: {:?}", raw)))?;
        let (owner, suffix) = rest
            .rsplit_once('_')
            .ok_or_else(|| Error::Validation(format!("bad session id: {:?}", raw)))?;
        if validate_username(owner).is_err() || !SESSION_SUFFIX_RE.is_match(suffix) {
            return Err(Error::Validation(format!("bad session id: {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    /// The owner token embedded in the id.
    pub fn owner(&self) -> &str {
        // Shape was validated at construction.
        self.0
            .strip_prefix("sess_")
            .and_then(|rest| rest.rsplit_once('_'))
            .map(|(owner, _)| owner)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retrieval collection name for a persona's private knowledge.
pub fn collection_name(owner: &str, persona_id: &str) -> String {
    format!("{}_persona_{}_rag", owner, persona_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_round_trips() {
        let id = SessionId::generate("alice").unwrap();
        let parsed = SessionId::parse(id.as_str()).unwrap();
        assert_eq!(parsed.owner(), "alice");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(SessionId::parse("sess_alice").is_err());
        assert!(SessionId::parse("sess_alice_XYZ12345").is_err());
        assert!(SessionId::parse("sess_alice_12345").is_err());
        assert!(SessionId::parse("session_alice_deadbeef").is_err());
        assert!(SessionId::parse("sess__deadbeef").is_err());
    }

    #[test]
    fn test_owner_extraction() {
        let id = SessionId::parse("sess_bob-1_0123abcd").unwrap();
        assert_eq!(id.owner(), "bob-1");
    }

    #[test]
    fn test_username_rejects_delimiter() {
        assert!(validate_username("team_lead").is_err());
        assert!(validate_username("").is_err());
        assert!(validate_username("a b").is_err());
        assert!(validate_username("carol.m").is_ok());
    }

    #[test]
    fn test_handle_validation() {
        assert!(validate_handle("alice").is_ok());
        assert!(validate_handle("bob-2").is_ok());
        assert!(validate_handle("Bob").is_err());
        assert!(validate_handle("a b").is_err());
        assert!(validate_handle("").is_err());
    }

    #[test]
    fn test_collection_name_is_deterministic() {
        let a = collection_name("alice", "p1");
        let b = collection_name("alice", "p1");
        assert_eq!(a, b);
        assert_eq!(a, "alice_persona_p1_rag");
        assert!(a.is_ascii());
    }
}
