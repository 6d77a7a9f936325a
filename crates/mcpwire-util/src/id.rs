//! Session identifiers.
//!
//! Servers name sessions `ses_<ulid>` with the ULID in lowercase. The id
//! travels in the `Mcp-Session-Id` header, so it has to stay visible ASCII,
//! and ULIDs make ids minted later sort after earlier ones in logs.

use std::time::SystemTime;
use ulid::Ulid;

/// Prefix of every session id.
pub const SESSION_PREFIX: &str = "ses";

/// Mint a fresh session id.
pub fn new_session_id() -> String {
    session_id_from(Ulid::new())
}

/// The session id for a given ULID.
pub fn session_id_from(ulid: Ulid) -> String {
    let mut id = ulid.to_string();
    id.make_ascii_lowercase();
    format!("{SESSION_PREFIX}_{id}")
}

/// The ULID inside a session id, if `id` is one.
pub fn parse_session_id(id: &str) -> Option<Ulid> {
    let rest = id.strip_prefix(SESSION_PREFIX)?.strip_prefix('_')?;
    Ulid::from_string(rest).ok()
}

pub fn is_session_id(id: &str) -> bool {
    parse_session_id(id).is_some()
}

/// When the session was minted, read back from its ULID.
pub fn session_created_at(id: &str) -> Option<SystemTime> {
    parse_session_id(id).map(|ulid| ulid.datetime())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert!(id.starts_with("ses_"));
        assert_eq!(id.len(), SESSION_PREFIX.len() + 1 + 26);
        assert!(id.bytes().all(|b| (0x21..=0x7e).contains(&b)));
        assert_eq!(id, id.to_ascii_lowercase());
    }

    #[test]
    fn test_parse_recovers_ulid() {
        let ulid = Ulid::new();
        let id = session_id_from(ulid);
        assert_eq!(parse_session_id(&id), Some(ulid));
        assert!(is_session_id(&id));
    }

    #[test]
    fn test_rejects_foreign_ids() {
        assert!(!is_session_id("123"));
        assert!(!is_session_id("ses01hqxyz0000000000000000000"));
        assert!(!is_session_id("str_01hqxyz0000000000000000000"));
        assert!(!is_session_id("ses_notaulid"));
    }

    #[test]
    fn test_later_ids_sort_after_earlier() {
        let first = new_session_id();
        std::thread::sleep(Duration::from_millis(2));
        let second = new_session_id();
        assert!(first < second);
    }

    #[test]
    fn test_created_at() {
        let before = SystemTime::now() - Duration::from_secs(1);
        let created = session_created_at(&new_session_id()).unwrap();
        assert!(created >= before);
        assert!(session_created_at("nope").is_none());
    }
}
