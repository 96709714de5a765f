//! Path rules and the reserved address namespaces
//!
//! Paths are opaque keys into a peer's handler table. Two reserved
//! namespaces route replies without connection-level ids:
//! `/#requests/<peer-id>/<exchange-id>` for client reply addresses and
//! `<resource>/#streams/<peer-id>/<id>` for responder stream addresses.

use thiserror::Error;
use uuid::Uuid;

/// Namespace for client-issued exchange reply addresses
pub const REQUESTS_NS: &str = "/#requests";

/// Path segment under which responder stream addresses are allocated
pub const STREAMS_SEGMENT: &str = "#streams";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path not absolute: {0}")]
    NotAbsolute(String),

    #[error("path not normalized: {0}")]
    NotNormalized(String),

    #[error("trailing slash not allowed: {0}")]
    TrailingSlash(String),
}

/// Validate a request target path: absolute, normalized, and without a
/// trailing slash (the root path `/` being the one exception).
pub fn validate_target_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }

    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }

    if path == "/" {
        return Ok(());
    }

    if path.ends_with('/') {
        return Err(PathError::TrailingSlash(path.to_string()));
    }

    for segment in path[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(PathError::NotNormalized(path.to_string()));
        }
    }

    Ok(())
}

/// Reply address for a client-issued exchange.
pub fn reply_path(peer_id: &str, exchange_id: &Uuid) -> String {
    format!("{REQUESTS_NS}/{peer_id}/{exchange_id}")
}

/// Stream address allocated by a responder under the requested resource.
pub fn stream_path(resource: &str, peer_id: &str, id: &Uuid) -> String {
    if resource == "/" {
        format!("/{STREAMS_SEGMENT}/{peer_id}/{id}")
    } else {
        format!("{resource}/{STREAMS_SEGMENT}/{peer_id}/{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert!(validate_target_path("/").is_ok());
        assert!(validate_target_path("/hello").is_ok());
        assert!(validate_target_path("/a/b/c").is_ok());
    }

    #[test]
    fn test_invalid_paths() {
        assert_eq!(validate_target_path(""), Err(PathError::Empty));
        assert_eq!(
            validate_target_path("hello"),
            Err(PathError::NotAbsolute("hello".to_string()))
        );
        assert_eq!(
            validate_target_path("/hello/"),
            Err(PathError::TrailingSlash("/hello/".to_string()))
        );
        assert_eq!(
            validate_target_path("/a//b"),
            Err(PathError::NotNormalized("/a//b".to_string()))
        );
        assert_eq!(
            validate_target_path("/a/./b"),
            Err(PathError::NotNormalized("/a/./b".to_string()))
        );
        assert_eq!(
            validate_target_path("/a/../b"),
            Err(PathError::NotNormalized("/a/../b".to_string()))
        );
    }

    #[test]
    fn test_reserved_namespaces() {
        let id = Uuid::new_v4();
        let reply = reply_path("peer-1", &id);
        assert!(reply.starts_with("/#requests/peer-1/"));
        assert!(validate_target_path(&reply).is_ok());

        let stream = stream_path("/files", "peer-1", &id);
        assert!(stream.starts_with("/files/#streams/peer-1/"));

        let root_stream = stream_path("/", "peer-1", &id);
        assert!(root_stream.starts_with("/#streams/peer-1/"));
    }
}
