//! Control Plane trait for node communication
//!
//! `ControlPlane` is the seam between the resilience layer and the wire:
//! - `RawConnection`: direct TCP/TLS with the RESP codec
//! - scripted in-memory nodes in tests
//!
//! Higher-level commands live in `ControlPlaneExt` and are shared by every
//! implementation.

use crate::cluster::Endpoint;
use crate::utils::{parse_scan_reply, CacheError, ConnectionError, RespValue, Result};

/// A single connection to one node
pub trait ControlPlane {
    /// Node this connection talks to
    fn endpoint(&self) -> &Endpoint;

    /// Send one command and read its reply
    ///
    /// Server error replies are returned as `RespValue::Error`; only
    /// transport failures are `Err`.
    fn execute_binary(&mut self, args: &[&[u8]]) -> Result<RespValue>;

    /// Execute a command with string arguments
    fn execute(&mut self, args: &[&str]) -> Result<RespValue> {
        let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
        self.execute_binary(&byte_args)
    }
}

/// Extension trait with the commands the resilience layer issues
pub trait ControlPlaneExt: ControlPlane {
    /// Execute and turn `-ERR` style replies into `CacheError::Server`
    fn command(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        match self.execute_binary(args)? {
            RespValue::Error(message) => Err(CacheError::Server {
                endpoint: self.endpoint().clone(),
                message,
            }),
            other => Ok(other),
        }
    }

    /// Send PING and verify PONG response
    fn ping(&mut self) -> Result<()> {
        match self.command(&["PING".as_bytes()])? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(unexpected(self.endpoint(), "PING", &other)),
        }
    }

    /// GET; `None` when the key does not exist
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.command(&["GET".as_bytes(), key])? {
            RespValue::BulkString(data) => Ok(Some(data)),
            RespValue::Null => Ok(None),
            other => Err(unexpected(self.endpoint(), "GET", &other)),
        }
    }

    /// SET; `false` when the server declined (NX/XX style replies)
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        match self.command(&["SET".as_bytes(), key, value])? {
            RespValue::SimpleString(s) if s == "OK" => Ok(true),
            RespValue::Null => Ok(false),
            other => Err(unexpected(self.endpoint(), "SET", &other)),
        }
    }

    /// DEL; number of keys removed
    fn del(&mut self, key: &[u8]) -> Result<i64> {
        match self.command(&["DEL".as_bytes(), key])? {
            RespValue::Integer(n) => Ok(n),
            other => Err(unexpected(self.endpoint(), "DEL", &other)),
        }
    }

    /// One SCAN page: returns the next cursor (0 when done) and the keys
    fn scan_page(&mut self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let cursor = cursor.to_string();
        let count = count.to_string();
        let reply = self.command(&[
            "SCAN".as_bytes(),
            cursor.as_bytes(),
            "MATCH".as_bytes(),
            pattern.as_bytes(),
            "COUNT".as_bytes(),
            count.as_bytes(),
        ])?;
        if !matches!(
            reply.as_array(),
            Some([_, RespValue::Array(_) | RespValue::Null])
        ) {
            return Err(unexpected(self.endpoint(), "SCAN", &reply));
        }
        parse_scan_reply(reply).ok_or_else(|| CacheError::Protocol {
            endpoint: self.endpoint().clone(),
            message: "Invalid SCAN cursor".to_string(),
        })
    }

    /// Get CLUSTER NODES response as string
    fn cluster_nodes(&mut self) -> Result<String> {
        match self.command(&["CLUSTER".as_bytes(), "NODES".as_bytes()])? {
            RespValue::BulkString(data) => String::from_utf8(data).map_err(|e| {
                CacheError::Protocol {
                    endpoint: self.endpoint().clone(),
                    message: format!("Invalid UTF-8 in CLUSTER NODES: {}", e),
                }
            }),
            other => Err(unexpected(self.endpoint(), "CLUSTER NODES", &other)),
        }
    }

    /// Send AUTH; any rejection is an authentication failure
    fn authenticate(&mut self, password: &str, username: Option<&str>) -> Result<()> {
        let response = match username {
            Some(user) => self.execute(&["AUTH", user, password])?,
            None => self.execute(&["AUTH", password])?,
        };

        match response {
            r if r.is_ok() => Ok(()),
            RespValue::Error(message) => Err(ConnectionError::AuthFailed {
                endpoint: self.endpoint().clone(),
                message,
            }
            .into()),
            other => Err(unexpected(self.endpoint(), "AUTH", &other)),
        }
    }

    /// Send SELECT
    fn select_db(&mut self, db: u32) -> Result<()> {
        let db_str = db.to_string();
        match self.command(&["SELECT".as_bytes(), db_str.as_bytes()])? {
            r if r.is_ok() => Ok(()),
            other => Err(unexpected(self.endpoint(), "SELECT", &other)),
        }
    }
}

// Blanket implementation: any ControlPlane automatically gets ControlPlaneExt
impl<T: ControlPlane + ?Sized> ControlPlaneExt for T {}

fn unexpected(endpoint: &Endpoint, command: &str, reply: &RespValue) -> CacheError {
    CacheError::Protocol {
        endpoint: endpoint.clone(),
        message: format!("Unexpected {} response: {:?}", command, reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // Replays canned replies in order
    struct MockControlPlane {
        endpoint: Endpoint,
        responses: VecDeque<RespValue>,
        sent: Vec<Vec<String>>,
    }

    impl MockControlPlane {
        fn new(responses: Vec<RespValue>) -> Self {
            Self {
                endpoint: Endpoint::new("127.0.0.1", 6379),
                responses: responses.into(),
                sent: Vec::new(),
            }
        }
    }

    impl ControlPlane for MockControlPlane {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn execute_binary(&mut self, args: &[&[u8]]) -> Result<RespValue> {
            self.sent.push(
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect(),
            );
            self.responses.pop_front().ok_or_else(|| {
                ConnectionError::Io {
                    endpoint: self.endpoint.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"),
                }
                .into()
            })
        }
    }

    #[test]
    fn test_ping() {
        let mut mock = MockControlPlane::new(vec![RespValue::SimpleString("PONG".into())]);
        assert!(mock.ping().is_ok());
    }

    #[test]
    fn test_get_missing_key() {
        let mut mock = MockControlPlane::new(vec![RespValue::Null]);
        assert_eq!(mock.get(b"nope").unwrap(), None);
    }

    #[test]
    fn test_server_error_becomes_cache_error() {
        let mut mock = MockControlPlane::new(vec![RespValue::Error(
            "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
        )]);
        let err = mock.get(b"list").unwrap_err();
        assert!(err.server_message().unwrap().starts_with("WRONGTYPE"));
    }

    #[test]
    fn test_scan_page_sends_match_and_count() {
        let mut mock = MockControlPlane::new(vec![RespValue::Array(vec![
            RespValue::BulkString(b"0".to_vec()),
            RespValue::Array(vec![RespValue::BulkString(b"Message1".to_vec())]),
        ])]);
        let (cursor, keys) = mock.scan_page(0, "*Message*", 250).unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(keys, vec!["Message1"]);
        assert_eq!(mock.sent[0], vec!["SCAN", "0", "MATCH", "*Message*", "COUNT", "250"]);
    }

    #[test]
    fn test_scan_page_rejects_malformed_reply() {
        let mut mock = MockControlPlane::new(vec![
            RespValue::SimpleString("OK".into()),
            RespValue::Array(vec![
                RespValue::BulkString(b"not-a-cursor".to_vec()),
                RespValue::Array(Vec::new()),
            ]),
        ]);
        match mock.scan_page(0, "*", 10).unwrap_err() {
            CacheError::Protocol { message, .. } => assert!(message.contains("SCAN")),
            other => panic!("unexpected error: {other:?}"),
        }
        match mock.scan_page(0, "*", 10).unwrap_err() {
            CacheError::Protocol { message, .. } => assert_eq!(message, "Invalid SCAN cursor"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_auth_rejected() {
        let mut mock = MockControlPlane::new(vec![RespValue::Error("WRONGPASS invalid".into())]);
        let err = mock.authenticate("secret", None).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Connection(ConnectionError::AuthFailed { .. })
        ));
    }
}
