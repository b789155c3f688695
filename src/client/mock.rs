//! Scripted in-memory cluster for tests
//!
//! Nodes answer PING, GET/SET/DEL, SCAN and CLUSTER NODES from shared state.
//! Tests inject dial refusals, I/O failures, error replies and topology
//! changes, and read back dial/close/command counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::control_plane::ControlPlane;
use super::raw_connection::{Connector, NodeConnection};
use crate::cluster::topology::SLOT_COUNT;
use crate::cluster::Endpoint;
use crate::utils::{CacheError, ConnectionError, RespValue, Result};

const BASE_PORT: u16 = 7000;

/// Scripted failure for the next matching command
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    Io(io::ErrorKind),
    Reply(String),
}

struct Shard {
    endpoint: Endpoint,
    keys: Vec<String>,
    slots: (u16, u16),
}

#[derive(Default)]
struct State {
    cluster_mode: bool,
    shards: Vec<Shard>,
    store: HashMap<Vec<u8>, Vec<u8>>,
    /// Bumped to break every open connection
    epoch: u64,
    refused: HashSet<Endpoint>,
    refuse_all: bool,
    dial_delay: Duration,
    dials: usize,
    closed: usize,
    commands: Vec<(Endpoint, String)>,
    /// (command name, fault), consumed in order
    faults: VecDeque<(String, Fault)>,
    /// One-shot SCAN failure at a given cursor per shard
    scan_faults: HashMap<Endpoint, u64>,
}

#[derive(Clone)]
pub(crate) struct MockCluster {
    state: Arc<Mutex<State>>,
}

impl MockCluster {
    /// Non-clustered server holding `keys`
    pub fn standalone(keys: &[&str]) -> Self {
        let cluster = Self {
            state: Arc::new(Mutex::new(State::default())),
        };
        cluster.reshard(BASE_PORT, &[keys]);
        cluster.state.lock().cluster_mode = false;
        cluster
    }

    /// Cluster with one primary per entry, slots split evenly
    pub fn sharded(shards: &[&[&str]]) -> Self {
        let cluster = Self {
            state: Arc::new(Mutex::new(State::default())),
        };
        cluster.reshard(BASE_PORT, shards);
        cluster.state.lock().cluster_mode = true;
        cluster
    }

    /// Replace the shard set; ports start at `base_port`
    pub fn reshard(&self, base_port: u16, shards: &[&[&str]]) {
        let n = shards.len().max(1);
        let mut state = self.state.lock();
        state.shards = shards
            .iter()
            .enumerate()
            .map(|(i, keys)| Shard {
                endpoint: Endpoint::new("127.0.0.1", base_port + i as u16),
                keys: keys.iter().map(|k| k.to_string()).collect(),
                slots: (
                    (SLOT_COUNT * i / n) as u16,
                    (SLOT_COUNT * (i + 1) / n - 1) as u16,
                ),
            })
            .collect();
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Endpoint of the first shard
    pub fn seed(&self) -> Endpoint {
        self.state.lock().shards[0].endpoint.clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .shards
            .iter()
            .map(|s| s.endpoint.clone())
            .collect()
    }

    pub fn refuse(&self, endpoint: &Endpoint) {
        self.state.lock().refused.insert(endpoint.clone());
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.state.lock().dial_delay = delay;
    }

    /// Break every open connection, as a server restart would
    pub fn drop_connections(&self) {
        self.state.lock().epoch += 1;
    }

    /// Fail the next command of any kind with an I/O error
    pub fn fail_next_io(&self, kind: io::ErrorKind) {
        self.fail_command("*", Fault::Io(kind));
    }

    /// Fail the next `command` (or any command for `"*"`)
    pub fn fail_command(&self, command: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .push_back((command.to_ascii_uppercase(), fault));
    }

    /// Reset the connection when `endpoint` is scanned at `cursor`
    pub fn fail_scan_at(&self, endpoint: &Endpoint, cursor: u64) {
        self.state.lock().scan_faults.insert(endpoint.clone(), cursor);
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn commands_on(&self, endpoint: &Endpoint, command: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|(ep, cmd)| ep == endpoint && cmd == command)
            .count()
    }

    pub fn commands(&self, command: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|(_, cmd)| cmd == command)
            .count()
    }
}

impl Connector for MockCluster {
    fn connect(&self, endpoint: &Endpoint) -> Result<NodeConnection> {
        let delay = self.state.lock().dial_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.dials += 1;
        let known = state.shards.iter().any(|s| &s.endpoint == endpoint);
        if state.refuse_all || state.refused.contains(endpoint) || !known {
            return Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            }
            .into());
        }

        Ok(Box::new(MockNode {
            endpoint: endpoint.clone(),
            epoch: state.epoch,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockNode {
    endpoint: Endpoint,
    epoch: u64,
    state: Arc<Mutex<State>>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.state.lock().closed += 1;
    }
}

impl MockNode {
    fn io_error(&self, kind: io::ErrorKind) -> CacheError {
        ConnectionError::Io {
            endpoint: self.endpoint.clone(),
            source: io::Error::new(kind, "injected"),
        }
        .into()
    }
}

impl ControlPlane for MockNode {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn execute_binary(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        let args: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();

        let mut state = self.state.lock();
        state.commands.push((self.endpoint.clone(), name.clone()));

        if state.epoch != self.epoch {
            return Err(self.io_error(io::ErrorKind::ConnectionReset));
        }

        if let Some(pos) = state
            .faults
            .iter()
            .position(|(cmd, _)| cmd == "*" || *cmd == name)
        {
            if let Some((_, fault)) = state.faults.remove(pos) {
                return match fault {
                    Fault::Io(kind) => Err(self.io_error(kind)),
                    Fault::Reply(message) => Ok(RespValue::Error(message)),
                };
            }
        }

        let bulk = |s: &str| RespValue::BulkString(s.as_bytes().to_vec());

        let reply = match (name.as_str(), args.len()) {
            ("PING", _) => RespValue::SimpleString("PONG".into()),
            ("GET", 2) => state
                .store
                .get(args[1].as_bytes())
                .map(|v| RespValue::BulkString(v.clone()))
                .unwrap_or(RespValue::Null),
            ("SET", 3) => {
                state
                    .store
                    .insert(args[1].as_bytes().to_vec(), args[2].as_bytes().to_vec());
                RespValue::SimpleString("OK".into())
            }
            ("DEL", 2) => RespValue::Integer(i64::from(
                state.store.remove(args[1].as_bytes()).is_some(),
            )),
            ("CLUSTER", 2) if state.cluster_mode => {
                let lines: Vec<String> = state
                    .shards
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let flags = if s.endpoint == self.endpoint { "myself,master" } else { "master" };
                        format!(
                            "{:040x} {}@{} {} - 0 0 {} connected {}-{}",
                            i + 1,
                            s.endpoint,
                            s.endpoint.port + 10000,
                            flags,
                            i + 1,
                            s.slots.0,
                            s.slots.1
                        )
                    })
                    .collect();
                bulk((lines.join("\n") + "\n").as_str())
            }
            ("CLUSTER", _) => {
                RespValue::Error("ERR This instance has cluster support disabled".into())
            }
            ("SCAN", 6) => {
                let cursor: u64 = args[1].parse().unwrap_or(0);
                let count: usize = args[5].parse().unwrap_or(10).max(1);
                if state.scan_faults.get(&self.endpoint) == Some(&cursor) {
                    state.scan_faults.remove(&self.endpoint);
                    return Err(self.io_error(io::ErrorKind::ConnectionReset));
                }
                let Some(shard) = state.shards.iter().find(|s| s.endpoint == self.endpoint) else {
                    return Ok(RespValue::Error("ERR unknown node".into()));
                };
                let start = (cursor as usize).min(shard.keys.len());
                let end = (start + count).min(shard.keys.len());
                let next = if end >= shard.keys.len() { 0 } else { end as u64 };
                let keys = shard.keys[start..end]
                    .iter()
                    .filter(|k| glob_match(&args[3], k))
                    .map(|k| bulk(k.as_str()))
                    .collect();
                RespValue::Array(vec![bulk(next.to_string().as_str()), RespValue::Array(keys)])
            }
            _ => RespValue::Error(format!("ERR unknown command '{}'", name)),
        };
        Ok(reply)
    }
}

/// `*`-only glob, enough for test patterns
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !text.starts_with(first) || text.len() < first.len() + last.len() || !text.ends_with(last) {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*Message*", "Message42"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "ab"));
        assert!(!glob_match("exact", "exactly"));
    }
}
