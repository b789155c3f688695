//! Operation callers
//!
//! The workers that drive the cache through the retry executor: a key
//! setter, a periodic cluster scanner and a one-shot command demo. Each
//! worker runs its own operations in sequence; `WorkerSet` runs several of
//! them on named threads and bounds how long shutdown waits for them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{list_endpoints, scan_cluster, Endpoint, ScanItem};
use crate::retry::{FailureKind, RetryExecutor, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::utils::CacheError;

/// Key used by the command demo
pub const MESSAGE_KEY: &str = "Message";
/// Key holding the serialized sample employee
pub const EMPLOYEE_KEY: &str = "e007";

/// Sample object stored as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub age: i32,
}

impl Employee {
    pub fn sample() -> Self {
        Self {
            id: "007".to_string(),
            name: "Davide Columbo".to_string(),
            age: 100,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetKeysReport {
    pub set: u32,
    pub failed: u32,
}

/// SET `<prefix><i>` for `i` in `0..count`, each under the retry policy
///
/// A failed key is logged and skipped. Stops early on shutdown.
pub fn set_keys(
    executor: &RetryExecutor,
    policy: &RetryPolicy,
    shutdown: &ShutdownSignal,
    prefix: &str,
    count: u32,
) -> SetKeysReport {
    let mut report = SetKeysReport::default();

    for i in 0..count {
        if shutdown.is_cancelled() {
            info!("Set keys interrupted after {} key(s)", report.set);
            break;
        }

        let key = format!("{}{}", prefix, i);
        let value = format!("Hello! This is value for {}", key);
        debug!("Cache command: SET {} \"{}\"", key, value);

        match executor.run("SET", policy, |handle| {
            handle.set(key.as_bytes(), value.as_bytes())
        }) {
            Ok(success) => {
                report.set += 1;
                debug!(
                    "Cache response: {} ({} attempt(s))",
                    success.value, success.attempts
                );
            }
            Err(failure) => {
                report.failed += 1;
                warn!("{}", failure);
                if matches!(failure.source, CacheError::Cancelled | CacheError::Disposed) {
                    break;
                }
            }
        }
    }

    info!("Set {} key(s), {} failed", report.set, report.failed);
    report
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub shards: usize,
    pub keys: usize,
    pub failed: Vec<Endpoint>,
}

/// One pass of a cluster-wide scan for `pattern`
///
/// Shard failures are reported, not retried. If a failure points at a
/// broken connection, a reconnect is requested so the next round starts on
/// a fresh handle and topology.
pub fn scan_round(
    executor: &RetryExecutor,
    shutdown: &ShutdownSignal,
    pattern: &str,
    page_size: usize,
) -> Result<ScanReport, CacheError> {
    let manager = executor.manager();
    let handle = manager.current()?;
    let mut report = ScanReport {
        shards: list_endpoints(&handle).len(),
        ..ScanReport::default()
    };
    info!("Cache command: SCAN {} on {} shard(s)", pattern, report.shards);

    let mut shard: Option<Endpoint> = None;
    let mut connection_broken = None;

    let items = scan_cluster(Arc::clone(&handle), pattern)
        .page_size(page_size)
        .with_shutdown(shutdown.clone());
    for item in items {
        if shard.as_ref() != Some(item.endpoint()) {
            info!("Current shard is {}", item.endpoint());
            shard = Some(item.endpoint().clone());
        }
        match item {
            ScanItem::Key { key, .. } => {
                info!("{}", key);
                report.keys += 1;
            }
            ScanItem::ShardFailed { endpoint, error } => {
                if executor.classifier().classify(&error) == FailureKind::TransientConnection {
                    connection_broken = Some(error.to_string());
                }
                report.failed.push(endpoint);
            }
        }
    }

    if let Some(reason) = connection_broken {
        manager.report_fault(handle.generation(), &reason);
        if let Err(e) = manager.force_reconnect(handle.generation(), &reason) {
            warn!("Reconnect after scan failure did not succeed: {}", e);
        }
    }

    Ok(report)
}

/// Scan repeatedly until shutdown, pausing `interval` between rounds
///
/// Returns the number of completed rounds.
pub fn scan_keys(
    executor: &RetryExecutor,
    shutdown: &ShutdownSignal,
    pattern: &str,
    page_size: usize,
    interval: Duration,
) -> anyhow::Result<u64> {
    let mut rounds = 0;

    while !shutdown.is_cancelled() {
        match scan_round(executor, shutdown, pattern, page_size) {
            Ok(report) => {
                rounds += 1;
                info!(
                    "Scan round {}: {} key(s) from {} shard(s), {} shard(s) failed",
                    rounds,
                    report.keys,
                    report.shards,
                    report.failed.len()
                );
            }
            Err(CacheError::Disposed | CacheError::Cancelled) => break,
            Err(CacheError::NotInitialized) => {
                anyhow::bail!("Scan started before the connection was initialized")
            }
            Err(e) => warn!("Scan round skipped: {}", e),
        }

        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    debug!("Scan worker stopping after {} round(s)", rounds);
    Ok(rounds)
}

/// PING, GET/SET of a message and a JSON object round trip
///
/// Returns the employee as read back from the cache.
pub fn run_commands(executor: &RetryExecutor, policy: &RetryPolicy) -> anyhow::Result<Employee> {
    let value = "Hello! The cache is working from a Rust console app!";

    info!("Cache command: PING");
    executor.execute("PING", policy, |handle| handle.ping())?;
    info!("Cache response: PONG");

    info!("Cache command: GET {}", MESSAGE_KEY);
    let current = executor.execute("GET", policy, |handle| handle.get(MESSAGE_KEY.as_bytes()))?;
    info!("Cache response: {}", display_value(current.as_deref()));

    info!("Cache command: SET {} \"{}\"", MESSAGE_KEY, value);
    let stored = executor.execute("SET", policy, |handle| {
        handle.set(MESSAGE_KEY.as_bytes(), value.as_bytes())
    })?;
    info!("Cache response: {}", stored);

    info!("Cache command: GET {}", MESSAGE_KEY);
    let current = executor.execute("GET", policy, |handle| handle.get(MESSAGE_KEY.as_bytes()))?;
    info!("Cache response: {}", display_value(current.as_deref()));

    let json = serde_json::to_string(&Employee::sample()).context("Failed to serialize employee")?;
    let stored = executor.execute("SET", policy, |handle| {
        handle.set(EMPLOYEE_KEY.as_bytes(), json.as_bytes())
    })?;
    info!("Cache response from storing serialized Employee object: {}", stored);

    let raw = executor
        .execute("GET", policy, |handle| handle.get(EMPLOYEE_KEY.as_bytes()))?
        .with_context(|| format!("{} missing right after SET", EMPLOYEE_KEY))?;
    let employee: Employee =
        serde_json::from_slice(&raw).context("Failed to deserialize employee")?;
    info!("Employee.Name : {}", employee.name);
    info!("Employee.Id   : {}", employee.id);
    info!("Employee.Age  : {}", employee.age);

    Ok(employee)
}

fn display_value(value: Option<&[u8]>) -> String {
    value
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_else(|| "(nil)".to_string())
}

/// Outcome of joining a `WorkerSet`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub completed: usize,
    pub failed: usize,
    /// Workers still running when the grace period ran out
    pub abandoned: Vec<String>,
}

/// Named worker threads joined with a bounded grace period
#[derive(Default)]
pub struct WorkerSet {
    workers: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &str, work: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(work)
            .with_context(|| format!("Failed to spawn worker '{}'", name))?;
        self.workers.push((name.to_string(), handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// True once every worker has returned
    pub fn all_finished(&self) -> bool {
        self.workers.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Wait up to `grace` for the workers, then join the finished ones
    ///
    /// Workers still running after `grace` are detached and reported.
    pub fn join(self, grace: Duration) -> JoinReport {
        let deadline = Instant::now() + grace;
        while !self.all_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let mut report = JoinReport::default();
        for (name, handle) in self.workers {
            if !handle.is_finished() {
                warn!("Worker '{}' did not stop within {:?}", name, grace);
                report.abandoned.push(name);
                continue;
            }
            match handle.join() {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    error!("Worker '{}' failed: {:#}", name, e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!("Worker '{}' panicked", name);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockCluster;
    use crate::connection::{ConnectionManager, ManagerSettings};

    fn executor(cluster: &MockCluster, cluster_mode: bool) -> (Arc<RetryExecutor>, ShutdownSignal) {
        let manager = Arc::new(ConnectionManager::new(
            cluster.connector(),
            vec![cluster.seed()],
            cluster_mode,
            ManagerSettings::default(),
        ));
        manager.initialize().unwrap();
        let shutdown = ShutdownSignal::new();
        (
            Arc::new(RetryExecutor::new(manager, shutdown.clone())),
            shutdown,
        )
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)).unwrap()
    }

    #[test]
    fn test_set_keys_writes_every_key() {
        let cluster = MockCluster::sharded(&[&[], &[], &[]]);
        let (executor, shutdown) = executor(&cluster, true);

        let report = set_keys(&executor, &fast(), &shutdown, "Message", 20);
        assert_eq!(report, SetKeysReport { set: 20, failed: 0 });

        let handle = executor.manager().current().unwrap();
        assert_eq!(
            handle.get(b"Message7").unwrap(),
            Some(b"Hello! This is value for Message7".to_vec())
        );
        let routed: usize = cluster
            .endpoints()
            .iter()
            .map(|endpoint| cluster.commands_on(endpoint, "SET"))
            .sum();
        assert_eq!(routed, 20);
    }

    #[test]
    fn test_set_keys_stops_on_shutdown() {
        let cluster = MockCluster::standalone(&[]);
        let (executor, shutdown) = executor(&cluster, false);
        shutdown.cancel();

        let report = set_keys(&executor, &fast(), &shutdown, "Message", 20);
        assert_eq!(report.set, 0);
        assert_eq!(cluster.commands("SET"), 0);
    }

    #[test]
    fn test_scan_round_counts_matching_keys() {
        let cluster = MockCluster::sharded(&[&["Message1", "other"], &["Message2"]]);
        let (executor, shutdown) = executor(&cluster, true);

        let report = scan_round(&executor, &shutdown, "*Message*", 10).unwrap();
        assert_eq!(report.shards, 2);
        assert_eq!(report.keys, 2);
        assert!(report.failed.is_empty());
        assert_eq!(executor.manager().reconnect_attempts(), 0);
    }

    #[test]
    fn test_scan_round_reconnects_after_broken_shard() {
        let cluster = MockCluster::sharded(&[&["a1"], &["b1"]]);
        let (executor, shutdown) = executor(&cluster, true);
        let s1 = cluster.endpoints()[0].clone();
        cluster.fail_scan_at(&s1, 0);

        let report = scan_round(&executor, &shutdown, "*", 10).unwrap();
        assert_eq!(report.keys, 1);
        assert_eq!(report.failed, vec![s1]);
        assert_eq!(executor.manager().reconnect_attempts(), 1);

        // The next round runs on the new handle and sees everything
        let report = scan_round(&executor, &shutdown, "*", 10).unwrap();
        assert_eq!(report.keys, 2);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_scan_keys_loops_until_shutdown() {
        let cluster = MockCluster::standalone(&["Message1"]);
        let (executor, shutdown) = executor(&cluster, false);

        let worker = {
            let executor = Arc::clone(&executor);
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                scan_keys(&executor, &shutdown, "*Message*", 10, Duration::from_millis(5))
            })
        };
        while cluster.commands("SCAN") < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        shutdown.cancel();

        let rounds = worker.join().unwrap().unwrap();
        assert!(rounds >= 2);
    }

    #[test]
    fn test_run_commands_round_trips_employee() {
        let cluster = MockCluster::standalone(&[]);
        let (executor, _) = executor(&cluster, false);

        let employee = run_commands(&executor, &fast()).unwrap();
        assert_eq!(employee, Employee::sample());

        let raw = executor
            .manager()
            .current()
            .unwrap()
            .get(EMPLOYEE_KEY.as_bytes())
            .unwrap()
            .unwrap();
        let json = String::from_utf8(raw).unwrap();
        assert_eq!(json, r#"{"Id":"007","Name":"Davide Columbo","Age":100}"#);
    }

    #[test]
    fn test_worker_set_joins_within_grace() {
        let shutdown = ShutdownSignal::new();
        let mut workers = WorkerSet::new();
        {
            let shutdown = shutdown.clone();
            workers
                .spawn("waiter", move || {
                    shutdown.wait_timeout(Duration::from_secs(30));
                    Ok(())
                })
                .unwrap();
        }
        workers
            .spawn("failing", || -> anyhow::Result<()> { anyhow::bail!("boom") })
            .unwrap();
        assert_eq!(workers.len(), 2);

        shutdown.cancel();
        let report = workers.join(Duration::from_secs(5));
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert!(report.abandoned.is_empty());
    }

    #[test]
    fn test_worker_set_abandons_stuck_worker() {
        let mut workers = WorkerSet::new();
        workers
            .spawn("stuck", || {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .unwrap();

        let start = Instant::now();
        let report = workers.join(Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(report.abandoned, vec!["stuck".to_string()]);
    }
}
