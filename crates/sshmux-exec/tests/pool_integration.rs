use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use sshmux_exec::*;

// Mock transport

#[derive(Default)]
struct Stats {
    dials: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    disconnects: AtomicUsize,
}

struct MockDialer {
    stats: Arc<Stats>,
    dial_delay: Duration,
    exec_time: Duration,
    fail_with: Mutex<Option<ExecError>>,
}

impl MockDialer {
    fn new(dial_delay: Duration, exec_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            stats: Arc::new(Stats::default()),
            dial_delay,
            exec_time,
            fail_with: Mutex::new(None),
        })
    }

    fn failing(error: ExecError) -> Arc<Self> {
        let dialer = Self::new(Duration::from_millis(50), Duration::ZERO);
        dialer.set_failure(Some(error));
        dialer
    }

    fn set_failure(&self, error: Option<ExecError>) {
        *self.fail_with.lock().unwrap() = error;
    }

    fn dials(&self) -> usize {
        self.stats.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        _identity: &CredentialIdentity,
        _config: &DialConfig,
    ) -> Result<Arc<dyn Connection>, ExecError> {
        self.stats.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.dial_delay).await;
        let failure = self.fail_with.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Arc::new(MockConnection {
            stats: Arc::clone(&self.stats),
            exec_time: self.exec_time,
        }))
    }
}

struct MockConnection {
    stats: Arc<Stats>,
    exec_time: Duration,
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, ExecError> {
        Ok(Box::new(MockChannel {
            stats: Arc::clone(&self.stats),
            exec_time: self.exec_time,
        }))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    stats: Arc<Stats>,
    exec_time: Duration,
}

#[async_trait]
impl Channel for MockChannel {
    async fn exec(
        &mut self,
        command: &str,
        _stdin: Option<Stdin>,
    ) -> Result<CommandOutput, ExecError> {
        let now = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.exec_time).await;
        self.stats.running.fetch_sub(1, Ordering::SeqCst);

        let (stdout, exit) = if command == "fail" {
            (b"partial".to_vec(), ExitStatus::Code(1))
        } else {
            (command.as_bytes().to_vec(), ExitStatus::Code(0))
        };
        Ok(CommandOutput {
            stdout,
            exit: Some(exit),
            ..CommandOutput::default()
        })
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        Ok(())
    }
}

fn identity(host: &str) -> CredentialIdentity {
    CredentialIdentity::new("test-key", "root", host)
}

fn timeout_error() -> ExecError {
    ExecError::ConnectTimeout {
        addr: "10.9.9.9:22".to_string(),
        deadline: Duration::from_secs(60),
        last_error: "connection refused".to_string(),
    }
}

// Single-flight dialing

#[tokio::test]
async fn test_concurrent_acquire_dials_once() {
    let dialer = MockDialer::new(Duration::from_millis(100), Duration::ZERO);
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&identity("vm1")).await.unwrap() })
        })
        .collect();

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap());
    }

    assert_eq!(dialer.dials(), 1);
    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(pool.len().await, 1);
}

#[tokio::test]
async fn test_distinct_identities_get_distinct_connections() {
    let dialer = MockDialer::new(Duration::from_millis(10), Duration::ZERO);
    let pool = ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap();

    let a = pool.acquire(&identity("vm1")).await.unwrap();
    let b = pool.acquire(&identity("vm2")).await.unwrap();
    let c = pool
        .acquire(&CredentialIdentity::new("other-key", "root", "vm1"))
        .await
        .unwrap();
    let again = pool.acquire(&identity("vm1")).await.unwrap();

    assert_eq!(dialer.dials(), 3);
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert!(Arc::ptr_eq(&a, &again));
}

#[tokio::test]
async fn test_failed_dial_shared_by_all_waiters() {
    let dialer = MockDialer::failing(timeout_error());
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&identity("gone")).await })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().err().unwrap();
        assert!(err.is_connect_timeout());
    }
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_strand_waiters() {
    let dialer = MockDialer::new(Duration::from_millis(200), Duration::ZERO);
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap());

    // first caller gives up while its dial is in flight
    let first = tokio::time::timeout(Duration::from_millis(20), pool.acquire(&identity("vm1"))).await;
    assert!(first.is_err());

    let conn = pool.acquire(&identity("vm1")).await;
    assert!(conn.is_ok());
    assert_eq!(dialer.dials(), 1);
}

// Failure policy

#[tokio::test]
async fn test_remember_policy_keeps_failure_until_evicted() {
    let dialer = MockDialer::failing(ExecError::AuthenticationFailed("denied".to_string()));
    let config = PoolConfig::new().with_failure_policy(FailurePolicy::Remember);
    let pool = ConnectionPool::new(dialer.clone(), config).unwrap();

    assert!(pool.check(&identity("vm1")).await.is_err());

    dialer.set_failure(None);
    let err = pool.check(&identity("vm1")).await.unwrap_err();
    assert!(matches!(err, ExecError::AuthenticationFailed(_)));
    assert_eq!(dialer.dials(), 1);

    assert!(pool.evict(&identity("vm1")).await);
    pool.check(&identity("vm1")).await.unwrap();
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn test_default_policy_redials_after_failure() {
    let dialer = MockDialer::failing(timeout_error());
    let pool = ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap();

    assert!(pool.check(&identity("vm1")).await.unwrap_err().is_connect_timeout());

    dialer.set_failure(None);
    pool.check(&identity("vm1")).await.unwrap();
    assert_eq!(dialer.dials(), 2);

    // success is reused, not redialed
    pool.check(&identity("vm1")).await.unwrap();
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn test_retry_after_cooldown() {
    let dialer = MockDialer::failing(timeout_error());
    let config = PoolConfig::new()
        .with_failure_policy(FailurePolicy::RetryAfter(Duration::from_millis(300)));
    let pool = ConnectionPool::new(dialer.clone(), config).unwrap();

    assert!(pool.check(&identity("vm1")).await.is_err());
    dialer.set_failure(None);

    // still cooling down
    assert!(pool.check(&identity("vm1")).await.is_err());
    assert_eq!(dialer.dials(), 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    pool.check(&identity("vm1")).await.unwrap();
    assert_eq!(dialer.dials(), 2);
}

// Admission gating

#[tokio::test]
async fn test_session_limit_bounds_concurrency() {
    let exec_time = Duration::from_millis(200);
    let dialer = MockDialer::new(Duration::ZERO, exec_time);
    let config = PoolConfig::new().with_session_limit(2);
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), config).unwrap());

    let start = Instant::now();
    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(&identity("vm1"), &format!("job-{i}")).await })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().unwrap().success());
    }

    assert_eq!(dialer.stats.max_running.load(Ordering::SeqCst), 2);
    // the third job had to wait for one of the first two
    assert!(start.elapsed() >= exec_time * 2);

    let conn = pool.get(&identity("vm1")).await.unwrap();
    assert_eq!(conn.session_limit(), 2);
    assert_eq!(conn.sessions_in_use(), 0);
}

#[tokio::test]
async fn test_waiting_caller_unblocks_when_slot_frees() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let config = PoolConfig::new().with_session_limit(1);
    let pool = ConnectionPool::new(dialer, config).unwrap();

    let conn = pool.acquire(&identity("vm1")).await.unwrap();
    let held = conn.open_session().await.unwrap();
    assert_eq!(conn.sessions_in_use(), 1);

    let blocked = tokio::time::timeout(Duration::from_millis(100), conn.open_session()).await;
    assert!(blocked.is_err());

    held.close().await.unwrap();
    assert_eq!(conn.sessions_in_use(), 0);

    let output = tokio::time::timeout(Duration::from_secs(1), pool.run(&identity("vm1"), "next"))
        .await
        .expect("slot should be free")
        .unwrap();
    assert_eq!(output.stdout, b"next");
}

#[tokio::test]
async fn test_failed_command_releases_slot() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let config = PoolConfig::new().with_session_limit(1);
    let pool = ConnectionPool::new(dialer, config).unwrap();

    let err = pool.run(&identity("vm1"), "fail").await.unwrap_err();
    assert!(is_exec_error(&err));
    assert_eq!(err.partial_output().unwrap().0, b"partial");

    let output = tokio::time::timeout(Duration::from_secs(1), pool.run(&identity("vm1"), "ok"))
        .await
        .expect("slot should have been released")
        .unwrap();
    assert_eq!(output.stdout, b"ok");
}

// Lifecycle

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let pool = ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap();

    pool.check(&identity("vm1")).await.unwrap();
    pool.check(&identity("vm2")).await.unwrap();
    assert_eq!(pool.len().await, 2);

    pool.shutdown().await;
    assert!(pool.is_empty().await);
    assert_eq!(dialer.stats.disconnects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_evict_during_dial_closes_late_connection() {
    let dialer = MockDialer::new(Duration::from_millis(150), Duration::ZERO);
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap());

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&identity("vm1")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(pool.evict(&identity("vm1")).await);

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, ExecError::DialAborted));
    assert_eq!(dialer.stats.disconnects.load(Ordering::SeqCst), 1);
    assert!(pool.is_empty().await);

    // a fresh acquire dials again and keeps its connection
    pool.check(&identity("vm1")).await.unwrap();
    assert_eq!(dialer.dials(), 2);
    assert!(pool.get(&identity("vm1")).await.is_some());
    assert_eq!(dialer.stats.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_during_dial_closes_late_connection() {
    let dialer = MockDialer::new(Duration::from_millis(150), Duration::ZERO);
    let pool = Arc::new(ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap());

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.check(&identity("vm1")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.shutdown().await;

    assert!(matches!(
        waiter.await.unwrap(),
        Err(ExecError::DialAborted)
    ));
    assert_eq!(dialer.stats.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_acquire_with_rejects_zero_probe_timeout() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let pool = ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap();
    let dial = DialConfig::default().with_probe_timeout(Duration::ZERO);

    let err = pool.acquire_with(&identity("vm1"), &dial).await.unwrap_err();
    assert!(matches!(err, ExecError::ConfigError(_)));
    assert_eq!(dialer.dials(), 0);
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_evict_unknown_identity() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let pool = ConnectionPool::new(dialer, PoolConfig::new()).unwrap();
    assert!(!pool.evict(&identity("nobody")).await);
}

#[tokio::test]
async fn test_open_dedicated_bypasses_registry() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let pool = ConnectionPool::new(dialer.clone(), PoolConfig::new()).unwrap();

    let conn = pool
        .open_dedicated(&identity("vm1"), &DialConfig::default())
        .await
        .unwrap();
    let output = conn.open_session().await.unwrap().run("uptime", None).await.unwrap();
    assert_eq!(output.stdout, b"uptime");
    conn.disconnect().await.unwrap();

    assert!(pool.is_empty().await);
    assert_eq!(dialer.dials(), 1);
    assert_eq!(dialer.stats.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pool_rejects_zero_session_limit() {
    let dialer = MockDialer::new(Duration::ZERO, Duration::ZERO);
    let result = ConnectionPool::new(dialer, PoolConfig::new().with_session_limit(0));
    assert!(matches!(result, Err(ExecError::ConfigError(_))));
}
