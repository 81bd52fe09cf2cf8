//! Shared helpers for process-level integration tests: spawning real
//! coordinator/participant processes, killing them, and restarting them
//! against the same on-disk state.

use std::future::Future;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Timeout for node startup, shutdown, and client round trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

/// Await `fut` with a bound so a wedged cluster fails the test instead of
/// hanging it.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(IO_TIMEOUT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("{what} timed out"),
    }
}

/// Wrapper around a spawned node process and its captured log files.
pub struct NodeProcess {
    pub child: Child,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl NodeProcess {
    /// Best-effort read of the captured stdout log.
    pub fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    /// Panic if the process has already exited.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            let stdout = self.read_stdout();
            let stderr = self.read_stderr();
            panic!(
                "pact-store exited early ({context}) with status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
            );
        }
    }

    /// Wait for the process to exit on its own, e.g. at an injected crash
    /// point. Returns false when it is still running at the deadline.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Simulate a crash: kill without any graceful shutdown.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Fixed layout for one test cluster: a port block and a base directory.
pub struct Cluster {
    pub base_dir: PathBuf,
    pub host: String,
    pub master_port: u16,
    pub replica_port_start: u16,
    pub replica_count: usize,
}

impl Cluster {
    pub fn new(name: &str, replica_count: usize) -> Self {
        let base_dir = test_dir(name);
        cleanup_dir(&base_dir);
        std::fs::create_dir_all(&base_dir).expect("create test dir");
        let master_port = pick_port_block(replica_count);
        Self {
            base_dir,
            host: "127.0.0.1".to_string(),
            master_port,
            replica_port_start: master_port + 1,
            replica_count,
        }
    }

    pub fn master_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.master_port)
            .parse()
            .expect("master addr")
    }

    pub fn replica_addr(&self, index: usize) -> SocketAddr {
        format!("{}:{}", self.host, self.replica_port_start + index as u16)
            .parse()
            .expect("replica addr")
    }

    fn common_flags(&self) -> Vec<String> {
        vec![
            "--host".to_string(),
            self.host.clone(),
            "--master-port".to_string(),
            self.master_port.to_string(),
            "--replica-port-start".to_string(),
            self.replica_port_start.to_string(),
            "--base-dir".to_string(),
            self.base_dir.display().to_string(),
        ]
    }

    /// Spawn the coordinator and wait until it serves (recovery included).
    pub fn spawn_master(&self) -> NodeProcess {
        let mut args = vec![
            "--master".to_string(),
            "--replica-count".to_string(),
            self.replica_count.to_string(),
        ];
        args.extend(self.common_flags());
        let node = spawn_node(&self.base_dir, "master", &args);
        wait_for_port(self.master_addr(), IO_TIMEOUT);
        node
    }

    /// Spawn participant `index` and wait until it serves.
    pub fn spawn_replica(&self, index: usize) -> NodeProcess {
        let mut args = vec![
            "--replica".to_string(),
            "--replica-index".to_string(),
            index.to_string(),
        ];
        args.extend(self.common_flags());
        let node = spawn_node(&self.base_dir, &format!("replica{index}"), &args);
        wait_for_port(self.replica_addr(index), IO_TIMEOUT);
        node
    }

    /// Spawn every participant, replicas first.
    pub fn spawn_replicas(&self) -> Vec<NodeProcess> {
        (0..self.replica_count)
            .map(|index| self.spawn_replica(index))
            .collect()
    }

    /// Spawn the full cluster: replicas first so master recovery can reach
    /// them, then the coordinator.
    pub fn spawn_all(&self) -> (NodeProcess, Vec<NodeProcess>) {
        let replicas = self.spawn_replicas();
        let master = self.spawn_master();
        (master, replicas)
    }

    pub fn replica_temp_dir(&self, index: usize) -> PathBuf {
        self.base_dir
            .join("data")
            .join(format!("replica{index}"))
            .join("temp")
    }

    /// Best-effort removal of the cluster's on-disk state.
    pub fn cleanup(&self) {
        cleanup_dir(&self.base_dir);
    }
}

/// Spawn a pact-store process with stdout/stderr captured to log files.
fn spawn_node(base_dir: &Path, tag: &str, args: &[String]) -> NodeProcess {
    let log_dir = base_dir.join("proclogs");
    let _ = std::fs::create_dir_all(&log_dir);
    let stdout_path = log_dir.join(format!("{tag}.out.log"));
    let stderr_path = log_dir.join(format!("{tag}.err.log"));
    let stdout_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stdout_path)
        .expect("open stdout log");
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .expect("open stderr log");

    let child = Command::new(env!("CARGO_BIN_EXE_pact-store"))
        .args(args)
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .expect("failed to spawn pact-store");

    NodeProcess {
        child,
        stdout_path,
        stderr_path,
    }
}

/// Wait for a TCP port to accept connections.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("port {addr} did not open in time");
}

/// Pick `1 + replicas` consecutive free ports: the first for the master,
/// the rest for participant `i` on `base + 1 + i`.
fn pick_port_block(replicas: usize) -> u16 {
    for _ in 0..64 {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let base = probe.local_addr().expect("local addr").port();
        drop(probe);

        if usize::from(base) + replicas + 1 >= usize::from(u16::MAX) {
            continue;
        }
        let holds: Option<Vec<TcpListener>> = (0..=replicas as u16)
            .map(|offset| TcpListener::bind(("127.0.0.1", base + offset)).ok())
            .collect();
        if holds.is_some() {
            return base;
        }
    }
    panic!("could not find a free port block");
}

/// Build a per-test directory under the system temp dir.
fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("pact-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}
