use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::exec::classify::default_benign_patterns;

/// Configuration for one scheduler run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Durable command store (journal) path.
    pub store_path: PathBuf,
    /// Resume an existing store instead of compiling fresh.
    pub resume: bool,
    /// Address the completion listener binds for remote worker callbacks.
    pub listen_addr: SocketAddr,
    /// Remote worker pool (`host:port`), in round-robin order.
    pub workers: Vec<String>,
    /// Maximum concurrent local subprocesses.
    pub max_local: usize,
    /// Maximum remote commands in flight at once.
    pub max_remote: usize,
    /// Send attempts per remote command before it is marked Failed.
    pub dispatch_retries: u32,
    /// Dispatcher scan / monitor poll interval.
    pub poll_interval: Duration,
    /// When set, a Running remote command older than this is presumed lost
    /// and marked Failed. None waits indefinitely.
    pub remote_timeout: Option<Duration>,
    /// Error-text fragments that do not count as failures (third-party tools
    /// that print noise on stderr and still exit nonzero).
    pub benign_error_patterns: Vec<String>,
    /// Optional log file; stdout logging stays on either way.
    pub log_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("geochain.store"),
            resume: false,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7700"
                .parse()
                .expect("default listen address is valid"),
            workers: Vec::new(),
            max_local: 4,
            max_remote: 8,
            dispatch_retries: 3,
            poll_interval: Duration::from_millis(500),
            remote_timeout: None,
            benign_error_patterns: default_benign_patterns(),
            log_file: None,
        }
    }
}

impl RunConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: Vec<String>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_default() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.store_path, PathBuf::from("geochain.store"));
        assert!(!cfg.resume);
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7700");
        assert!(cfg.workers.is_empty());
        assert_eq!(cfg.max_local, 4);
        assert_eq!(cfg.max_remote, 8);
        assert_eq!(cfg.dispatch_retries, 3);
        assert!(cfg.remote_timeout.is_none());
        assert!(!cfg.benign_error_patterns.is_empty());
    }

    #[test]
    fn run_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = RunConfig::new("/tmp/a.store")
            .with_workers(vec!["w1:7701".to_string()])
            .with_listen_addr(addr)
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/a.store"));
        assert_eq!(cfg.workers, vec!["w1:7701"]);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
    }
}
