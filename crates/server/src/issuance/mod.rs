//! Certificate issuance.
//!
//! The coordinator owns the lock table and is the only thing that runs the
//! issuance tool. One attempt per identity may be in flight; a second
//! attempt for the same identity is refused with
//! [`IssuanceError::AlreadyInProgress`] rather than queued.
//!
//! Each attempt runs on its own task holding the identity lock. The caller
//! only awaits the task, so a dropped connection doesn't abort the tool
//! halfway and leave a half-written identity directory behind.
//!
//! Any failure (spawn, non-zero exit, timeout, missing output) rolls the
//! identity back to having no certificate.

pub mod command;
pub mod lock;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{error, info, warn, Instrument};

use certgate_common::IdentityKey;
use certgate_config::IssuerConfig;

use crate::store::{CertificateRecord, CertificateStateStore, StorageError};

pub use command::IssuerCommand;
pub use lock::{IssuanceLock, LockTable};
pub use process::{run_to_completion, ProcessError, ProcessOutput};

/// Longest stderr excerpt carried in an error.
const MAX_STDERR_CHARS: usize = 4096;

/// Issuance failures.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("certificate issuance already in progress for {0}")]
    AlreadyInProgress(IdentityKey),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("issuance tool exited with {}: {stderr}", describe_exit(.code))]
    Failed { code: Option<i32>, stderr: String },

    #[error("issuance tool could not be run: {0}")]
    Spawn(#[source] ProcessError),

    #[error("issuance tool timed out after {}s", .0.as_secs())]
    TimedOut(std::time::Duration),

    #[error("issuance tool succeeded but wrote no fullchain")]
    MissingOutput,

    #[error("issuance task failed: {0}")]
    Internal(String),
}

/// Runs issuance attempts, at most one per identity.
#[derive(Debug, Clone)]
pub struct IssuanceCoordinator {
    store: Arc<CertificateStateStore>,
    locks: LockTable,
    issuer: Arc<IssuerConfig>,
    credentials: Arc<PathBuf>,
}

impl IssuanceCoordinator {
    pub fn new(store: Arc<CertificateStateStore>, issuer: IssuerConfig, credentials: PathBuf) -> Self {
        Self {
            store,
            locks: LockTable::new(),
            issuer: Arc::new(issuer),
            credentials: Arc::new(credentials),
        }
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Issue a certificate for `record` from `csr` and return the path of
    /// the new fullchain.
    pub async fn issue(
        &self,
        record: CertificateRecord,
        csr: Bytes,
    ) -> Result<PathBuf, IssuanceError> {
        let lock = self
            .locks
            .try_acquire(&record.key)
            .ok_or_else(|| IssuanceError::AlreadyInProgress(record.key.clone()))?;

        let attempt = Attempt {
            coordinator: self.clone(),
            record,
            csr,
            _lock: lock,
        };

        tokio::spawn(attempt.run().in_current_span())
            .await
            .map_err(|e| IssuanceError::Internal(e.to_string()))?
    }
}

/// One issuance attempt. Holds the identity lock until dropped.
struct Attempt {
    coordinator: IssuanceCoordinator,
    record: CertificateRecord,
    csr: Bytes,
    _lock: IssuanceLock,
}

impl Attempt {
    async fn run(self) -> Result<PathBuf, IssuanceError> {
        let result = self.execute().await;
        if let Err(e) = &result {
            self.rollback(e);
        }
        result
    }

    async fn execute(&self) -> Result<PathBuf, IssuanceError> {
        let store = &self.coordinator.store;
        let issuer = &self.coordinator.issuer;
        let record = &self.record;

        store.prepare_for_issuance(record)?;
        store.write_csr(record, &self.csr)?;

        let command = IssuerCommand::certonly(issuer, &self.coordinator.credentials, record);
        info!(key = %record.key, command = ?command, "Running issuance tool");

        let output = run_to_completion(command.into_command(), issuer.timeout())
            .await
            .map_err(|e| match e {
                ProcessError::TimedOut(after) => IssuanceError::TimedOut(after),
                other => IssuanceError::Spawn(other),
            })?;

        if !output.status.success() {
            return Err(IssuanceError::Failed {
                code: output.status.code(),
                stderr: truncate(output.stderr_lossy()),
            });
        }
        if !record.fullchain_path.is_file() {
            return Err(IssuanceError::MissingOutput);
        }

        info!(
            key = %record.key,
            fullchain = %record.fullchain_path.display(),
            "Issued certificate"
        );
        Ok(record.fullchain_path.clone())
    }

    fn rollback(&self, cause: &IssuanceError) {
        error!(key = %self.record.key, error = %cause, "Issuance failed, discarding identity state");
        if let Err(e) = self.coordinator.store.reset_to_empty(&self.record) {
            warn!(key = %self.record.key, error = %e, "Rollback after failed issuance failed");
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_STDERR_CHARS {
        let mut cut = s.len() - MAX_STDERR_CHARS;
        while !s.is_char_boundary(cut) {
            cut += 1;
        }
        s.replace_range(..cut, "...");
    }
    s
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    const KEY: &str = "5a0b54d5dc17e0aa";

    /// Writes a stand-in for the issuance tool and returns its path.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-issuer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const WRITES_FULLCHAIN: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --fullchain-path) echo "FULLCHAIN" > "$2"; shift ;;
  esac
  shift
done
"#;

    fn coordinator(dir: &Path, tool: PathBuf, timeout_secs: u64) -> IssuanceCoordinator {
        let store = Arc::new(CertificateStateStore::new(&dir.join("certs")).unwrap());
        let issuer = IssuerConfig {
            command: tool,
            timeout_secs,
            ..IssuerConfig::default()
        };
        IssuanceCoordinator::new(store, issuer, dir.join("creds.ini"))
    }

    fn record(coordinator: &IssuanceCoordinator) -> CertificateRecord {
        coordinator.store.locate(&IdentityKey::new(KEY).unwrap())
    }

    #[tokio::test]
    async fn test_issue_success() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), WRITES_FULLCHAIN);
        let coordinator = coordinator(dir.path(), tool, 10);
        let record = record(&coordinator);

        let path = coordinator
            .issue(record.clone(), Bytes::from_static(b"CSR"))
            .await
            .unwrap();

        assert_eq!(path, record.fullchain_path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "FULLCHAIN\n");
        assert_eq!(std::fs::read(&record.csr_path).unwrap(), b"CSR");
        assert!(!coordinator.locks().is_held(&record.key));
    }

    #[tokio::test]
    async fn test_issue_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'DNS problem' >&2\nexit 1");
        let coordinator = coordinator(dir.path(), tool, 10);
        let record = record(&coordinator);

        let err = coordinator
            .issue(record.clone(), Bytes::from_static(b"CSR"))
            .await
            .unwrap_err();

        match err {
            IssuanceError::Failed { code, stderr } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "DNS problem");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!record.dir.exists());
        assert!(!coordinator.locks().is_held(&record.key));
    }

    #[tokio::test]
    async fn test_issue_success_without_output_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "exit 0");
        let coordinator = coordinator(dir.path(), tool, 10);
        let record = record(&coordinator);

        let err = coordinator
            .issue(record.clone(), Bytes::from_static(b"CSR"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::MissingOutput));
        assert!(!record.dir.exists());
    }

    #[tokio::test]
    async fn test_issue_spawn_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), dir.path().join("missing-tool"), 10);
        let record = record(&coordinator);

        let err = coordinator
            .issue(record.clone(), Bytes::from_static(b"CSR"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::Spawn(ProcessError::Spawn(_))));
        assert!(!record.dir.exists());
    }

    #[tokio::test]
    async fn test_issue_timeout_rolls_back_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "exec sleep 30");
        let coordinator = coordinator(dir.path(), tool, 1);
        let record = record(&coordinator);

        let err = coordinator
            .issue(record.clone(), Bytes::from_static(b"CSR"))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::TimedOut(d) if d == Duration::from_secs(1)));
        assert!(!record.dir.exists());
        assert!(!coordinator.locks().is_held(&record.key));
    }

    #[tokio::test]
    async fn test_concurrent_issue_same_identity_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("sleep 1\n{WRITES_FULLCHAIN}");
        let tool = fake_tool(dir.path(), &body);
        let coordinator = coordinator(dir.path(), tool, 10);
        let record = record(&coordinator);

        let first = {
            let coordinator = coordinator.clone();
            let record = record.clone();
            tokio::spawn(async move { coordinator.issue(record, Bytes::from_static(b"A")).await })
        };
        while !coordinator.locks().is_held(&record.key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = coordinator
            .issue(record.clone(), Bytes::from_static(b"B"))
            .await;
        assert!(matches!(second, Err(IssuanceError::AlreadyInProgress(ref k)) if k == &record.key));

        // The losing attempt must not disturb the running one.
        first.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&record.csr_path).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("sleep 1\n{WRITES_FULLCHAIN}");
        let tool = fake_tool(dir.path(), &body);
        let coordinator = coordinator(dir.path(), tool, 10);
        let record = record(&coordinator);

        let caller = {
            let coordinator = coordinator.clone();
            let record = record.clone();
            tokio::spawn(async move { coordinator.issue(record, Bytes::from_static(b"A")).await })
        };
        while !coordinator.locks().is_held(&record.key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        caller.abort();

        while coordinator.locks().is_held(&record.key) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(record.fullchain_path.is_file());
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let long = format!("{}tail", "x".repeat(MAX_STDERR_CHARS * 2));
        let cut = truncate(long);
        assert!(cut.starts_with("..."));
        assert!(cut.ends_with("tail"));
        assert_eq!(cut.len(), MAX_STDERR_CHARS + 3);
    }
}
