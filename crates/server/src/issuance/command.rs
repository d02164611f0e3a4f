//! Command line for the external issuance tool.
//!
//! The tool is driven in `certonly` mode with a caller-supplied CSR and a
//! DNS-01 authenticator plugin. All of its state (account, work and log
//! directories) lives inside the identity directory so a failed attempt can
//! be rolled back by deleting that one directory.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use certgate_config::IssuerConfig;

use crate::store::CertificateRecord;

const REDACTED: &str = "[REDACTED]";

/// Argument vector for one issuance attempt.
///
/// [`fmt::Debug`] replaces the DNS credentials path, so the command can be
/// logged as-is.
#[derive(Clone)]
pub struct IssuerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    secret_args: Vec<usize>,
}

impl IssuerCommand {
    /// Build the `certonly` invocation for `record`.
    pub fn certonly(issuer: &IssuerConfig, credentials: &Path, record: &CertificateRecord) -> Self {
        let plugin = &issuer.dns_plugin;
        let mut cmd = Self {
            program: issuer.command.clone(),
            args: Vec::new(),
            secret_args: Vec::new(),
        };

        cmd.arg("certonly")
            .arg("--non-interactive")
            .arg("--agree-tos")
            .arg("--force-renewal")
            .arg(format!("--dns-{plugin}"))
            .arg(format!("--dns-{plugin}-credentials"))
            .secret_arg(credentials);

        match &issuer.email {
            Some(email) => cmd.arg("-m").arg(email),
            None => cmd.arg("--register-unsafely-without-email"),
        };

        if issuer.staging {
            cmd.arg("--test-cert");
        }

        cmd.arg("--cert-name")
            .arg(record.key.as_str())
            .arg("--config-dir")
            .arg(&record.config_dir)
            .arg("--work-dir")
            .arg(&record.work_dir)
            .arg("--logs-dir")
            .arg(&record.logs_dir)
            .arg("--csr")
            .arg(&record.csr_path)
            .arg("--key-path")
            .arg(&record.key_path)
            .arg("--cert-path")
            .arg(&record.cert_path)
            .arg("--chain-path")
            .arg(&record.chain_path)
            .arg("--fullchain-path")
            .arg(&record.fullchain_path);

        cmd
    }

    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    fn secret_arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.secret_args.push(self.args.len());
        self.arg(arg)
    }

    pub fn into_command(self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

#[cfg(test)]
impl IssuerCommand {
    fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Value following `flag`, if present.
    fn value_of(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }
}

impl fmt::Debug for IssuerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&i) {
                write!(f, " {REDACTED}")?;
            } else {
                write!(f, " {arg:?}")?;
            }
        }
        Ok(())
    }
}
