//! Package signing.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::GpgSettings;
use crate::domain::BuildArtifact;

use super::error::{BuildError, BuildResult};

/// Signs artifacts. Potentially slow; treated as an opaque external call.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, artifact: BuildArtifact) -> BuildResult<BuildArtifact>;
}

/// Signs rpms in place with `rpmsign --addsign`.
#[derive(Debug, Clone)]
pub struct RpmSigner {
    rpmsign: String,
    key: String,
    keyring: PathBuf,
    passphrase: Option<String>,
}

impl RpmSigner {
    pub fn new(settings: &GpgSettings) -> Self {
        Self {
            rpmsign: settings.rpmsign.clone(),
            key: settings.key.clone(),
            keyring: settings.keyring.clone(),
            passphrase: settings.passphrase.clone(),
        }
    }

    /// `--define` arguments for rpmsign.
    pub fn defines(&self) -> Vec<String> {
        let batch = match &self.passphrase {
            Some(pass) => format!("--batch --pinentry-mode loopback --passphrase '{pass}' "),
            None => String::new(),
        };
        vec![
            "--define".into(),
            format!("%_gpg_name {}", self.key),
            "--define".into(),
            format!("%_gpg_path {}", self.keyring.display()),
            "--define".into(),
            format!(
                "%__gpg_sign_cmd %{{__gpg}} gpg --no-verbose --no-armor {batch}--no-secmem-warning \
                 -u \"%{{_gpg_name}}\" -sbo %{{__signature_filename}} %{{__plaintext_filename}}"
            ),
        ]
    }
}

#[async_trait]
impl Signer for RpmSigner {
    async fn sign(&self, artifact: BuildArtifact) -> BuildResult<BuildArtifact> {
        if !self.keyring.exists() {
            return Err(BuildError::SignFailed(format!(
                "keyring {} does not exist",
                self.keyring.display()
            )));
        }
        debug!(package = %artifact.key, key = %self.key, "signing");
        let output = Command::new(&self.rpmsign)
            .arg("--addsign")
            .args(self.defines())
            .arg(&artifact.path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BuildError::SignFailed(format!("{}: {e}", self.rpmsign)))?;
        if !output.status.success() {
            return Err(BuildError::SignFailed(format!(
                "{}: {}",
                artifact.key,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(artifact.into_signed(&self.key))
    }
}
