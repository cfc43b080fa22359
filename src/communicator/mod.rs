//! Guest communicator boundary.
//!
//! The pipeline reaches the guest only through [`Communicator`]: preparing
//! an SSH key pair, waiting for the guest to accept connections, running the
//! provisioning command and removing the temporary key again. The shipped
//! implementation, [`SshCommunicator`], shells out to the system `ssh` and
//! `ssh-keygen` binaries.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::wait::Cancellation;

mod runner;
mod ssh;

pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{SshCommunicator, expand_tilde};

/// Boxed future returned by communicator operations.
pub type CommFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CommunicatorError>> + Send + 'a>>;

/// Key material used to reach the guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// Private key handed to `ssh -i`.
    pub private_key_path: Utf8PathBuf,
    /// Public key in `authorized_keys` format; empty when unknown.
    pub public_key: String,
    /// Directory holding a generated key pair. `None` for user keys.
    pub temporary_dir: Option<Utf8PathBuf>,
    /// Unique comment embedded in a generated public key.
    pub comment: Option<String>,
}

impl KeyPair {
    /// Returns `true` when the pair was generated for this build.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.temporary_dir.is_some()
    }
}

/// Errors raised while talking to the guest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommunicatorError {
    /// A helper binary could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name.
        program: String,
        /// Operating system error.
        message: String,
    },
    /// `ssh-keygen` failed.
    #[error("key pair generation failed: {0}")]
    KeyGeneration(String),
    /// Reading or writing key files failed.
    #[error("key file {path}: {message}")]
    KeyFile {
        /// File or directory involved.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// The guest never accepted an SSH connection.
    #[error("timed out after {waited:?} waiting for SSH on {host}")]
    Timeout {
        /// Guest address.
        host: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// A remote command exited unsuccessfully.
    #[error("remote command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        /// Command that was run.
        command: String,
        /// Exit status, or `unknown` when the process was killed.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Waiting was interrupted.
    #[error("interrupted while waiting for SSH")]
    Interrupted,
}

/// Operations the pipeline performs on the guest.
pub trait Communicator: Send + Sync {
    /// Returns the key pair to inject into the guest.
    fn prepare_key_pair(&self) -> CommFuture<'_, KeyPair>;

    /// Deletes generated key material from the local machine.
    fn discard_key_pair<'a>(&'a self, key: &'a KeyPair) -> CommFuture<'a, ()>;

    /// Polls until the guest accepts an SSH session.
    fn wait_for_connection<'a>(
        &'a self,
        host: &'a str,
        key: &'a KeyPair,
        cancellation: &'a Cancellation,
    ) -> CommFuture<'a, ()>;

    /// Runs a shell command on the guest.
    fn run<'a>(&'a self, host: &'a str, key: &'a KeyPair, command: &'a str) -> CommFuture<'a, ()>;

    /// Removes a generated public key from the guest's `authorized_keys`.
    fn remove_temporary_key<'a>(&'a self, host: &'a str, key: &'a KeyPair) -> CommFuture<'a, ()>;
}
