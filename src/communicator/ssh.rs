//! SSH communicator backed by the system `ssh` and `ssh-keygen` binaries.

use std::ffi::OsString;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
#[cfg(unix)]
use cap_std::fs::OpenOptionsExt;
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CommunicatorSettings;
use crate::wait::Cancellation;

use super::{
    CommFuture, CommandOutput, CommandRunner, Communicator, CommunicatorError, KeyPair,
    ProcessCommandRunner,
};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const KEY_FILE_NAME: &str = "id_ed25519";
#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;

/// Communicator that drives the guest through `ssh`.
#[derive(Clone, Debug)]
pub struct SshCommunicator<R: CommandRunner> {
    settings: CommunicatorSettings,
    runner: R,
    key_root: Utf8PathBuf,
    poll_interval: Duration,
}

impl SshCommunicator<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(settings: CommunicatorSettings) -> Self {
        Self::new(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshCommunicator<R> {
    /// Creates a communicator that stores generated keys under the system
    /// temporary directory.
    #[must_use]
    pub fn new(settings: CommunicatorSettings, runner: R) -> Self {
        let key_root = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        Self {
            settings,
            runner,
            key_root,
            poll_interval: CONNECT_POLL_INTERVAL,
        }
    }

    /// Overrides where generated key pairs are written.
    #[must_use]
    pub fn with_key_root(mut self, key_root: impl Into<Utf8PathBuf>) -> Self {
        self.key_root = key_root.into();
        self
    }

    /// Overrides the pause between connection attempts.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn user_key_pair(path: &Utf8Path) -> Result<KeyPair, CommunicatorError> {
        let private_key_path = Utf8PathBuf::from(expand_tilde(path.as_str()));
        let public_path = Utf8PathBuf::from(format!("{private_key_path}.pub"));
        let public_key = if public_path.is_file() {
            read_file(&public_path)?.trim().to_owned()
        } else {
            String::new()
        };

        Ok(KeyPair {
            private_key_path,
            public_key,
            temporary_dir: None,
            comment: None,
        })
    }

    fn generate_key_pair(&self) -> Result<KeyPair, CommunicatorError> {
        let comment = format!("olvm-builder-{}", Uuid::new_v4().simple());
        let staging = private_key_dir(&self.key_root, &comment)?;
        let directory = Utf8PathBuf::from_path_buf(staging.path().to_path_buf()).map_err(|path| {
            CommunicatorError::KeyFile {
                path: path.display().to_string(),
                message: String::from("temporary key directory is not valid UTF-8"),
            }
        })?;

        let private_key_path = directory.join(KEY_FILE_NAME);
        let args = [
            "-q",
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            comment.as_str(),
            "-f",
            private_key_path.as_str(),
        ]
        .map(OsString::from);
        let output = self.runner.run(&self.settings.ssh_keygen_bin, &args)?;
        if !output.is_success() {
            return Err(CommunicatorError::KeyGeneration(
                output.stderr.trim().to_owned(),
            ));
        }

        let public_key = read_file(&directory.join(format!("{KEY_FILE_NAME}.pub")))?
            .trim()
            .to_owned();
        if let Some(debug_path) = &self.settings.debug_key_path {
            let private_key = read_file(&private_key_path)?;
            write_private_file(debug_path, &private_key)?;
            info!(path = %debug_path, "wrote debug private key");
        }
        debug!(dir = %directory, "generated temporary key pair");
        // Ownership passes to the key pair; `discard_key_pair` removes it.
        let _kept = staging.keep();

        Ok(KeyPair {
            private_key_path,
            public_key,
            temporary_dir: Some(directory),
            comment: Some(comment),
        })
    }

    fn ssh(&self, host: &str, key: &KeyPair, remote_command: &str) -> Result<CommandOutput, CommunicatorError> {
        let args = self.build_ssh_args(host, key, remote_command);
        self.runner.run(&self.settings.ssh_bin, &args)
    }

    fn build_ssh_args(&self, host: &str, key: &KeyPair, remote_command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.settings.ssh_port.to_string()),
            OsString::from("-i"),
            OsString::from(key.private_key_path.as_str()),
        ];
        for option in [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "ConnectTimeout=10",
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(format!(
            "{}@{host}",
            self.settings.ssh_username
        )));
        args.push(OsString::from(remote_command));
        args
    }

    fn run_checked(&self, host: &str, key: &KeyPair, command: &str) -> Result<(), CommunicatorError> {
        let output = self.ssh(host, key, command)?;
        if output.is_success() {
            return Ok(());
        }
        Err(CommunicatorError::CommandFailed {
            command: command.to_owned(),
            status: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

impl<R: CommandRunner> Communicator for SshCommunicator<R> {
    fn prepare_key_pair(&self) -> CommFuture<'_, KeyPair> {
        Box::pin(async move {
            match &self.settings.private_key_file {
                Some(path) => Self::user_key_pair(path),
                None => self.generate_key_pair(),
            }
        })
    }

    fn discard_key_pair<'a>(&'a self, key: &'a KeyPair) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let Some(directory) = &key.temporary_dir else {
                return Ok(());
            };
            let (parent, name) = split_path(directory)?;
            let dir = Dir::open_ambient_dir(parent, ambient_authority())
                .map_err(|err| key_file_error(parent, &err))?;
            match dir.remove_dir_all(name) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(key_file_error(directory, &err)),
            }
        })
    }

    fn wait_for_connection<'a>(
        &'a self,
        host: &'a str,
        key: &'a KeyPair,
        cancellation: &'a Cancellation,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let started = Instant::now();
            loop {
                if cancellation.is_cancelled() {
                    return Err(CommunicatorError::Interrupted);
                }
                let output = self.ssh(host, key, "true")?;
                if output.is_success() {
                    return Ok(());
                }
                debug!(host, stderr = %output.stderr.trim(), "SSH not ready yet");
                if started.elapsed() >= self.settings.timeout {
                    return Err(CommunicatorError::Timeout {
                        host: host.to_owned(),
                        waited: self.settings.timeout,
                    });
                }
                sleep(self.poll_interval).await;
            }
        })
    }

    fn run<'a>(&'a self, host: &'a str, key: &'a KeyPair, command: &'a str) -> CommFuture<'a, ()> {
        Box::pin(async move { self.run_checked(host, key, command) })
    }

    fn remove_temporary_key<'a>(&'a self, host: &'a str, key: &'a KeyPair) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let Some(comment) = &key.comment else {
                return Ok(());
            };
            let pattern = escape(format!("/{comment}/d").into());
            let command = format!(
                "sed -i.bak {pattern} ~/.ssh/authorized_keys && rm -f ~/.ssh/authorized_keys.bak"
            );
            self.run_checked(host, key, &command)
        })
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), CommunicatorError> {
    let name = path.file_name().ok_or_else(|| CommunicatorError::KeyFile {
        path: path.to_string(),
        message: String::from("path has no file name"),
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, name))
}

fn read_file(path: &Utf8Path) -> Result<String, CommunicatorError> {
    let (parent, name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| key_file_error(parent, &err))?;
    dir.read_to_string(name)
        .map_err(|err| key_file_error(path, &err))
}

/// Writes `contents` to a file only the owner can read.
fn write_private_file(path: &Utf8Path, contents: &str) -> Result<(), CommunicatorError> {
    let (parent, name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| key_file_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| key_file_error(parent, &err))?;
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(PRIVATE_FILE_MODE);
    let mut file = dir
        .open_with(name, &options)
        .map_err(|err| key_file_error(path, &err))?;
    file.write_all(contents.as_bytes())
        .map_err(|err| key_file_error(path, &err))
}

/// Creates an owner-only directory named `name` under `root`.
///
/// The directory is removed again when the returned guard drops.
fn private_key_dir(root: &Utf8Path, name: &str) -> Result<TempDir, CommunicatorError> {
    Dir::create_ambient_dir_all(root, ambient_authority())
        .map_err(|err| key_file_error(root, &err))?;
    let mut builder = tempfile::Builder::new();
    builder.prefix(name).rand_bytes(0);
    #[cfg(unix)]
    builder.permissions(std::fs::Permissions::from_mode(PRIVATE_DIR_MODE));
    builder
        .tempdir_in(root)
        .map_err(|err| key_file_error(&root.join(name), &err))
}

fn key_file_error(path: &Utf8Path, err: &std::io::Error) -> CommunicatorError {
    CommunicatorError::KeyFile {
        path: path.to_string(),
        message: err.to_string(),
    }
}
