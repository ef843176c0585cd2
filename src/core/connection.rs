//! SSH transport to one remote host and the command runner built on it.
//!
//! libssh2 is blocking, so every call that touches the session runs on the
//! blocking pool. A `Connection` holds at most one session; each command gets
//! its own channel which is released when it drops, on every exit path.
//! Transfers never share a `Connection`: each opens its own transport.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh2::{Channel, ExtendedData, Session};
use tracing::{debug, info};

use crate::core::pipe::ProcessOutput;
use crate::error::{CommandError, Error, Result};

/// Seconds between transport keep-alive messages.
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Probe run before every command to pick the wrapping shell.
const BASH_PROBE: &str = "command -v bash >/dev/null 2>&1";

#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    15
}

impl SshConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            private_key: None,
            passphrase: None,
            password: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| crate::mask::MASK))
            .field("password", &self.password.as_ref().map(|_| crate::mask::MASK))
            .finish()
    }
}

/// Asks the operator for a private key passphrase.
pub trait PassphrasePrompt: Send + Sync {
    fn prompt(&self, key: &Path) -> io::Result<String>;
}

/// Reads the passphrase from stdin.
pub struct StdinPrompt;

impl PassphrasePrompt for StdinPrompt {
    fn prompt(&self, key: &Path) -> io::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "Enter passphrase for {}: ", key.display())?;
        stderr.flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Exit status and combined stdout/stderr of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Remote command execution, implemented by [`Connection`].
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and return its raw output whatever the exit status.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Run `command`, failing with a masked [`CommandError`] on non-zero exit.
    async fn run_command(&self, command: &str) -> Result<String> {
        let output = self.exec(command).await?;
        if output.success() {
            return Ok(output.output);
        }

        let err = CommandError::new(command, output.status, output.output);
        debug!(error = %err, "Remote command failed");
        Err(err.into())
    }
}

pub struct Connection {
    config: SshConfig,
    session: Option<Session>,
    prompt: Arc<dyn PassphrasePrompt>,
}

impl Connection {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            session: None,
            prompt: Arc::new(StdinPrompt),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PassphrasePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// The configuration, including a passphrase entered while connecting.
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn addr(&self) -> String {
        self.config.addr()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let prompt = self.prompt.clone();
        let (session, entered) =
            tokio::task::spawn_blocking(move || establish(&config, prompt.as_ref())).await??;

        if entered.is_some() {
            self.config.passphrase = entered;
        }
        self.session = Some(session);

        info!(addr = %self.addr(), user = %self.config.user, "Connected");
        Ok(())
    }

    /// Liveness probe through a full command round trip.
    pub async fn test_connection(&self) -> Result<()> {
        self.run_command("true").await.map(|_| ())
    }

    /// Transport-level keep-alive probe.
    pub async fn is_connected(&self) -> bool {
        let Some(session) = self.session.clone() else {
            return false;
        };

        tokio::task::spawn_blocking(move || session.keepalive_send().is_ok())
            .await
            .unwrap_or(false)
    }

    /// Start `cat <path>` on a fresh channel for streaming.
    pub async fn open_stream(&self, path: &str) -> Result<RemoteProcess> {
        let session = self.session()?.clone();
        let command = format!("cat {}", quote(path));

        tokio::task::spawn_blocking(move || {
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            Ok(RemoteProcess {
                channel,
                command,
                connection: None,
            })
        })
        .await?
    }

    /// Safe to call repeatedly and on a connection that never connected.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
            debug!(addr = %self.addr(), "Disconnected");
        }
    }

    pub(crate) fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::connection(self.addr(), "not connected"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RemoteShell for Connection {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let session = self.session()?.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let has_bash = run_channel(&session, BASH_PROBE)?.success();
            debug!(has_bash, "Probed remote shell");
            run_channel(&session, &wrap_command(&command, has_bash))
        })
        .await?
    }
}

fn establish(config: &SshConfig, prompt: &dyn PassphrasePrompt) -> Result<(Session, Option<String>)> {
    let addr = config.addr();
    if config.private_key.is_none() && config.password.is_none() {
        return Err(Error::AuthMethodMissing { addr });
    }

    let socket = addr
        .to_socket_addrs()
        .map_err(|e| Error::connection(&addr, format!("resolve: {e}")))?
        .next()
        .ok_or_else(|| Error::connection(&addr, "host did not resolve"))?;
    let tcp = TcpStream::connect_timeout(&socket, config.connect_timeout())
        .map_err(|e| Error::connection(&addr, format!("dial: {e}")))?;

    let mut session = Session::new().map_err(|e| Error::connection(&addr, e))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| Error::connection(&addr, format!("handshake: {e}")))?;
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);

    let mut entered = None;
    if let Some(key) = &config.private_key {
        let key = expand_home(key);
        let passphrase = match &config.passphrase {
            Some(passphrase) => Some(passphrase.clone()),
            None if key_is_encrypted(&key) => {
                let passphrase = prompt
                    .prompt(&key)
                    .map_err(|e| Error::connection(&addr, format!("reading passphrase: {e}")))?;
                entered = Some(passphrase.clone());
                Some(passphrase)
            }
            None => None,
        };

        session
            .userauth_pubkey_file(&config.user, None, &key, passphrase.as_deref())
            .map_err(|e| Error::connection(&addr, format!("key authentication: {e}")))?;
    } else if let Some(password) = &config.password {
        session
            .userauth_password(&config.user, password)
            .map_err(|e| Error::connection(&addr, format!("password authentication: {e}")))?;
    }

    if !session.authenticated() {
        return Err(Error::connection(&addr, "authentication rejected"));
    }

    Ok((session, entered))
}

/// Run one command on its own channel, stderr merged into stdout.
fn run_channel(session: &Session, command: &str) -> Result<CommandOutput> {
    let mut channel = session.channel_session()?;
    channel.handle_extended_data(ExtendedData::Merge)?;
    channel.exec(command)?;

    let mut raw = Vec::new();
    let read = channel.read_to_end(&mut raw);
    channel.wait_close()?;
    read?;

    Ok(CommandOutput {
        status: channel.exit_status()?,
        output: String::from_utf8_lossy(&raw).into_owned(),
    })
}

/// Wrap `command` so a failure anywhere in a pipeline fails the whole command
/// and its exit status is the one reported.
pub fn wrap_command(command: &str, has_bash: bool) -> String {
    if has_bash {
        format!("bash -c {}", quote(&format!("set -o pipefail; {command}")))
    } else {
        format!(
            "sh -c {}",
            quote(&format!(
                "if (set -o pipefail) 2>/dev/null; then set -o pipefail; fi; {command}"
            ))
        )
    }
}

/// Quote a single word for a POSIX shell.
pub fn quote(word: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(word)).into_owned()
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn key_is_encrypted(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };

    // Legacy PEM and PKCS#8 mark encryption in the armor.
    if contents.contains("ENCRYPTED") {
        return true;
    }

    ssh_key::PrivateKey::from_openssh(&contents)
        .map(|key| key.is_encrypted())
        .unwrap_or(false)
}

/// A `cat` of a remote file, read by the pipe bridge.
pub struct RemoteProcess {
    channel: Channel,
    command: String,
    connection: Option<Connection>,
}

impl RemoteProcess {
    /// Keep `connection` alive for as long as the stream is and close it
    /// with the stream.
    pub fn owning(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Read for RemoteProcess {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl ProcessOutput for RemoteProcess {
    fn finish(&mut self) -> Result<()> {
        let mut stderr = String::new();
        let _ = self.channel.stderr().read_to_string(&mut stderr);

        let closed = self.channel.wait_close();
        let status = closed.and_then(|_| self.channel.exit_status());
        self.release();

        match status? {
            0 => Ok(()),
            status => Err(CommandError::new(&self.command, status, stderr).into()),
        }
    }

    fn abort(&mut self) {
        let _ = self.channel.close();
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_with_bash_pipefail() {
        assert_eq!(
            wrap_command("mysqldump app | gzip > /tmp/a.gz", true),
            "bash -c 'set -o pipefail; mysqldump app | gzip > /tmp/a.gz'"
        );
    }

    #[test]
    fn falls_back_to_posix_sh() {
        let wrapped = wrap_command("pg_dump app | gzip", false);
        assert!(wrapped.starts_with("sh -c '"));
        assert!(wrapped.contains("then set -o pipefail; fi; pg_dump app | gzip"));
    }

    #[test]
    fn posix_fallback_runs_the_command_under_local_sh() {
        let wrapped = wrap_command("echo ran; exit 3", false);
        let output = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&wrapped)
            .output()
            .unwrap();

        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ran");
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn wrapping_keeps_single_quotes_intact() {
        let wrapped = wrap_command("echo 'hi'", true);
        assert_eq!(wrapped, r#"bash -c 'set -o pipefail; echo '\''hi'\'''"#);
    }

    #[test]
    fn quotes_paths_with_spaces() {
        assert_eq!(quote("/tmp/my dump.sql"), "'/tmp/my dump.sql'");
        assert_eq!(quote("/tmp/plain.sql"), "/tmp/plain.sql");
    }

    #[tokio::test]
    async fn missing_auth_is_not_connection_class() {
        let mut connection = Connection::new(SshConfig::new("127.0.0.1", "backup"));
        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, Error::AuthMethodMissing { .. }));
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn close_is_idempotent_without_connecting() {
        let mut connection = Connection::new(SshConfig::new("127.0.0.1", "backup"));
        connection.close();
        connection.close();
        assert!(!connection.is_connected().await);
    }

    #[tokio::test]
    async fn commands_fail_when_not_connected() {
        let connection = Connection::new(SshConfig::new("127.0.0.1", "backup"));
        let err = connection.run_command("true").await.unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = SshConfig::new("db", "backup");
        config.password = Some("hunter2".into());
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn unreadable_key_is_not_encrypted() {
        assert!(!key_is_encrypted(Path::new("/nonexistent/id_ed25519")));
    }
}
