//! SSH session setup shared by the scp and sftp uploaders.

use super::RemoteTarget;
use crate::utils::errors::TransferError;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};

/// Reject targets that could never authenticate.
pub(super) fn check_auth(target: &RemoteTarget) -> Result<(), TransferError> {
    target.username()?;
    let creds = &target.credentials;
    if creds.ssh_key_path.is_none() && creds.password.is_none() {
        return Err(TransferError::Config(
            "SSH transfer needs SSH_KEY_PATH or REMOTE_PASSWORD".into(),
        ));
    }
    Ok(())
}

/// Open an authenticated session. Key auth is preferred when a key is set.
pub(super) fn connect(target: &RemoteTarget) -> Result<Session, TransferError> {
    let connect_error = |reason: String| TransferError::Connect {
        host: target.host.clone(),
        port: target.port,
        reason,
    };

    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connect_error(e.to_string()))?
        .next()
        .ok_or_else(|| connect_error("host did not resolve".into()))?;
    let tcp = TcpStream::connect_timeout(&addr, target.timeout)
        .map_err(|e| connect_error(e.to_string()))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(target.timeout.as_millis()).unwrap_or(u32::MAX));
    session
        .handshake()
        .map_err(|e| connect_error(format!("SSH handshake failed: {}", e)))?;

    let username = target.username()?;
    let creds = &target.credentials;
    if let Some(key) = &creds.ssh_key_path {
        session.userauth_pubkey_file(username, None, key, creds.ssh_key_passphrase.as_deref())?;
    } else if let Some(password) = &creds.password {
        session.userauth_password(username, password)?;
    }

    if !session.authenticated() {
        return Err(connect_error("SSH authentication failed".into()));
    }
    Ok(session)
}

/// Run a command and fail on non-zero exit.
pub(super) fn exec(session: &Session, command: &str) -> Result<String, TransferError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;
    channel.wait_close()?;

    let status = channel.exit_status()?;
    if status != 0 {
        return Err(TransferError::Io(std::io::Error::other(format!(
            "remote command `{}` exited with {}: {}",
            command,
            status,
            stderr.trim()
        ))));
    }
    Ok(stdout)
}

pub(super) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
