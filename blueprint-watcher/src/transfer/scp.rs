use super::{ssh, RemoteTarget, Uploader};
use crate::utils::errors::TransferError;
use std::fs::File;
use std::path::Path;

/// Secure copy over SSH. The target directory is created with `mkdir -p`
/// through an exec channel, since scp itself cannot create directories.
pub struct ScpUploader {
    target: RemoteTarget,
}

impl ScpUploader {
    pub fn new(target: RemoteTarget) -> Result<Self, TransferError> {
        ssh::check_auth(&target)?;
        Ok(Self { target })
    }
}

impl Uploader for ScpUploader {
    fn protocol(&self) -> &'static str {
        "scp"
    }

    fn create_remote_dir(&self) -> Result<(), TransferError> {
        if self.target.is_login_dir() {
            return Ok(());
        }
        let session = ssh::connect(&self.target)?;
        ssh::exec(
            &session,
            &format!("mkdir -p {}", ssh::shell_quote(&self.target.directory)),
        )?;
        tracing::debug!("Ensured remote directory {}", self.target.directory);
        Ok(())
    }

    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransferError> {
        let session = ssh::connect(&self.target)?;
        let remote_path = self.target.remote_path(remote_name);

        let mut file = File::open(local)?;
        let size = file.metadata()?.len();
        let mut channel = session.scp_send(Path::new(&remote_path), 0o644, size, None)?;
        std::io::copy(&mut file, &mut channel)?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(remote_path)
    }
}
