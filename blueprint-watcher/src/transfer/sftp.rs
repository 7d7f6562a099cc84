use super::{dir_prefixes, ssh, RemoteTarget, Uploader};
use crate::utils::errors::TransferError;
use std::fs::File;
use std::path::Path;

/// SFTP over SSH.
pub struct SftpUploader {
    target: RemoteTarget,
}

impl SftpUploader {
    pub fn new(target: RemoteTarget) -> Result<Self, TransferError> {
        ssh::check_auth(&target)?;
        Ok(Self { target })
    }
}

impl Uploader for SftpUploader {
    fn protocol(&self) -> &'static str {
        "sftp"
    }

    fn create_remote_dir(&self) -> Result<(), TransferError> {
        let session = ssh::connect(&self.target)?;
        let sftp = session.sftp()?;
        for dir in dir_prefixes(&self.target.directory) {
            let path = Path::new(&dir);
            if sftp.stat(path).is_err() {
                sftp.mkdir(path, 0o755)?;
                tracing::debug!("Created remote directory {}", dir);
            }
        }
        Ok(())
    }

    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransferError> {
        let session = ssh::connect(&self.target)?;
        let sftp = session.sftp()?;
        let remote_path = self.target.remote_path(remote_name);

        let mut file = File::open(local)?;
        let mut remote = sftp.create(Path::new(&remote_path))?;
        std::io::copy(&mut file, &mut remote)?;
        Ok(remote_path)
    }
}
