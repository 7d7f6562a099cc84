use super::{RemoteTarget, Uploader};
use crate::utils::errors::TransferError;
use std::fs::File;
use std::net::ToSocketAddrs;
use std::path::Path;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

/// Plain FTP in binary mode. Needs a username and password.
pub struct FtpUploader {
    target: RemoteTarget,
}

impl FtpUploader {
    pub fn new(target: RemoteTarget) -> Result<Self, TransferError> {
        target.username()?;
        if target.credentials.password.is_none() {
            return Err(TransferError::Config("FTP transfer needs REMOTE_PASSWORD".into()));
        }
        Ok(Self { target })
    }

    fn connect(&self) -> Result<FtpStream, TransferError> {
        let connect_error = |reason: String| TransferError::Connect {
            host: self.target.host.clone(),
            port: self.target.port,
            reason,
        };
        let addr = (self.target.host.as_str(), self.target.port)
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?
            .next()
            .ok_or_else(|| connect_error("host did not resolve".into()))?;

        let mut ftp = FtpStream::connect_timeout(addr, self.target.timeout)
            .map_err(|e| connect_error(e.to_string()))?;
        let password = self.target.credentials.password.as_deref().unwrap_or_default();
        ftp.login(self.target.username()?, password)?;
        ftp.transfer_type(FileType::Binary)?;
        Ok(ftp)
    }

    /// Walk into the target directory from the login directory.
    fn enter_directory(&self, ftp: &mut FtpStream, create: bool) -> Result<(), TransferError> {
        if self.target.is_login_dir() {
            return Ok(());
        }
        if self.target.directory.starts_with('/') {
            ftp.cwd("/")?;
        }
        for part in self.target.directory.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if ftp.cwd(part).is_err() {
                if !create {
                    return Err(TransferError::Ftp(format!(
                        "remote directory {} does not exist",
                        self.target.directory
                    )));
                }
                ftp.mkdir(part)?;
                ftp.cwd(part)?;
                tracing::debug!("Created remote directory component {}", part);
            }
        }
        Ok(())
    }
}

impl Uploader for FtpUploader {
    fn protocol(&self) -> &'static str {
        "ftp"
    }

    fn create_remote_dir(&self) -> Result<(), TransferError> {
        let mut ftp = self.connect()?;
        let result = self.enter_directory(&mut ftp, true);
        let _ = ftp.quit();
        result
    }

    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransferError> {
        let mut ftp = self.connect()?;
        let result = self.enter_directory(&mut ftp, false).and_then(|()| {
            let mut file = File::open(local)?;
            ftp.put_file(remote_name, &mut file)?;
            Ok(self.target.remote_path(remote_name))
        });
        let _ = ftp.quit();
        result
    }
}
