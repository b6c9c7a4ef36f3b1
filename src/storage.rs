//! File transfer between host and device.

use std::path::Path;

use tracing::warn;

use crate::device::{Device, DeviceError};

/// Push, pull and remove files on a remote device.
pub struct DeviceStorage {
    device: Device,
}

impl DeviceStorage {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Location of external storage on the device.
    pub async fn external_storage_location(&self) -> Result<String, DeviceError> {
        let output = self
            .device
            .execute(["shell", "echo", "$EXTERNAL_STORAGE"])
            .await?;
        Ok(output.trim().to_string())
    }

    /// Push a local file to the given location on the device.
    pub async fn push(&self, local_path: &Path, remote_path: &str) -> Result<(), DeviceError> {
        if !local_path.is_file() {
            return Err(DeviceError::Command(crate::bridge::CommandError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {}", local_path.display()),
                ),
            )));
        }
        self.device
            .execute(["push", &local_path.display().to_string(), remote_path])
            .await?;
        Ok(())
    }

    /// Pull a file from the device. An existing local file is overwritten.
    pub async fn pull(&self, remote_path: &str, local_path: &Path) -> Result<(), DeviceError> {
        if local_path.exists() {
            warn!(
                "{} already exists and will be overwritten",
                local_path.display()
            );
        }
        self.device
            .execute(["pull", remote_path, &local_path.display().to_string()])
            .await?;
        Ok(())
    }

    /// Create a directory (and parents) on the device, optionally under
    /// another user.
    pub async fn make_dir(&self, path: &str, run_as: Option<&str>) -> Result<(), DeviceError> {
        match run_as {
            Some(user) => {
                self.device
                    .execute(["shell", "run-as", user, "mkdir", "-p", path])
                    .await?
            }
            None => self.device.execute(["shell", "mkdir", "-p", path]).await?,
        };
        Ok(())
    }

    /// Remove a file or directory from the device.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<(), DeviceError> {
        if recursive {
            self.device.execute(["shell", "rm", "-r", path]).await?;
        } else {
            self.device.execute(["shell", "rm", path]).await?;
        }
        Ok(())
    }
}
