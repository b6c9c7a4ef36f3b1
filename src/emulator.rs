//! Emulator lifecycle: launch, boot wait, restart, kill.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceHandle, DeviceState};

/// Ports emulators are allowed to listen on (even ports 5554 through 5584).
pub const PORTS: [u16; 16] = [
    5554, 5556, 5558, 5560, 5562, 5564, 5566, 5568, 5570, 5572, 5574, 5576, 5578, 5580, 5582, 5584,
];

fn default_boot_timeout() -> u64 {
    5 * 60
}

/// Bundle describing how to launch emulators: SDK location plus optional
/// overrides for the AVD directory, system image, kernel and ramdisk.
#[derive(Debug, Clone, Deserialize)]
pub struct EmulatorConfig {
    /// SDK root; must contain `platform-tools` and `emulator` dirs.
    pub sdk: PathBuf,
    /// AVD home directory, or `None` for the SDK default.
    #[serde(default)]
    pub avd_dir: Option<PathBuf>,
    /// System image override.
    #[serde(default)]
    pub system_img: Option<PathBuf>,
    /// Kernel override.
    #[serde(default)]
    pub kernel: Option<PathBuf>,
    /// Ramdisk override.
    #[serde(default)]
    pub ramdisk: Option<PathBuf>,
    /// Seconds to wait for a launched emulator to finish booting.
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
}

impl EmulatorConfig {
    pub fn new(sdk: impl Into<PathBuf>) -> Self {
        Self {
            sdk: sdk.into(),
            avd_dir: None,
            system_img: None,
            kernel: None,
            ramdisk: None,
            boot_timeout_secs: default_boot_timeout(),
        }
    }

    /// Path to the adb executable inside the bundle.
    pub fn adb_path(&self) -> PathBuf {
        self.sdk.join("platform-tools").join("adb")
    }

    /// Path to the emulator executable inside the bundle.
    pub fn emulator_path(&self) -> PathBuf {
        self.sdk.join("emulator").join("emulator")
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

/// Failure to bring an emulator to a fully booted state.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("port {port} is not an allowed emulator port")]
    InvalidPort { port: u16 },

    #[error("missing executable: {path}")]
    MissingExecutable { path: PathBuf },

    #[error("failed to start emulator on port {port}: {message}")]
    Failed { port: u16, message: String },

    #[error("timeout waiting for emulator on port {port} to boot")]
    Timeout { port: u16 },

    #[error("emulator on port {port} was started externally and cannot be restarted")]
    NotRestartable { port: u16 },
}

impl BootError {
    /// Port the failed emulator was assigned, when known.
    pub fn port(&self) -> u16 {
        match self {
            BootError::InvalidPort { port }
            | BootError::Failed { port, .. }
            | BootError::Timeout { port }
            | BootError::NotRestartable { port } => *port,
            BootError::MissingExecutable { .. } => 0,
        }
    }
}

struct EmulatorInner {
    port: u16,
    config: EmulatorConfig,
    // Recorded launch command and environment, for restarts. Absent when
    // the emulator was attached rather than launched by us.
    launch_cmd: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
}

/// A device that is specifically an emulator launched (or adopted) by this
/// process. Derefs to [`Device`] for all ordinary device operations.
#[derive(Clone)]
pub struct Emulator {
    device: Device,
    inner: Arc<EmulatorInner>,
}

impl Deref for Emulator {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("serial", &self.device.device_id())
            .field("port", &self.inner.port)
            .finish()
    }
}

impl Emulator {
    /// Adopt an already-running emulator at the given port.
    pub fn attached(port: u16, config: EmulatorConfig) -> Self {
        let device = Device::new(format!("emulator-{port}"), config.adb_path());
        Self {
            device,
            inner: Arc::new(EmulatorInner {
                port,
                config,
                launch_cmd: None,
                env: None,
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Launch an emulator on the given port and wait for it to fully boot.
    ///
    /// Any stale emulator already bound to the port is killed first. On a
    /// failed or timed-out boot the spawned process is killed before the
    /// error is returned.
    pub async fn launch(
        port: u16,
        avd: &str,
        config: EmulatorConfig,
        extra_args: &[String],
    ) -> Result<Self, BootError> {
        if !PORTS.contains(&port) {
            return Err(BootError::InvalidPort { port });
        }
        let emulator_cmd = config.emulator_path();
        if !emulator_cmd.is_file() {
            return Err(BootError::MissingExecutable { path: emulator_cmd });
        }
        let adb = config.adb_path();
        if !adb.is_file() {
            return Err(BootError::MissingExecutable { path: adb });
        }

        let device_id = format!("emulator-{port}");
        let device = Device::new(&device_id, config.adb_path());

        // Clear out any stale emulator occupying this port.
        if device.execute(["emu", "kill"]).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        let mut cmd: Vec<String> = vec![
            emulator_cmd.display().to_string(),
            "-avd".into(),
            avd.into(),
            "-port".into(),
            port.to_string(),
            "-read-only".into(),
        ];
        if let Some(img) = &config.system_img {
            cmd.push("-system".into());
            cmd.push(img.display().to_string());
        }
        if let Some(kernel) = &config.kernel {
            cmd.push("-kernel".into());
            cmd.push(kernel.display().to_string());
        }
        if let Some(ramdisk) = &config.ramdisk {
            cmd.push("-ramdisk".into());
            cmd.push(ramdisk.display().to_string());
        }
        cmd.extend(extra_args.iter().cloned());

        let mut env: HashMap<String, String> = std::env::vars().collect();
        if let Some(avd_dir) = &config.avd_dir {
            env.insert("ANDROID_AVD_HOME".into(), avd_dir.display().to_string());
        }
        env.insert("ANDROID_SDK_HOME".into(), config.sdk.display().to_string());

        info!("launching emulator on port {port}: {}", cmd.join(" "));
        let mut child = spawn_emulator(&cmd, &env).map_err(|e| BootError::Failed {
            port,
            message: e.to_string(),
        })?;

        let boot = wait_for_boot(&device, port, &mut child);
        match tokio::time::timeout(config.boot_timeout(), boot).await {
            Ok(Ok(())) => {
                info!("emulator {device_id} booted");
                Ok(Self {
                    device,
                    inner: Arc::new(EmulatorInner {
                        port,
                        config,
                        launch_cmd: Some(cmd),
                        env: Some(env),
                    }),
                })
            }
            Ok(Err(e)) => {
                child.kill().await.ok();
                Err(e)
            }
            Err(_) => {
                child.kill().await.ok();
                Err(BootError::Timeout { port })
            }
        }
    }

    /// Restart this emulator with the recorded launch command and wait for
    /// it to boot again.
    pub async fn restart(&self) -> Result<(), BootError> {
        let port = self.inner.port;
        let cmd = self
            .inner
            .launch_cmd
            .as_ref()
            .ok_or(BootError::NotRestartable { port })?;
        let env = self.inner.env.clone().unwrap_or_default();
        info!("restarting emulator {}", self.device.device_id());
        let mut child = spawn_emulator(cmd, &env).map_err(|e| BootError::Failed {
            port,
            message: e.to_string(),
        })?;
        let boot = wait_for_boot(&self.device, port, &mut child);
        match tokio::time::timeout(self.inner.config.boot_timeout(), boot).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                child.kill().await.ok();
                Err(e)
            }
            Err(_) => {
                child.kill().await.ok();
                Err(BootError::Timeout { port })
            }
        }
    }

    /// Kill this emulator.
    pub async fn kill(&self) {
        info!("killing emulator {}", self.device.device_id());
        if let Err(e) = self.device.execute(["emu", "kill"]).await {
            warn!("failed to kill emulator {} [{e}]", self.device.device_id());
        }
    }
}

impl DeviceHandle for Emulator {
    fn id(&self) -> &str {
        self.device.device_id()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn spawn_emulator(
    cmd: &[String],
    env: &HashMap<String, String>,
) -> std::io::Result<tokio::process::Child> {
    let mut command = tokio::process::Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.spawn()
}

/// Poll until the device is online and reports `sys.boot_completed`.
///
/// The caller bounds this with the configured boot timeout. An emulator
/// process that dies before coming online is surfaced with its output.
async fn wait_for_boot(
    device: &Device,
    port: u16,
    child: &mut tokio::process::Child,
) -> Result<(), BootError> {
    loop {
        if device.get_state().await == DeviceState::Online {
            break;
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut output = String::new();
            if let Some(mut stdout) = child.stdout.take() {
                stdout.read_to_string(&mut output).await.ok();
            }
            return Err(BootError::Failed {
                port,
                message: format!("process exited with {status}: {}", output.trim()),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    loop {
        let booted = device
            .get_system_property("sys.boot_completed")
            .await
            .as_deref()
            == Some("1");
        debug!("{} booted: {booted}", device.device_id());
        if booted {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_ports_are_even_and_bounded() {
        assert_eq!(PORTS.first(), Some(&5554));
        assert_eq!(PORTS.last(), Some(&5584));
        assert!(PORTS.iter().all(|p| p % 2 == 0));
        assert_eq!(PORTS.len(), 16);
    }

    #[tokio::test]
    async fn launch_rejects_disallowed_port() {
        let config = EmulatorConfig::new("/nonexistent/sdk");
        let err = Emulator::launch(5555, "avd1", config, &[]).await.unwrap_err();
        assert!(matches!(err, BootError::InvalidPort { port: 5555 }));
    }

    #[tokio::test]
    async fn launch_requires_emulator_executable() {
        let config = EmulatorConfig::new("/nonexistent/sdk");
        let err = Emulator::launch(5554, "avd1", config, &[]).await.unwrap_err();
        assert!(matches!(err, BootError::MissingExecutable { .. }));
    }

    #[tokio::test]
    async fn attached_emulator_cannot_restart() {
        let emulator = Emulator::attached(5556, EmulatorConfig::new("/sdk"));
        let err = emulator.restart().await.unwrap_err();
        assert!(matches!(err, BootError::NotRestartable { port: 5556 }));
    }

    #[test]
    fn config_paths_derive_from_sdk() {
        let config = EmulatorConfig::new("/opt/sdk");
        assert_eq!(config.adb_path(), PathBuf::from("/opt/sdk/platform-tools/adb"));
        assert_eq!(config.emulator_path(), PathBuf::from("/opt/sdk/emulator/emulator"));
    }
}
