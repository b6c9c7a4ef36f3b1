//! Remote device handle.
//!
//! A [`Device`] is a thin, cheaply-cloneable bridge to one attached device
//! or emulator, identified by its adb serial. It carries no concurrency
//! policy of its own except a per-device lock serializing operations that
//! must not overlap on one device (package installs).
//!
//! Identity properties (model, brand, manufacturer, API level) are fetched
//! lazily and cached for the lifetime of the handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::bridge::{AdbCommand, CommandError, ExecOutput, LineStream, LONG_CMD_TIMEOUT};

/// Errors from device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("insufficient storage on device {device_id}")]
    InsufficientStorage { device_id: String },

    #[error("package {package} not installed on {device_id} after reported success")]
    InstallNotVerified { device_id: String, package: String },
}

/// Connection state of a device as reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    NonExistent,
}

const ERROR_MSG_INSUFFICIENT_STORAGE: &str = "INSTALL_FAILED_INSUFFICIENT_STORAGE";

/// Settings keys that legitimately read back as absent before first write.
const ABSENT_OK_KEYS: &[&str] = &["location_providers_allowed"];

#[derive(Default)]
struct PropertyCache {
    model: Option<String>,
    brand: Option<String>,
    manufacturer: Option<String>,
    api_level: Option<u32>,
}

struct DeviceInner {
    serial: String,
    adb: PathBuf,
    props: Mutex<PropertyCache>,
    // Serializes mutating package-manager operations on this device.
    install_lock: AsyncMutex<()>,
}

/// Handle to one remote device reachable through the adb bridge.
///
/// Cloning is cheap and clones share the property cache and install lock.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.inner.serial)
            .finish()
    }
}

impl Device {
    /// Create a handle for the device with the given serial.
    ///
    /// `adb` is the path to the bridge executable used for every operation
    /// on this handle.
    pub fn new(serial: impl Into<String>, adb: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                serial: serial.into(),
                adb: adb.into(),
                props: Mutex::new(PropertyCache::default()),
                install_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Unique serial of this device as seen by the host.
    pub fn device_id(&self) -> &str {
        &self.inner.serial
    }

    /// Path to the bridge executable this handle uses.
    pub fn adb_path(&self) -> &Path {
        &self.inner.adb
    }

    /// Build a bridge command targeting this device.
    pub fn command<I, S>(&self, args: I) -> AdbCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AdbCommand::new(&self.inner.adb, Some(&self.inner.serial)).args(args)
    }

    /// Execute a command on this device, failing on a non-zero exit code
    /// and returning stdout.
    pub async fn execute<I, S>(&self, args: I) -> Result<String, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.command(args).exec_checked().await?)
    }

    /// Execute a command with an explicit timeout.
    pub async fn execute_with_timeout<I, S>(
        &self,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<String, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.command(args).timeout(timeout).exec_checked().await?)
    }

    /// Execute a command, returning the raw output without inspecting the
    /// exit code.
    pub async fn execute_unchecked<I, S>(&self, args: I) -> Result<ExecOutput, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.command(args).exec().await?)
    }

    /// Spawn a command on this device and stream its output line by line.
    pub fn stream<I, S>(&self, args: I) -> Result<LineStream, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.command(args).timeout(None).stream()?)
    }

    /// Current connection state of the device.
    pub async fn get_state(&self) -> DeviceState {
        match self.command(["get-state"]).exec().await {
            Ok(out) if out.success() => match out.stdout.trim() {
                "device" => DeviceState::Online,
                "offline" => DeviceState::Offline,
                "unauthorized" => DeviceState::Unauthorized,
                _ => DeviceState::NonExistent,
            },
            _ => DeviceState::NonExistent,
        }
    }

    // ---- system properties and settings ----

    /// Read a system property, or `None` if it does not exist or the read
    /// failed.
    pub async fn get_system_property(&self, key: &str) -> Option<String> {
        match self.execute(["shell", "getprop", key]).await {
            Ok(output) => {
                let value = output.trim().to_string();
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            Err(e) => {
                error!("unable to get system property {key} [{e}]");
                None
            }
        }
    }

    /// Write a system property, returning the previous value so the caller
    /// can restore it later.
    pub async fn set_system_property(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, DeviceError> {
        let previous = self.get_system_property(key).await;
        self.execute(["shell", "setprop", key, value]).await?;
        Ok(previous)
    }

    /// Read a device setting, or `None` if the namespace/key is unknown.
    pub async fn get_device_setting(&self, namespace: &str, key: &str) -> Option<String> {
        match self.execute(["shell", "settings", "get", namespace, key]).await {
            Ok(output) => {
                // Some devices report an invalid namespace with a clean exit code.
                if output.starts_with("Invalid namespace") {
                    return None;
                }
                let value = output.trim_end().to_string();
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            Err(e) => {
                error!("could not get setting for {namespace}:{key} [{e}]");
                None
            }
        }
    }

    /// Change a device setting, returning the previous value for later
    /// restoration.
    ///
    /// Writing an empty value requires the `""""` form to survive the shell
    /// quoting on the device side.
    pub async fn set_device_setting(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, DeviceError> {
        let value = if value.is_empty() || value == "\"\"" {
            "\"\"\"\""
        } else {
            value
        };
        let previous = self.get_device_setting(namespace, key).await;
        if previous.is_some() || ABSENT_OK_KEYS.contains(&key) {
            if let Err(e) = self
                .execute(["shell", "settings", "put", namespace, key, value])
                .await
            {
                error!("failed to set device setting {namespace}:{key}, ignoring [{e}]");
            }
        } else {
            warn!("unable to detect device setting {namespace}:{key}");
        }
        Ok(previous)
    }

    /// Full property dump (`getprop` with no key), parsed into a map.
    pub async fn get_device_properties(&self) -> Result<HashMap<String, String>, DeviceError> {
        let output = self.execute(["shell", "getprop"]).await?;
        let mut results = HashMap::new();
        for line in output.lines() {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                // keys are printed as [key]
                let name = name.trim_start_matches('[').trim_end_matches(']');
                results.insert(name.to_string(), value.trim().to_string());
            }
        }
        Ok(results)
    }

    /// Device locale, assembled from the legacy language/country properties
    /// with fallbacks to the newer single-property forms.
    pub async fn get_locale(&self) -> Option<String> {
        let lang = self
            .get_system_property("persist.sys.language")
            .await
            .unwrap_or_default();
        let country = self
            .get_system_property("persist.sys.country")
            .await
            .unwrap_or_default();
        if !lang.is_empty() && !country.is_empty() {
            return Some(format!("{}_{}", lang.trim(), country.trim()));
        }
        let locale = match self.get_system_property("persist.sys.locale").await {
            Some(l) => Some(l),
            None => self.get_system_property("ro.product.locale").await,
        };
        locale.map(|l| l.replace('-', "_").trim().to_string())
    }

    // ---- cached identity properties ----

    async fn determine_cached_property(
        &self,
        key: &str,
        read: impl Fn(&PropertyCache) -> Option<String>,
        write: impl Fn(&mut PropertyCache, String),
    ) -> String {
        if let Some(cached) = read(&self.inner.props.lock().expect("property cache poisoned")) {
            return cached;
        }
        let value = match self.get_system_property(key).await {
            Some(v) => v,
            None => {
                error!("unable to read {key} from device {}", self.device_id());
                "UNKNOWN".to_string()
            }
        };
        write(
            &mut self.inner.props.lock().expect("property cache poisoned"),
            value.clone(),
        );
        value
    }

    /// Device model, cached after first read ("UNKNOWN" if indeterminable).
    pub async fn model(&self) -> String {
        self.determine_cached_property(
            "ro.product.model",
            |c| c.model.clone(),
            |c, v| c.model = Some(v),
        )
        .await
    }

    /// Device brand, cached after first read.
    pub async fn brand(&self) -> String {
        self.determine_cached_property(
            "ro.product.brand",
            |c| c.brand.clone(),
            |c, v| c.brand = Some(v),
        )
        .await
    }

    /// Device manufacturer, cached after first read.
    pub async fn manufacturer(&self) -> String {
        self.determine_cached_property(
            "ro.product.manufacturer",
            |c| c.manufacturer.clone(),
            |c, v| c.manufacturer = Some(v),
        )
        .await
    }

    /// API level of the device, cached after first read.
    pub async fn api_level(&self) -> u32 {
        if let Some(level) = self.inner.props.lock().expect("property cache poisoned").api_level {
            return level;
        }
        let level = match self.get_system_property("ro.build.version.sdk").await {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("unparsable api level '{v}', assuming 28");
                28
            }),
            None => {
                warn!("unable to determine api level, assuming 28");
                28
            }
        };
        self.inner
            .props
            .lock()
            .expect("property cache poisoned")
            .api_level = Some(level);
        level
    }

    // ---- package management ----

    /// List installed package names.
    pub async fn list_installed_packages(&self) -> Result<Vec<String>, DeviceError> {
        let output = self.execute(["shell", "pm", "list", "package"]).await?;
        Ok(output
            .lines()
            .filter(|l| l.contains("package"))
            .map(|l| l.replace("package:", "").trim().to_string())
            .collect())
    }

    /// Install an application bundle, blocking until complete.
    ///
    /// Installs are serialized per device: overlapping package-manager
    /// operations on one device are unreliable.
    pub async fn install(&self, apk_path: &Path, as_upgrade: bool) -> Result<(), DeviceError> {
        let _guard = self.inner.install_lock.lock().await;
        let path = apk_path.display().to_string();
        let args: Vec<String> = if as_upgrade {
            vec!["install".into(), "-r".into(), path]
        } else {
            vec!["install".into(), path]
        };
        let result = self
            .command(args)
            .timeout(Some(LONG_CMD_TIMEOUT))
            .exec()
            .await?;
        if result.stdout.contains(ERROR_MSG_INSUFFICIENT_STORAGE)
            || result.stderr.contains(ERROR_MSG_INSUFFICIENT_STORAGE)
        {
            return Err(DeviceError::InsufficientStorage {
                device_id: self.device_id().to_string(),
            });
        }
        if !result.success() {
            return Err(DeviceError::Command(CommandError::Failed {
                command: format!("install {}", apk_path.display()),
                code: result.exit_code,
                message: result.stderr.trim().to_string(),
            }));
        }
        info!("installed {} on {}", apk_path.display(), self.device_id());
        Ok(())
    }

    /// Uninstall the given package.
    pub async fn uninstall(&self, package: &str) -> Result<(), DeviceError> {
        let _guard = self.inner.install_lock.lock().await;
        self.execute_with_timeout(["uninstall", package], Some(LONG_CMD_TIMEOUT))
            .await?;
        Ok(())
    }

    /// Grant a permission to a package. Returns `false` (without erroring)
    /// if the device rejected the grant.
    pub async fn grant_permission(&self, package: &str, permission: &str) -> bool {
        match self
            .execute(["shell", "pm", "grant", package, permission])
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("grant of {permission} to {package} failed [{e}]");
                false
            }
        }
    }

    /// Clear the given package's application data.
    pub async fn clear_app_data(&self, package: &str) -> Result<(), DeviceError> {
        self.execute(["shell", "pm", "clear", package]).await?;
        Ok(())
    }
}

/// Anything the pool can hold: a plain device or an emulator.
pub trait DeviceHandle: Send + Sync + 'static {
    /// Serial of the underlying device.
    fn id(&self) -> &str;

    /// The bridge handle for issuing commands.
    fn device(&self) -> &Device;
}

impl DeviceHandle for Device {
    fn id(&self) -> &str {
        self.device_id()
    }

    fn device(&self) -> &Device {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A shell script standing in for adb lets these tests exercise the
    // real command plumbing without a connected device.
    fn fake_adb(dir: &tempfile::TempDir, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("adb");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn get_system_property_trims_output() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(&dir, "echo '  1  '");
        let device = Device::new("serial1", adb);
        assert_eq!(device.get_system_property("sys.boot_completed").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn get_device_setting_rejects_invalid_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(&dir, "echo 'Invalid namespace bogus'");
        let device = Device::new("serial1", adb);
        assert!(device.get_device_setting("bogus", "key").await.is_none());
    }

    #[tokio::test]
    async fn identity_properties_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        // Count invocations through a side file; the cached second read
        // must not run the bridge again.
        let counter = dir.path().join("count");
        let adb = fake_adb(
            &dir,
            &format!("echo x >> {}; echo Pixel", counter.display()),
        );
        let device = Device::new("serial1", adb);
        assert_eq!(device.model().await, "Pixel");
        assert_eq!(device.model().await, "Pixel");
        let calls = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn api_level_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(&dir, "echo ''");
        let device = Device::new("serial1", adb);
        assert_eq!(device.api_level().await, 28);
    }

    #[tokio::test]
    async fn list_installed_packages_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(
            &dir,
            "printf 'package:com.example.app\\npackage:com.other\\n'",
        );
        let device = Device::new("serial1", adb);
        let packages = device.list_installed_packages().await.unwrap();
        assert_eq!(packages, vec!["com.example.app", "com.other"]);
    }

    #[tokio::test]
    async fn get_device_properties_parses_bracketed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let adb = fake_adb(
            &dir,
            "printf '[ro.product.model]: [Pixel 4]\\n[ro.build.version.sdk]: [29]\\n'",
        );
        let device = Device::new("serial1", adb);
        let props = device.get_device_properties().await.unwrap();
        assert_eq!(props.get("ro.product.model").unwrap(), "[Pixel 4]");
    }
}
