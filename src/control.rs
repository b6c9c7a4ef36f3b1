//! Host side of the device control protocol.
//!
//! An on-device helper service publishes commands through the device log
//! as `<id> <COMMAND>: <payload>` lines under a dedicated tag. The
//! [`ControlCommandHandler`] executes each command against the device and
//! acknowledges it by starting the service with a `(id, code, message)`
//! response extra. Changes made on behalf of tests are reported to a
//! [`DeviceChangeListener`] so they can be undone afterwards, which is
//! what [`DeviceRestoration`] does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::device::{Device, DeviceError};
use crate::logcat::TagHandler;

pub const CMD_SETTING: &str = "TEST_BUTLER_SETTING";
pub const CMD_PROPERTY: &str = "TEST_BUTLER_PROPERTY";
pub const CMD_GRANT: &str = "TEST_BUTLER_GRANT";

pub const RESPONSE_OK: i32 = 0;
pub const RESPONSE_ERROR: i32 = 1;
/// Must match the code the on-device service maps to an assumption
/// violation.
pub const RESPONSE_ASSUMPTION_VIOLATION: i32 = 4;

const RESPONSE_INTENT: &str = "com.linkedin.android.testbutler.COMMAND_RESPONSE";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("malformed control command: '{line}'")]
    Malformed { line: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Observes device state changes made through control commands.
pub trait DeviceChangeListener: Send + Sync {
    fn device_setting_changed(&self, namespace: &str, key: &str, previous: Option<&str>, new: &str);

    fn device_property_changed(&self, key: &str, previous: Option<&str>, new: &str);
}

#[derive(Deserialize)]
struct GrantRequest {
    #[serde(rename = "type")]
    kind: String,
    package: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

/// Executes control commands arriving over the device log.
pub struct ControlCommandHandler {
    device: Device,
    /// Package of the on-device service that issued the commands and
    /// receives the responses.
    service_package: String,
    /// Package of the application under test, the target for grants.
    app_package: String,
    listener: Option<Arc<dyn DeviceChangeListener>>,
}

impl ControlCommandHandler {
    pub fn new(
        device: Device,
        service_package: impl Into<String>,
        app_package: impl Into<String>,
        listener: Option<Arc<dyn DeviceChangeListener>>,
    ) -> Self {
        Self {
            device,
            service_package: service_package.into(),
            app_package: app_package.into(),
            listener,
        }
    }

    /// Start the on-device service in the foreground so it begins
    /// publishing commands.
    pub async fn start_service(&self) -> Result<(), DeviceError> {
        self.device
            .execute([
                "shell",
                "am",
                "startservice",
                "-n",
                &format!("{}/.ButlerService", self.service_package),
            ])
            .await?;
        Ok(())
    }

    /// Handle one command message (already stripped of the log envelope)
    /// and send the response. Malformed messages are logged and dropped;
    /// the protocol has no way to address a response for them.
    pub async fn process_message(&self, message: &str) {
        let parsed = (|| {
            let (command_and_id, payload) = message.trim().split_once(':')?;
            let (id, command) = command_and_id.trim().split_once(' ')?;
            let id: i64 = id.trim().parse().ok()?;
            Some((id, command.trim().to_string(), payload.trim().to_string()))
        })();
        let Some((id, command, payload)) = parsed else {
            error!("unexpected format for control command: '{message}'");
            return;
        };

        let (code, response) = match command.as_str() {
            CMD_SETTING => self.process_setting(&payload).await,
            CMD_PROPERTY => self.process_property(&payload).await,
            CMD_GRANT => self.process_grant(&payload).await,
            other => {
                error!("unknown control command received: {other}");
                (RESPONSE_ERROR, "Unknown command".to_string())
            }
        };
        if code != RESPONSE_OK {
            error!("control command '{command}' failed with {code}: {response}");
        }
        self.send_response(id, code, &response).await;
    }

    async fn send_response(&self, id: i64, code: i32, message: &str) {
        let extra = format!("\"{id},{code},{message}\"");
        let result = self
            .device
            .execute([
                "shell",
                "am",
                "startservice",
                "-a",
                RESPONSE_INTENT,
                "-n",
                &format!("{}/.ButlerService", self.service_package),
                "--es",
                "response",
                &extra,
            ])
            .await;
        if let Err(e) = result {
            error!("failed to send response for command {id} [{e}]");
        }
    }

    /// `<namespace> <key> <value>` setting change with verification.
    ///
    /// A `+`/`-` value prefix means add-to / remove-from a multi-valued
    /// setting; an unsupported `+` value yields the assumption-violation
    /// code rather than a plain failure, so the test is skipped instead
    /// of failed.
    async fn process_setting(&self, payload: &str) -> (i32, String) {
        let mut parts = payload.splitn(3, ' ');
        let (Some(namespace), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            return (
                RESPONSE_ERROR,
                format!("Missing namespace, key or value in command: {payload}"),
            );
        };
        let previous = match self.device.set_device_setting(namespace, key, value).await {
            Ok(previous) => previous,
            Err(e) => return (RESPONSE_ERROR, format!("Failed to change setting: {e}")),
        };
        let Some(previous) = previous else {
            return (
                RESPONSE_ERROR,
                format!("Setting command '{payload}' failed"),
            );
        };
        let new_value = self
            .device
            .get_device_setting(namespace, key)
            .await
            .unwrap_or_default();

        if let Some(added) = value.strip_prefix('+') {
            if !new_value.contains(added) {
                return (
                    RESPONSE_ASSUMPTION_VIOLATION,
                    format!("Setting of {namespace}:{key} to {value} not supported on this device"),
                );
            }
            return (RESPONSE_OK, "Success".to_string());
        }
        if let Some(removed) = value.strip_prefix('-') {
            if new_value.contains(removed) {
                return (
                    RESPONSE_ERROR,
                    format!("Unable to remove from setting: {value}"),
                );
            }
            return (RESPONSE_OK, "Success".to_string());
        }
        if new_value.replace('"', "") != value.replace('\\', "").replace('"', "") {
            return (
                RESPONSE_ERROR,
                format!(
                    "Expected setting {namespace}:{key} to be '{value}' but device reported '{new_value}'"
                ),
            );
        }
        if previous != "null" {
            if let Some(listener) = &self.listener {
                listener.device_setting_changed(namespace, key, Some(&previous), value);
            }
        }
        debug!("setting {namespace}:{key} changed to {value}");
        (RESPONSE_OK, "Success".to_string())
    }

    /// `<key> <value>` system property change, write-then-verify.
    async fn process_property(&self, payload: &str) -> (i32, String) {
        let items: Vec<&str> = payload.split(' ').collect();
        if items.len() < 2 {
            return (
                RESPONSE_ERROR,
                format!("Not enough arguments to set a property: {payload}"),
            );
        }
        let key = items[items.len() - 2];
        let value = items[items.len() - 1];
        let previous = match self.device.set_system_property(key, value).await {
            Ok(previous) => previous,
            Err(e) => return (RESPONSE_ERROR, format!("Failed to set property: {e}")),
        };
        if let Some(listener) = &self.listener {
            listener.device_property_changed(key, previous.as_deref(), value);
        }
        if previous.is_none() && key != "location_providers_allowed" {
            return (
                RESPONSE_ERROR,
                format!("Property command '{payload}' failed"),
            );
        }
        let new_value = self.device.get_system_property(key).await;
        if new_value.as_deref() != Some(value) {
            return (
                RESPONSE_ERROR,
                format!(
                    "Expected property {key} to be {value} but found {}",
                    new_value.unwrap_or_default()
                ),
            );
        }
        (RESPONSE_OK, "Success".to_string())
    }

    /// JSON grant request for the application under test.
    async fn process_grant(&self, payload: &str) -> (i32, String) {
        let request: GrantRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("invalid grant request json: {payload} [{e}]");
                return (RESPONSE_ERROR, "Invalid json in request".to_string());
            }
        };
        if request.kind != "permission" {
            return (
                RESPONSE_ERROR,
                format!("Unexpected grant request type '{}'", request.kind),
            );
        }
        let Some(package) = request.package.as_deref().filter(|p| !p.is_empty()) else {
            return (
                RESPONSE_ERROR,
                format!("Missing package for grant request: {payload}"),
            );
        };
        if package != self.app_package {
            warn!("grant request targets {package}, not the application under test");
        }
        if request.permissions.is_empty() {
            return (
                RESPONSE_ERROR,
                format!("Missing permissions for grant request: {payload}"),
            );
        }
        for permission in &request.permissions {
            if !self.device.grant_permission(package, permission).await {
                return (
                    RESPONSE_ERROR,
                    "Failed to grant requested permission(s)".to_string(),
                );
            }
        }
        (RESPONSE_OK, "Success".to_string())
    }
}

#[async_trait]
impl TagHandler for ControlCommandHandler {
    async fn handle_line(&self, _tag: &str, priority: char, message: &str) {
        // Commands are published at informational priority only.
        if priority != 'I' {
            return;
        }
        self.process_message(message).await;
    }
}

/// Records the original value of every setting and property changed during
/// a run, and puts them back afterwards.
///
/// Only the first change to a key is recorded; if a later change returns
/// the key to its original value, the record is dropped since there is
/// nothing left to restore.
#[derive(Default)]
pub struct DeviceRestoration {
    settings: Mutex<HashMap<(String, String), String>>,
    properties: Mutex<HashMap<String, String>>,
}

impl DeviceRestoration {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing needs restoring.
    pub fn is_empty(&self) -> bool {
        self.settings.lock().expect("restoration lock poisoned").is_empty()
            && self.properties.lock().expect("restoration lock poisoned").is_empty()
    }

    /// Put every recorded setting and property back to its original value.
    /// Best effort: individual failures are logged and skipped so one bad
    /// key cannot block the rest of the restoration.
    pub async fn restore(&self, device: &Device) {
        let settings: Vec<((String, String), String)> = {
            let mut map = self.settings.lock().expect("restoration lock poisoned");
            map.drain().collect()
        };
        for ((namespace, key), original) in settings {
            if let Err(e) = device.set_device_setting(&namespace, &key, &original).await {
                warn!("failed to restore setting {namespace}:{key} [{e}]");
            }
        }
        let properties: Vec<(String, String)> = {
            let mut map = self.properties.lock().expect("restoration lock poisoned");
            map.drain().collect()
        };
        for (key, original) in properties {
            if let Err(e) = device.set_system_property(&key, &original).await {
                warn!("failed to restore property {key} [{e}]");
            }
        }
    }
}

impl DeviceChangeListener for DeviceRestoration {
    fn device_setting_changed(
        &self,
        namespace: &str,
        key: &str,
        previous: Option<&str>,
        new: &str,
    ) {
        let mut settings = self.settings.lock().expect("restoration lock poisoned");
        let entry = (namespace.to_string(), key.to_string());
        match settings.get(&entry) {
            None => {
                settings.insert(entry, previous.unwrap_or_default().to_string());
            }
            Some(original) if original == new => {
                // Back at the original value; nothing to restore anymore.
                settings.remove(&entry);
            }
            Some(_) => {}
        }
    }

    fn device_property_changed(&self, key: &str, previous: Option<&str>, new: &str) {
        let mut properties = self.properties.lock().expect("restoration lock poisoned");
        match properties.get(key) {
            None => {
                properties.insert(key.to_string(), previous.unwrap_or_default().to_string());
            }
            Some(original) if original == new => {
                properties.remove(key);
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    // A shell script standing in for adb, with settings/properties stored
    // as files so commands have observable effects.
    fn fake_adb(dir: &tempfile::TempDir) -> PathBuf {
        let state = dir.path().display().to_string();
        let script = format!(
            r#"#!/bin/sh
shift 2
dir="{state}"
case "$*" in
  "shell settings get "*) cat "$dir/setting_${{4}}_${{5}}" 2>/dev/null || true ;;
  "shell settings put frozen "*) : ;;
  "shell settings put "*)
    store="$dir/setting_${{4}}_${{5}}"
    current=$(cat "$store" 2>/dev/null || true)
    # The settings provider interprets +value / -value on multi-valued keys.
    case "$6" in
      +*) printf '%s\n' "$current,${{6#+}}" | sed 's/^,//' > "$store" ;;
      -*) printf '%s\n' "$current" | sed -e "s/${{6#-}}//" -e 's/,,/,/' -e 's/^,//' -e 's/,$//' > "$store" ;;
      *) printf '%s\n' "$6" > "$store" ;;
    esac ;;
  "shell getprop "*) cat "$dir/prop_$3" 2>/dev/null || true ;;
  "shell setprop "*) printf '%s\n' "$4" > "$dir/prop_$3" ;;
  "shell pm grant "*) echo "$4 $5" >> "$dir/grants" ;;
  "shell am startservice "*) echo "$*" >> "$dir/responses" ;;
esac
exit 0
"#
        );
        let path = dir.path().join("adb");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn seed_setting(dir: &tempfile::TempDir, namespace: &str, key: &str, value: &str) {
        std::fs::write(dir.path().join(format!("setting_{namespace}_{key}")), format!("{value}\n"))
            .unwrap();
    }

    fn responses(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("responses")).unwrap_or_default()
    }

    fn handler_with_restoration(
        dir: &tempfile::TempDir,
    ) -> (ControlCommandHandler, Arc<DeviceRestoration>) {
        let device = Device::new("serial1", fake_adb(dir));
        let restoration = Arc::new(DeviceRestoration::new());
        let handler = ControlCommandHandler::new(
            device,
            "com.example.butler",
            "com.example.app",
            Some(Arc::clone(&restoration) as Arc<dyn DeviceChangeListener>),
        );
        (handler, restoration)
    }

    #[tokio::test]
    async fn setting_command_applies_verifies_and_responds() {
        let dir = tempfile::tempdir().unwrap();
        seed_setting(&dir, "global", "animator", "1");
        let (handler, restoration) = handler_with_restoration(&dir);

        handler
            .process_message("7 TEST_BUTLER_SETTING: global animator 0")
            .await;

        let stored = std::fs::read_to_string(dir.path().join("setting_global_animator")).unwrap();
        assert_eq!(stored.trim(), "0");
        assert!(responses(&dir).contains("\"7,0,Success\""));
        // The original value was captured for restoration.
        assert!(!restoration.is_empty());
    }

    #[tokio::test]
    async fn unsupported_additive_setting_yields_assumption_violation() {
        let dir = tempfile::tempdir().unwrap();
        // "frozen" namespace ignores puts, so the added value never shows up.
        seed_setting(&dir, "frozen", "providers", "network");
        let (handler, _) = handler_with_restoration(&dir);

        handler
            .process_message("3 TEST_BUTLER_SETTING: frozen providers +gps")
            .await;

        assert!(responses(&dir).contains("\"3,4,"));
    }

    #[tokio::test]
    async fn subtractive_setting_succeeds_when_value_absent() {
        let dir = tempfile::tempdir().unwrap();
        seed_setting(&dir, "secure", "providers", "network");
        let (handler, _) = handler_with_restoration(&dir);

        handler
            .process_message("4 TEST_BUTLER_SETTING: secure providers -gps")
            .await;

        assert!(responses(&dir).contains("\"4,0,Success\""));
    }

    #[tokio::test]
    async fn subtractive_setting_removes_value_from_multi_valued_key() {
        let dir = tempfile::tempdir().unwrap();
        seed_setting(&dir, "secure", "providers", "network,gps");
        let (handler, _) = handler_with_restoration(&dir);

        handler
            .process_message("6 TEST_BUTLER_SETTING: secure providers -gps")
            .await;

        assert!(responses(&dir).contains("\"6,0,Success\""));
        let stored = std::fs::read_to_string(dir.path().join("setting_secure_providers")).unwrap();
        assert_eq!(stored.trim(), "network");
    }

    #[tokio::test]
    async fn property_command_verifies_written_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prop_debug.flag"), "off\n").unwrap();
        let (handler, restoration) = handler_with_restoration(&dir);

        handler
            .process_message("9 TEST_BUTLER_PROPERTY: debug.flag on")
            .await;

        assert!(responses(&dir).contains("\"9,0,Success\""));
        assert!(!restoration.is_empty());
    }

    #[tokio::test]
    async fn grant_command_grants_each_permission() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = handler_with_restoration(&dir);

        let payload = r#"{"type": "permission", "package": "com.example.app", "permissions": ["android.permission.CAMERA", "android.permission.RECORD_AUDIO"]}"#;
        handler
            .process_message(&format!("11 TEST_BUTLER_GRANT: {payload}"))
            .await;

        let grants = std::fs::read_to_string(dir.path().join("grants")).unwrap();
        assert!(grants.contains("com.example.app android.permission.CAMERA"));
        assert!(grants.contains("com.example.app android.permission.RECORD_AUDIO"));
        assert!(responses(&dir).contains("\"11,0,Success\""));
    }

    #[tokio::test]
    async fn malformed_grant_json_is_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = handler_with_restoration(&dir);
        handler
            .process_message("2 TEST_BUTLER_GRANT: {not json")
            .await;
        assert!(responses(&dir).contains("\"2,1,Invalid json in request\""));
    }

    #[tokio::test]
    async fn unknown_command_is_acknowledged_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = handler_with_restoration(&dir);
        handler.process_message("5 TEST_BUTLER_REBOOT: now").await;
        assert!(responses(&dir).contains("\"5,1,Unknown command\""));
    }

    #[tokio::test]
    async fn non_informational_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = handler_with_restoration(&dir);
        handler
            .handle_line("TestButler", 'W', "5 TEST_BUTLER_SETTING: global animator 0")
            .await;
        assert_eq!(responses(&dir), "");
    }

    #[test]
    fn restoration_drops_record_when_value_returns_to_original() {
        let restoration = DeviceRestoration::new();
        restoration.device_setting_changed("global", "animator", Some("A"), "B");
        assert!(!restoration.is_empty());
        // Changed back to the original: nothing left to restore.
        restoration.device_setting_changed("global", "animator", Some("B"), "A");
        assert!(restoration.is_empty());
    }

    #[test]
    fn restoration_keeps_first_original_across_multiple_changes() {
        let restoration = DeviceRestoration::new();
        restoration.device_property_changed("debug.flag", Some("A"), "B");
        restoration.device_property_changed("debug.flag", Some("B"), "C");
        // Still tracking the first original, A.
        assert!(!restoration.is_empty());
        restoration.device_property_changed("debug.flag", Some("C"), "A");
        assert!(restoration.is_empty());
    }

    #[tokio::test]
    async fn restore_writes_back_original_values_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        seed_setting(&dir, "global", "animator", "0");
        std::fs::write(dir.path().join("prop_debug.flag"), "on\n").unwrap();
        let device = Device::new("serial1", fake_adb(&dir));

        let restoration = DeviceRestoration::new();
        restoration.device_setting_changed("global", "animator", Some("1"), "0");
        restoration.device_property_changed("debug.flag", Some("off"), "on");

        restoration.restore(&device).await;
        assert!(restoration.is_empty());
        let setting = std::fs::read_to_string(dir.path().join("setting_global_animator")).unwrap();
        assert_eq!(setting.trim(), "1");
        let prop = std::fs::read_to_string(dir.path().join("prop_debug.flag")).unwrap();
        assert_eq!(prop.trim(), "off");
    }
}
