//! Bounded pool of devices with scoped reservation.
//!
//! A [`DevicePool`] holds a fixed roster of device handles. Callers
//! [`reserve`](DevicePool::reserve) a handle, use it, and get guaranteed
//! return-to-pool when the [`Reservation`] guard drops, on success, error,
//! panic, or task cancellation alike.
//!
//! Pools are populated either by discovering devices already attached to
//! the bridge or by launching a fleet of emulators, staggered and with a
//! bounded per-port retry.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::AdbCommand;
use crate::device::{Device, DeviceHandle};
use crate::emulator::{BootError, Emulator, EmulatorConfig, PORTS};

/// Per-port bound on emulator boot attempts (initial launch plus retries).
pub const MAX_BOOT_RETRIES: u32 = 2;

/// Delay between successive emulator launches. Launching all at once is a
/// known source of boot instability.
const LAUNCH_STAGGER: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no devices discovered")]
    NoDevices,

    #[error("failed to boot any emulator")]
    NoEmulatorsBooted,

    #[error("requested {requested} devices but pool capacity is {capacity}")]
    OverCapacity { requested: usize, capacity: usize },

    #[error("lease expired for {device_id}")]
    LeaseExpired { device_id: String },

    #[error(transparent)]
    Command(#[from] crate::bridge::CommandError),
}

struct PoolInner<D> {
    available: Mutex<VecDeque<D>>,
    semaphore: Semaphore,
    // Every handle ever added, reserved or not. Used for fleet-wide
    // teardown.
    roster: Vec<D>,
    max_lease: Option<Duration>,
}

/// Fixed-roster device pool with semaphore-backed blocking reservation.
pub struct DevicePool<D> {
    inner: Arc<PoolInner<D>>,
}

impl<D> Clone for DevicePool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DeviceHandle + Clone> DevicePool<D> {
    /// Create a pool over the given handles. `max_lease` bounds how long a
    /// single reservation stays valid; `None` means reservations never
    /// expire.
    pub fn new(devices: Vec<D>, max_lease: Option<Duration>) -> Self {
        let count = devices.len();
        Self {
            inner: Arc::new(PoolInner {
                available: Mutex::new(devices.iter().cloned().collect()),
                semaphore: Semaphore::new(count),
                roster: devices,
                max_lease,
            }),
        }
    }

    /// Total number of devices managed by the pool.
    pub fn capacity(&self) -> usize {
        self.inner.roster.len()
    }

    /// Devices currently available for reservation. Advisory only; the
    /// value can change the moment it is read.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Reserve a device, waiting until one is free.
    ///
    /// The returned guard puts the device back when dropped, so no exit
    /// path of the caller can leak a handle out of the pool.
    pub async fn reserve(&self) -> Reservation<D> {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .expect("pool semaphore is never closed");
        permit.forget();
        let device = self
            .inner
            .available
            .lock()
            .expect("pool lock poisoned")
            .pop_front()
            .expect("permit held but no device available");
        info!("reserved device {}", device.id());
        Reservation::new(Arc::clone(&self.inner), vec![device])
    }

    /// Reserve `count` devices as one unit, released together when the
    /// guard drops.
    pub async fn reserve_many(&self, count: usize) -> Result<Reservation<D>, PoolError> {
        if count > self.capacity() {
            return Err(PoolError::OverCapacity {
                requested: count,
                capacity: self.capacity(),
            });
        }
        let permit = self
            .inner
            .semaphore
            .acquire_many(count as u32)
            .await
            .expect("pool semaphore is never closed");
        permit.forget();
        let devices: Vec<D> = {
            let mut available = self.inner.available.lock().expect("pool lock poisoned");
            (0..count)
                .map(|_| available.pop_front().expect("permits held but pool empty"))
                .collect()
        };
        Ok(Reservation::new(Arc::clone(&self.inner), devices))
    }
}

impl DevicePool<Device> {
    /// Build a pool from devices already visible to the bridge, keeping
    /// those whose serial passes `filter`.
    pub async fn discover(
        adb: &Path,
        max_lease: Option<Duration>,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Self, PoolError> {
        let output = AdbCommand::new(adb, None).arg("devices").exec_checked().await?;
        let devices: Vec<Device> = output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                match (fields.next(), fields.next()) {
                    (Some(serial), Some("device")) if filter(serial) => {
                        Some(Device::new(serial, adb))
                    }
                    _ => None,
                }
            })
            .collect();
        if devices.is_empty() {
            return Err(PoolError::NoDevices);
        }
        info!("discovered {} device(s)", devices.len());
        Ok(Self::new(devices, max_lease))
    }
}

impl DevicePool<Emulator> {
    /// Launch `count` emulators and build a pool over the ones that booted.
    ///
    /// Launches are staggered and each port gets at most
    /// [`MAX_BOOT_RETRIES`] boot attempts. Ports that exhaust their
    /// attempts are dropped from the fleet; only if every port fails does
    /// this error.
    pub async fn launch(
        count: usize,
        avd: &str,
        config: EmulatorConfig,
        extra_args: &[String],
        max_lease: Option<Duration>,
    ) -> Result<Self, PoolError> {
        if count > PORTS.len() {
            return Err(PoolError::OverCapacity {
                requested: count,
                capacity: PORTS.len(),
            });
        }
        let ports = &PORTS[..count];
        let avd = avd.to_string();
        let args = extra_args.to_vec();
        let emulators = launch_with_retry(ports, LAUNCH_STAGGER, move |port| {
            let avd = avd.clone();
            let config = config.clone();
            let args = args.clone();
            async move { Emulator::launch(port, &avd, config, &args).await }
        })
        .await?;
        Ok(Self::new(emulators, max_lease))
    }

    /// Kill every emulator in the roster, reserved or not.
    pub async fn kill_all(&self) {
        for emulator in &self.inner.roster {
            emulator.kill().await;
        }
    }
}

/// Boot one emulator per port, retrying each failed port up to the
/// attempt bound, and collect the survivors as they come up.
async fn launch_with_retry<D, F, Fut>(
    ports: &[u16],
    stagger: Duration,
    mut launch: F,
) -> Result<Vec<D>, PoolError>
where
    D: DeviceHandle,
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<D, BootError>> + Send + 'static,
{
    let mut pending: FuturesUnordered<BoxFuture<'static, (u16, Result<D, BootError>)>> =
        FuturesUnordered::new();
    for (index, port) in ports.iter().copied().enumerate() {
        let fut = launch(port);
        let delay = stagger * index as u32;
        pending.push(Box::pin(async move {
            tokio::time::sleep(delay).await;
            (port, fut.await)
        }));
    }

    let mut attempts: HashMap<u16, u32> = HashMap::new();
    let mut booted = Vec::new();
    while let Some((port, result)) = pending.next().await {
        match result {
            Ok(device) => {
                info!("emulator {} joined the pool", device.id());
                booted.push(device);
            }
            Err(e) => {
                warn!("boot attempt on port {port} failed [{e}]");
                let count = attempts.entry(port).or_insert(0);
                *count += 1;
                if *count >= MAX_BOOT_RETRIES {
                    error!(
                        "giving up on port {port} after {MAX_BOOT_RETRIES} boot attempts"
                    );
                } else {
                    let fut = launch(port);
                    pending.push(Box::pin(async move { (port, fut.await) }));
                }
            }
        }
    }

    if booted.is_empty() {
        return Err(PoolError::NoEmulatorsBooted);
    }
    Ok(booted)
}

/// Guard over one or more reserved devices.
///
/// Access goes through [`device`](Self::device) (or
/// [`devices`](Self::devices)), which fails once the pool's lease time has
/// elapsed. Expiry never interrupts an operation already in flight; it
/// only refuses to hand the handle out again. Dropping the guard returns
/// every held device to the pool.
pub struct Reservation<D: DeviceHandle> {
    pool: Arc<PoolInner<D>>,
    devices: Vec<D>,
    expired: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl<D: DeviceHandle> Reservation<D> {
    fn new(pool: Arc<PoolInner<D>>, devices: Vec<D>) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let timer = pool.max_lease.map(|lease| {
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                tokio::time::sleep(lease).await;
                expired.store(true, Ordering::SeqCst);
            })
        });
        Self {
            pool,
            devices,
            expired,
            timer,
        }
    }

    /// Whether the lease on this reservation has run out.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// The reserved device. Fails with [`PoolError::LeaseExpired`] once
    /// the lease has elapsed.
    pub fn device(&self) -> Result<&D, PoolError> {
        self.devices_checked().map(|ds| &ds[0])
    }

    /// All reserved devices (for [`DevicePool::reserve_many`] guards).
    pub fn devices(&self) -> Result<&[D], PoolError> {
        self.devices_checked()
    }

    /// Serial of the (first) reserved device. Identity stays readable even
    /// after lease expiry so callers can still log who they held.
    pub fn device_id(&self) -> &str {
        self.devices[0].id()
    }

    fn devices_checked(&self) -> Result<&[D], PoolError> {
        if self.is_expired() {
            return Err(PoolError::LeaseExpired {
                device_id: self.devices[0].id().to_string(),
            });
        }
        Ok(&self.devices)
    }
}

impl<D: DeviceHandle> Drop for Reservation<D> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let count = self.devices.len();
        {
            let mut available = self.pool.available.lock().expect("pool lock poisoned");
            for device in self.devices.drain(..) {
                available.push_back(device);
            }
        }
        self.pool.semaphore.add_permits(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct FakeDevice {
        serial: String,
        device: Device,
    }

    impl FakeDevice {
        fn new(serial: &str) -> Self {
            Self {
                serial: serial.to_string(),
                device: Device::new(serial, "/bin/true"),
            }
        }
    }

    impl DeviceHandle for FakeDevice {
        fn id(&self) -> &str {
            &self.serial
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn pool_of(n: usize, max_lease: Option<Duration>) -> DevicePool<FakeDevice> {
        let devices = (0..n).map(|i| FakeDevice::new(&format!("dev-{i}"))).collect();
        DevicePool::new(devices, max_lease)
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_capacity() {
        let pool = pool_of(2, None);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let reservation = pool.reserve().await;
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                reservation.device_id().to_string()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn reservation_is_returned_when_holder_panics() {
        let pool = pool_of(1, None);
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _reservation = pool.reserve().await;
                panic!("holder died");
            })
        };
        assert!(task.await.is_err());
        // The panicked task's guard must have put the device back.
        let reservation =
            tokio::time::timeout(Duration::from_secs(1), pool.reserve()).await.unwrap();
        assert_eq!(reservation.device_id(), "dev-0");
    }

    #[tokio::test]
    async fn reservation_is_returned_when_holder_is_cancelled() {
        let pool = pool_of(1, None);
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _reservation = pool.reserve().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        assert!(task.await.is_err());
        tokio::time::timeout(Duration::from_secs(1), pool.reserve()).await.unwrap();
    }

    #[tokio::test]
    async fn lease_expiry_blocks_access_but_not_identity() {
        let pool = pool_of(1, Some(Duration::from_millis(20)));
        let reservation = pool.reserve().await;
        assert!(reservation.device().is_ok());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            reservation.device(),
            Err(PoolError::LeaseExpired { .. })
        ));
        assert_eq!(reservation.device_id(), "dev-0");
        drop(reservation);
        // A fresh reservation starts with a fresh lease.
        let next = pool.reserve().await;
        assert!(next.device().is_ok());
    }

    #[tokio::test]
    async fn reserve_many_holds_distinct_devices() {
        let pool = pool_of(3, None);
        let reservation = pool.reserve_many(2).await.unwrap();
        let ids: Vec<&str> = reservation.devices().unwrap().iter().map(|d| d.id()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(pool.available(), 1);
        drop(reservation);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn reserve_many_rejects_over_capacity() {
        let pool = pool_of(2, None);
        assert!(matches!(
            pool.reserve_many(3).await,
            Err(PoolError::OverCapacity { .. })
        ));
    }

    // Boot-retry accounting, driven by a scripted launcher instead of a
    // real emulator process.

    fn scripted_launcher(
        failures_before_success: u32,
        attempts: Arc<Mutex<HashMap<u16, u32>>>,
    ) -> impl FnMut(u16) -> futures::future::BoxFuture<'static, Result<FakeDevice, BootError>>
    {
        move |port| {
            let attempts = Arc::clone(&attempts);
            Box::pin(async move {
                let attempt = {
                    let mut map = attempts.lock().unwrap();
                    let entry = map.entry(port).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt <= failures_before_success {
                    Err(BootError::Failed {
                        port,
                        message: "scripted failure".into(),
                    })
                } else {
                    Ok(FakeDevice::new(&format!("emulator-{port}")))
                }
            })
        }
    }

    #[tokio::test]
    async fn failed_boot_is_retried_once() {
        let attempts = Arc::new(Mutex::new(HashMap::new()));
        let launcher = scripted_launcher(1, Arc::clone(&attempts));
        let booted = launch_with_retry(&[5554], Duration::ZERO, launcher).await.unwrap();
        assert_eq!(booted.len(), 1);
        assert_eq!(attempts.lock().unwrap()[&5554], 2);
    }

    #[tokio::test]
    async fn boot_attempts_are_bounded_per_port() {
        let attempts = Arc::new(Mutex::new(HashMap::new()));
        let launcher = scripted_launcher(u32::MAX, Arc::clone(&attempts));
        let result = launch_with_retry(&[5554, 5556], Duration::ZERO, launcher).await;
        assert!(matches!(result, Err(PoolError::NoEmulatorsBooted)));
        assert_eq!(attempts.lock().unwrap()[&5554], MAX_BOOT_RETRIES);
        assert_eq!(attempts.lock().unwrap()[&5556], MAX_BOOT_RETRIES);
    }

    #[tokio::test]
    async fn surviving_ports_form_a_pool_despite_one_dead_port() {
        let attempts = Arc::new(Mutex::new(HashMap::new()));
        let attempts_inner = Arc::clone(&attempts);
        let launcher = move |port: u16| -> futures::future::BoxFuture<
            'static,
            Result<FakeDevice, BootError>,
        > {
            let attempts = Arc::clone(&attempts_inner);
            Box::pin(async move {
                *attempts.lock().unwrap().entry(port).or_insert(0) += 1;
                if port == 5554 {
                    Err(BootError::Failed {
                        port,
                        message: "dead port".into(),
                    })
                } else {
                    Ok(FakeDevice::new(&format!("emulator-{port}")))
                }
            })
        };
        let booted = launch_with_retry(&[5554, 5556], Duration::ZERO, launcher).await.unwrap();
        assert_eq!(booted.len(), 1);
        assert_eq!(booted[0].id(), "emulator-5556");
        assert_eq!(attempts.lock().unwrap()[&5554], MAX_BOOT_RETRIES);
    }
}
