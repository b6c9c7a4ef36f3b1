//! corral: device-farm test orchestration over adb.
//!
//! Runs Android instrumentation test plans across a pool of devices or
//! emulators, parses the instrumentation protocol into structured results,
//! captures per-test log slices, and tunnels a control protocol through
//! logcat so on-device code can change device state with automatic
//! restoration afterwards.
//!
//! # Architecture
//!
//! - **bridge / device / emulator**: adb process plumbing and the device
//!   abstraction built on it
//! - **pool**: leased reservations over a fixed roster of devices, with
//!   staggered emulator boot and retry
//! - **suite / worker / orchestrator**: a shared suite stream consumed by
//!   one worker per reserved device, supervised as a single test plan
//! - **parser / reporting**: the `am instrument -r` status protocol and
//!   the listener interface results are published through
//! - **logcat / control**: log capture with per-test markers, tag
//!   demultiplexing, and the logcat-tunneled device control protocol
//!
//! # Example
//!
//! ```no_run
//! use corral::config::load_config;
//! use corral::device::Device;
//! use corral::orchestrator::Orchestrator;
//! use corral::pool::DevicePool;
//! use corral::suite::{SuiteStream, TestSuite};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("corral.toml"))?;
//!     let adb = std::path::Path::new("adb");
//!     let pool = DevicePool::<Device>::discover(adb, None, |_| true).await?;
//!     let orchestrator = Orchestrator::new(pool, config.harness, "artifacts");
//!     let plan = SuiteStream::from_iter([TestSuite::new("smoke")]);
//!     let stats = orchestrator.execute_test_plan(plan, Vec::new()).await?;
//!     println!("{} tests run", stats.tests_run());
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod control;
pub mod device;
pub mod emulator;
pub mod logcat;
pub mod orchestrator;
pub mod parser;
pub mod pool;
pub mod reporting;
pub mod storage;
pub mod suite;
pub mod worker;

pub use config::{load_config, Config, Harness, OrchestratorConfig};
pub use device::{Device, DeviceError, DeviceHandle};
pub use emulator::{BootError, Emulator, EmulatorConfig};
pub use orchestrator::{ControlConfig, Orchestrator};
pub use pool::{DevicePool, PoolError, Reservation};
pub use reporting::{RunStats, StatsSnapshot, TestRunListener, TestStatus};
pub use suite::{SuiteSender, SuiteStream, TestSuite};
pub use worker::{Worker, WorkerError};
