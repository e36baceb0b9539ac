//! Sesame BLE Controller
//!
//! Host side driver for Sesame 5 locks on top of btleplug.
//!
//! # Example
//!
//! ```ignore
//! use sesame_ble_controller::{ControllerConfig, ble, runner};
//! use sesame_central::{AppCommand, OneShot};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ControllerConfig::load(&ControllerConfig::default_path()?)?;
//!
//!     // Scan for locks
//!     let adapter = ble::get_adapter(config.adapter).await?;
//!     for device in ble::scan(&adapter, std::time::Duration::from_secs(5)).await? {
//!         println!("{} ({})", device.name, device.address);
//!     }
//!
//!     // Unlock once logged in
//!     let unlock = OneShot::new(AppCommand::Unlock { tag: None });
//!     let stop = tokio::time::sleep(std::time::Duration::from_secs(30));
//!     let observer = runner::run(&config, unlock, |c| c.observer().is_done(), stop).await?;
//!     println!("{:?}", observer.result());
//!
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod driver;
mod error;
pub mod runner;

pub use config::{ControllerConfig, sesame_home};
pub use error::ControllerError;
pub use runner::{HostController, drive, run};
