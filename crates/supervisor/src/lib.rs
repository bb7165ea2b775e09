//! A crate for supervising node-local system services.
//!
//! A [`Service`] declares what it depends on, which condition gates its start,
//! how it is prepared and launched, how its health is probed and whether it is
//! restarted. [`System`] starts every registered service in dependency order
//! and supervises each one in its own task.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use supervisor::config::{Constants, MachineConfig};
//! use supervisor::image::DirectoryImageStore;
//! use supervisor::nodeip::HostInterfaces;
//! use supervisor::services::{Cri, Kubelet};
//! use supervisor::state::ResourceStore;
//! use supervisor::{Machine, System};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let constants = Constants::default();
//!     let config = MachineConfig::from_path("/etc/machined/config.yaml").await?;
//!     let images = DirectoryImageStore::new(&constants.image_dir, config.machine.images.pull_command.clone());
//!     let machine = Machine {
//!         constants,
//!         config,
//!         store: ResourceStore::new(),
//!         images: Arc::new(images),
//!         addresses: Arc::new(HostInterfaces),
//!     };
//!
//!     let mut system = System::new(Arc::new(machine));
//!     system.register(Arc::new(Cri))?;
//!     system.register(Arc::new(Kubelet))?;
//!     let handle = system.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod args;
pub mod backoff;
pub mod condition;
pub mod config;
pub mod container;
pub mod files;
pub mod health;
pub mod image;
pub mod nodeip;
pub mod restart;
pub mod runner;
pub mod service;
pub mod services;
pub mod state;
pub mod system;
pub mod webserver;

#[doc(inline)]
pub use service::{Machine, Service, ServiceState, ServiceStatus};
#[doc(inline)]
pub use system::{System, SystemHandle};
