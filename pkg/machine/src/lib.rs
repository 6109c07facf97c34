pub mod config;
pub mod controller;
pub mod error;
pub mod exports;
pub mod guest;
pub mod hyperkit;
pub mod network;
pub mod privilege;
pub mod provision;
pub mod supervisor;

pub use config::MachineConfig;
pub use controller::{LifecycleController, RuntimeState, Timings};
pub use error::MachineError;
pub use supervisor::MachineState;
