pub mod config;
pub mod error;
pub mod manager;
pub mod state;

pub use config::{load_config, DeviceConfig};
pub use error::ManagerError;
pub use manager::{DeviceManager, ManagerOpts, ManagerStatus, UnregisterOpts, ENSURE_TICK};
pub use state::{Change, ChangeKind, ChangeStatus, DeviceState};
