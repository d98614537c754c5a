pub mod dirs;
pub mod error;
pub mod types;


pub use dirs::Dirs;
pub use error::DomainError;
pub use types::{CloudInitState, DeviceIdentity, KeyId, ModelGrade, SystemMode};
