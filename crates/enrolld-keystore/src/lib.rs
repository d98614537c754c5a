pub mod error;
pub mod key;
pub mod store;

pub use error::KeystoreError;
pub use key::{fingerprint, verify, DeviceKey, DEFAULT_KEY_BITS, MIN_KEY_BITS};
pub use store::KeypairStore;
