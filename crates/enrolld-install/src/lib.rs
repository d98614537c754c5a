pub mod encrypt;
pub mod error;
pub mod gadget;
pub mod install;
pub mod primitives;

pub use encrypt::{decide_encryption, EncryptionDecision, TpmProbe};
pub use error::InstallError;
pub use gadget::{load_gadget, Gadget, Structure, StructureRole, Volume};
pub use install::InstallModeHandler;
pub use primitives::{
    BootConfig, ConfigureOpts, DataKeySet, LocalPartitioner, PartitionOpts, Partitioner,
    PartitionerOutput, RestartRequester, SaveKeySet, SystemConfigurator,
};
