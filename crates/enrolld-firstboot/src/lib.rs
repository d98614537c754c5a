pub mod bootok;
pub mod cloudinit;
pub mod error;

pub use bootok::{
    AssumeOperational, BootOkReconciler, BootOutcome, Bootloader, EnvFileBootloader, TriedSnap,
    TriedSnapCheck,
};
pub use cloudinit::{
    CloudInitCtl, CloudInitProbe, CloudInitRestrictor, HostCloudInit, RestrictOutcome,
    RestrictionPolicy, RESTRICTOR_TICK,
};
pub use error::FirstbootError;
