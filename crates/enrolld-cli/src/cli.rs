use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "enrolld",
    about = "Device identity and lifecycle manager",
    version
)]
pub struct Cli {
    /// Root directory the device layout lives under.
    #[arg(long, global = true, default_value = "/", env = "ENROLLD_ROOT")]
    pub root: PathBuf,

    /// Gadget snap name, scoping configuration and hooks.
    #[arg(long, global = true, default_value = "gadget", env = "ENROLLD_GADGET")]
    pub gadget: String,

    /// Treat this host as a classic (non-appliance) system.
    #[arg(long, global = true, default_value_t = false)]
    pub classic: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the lifecycle ticks until interrupted.
    Run {
        /// Device service URL override (otherwise configuration decides).
        #[arg(long)]
        service_url: Option<String>,

        /// Store proxy URL.
        #[arg(long)]
        proxy_store: Option<String>,

        /// Permit NoCloud-style local datasources when restricting
        /// cloud-init.
        #[arg(long, default_value_t = false)]
        allow_local_datasources: bool,
    },

    /// Print the current device identity and attempt state.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Delete the device identity and its key.
    Unregister {
        /// Also suppress re-registration until the next reboot.
        #[arg(long, default_value_t = false)]
        no_register_until_reboot: bool,
    },

    /// Record that initial seeding has completed.
    MarkSeeded,

    /// Ack a model assertion file as this device's model.
    AckModel {
        /// Path to the model assertion.
        assertion: PathBuf,
    },
}
