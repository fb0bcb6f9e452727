// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Command-line configuration: a validated range check against the `_MAX`
//! constant defined alongside each bounded collection.

use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

use crate::connection::MAX_CONNECTIONS_DEFAULT;
use crate::connection::MAX_CONNECTIONS_MAX;
use crate::handle_map::MAX_ENTRIES_DEFAULT;
use crate::handle_map::MAX_ENTRIES_MAX;
use crate::session::MAX_SESSIONS_PER_CONN_DEFAULT;
use crate::session::MAX_SESSIONS_PER_CONN_MAX;

/// Which D-Bus bus a production IPC front-end would register on. This
/// crate's loopback front-end ignores the value; it is surfaced so a
/// future D-Bus-backed `IpcFrontend` can read it straight from `Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Bus {
    System,
    Session,
}

#[derive(Debug, Parser)]
#[command(name = "tabrmd", about = "TPM 2.0 access broker and resource manager")]
pub struct Cli {
    /// Name to request on the message bus.
    #[arg(long, default_value = "com.intel.tss2.Tabrmd")]
    pub dbus_name: String,

    /// Which bus to connect to.
    #[arg(long, value_enum, default_value_t = Bus::System)]
    pub bus: Bus,

    /// Flush every transient object and session from the TPM at startup.
    #[arg(long)]
    pub flush_all_on_start: bool,

    /// Maximum number of simultaneous client connections.
    #[arg(long, default_value_t = MAX_CONNECTIONS_DEFAULT)]
    pub max_connections: usize,

    /// Maximum number of sessions a single connection may hold.
    #[arg(long, default_value_t = MAX_SESSIONS_PER_CONN_DEFAULT)]
    pub max_sessions_per_conn: usize,

    /// Maximum number of transient objects a single connection may hold.
    #[arg(long, default_value_t = MAX_ENTRIES_DEFAULT)]
    pub max_transients_per_conn: usize,

    /// File supplying entropy to seed the connection-id RNG.
    #[arg(long)]
    pub prng_seed_file: Option<PathBuf>,

    /// Permit running as root (refused by default).
    #[arg(long)]
    pub allow_root: bool,

    /// TCTI configuration string passed through to the device backend.
    #[arg(long, default_value = "")]
    pub tcti_conf: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_connections {0} exceeds the hard ceiling of {1}")]
    MaxConnectionsOutOfRange(usize, usize),
    #[error("max_sessions_per_conn {0} exceeds the hard ceiling of {1}")]
    MaxSessionsOutOfRange(usize, usize),
    #[error("max_transients_per_conn {0} exceeds the hard ceiling of {1}")]
    MaxTransientsOutOfRange(usize, usize),
    #[error("refusing to run as root without --allow-root")]
    RootNotAllowed,
}

/// Validated configuration derived from [`Cli`]. Unlike `Cli`, every field
/// here is already range-checked.
#[derive(Debug, Clone)]
pub struct Config {
    pub dbus_name: String,
    pub bus: Bus,
    pub flush_all_on_start: bool,
    pub max_connections: usize,
    pub max_sessions_per_conn: usize,
    pub max_transients_per_conn: usize,
    pub prng_seed_file: Option<PathBuf>,
    pub allow_root: bool,
    pub tcti_conf: String,
}

impl Config {
    pub fn from_cli(cli: Cli, running_as_root: bool) -> Result<Self, ConfigError> {
        if cli.max_connections == 0 || cli.max_connections > MAX_CONNECTIONS_MAX {
            return Err(ConfigError::MaxConnectionsOutOfRange(
                cli.max_connections,
                MAX_CONNECTIONS_MAX,
            ));
        }
        if cli.max_sessions_per_conn == 0 || cli.max_sessions_per_conn > MAX_SESSIONS_PER_CONN_MAX {
            return Err(ConfigError::MaxSessionsOutOfRange(
                cli.max_sessions_per_conn,
                MAX_SESSIONS_PER_CONN_MAX,
            ));
        }
        if cli.max_transients_per_conn == 0 || cli.max_transients_per_conn > MAX_ENTRIES_MAX {
            return Err(ConfigError::MaxTransientsOutOfRange(
                cli.max_transients_per_conn,
                MAX_ENTRIES_MAX,
            ));
        }
        if running_as_root && !cli.allow_root {
            return Err(ConfigError::RootNotAllowed);
        }
        Ok(Config {
            dbus_name: cli.dbus_name,
            bus: cli.bus,
            flush_all_on_start: cli.flush_all_on_start,
            max_connections: cli.max_connections,
            max_sessions_per_conn: cli.max_sessions_per_conn,
            max_transients_per_conn: cli.max_transients_per_conn,
            prng_seed_file: cli.prng_seed_file,
            allow_root: cli.allow_root,
            tcti_conf: cli.tcti_conf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            dbus_name: "com.example.Test".into(),
            bus: Bus::System,
            flush_all_on_start: false,
            max_connections: MAX_CONNECTIONS_DEFAULT,
            max_sessions_per_conn: MAX_SESSIONS_PER_CONN_DEFAULT,
            max_transients_per_conn: MAX_ENTRIES_DEFAULT,
            prng_seed_file: None,
            allow_root: false,
            tcti_conf: String::new(),
        }
    }

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::from_cli(base_cli(), false).is_ok());
    }

    #[test]
    fn max_connections_above_ceiling_is_rejected() {
        let mut cli = base_cli();
        cli.max_connections = MAX_CONNECTIONS_MAX + 1;
        assert!(matches!(
            Config::from_cli(cli, false),
            Err(ConfigError::MaxConnectionsOutOfRange(_, _))
        ));
    }

    #[test]
    fn root_is_rejected_without_allow_root() {
        let cli = base_cli();
        assert_eq!(
            Config::from_cli(cli, true).unwrap_err(),
            ConfigError::RootNotAllowed
        );
    }

    #[test]
    fn root_is_accepted_with_allow_root() {
        let mut cli = base_cli();
        cli.allow_root = true;
        assert!(Config::from_cli(cli, true).is_ok());
    }
}
