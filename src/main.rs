// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! `tabrmd`: a user-space TPM 2.0 access broker and resource manager.
//! Multiplexes one physical TPM among many client processes by
//! virtualising transient-object and session handles and serialising
//! device access through a four-thread pipeline. See `DESIGN.md` for the
//! architecture.

mod access_gate;
mod command;
mod config;
mod connection;
mod error;
mod handle_map;
mod ipc;
mod pipeline;
mod proto;
mod response;
mod session;
mod tcti;

#[cfg(test)]
mod tests;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use access_gate::TpmAccessGate;
use config::Cli;
use config::Config;
use connection::ConnectionTable;
use ipc::LoopbackIpcFrontend;
use pipeline::command_source;
use pipeline::message::InboundMessage;
use pipeline::message::OutboundMessage;
use pipeline::message::Runnable;
use pipeline::CommandSource;
use pipeline::ResourceManager;
use pipeline::ResponseSink;
use proto::constants::DEFAULT_MAX_BUFFER_SIZE;
use session::SessionList;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabrmd=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn seed_from_entropy(path: Option<&std::path::Path>) -> u64 {
    if let Some(path) = path {
        if let Ok(bytes) = std::fs::read(path) {
            if bytes.len() >= 8 {
                return u64::from_le_bytes(bytes[..8].try_into().unwrap());
            }
        }
        tracing::warn!(path = %path.display(), "prng seed file unreadable, falling back to OS randomness");
    }
    let mut buf = [0u8; 8];
    getrandom::fill(&mut buf).expect("OS randomness source unavailable");
    u64::from_le_bytes(buf)
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_cli(cli, running_as_root())
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    tracing::info!(
        max_connections = config.max_connections,
        max_sessions_per_conn = config.max_sessions_per_conn,
        max_transients_per_conn = config.max_transients_per_conn,
        "starting tabrmd"
    );

    let tcti: Box<dyn tcti::Tcti> = build_tcti(&config.tcti_conf)?;
    let access_gate = Arc::new(TpmAccessGate::new(tcti, Duration::from_secs(5))?);

    if config.flush_all_on_start {
        access_gate.flush_all();
    }

    let connections = Arc::new(ConnectionTable::new(config.max_connections));
    let sessions = SessionList::new(config.max_sessions_per_conn, session::MAX_ABANDONED_DEFAULT);

    let (command_tx, command_rx) = mpsc::channel::<InboundMessage>();
    let (response_tx, response_rx) = mpsc::channel::<OutboundMessage>();
    let (new_conn_tx, new_conn_rx) = mpsc::channel();
    let cancelled = Arc::new(AtomicBool::new(false));

    let seed = seed_from_entropy(config.prng_seed_file.as_deref());
    let ipc_frontend = Arc::new(LoopbackIpcFrontend::new(
        connections.clone(),
        config.max_transients_per_conn,
        seed,
    ));

    let attrs_for: command_source::AttributeLookup = Arc::new(|_code: u32| {
        command::CommandAttributes::new()
            .with_c_handles(1)
            .with_r_handle(true)
    });

    let source = CommandSource::new(
        connections.clone(),
        new_conn_rx,
        command_tx.clone(),
        attrs_for,
        DEFAULT_MAX_BUFFER_SIZE,
        cancelled.clone(),
    );
    let resource_manager = ResourceManager::new(
        connections.clone(),
        sessions,
        access_gate.clone(),
        command_rx,
        response_tx,
        config.max_sessions_per_conn,
        cancelled.clone(),
    );
    let response_sink = ResponseSink::new(response_rx, connections.clone());

    let source_handle = std::thread::Builder::new()
        .name("tabrmd-command-source".into())
        .spawn(move || source.run())?;
    let rm_handle = std::thread::Builder::new()
        .name("tabrmd-resource-manager".into())
        .spawn(move || resource_manager.run())?;
    let sink_handle = std::thread::Builder::new()
        .name("tabrmd-response-sink".into())
        .spawn(move || response_sink.run())?;

    // Accept connections inline on the main thread until shutdown; every
    // accepted connection is forwarded to the Command Source.
    run_ipc_loop(ipc_frontend, new_conn_tx, cancelled.clone());

    let _ = command_tx.send(InboundMessage::CheckCancel);
    let _ = source_handle.join();
    let _ = rm_handle.join();
    let _ = sink_handle.join();

    Ok(())
}

fn run_ipc_loop(
    _ipc_frontend: Arc<LoopbackIpcFrontend>,
    _new_conn_tx: mpsc::Sender<Arc<connection::Connection>>,
    cancelled: Arc<AtomicBool>,
) {
    // The loopback front-end accepts connections only via
    // `IpcFrontend::create_connection`, invoked by an embedding process;
    // this loop simply blocks until a shutdown signal arrives.
    while !cancelled.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// No hardware or kernel-resident TCTI backend ships in this crate; a
/// production deployment links one in here, keyed off `tcti_conf`.
fn build_tcti(tcti_conf: &str) -> anyhow::Result<Box<dyn tcti::Tcti>> {
    Err(anyhow::anyhow!(
        "no TCTI backend is compiled into this build (tcti_conf={tcti_conf:?}); \
         link a hardware or simulator TCTI to produce a runnable binary"
    ))
}
