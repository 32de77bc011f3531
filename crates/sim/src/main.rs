//! pv-usb-sim
//!
//! Wires a virtual host controller to a backend dispatcher over an
//! in-process link, attaches the loopback device and runs a configurable
//! transfer workload end to end: OUT data is verified at the device, IN
//! data is queued at the device and verified at the controller.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::Rng;
use tracing::{debug, info, warn};

use backend::{BackendConfig, BackendContext, MockDevice};
use common::{Link, setup_logging};
use config::SimConfig;
use frontend::{EnqueueError, HcdEvent, TransferRequest, VirtualHcd};
use protocol::{DeviceId, DeviceSpeed, TransferId, TransferStatus};

#[derive(Parser, Debug)]
#[command(name = "pv-usb-sim")]
#[command(
    author,
    version,
    about = "Paravirtual USB transport simulator - run a frontend/backend pair in process"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Round trips to run (overrides config)
    #[arg(short, long)]
    transfers: Option<usize>,

    /// Bytes per transfer (overrides config)
    #[arg(long)]
    transfer_len: Option<usize>,

    /// Mix isochronous transfers into the workload
    #[arg(long)]
    isochronous: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = SimConfig::default();
        let path = SimConfig::default_path();
        config.save(&path).context("saving configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config_path = args
        .config
        .as_deref()
        .map(|raw| PathBuf::from(shellexpand::tilde(raw).into_owned()));
    let mut config = SimConfig::load(config_path.as_deref())?;

    if let Some(transfers) = args.transfers {
        config.workload.transfers = transfers;
    }
    if let Some(len) = args.transfer_len {
        config.workload.transfer_len = len;
    }
    if args.isochronous {
        config.workload.isochronous = true;
    }
    if let Some(level) = args.log_level {
        config.sim.log_level = level;
    }
    config.validate()?;

    setup_logging(&config.sim.log_level)?;
    run(config)
}

fn run(config: SimConfig) -> Result<()> {
    info!(
        ports = config.sim.ports,
        pending = config.backend.pending_requests,
        transfers = config.workload.transfers,
        len = config.workload.transfer_len,
        "starting pv-usb sim"
    );

    let ctx = BackendContext::new(BackendConfig {
        pending_requests: config.backend.pending_requests,
        transfer_timeout: Duration::from_secs(config.backend.transfer_timeout_secs),
        enable_timeouts: true,
    });
    let (hcd, events) = VirtualHcd::new(config.sim.ports);

    let (front, back) = Link::new();
    let device = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, device.clone(), "loopback0");

    let speed = hcd
        .on_connect(1, DeviceId(1), front)
        .context("connecting loopback device")?;
    info!(?speed, "device attached on port 1");

    let stats = run_workload(&hcd, &events, &device, &config)?;
    info!(
        round_trips = stats.round_trips,
        bytes_out = stats.bytes_out,
        bytes_in = stats.bytes_in,
        retries = stats.retries,
        "workload complete"
    );

    hcd.shutdown();
    handle.shutdown();
    Ok(())
}

#[derive(Default)]
struct WorkloadStats {
    round_trips: usize,
    bytes_out: u64,
    bytes_in: u64,
    retries: usize,
}

fn run_workload(
    hcd: &Arc<VirtualHcd>,
    events: &async_channel::Receiver<HcdEvent>,
    device: &Arc<MockDevice>,
    config: &SimConfig,
) -> Result<WorkloadStats> {
    let endpoint = config.workload.endpoint;
    let len = config.workload.transfer_len;
    let mut rng = rand::rng();
    let mut stats = WorkloadStats::default();
    let mut next_id = 0u64;

    for round in 0..config.workload.transfers {
        let mut payload = vec![0u8; len];
        rng.fill(&mut payload[..]);

        // OUT leg: controller to device.
        let out_id = TransferId(next_id);
        next_id += 1;
        let out = if config.workload.isochronous && round % 4 == 3 {
            TransferRequest::isochronous_out(out_id, endpoint, &payload, 1024.min(len))
        } else {
            TransferRequest::bulk_out(out_id, endpoint, &payload)
        };
        submit_with_retry(hcd, out, &mut stats)?;
        let done = wait_transfer(events, out_id)?;
        if done.status != TransferStatus::Ok {
            bail!("OUT transfer {round} failed: {}", done.status);
        }
        stats.bytes_out += done.actual_length as u64;

        // IN leg: queue the same bytes at the device and read them back.
        device.queue_in(endpoint, &payload);
        let in_id = TransferId(next_id);
        next_id += 1;
        submit_with_retry(hcd, TransferRequest::bulk_in(in_id, endpoint, len), &mut stats)?;
        let done = wait_transfer(events, in_id)?;
        if done.status != TransferStatus::Ok {
            bail!("IN transfer {round} failed: {}", done.status);
        }
        if done.data() != payload {
            bail!("IN transfer {round} returned different bytes");
        }
        stats.bytes_in += done.actual_length as u64;

        stats.round_trips += 1;
        debug!(round, "round trip verified");
    }

    Ok(stats)
}

/// Enqueue, retrying when the transport pushes back.
fn submit_with_retry(
    hcd: &Arc<VirtualHcd>,
    mut transfer: TransferRequest,
    stats: &mut WorkloadStats,
) -> Result<()> {
    loop {
        match hcd.enqueue(1, transfer) {
            Ok(()) => return Ok(()),
            Err(EnqueueError::Retry(back)) => {
                stats.retries += 1;
                warn!(id = back.id.0, "transport busy, retrying");
                transfer = *back;
                // Let in-flight completions drain before retrying.
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => bail!("enqueue failed: {err}"),
        }
    }
}

fn wait_transfer(
    events: &async_channel::Receiver<HcdEvent>,
    id: TransferId,
) -> Result<TransferRequest> {
    loop {
        match events.recv_blocking() {
            Ok(HcdEvent::TransferComplete(t)) if t.id == id => return Ok(*t),
            Ok(HcdEvent::TransferComplete(t)) => {
                debug!(id = t.id.0, status = %t.status, "out-of-band completion");
            }
            Ok(HcdEvent::PortStatusChanged { port, status }) => {
                debug!(port, status, "port status change");
            }
            Err(_) => bail!("event channel closed"),
        }
    }
}
