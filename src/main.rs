/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use clap::Parser;
use miette::{IntoDiagnostic, miette};
use ravenna_rx::{
    config::Config,
    error::SessionResult,
    formats::ByteOrder,
    nmos::NmosQueryClient,
    sdp::StreamDescription,
    session::{RealtimeOutput, RxSession, SessionConfig},
    telemetry,
    utils::set_realtime_priority,
};
use std::{path::PathBuf, time::Duration};
use tokio::runtime;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Receive a RAVENNA/AES67 stream and play it out on the grandmaster's
/// timebase.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// NMOS registry Query API URL.
    #[arg(long, env = "RAVENNA_RX_REGISTRY")]
    registry: Option<String>,

    /// Interface selector: a name like `eth0` or one of its IPv4 addresses.
    #[arg(long, env = "RAVENNA_RX_INTERFACES")]
    interfaces: Option<String>,

    /// Output audio device name (resolved by the host audio layer).
    #[arg(long)]
    audio_device: Option<String>,

    /// List the available audio output devices and exit.
    #[arg(long)]
    list_audio_devices: bool,

    /// NMOS Query API version to use.
    #[arg(long, default_value = ravenna_rx::nmos::DEFAULT_QUERY_VERSION)]
    query_version: String,

    /// Path to an SDP file describing the stream to receive.
    #[arg(long)]
    sdp: Option<PathBuf>,

    /// Label of the sender to resolve through the NMOS registry.
    #[arg(long)]
    sender: Option<String>,

    /// Playout delay in frames behind the PTP-derived now.
    #[arg(long, default_value_t = ravenna_rx::receiver::config::DEFAULT_DELAY_FRAMES)]
    delay_frames: u32,

    /// Optional YAML config file; command line arguments take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    telemetry::init();

    runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> miette::Result<()> {
    if args.list_audio_devices {
        // Device enumeration and callback wiring belong to the embedding
        // host audio layer; the CLI drives a paced null output.
        println!("null (host audio device wiring is provided by the embedding application)");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).await.into_diagnostic()?,
        None => Config::default(),
    };
    if let Some(interfaces) = &args.interfaces {
        config.interface = interfaces.clone();
    }
    if args.registry.is_some() {
        config.registry = args.registry.clone();
    }
    if args.audio_device.is_some() {
        config.audio_device = args.audio_device.clone();
    }
    config.delay_frames = args.delay_frames;
    config.query_version = args.query_version.clone();

    if config.interface.is_empty() {
        return Err(miette!("no network interface given (use --interfaces)"));
    }

    let sdp_content = match (&args.sdp, &args.sender) {
        (Some(path), _) => tokio::fs::read_to_string(path).await.into_diagnostic()?,
        (None, Some(label)) => {
            let registry = config
                .registry
                .as_deref()
                .ok_or_else(|| miette!("--sender requires --registry"))?;
            NmosQueryClient::new(registry)
                .fetch_sdp_by_label(&config.query_version, label)
                .await
                .into_diagnostic()?
        }
        (None, None) => {
            return Err(miette!("either --sdp or --sender must be given"));
        }
    };

    let desc = StreamDescription::parse(&sdp_content).into_diagnostic()?;
    info!(
        "Receiving '{}': {} ch {:?} @ {} Hz from {}:{}",
        desc.session_name,
        desc.channels,
        desc.encoding,
        desc.sample_rate,
        desc.connection_address,
        desc.rtp_port
    );

    let session_config = SessionConfig {
        interface: config.interface.clone(),
        delay_frames: config.delay_frames,
        output_byte_order: ByteOrder::Le,
    };

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("session", move |s| {
            run(s, desc, session_config)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await
    .into_diagnostic()?;

    Ok(())
}

async fn run(
    subsys: SubsystemHandle,
    desc: StreamDescription,
    config: SessionConfig,
) -> SessionResult<()> {
    let (session, output) = RxSession::start(&subsys, &desc, &config)?;

    let cancellation = subsys.create_cancellation_token();
    let block_duration = Duration::from_nanos(
        (PLAYOUT_BLOCK_FRAMES as u64 * 1_000_000_000) / output.format().sample_rate as u64,
    );
    std::thread::Builder::new()
        .name("playout".to_owned())
        .spawn(move || null_output_loop(output, cancellation, block_duration))?;

    subsys.on_shutdown_requested().await;
    session.stop().await;
    Ok(())
}

const PLAYOUT_BLOCK_FRAMES: usize = 256;

/// Paces realtime reads the way a device callback would and discards the
/// samples. Stands in for the platform audio layer.
fn null_output_loop(
    mut output: RealtimeOutput,
    cancellation: CancellationToken,
    block_duration: Duration,
) {
    set_realtime_priority();
    let mut buffer = vec![0u8; PLAYOUT_BLOCK_FRAMES * output.format().bytes_per_frame()];

    while !cancellation.is_cancelled() {
        output.read(&mut buffer);
        std::thread::sleep(block_duration);
    }
}
