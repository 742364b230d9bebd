//! rtp-dump: receive one RTP stream over UDP and write its elementary stream
//! to a file.
//!
//! ```text
//! rtp-dump --codec h264 --listen 0.0.0.0:5004 --output out.h264
//! ffplay -f h264 out.h264
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Arg, Command};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use relaycast::config::{PipelineConfig, app_name, version};
use relaycast::pipeline::BoundedQueue;
use relaycast::pipeline::receiver::{Depacketizer, PopTimer};
use relaycast::pipeline::sender::PublisherDrain;
use relaycast::pipeline::types::StreamDescriptor;
use relaycast::sink::AnnexBFileSink;
use relaycast::telemetry::{LogTelemetry, SharedTelemetry, init_logging};
use relaycast::transport::UdpRtpReader;
use relaycast::utils::SignalOfStop;

fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .about("Dump an RTP stream received over UDP to an elementary-stream file")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Local address to receive RTP on")
                .default_value("0.0.0.0:5004"),
        )
        .arg(
            Arg::new("codec")
                .short('c')
                .long("codec")
                .value_name("CODEC")
                .help("Payload codec (h264/opus)")
                .ignore_case(true)
                .default_value("h264"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Pipeline configuration (JSON)"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl-C")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn descriptor(codec: &str) -> Result<StreamDescriptor> {
    match codec.to_lowercase().as_str() {
        "h264" => Ok(StreamDescriptor::h264()),
        "opus" => Ok(StreamDescriptor::opus(48_000, 2)),
        other => bail!("unsupported codec '{}'", other),
    }
}

fn main() -> Result<()> {
    init_logging();
    let matches = command().get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => PipelineConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => PipelineConfig::default(),
    };
    let codec = matches.get_one::<String>("codec").map_or("h264", String::as_str);
    let descriptor = descriptor(codec)?;
    let listen = matches
        .get_one::<String>("listen")
        .cloned()
        .unwrap_or_else(|| "0.0.0.0:5004".to_string());
    let Some(output) = matches.get_one::<String>("output") else {
        bail!("--output is required");
    };
    let duration = matches.get_one::<u64>("duration").copied();

    let telemetry: SharedTelemetry = Arc::new(LogTelemetry);
    let kind = descriptor.kind();
    let sink = AnnexBFileSink::create(output, kind, config.publisher.timebase_for(kind))
        .with_context(|| format!("creating {}", output))?;

    let packets = Arc::new(BoundedQueue::with_config(&config.queue));
    let depacketizer = Arc::new(Depacketizer::new(
        descriptor,
        &config.jitter,
        packets.clone(),
        telemetry.clone(),
    ));
    let mut timer = PopTimer::new(depacketizer.clone(), Duration::from_millis(config.jitter.tick_ms));

    let sos = SignalOfStop::new();
    let mut publisher = {
        let sos = sos.clone();
        PublisherDrain::new(Box::new(sink), &config.publisher, packets, telemetry.clone()).on_error(
            move |stage, err| {
                error!("{}: {}", stage, err);
                sos.cancel();
            },
        )
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let cancel = CancellationToken::new();
    let reader = runtime
        .block_on(UdpRtpReader::bind(
            listen.as_str(),
            depacketizer.clone(),
            cancel.clone(),
            telemetry.clone(),
        ))
        .with_context(|| format!("binding {}", listen))?;
    let local = reader.local_addr()?;

    {
        let sos = sos.clone();
        ctrlc::set_handler(move || sos.cancel()).context("installing Ctrl-C handler")?;
    }

    publisher.start()?;
    timer.start()?;
    let handle = runtime.spawn(reader.run());
    info!("receiving {} on {} into {}", descriptor.codec, local, output);

    match duration {
        Some(secs) => {
            sos.wait_timeout(Duration::from_secs(secs));
        }
        None => sos.wait_cancellation(),
    }

    // network first, then the jitter buffer, then the file
    cancel.cancel();
    let summary = runtime.block_on(handle).unwrap_or_default();
    timer.stop();
    let flushed = depacketizer.flush();
    publisher.stop();

    info!("network: {}", summary);
    info!("jitter: {:?}", depacketizer.stats().jitter);
    info!("{} packets flushed on stop, publisher {}", flushed, publisher.state());
    if let Some(err) = publisher.take_error() {
        bail!("publishing to {} failed: {}", output, err);
    }
    if summary.accepted == 0 {
        info!("no packets received");
    }
    Ok(())
}
