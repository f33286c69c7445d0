use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use xiot_link::config::{ClientConfig, app_name, version};
use xiot_link::media::{CaptureSource, DesktopHost, HttpMediaTransport, MediaSessionManager, SessionKind};
use xiot_link::telemetry::TelemetryClient;
use xiot_link::utils::sos::SignalOfStop;
use xiot_link::{ConnectionState, DisplayCommandDispatcher};

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file.")
                .global(true),
        )
        .arg(
            Arg::new("ws-url")
                .long("ws-url")
                .value_name("URL")
                .help("Telemetry stream WebSocket URL.")
                .global(true),
        )
        .arg(
            Arg::new("pi-url")
                .long("pi-url")
                .value_name("URL")
                .help("Edge multimedia server base URL.")
                .global(true),
        )
        .arg(
            Arg::new("api-url")
                .long("api-url")
                .value_name("URL")
                .help("Gateway REST API base URL.")
                .global(true),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .help("Bearer token for the gateway API.")
                .global(true),
        )
        .subcommand(
            Command::new("monitor")
                .about("Follow live sensor telemetry.")
                .arg(
                    Arg::new("device")
                        .short('d')
                        .long("device")
                        .value_name("BASEBOARD")
                        .help("Only show sensors of this baseboard."),
                ),
        )
        .subcommand(
            Command::new("probe")
                .about("Report reachability of the multimedia server.")
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Exit after the first probe."),
                ),
        )
        .subcommand(
            Command::new("display")
                .about("Show text on the device LCD.")
                .arg(Arg::new("text").required(true).help("Text to display."))
                .arg(
                    Arg::new("color")
                        .long("color")
                        .value_name("COLOR")
                        .help("Background colour (RED, GREEN, BLUE, WHITE, ...)."),
                )
                .arg(
                    Arg::new("alarm")
                        .long("alarm")
                        .action(ArgAction::SetTrue)
                        .help("Enable alarm mode."),
                ),
        )
        .subcommand(
            Command::new("record")
                .about("Save the live video and/or audio feed to disk.")
                .arg(
                    Arg::new("out")
                        .short('o')
                        .long("out")
                        .value_name("DIR")
                        .default_value("xiot-media"),
                )
                .arg(Arg::new("video").long("video").action(ArgAction::SetTrue))
                .arg(Arg::new("audio").long("audio").action(ArgAction::SetTrue))
                .arg(
                    Arg::new("seconds")
                        .long("seconds")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u64))
                        .help("Stop after N seconds."),
                ),
        )
        .subcommand(
            Command::new("talk")
                .about("Push-to-talk to the device speaker.")
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .value_name("FILE")
                        .help("WebM/Opus recording to send instead of the microphone."),
                )
                .arg(
                    Arg::new("seconds")
                        .long("seconds")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u64))
                        .help("Stop after N seconds."),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<ClientConfig> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => ClientConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => ClientConfig::default(),
    };

    // environment first, then flags
    let config = config.with_overrides(|key| std::env::var(key).ok());
    Ok(config.with_overrides(|key| {
        let flag = match key {
            xiot_link::config::ENV_WS_URL => "ws-url",
            xiot_link::config::ENV_PI_URL => "pi-url",
            xiot_link::config::ENV_API_URL => "api-url",
            xiot_link::config::ENV_API_TOKEN => "token",
            _ => return None,
        };
        matches.get_one::<String>(flag).cloned()
    }))
}

/// Resolves on Ctrl-C or after `limit`.
async fn run_until(stop: &SignalOfStop, limit: Option<Duration>) {
    match limit {
        Some(limit) => {
            let _ = stop.select(tokio::time::sleep(limit)).await;
        }
        None => stop.wait_cancellation().await,
    }
}

async fn monitor(config: ClientConfig, device: Option<String>, stop: SignalOfStop) -> Result<()> {
    let client = TelemetryClient::new(&config.telemetry);
    let mut states = client.watch_state();
    let mut snapshots = client.watch_snapshot();
    client.connect();

    loop {
        tokio::select! {
            _ = stop.wait_cancellation() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("[{}] connection {}", chrono::Local::now().format("%H:%M:%S"), state);
                if state == ConnectionState::Failed {
                    bail!("giving up on {}", config.telemetry.url);
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for sensor in snapshot
                    .sensors
                    .iter()
                    .filter(|s| device.as_deref().is_none_or(|d| s.key.device_id == d))
                {
                    println!(
                        "{:>10} {:>6} {:<20} {:>10} {:<6} {}",
                        sensor.key.device_id,
                        sensor.key.address,
                        sensor.name,
                        sensor.value.map_or("-".to_string(), |v| format!("{:.2}", v)),
                        sensor.unit.as_deref().unwrap_or(""),
                        sensor.raw_status,
                    );
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}

fn media_manager(config: &ClientConfig, host: DesktopHost) -> MediaSessionManager {
    MediaSessionManager::new(config.media.clone(), Arc::new(host), Arc::new(HttpMediaTransport::new()))
}

async fn probe(config: ClientConfig, once: bool, stop: SignalOfStop) -> Result<()> {
    let manager = media_manager(&config, DesktopHost::new(".", CaptureSource::Microphone));
    let mut reachability = manager.watch_reachability();
    manager.start_probing();

    loop {
        tokio::select! {
            _ = stop.wait_cancellation() => break,
            changed = reachability.changed() => {
                if changed.is_err() {
                    break;
                }
                let reachable = *reachability.borrow_and_update();
                if let Some(reachable) = reachable {
                    println!(
                        "{} {}",
                        manager.endpoints().base(),
                        if reachable { "reachable" } else { "unreachable" }
                    );
                    if once {
                        break;
                    }
                }
            }
        }
    }

    manager.shutdown();
    Ok(())
}

async fn record(config: ClientConfig, matches: &ArgMatches, stop: SignalOfStop) -> Result<()> {
    let out = matches
        .get_one::<String>("out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("xiot-media"));
    let mut video = matches.get_flag("video");
    let audio = matches.get_flag("audio");
    if !video && !audio {
        video = true;
    }

    let manager = media_manager(&config, DesktopHost::new(&out, CaptureSource::Microphone));
    if video {
        manager.start_video_feed()?;
    }
    if audio {
        manager.start_audio_feed()?;
    }
    info!("Recording into {}", out.display());

    let limit = matches.get_one::<u64>("seconds").map(|s| Duration::from_secs(*s));
    run_until(&stop, limit).await;

    manager.shutdown();
    if let Some(e) = manager.last_error() {
        warn!("Last media error: {}", e);
    }
    Ok(())
}

async fn talk(config: ClientConfig, matches: &ArgMatches, stop: SignalOfStop) -> Result<()> {
    let source = match matches.get_one::<String>("input") {
        Some(path) => CaptureSource::File(PathBuf::from(path)),
        None => CaptureSource::Microphone,
    };
    let manager = media_manager(&config, DesktopHost::new(".", source));

    if !manager.start_push_to_talk().await {
        let reason = manager
            .last_error()
            .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        bail!("push-to-talk failed: {}", reason);
    }
    println!("Talking to {} (Ctrl-C to stop)", manager.endpoints().push_to_talk());

    let limit = matches.get_one::<u64>("seconds").map(|s| Duration::from_secs(*s));
    tokio::select! {
        _ = run_until(&stop, limit) => {}
        _ = async {
            while manager.state(SessionKind::PushToTalk).is_running() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        } => {}
    }

    manager.stop_push_to_talk();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    // stop cleanly on SIGINT
    let stop = SignalOfStop::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.cancel()).context("setting Ctrl-C handler")?;

    match matches.subcommand() {
        Some(("monitor", sub)) => monitor(config, sub.get_one::<String>("device").cloned(), stop).await,
        Some(("probe", sub)) => probe(config, sub.get_flag("once"), stop).await,
        Some(("display", sub)) => {
            let text = sub.get_one::<String>("text").context("missing text")?;
            let dispatcher = DisplayCommandDispatcher::new(&config.display)?;
            dispatcher
                .send(text, sub.get_one::<String>("color").map(String::as_str), sub.get_flag("alarm"))
                .await
                .with_context(|| format!("POST {}", dispatcher.url()))?;
            println!("Display updated");
            Ok(())
        }
        Some(("record", sub)) => record(config, sub, stop).await,
        Some(("talk", sub)) => talk(config, sub, stop).await,
        _ => bail!("unknown command"),
    }
}
