// CLI entry point for the standalone netplay server.
//
// Loads an optional JSON config, applies CLI overrides, installs a `tracing`
// fmt subscriber, and runs `NetplayService` until it finishes. The service
// serves TCP and UDP on one port number; with `--port 0` (the default) the
// OS picks it and it is logged once both sockets are bound.
//
// There is no signal handling: the process exits on SIGINT/SIGTERM by
// default and the server threads are torn down with it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use netplay_protocol::PlayerNumber;
use netplay_server::config::ServerConfig;
use netplay_server::event::{NetplayEvent, ServiceEvent};
use netplay_server::service::NetplayService;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Lockstep netplay server
#[derive(Parser, Debug)]
#[command(name = "netplay-server")]
#[command(about = "Lockstep netplay server (UDP input exchange + TCP session channel)", long_about = None)]
struct Args {
    /// JSON config file; CLI flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for both TCP and UDP (0 lets the OS choose)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Client input-queue depth the adaptive buffer aims for
    #[arg(long)]
    buffer_target: Option<u8>,

    /// Per-player input delay as PLAYER=FRAMES (players numbered 1-4).
    /// Repeatable.
    #[arg(long = "input-delay", value_parser = parse_input_delay)]
    input_delay: Vec<(PlayerNumber, u32)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn parse_input_delay(raw: &str) -> Result<(PlayerNumber, u32), String> {
    let (player, frames) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PLAYER=FRAMES, got {raw:?}"))?;
    let player: u8 = player
        .trim()
        .parse()
        .map_err(|e| format!("bad player {player:?}: {e}"))?;
    let player = player
        .checked_sub(1)
        .and_then(|index| PlayerNumber::new(index).ok())
        .ok_or_else(|| format!("player must be 1-4, got {player}"))?;
    let frames = frames
        .trim()
        .parse()
        .map_err(|e| format!("bad frame count {frames:?}: {e}"))?;
    Ok((player, frames))
}

fn build_config(args: &Args) -> Result<ServerConfig, netplay_server::ServerError> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(target) = args.buffer_target {
        config.buffer_target = target;
    }
    for &(player, frames) in &args.input_delay {
        config.set_input_delay(player, Some(frames));
    }
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "bad configuration");
            return ExitCode::FAILURE;
        }
    };

    let (service, events) = match NetplayService::start(config) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start netplay service");
            return ExitCode::FAILURE;
        }
    };

    let mut exit = ExitCode::SUCCESS;
    for event in events {
        match event {
            ServiceEvent::PortObtained(port) => info!(port, "netplay server ready"),
            ServiceEvent::Netplay(NetplayEvent::Desync { vi_count }) => {
                warn!(vi_count, "clients desynced");
            }
            ServiceEvent::Netplay(NetplayEvent::PlayerDisconnected {
                player,
                registration,
            }) => info!(%player, registration = registration.0, "player left"),
            ServiceEvent::StartFailed(reason) => {
                error!(%reason, "netplay server failed to start");
                exit = ExitCode::FAILURE;
            }
            ServiceEvent::Finished => break,
        }
    }
    service.shutdown();
    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_delay_flag_is_one_based() {
        let (player, frames) = parse_input_delay("2=3").unwrap();
        assert_eq!(player, PlayerNumber::new(1).unwrap());
        assert_eq!(frames, 3);
    }

    #[test]
    fn input_delay_flag_rejects_bad_values() {
        assert!(parse_input_delay("0=3").is_err());
        assert!(parse_input_delay("5=3").is_err());
        assert!(parse_input_delay("1").is_err());
        assert!(parse_input_delay("1=x").is_err());
    }

    #[test]
    fn cli_overrides_defaults() {
        let args = Args::parse_from([
            "netplay-server",
            "--port",
            "45000",
            "--buffer-target",
            "4",
            "--input-delay",
            "1=2",
            "--input-delay",
            "4=5",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.port, 45000);
        assert_eq!(config.buffer_target, 4);
        assert_eq!(config.input_delay, [Some(2), None, None, Some(5)]);
    }
}
