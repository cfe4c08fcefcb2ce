//! Fieldpoll CLI - one-shot device actions and frame tools
//!
//! Performs a single device action against a configured link and maps how
//! the transaction ended to the process exit code.

use bytes::BytesMut;
use clap::{Parser, Subcommand, ValueEnum};
use fieldpoll_core::cli::{print_exit_codes, CliResult, ExitCodes};
use fieldpoll_core::config::{self, AppConfig, LoggingConfig};
use fieldpoll_core::core::comm::{CommError, Completion, Dispatcher, PriorityClass};
use fieldpoll_core::core::protocol::checksum::{self, ChecksumType};
use fieldpoll_core::core::protocol::cohu::{self, Command, DropAddress};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Camera command for frame encoding
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FrameCommand {
    /// Pan at a speed in [-1, 1]
    Pan,
    /// Tilt at a speed in [-1, 1]
    Tilt,
    /// Zoom at a speed in [-1, 1]
    Zoom,
    /// Recall a preset
    Recall,
    /// Store a preset
    Store,
}

/// Fieldpoll CLI
#[derive(Parser, Debug)]
#[command(
    name = "fieldpoll-cli",
    version,
    about = "One-shot field device actions and protocol tools",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "FIELDPOLL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Give up waiting for the transaction after this many seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Verbose output (traffic trace)
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Compute a checksum over hex bytes
    Checksum {
        /// Algorithm (xor, folded, sum8)
        #[arg(short = 'a', long, default_value = "folded")]
        algorithm: String,

        /// Hex data
        data: String,
    },

    /// Encode a camera frame
    Frame {
        /// Drop address
        #[arg(short, long)]
        drop: u16,

        /// Command
        #[arg(value_enum)]
        command: FrameCommand,

        /// Speed in [-1, 1] or preset number
        #[arg(allow_hyphen_values = true)]
        value: f32,
    },

    /// Verify a camera frame given as hex
    Verify {
        /// Hex frame
        data: String,
    },

    /// Push settings to a ramp meter
    Settings {
        /// Device name
        device: String,
    },

    /// Query ramp meter status
    Status {
        /// Device name
        device: String,
    },

    /// Query controller firmware
    Firmware {
        /// Device name
        device: String,
    },

    /// Set a ramp meter release rate
    Rate {
        /// Device name
        device: String,
        /// Vehicles per hour
        rate: u32,
    },

    /// Turn a ramp meter beacon on or off
    Flash {
        /// Device name
        device: String,
        /// on or off
        state: String,
    },

    /// Move a camera
    Ptz {
        /// Device name
        device: String,
        /// Pan speed in [-1, 1]
        #[arg(allow_hyphen_values = true)]
        pan: f32,
        /// Tilt speed in [-1, 1]
        #[arg(allow_hyphen_values = true)]
        tilt: f32,
        /// Zoom speed in [-1, 1]
        #[arg(allow_hyphen_values = true)]
        zoom: f32,
    },

    /// Recall (or store) a camera preset
    Preset {
        /// Device name
        device: String,
        /// Preset number
        preset: u8,
        /// Store instead of recall
        #[arg(long)]
        store: bool,
    },

    /// Fetch an alert feed
    Fetch {
        /// Device name
        device: String,
    },

    /// Print the exit code table
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::ListPorts => list_ports(&cli),
        Commands::Checksum { algorithm, data } => checksum_cmd(&cli, algorithm, data),
        Commands::Frame {
            drop,
            command,
            value,
        } => frame(&cli, *drop, *command, *value),
        Commands::Verify { data } => verify(&cli, data),
        Commands::ExitCodes => {
            print_exit_codes();
            CliResult::success()
        }
        _ => run_action(&cli).await,
    };

    if let Some(msg) = result.message() {
        if result.is_success() {
            if !cli.quiet {
                println!("{}", msg);
            }
        } else {
            eprintln!("error: {}", msg);
        }
    }
    result.to_exit_code()
}

fn list_ports(cli: &Cli) -> CliResult {
    let ports = match fieldpoll_core::core::transport::list_ports() {
        Ok(ports) => ports,
        Err(e) => return CliResult::error(ExitCodes::PORT_NOT_FOUND, e.to_string()),
    };
    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            CliResult::success_with_message(
                serde_json::to_string_pretty(&json).unwrap_or_default(),
            )
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("{}", port.port_name);
            }
            CliResult::success()
        }
    }
}

fn parse_hex(data: &str) -> Result<Vec<u8>, CliResult> {
    let clean: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(clean)
        .map_err(|e| CliResult::error(ExitCodes::INVALID_ARGS, format!("bad hex: {}", e)))
}

fn checksum_cmd(cli: &Cli, algorithm: &str, data: &str) -> CliResult {
    let Ok(kind) = algorithm.parse::<ChecksumType>() else {
        return CliResult::error(
            ExitCodes::INVALID_ARGS,
            format!("unknown checksum {}", algorithm),
        );
    };
    let bytes = match parse_hex(data) {
        Ok(bytes) => bytes,
        Err(e) => return e,
    };
    let value = checksum::calculate(&bytes, kind);
    match cli.format {
        OutputFormat::Json => CliResult::success_with_message(
            serde_json::json!({ "algorithm": kind.name(), "checksum": format!("{:02X}", value) })
                .to_string(),
        ),
        OutputFormat::Text => CliResult::success_with_message(format!("{:02X}", value)),
    }
}

fn frame(cli: &Cli, drop: u16, command: FrameCommand, value: f32) -> CliResult {
    let drop = match DropAddress::new(drop) {
        Ok(drop) => drop,
        Err(e) => return e.into(),
    };
    let preset = value.clamp(0.0, 255.0) as u8;
    let command = match command {
        FrameCommand::Pan => Command::pan(value),
        FrameCommand::Tilt => Command::tilt(value),
        FrameCommand::Zoom => Command::zoom(value),
        FrameCommand::Recall => Command::RecallPreset(preset),
        FrameCommand::Store => Command::StorePreset(preset),
    };
    let mut buf = BytesMut::new();
    cohu::encode(drop, &command, &mut buf);
    let text = hex::encode_upper(&buf);
    match cli.format {
        OutputFormat::Json => CliResult::success_with_message(
            serde_json::json!({ "command": command.name(), "frame": text }).to_string(),
        ),
        OutputFormat::Text => {
            CliResult::success_with_message(format!("{} {}", command.name(), text))
        }
    }
}

fn verify(cli: &Cli, data: &str) -> CliResult {
    let bytes = match parse_hex(data) {
        Ok(bytes) => bytes,
        Err(e) => return e,
    };
    match cohu::verify_frame(&bytes) {
        Ok(frame) => {
            let msg = match cli.format {
                OutputFormat::Json => serde_json::json!({
                    "drop": frame.drop.value(),
                    "payload": hex::encode_upper(frame.payload),
                })
                .to_string(),
                OutputFormat::Text => format!(
                    "OK drop {} payload {}",
                    frame.drop,
                    hex::encode_upper(frame.payload)
                ),
            };
            CliResult::success_with_message(msg)
        }
        Err(e) => CliResult::error(ExitCodes::VALIDATION_FAILED, e.to_string()),
    }
}

fn device_name(command: &Commands) -> Option<&str> {
    match command {
        Commands::Settings { device }
        | Commands::Status { device }
        | Commands::Firmware { device }
        | Commands::Rate { device, .. }
        | Commands::Flash { device, .. }
        | Commands::Ptz { device, .. }
        | Commands::Preset { device, .. }
        | Commands::Fetch { device } => Some(device),
        _ => None,
    }
}

fn submit(dispatcher: &Dispatcher, command: &Commands) -> Result<Completion, CliResult> {
    let result: Result<Completion, CommError> = match command {
        Commands::Settings { device } => dispatcher.send_settings(device),
        Commands::Status { device } => dispatcher.query_status(device, PriorityClass::Command),
        Commands::Firmware { device } => dispatcher.query_firmware(device, PriorityClass::Command),
        Commands::Rate { device, rate } => dispatcher.set_release_rate(device, *rate),
        Commands::Flash { device, state } => {
            let on = match state.to_lowercase().as_str() {
                "on" | "1" | "true" => true,
                "off" | "0" | "false" => false,
                _ => {
                    return Err(CliResult::error(
                        ExitCodes::INVALID_ARGS,
                        format!("expected on or off, got {}", state),
                    ))
                }
            };
            dispatcher.set_flashing(device, on)
        }
        Commands::Ptz {
            device,
            pan,
            tilt,
            zoom,
        } => dispatcher.move_camera(device, *pan, *tilt, *zoom),
        Commands::Preset {
            device,
            preset,
            store,
        } => {
            if *store {
                dispatcher.store_preset(device, *preset)
            } else {
                dispatcher.recall_preset(device, *preset)
            }
        }
        Commands::Fetch { device } => dispatcher.fetch_feed(device, PriorityClass::Command),
        _ => return Err(CliResult::error(ExitCodes::INTERNAL_ERROR, "not a device action")),
    };
    result.map_err(CliResult::from)
}

async fn run_action(cli: &Cli) -> CliResult {
    let Some(name) = device_name(&cli.command) else {
        return CliResult::error(ExitCodes::INTERNAL_ERROR, "not a device action");
    };
    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let app = match app {
        Ok(app) => app,
        Err(e) => return e.into(),
    };
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    let logging = LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    };
    let _guard = config::init_logging(&logging);

    if app.device(name).is_none() {
        return CliResult::device_not_found(name);
    }
    let dispatcher = match app.start(64) {
        Ok(dispatcher) => dispatcher,
        Err(e) => return e.into(),
    };

    let result = match submit(&dispatcher, &cli.command) {
        Ok(completion) => {
            match tokio::time::timeout(Duration::from_secs(cli.timeout), completion.wait()).await
            {
                Ok(result) => CliResult::from_operation(&result),
                Err(_) => CliResult::error(ExitCodes::COMM_ERROR, "timed out waiting for device"),
            }
        }
        Err(e) => e,
    };

    let result = match (&result, dispatcher.device(name)) {
        (CliResult::Success(_), Some(device)) => {
            let state = device.state();
            let msg = match cli.format {
                OutputFormat::Json => serde_json::to_string_pretty(&state).unwrap_or_default(),
                OutputFormat::Text => format!("{}: {:?}", name, state),
            };
            CliResult::success_with_message(msg)
        }
        _ => result,
    };

    dispatcher.shutdown().await;
    result
}
