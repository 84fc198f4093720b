use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use e32_link::util::{decode_hex, encode_hex};
use e32_link::{
    Address, BroadcastEvent, ControlPins, MockPins, RoundTripOutcome, Settings, SimulatedModule,
    Station, Transport,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "e32-cli")]
#[command(about = "CLI tool for EBYTE E32 LoRa modules")]
struct Cli {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the settings file
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long)]
    baudrate: Option<u32>,

    /// Talk to an in-process simulated module instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print configuration and version
    Info,
    /// Reset the module and read its configuration back
    Reset,
    /// Change address and channel
    WriteConfig {
        #[arg(long, value_parser = parse_u16)]
        address: Option<u16>,
        #[arg(long)]
        channel: Option<u8>,
        /// Do not persist across power cycles
        #[arg(long)]
        volatile: bool,
    },
    /// Measure round trips against an echoing peer
    Ping {
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
        #[arg(short, long, default_value = "48")]
        size: usize,
    },
    /// Print broadcasts until interrupted
    Listen,
    /// Send one broadcast
    Broadcast {
        message: String,
        /// Treat the message as hex-encoded bytes
        #[arg(long)]
        hex: bool,
    },
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    e32_link::logging::init_logger_with_default("info");

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(port) = cli.port.clone() {
        settings.serial.port = port;
    }
    if let Some(baudrate) = cli.baudrate {
        settings.serial.baudrate = baudrate;
    }

    if cli.simulate {
        let pins = MockPins::new();
        let (_module, stream) = SimulatedModule::spawn(pins.clone());
        let station = Station::with_transport(Transport::new(stream), pins, settings);
        return run(station, cli.command).await;
    }

    #[cfg(feature = "raspberry-pi")]
    let pins = e32_link::RaspberryPiPins::new(&settings.pins).context("claiming GPIO")?;
    #[cfg(not(feature = "raspberry-pi"))]
    let pins = {
        log::warn!("Built without GPIO support; mode lines are not driven");
        MockPins::new()
    };

    let station = Station::open(settings, pins).context("opening serial port")?;
    run(station, cli.command).await
}

async fn run<P: ControlPins>(mut station: Station<P>, command: Commands) -> Result<()> {
    let config = station.start().await.context("module setup failed")?;

    match command {
        Commands::Info => {
            let version = station.device().version()?;
            println!("{version}");
            println!("{config}");
            println!("frequency: {} MHz", config.frequency_mhz());
        }
        Commands::Reset => {
            let device = station.device_mut();
            device.set_mode(e32_link::OperatingMode::Sleep);
            let config = device.reset_config().await.context("reset failed")?;
            println!("{config}");
        }
        Commands::WriteConfig {
            address,
            channel,
            volatile,
        } => {
            let mut register = config.with_persistence(!volatile);
            if let Some(address) = address {
                register = register.with_address(Address(address));
            }
            if let Some(channel) = channel {
                register = register.with_channel(channel);
            }
            let written = station
                .reconfigure(register)
                .await
                .context("writing configuration")?;
            println!("{written}");
        }
        Commands::Ping { count, size } => {
            let round_tripper = station.round_tripper().clone();
            let mut wait = round_tripper.config().wait_provider();
            let mut latencies = Vec::with_capacity(count);

            for i in 0..count {
                let result = round_tripper.do_round_trip(size, &mut wait).await?;
                match &result.outcome {
                    RoundTripOutcome::Reply { reply, latency } => {
                        let intact = reply == &result.payload;
                        println!(
                            "#{i}: {} bytes in {latency:?}{}",
                            reply.len(),
                            if intact { "" } else { " (payload differs)" }
                        );
                        latencies.push(*latency);
                    }
                    RoundTripOutcome::Dropped => println!("#{i}: no reply"),
                }
            }
            print_summary(count, &latencies);
            println!("{:?}", station.link().stats());
        }
        Commands::Listen => {
            let layer = station.broadcaster()?;
            let mut events = layer.subscribe();
            println!("listening as {}", layer.source());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(BroadcastEvent::Message(envelope)) => println!(
                            "{} -> {} #{}: {}",
                            envelope.source(),
                            envelope.destination(),
                            envelope.sequence(),
                            String::from_utf8_lossy(envelope.payload())
                        ),
                        Ok(BroadcastEvent::Error(err)) => println!("bad envelope: {err}"),
                        Ok(BroadcastEvent::Sent(_)) => {}
                        Err(_) => break,
                    }
                }
            }
        }
        Commands::Broadcast { message, hex } => {
            let payload = if hex {
                decode_hex(&message).context("decoding hex message")?
            } else {
                message.into_bytes()
            };
            let layer = station.broadcaster()?;
            let envelope = layer.send(payload).await?;
            println!(
                "sent #{} from {}: {}",
                envelope.sequence(),
                envelope.source(),
                encode_hex(&envelope.serialize())
            );
        }
    }

    station.close()?;
    Ok(())
}

fn print_summary(sent: usize, latencies: &[Duration]) {
    let received = latencies.len();
    let loss = if sent == 0 {
        0.0
    } else {
        100.0 * (sent - received) as f64 / sent as f64
    };
    println!("{sent} sent, {received} received, {loss:.1}% loss");

    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let avg = latencies.iter().sum::<Duration>() / received as u32;
        println!("latency min/avg/max = {min:?}/{avg:?}/{max:?}");
    }
}
