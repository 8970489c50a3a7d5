//! SenXor Command Tool
//!
//! A command-line interface (CLI) application for SenXor thermal imaging
//! appliances speaking the `#LEN CMD DATA CRC` command protocol over TCP or
//! the USB serial port.
//!
//! This tool allows users to:
//! - Read and write single registers or read a sequence of registers.
//! - Set the frequency of the device side analysis polling.
//! - Display the quadrant maxima, centres and burner temperatures.
//! - Move the quadrant split and the burner points.
//! - Watch the analysis registers continuously.
//! - Run a device emulator serving synthetic frames.
//!
//! The CLI leverages the `senxor_cmd_lib` crate for the protocol and the client.

use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliCommands, CliConnection};
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use senxor_cmd_lib::{analysis::FrameGeometry, client::Client, parser::RequestChecksum};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::{panic, time::Duration};

mod commandline;
mod config;
mod serve;

/// Any byte stream a [`Client`] can talk through.
trait Transport: Read + Write {}
impl<T: Read + Write> Transport for T {}

type DeviceClient = Client<Box<dyn Transport>>;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

macro_rules! print_quadrants {
    ($device:expr) => {
        let report = $device
            .read_quadrants()
            .with_context(|| "Cannot read analysis registers")?;
        println!("{report}");
    };
}

/// Creates a client based on the provided command-line arguments.
fn create_client(
    connection: &CliConnection,
    timeout: Duration,
) -> Result<(DeviceClient, &CliCommands)> {
    let (transport, command) = match connection {
        CliConnection::Tcp { address, command } => {
            info!("Attempting to connect via TCP to {address}...");
            let stream = TcpStream::connect(address.as_str())
                .with_context(|| format!("Failed to connect to device at {address}"))?;
            stream
                .set_read_timeout(Some(timeout))
                .context("Cannot set read timeout")?;
            stream
                .set_write_timeout(Some(timeout))
                .context("Cannot set write timeout")?;
            (Box::new(stream) as Box<dyn Transport>, command)
        }
        CliConnection::Serial {
            device,
            baud_rate,
            command,
        } => {
            info!("Attempting to open serial port {device} (Baud: {baud_rate})...");
            let port = senxor_cmd_lib::serial::open(device, *baud_rate, timeout)
                .with_context(|| format!("Cannot open serial port {device}"))?;
            (Box::new(port) as Box<dyn Transport>, command)
        }
        CliConnection::Serve { .. } => unreachable!("Serve should be handled earlier."),
    };
    Ok((Client::new(transport), command))
}

/// Resets split and burners after confirmation.
fn handle_reset_analysis(client: &mut DeviceClient) -> Result<()> {
    info!("Executing: Reset Analysis");
    let geometry = FrameGeometry::default();
    println!(
        "This restores the quadrant split to x={}, y={} and moves every burner \
         to the centre of its quadrant.",
        geometry.default_split().0,
        geometry.default_split().1
    );
    if !Confirm::new()
        .with_prompt("Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Reset aborted by user.");
        return Ok(());
    }
    client
        .reset_analysis(geometry)
        .with_context(|| "Failed to reset the analysis settings")?;
    println!("Analysis settings reset successfully.");
    Ok(())
}

fn execute(client: &mut DeviceClient, command: &CliCommands) -> Result<()> {
    match command {
        CliCommands::Read { address } => {
            info!("Executing: Read Register {address:#04X}");
            let value = client
                .read_register(*address)
                .with_context(|| format!("Cannot read register {address:#04X}"))?;
            println!("{address:#04X}: {value} ({value:#X})");
        }
        CliCommands::Write { address, value } => {
            info!("Executing: Write Register {address:#04X} = {value:#04X}");
            client
                .write_register(*address, *value)
                .with_context(|| format!("Failed to write register {address:#04X}"))?;
            println!("Register {address:#04X} set to {value:#04X} successfully.");
        }
        CliCommands::ReadSeq { addresses } => {
            info!("Executing: Read Register Sequence {addresses:02X?}");
            let values = client
                .read_registers(addresses)
                .with_context(|| "Cannot read register sequence")?;
            for (address, value) in values {
                println!("{address:#04X}: {value} ({value:#X})");
            }
        }
        CliCommands::Poll { frequency } => {
            info!("Executing: Set Poll Frequency to {frequency} Hz");
            client
                .set_poll_frequency(*frequency)
                .with_context(|| format!("Failed to set poll frequency to {frequency} Hz"))?;
            if *frequency == 0 {
                println!("Analysis polling stopped.");
            } else {
                println!("Analysis polling set to {frequency} Hz.");
            }
        }
        CliCommands::Quadrants => {
            info!("Executing: Read Quadrants");
            print_quadrants!(client);
        }
        CliCommands::SetSplit { xsplit, ysplit } => {
            info!("Executing: Set Split to x={xsplit}, y={ysplit}");
            client
                .set_split(*xsplit, *ysplit)
                .with_context(|| format!("Failed to set split to x={xsplit}, y={ysplit}"))?;
            println!("Split set successfully, the device clamps it to the frame.");
        }
        CliCommands::SetBurner { quadrant, x, y } => {
            info!("Executing: Set Burner {quadrant} to ({x}, {y})");
            client
                .set_burner(*quadrant, *x, *y)
                .with_context(|| format!("Failed to set burner of quadrant {quadrant}"))?;
            let burner = client
                .read_quadrants()
                .with_context(|| "Cannot read analysis registers")?
                .burner(*quadrant);
            println!(
                "Burner {quadrant} now at ({}, {}), temperature {}.",
                burner.x, burner.y, burner.temperature
            );
        }
        CliCommands::Watch {
            frequency,
            interval,
        } => {
            info!("Starting watch mode: frequency={frequency} Hz, interval={interval:?}");
            client
                .set_poll_frequency(*frequency)
                .with_context(|| format!("Failed to set poll frequency to {frequency} Hz"))?;
            loop {
                debug!("Watch: Reading analysis registers...");
                print_quadrants!(client);
                std::thread::sleep(*interval);
            }
        }
        CliCommands::ResetAnalysis => handle_reset_analysis(client)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "SenXor CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    if let CliConnection::Serve { config_file } = &args.connection {
        let config = config::DeviceConfig::load(config_file)?;
        return serve::run(config);
    }

    let (mut client, command) = create_client(&args.connection, args.timeout)?;
    if args.no_checksum {
        client.set_request_checksum(RequestChecksum::Bypass);
    }
    execute(&mut client, command)
}
