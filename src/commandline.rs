use crate::config::DeviceConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use senxor_cmd_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM3")
    } else {
        String::from("/dev/ttyACM0") // USB CDC device on Linux.
    }
}

fn parse_register(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid register address format: {e}"))
}

fn parse_value(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid register value format: {e}"))
}

fn parse_poll_frequency(s: &str) -> Result<u8, String> {
    let hz = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid frequency format: {e}"))?;
    if hz > proto::POLL_MAX_FREQ_HZ {
        return Err(format!(
            "Frequency {hz} Hz exceeds the maximum of {} Hz",
            proto::POLL_MAX_FREQ_HZ
        ));
    }
    Ok(hz)
}

fn parse_quadrant(s: &str) -> Result<proto::Quadrant, String> {
    s.parse::<proto::Quadrant>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the command port of an appliance via TCP.
    Tcp {
        /// The IP address or hostname and port of the command port.
        /// Example: "192.168.4.1:3334".
        #[arg(verbatim_doc_comment)]
        address: String,

        /// Commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to an appliance via its USB serial port.
    Serial {
        /// Serial port device name.
        /// Examples: "/dev/ttyACM0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
        device: String,

        /// Baud rate for serial communication.
        #[arg(long, default_value_t = senxor_cmd_lib::serial::DEFAULT_BAUD_RATE)]
        baud_rate: u32,

        /// Commands for the connected device.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Run a device emulator serving the command and frame ports.
    /// Synthetic frames feed the quadrant analysis.
    #[clap(verbatim_doc_comment)]
    Serve {
        /// The configuration file of the emulator.
        #[arg(long, default_value = DeviceConfig::DEFAULT_CONFIG_FILE)]
        config_file: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read one register.
    /// Analysis registers (0xC0 to 0xD5) are 16 bit, all others 8 bit.
    #[clap(verbatim_doc_comment)]
    Read {
        /// Register address, decimal or hexadecimal (e.g. "0xC2").
        #[arg(value_parser = parse_register)]
        address: u8,
    },

    /// Write one register.
    Write {
        /// Register address, decimal or hexadecimal (e.g. "0xB1").
        #[arg(value_parser = parse_register)]
        address: u8,
        /// Value to write, decimal or hexadecimal.
        #[arg(value_parser = parse_value)]
        value: u8,
    },

    /// Read several registers with one request.
    ReadSeq {
        /// Register addresses, decimal or hexadecimal.
        #[arg(value_parser = parse_register, required = true, num_args = 1..)]
        addresses: Vec<u8>,
    },

    /// Set the frequency at which the device refreshes the analysis registers
    /// while no frame client is connected. "0" stops polling.
    #[clap(verbatim_doc_comment)]
    Poll {
        /// Frequency in Hz (0 to 25).
        #[arg(value_parser = parse_poll_frequency)]
        frequency: u8,
    },

    /// Read and display the quadrant split, maxima, centres and burners.
    Quadrants,

    /// Set the quadrant split.
    SetSplit {
        /// Column dividing the left from the right quadrants.
        #[arg(value_parser = parse_value)]
        xsplit: u8,
        /// Row dividing the top from the bottom quadrants.
        #[arg(value_parser = parse_value)]
        ysplit: u8,
    },

    /// Set the burner point of a quadrant.
    /// The device clamps the coordinates into the quadrant.
    #[clap(verbatim_doc_comment)]
    SetBurner {
        /// Quadrant "a" (top left), "b" (top right), "c" (bottom left) or "d" (bottom right).
        #[arg(value_parser = parse_quadrant)]
        quadrant: proto::Quadrant,
        #[arg(value_parser = parse_value)]
        x: u8,
        #[arg(value_parser = parse_value)]
        y: u8,
    },

    /// Poll the device at the given frequency and continuously print the quadrants.
    Watch {
        /// Device side poll frequency in Hz.
        #[arg(short, long, default_value_t = 2, value_parser = parse_poll_frequency)]
        frequency: u8,
        /// Interval for printing the quadrants (e.g., "1s", "500ms").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "1s")]
        interval: Duration,
    },

    /// Restore the default split and move every burner to its quadrant centre.
    ResetAnalysis,
}

const fn about_text() -> &'static str {
    "SenXor command tool - Access the registers and quadrant analysis of SenXor thermal appliances."
}

#[derive(Parser, Debug)]
#[command(name="senxorctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and device-specific commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// I/O timeout for each reply.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Send "XXXX" instead of the additive checksum with every request.
    #[arg(global = true, long)]
    pub no_checksum: bool,
}
