//! Device emulator: the command protocol core wired to TCP listeners and a
//! synthetic frame source.

use crate::config::DeviceConfig;
use anyhow::{Context, Result};
use log::*;
use senxor_cmd_lib::{
    analysis::{AnalysisEngine, FrameGeometry},
    broker::{MemoryRegisters, RegisterBroker},
    capture::{CaptureTask, FrameSource, PollState},
    checksum::Crc16Xmodem,
    dispatcher::Dispatcher,
    registers::VirtualRegisterTable,
    session::{serve_connection, serve_frame_client, FrameStream, SharedWriter},
    store::YamlFileStore,
};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Ambient temperature of the synthetic scene in deci-Kelvin.
const AMBIENT: u16 = 2930;
const HOT_SPOT: u16 = 400;

/// A hot spot wandering over an ambient background.
struct SyntheticFrames {
    geometry: FrameGeometry,
    interval: Duration,
    tick: usize,
}

impl FrameSource for SyntheticFrames {
    fn capture(&mut self) -> Option<Vec<u16>> {
        thread::sleep(self.interval);
        self.tick = self.tick.wrapping_add(1);
        let width = self.geometry.width as usize;
        let height = self.geometry.height as usize;
        let (hot_x, hot_y) = (self.tick % width, (self.tick / width) % height);

        let mut raw = vec![0; self.geometry.raw_len()];
        let image = &mut raw[width * self.geometry.header_rows as usize..];
        for (i, pixel) in image.iter_mut().enumerate() {
            let distance = (i % width).abs_diff(hot_x) + (i / width).abs_diff(hot_y);
            *pixel = AMBIENT + HOT_SPOT.saturating_sub(distance as u16 * 10);
        }
        Some(raw)
    }
}

fn accept_frame_clients(
    listener: TcpListener,
    stream: Arc<FrameStream<TcpStream>>,
    dispatcher: Dispatcher,
) {
    for client in listener.incoming() {
        let client = match client {
            Ok(client) => client,
            Err(error) => {
                warn!("Frame port accept failed: {error}");
                continue;
            }
        };
        info!("Frame client connected from {:?}", client.peer_addr().ok());
        let writer = match client.try_clone() {
            Ok(socket) => SharedWriter::new(socket),
            Err(error) => {
                warn!("Cannot clone frame client socket: {error}");
                continue;
            }
        };
        if let Err(error) = serve_frame_client(client, writer, &stream, &dispatcher) {
            warn!("Frame client error: {error}");
        }
        info!("Frame client disconnected");
    }
}

pub fn run(config: DeviceConfig) -> Result<()> {
    let store = YamlFileStore::open(&config.store_file)
        .with_context(|| format!("Cannot open store {:?}", config.store_file))?;
    let mut table = VirtualRegisterTable::load(config.geometry, Box::new(store));
    table.set_device_id(config.device_id);
    let table = Arc::new(Mutex::new(table));

    let broker = RegisterBroker::new(
        table.clone(),
        Arc::new(Mutex::new(MemoryRegisters::new())),
        Arc::new(config.version),
    );
    let poll = Arc::new(PollState::new());
    let frame_stream = Arc::new(FrameStream::<TcpStream>::new(poll.clone()));

    let mut engine = AnalysisEngine::new(table);
    engine.add_listener(|values: [u16; 8]| debug!("Broadcast update: {values:?}"));
    let source = SyntheticFrames {
        geometry: config.geometry,
        interval: config.frame_interval,
        tick: 0,
    };
    let capture = CaptureTask::new(source, engine, broker.clone(), poll.clone())
        .with_sink(frame_stream.clone());
    let stop = Arc::new(AtomicBool::new(false));
    let capture_stop = stop.clone();
    thread::Builder::new()
        .name("capture".into())
        .spawn(move || capture.run(&capture_stop))
        .context("Cannot start capture thread")?;

    let frame_listener = TcpListener::bind((config.bind_address.as_str(), config.frame_port))
        .with_context(|| format!("Cannot bind frame port {}", config.frame_port))?;
    info!("Frame server listening on port {}", config.frame_port);
    let frame_dispatcher = Dispatcher::new(broker.clone(), poll.clone(), Crc16Xmodem);
    thread::Builder::new()
        .name("frames".into())
        .spawn(move || accept_frame_clients(frame_listener, frame_stream, frame_dispatcher))
        .context("Cannot start frame server thread")?;

    let dispatcher = Dispatcher::new(broker, poll.clone(), Crc16Xmodem);
    let listener = TcpListener::bind((config.bind_address.as_str(), config.command_port))
        .with_context(|| format!("Cannot bind command port {}", config.command_port))?;
    println!(
        "Serving commands on {}:{} and frames on port {}",
        config.bind_address, config.command_port, config.frame_port
    );

    // One command client at a time.
    for client in listener.incoming() {
        let client = match client {
            Ok(client) => client,
            Err(error) => {
                warn!("Command port accept failed: {error}");
                continue;
            }
        };
        info!("Command client connected from {:?}", client.peer_addr().ok());
        let writer = SharedWriter::new(client.try_clone().context("Cannot clone client socket")?);
        poll.set_command_connected(true);
        if let Err(error) = serve_connection(client, &writer, &dispatcher) {
            warn!("Command client error: {error}");
        }
        poll.set_command_connected(false);
        info!("Command client disconnected");
    }

    stop.store(true, Ordering::Relaxed);
    Ok(())
}
