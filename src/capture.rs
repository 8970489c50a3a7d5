//! Capture scheduling.
//!
//! The capture task runs in one of three modes, chosen on every iteration:
//! frames are streamed while a frame client is connected, captured at the
//! `POLL` frequency while only a command client asks for it, and otherwise the
//! task idles.

use crate::analysis::AnalysisEngine;
use crate::broker::RegisterBroker;
use crate::dispatcher::PollControl;
use crate::protocol::{RegisterAddress, POLL_MAX_FREQ_HZ};
use log::*;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bits of the capture control register.
pub const CAPTURE_START: u8 = 0x01;
pub const CAPTURE_CONTINUOUS: u8 = 0x02;

/// Delay between iterations while frames are captured.
pub const ACTIVE_DELAY: Duration = Duration::from_millis(1);
/// Delay between iterations while idle.
pub const IDLE_DELAY: Duration = Duration::from_millis(100);

/// Connection state shared between the transports and the capture task.
#[derive(Debug, Default)]
pub struct PollState {
    frequency_hz: AtomicU8,
    streaming: AtomicBool,
    command_connected: AtomicBool,
}

impl PollState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_frequency_hz(&self) -> u8 {
        self.frequency_hz.load(Ordering::Relaxed)
    }

    pub fn set_streaming(&self, active: bool) {
        self.streaming.store(active, Ordering::Relaxed);
    }

    pub fn is_command_connected(&self) -> bool {
        self.command_connected.load(Ordering::Relaxed)
    }

    /// Tracks the command client. A disconnect stops polling.
    pub fn set_command_connected(&self, connected: bool) {
        self.command_connected.store(connected, Ordering::Relaxed);
        if !connected && self.frequency_hz.swap(0, Ordering::Relaxed) != 0 {
            info!("Command client gone, poll frequency reset");
        }
    }

    pub fn mode(&self) -> CaptureMode {
        CaptureMode::select(
            self.is_streaming_session_active(),
            self.is_command_connected(),
            self.poll_frequency_hz(),
        )
    }
}

impl PollControl for PollState {
    fn set_poll_frequency_hz(&self, hz: u8) {
        let hz = hz.min(POLL_MAX_FREQ_HZ);
        self.frequency_hz.store(hz, Ordering::Relaxed);
        info!("Poll frequency set to {hz} Hz");
    }

    fn is_streaming_session_active(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Every frame is analysed and sent to the frame client.
    Streaming,
    /// Frames are captured and analysed, but not sent, once per interval.
    Polling { interval: Duration },
    Idle,
}

impl CaptureMode {
    pub fn select(streaming: bool, command_connected: bool, poll_hz: u8) -> Self {
        if streaming {
            CaptureMode::Streaming
        } else if command_connected && poll_hz > 0 {
            CaptureMode::Polling {
                interval: Duration::from_millis(1000 / poll_hz as u64),
            }
        } else {
            CaptureMode::Idle
        }
    }
}

/// Delivers raw sensor buffers, header rows included.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Option<Vec<u16>>;
}

/// Receives every raw frame while streaming.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, raw: &[u16]);
}

pub struct CaptureTask<S> {
    source: S,
    engine: AnalysisEngine,
    broker: RegisterBroker,
    poll: Arc<PollState>,
    sink: Option<Arc<dyn FrameSink>>,
    last_poll: Option<Instant>,
}

impl<S: FrameSource> CaptureTask<S> {
    pub fn new(
        source: S,
        engine: AnalysisEngine,
        broker: RegisterBroker,
        poll: Arc<PollState>,
    ) -> Self {
        Self {
            source,
            engine,
            broker,
            poll,
            sink: None,
            last_poll: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn capture_control(&self) -> u8 {
        self.broker
            .read(RegisterAddress::new(RegisterAddress::CAPTURE_CONTROL))
            .value() as u8
    }

    fn set_capture_control(&self, value: u8) {
        self.broker
            .write(RegisterAddress::new(RegisterAddress::CAPTURE_CONTROL), value);
    }

    fn is_capturing(control: u8) -> bool {
        control & (CAPTURE_START | CAPTURE_CONTINUOUS) != 0
    }

    fn analyse(&mut self) -> Option<Vec<u16>> {
        let raw = self.source.capture()?;
        if let Err(error) = self.engine.recompute_raw(&raw) {
            warn!("Frame dropped: {error}");
            return None;
        }
        Some(raw)
    }

    /// Runs one iteration and returns the delay before the next one.
    pub fn step(&mut self) -> Duration {
        match self.poll.mode() {
            CaptureMode::Streaming => {
                if Self::is_capturing(self.capture_control()) {
                    if let (Some(raw), Some(sink)) = (self.analyse(), self.sink.as_ref()) {
                        sink.send_frame(&raw);
                    }
                }
                ACTIVE_DELAY
            }
            CaptureMode::Polling { interval } => {
                let now = Instant::now();
                if self
                    .last_poll
                    .map_or(true, |last| now.duration_since(last) >= interval)
                {
                    self.last_poll = Some(now);
                    let previous = self.capture_control();
                    let started = !Self::is_capturing(previous);
                    if started {
                        self.set_capture_control(CAPTURE_START | CAPTURE_CONTINUOUS);
                    }
                    self.analyse();
                    if started {
                        self.set_capture_control(0);
                    }
                }
                ACTIVE_DELAY
            }
            CaptureMode::Idle => IDLE_DELAY,
        }
    }

    /// Steps until `stop` is raised.
    pub fn run(mut self, stop: &AtomicBool) {
        info!("Capture task started");
        while !stop.load(Ordering::Relaxed) {
            let delay = self.step();
            std::thread::sleep(delay);
        }
        info!("Capture task stopped");
    }
}
