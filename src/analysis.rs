//! Quadrant and burner analysis of captured thermal frames.
//!
//! Each frame is split into the quadrants A (top left), B (top right),
//! C (bottom left) and D (bottom right) at the current `xsplit`/`ysplit`.
//! One pass over the image yields the maximum of every quadrant; the value of
//! the pixel at each quadrant's centre and at each burner point is sampled
//! directly.

use crate::error::{Error, Result};
use crate::lock;
use crate::protocol::Quadrant;
use crate::registers::{QuadrantValues, VirtualRegisterTable};
use log::*;
use std::sync::{Arc, Mutex};

/// Dimensions of the sensor image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FrameGeometry {
    pub width: u8,
    pub height: u8,
    /// Rows of metadata the sensor sends ahead of the image.
    pub header_rows: u8,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            width: 80,
            height: 62,
            header_rows: 2,
        }
    }
}

impl FrameGeometry {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of 16 bit words in a raw sensor buffer, header included.
    pub fn raw_len(&self) -> usize {
        self.width as usize * (self.height as usize + self.header_rows as usize)
    }

    /// The split used when none is persisted: the middle of the frame.
    pub fn default_split(&self) -> (u8, u8) {
        (self.width / 2, self.height / 2)
    }
}

/// One thermal image, row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermalFrame {
    geometry: FrameGeometry,
    pixels: Vec<u16>,
}

impl ThermalFrame {
    pub fn new(geometry: FrameGeometry, pixels: Vec<u16>) -> Result<Self> {
        if pixels.len() != geometry.pixel_count() {
            return Err(Error::FrameSize {
                expected: geometry.pixel_count(),
                actual: pixels.len(),
            });
        }
        Ok(Self { geometry, pixels })
    }

    /// Builds a frame from a raw sensor buffer by skipping its header rows.
    pub fn from_raw(geometry: FrameGeometry, raw: &[u16]) -> Result<Self> {
        if raw.len() != geometry.raw_len() {
            return Err(Error::FrameSize {
                expected: geometry.raw_len(),
                actual: raw.len(),
            });
        }
        let header = geometry.width as usize * geometry.header_rows as usize;
        Self::new(geometry, raw[header..].to_vec())
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Value at `(x, y)`, coordinates are clamped into the frame.
    pub fn pixel(&self, x: u8, y: u8) -> u16 {
        let x = x.min(self.geometry.width.saturating_sub(1)) as usize;
        let y = y.min(self.geometry.height.saturating_sub(1)) as usize;
        self.pixels
            .get(y * self.geometry.width as usize + x)
            .copied()
            .unwrap_or_default()
    }
}

/// The values derived from one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisResult {
    pub quadrants: [QuadrantValues; 4],
    pub burner_temperatures: [u16; 4],
}

impl AnalysisResult {
    /// `[Amax, Acenter, Bmax, Bcenter, Cmax, Ccenter, Dmax, Dcenter]`
    pub fn broadcast_values(&self) -> [u16; 8] {
        let mut values = [0; 8];
        for (i, quadrant) in self.quadrants.iter().enumerate() {
            values[2 * i] = quadrant.max;
            values[2 * i + 1] = quadrant.center;
        }
        values
    }
}

/// Analyses `frame` with the split and burner points currently in `table`.
pub fn analyze(frame: &ThermalFrame, table: &VirtualRegisterTable) -> AnalysisResult {
    let xsplit = table.xsplit() as usize;
    let ysplit = table.ysplit() as usize;
    let width = frame.geometry.width as usize;

    let mut result = AnalysisResult::default();
    for (i, pixel) in frame.pixels.iter().enumerate() {
        let quadrant = Quadrant::of_pixel(i % width, i / width, xsplit, ysplit);
        let max = &mut result.quadrants[quadrant.index()].max;
        *max = (*max).max(*pixel);
    }
    for quadrant in Quadrant::ALL {
        let (cx, cy) = table.center_of(quadrant);
        result.quadrants[quadrant.index()].center = frame.pixel(cx, cy);
        let burner = table.burner(quadrant);
        result.burner_temperatures[quadrant.index()] = frame.pixel(burner.x, burner.y);
    }
    result
}

/// Receives the broadcast values after every analysis pass.
pub trait AnalysisListener: Send + Sync {
    fn on_analysis_updated(&self, values: [u16; 8]);
}

impl<F> AnalysisListener for F
where
    F: Fn([u16; 8]) + Send + Sync,
{
    fn on_analysis_updated(&self, values: [u16; 8]) {
        self(values)
    }
}

pub struct AnalysisEngine {
    table: Arc<Mutex<VirtualRegisterTable>>,
    listeners: Vec<Box<dyn AnalysisListener>>,
}

impl AnalysisEngine {
    pub fn new(table: Arc<Mutex<VirtualRegisterTable>>) -> Self {
        Self {
            table,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: impl AnalysisListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Recomputes every derived register from `frame`.
    ///
    /// The analysis and the table update happen under one lock, so register
    /// reads never observe a partially applied frame. Listeners are notified
    /// after the lock is released.
    pub fn recompute(&self, frame: &ThermalFrame) -> Result<AnalysisResult> {
        let result = {
            let mut table = lock(&self.table);
            let geometry = table.geometry();
            if frame.geometry() != geometry {
                return Err(Error::FrameSize {
                    expected: geometry.pixel_count(),
                    actual: frame.pixels().len(),
                });
            }
            let result = analyze(frame, &table);
            table.apply(&result);
            result
        };
        trace!("Analysis updated: {result:?}");
        let values = result.broadcast_values();
        for listener in &self.listeners {
            listener.on_analysis_updated(values);
        }
        Ok(result)
    }

    /// Recomputes from a raw sensor buffer including its header rows.
    pub fn recompute_raw(&self, raw: &[u16]) -> Result<AnalysisResult> {
        let geometry = lock(&self.table).geometry();
        self.recompute(&ThermalFrame::from_raw(geometry, raw)?)
    }
}
