//! The virtual register table behind the analysis register class.
//!
//! The table holds the quadrant split, the per quadrant maximum and centre
//! values, and the burner points. Split and burner coordinates are write
//! through to a [`KeyValueStore`]; every other value is recomputed by the
//! analysis engine on each frame and never persisted.

use crate::analysis::{AnalysisResult, FrameGeometry};
use crate::protocol::{AnalysisRegister, Axis, Quadrant};
use crate::store::KeyValueStore;
use log::*;
use std::ops::RangeInclusive;

const XSPLIT_KEY: &str = "xsplit";
const YSPLIT_KEY: &str = "ysplit";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuadrantValues {
    pub max: u16,
    /// Value of the pixel at the middle of the quadrant's bounding box.
    pub center: u16,
}

/// An operator configured pixel and the temperature last read there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Burner {
    pub x: u8,
    pub y: u8,
    pub temperature: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The (possibly clamped) value now held by the register.
    Stored(u8),
    /// The register is read-only.
    Ignored,
}

fn burner_key(quadrant: Quadrant, axis: Axis) -> String {
    let axis = match axis {
        Axis::X => 'x',
        Axis::Y => 'y',
    };
    format!("{}burner{axis}", quadrant.name())
}

/// Inclusive coordinate range of one half of an axis split at `split`.
fn axis_bounds(first_half: bool, split: u8, size: u8) -> RangeInclusive<u8> {
    let last = size.saturating_sub(1);
    if first_half {
        0..=split.saturating_sub(1).min(last)
    } else {
        split.min(last)..=last
    }
}

pub struct VirtualRegisterTable {
    geometry: FrameGeometry,
    xsplit: u8,
    ysplit: u8,
    quadrants: [QuadrantValues; 4],
    burners: [Burner; 4],
    device_id: [u8; AnalysisRegister::DEVICE_ID_LEN as usize],
    store: Box<dyn KeyValueStore>,
}

impl std::fmt::Debug for VirtualRegisterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRegisterTable")
            .field("geometry", &self.geometry)
            .field("xsplit", &self.xsplit)
            .field("ysplit", &self.ysplit)
            .field("quadrants", &self.quadrants)
            .field("burners", &self.burners)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl VirtualRegisterTable {
    /// Creates the table from the persisted values in `store`.
    ///
    /// Splits outside the frame fall back to the middle of the frame, burner
    /// coordinates default to the centre of their quadrant and are clamped
    /// into it.
    pub fn load(geometry: FrameGeometry, store: Box<dyn KeyValueStore>) -> Self {
        let (default_xsplit, default_ysplit) = geometry.default_split();
        let xsplit = store
            .get(XSPLIT_KEY)
            .filter(|v| *v <= geometry.width)
            .unwrap_or(default_xsplit);
        let ysplit = store
            .get(YSPLIT_KEY)
            .filter(|v| *v <= geometry.height)
            .unwrap_or(default_ysplit);

        let mut table = Self {
            geometry,
            xsplit,
            ysplit,
            quadrants: Default::default(),
            burners: Default::default(),
            device_id: Default::default(),
            store,
        };
        for quadrant in Quadrant::ALL {
            let (cx, cy) = table.center_of(quadrant);
            let (xs, ys) = table.quadrant_bounds(quadrant);
            let x = table.store.get(&burner_key(quadrant, Axis::X)).unwrap_or(cx);
            let y = table.store.get(&burner_key(quadrant, Axis::Y)).unwrap_or(cy);
            table.burners[quadrant.index()] = Burner {
                x: x.clamp(*xs.start(), *xs.end()),
                y: y.clamp(*ys.start(), *ys.end()),
                temperature: 0,
            };
        }
        info!("Quadrant analysis initialized: Xsplit={xsplit}, Ysplit={ysplit}");
        table
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn xsplit(&self) -> u8 {
        self.xsplit
    }

    pub fn ysplit(&self) -> u8 {
        self.ysplit
    }

    pub fn quadrant(&self, quadrant: Quadrant) -> QuadrantValues {
        self.quadrants[quadrant.index()]
    }

    pub fn burner(&self, quadrant: Quadrant) -> Burner {
        self.burners[quadrant.index()]
    }

    pub fn burner_coordinates(&self) -> [(u8, u8); 4] {
        self.burners.map(|burner| (burner.x, burner.y))
    }

    pub fn device_id(&self) -> [u8; AnalysisRegister::DEVICE_ID_LEN as usize] {
        self.device_id
    }

    pub fn set_device_id(&mut self, device_id: [u8; AnalysisRegister::DEVICE_ID_LEN as usize]) {
        self.device_id = device_id;
    }

    /// Pixel bounds of `quadrant` under the current split. An empty half
    /// collapses onto the nearest valid coordinate.
    pub fn quadrant_bounds(&self, quadrant: Quadrant) -> (RangeInclusive<u8>, RangeInclusive<u8>) {
        (
            axis_bounds(quadrant.is_left(), self.xsplit, self.geometry.width),
            axis_bounds(quadrant.is_top(), self.ysplit, self.geometry.height),
        )
    }

    /// Middle of the quadrant's bounding box, clamped to the frame.
    pub fn center_of(&self, quadrant: Quadrant) -> (u8, u8) {
        let FrameGeometry { width, height, .. } = self.geometry;
        let cx = if quadrant.is_left() {
            self.xsplit / 2
        } else {
            self.xsplit + (width.saturating_sub(self.xsplit)) / 2
        };
        let cy = if quadrant.is_top() {
            self.ysplit / 2
        } else {
            self.ysplit + (height.saturating_sub(self.ysplit)) / 2
        };
        (
            cx.min(width.saturating_sub(1)),
            cy.min(height.saturating_sub(1)),
        )
    }

    /// Reads a register. Eight bit registers are zero extended.
    pub fn read(&self, register: AnalysisRegister) -> u16 {
        match register {
            AnalysisRegister::XSplit => self.xsplit as u16,
            AnalysisRegister::YSplit => self.ysplit as u16,
            AnalysisRegister::Max(q) => self.quadrants[q.index()].max,
            AnalysisRegister::Center(q) => self.quadrants[q.index()].center,
            AnalysisRegister::BurnerCoordinate(q, Axis::X) => self.burners[q.index()].x as u16,
            AnalysisRegister::BurnerCoordinate(q, Axis::Y) => self.burners[q.index()].y as u16,
            AnalysisRegister::BurnerTemperature(q) => self.burners[q.index()].temperature,
            AnalysisRegister::DeviceId(n) => {
                self.device_id.get(n as usize).copied().unwrap_or_default() as u16
            }
        }
    }

    /// Writes a register. Only the split and the burner coordinates are
    /// writable; accepted values are clamped and persisted.
    pub fn write(&mut self, register: AnalysisRegister, value: u8) -> WriteOutcome {
        match register {
            AnalysisRegister::XSplit => {
                self.xsplit = value.min(self.geometry.width);
                info!("Xsplit set to {}", self.xsplit);
                self.persist(XSPLIT_KEY, self.xsplit);
                self.reclamp_burners();
                WriteOutcome::Stored(self.xsplit)
            }
            AnalysisRegister::YSplit => {
                self.ysplit = value.min(self.geometry.height);
                info!("Ysplit set to {}", self.ysplit);
                self.persist(YSPLIT_KEY, self.ysplit);
                self.reclamp_burners();
                WriteOutcome::Stored(self.ysplit)
            }
            AnalysisRegister::BurnerCoordinate(quadrant, axis) => {
                let (xs, ys) = self.quadrant_bounds(quadrant);
                let burner = &mut self.burners[quadrant.index()];
                let stored = match axis {
                    Axis::X => {
                        burner.x = value.clamp(*xs.start(), *xs.end());
                        burner.x
                    }
                    Axis::Y => {
                        burner.y = value.clamp(*ys.start(), *ys.end());
                        burner.y
                    }
                };
                info!("{register} set to {stored}");
                self.persist(&burner_key(quadrant, axis), stored);
                WriteOutcome::Stored(stored)
            }
            _ => {
                debug!("Ignoring write to read-only register {register}");
                WriteOutcome::Ignored
            }
        }
    }

    /// Overwrites every computed value with the result of one analysis pass.
    pub fn apply(&mut self, result: &AnalysisResult) {
        self.quadrants = result.quadrants;
        for (burner, temperature) in self.burners.iter_mut().zip(result.burner_temperatures) {
            burner.temperature = temperature;
        }
    }

    /// Pulls every burner back into its quadrant after the split moved.
    fn reclamp_burners(&mut self) {
        for quadrant in Quadrant::ALL {
            let (xs, ys) = self.quadrant_bounds(quadrant);
            let burner = self.burners[quadrant.index()];
            let x = burner.x.clamp(*xs.start(), *xs.end());
            let y = burner.y.clamp(*ys.start(), *ys.end());
            self.burners[quadrant.index()] = Burner { x, y, ..burner };
            if x != burner.x {
                debug!("Burner {} x moved to {x}", quadrant.name());
                self.persist(&burner_key(quadrant, Axis::X), x);
            }
            if y != burner.y {
                debug!("Burner {} y moved to {y}", quadrant.name());
                self.persist(&burner_key(quadrant, Axis::Y), y);
            }
        }
    }

    fn persist(&mut self, key: &str, value: u8) {
        if let Err(error) = self.store.put(key, value) {
            warn!("Cannot persist {key}={value}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn table() -> VirtualRegisterTable {
        VirtualRegisterTable::load(FrameGeometry::default(), Box::new(MemoryStore::new()))
    }

    #[test]
    fn defaults() {
        let table = table();
        assert_eq!((table.xsplit(), table.ysplit()), (40, 31));
        assert_eq!(table.center_of(Quadrant::A), (20, 15));
        assert_eq!(table.center_of(Quadrant::D), (60, 46));
        assert_eq!(table.burner(Quadrant::B), Burner { x: 60, y: 15, temperature: 0 });
        assert_eq!(table.read(AnalysisRegister::Max(Quadrant::C)), 0);
    }

    #[test]
    fn loads_persisted_values() {
        let store = MemoryStore::with_values([
            ("xsplit", 10),
            ("ysplit", 200),
            ("aburnerx", 4),
            ("cburnery", 2),
        ]);
        let table = VirtualRegisterTable::load(FrameGeometry::default(), Box::new(store));
        assert_eq!(table.xsplit(), 10);
        // Out of range split falls back to the default.
        assert_eq!(table.ysplit(), 31);
        assert_eq!(table.burner(Quadrant::A).x, 4);
        // Burner y of quadrant C clamps into the lower half.
        assert_eq!(table.burner(Quadrant::C).y, 31);
    }

    #[test]
    fn burner_x_clamps_below_xsplit() {
        let mut table = table();
        let register = AnalysisRegister::BurnerCoordinate(Quadrant::A, Axis::X);
        assert_eq!(table.write(register, 40), WriteOutcome::Stored(39));
        assert_eq!(table.write(register, 255), WriteOutcome::Stored(39));
        assert_eq!(table.write(register, 7), WriteOutcome::Stored(7));
        assert_eq!(table.read(register), 7);

        let register = AnalysisRegister::BurnerCoordinate(Quadrant::D, Axis::Y);
        assert_eq!(table.write(register, 0), WriteOutcome::Stored(31));
        assert_eq!(table.write(register, 100), WriteOutcome::Stored(61));
    }

    #[test]
    fn empty_quadrant_collapses() {
        let mut table = table();
        table.write(AnalysisRegister::XSplit, 0);
        let register = AnalysisRegister::BurnerCoordinate(Quadrant::A, Axis::X);
        assert_eq!(table.write(register, 30), WriteOutcome::Stored(0));
        table.write(AnalysisRegister::XSplit, 80);
        let register = AnalysisRegister::BurnerCoordinate(Quadrant::B, Axis::X);
        assert_eq!(table.write(register, 3), WriteOutcome::Stored(79));
    }

    #[test]
    fn split_writes_clamp_and_persist() {
        let mut table = table();
        assert_eq!(
            table.write(AnalysisRegister::XSplit, 0xFF),
            WriteOutcome::Stored(80)
        );
        assert_eq!(
            table.write(AnalysisRegister::YSplit, 20),
            WriteOutcome::Stored(20)
        );
        assert_eq!(table.store.get("xsplit"), Some(80));
        assert_eq!(table.store.get("ysplit"), Some(20));
        table.write(AnalysisRegister::BurnerCoordinate(Quadrant::C, Axis::X), 5);
        assert_eq!(table.store.get("cburnerx"), Some(5));
    }

    #[test]
    fn split_writes_move_burners_into_their_quadrant() {
        let mut table = table();
        let a_x = AnalysisRegister::BurnerCoordinate(Quadrant::A, Axis::X);
        table.write(a_x, 30);
        table.write(AnalysisRegister::XSplit, 10);
        assert_eq!(table.read(a_x), 9);
        assert_eq!(table.store.get("aburnerx"), Some(9));
        // Burners still inside their quadrant keep their position.
        assert_eq!(table.burner(Quadrant::B).x, 60);
        assert_eq!(table.store.get("bburnerx"), None);

        table.write(AnalysisRegister::YSplit, 50);
        assert_eq!(table.burner(Quadrant::C).y, 50);
        assert_eq!(table.store.get("cburnery"), Some(50));
        assert_eq!(table.burner(Quadrant::D).y, 50);
        assert_eq!(table.burner(Quadrant::A).y, 15);
    }

    #[test]
    fn read_only_registers_ignore_writes() {
        let mut table = table();
        for register in [
            AnalysisRegister::Max(Quadrant::A),
            AnalysisRegister::Center(Quadrant::B),
            AnalysisRegister::BurnerTemperature(Quadrant::D),
            AnalysisRegister::DeviceId(0),
        ] {
            assert_eq!(table.write(register, 1), WriteOutcome::Ignored);
            assert_eq!(table.read(register), 0);
        }
    }

    #[test]
    fn apply_and_device_id() {
        let mut table = table();
        let result = AnalysisResult {
            quadrants: [
                QuadrantValues { max: 1234, center: 1 },
                QuadrantValues { max: 2, center: 3 },
                QuadrantValues { max: 4, center: 5 },
                QuadrantValues { max: 6, center: 7 },
            ],
            burner_temperatures: [10, 11, 12, 13],
        };
        table.apply(&result);
        assert_eq!(table.read(AnalysisRegister::Max(Quadrant::A)), 1234);
        assert_eq!(table.read(AnalysisRegister::Center(Quadrant::D)), 7);
        assert_eq!(table.read(AnalysisRegister::BurnerTemperature(Quadrant::C)), 12);

        table.set_device_id([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]);
        assert_eq!(table.read(AnalysisRegister::DeviceId(2)), 0xC4);
        assert_eq!(table.read(AnalysisRegister::DeviceId(9)), 0);
    }
}
