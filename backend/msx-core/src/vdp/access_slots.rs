//! VRAM access-slot timing
//!
//! The VDP grants VRAM bus cycles on a fixed grid of "access slots". Display rendering has
//! absolute priority, so the set of slots left over for the CPU and the command engine depends on
//! whether the display and sprites are enabled. Slot positions repeat every scanline.
//!
//! Everything here is a pure function of time and the active schedule; the command engine and the
//! CPU interface own all mutable state.

use bincode::{Decode, Encode};
use msx_common::time::EmuTime;

use crate::vdp::CYCLES_PER_LINE;

/// Minimum number of VDP cycles between the current moment and the granted slot.
///
/// Each command phase has a fixed cost expressed as one of these offsets; `D16` is reserved for
/// CPU accesses stealing a slot from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Delta {
    D0,
    D1,
    D16,
    D24,
    D32,
    D40,
    D48,
    D64,
    D72,
    D88,
}

impl Delta {
    #[must_use]
    pub const fn cycles(self) -> u64 {
        match self {
            Self::D0 => 0,
            Self::D1 => 1,
            Self::D16 => 16,
            Self::D24 => 24,
            Self::D32 => 32,
            Self::D40 => 40,
            Self::D48 => 48,
            Self::D64 => 64,
            Self::D72 => 72,
            Self::D88 => 88,
        }
    }
}

/// Which access-slot table applies, derived from the display mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum Schedule {
    /// Display disabled (or vertical border): nearly the whole bus is available.
    #[default]
    ScreenOff,
    /// Display enabled, sprites disabled.
    SpritesOff,
    /// Display enabled, sprites enabled: sprite fetches also eat into the borders.
    SpritesOn,
}

// Line layout used by the tables below: left border/sync [0, 232), active display [232, 1256)
// (256 pixels at 4 cycles each), right border [1256, 1368).
const ACTIVE_START: u16 = 232;
const ACTIVE_END: u16 = 1256;

const SCREEN_OFF_LEN: usize = 171;
const SPRITES_OFF_LEN: usize = 75;
const SPRITES_ON_LEN: usize = 32;

const fn screen_off_slots() -> [u16; SCREEN_OFF_LEN] {
    let mut slots = [0; SCREEN_OFF_LEN];
    let mut i = 0;
    while i < SCREEN_OFF_LEN {
        slots[i] = 8 * i as u16;
        i += 1;
    }
    slots
}

const fn sprites_off_slots() -> [u16; SPRITES_OFF_LEN] {
    let mut slots = [0; SPRITES_OFF_LEN];
    let mut idx = 0;

    let mut pos = 0;
    while pos < ACTIVE_START {
        slots[idx] = pos;
        idx += 1;
        pos += 8;
    }
    while pos < ACTIVE_END {
        slots[idx] = pos;
        idx += 1;
        pos += 32;
    }
    while pos < CYCLES_PER_LINE as u16 {
        slots[idx] = pos;
        idx += 1;
        pos += 8;
    }

    assert!(idx == SPRITES_OFF_LEN);
    slots
}

const fn sprites_on_slots() -> [u16; SPRITES_ON_LEN] {
    let mut slots = [0; SPRITES_ON_LEN];
    let mut idx = 0;

    // Sprite attribute/pattern fetches occupy the first stretch of the border
    let mut pos = 96;
    while pos < ACTIVE_START {
        slots[idx] = pos;
        idx += 1;
        pos += 16;
    }
    while pos < ACTIVE_END {
        slots[idx] = pos;
        idx += 1;
        pos += 64;
    }
    while pos < CYCLES_PER_LINE as u16 {
        slots[idx] = pos;
        idx += 1;
        pos += 16;
    }

    assert!(idx == SPRITES_ON_LEN);
    slots
}

static SCREEN_OFF: [u16; SCREEN_OFF_LEN] = screen_off_slots();
static SPRITES_OFF: [u16; SPRITES_OFF_LEN] = sprites_off_slots();
static SPRITES_ON: [u16; SPRITES_ON_LEN] = sprites_on_slots();

impl Schedule {
    fn slots(self) -> &'static [u16] {
        match self {
            Self::ScreenOff => &SCREEN_OFF,
            Self::SpritesOff => &SPRITES_OFF,
            Self::SpritesOn => &SPRITES_ON,
        }
    }
}

/// Returns the first access slot at or after `time + delta`.
///
/// For `Delta::D0` the result can equal `time` (when `time` is itself on a slot); for every other
/// delta the result is strictly later than `time`.
#[must_use]
pub fn next_access_slot(schedule: Schedule, time: EmuTime, delta: Delta) -> EmuTime {
    let table = schedule.slots();

    let min_time = time + delta.cycles();
    let line = min_time.ticks() / CYCLES_PER_LINE;
    let offset = (min_time.ticks() % CYCLES_PER_LINE) as u16;

    let idx = table.partition_point(|&slot| slot < offset);
    if idx < table.len() {
        EmuTime::from_ticks(line * CYCLES_PER_LINE + u64::from(table[idx]))
    } else {
        EmuTime::from_ticks((line + 1) * CYCLES_PER_LINE + u64::from(table[0]))
    }
}

/// Hands out successive slots to the command engine's inner loop, bounded by a catch-up limit.
#[derive(Debug, Clone, Copy)]
pub struct Calculator {
    schedule: Schedule,
    time: EmuTime,
    limit: EmuTime,
}

impl Calculator {
    /// `time` must already be on an access slot of `schedule`.
    #[must_use]
    pub fn new(schedule: Schedule, time: EmuTime, limit: EmuTime) -> Self {
        Self { schedule, time, limit }
    }

    #[must_use]
    pub fn limit_reached(&self) -> bool {
        self.time >= self.limit
    }

    #[must_use]
    pub fn time(&self) -> EmuTime {
        self.time
    }

    pub fn next(&mut self, delta: Delta) {
        self.time = next_access_slot(self.schedule, self.time, delta);
    }
}
