//! V9938/V9958 VDP (video display processor)
//!
//! Only the pieces the command engine depends on live here: the display-mode descriptor and the
//! scanline clock. Rendering is a separate concern and consumes VRAM through its own path.

pub mod access_slots;
pub mod cmd_engine;
pub mod vram;

use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};

use crate::vdp::access_slots::Schedule;

/// VDP cycles per scanline. The VDP clock runs at 6x the Z80 clock (228 Z80 cycles per line).
pub const CYCLES_PER_LINE: u64 = 1368;

/// Screen mode as selected by the M1-M5 mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum ScreenMode {
    Text1,
    Text2,
    Multicolor,
    #[default]
    Graphic1,
    Graphic2,
    Graphic3,
    // The bitmap modes (SCREEN 5-8); the only modes in which VDP commands are officially allowed
    Graphic4,
    Graphic5,
    Graphic6,
    Graphic7,
}

impl Display for ScreenMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text1 => write!(f, "TEXT 1 (SCREEN 0)"),
            Self::Text2 => write!(f, "TEXT 2"),
            Self::Multicolor => write!(f, "MULTICOLOR (SCREEN 3)"),
            Self::Graphic1 => write!(f, "GRAPHIC 1 (SCREEN 1)"),
            Self::Graphic2 => write!(f, "GRAPHIC 2 (SCREEN 2)"),
            Self::Graphic3 => write!(f, "GRAPHIC 3 (SCREEN 4)"),
            Self::Graphic4 => write!(f, "GRAPHIC 4 (SCREEN 5)"),
            Self::Graphic5 => write!(f, "GRAPHIC 5 (SCREEN 6)"),
            Self::Graphic6 => write!(f, "GRAPHIC 6 (SCREEN 7)"),
            Self::Graphic7 => write!(f, "GRAPHIC 7 (SCREEN 8)"),
        }
    }
}

impl ScreenMode {
    /// Decodes the M1-M5 mode register bits, lowest bit first.
    pub fn from_mode_bits(mode_bits: [bool; 5]) -> Self {
        let value = mode_bits
            .into_iter()
            .enumerate()
            .fold(0_u8, |acc, (i, bit)| acc | (u8::from(bit) << i));
        match value {
            0x00 => Self::Graphic1,
            0x01 => Self::Text1,
            0x02 => Self::Multicolor,
            0x04 => Self::Graphic2,
            0x08 => Self::Graphic3,
            0x09 => Self::Text2,
            0x0C => Self::Graphic4,
            0x10 => Self::Graphic5,
            0x14 => Self::Graphic6,
            0x1C => Self::Graphic7,
            _ => {
                log::debug!("Unsupported mode bit combination {value:#04X}, defaulting to GRAPHIC 1");
                Self::Graphic1
            }
        }
    }

    #[must_use]
    pub fn is_bitmap(self) -> bool {
        matches!(self, Self::Graphic4 | Self::Graphic5 | Self::Graphic6 | Self::Graphic7)
    }
}

/// The slice of VDP state the command engine is told about on a mode change: which screen mode is
/// active and which VRAM access-slot schedule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct DisplayMode {
    pub screen: ScreenMode,
    pub display_enabled: bool,
    pub sprites_enabled: bool,
}

impl DisplayMode {
    /// The VRAM access-slot schedule for this mode. Display rendering and sprite fetches consume
    /// most of the VRAM bus while enabled, leaving fewer slots for the CPU and the command engine.
    #[must_use]
    pub fn slot_schedule(self) -> Schedule {
        if !self.display_enabled {
            Schedule::ScreenOff
        } else if self.sprites_enabled {
            Schedule::SpritesOn
        } else {
            Schedule::SpritesOff
        }
    }
}
