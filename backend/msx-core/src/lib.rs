//! MSX-family emulation core, centered on the V9938/V9958 VDP command engine

pub mod savestate;
pub mod vdp;

pub use savestate::{SAVE_STATE_VERSION, SaveStateError, load_state, save_state};
pub use vdp::cmd_engine::CmdEngine;
pub use vdp::vram::Vram;
pub use vdp::{DisplayMode, ScreenMode};
