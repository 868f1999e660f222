//! V9938/V9958 command engine (the VDP's graphics accelerator)
//!
//! The engine executes block moves, line draws, searches and pixel plots autonomously, sharing
//! the VRAM bus with the CPU. It is never driven by a clock of its own: every externally visible
//! entry point takes the emulated time of the request and makes the engine catch up ("sync") to
//! that moment before acting. Catch-up walks the access-slot grid one VRAM transaction at a time,
//! so CPU accesses and engine accesses stay totally ordered against each other.
//!
//! The CPU-visible command registers (R32-R46) hold the parameters of the *next* command; once a
//! command starts, the engine works from private temporary copies (ASX/ADX/ANX) that the CPU
//! cannot write. ASX is readable back through status registers 8/9 at all times, whatever command
//! is or was running, because the real chip exposes the raw counter.

use bincode::{Decode, Encode};
use msx_common::num::{GetBit, U16Ext};
use msx_common::time::EmuTime;
use std::fmt::{Display, Formatter};

use crate::vdp::access_slots::{self, Calculator, Delta, Schedule};
use crate::vdp::vram::{EXPANSION_BASE, Vram};
use crate::vdp::{DisplayMode, ScreenMode};

// Status bits published in S#2
const STATUS_TR: u8 = 0x80;
const STATUS_BD: u8 = 0x10;
const STATUS_CE: u8 = 0x01;

// ARG bits
const ARG_MAJ: u8 = 0;
const ARG_EQ: u8 = 1;
const ARG_DIX: u8 = 2;
const ARG_DIY: u8 = 3;
const ARG_MXS: u8 = 4;
const ARG_MXD: u8 = 5;

/// Screen-mode classification used while executing commands.
///
/// Commands are only defined for the bitmap modes; the command-enable mode bit forces them on
/// elsewhere, in which case addressing falls back to byte-per-pixel non-planar layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum CmdScreen {
    Graphic4,
    Graphic5,
    Graphic6,
    Graphic7,
    NonBitmap,
}

impl CmdScreen {
    fn from_display_mode(mode: ScreenMode, cmd_bit: bool) -> Option<Self> {
        match mode {
            ScreenMode::Graphic4 => Some(Self::Graphic4),
            ScreenMode::Graphic5 => Some(Self::Graphic5),
            ScreenMode::Graphic6 => Some(Self::Graphic6),
            ScreenMode::Graphic7 => Some(Self::Graphic7),
            _ => cmd_bit.then_some(Self::NonBitmap),
        }
    }

    const fn pixels_per_line(self) -> u16 {
        match self {
            Self::Graphic4 | Self::Graphic7 | Self::NonBitmap => 256,
            Self::Graphic5 | Self::Graphic6 => 512,
        }
    }

    const fn pixels_per_byte_shift(self) -> u8 {
        match self {
            Self::Graphic4 | Self::Graphic6 => 1,
            Self::Graphic5 => 2,
            Self::Graphic7 | Self::NonBitmap => 0,
        }
    }

    const fn color_mask(self) -> u8 {
        match self {
            Self::Graphic4 | Self::Graphic6 => 0x0F,
            Self::Graphic5 => 0x03,
            Self::Graphic7 | Self::NonBitmap => 0xFF,
        }
    }

    fn address_of(self, x: u16, y: u16, expansion: bool) -> u32 {
        let x = u32::from(x);
        let y = u32::from(y);
        let address = match self {
            Self::Graphic4 => ((y & 1023) << 7) | ((x & 255) >> 1),
            Self::Graphic5 => ((y & 1023) << 7) | ((x & 511) >> 2),
            // G6/G7 interleave consecutive bytes across the two 64 KiB banks
            Self::Graphic6 => ((y & 511) << 8) | (((x & 511) >> 2) << 1) | ((x & 2) >> 1),
            Self::Graphic7 | Self::NonBitmap => ((y & 511) << 8) | (x & 255),
        };
        if expansion { EXPANSION_BASE | (address & 0xFFFF) } else { address }
    }

    const fn pixel_shift_mask(self, x: u16) -> (u8, u8) {
        match self {
            Self::Graphic4 | Self::Graphic6 => ((((x & 1) ^ 1) << 2) as u8, 0x0F),
            Self::Graphic5 => ((((x & 3) ^ 3) << 1) as u8, 0x03),
            Self::Graphic7 | Self::NonBitmap => (0, 0xFF),
        }
    }

    fn point(self, vram: &Vram, x: u16, y: u16, expansion: bool) -> u8 {
        let byte = vram.read(self.address_of(x, y, expansion));
        let (shift, mask) = self.pixel_shift_mask(x);
        (byte >> shift) & mask
    }

    /// Combines `color` into the pixel at (x, y) and writes the result. `dst_byte` is the
    /// destination byte as latched by the preceding read phase; this method performs only the
    /// write access. Transparent operations skip the write entirely when the source pixel is 0.
    fn write_pixel(
        self,
        vram: &mut Vram,
        x: u16,
        y: u16,
        expansion: bool,
        dst_byte: u8,
        color: u8,
        op: LogOp,
    ) {
        let (shift, mask) = self.pixel_shift_mask(x);
        let current = (dst_byte >> shift) & mask;
        let Some(new) = op.apply(current, color & mask) else {
            return;
        };
        let byte = (dst_byte & !(mask << shift)) | ((new & mask) << shift);
        vram.write(self.address_of(x, y, expansion), byte);
    }

    // Extent clipping at command start: the hardware clips runs at the screen edge in the
    // direction of movement, and treats an extent register of 0 as the maximum count.

    fn clip_nx_1_pixel(self, dx: u16, nx: u16, arg: u8) -> u16 {
        let ppl = self.pixels_per_line();
        if dx >= ppl {
            return 1;
        }
        let nx = if nx == 0 { ppl } else { nx };
        if arg.bit(ARG_DIX) { nx.min(dx + 1) } else { nx.min(ppl - dx) }
    }

    fn clip_nx_2_pixel(self, sx: u16, dx: u16, nx: u16, arg: u8) -> u16 {
        let ppl = self.pixels_per_line();
        if sx >= ppl || dx >= ppl {
            return 1;
        }
        let nx = if nx == 0 { ppl } else { nx };
        if arg.bit(ARG_DIX) {
            nx.min(sx + 1).min(dx + 1)
        } else {
            nx.min(ppl - sx).min(ppl - dx)
        }
    }

    fn clip_nx_1_byte(self, dx: u16, nx: u16, arg: u8) -> u16 {
        let shift = self.pixels_per_byte_shift();
        let ppl = self.pixels_per_line();
        let bytes_per_line = ppl >> shift;
        let dxb = (dx & (ppl - 1)) >> shift;
        let nxb = ((if nx == 0 { ppl } else { nx }) >> shift).max(1);
        if arg.bit(ARG_DIX) { nxb.min(dxb + 1) } else { nxb.min(bytes_per_line - dxb) }
    }

    fn clip_nx_2_byte(self, sx: u16, dx: u16, nx: u16, arg: u8) -> u16 {
        let shift = self.pixels_per_byte_shift();
        let ppl = self.pixels_per_line();
        let bytes_per_line = ppl >> shift;
        let sxb = (sx & (ppl - 1)) >> shift;
        let dxb = (dx & (ppl - 1)) >> shift;
        let nxb = ((if nx == 0 { ppl } else { nx }) >> shift).max(1);
        if arg.bit(ARG_DIX) {
            nxb.min(sxb + 1).min(dxb + 1)
        } else {
            nxb.min(bytes_per_line - sxb).min(bytes_per_line - dxb)
        }
    }
}

fn clip_ny_1(dy: u16, ny: u16, arg: u8) -> u16 {
    let ny = if ny == 0 { 1024 } else { ny };
    if arg.bit(ARG_DIY) { ny.min(dy + 1) } else { ny }
}

fn clip_ny_2(sy: u16, dy: u16, ny: u16, arg: u8) -> u16 {
    let ny = if ny == 0 { 1024 } else { ny };
    if arg.bit(ARG_DIY) { ny.min(sy + 1).min(dy + 1) } else { ny }
}

fn pixel_step_x(arg: u8) -> i16 {
    if arg.bit(ARG_DIX) { -1 } else { 1 }
}

fn byte_step_x(screen: CmdScreen, arg: u8) -> i16 {
    let step = 1_i16 << screen.pixels_per_byte_shift();
    if arg.bit(ARG_DIX) { -step } else { step }
}

fn step_y(arg: u8) -> i16 {
    if arg.bit(ARG_DIY) { -1 } else { 1 }
}

/// Logical operation applied when writing a destination pixel (low nibble of the command
/// register). Transparent variants suppress the write when the source pixel is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum LogOp {
    Imp,
    And,
    Or,
    Xor,
    Not,
    TImp,
    TAnd,
    TOr,
    TXor,
    TNot,
}

impl LogOp {
    fn from_cmd_byte(cmd: u8) -> Self {
        match cmd & 0x0F {
            0x01 => Self::And,
            0x02 => Self::Or,
            0x03 => Self::Xor,
            0x04 => Self::Not,
            0x08 => Self::TImp,
            0x09 => Self::TAnd,
            0x0A => Self::TOr,
            0x0B => Self::TXor,
            0x0C => Self::TNot,
            // 0 is IMP; the undocumented codes behave like it
            _ => Self::Imp,
        }
    }

    fn apply(self, dst: u8, src: u8) -> Option<u8> {
        match self {
            Self::Imp => Some(src),
            Self::And => Some(dst & src),
            Self::Or => Some(dst | src),
            Self::Xor => Some(dst ^ src),
            Self::Not => Some(!src),
            Self::TImp => (src != 0).then_some(src),
            Self::TAnd => (src != 0).then(|| dst & src),
            Self::TOr => (src != 0).then(|| dst | src),
            Self::TXor => (src != 0).then(|| dst ^ src),
            Self::TNot => (src != 0).then(|| !src),
        }
    }
}

impl Display for LogOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imp => write!(f, "IMP"),
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Xor => write!(f, "XOR"),
            Self::Not => write!(f, "NOT"),
            Self::TImp => write!(f, "TIMP"),
            Self::TAnd => write!(f, "TAND"),
            Self::TOr => write!(f, "TOR"),
            Self::TXor => write!(f, "TXOR"),
            Self::TNot => write!(f, "TNOT"),
        }
    }
}

/// Command kind (high nibble of the command register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum Command {
    Abort,
    Point,
    Pset,
    Srch,
    Line,
    Lmmv,
    Lmmm,
    Lmcm,
    Lmmc,
    Hmmv,
    Hmmm,
    Ymmm,
    Hmmc,
}

impl Command {
    fn from_cmd_byte(cmd: u8) -> Self {
        match cmd >> 4 {
            // 1-3 are undocumented; the hardware treats them as ABRT
            0x0..=0x3 => Self::Abort,
            0x4 => Self::Point,
            0x5 => Self::Pset,
            0x6 => Self::Srch,
            0x7 => Self::Line,
            0x8 => Self::Lmmv,
            0x9 => Self::Lmmm,
            0xA => Self::Lmcm,
            0xB => Self::Lmmc,
            0xC => Self::Hmmv,
            0xD => Self::Hmmm,
            0xE => Self::Ymmm,
            0xF => Self::Hmmc,
            _ => unreachable!("command nibble out of range"),
        }
    }

    /// Minimum VDP cycles one step (pixel or byte) of this command can take: the sum of the
    /// per-phase slot deltas. The access-slot grid can only stretch a step, never shrink it,
    /// which is what makes the finish-time estimate a valid lower bound.
    const fn min_cycles_per_step(self) -> u64 {
        match self {
            Self::Abort => 0,
            Self::Point | Self::Pset => 24,
            Self::Srch => 88,
            Self::Line => 112,
            Self::Lmmv => 96,
            Self::Lmmm => 120,
            Self::Lmcm | Self::Hmmc | Self::Ymmm => 64,
            Self::Lmmc => 56,
            Self::Hmmv => 48,
            Self::Hmmm => 88,
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Abort => write!(f, "ABRT"),
            Self::Point => write!(f, "POINT"),
            Self::Pset => write!(f, "PSET"),
            Self::Srch => write!(f, "SRCH"),
            Self::Line => write!(f, "LINE"),
            Self::Lmmv => write!(f, "LMMV"),
            Self::Lmmm => write!(f, "LMMM"),
            Self::Lmcm => write!(f, "LMCM"),
            Self::Lmmc => write!(f, "LMMC"),
            Self::Hmmv => write!(f, "HMMV"),
            Self::Hmmm => write!(f, "HMMM"),
            Self::Ymmm => write!(f, "YMMM"),
            Self::Hmmc => write!(f, "HMMC"),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct CmdEngine {
    // CPU-visible command registers (R32-R46)
    sx: u16,
    sy: u16,
    dx: u16,
    dy: u16,
    nx: u16,
    ny: u16,
    col: u8,
    arg: u8,
    cmd: u8,
    // Engine-private temporaries; ASX doubles as the LINE error accumulator and is exposed
    // raw through status registers 8/9
    asx: u16,
    adx: u16,
    anx: u16,
    // Latches for multi-access phases
    tmp_src: u8,
    tmp_dst: u8,
    status: u8,
    /// CPU handshake for the data-transfer commands: true when the CPU has provided (LMMC/HMMC)
    /// or consumed (LMCM) the current byte.
    transfer: bool,
    /// Sub-step within the current command's per-pixel transaction sequence.
    phase: u8,
    /// Time up to which the engine has consumed access slots. Only meaningful while a command
    /// is executing; monotonically non-decreasing.
    engine_time: EmuTime,
    /// Lower bound for the next change of the status byte. `EmuTime::ZERO` means "any moment",
    /// `EmuTime::INFINITY` means "not before some external event".
    status_change_time: EmuTime,
    screen: Option<CmdScreen>,
    schedule: Schedule,
}

impl CmdEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sx: 0,
            sy: 0,
            dx: 0,
            dy: 0,
            nx: 0,
            ny: 0,
            col: 0,
            arg: 0,
            cmd: 0,
            asx: 0,
            adx: 0,
            anx: 0,
            tmp_src: 0,
            tmp_dst: 0,
            status: 0,
            transfer: false,
            phase: 0,
            engine_time: EmuTime::ZERO,
            status_change_time: EmuTime::INFINITY,
            screen: None,
            schedule: Schedule::default(),
        }
    }

    pub fn reset(&mut self, time: EmuTime) {
        self.sx = 0;
        self.sy = 0;
        self.dx = 0;
        self.dy = 0;
        self.nx = 0;
        self.ny = 0;
        self.col = 0;
        self.arg = 0;
        self.cmd = 0;
        self.asx = 0;
        self.adx = 0;
        self.anx = 0;
        self.tmp_src = 0;
        self.tmp_dst = 0;
        self.status = 0;
        self.transfer = false;
        self.phase = 0;
        self.engine_time = time;
        self.status_change_time = EmuTime::INFINITY;
    }

    #[must_use]
    fn command_active(&self) -> bool {
        self.cmd & 0xF0 != 0
    }

    /// Catches the engine up to `time`: performs every VRAM transaction the active command had
    /// scheduled strictly before that moment. No-op when no command is executing.
    pub fn sync(&mut self, vram: &mut Vram, time: EmuTime) {
        if self.command_active() {
            self.execute(vram, time);
        }
    }

    /// Grants the CPU a VRAM transaction slot at the next available cycle after `time`.
    ///
    /// The CPU always wins contention for a cycle: if the engine's own next transaction had
    /// already reached the stolen slot, it is pushed past it and never rolled back.
    pub fn steal_access_slot(&mut self, time: EmuTime) -> EmuTime {
        let cpu_slot = access_slots::next_access_slot(self.schedule, time, Delta::D16);
        debug_assert!(cpu_slot > time);
        if self.command_active() && self.engine_time <= cpu_slot {
            self.engine_time = access_slots::next_access_slot(self.schedule, cpu_slot, Delta::D1);
            debug_assert!(self.engine_time > cpu_slot);
        }
        cpu_slot
    }

    /// Command engine status bits of S#2: bit 7 (TR) transfer ready, bit 4 (BD) boundary color
    /// detected, bit 0 (CE) command in progress.
    ///
    /// Syncs only when `time` has passed the published status-change bound, so polling the
    /// status register stays cheap while a long command runs.
    pub fn get_status(&mut self, vram: &mut Vram, time: EmuTime) -> u8 {
        if time >= self.status_change_time {
            self.sync(vram, time);
        }
        self.status
    }

    /// Pixel transfer from VDP to CPU (S#7). LMCM parks each pixel here.
    pub fn read_color(&mut self, vram: &mut Vram, time: EmuTime) -> u8 {
        self.sync(vram, time);
        self.col
    }

    /// Called by the register-read path after S#7 has been read.
    pub fn reset_color(&mut self) {
        // The real VDP momentarily clears TR on every S#7 read, but too briefly for the CPU to
        // observe unless the command has ended.
        if !self.command_active() {
            self.status &= !STATUS_TR;
        }
        self.transfer = true;
        if self.command_active() {
            self.status_change_time = EmuTime::ZERO;
        }
    }

    /// The X coordinate reported by status registers 8/9. Documented as the SRCH border
    /// position, but the chip simply exposes the raw ASX counter regardless of which command
    /// ran last.
    pub fn border_x(&mut self, vram: &mut Vram, time: EmuTime) -> u16 {
        self.sync(vram, time);
        self.asx
    }

    /// Debugger read of a command register. Does not sync, so the value may be stale.
    #[must_use]
    pub fn peek_cmd_reg(&self, index: u8) -> u8 {
        match index {
            0 => self.sx.lsb(),
            1 => self.sx.msb(),
            2 => self.sy.lsb(),
            3 => self.sy.msb(),
            4 => self.dx.lsb(),
            5 => self.dx.msb(),
            6 => self.dy.lsb(),
            7 => self.dy.msb(),
            8 => self.nx.lsb(),
            9 => self.nx.msb(),
            10 => self.ny.lsb(),
            11 => self.ny.msb(),
            12 => self.col,
            13 => self.arg,
            14 => self.cmd,
            _ => panic!("invalid command register index: {index}"),
        }
    }

    /// Writes command register `index` (R32 + index) at `time`. Always syncs first, so a write
    /// landing mid-command cannot corrupt an in-flight read-modify-write. Writing the command
    /// register starts (or aborts) a command.
    pub fn set_cmd_reg(&mut self, vram: &mut Vram, index: u8, value: u8, time: EmuTime) {
        self.sync(vram, time);
        match index {
            0 => self.sx.set_lsb(value),
            1 => self.sx = (self.sx & 0x00FF) | (u16::from(value & 0x01) << 8),
            2 => self.sy.set_lsb(value),
            3 => self.sy = (self.sy & 0x00FF) | (u16::from(value & 0x03) << 8),
            4 => self.dx.set_lsb(value),
            5 => self.dx = (self.dx & 0x00FF) | (u16::from(value & 0x01) << 8),
            6 => self.dy.set_lsb(value),
            7 => self.dy = (self.dy & 0x00FF) | (u16::from(value & 0x03) << 8),
            8 => self.nx.set_lsb(value),
            9 => self.nx = (self.nx & 0x00FF) | (u16::from(value & 0x03) << 8),
            10 => self.ny.set_lsb(value),
            11 => self.ny = (self.ny & 0x00FF) | (u16::from(value & 0x03) << 8),
            12 => {
                // Data byte for the CPU-to-VRAM transfer commands; TR drops until the engine
                // has consumed it
                self.col = value;
                self.status &= !STATUS_TR;
                self.transfer = true;
                if self.command_active() {
                    self.status_change_time = EmuTime::ZERO;
                }
            }
            13 => self.arg = value,
            14 => {
                self.cmd = value;
                self.start_command(time);
            }
            _ => panic!("invalid command register index: {index}"),
        }
    }

    /// Notification that the VDP display mode changed. Re-derives addressing and the access-slot
    /// schedule; an in-flight command keeps its temporary registers.
    pub fn update_display_mode(
        &mut self,
        vram: &mut Vram,
        mode: DisplayMode,
        cmd_bit: bool,
        time: EmuTime,
    ) {
        self.sync(vram, time);
        self.schedule = mode.slot_schedule();

        let screen = CmdScreen::from_display_mode(mode.screen, cmd_bit);
        if self.screen != screen {
            if screen.is_none() && self.command_active() {
                log::debug!("Display mode change disabled VDP commands; dropping active command");
                self.command_done(time);
            }
            self.screen = screen;
        }
    }

    fn start_command(&mut self, time: EmuTime) {
        let command = Command::from_cmd_byte(self.cmd);

        let Some(screen) = self.screen else {
            if command != Command::Abort {
                log::debug!(
                    "VDP command {command} issued while commands are not permitted; ignoring"
                );
            }
            self.command_done(time);
            return;
        };

        if command == Command::Abort {
            self.command_done(time);
            return;
        }

        log::debug!(
            "VDP command start: {command}/{op} SX={sx} SY={sy} DX={dx} DY={dy} NX={nx} NY={ny} \
             COL={col:#04X} ARG={arg:#04X}",
            op = LogOp::from_cmd_byte(self.cmd),
            sx = self.sx,
            sy = self.sy,
            dx = self.dx,
            dy = self.dy,
            nx = self.nx,
            ny = self.ny,
            col = self.col,
            arg = self.arg,
        );

        self.status |= STATUS_CE;
        self.phase = 0;
        self.engine_time = access_slots::next_access_slot(self.schedule, time, Delta::D0);
        self.status_change_time = EmuTime::ZERO;

        match command {
            Command::Abort => unreachable!("handled above"),
            // Completion of these depends on VRAM contents or the CPU, so no useful bound exists
            Command::Point | Command::Pset => {}
            Command::Srch => {
                self.asx = self.sx;
            }
            Command::Line => {
                self.asx = (self.nx.wrapping_sub(1) & 1023) >> 1;
                self.adx = self.dx;
                self.anx = 0;
            }
            Command::Lmmv => {
                let nx = screen.clip_nx_1_pixel(self.dx, self.nx, self.arg);
                let ny = clip_ny_1(self.dy, self.ny, self.arg);
                self.adx = self.dx;
                self.anx = nx;
                self.calc_finish_time(u64::from(nx) * u64::from(ny), command);
            }
            Command::Lmmm => {
                let nx = screen.clip_nx_2_pixel(self.sx, self.dx, self.nx, self.arg);
                let ny = clip_ny_2(self.sy, self.dy, self.ny, self.arg);
                self.asx = self.sx;
                self.adx = self.dx;
                self.anx = nx;
                self.calc_finish_time(u64::from(nx) * u64::from(ny), command);
            }
            Command::Lmcm => {
                let nx = screen.clip_nx_1_pixel(self.sx, self.nx, self.arg);
                self.asx = self.sx;
                self.anx = nx;
                self.status &= !STATUS_TR;
                self.transfer = true;
            }
            Command::Lmmc => {
                let nx = screen.clip_nx_1_pixel(self.dx, self.nx, self.arg);
                self.adx = self.dx;
                self.anx = nx;
                // The first data byte is pre-loaded into COL before the command is issued
                self.status |= STATUS_TR;
                self.transfer = true;
            }
            Command::Hmmv => {
                let nx = screen.clip_nx_1_byte(self.dx, self.nx, self.arg);
                let ny = clip_ny_1(self.dy, self.ny, self.arg);
                self.adx = self.dx;
                self.anx = nx;
                self.calc_finish_time(u64::from(nx) * u64::from(ny), command);
            }
            Command::Hmmm => {
                let nx = screen.clip_nx_2_byte(self.sx, self.dx, self.nx, self.arg);
                let ny = clip_ny_2(self.sy, self.dy, self.ny, self.arg);
                self.asx = self.sx;
                self.adx = self.dx;
                self.anx = nx;
                self.calc_finish_time(u64::from(nx) * u64::from(ny), command);
            }
            Command::Ymmm => {
                // NX is ignored; each row runs from DX to the screen edge
                let nx = screen.clip_nx_1_byte(self.dx, 0, self.arg);
                let ny = clip_ny_2(self.sy, self.dy, self.ny, self.arg);
                self.adx = self.dx;
                self.anx = nx;
                self.calc_finish_time(u64::from(nx) * u64::from(ny), command);
            }
            Command::Hmmc => {
                let nx = screen.clip_nx_1_byte(self.dx, self.nx, self.arg);
                self.adx = self.dx;
                self.anx = nx;
                // As with LMMC, the first byte is already waiting in COL
                self.status |= STATUS_TR;
                self.transfer = true;
            }
        }
    }

    /// Closed-form lower bound on the command's completion time, used to gate status polling.
    /// The final step's trailing delta is not part of the command, hence `steps - 1`.
    fn calc_finish_time(&mut self, steps: u64, command: Command) {
        self.status_change_time =
            self.engine_time + steps.saturating_sub(1) * command.min_cycles_per_step();
    }

    fn command_done(&mut self, time: EmuTime) {
        log::trace!("VDP command finished at {time}");
        self.status &= !STATUS_CE;
        self.cmd &= 0x0F;
        self.phase = 0;
        self.status_change_time = EmuTime::INFINITY;
    }

    fn execute(&mut self, vram: &mut Vram, limit: EmuTime) {
        let screen = self.screen.expect("active command without a command screen mode");
        match Command::from_cmd_byte(self.cmd) {
            Command::Abort => unreachable!("ABRT is resolved at command start"),
            Command::Point => self.execute_point(vram, screen, limit),
            Command::Pset => self.execute_pset(vram, screen, limit),
            Command::Srch => self.execute_srch(vram, screen, limit),
            Command::Line => self.execute_line(vram, screen, limit),
            Command::Lmmv => self.execute_lmmv(vram, screen, limit),
            Command::Lmmm => self.execute_lmmm(vram, screen, limit),
            Command::Lmcm => self.execute_lmcm(vram, screen, limit),
            Command::Lmmc => self.execute_lmmc(vram, screen, limit),
            Command::Hmmv => self.execute_hmmv(vram, screen, limit),
            Command::Hmmm => self.execute_hmmm(vram, screen, limit),
            Command::Ymmm => self.execute_ymmm(vram, screen, limit),
            Command::Hmmc => self.execute_hmmc(vram, screen, limit),
        }
    }

    fn execute_point(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        if self.engine_time >= limit {
            return;
        }
        self.col = screen.point(vram, self.sx, self.sy, self.arg.bit(ARG_MXS));
        self.command_done(self.engine_time);
    }

    fn execute_pset(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let op = LogOp::from_cmd_byte(self.cmd);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_dst = vram.read(screen.address_of(self.dx, self.dy, expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }
            screen.write_pixel(vram, self.dx, self.dy, expansion, self.tmp_dst, self.col, op);
            self.command_done(calculator.time());
            break;
        }
        self.engine_time = calculator.time();
    }

    fn execute_srch(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let color = self.col & screen.color_mask();
        let stop_on_mismatch = self.arg.bit(ARG_EQ);
        let tx = pixel_step_x(self.arg);
        let expansion = self.arg.bit(ARG_MXS);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            let pixel = screen.point(vram, self.asx, self.sy, expansion);
            if (pixel == color) != stop_on_mismatch {
                self.status |= STATUS_BD;
                self.command_done(calculator.time());
                break;
            }
            self.asx = self.asx.wrapping_add_signed(tx);
            if self.asx & screen.pixels_per_line() != 0 {
                // Ran off the edge without finding the border color
                self.asx &= 1023;
                self.status &= !STATUS_BD;
                self.command_done(calculator.time());
                break;
            }
            calculator.next(Delta::D88);
        }
        self.engine_time = calculator.time();
    }

    fn execute_line(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let op = LogOp::from_cmd_byte(self.cmd);
        let color = self.col;
        let y_is_major = self.arg.bit(ARG_MAJ);
        let tx = pixel_step_x(self.arg);
        let ty = step_y(self.arg);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_dst = vram.read(screen.address_of(self.adx, self.dy, expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }

            screen.write_pixel(vram, self.adx, self.dy, expansion, self.tmp_dst, color, op);
            calculator.next(Delta::D88);
            self.phase = 0;

            if self.anx == self.nx {
                self.command_done(calculator.time());
                break;
            }
            self.anx += 1;

            if y_is_major {
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.asx = self.asx.wrapping_sub(self.ny);
                if self.asx & 0x400 != 0 {
                    self.asx = self.asx.wrapping_add(self.nx);
                    self.adx = self.adx.wrapping_add_signed(tx) & 1023;
                    if self.adx & screen.pixels_per_line() != 0 {
                        self.asx &= 1023;
                        self.command_done(calculator.time());
                        break;
                    }
                    calculator.next(Delta::D32);
                }
            } else {
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
                if self.adx & screen.pixels_per_line() != 0 {
                    self.asx &= 1023;
                    self.command_done(calculator.time());
                    break;
                }
                self.asx = self.asx.wrapping_sub(self.ny);
                if self.asx & 0x400 != 0 {
                    self.asx = self.asx.wrapping_add(self.nx);
                    self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                    calculator.next(Delta::D32);
                }
            }
            self.asx &= 1023;
        }
        self.engine_time = calculator.time();
    }

    fn execute_lmmv(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let op = LogOp::from_cmd_byte(self.cmd);
        let nx_row = screen.clip_nx_1_pixel(self.dx, self.nx, self.arg);
        let tx = pixel_step_x(self.arg);
        let ty = step_y(self.arg);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_dst = vram.read(screen.address_of(self.adx, self.dy, expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }

            screen.write_pixel(vram, self.adx, self.dy, expansion, self.tmp_dst, self.col, op);
            calculator.next(Delta::D72);
            self.phase = 0;

            self.anx -= 1;
            if self.anx == 0 {
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.ny = self.ny.wrapping_sub(1) & 1023;
                if self.ny == 0 {
                    self.command_done(calculator.time());
                    break;
                }
                self.adx = self.dx;
                self.anx = nx_row;
            } else {
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
            }
        }
        self.engine_time = calculator.time();
    }

    fn execute_lmmm(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let op = LogOp::from_cmd_byte(self.cmd);
        let nx_row = screen.clip_nx_2_pixel(self.sx, self.dx, self.nx, self.arg);
        let tx = pixel_step_x(self.arg);
        let ty = step_y(self.arg);
        let src_expansion = self.arg.bit(ARG_MXS);
        let dst_expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            match self.phase {
                0 => {
                    self.tmp_src = screen.point(vram, self.asx, self.sy, src_expansion);
                    calculator.next(Delta::D32);
                    self.phase = 1;
                }
                1 => {
                    self.tmp_dst = vram.read(screen.address_of(self.adx, self.dy, dst_expansion));
                    calculator.next(Delta::D24);
                    self.phase = 2;
                }
                _ => {
                    screen.write_pixel(
                        vram,
                        self.adx,
                        self.dy,
                        dst_expansion,
                        self.tmp_dst,
                        self.tmp_src,
                        op,
                    );
                    calculator.next(Delta::D64);
                    self.phase = 0;

                    self.anx -= 1;
                    if self.anx == 0 {
                        self.sy = self.sy.wrapping_add_signed(ty) & 1023;
                        self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                        self.ny = self.ny.wrapping_sub(1) & 1023;
                        if self.ny == 0 {
                            self.command_done(calculator.time());
                            self.engine_time = calculator.time();
                            return;
                        }
                        self.asx = self.sx;
                        self.adx = self.dx;
                        self.anx = nx_row;
                    } else {
                        self.asx = self.asx.wrapping_add_signed(tx) & 1023;
                        self.adx = self.adx.wrapping_add_signed(tx) & 1023;
                    }
                }
            }
        }
        self.engine_time = calculator.time();
    }

    fn execute_lmcm(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        if !self.transfer || self.engine_time >= limit {
            return;
        }

        let tx = pixel_step_x(self.arg);
        let ty = step_y(self.arg);
        let nx_row = screen.clip_nx_1_pixel(self.sx, self.nx, self.arg);

        self.col = screen.point(vram, self.asx, self.sy, self.arg.bit(ARG_MXS));
        self.status |= STATUS_TR;
        self.transfer = false;
        self.engine_time =
            access_slots::next_access_slot(self.schedule, self.engine_time, Delta::D64);

        self.anx -= 1;
        if self.anx == 0 {
            self.sy = self.sy.wrapping_add_signed(ty) & 1023;
            self.ny = self.ny.wrapping_sub(1) & 1023;
            if self.ny == 0 {
                self.command_done(self.engine_time);
                return;
            }
            self.asx = self.sx;
            self.anx = nx_row;
        } else {
            self.asx = self.asx.wrapping_add_signed(tx) & 1023;
        }
        // The next status change is the CPU picking up the pixel
        self.status_change_time = EmuTime::INFINITY;
    }

    fn execute_lmmc(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        if !self.transfer {
            return;
        }

        let op = LogOp::from_cmd_byte(self.cmd);
        let tx = pixel_step_x(self.arg);
        let ty = step_y(self.arg);
        let nx_row = screen.clip_nx_1_pixel(self.dx, self.nx, self.arg);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_dst = vram.read(screen.address_of(self.adx, self.dy, expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }

            screen.write_pixel(vram, self.adx, self.dy, expansion, self.tmp_dst, self.col, op);
            calculator.next(Delta::D32);
            self.phase = 0;
            self.status |= STATUS_TR;
            self.transfer = false;

            self.anx -= 1;
            if self.anx == 0 {
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.ny = self.ny.wrapping_sub(1) & 1023;
                if self.ny == 0 {
                    self.command_done(calculator.time());
                } else {
                    self.adx = self.dx;
                    self.anx = nx_row;
                }
            } else {
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
            }
            if self.command_active() {
                self.status_change_time = EmuTime::INFINITY;
            }
            break;
        }
        self.engine_time = calculator.time();
    }

    fn execute_hmmv(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let nx_row = screen.clip_nx_1_byte(self.dx, self.nx, self.arg);
        let tx = byte_step_x(screen, self.arg);
        let ty = step_y(self.arg);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            vram.write(screen.address_of(self.adx, self.dy, expansion), self.col);
            calculator.next(Delta::D48);

            self.anx -= 1;
            if self.anx == 0 {
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.ny = self.ny.wrapping_sub(1) & 1023;
                if self.ny == 0 {
                    self.command_done(calculator.time());
                    break;
                }
                self.adx = self.dx;
                self.anx = nx_row;
            } else {
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
            }
        }
        self.engine_time = calculator.time();
    }

    fn execute_hmmm(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        let nx_row = screen.clip_nx_2_byte(self.sx, self.dx, self.nx, self.arg);
        let tx = byte_step_x(screen, self.arg);
        let ty = step_y(self.arg);
        let src_expansion = self.arg.bit(ARG_MXS);
        let dst_expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_src = vram.read(screen.address_of(self.asx, self.sy, src_expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }

            vram.write(screen.address_of(self.adx, self.dy, dst_expansion), self.tmp_src);
            calculator.next(Delta::D64);
            self.phase = 0;

            self.anx -= 1;
            if self.anx == 0 {
                self.sy = self.sy.wrapping_add_signed(ty) & 1023;
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.ny = self.ny.wrapping_sub(1) & 1023;
                if self.ny == 0 {
                    self.command_done(calculator.time());
                    break;
                }
                self.asx = self.sx;
                self.adx = self.dx;
                self.anx = nx_row;
            } else {
                self.asx = self.asx.wrapping_add_signed(tx) & 1023;
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
            }
        }
        self.engine_time = calculator.time();
    }

    fn execute_ymmm(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        // Source and destination share the X run; only Y differs
        let nx_row = screen.clip_nx_1_byte(self.dx, 0, self.arg);
        let tx = byte_step_x(screen, self.arg);
        let ty = step_y(self.arg);
        let expansion = self.arg.bit(ARG_MXD);
        let mut calculator = Calculator::new(self.schedule, self.engine_time, limit);

        while !calculator.limit_reached() {
            if self.phase == 0 {
                self.tmp_src = vram.read(screen.address_of(self.adx, self.sy, expansion));
                calculator.next(Delta::D24);
                self.phase = 1;
                continue;
            }

            vram.write(screen.address_of(self.adx, self.dy, expansion), self.tmp_src);
            calculator.next(Delta::D40);
            self.phase = 0;

            self.anx -= 1;
            if self.anx == 0 {
                self.sy = self.sy.wrapping_add_signed(ty) & 1023;
                self.dy = self.dy.wrapping_add_signed(ty) & 1023;
                self.ny = self.ny.wrapping_sub(1) & 1023;
                if self.ny == 0 {
                    self.command_done(calculator.time());
                    break;
                }
                self.adx = self.dx;
                self.anx = nx_row;
            } else {
                self.adx = self.adx.wrapping_add_signed(tx) & 1023;
            }
        }
        self.engine_time = calculator.time();
    }

    fn execute_hmmc(&mut self, vram: &mut Vram, screen: CmdScreen, limit: EmuTime) {
        if !self.transfer || self.engine_time >= limit {
            return;
        }

        let tx = byte_step_x(screen, self.arg);
        let ty = step_y(self.arg);
        let nx_row = screen.clip_nx_1_byte(self.dx, self.nx, self.arg);

        vram.write(screen.address_of(self.adx, self.dy, self.arg.bit(ARG_MXD)), self.col);
        self.status |= STATUS_TR;
        self.transfer = false;
        self.engine_time =
            access_slots::next_access_slot(self.schedule, self.engine_time, Delta::D64);

        self.anx -= 1;
        if self.anx == 0 {
            self.dy = self.dy.wrapping_add_signed(ty) & 1023;
            self.ny = self.ny.wrapping_sub(1) & 1023;
            if self.ny == 0 {
                self.command_done(self.engine_time);
                return;
            }
            self.adx = self.dx;
            self.anx = nx_row;
        } else {
            self.adx = self.adx.wrapping_add_signed(tx) & 1023;
        }
        self.status_change_time = EmuTime::INFINITY;
    }
}

impl Default for CmdEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savestate::{load_state, save_state};

    #[derive(Default)]
    struct Regs {
        sx: u16,
        sy: u16,
        dx: u16,
        dy: u16,
        nx: u16,
        ny: u16,
        col: u8,
        arg: u8,
        cmd: u8,
    }

    fn engine_in(screen: ScreenMode) -> (CmdEngine, Vram) {
        let mut engine = CmdEngine::new();
        let mut vram = Vram::new(false);
        let mode = DisplayMode { screen, display_enabled: false, sprites_enabled: false };
        engine.update_display_mode(&mut vram, mode, false, EmuTime::ZERO);
        (engine, vram)
    }

    fn issue(engine: &mut CmdEngine, vram: &mut Vram, regs: &Regs, time: EmuTime) {
        for (base, value) in [
            (0, regs.sx),
            (2, regs.sy),
            (4, regs.dx),
            (6, regs.dy),
            (8, regs.nx),
            (10, regs.ny),
        ] {
            engine.set_cmd_reg(vram, base, value.lsb(), time);
            engine.set_cmd_reg(vram, base + 1, value.msb(), time);
        }
        engine.set_cmd_reg(vram, 12, regs.col, time);
        engine.set_cmd_reg(vram, 13, regs.arg, time);
        engine.set_cmd_reg(vram, 14, regs.cmd, time);
    }

    fn g7_addr(x: u16, y: u16) -> u32 {
        (u32::from(y) << 8) | u32::from(x)
    }

    fn count_bytes(vram: &Vram, value: u8) -> usize {
        (0..0x20000_u32).filter(|&addr| vram.read(addr) == value).count()
    }

    const FAR_FUTURE: EmuTime = EmuTime::from_ticks(10_000_000);

    #[test_log::test]
    fn lmmv_fills_rectangle() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        let regs =
            Regs { dx: 8, dy: 2, nx: 8, ny: 1, col: 0xFF, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        engine.sync(&mut vram, FAR_FUTURE);

        for x in 8..16 {
            assert_eq!(vram.read(g7_addr(x, 2)), 0xFF, "x = {x}");
        }
        assert_eq!(vram.read(g7_addr(7, 2)), 0);
        assert_eq!(vram.read(g7_addr(16, 2)), 0);
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn hmmv_zero_extent_fills_full_line() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        let regs = Regs { dy: 5, ny: 1, col: 0xA5, cmd: 0xC0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        engine.sync(&mut vram, FAR_FUTURE);

        for x in 0..256 {
            assert_eq!(vram.read(g7_addr(x, 5)), 0xA5, "x = {x}");
        }
        assert_eq!(vram.read(g7_addr(0, 6)), 0);
    }

    #[test]
    fn srch_finds_border_color() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        vram.write(g7_addr(5, 5), 0x22);

        let regs = Regs { sy: 5, col: 0x22, cmd: 0x60, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        assert_eq!(engine.border_x(&mut vram, FAR_FUTURE), 5);
        let status = engine.get_status(&mut vram, FAR_FUTURE);
        assert_ne!(status & STATUS_BD, 0);
        assert_eq!(status & STATUS_CE, 0);
    }

    #[test]
    fn srch_without_match_clears_border_flag() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        vram.write(g7_addr(5, 5), 0x22);

        let hit = Regs { sy: 5, col: 0x22, cmd: 0x60, ..Regs::default() };
        issue(&mut engine, &mut vram, &hit, EmuTime::ZERO);
        engine.sync(&mut vram, EmuTime::from_ticks(100_000));
        assert_ne!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_BD, 0);

        // Row 6 never contains the color, so the search runs off the right edge
        let miss = Regs { sy: 6, col: 0x22, cmd: 0x60, ..Regs::default() };
        issue(&mut engine, &mut vram, &miss, EmuTime::from_ticks(200_000));
        engine.sync(&mut vram, FAR_FUTURE);

        let status = engine.get_status(&mut vram, FAR_FUTURE);
        assert_eq!(status & STATUS_BD, 0);
        assert_eq!(status & STATUS_CE, 0);
    }

    #[test]
    fn srch_miss_leaves_masked_counter() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        // DIX: decrementing from x=0 runs off the left edge on the first step
        let regs = Regs { sx: 0, sy: 6, col: 0x22, arg: 0x04, cmd: 0x60, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        assert_eq!(engine.border_x(&mut vram, FAR_FUTURE), 1023);
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_BD, 0);
    }

    #[test]
    fn point_reads_pixel_into_color_register() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        vram.write(g7_addr(9, 3), 0x77);

        let regs = Regs { sx: 9, sy: 3, cmd: 0x40, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        assert_eq!(engine.read_color(&mut vram, FAR_FUTURE), 0x77);
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn pset_applies_logical_op() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        vram.write(g7_addr(7, 0), 0xF0);

        // PSET with XOR
        let regs = Regs { dx: 7, col: 0x0F, cmd: 0x53, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        assert_eq!(vram.read(g7_addr(7, 0)), 0xFF);
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn transparent_op_skips_zero_source_pixels() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        for x in 0..4 {
            vram.write(g7_addr(x, 0), 0x55);
        }

        // LMMV with TIMP and color 0: every write is suppressed
        let regs = Regs { nx: 4, ny: 1, col: 0, cmd: 0x88, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for x in 0..4 {
            assert_eq!(vram.read(g7_addr(x, 0)), 0x55, "x = {x}");
        }
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn line_draws_diagonal() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 4, ny: 4, col: 0xAA, cmd: 0x70, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for i in 0..=4 {
            assert_eq!(vram.read(g7_addr(i, i)), 0xAA, "i = {i}");
        }
        assert_eq!(vram.read(g7_addr(0, 1)), 0);
        assert_eq!(vram.read(g7_addr(1, 0)), 0);
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn hmmm_copies_byte_block() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        for x in 0..8 {
            vram.write(g7_addr(x, 0), (x as u8) * 3 + 1);
        }

        let regs = Regs { dx: 16, dy: 1, nx: 8, ny: 1, cmd: 0xD0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for x in 0..8 {
            assert_eq!(vram.read(g7_addr(16 + x, 1)), (x as u8) * 3 + 1, "x = {x}");
        }
    }

    #[test]
    fn lmmm_copies_in_reverse_direction() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        for y in 4..8 {
            for x in 4..8 {
                vram.write(g7_addr(x, y), (x as u8) * 16 + y as u8);
            }
        }

        // DIX | DIY: walk from the bottom-right corner of both blocks
        let regs = Regs {
            sx: 7,
            sy: 7,
            dx: 23,
            dy: 23,
            nx: 4,
            ny: 4,
            arg: 0x0C,
            cmd: 0x90,
            ..Regs::default()
        };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for y in 0..4_u16 {
            for x in 0..4_u16 {
                assert_eq!(
                    vram.read(g7_addr(20 + x, 20 + y)),
                    vram.read(g7_addr(4 + x, 4 + y)),
                    "x = {x}, y = {y}"
                );
            }
        }
    }

    #[test]
    fn ymmm_copies_rows_to_screen_edge() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        for x in 250..256 {
            vram.write(g7_addr(x, 2), x as u8);
        }

        let regs = Regs { dx: 250, sy: 2, dy: 7, ny: 1, cmd: 0xE0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for x in 250..256 {
            assert_eq!(vram.read(g7_addr(x, 7)), x as u8, "x = {x}");
        }
        assert_eq!(vram.read(g7_addr(249, 7)), 0);
    }

    #[test]
    fn lmcm_transfers_pixels_to_cpu() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);
        vram.write(g7_addr(3, 4), 0xAB);

        let regs = Regs { sx: 3, sy: 4, nx: 1, ny: 1, cmd: 0xA0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        let status = engine.get_status(&mut vram, EmuTime::from_ticks(5000));
        assert_ne!(status & STATUS_TR, 0);
        assert_eq!(status & STATUS_CE, 0);

        assert_eq!(engine.read_color(&mut vram, EmuTime::from_ticks(5100)), 0xAB);
        engine.reset_color();
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_TR, 0);
    }

    #[test]
    fn lmmc_consumes_cpu_supplied_pixels() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        // The first pixel is loaded into the color register before the command is issued;
        // the engine consumes it without waiting for another write
        let regs = Regs { nx: 2, ny: 1, col: 0x12, cmd: 0xB0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        let status = engine.get_status(&mut vram, EmuTime::from_ticks(100));
        assert_ne!(status & STATUS_TR, 0);
        assert_ne!(status & STATUS_CE, 0);
        assert_eq!(vram.read(g7_addr(0, 0)), 0x12);

        engine.set_cmd_reg(&mut vram, 12, 0x34, EmuTime::from_ticks(200));
        let status = engine.get_status(&mut vram, EmuTime::from_ticks(5000));
        assert_eq!(status & STATUS_CE, 0);
        assert_eq!(vram.read(g7_addr(1, 0)), 0x34);
    }

    #[test]
    fn hmmc_consumes_cpu_supplied_bytes() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        // The first byte is loaded into the color register before the command is issued
        let regs = Regs { dx: 10, dy: 3, nx: 2, ny: 1, col: 0x11, cmd: 0xF0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        let status = engine.get_status(&mut vram, EmuTime::from_ticks(1000));
        assert_ne!(status & STATUS_TR, 0);
        assert_eq!(vram.read(g7_addr(10, 3)), 0x11);

        engine.set_cmd_reg(&mut vram, 12, 0x22, EmuTime::from_ticks(2000));
        let status = engine.get_status(&mut vram, EmuTime::from_ticks(5000));
        assert_eq!(status & STATUS_CE, 0);
        assert_eq!(vram.read(g7_addr(11, 3)), 0x22);
    }

    #[test]
    fn color_register_write_lands_between_rows() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 4, ny: 2, col: 0x11, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        // First row's writes have all executed by cycle 390; the second row's have not
        engine.set_cmd_reg(&mut vram, 12, 0x22, EmuTime::from_ticks(390));
        engine.sync(&mut vram, FAR_FUTURE);

        for x in 0..4 {
            assert_eq!(vram.read(g7_addr(x, 0)), 0x11, "x = {x}");
            assert_eq!(vram.read(g7_addr(x, 1)), 0x22, "x = {x}");
        }
    }

    #[test]
    fn stolen_slot_pushes_engine_past_cpu_access() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 0, ny: 0, col: 0xEE, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        assert_eq!(engine.engine_time, EmuTime::ZERO);

        let cpu_slot = engine.steal_access_slot(EmuTime::ZERO);
        assert_eq!(cpu_slot, EmuTime::from_ticks(16));
        assert_eq!(engine.engine_time, EmuTime::from_ticks(24));

        // The engine had not reached the second stolen slot either, so it is pushed again
        let cpu_slot = engine.steal_access_slot(EmuTime::from_ticks(16));
        assert_eq!(cpu_slot, EmuTime::from_ticks(32));
        assert_eq!(engine.engine_time, EmuTime::from_ticks(40));
    }

    #[test_log::test]
    fn finish_estimate_is_a_lower_bound() {
        let mut engine = CmdEngine::new();
        let mut vram = Vram::new(false);
        let mode = DisplayMode {
            screen: ScreenMode::Graphic7,
            display_enabled: true,
            sprites_enabled: true,
        };
        engine.update_display_mode(&mut vram, mode, false, EmuTime::ZERO);

        let regs = Regs { nx: 32, ny: 4, col: 0x5A, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        let estimate = engine.status_change_time;
        assert!(estimate > EmuTime::ZERO);
        assert!(estimate < EmuTime::INFINITY);

        let mut t = 0;
        loop {
            engine.sync(&mut vram, EmuTime::from_ticks(t));
            if !engine.command_active() {
                break;
            }
            t += 16;
        }
        assert!(EmuTime::from_ticks(t) >= estimate, "finished at {t} before estimate {estimate}");
    }

    #[test]
    fn status_poll_before_estimate_does_not_catch_up() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 32, ny: 4, col: 0x5A, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        let start_time = engine.engine_time;

        assert_ne!(engine.get_status(&mut vram, EmuTime::from_ticks(500)) & STATUS_CE, 0);
        assert_eq!(engine.engine_time, start_time);
    }

    #[test]
    fn sync_is_idempotent() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 8, ny: 2, col: 0x77, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        engine.sync(&mut vram, EmuTime::from_ticks(400));
        let engine_time = engine.engine_time;
        let row: Vec<u8> = (0..8).map(|x| vram.read(g7_addr(x, 0))).collect();

        engine.sync(&mut vram, EmuTime::from_ticks(400));
        assert_eq!(engine.engine_time, engine_time);
        assert_eq!((0..8).map(|x| vram.read(g7_addr(x, 0))).collect::<Vec<u8>>(), row);
    }

    #[test]
    fn abort_discards_remaining_work() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 0, ny: 0, col: 0xEE, cmd: 0xC0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        engine.sync(&mut vram, EmuTime::from_ticks(10_000));
        let written = count_bytes(&vram, 0xEE);
        assert!(written > 0);

        engine.set_cmd_reg(&mut vram, 14, 0x00, EmuTime::from_ticks(10_000));
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);

        engine.sync(&mut vram, FAR_FUTURE);
        assert_eq!(count_bytes(&vram, 0xEE), written);
    }

    #[test]
    fn graphic4_packs_two_pixels_per_byte() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic4);

        let regs = Regs { dx: 10, dy: 2, nx: 2, ny: 1, col: 0x05, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        assert_eq!(vram.read((2 << 7) | (10 >> 1)), 0x55);
    }

    #[test]
    fn graphic5_packs_four_pixels_per_byte() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic5);

        let regs = Regs { nx: 4, ny: 1, col: 0xFF, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        // The color register is masked to the mode's 2-bit depth
        assert_eq!(vram.read(0), 0xFF);
        assert_eq!(vram.read(1), 0);
    }

    #[test]
    fn commands_ignored_outside_bitmap_modes() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Text1);

        let regs = Regs { nx: 8, ny: 1, col: 0xFF, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
        engine.sync(&mut vram, FAR_FUTURE);
        assert_eq!(count_bytes(&vram, 0xFF), 0);
    }

    #[test]
    fn cmd_bit_forces_commands_in_non_bitmap_modes() {
        let mut engine = CmdEngine::new();
        let mut vram = Vram::new(false);
        let mode = DisplayMode {
            screen: ScreenMode::Text1,
            display_enabled: false,
            sprites_enabled: false,
        };
        engine.update_display_mode(&mut vram, mode, true, EmuTime::ZERO);

        let regs = Regs { dy: 9, nx: 4, ny: 1, col: 0x99, cmd: 0xC0, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, FAR_FUTURE);

        for x in 0..4 {
            assert_eq!(vram.read(g7_addr(x, 9)), 0x99, "x = {x}");
        }
    }

    #[test]
    fn mode_change_mid_command_keeps_running() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 8, ny: 2, col: 0x44, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        // Display turns on mid-command: the slot schedule changes but the command survives
        let mode = DisplayMode {
            screen: ScreenMode::Graphic7,
            display_enabled: true,
            sprites_enabled: true,
        };
        engine.update_display_mode(&mut vram, mode, false, EmuTime::from_ticks(500));

        engine.sync(&mut vram, FAR_FUTURE);
        for y in 0..2 {
            for x in 0..8 {
                assert_eq!(vram.read(g7_addr(x, y)), 0x44, "x = {x}, y = {y}");
            }
        }
        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test_log::test]
    fn mode_change_that_disables_commands_drops_command() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 0, ny: 0, col: 0xEE, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);

        let mode = DisplayMode {
            screen: ScreenMode::Text1,
            display_enabled: false,
            sprites_enabled: false,
        };
        engine.update_display_mode(&mut vram, mode, false, EmuTime::from_ticks(1000));

        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
    }

    #[test]
    fn save_state_round_trip_mid_command() {
        let (mut engine, mut vram) = engine_in(ScreenMode::Graphic7);

        let regs = Regs { nx: 16, ny: 16, col: 0x3C, cmd: 0x80, ..Regs::default() };
        issue(&mut engine, &mut vram, &regs, EmuTime::ZERO);
        engine.sync(&mut vram, EmuTime::from_ticks(2000));

        let mut buffer = Vec::new();
        save_state(&(engine.clone(), vram.clone()), &mut buffer).unwrap();
        let (mut engine2, mut vram2): (CmdEngine, Vram) =
            load_state(&mut buffer.as_slice()).unwrap();

        engine.sync(&mut vram, FAR_FUTURE);
        engine2.sync(&mut vram2, FAR_FUTURE);

        assert_eq!(engine.get_status(&mut vram, FAR_FUTURE) & STATUS_CE, 0);
        assert_eq!(engine2.get_status(&mut vram2, FAR_FUTURE) & STATUS_CE, 0);
        for addr in 0..0x2000 {
            assert_eq!(vram.read(addr), vram2.read(addr), "addr = {addr:#07X}");
        }
    }
}
