pub mod apu;
pub mod cartridge;
pub mod compat;
pub mod cpu;
pub mod error;
pub mod mapper;
pub mod memory;
pub mod opcodes;
mod palette;
pub mod ppu;
pub(crate) mod state;
mod trace;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use apu::{Apu, DEFAULT_SAMPLE_RATE};
use cartridge::Cartridge;
use compat::CompatDb;
use cpu::DelayedFlag;
use error::EmuError;
use mapper::{Cart, mapper_name};
use ppu::Ppu;
use state::{CpuState, STATE_VERSION, Snapshot};

pub use palette::{NES_PALETTE, argb};

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

// Master clock units. A CPU cycle is 12, a PPU dot 4; reads and writes
// split their cycle at different points.
const READ_START: u64 = 5;
const READ_END: u64 = 7;
const WRITE_START: u64 = 7;
const WRITE_END: u64 = 5;
const PPU_DIVIDER: u64 = 4;

const DEFAULT_TRACE_CAPACITY: usize = 100_000;
const MAX_DEBUG_EVENTS: usize = 512;

/// Receives mixed audio samples in [-1.0, 1.0] at the configured rate.
pub type SampleCallback = Box<dyn FnMut(f32) + Send>;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub trace_logging: bool,
    /// Trace lines kept before the oldest are dropped.
    pub trace_capacity: usize,
    pub sample_rate: u32,
    pub compat_db: Option<CompatDb>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            trace_logging: false,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            sample_rate: DEFAULT_SAMPLE_RATE,
            compat_db: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Controller {
    buttons: u8,
    shift: u8,
    strobe: bool,
}

impl Controller {
    fn set_button(&mut self, mask: u8, pressed: bool) {
        if pressed {
            self.buttons |= mask;
        } else {
            self.buttons &= !mask;
        }
        if self.strobe {
            self.shift = self.buttons;
        }
    }

    fn write_strobe(&mut self, value: u8) {
        self.strobe = (value & 0x01) != 0;
        if self.strobe {
            self.shift = self.buttons;
        }
    }

    fn read(&mut self) -> u8 {
        if self.strobe {
            return self.buttons & 0x01;
        }
        let out = self.shift & 0x01;
        self.shift = (self.shift >> 1) | 0x80;
        out
    }

    fn peek(&self) -> u8 {
        if self.strobe {
            self.buttons & 0x01
        } else {
            self.shift & 0x01
        }
    }
}

/// Pending OAM and DMC transfers. Both are serviced at the next CPU read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DmaUnit {
    sprite_active: bool,
    sprite_page: u8,
    dmc_running: bool,
    dmc_addr: u16,
    need_halt: bool,
    need_dummy_read: bool,
}

pub struct Nes {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) p: u8,
    pub(crate) sp: u8,
    pub(crate) pc: u16,
    pub(crate) cycles: u64,
    pub(crate) nmi: DelayedFlag,
    pub(crate) irq: DelayedFlag,
    prev_nmi_line: bool,
    master_clock: u64,
    ppu_clock: u64,

    ram: [u8; 2048],
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) cart: Cart,
    pristine_cart: Cart,
    rom_sha1: String,
    has_battery: bool,

    open_bus: u8,
    controllers: [Controller; 2],
    dma: DmaUnit,
    fault: Option<EmuError>,

    breakpoints: HashMap<u16, bool>,
    break_flag: Arc<AtomicBool>,
    trace_logging: bool,
    trace_capacity: usize,
    trace: VecDeque<String>,
    sample_sink: Option<SampleCallback>,

    instructions: u64,
    pub(crate) nmi_serviced_count: u64,
    pub(crate) irq_serviced_count: u64,
    debug_events: VecDeque<String>,
}

impl Nes {
    pub fn new(
        rom: &[u8],
        trace_logging: bool,
        sample_callback: Option<SampleCallback>,
    ) -> Result<Self> {
        let mut nes = Self::with_config(
            rom,
            MachineConfig {
                trace_logging,
                ..MachineConfig::default()
            },
        )?;
        nes.sample_sink = sample_callback;
        Ok(nes)
    }

    pub fn with_config(rom: &[u8], config: MachineConfig) -> Result<Self> {
        let cartridge = Cartridge::from_bytes_with_db(rom, config.compat_db.as_ref())?;
        let cart = Cart::new(&cartridge).context("failed to build cartridge board")?;

        let mut nes = Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_UNUSED,
            sp: 0,
            pc: 0,
            cycles: 0,
            nmi: DelayedFlag::default(),
            irq: DelayedFlag::default(),
            prev_nmi_line: false,
            master_clock: 0,
            ppu_clock: 0,
            ram: [0; 2048],
            ppu: Ppu::new(),
            apu: Apu::new(config.sample_rate),
            pristine_cart: cart.clone(),
            cart,
            rom_sha1: cartridge.sha1.clone(),
            has_battery: cartridge.has_battery_backed_ram,
            open_bus: 0,
            controllers: [Controller::default(); 2],
            dma: DmaUnit::default(),
            fault: None,
            breakpoints: HashMap::new(),
            break_flag: Arc::new(AtomicBool::new(false)),
            trace_logging: config.trace_logging,
            trace_capacity: config.trace_capacity.max(1),
            trace: VecDeque::new(),
            sample_sink: None,
            instructions: 0,
            nmi_serviced_count: 0,
            irq_serviced_count: 0,
            debug_events: VecDeque::new(),
        };
        nes.run_reset_sequence();
        nes.push_debug_event(format!(
            "ROM loaded: {}, PC=${:04X}",
            nes.mapper_name(),
            nes.pc
        ));
        Ok(nes)
    }

    pub fn set_sample_callback(&mut self, sample_callback: Option<SampleCallback>) {
        self.sample_sink = sample_callback;
    }

    pub fn sample_rate(&self) -> u32 {
        self.apu.sample_rate()
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.apu.set_sample_rate(sample_rate);
    }

    /// Soft reset: the reset line is pulled, RAM and cartridge keep their
    /// contents.
    pub fn reset(&mut self) {
        self.fault = None;
        self.nmi = DelayedFlag::default();
        self.irq = DelayedFlag::default();
        self.dma = DmaUnit::default();
        self.ppu.reset();
        self.apu.reset();
        self.run_reset_sequence();
        log::debug!("reset, PC=${:04X}", self.pc);
        self.push_debug_event(format!("CPU reset, PC=${:04X}", self.pc));
    }

    /// Power cycle. Only battery-backed PRG RAM survives.
    pub fn reboot(&mut self) {
        let mut cart = self.pristine_cart.clone();
        if self.has_battery {
            let mut board = cart.board.save();
            board.prg_ram = self.cart.board.save().prg_ram;
            if let Err(err) = cart.board.restore(&board) {
                log::warn!("battery RAM dropped on reboot: {err:#}");
            }
        }
        self.cart = cart;

        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.p = FLAG_UNUSED;
        self.sp = 0;
        self.pc = 0;
        self.cycles = 0;
        self.master_clock = 0;
        self.ppu_clock = 0;
        self.prev_nmi_line = false;
        self.nmi = DelayedFlag::default();
        self.irq = DelayedFlag::default();
        self.dma = DmaUnit::default();
        self.ram = [0; 2048];
        self.ppu = Ppu::new();
        self.apu = Apu::new(self.apu.sample_rate());
        self.open_bus = 0;
        self.controllers = [Controller::default(); 2];
        self.fault = None;
        self.instructions = 0;
        self.nmi_serviced_count = 0;
        self.irq_serviced_count = 0;
        self.debug_events.clear();

        self.run_reset_sequence();
        log::debug!("power cycle, PC=${:04X}", self.pc);
        self.push_debug_event(format!("Power cycle, PC=${:04X}", self.pc));
    }

    /// Executes one instruction, then the interrupt sequence if one became
    /// due during it.
    pub fn step(&mut self) -> Result<()> {
        self.check_fault()?;
        if self.trace_logging {
            let line = self.trace_line();
            log::trace!("{line}");
            if self.trace.len() >= self.trace_capacity {
                self.trace.pop_front();
            }
            self.trace.push_back(line);
        }

        self.execute_instruction();
        self.instructions = self.instructions.wrapping_add(1);
        if self.nmi.active || self.irq.active {
            self.service_interrupt();
        }
        self.check_fault()
    }

    /// Runs until the PPU starts a new frame, or a new scanline when
    /// `break_on_scanline_change` is set. Returns `true` when a breakpoint
    /// or the break handle stopped execution first.
    pub fn step_frame(&mut self, break_on_scanline_change: bool) -> Result<bool> {
        let start_frame = self.ppu.frame_count();
        let start_scanline = self.ppu.scanline();
        loop {
            self.step()?;
            if self.break_flag.swap(false, Ordering::AcqRel) {
                self.push_debug_event(format!("Break requested at ${:04X}", self.pc));
                return Ok(true);
            }
            if self.breakpoints.get(&self.pc).copied().unwrap_or(false) {
                self.push_debug_event(format!("Breakpoint hit at ${:04X}", self.pc));
                return Ok(true);
            }
            if self.ppu.frame_count() != start_frame {
                return Ok(false);
            }
            if break_on_scanline_change && self.ppu.scanline() != start_scanline {
                return Ok(false);
            }
        }
    }

    pub fn set_input_controller(&mut self, mask: u8, pressed: bool) {
        self.controllers[0].set_button(mask, pressed);
    }

    pub fn set_input_controller2(&mut self, mask: u8, pressed: bool) {
        self.controllers[1].set_button(mask, pressed);
    }

    /// Untimed bus read with the normal side effects.
    pub fn read_mem(&mut self, addr: u16) -> u8 {
        self.bus_read(addr)
    }

    /// Untimed bus write with the normal side effects.
    pub fn set_mem(&mut self, addr: u16, value: u8) {
        self.bus_write(addr, value);
    }

    pub fn peek_mem(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => self.ppu.peek_register(addr),
            0x4015 => self.apu.peek_status(),
            0x4016 => (self.open_bus & 0xE0) | self.controllers[0].peek(),
            0x4017 => (self.open_bus & 0xE0) | self.controllers[1].peek(),
            0x4000..=0x401F => self.open_bus,
            _ => self.cart.cpu_peek(addr).unwrap_or(self.open_bus),
        }
    }

    /// Debug write: RAM and any mapped cartridge byte, ROM included.
    pub fn poke_mem(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x4020..=0xFFFF => self.cart.board.cpu.poke(addr, value),
            _ => {}
        }
    }

    pub fn save_state(&self) -> Result<serde_json::Value> {
        let snapshot = Snapshot {
            version: STATE_VERSION,
            rom_sha1: self.rom_sha1.clone(),
            cpu: CpuState {
                a: self.a,
                x: self.x,
                y: self.y,
                p: self.p,
                sp: self.sp,
                pc: self.pc,
                cycles: self.cycles,
                nmi: self.nmi,
                irq: self.irq,
                prev_nmi_line: self.prev_nmi_line,
            },
            dma: self.dma,
            master_clock: self.master_clock,
            ppu_clock: self.ppu_clock,
            open_bus: self.open_bus,
            ram: self.ram.to_vec(),
            ppu: self.ppu.clone(),
            apu: self.apu.clone(),
            controllers: self.controllers,
            mapper: self.cart.mapper.clone(),
            board: self.cart.board.save(),
        };
        let value = serde_json::to_value(&snapshot).context("failed to serialize save state")?;
        log::debug!("state saved at cycle {}", self.cycles);
        Ok(value)
    }

    /// Validates the whole document before touching the machine.
    pub fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        let snapshot = Snapshot::deserialize(state)
            .map_err(|err| EmuError::IncompatibleState(err.to_string()))?;
        if snapshot.version != STATE_VERSION {
            bail!(EmuError::IncompatibleState(format!(
                "version {} is not {STATE_VERSION}",
                snapshot.version
            )));
        }
        if !snapshot.rom_sha1.eq_ignore_ascii_case(&self.rom_sha1) {
            bail!(EmuError::IncompatibleState(format!(
                "state belongs to ROM {}, loaded ROM is {}",
                snapshot.rom_sha1, self.rom_sha1
            )));
        }
        let ram: [u8; 2048] = snapshot.ram.as_slice().try_into().map_err(|_| {
            EmuError::IncompatibleState(format!("RAM holds {} bytes", snapshot.ram.len()))
        })?;
        if std::mem::discriminant(&snapshot.mapper) != std::mem::discriminant(&self.cart.mapper) {
            bail!(EmuError::IncompatibleState(
                "mapper type differs from the loaded cartridge".to_string()
            ));
        }

        let mut cart = self.cart.clone();
        cart.mapper = snapshot.mapper;
        cart.board.restore(&snapshot.board)?;
        cart.reload()?;

        let sample_rate = self.apu.sample_rate();
        let cpu = snapshot.cpu;
        self.a = cpu.a;
        self.x = cpu.x;
        self.y = cpu.y;
        self.p = cpu.p | FLAG_UNUSED;
        self.sp = cpu.sp;
        self.pc = cpu.pc;
        self.cycles = cpu.cycles;
        self.nmi = cpu.nmi;
        self.irq = cpu.irq;
        self.prev_nmi_line = cpu.prev_nmi_line;
        self.dma = snapshot.dma;
        self.master_clock = snapshot.master_clock;
        self.ppu_clock = snapshot.ppu_clock;
        self.open_bus = snapshot.open_bus;
        self.ram = ram;
        self.ppu = snapshot.ppu;
        self.apu = snapshot.apu;
        if self.apu.sample_rate() != sample_rate {
            self.apu.set_sample_rate(sample_rate);
        }
        self.controllers = snapshot.controllers;
        self.cart = cart;
        self.fault = None;

        log::debug!("state loaded at cycle {}", self.cycles);
        self.push_debug_event(format!("State loaded, PC=${:04X}", self.pc));
        Ok(())
    }

    pub fn save_state_json(&self) -> Result<String> {
        let value = self.save_state()?;
        serde_json::to_string_pretty(&value).context("failed to encode save state")
    }

    pub fn load_state_json(&mut self, json: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| EmuError::IncompatibleState(err.to_string()))?;
        self.load_state(&value)
    }

    pub fn set_breakpoint(&mut self, addr: u16, enabled: bool) {
        self.breakpoints.insert(addr, enabled);
    }

    pub fn remove_breakpoint(&mut self, addr: u16) {
        self.breakpoints.remove(&addr);
    }

    pub fn breakpoints(&self) -> Vec<(u16, bool)> {
        let mut list: Vec<_> = self.breakpoints.iter().map(|(&a, &e)| (a, e)).collect();
        list.sort_unstable();
        list
    }

    /// Setting the returned flag stops `step_frame` at the next instruction
    /// boundary. Safe to hold on another thread.
    pub fn break_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.break_flag)
    }

    pub fn set_trace_logging(&mut self, enabled: bool) {
        self.trace_logging = enabled;
    }

    pub fn trace_logging(&self) -> bool {
        self.trace_logging
    }

    pub fn take_trace(&mut self) -> Vec<String> {
        self.trace.drain(..).collect()
    }

    /// 256x240 pixels as 0xAARRGGBB.
    pub fn frame_buffer(&self) -> &[u32] {
        self.ppu.frame_buffer()
    }

    pub fn frame_count(&self) -> u64 {
        self.ppu.frame_count()
    }

    pub fn ppu_position(&self) -> (u16, u16) {
        (self.ppu.scanline(), self.ppu.dot())
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// Moves the program counter, e.g. to start nestest in automation mode.
    pub fn set_pc(&mut self, pc: u16) {
        self.pc = pc;
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn fault(&self) -> Option<&EmuError> {
        self.fault.as_ref()
    }

    pub fn rom_sha1(&self) -> &str {
        &self.rom_sha1
    }

    pub fn mapper_name(&self) -> String {
        let id = self.cart.mapper_id();
        format!("{} (mapper {id})", mapper_name(id))
    }

    /// (A, X, Y, P, SP, PC)
    pub fn debug_cpu_regs(&self) -> (u8, u8, u8, u8, u8, u16) {
        (self.a, self.x, self.y, self.p, self.sp, self.pc)
    }

    /// (PPUCTRL, PPUMASK, PPUSTATUS)
    pub fn debug_ppu_regs(&self) -> (u8, u8, u8) {
        (self.ppu.ctrl(), self.ppu.mask(), self.ppu.status())
    }

    pub fn debug_interrupt_counts(&self) -> (u64, u64) {
        (self.nmi_serviced_count, self.irq_serviced_count)
    }

    pub fn debug_mapper_state(&self) -> String {
        self.cart.mapper.debug_state()
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    pub(crate) fn raise_fault(&mut self, err: EmuError) {
        if self.fault.is_some() {
            return;
        }
        log::warn!("machine halted: {err}");
        self.push_debug_event(format!("Fault: {err}"));
        self.fault = Some(err);
    }

    fn check_fault(&self) -> Result<()> {
        match &self.fault {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    fn start_cycle(&mut self, for_read: bool) {
        self.master_clock += if for_read { READ_START } else { WRITE_START };
        self.cycles = self.cycles.wrapping_add(1);
        self.run_ppu();
        if let Some(sample) = self.apu.tick() {
            if let Some(sink) = self.sample_sink.as_mut() {
                sink(sample);
            }
        }
        if let Some(addr) = self.apu.take_dmc_dma_request() {
            self.dma.dmc_running = true;
            self.dma.dmc_addr = addr;
            self.dma.need_halt = true;
            self.dma.need_dummy_read = true;
        }
    }

    fn end_cycle(&mut self, for_read: bool) {
        self.master_clock += if for_read { READ_END } else { WRITE_END };
        self.run_ppu();

        let line = self.ppu.nmi_line();
        let edge = line && !self.prev_nmi_line;
        self.prev_nmi_line = line;
        self.nmi.clock(self.nmi.pending || edge);

        let irq_line = self.apu.irq_pending() || self.cart.irq_pending();
        self.irq.clock(irq_line && !self.get_flag(FLAG_INTERRUPT));
    }

    fn run_ppu(&mut self) {
        while self.ppu_clock + PPU_DIVIDER <= self.master_clock {
            self.ppu.tick(&mut self.cart);
            self.ppu_clock += PPU_DIVIDER;
        }
    }

    /// Arbitrates OAM and DMC DMA in front of a CPU read. The first cycle
    /// halts the CPU by repeating its read; after that reads land on get
    /// (even) cycles and OAM writes on put (odd) cycles.
    fn process_pending_dma(&mut self, read_addr: u16) {
        if !self.dma.need_halt {
            return;
        }

        self.start_cycle(true);
        self.bus_read(read_addr);
        self.end_cycle(true);
        self.dma.need_halt = false;

        // Repeated reads of the controller ports would clock their shifters.
        let skip_dummy_reads = matches!(read_addr, 0x4016 | 0x4017);
        let mut sprite_counter: u16 = 0;
        let mut sprite_offset: u8 = 0;
        let mut value = 0u8;

        while self.dma.dmc_running || self.dma.sprite_active {
            let get_cycle = (self.cycles & 0x01) == 0;
            if get_cycle {
                if self.dma.dmc_running && !self.dma.need_halt && !self.dma.need_dummy_read {
                    self.start_dma_cycle();
                    let byte = self.bus_read(self.dma.dmc_addr);
                    self.end_cycle(true);
                    self.dma.dmc_running = false;
                    self.apu.complete_dmc_dma(byte);
                } else if self.dma.sprite_active {
                    self.start_dma_cycle();
                    let addr = ((self.dma.sprite_page as u16) << 8) | sprite_offset as u16;
                    value = self.bus_read(addr);
                    self.end_cycle(true);
                    sprite_offset = sprite_offset.wrapping_add(1);
                    sprite_counter += 1;
                } else {
                    self.start_dma_cycle();
                    if !skip_dummy_reads {
                        self.bus_read(read_addr);
                    }
                    self.end_cycle(true);
                }
            } else if self.dma.sprite_active && (sprite_counter & 0x01) != 0 {
                self.start_dma_cycle();
                self.bus_write(0x2004, value);
                self.end_cycle(true);
                sprite_counter += 1;
                if sprite_counter == 0x200 {
                    self.dma.sprite_active = false;
                }
            } else {
                self.start_dma_cycle();
                if !skip_dummy_reads {
                    self.bus_read(read_addr);
                }
                self.end_cycle(true);
            }
        }
    }

    fn start_dma_cycle(&mut self) {
        if self.dma.need_halt {
            self.dma.need_halt = false;
        } else if self.dma.need_dummy_read {
            self.dma.need_dummy_read = false;
        }
        self.start_cycle(true);
    }

    fn start_sprite_dma(&mut self, page: u8) {
        self.dma.sprite_active = true;
        self.dma.sprite_page = page;
        self.dma.need_halt = true;
        log::debug!("OAM DMA from page ${page:02X} at cycle {}", self.cycles);
        self.push_debug_event(format!("OAM DMA page=${page:02X}"));
    }

    fn bus_read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => self.ppu.cpu_read(addr, &mut self.cart),
            // Bit 5 is not driven and the read leaves open bus alone.
            0x4015 => return (self.apu.read_status() & !0x20) | (self.open_bus & 0x20),
            0x4016 => (self.open_bus & 0xE0) | self.controllers[0].read(),
            0x4017 => (self.open_bus & 0xE0) | self.controllers[1].read(),
            0x4000..=0x401F => self.open_bus,
            _ => self.cart.cpu_read(addr, self.open_bus),
        };
        self.open_bus = value;
        value
    }

    fn bus_write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => self.ppu.cpu_write(addr, value, &mut self.cart),
            0x4014 => self.start_sprite_dma(value),
            0x4016 => {
                for controller in &mut self.controllers {
                    controller.write_strobe(value);
                }
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => {
                self.apu.write_register(addr, value);
                if addr == 0x4015 && !self.apu.dmc_enabled() && self.dma.dmc_running {
                    self.dma.dmc_running = false;
                    self.dma.need_dummy_read = false;
                    if !self.dma.sprite_active {
                        self.dma.need_halt = false;
                    }
                }
            }
            0x4018..=0x401F => {}
            _ => {
                if let Err(err) = self.cart.cpu_write(addr, value, self.cycles) {
                    self.raise_fault(err);
                }
            }
        }
    }

    /// One timed CPU read cycle, preceded by any DMA it has to yield to.
    pub(crate) fn cpu_read(&mut self, addr: u16) -> u8 {
        self.process_pending_dma(addr);
        self.start_cycle(true);
        let value = self.bus_read(addr);
        self.end_cycle(true);
        value
    }

    pub(crate) fn cpu_write(&mut self, addr: u16, value: u8) {
        self.start_cycle(false);
        self.bus_write(addr, value);
        self.end_cycle(false);
    }

    pub(crate) fn dummy_read(&mut self, addr: u16) {
        self.cpu_read(addr);
    }

    pub(crate) fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr);
        let hi = self.cpu_read(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// JMP ($xxFF) fetches the high byte from the start of the same page.
    pub(crate) fn read_u16_wrapped(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr);
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.cpu_read(hi_addr);
        u16::from_le_bytes([lo, hi])
    }

    pub(crate) fn push(&mut self, value: u8) {
        let addr = 0x0100 | self.sp as u16;
        self.cpu_write(addr, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    pub(crate) fn pop(&mut self) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        let addr = 0x0100 | self.sp as u16;
        self.cpu_read(addr)
    }

    pub(crate) fn push_u16(&mut self, value: u16) {
        self.push((value >> 8) as u8);
        self.push(value as u8);
    }

    pub(crate) fn pop_u16(&mut self) -> u16 {
        let lo = self.pop();
        let hi = self.pop();
        u16::from_le_bytes([lo, hi])
    }

    pub(crate) fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub(crate) fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    pub(crate) fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    pub(crate) fn fetch_byte(&mut self) -> u8 {
        let byte = self.cpu_read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    pub(crate) fn fetch_word(&mut self) -> u16 {
        let lo = self.fetch_byte();
        let hi = self.fetch_byte();
        u16::from_le_bytes([lo, hi])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nes::cartridge::tests::ines_image;
    use std::sync::Mutex;

    const NMI_HANDLER: u16 = 0x9000;
    const IRQ_HANDLER: u16 = 0x9100;

    /// NROM-256 image with `program` at $8000. NMI increments $00, IRQ
    /// acknowledges the APU and increments $01; both return with RTI.
    pub(crate) fn rom_with_program(program: &[u8]) -> Vec<u8> {
        let mut prg = vec![0xEA; 0x8000];
        prg[..program.len()].copy_from_slice(program);
        let nmi = (NMI_HANDLER - 0x8000) as usize;
        prg[nmi..nmi + 3].copy_from_slice(&[0xE6, 0x00, 0x40]);
        let irq = (IRQ_HANDLER - 0x8000) as usize;
        prg[irq..irq + 6].copy_from_slice(&[0xAD, 0x15, 0x40, 0xE6, 0x01, 0x40]);
        prg[0x7FFA..].copy_from_slice(&[0x00, 0x90, 0x00, 0x80, 0x00, 0x91]);
        ines_image(0, 0x01, &prg, &[0; 0x2000])
    }

    pub(crate) fn machine(program: &[u8]) -> Nes {
        Nes::new(&rom_with_program(program), false, None).unwrap()
    }

    fn cycles_of(nes: &mut Nes) -> u64 {
        let before = nes.cycles();
        nes.step().unwrap();
        nes.cycles() - before
    }

    #[test]
    fn power_on_runs_the_seven_cycle_reset() {
        let nes = machine(&[]);
        assert_eq!(nes.debug_cpu_regs(), (0, 0, 0, 0x24, 0xFD, 0x8000));
        assert_eq!(nes.cycles(), 7);
        assert_eq!(nes.ppu_position(), (0, 21));
    }

    #[test]
    fn instruction_cycle_counts_include_hardware_penalties() {
        #[rustfmt::skip]
        let program = [
            0xA2, 0x01,             // LDX #$01
            0xBD, 0xFF, 0x02,       // LDA $02FF,X   (page cross)
            0xBD, 0x00, 0x02,       // LDA $0200,X
            0x9D, 0x00, 0x02,       // STA $0200,X
            0xFE, 0x00, 0x02,       // INC $0200,X
            0x48,                   // PHA
            0x68,                   // PLA
            0x20, 0x20, 0x80,       // JSR $8020
            0x6C, 0x30, 0x80,       // JMP ($8030)
        ];
        let mut rom = program.to_vec();
        rom.resize(0x50, 0xEA);
        rom[0x20] = 0x60; // RTS
        rom[0x30] = 0x40; // -> $8040
        rom[0x31] = 0x80;
        #[rustfmt::skip]
        let tail = [
            0xA0, 0x01,             // LDY #$01
            0xB1, 0x10,             // LDA ($10),Y   (page cross)
            0x18,                   // CLC
            0x90, 0x00,             // BCC +0        (taken)
            0xB0, 0x00,             // BCS +0        (not taken)
        ];
        rom[0x40..0x49].copy_from_slice(&tail);
        let mut nes = machine(&rom);
        nes.poke_mem(0x0010, 0xFF);
        nes.poke_mem(0x0011, 0x02);

        let expected = [2, 5, 4, 5, 7, 3, 4, 6, 6, 5, 2, 6, 2, 3, 2];
        let actual: Vec<u64> = expected.iter().map(|_| cycles_of(&mut nes)).collect();
        assert_eq!(actual, expected);
        assert_eq!(nes.pc(), 0x8049);
    }

    #[test]
    fn read_modify_write_writes_twice() {
        let mut nes = machine(&[0xEE, 0x00, 0x03]);
        nes.poke_mem(0x0300, 0x41);
        assert_eq!(cycles_of(&mut nes), 6);
        assert_eq!(nes.peek_mem(0x0300), 0x42);
    }

    #[test]
    fn vblank_nmi_runs_the_handler() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x80,             // LDA #$80
            0x8D, 0x00, 0x20,       // STA $2000
            0x4C, 0x05, 0x80,       // JMP $8005
        ]);
        for _ in 0..3 {
            nes.step_frame(false).unwrap();
        }
        assert!(nes.peek_mem(0x0000) >= 2);
        assert_eq!(nes.debug_interrupt_counts().0 as u8, nes.peek_mem(0x0000));
    }

    #[test]
    fn apu_frame_irq_is_serviced_once_unmasked() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x00,             // LDA #$00
            0x8D, 0x17, 0x40,       // STA $4017
            0x58,                   // CLI
            0x4C, 0x06, 0x80,       // JMP $8006
        ]);
        for _ in 0..3 {
            nes.step_frame(false).unwrap();
        }
        assert!(nes.peek_mem(0x0001) >= 1);
        assert!(nes.debug_interrupt_counts().1 >= 1);
    }

    #[test]
    fn interrupt_disable_masks_irq() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x00,             // LDA #$00
            0x8D, 0x17, 0x40,       // STA $4017
            0x4C, 0x05, 0x80,       // JMP $8005
        ]);
        for _ in 0..3 {
            nes.step_frame(false).unwrap();
        }
        assert_eq!(nes.peek_mem(0x0001), 0);
        assert_ne!(nes.peek_mem(0x4015) & 0x40, 0);
    }

    #[test]
    fn cli_delays_a_pending_irq_by_one_instruction() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x00,             // LDA #$00
            0x8D, 0x17, 0x40,       // STA $4017
            0x4C, 0x05, 0x80,       // JMP $8005
        ]);
        nes.step_frame(false).unwrap();
        nes.step_frame(false).unwrap();
        assert_ne!(nes.apu.peek_status() & 0x40, 0);

        // CLI at $8005, then NOP: the IRQ is taken after the NOP.
        nes.poke_mem(0x8005, 0x58);
        nes.poke_mem(0x8006, 0xEA);
        while nes.pc() != 0x8005 {
            nes.step().unwrap();
        }
        nes.step().unwrap();
        assert_eq!(nes.pc(), 0x8006);
        nes.step().unwrap();
        assert_eq!(nes.pc(), IRQ_HANDLER);
    }

    #[test]
    fn oam_dma_copies_a_page_and_stalls_the_cpu() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x02,             // LDA #$02
            0x8D, 0x14, 0x40,       // STA $4014
            0xEA,                   // NOP
        ]);
        for i in 0..=0xFFu16 {
            nes.poke_mem(0x0200 + i, i as u8);
        }
        nes.step().unwrap();
        nes.step().unwrap();
        let stall = cycles_of(&mut nes) - 2;
        assert!(stall == 513 || stall == 514, "stalled {stall} cycles");
        for i in [0u8, 1, 0x7F, 0xFF] {
            assert_eq!(nes.ppu.peek_oam(i), i);
        }
    }

    #[test]
    fn dmc_fetch_steals_cycles_from_the_cpu() {
        #[rustfmt::skip]
        let program = [
            0xA9, 0x0F,             // LDA #$0F     fastest rate
            0x8D, 0x10, 0x40,       // STA $4010
            0xA9, 0x00,             // LDA #$00     sample at $C000
            0x8D, 0x12, 0x40,       // STA $4012
            0x8D, 0x13, 0x40,       // STA $4013    one byte
            0xA9, 0x10,             // LDA #$10
            0x8D, 0x15, 0x40,       // STA $4015
        ];
        let mut nes = machine(&program);
        for _ in 0..7 {
            nes.step().unwrap();
        }
        let before = nes.cycles();
        let mut nops = 0u64;
        while nes.apu.peek_status() & 0x10 != 0 {
            nes.step().unwrap();
            nops += 1;
            assert!(nops < 100);
        }
        let spent = nes.cycles() - before;
        assert!(spent >= nops * 2 + 3, "DMC read did not stall: {spent} cycles for {nops} NOPs");
    }

    #[test]
    fn jam_opcode_is_a_sticky_fault_until_reset() {
        let mut nes = machine(&[0xEA, 0x02]);
        nes.step().unwrap();
        let err = nes.step().unwrap_err();
        assert_eq!(
            err.downcast_ref::<EmuError>(),
            Some(&EmuError::CpuJam {
                opcode: 0x02,
                pc: 0x8001
            })
        );
        assert!(nes.step().is_err());
        assert!(nes.step_frame(false).is_err());
        assert_eq!(nes.pc(), 0x8001);

        nes.reset();
        assert!(nes.fault().is_none());
        assert_eq!(nes.pc(), 0x8000);
        assert_eq!(nes.sp, 0xFA);
        nes.step().unwrap();
    }

    #[test]
    fn breakpoints_stop_at_instruction_boundaries() {
        let mut nes = machine(&[0xEA, 0xEA, 0xEA, 0x4C, 0x00, 0x80]);
        nes.set_breakpoint(0x8002, true);
        assert!(nes.step_frame(false).unwrap());
        assert_eq!(nes.pc(), 0x8002);

        nes.set_breakpoint(0x8002, false);
        nes.set_breakpoint(0x8001, true);
        assert!(nes.step_frame(false).unwrap());
        assert_eq!(nes.pc(), 0x8001);
        assert_eq!(nes.breakpoints(), vec![(0x8001, true), (0x8002, false)]);

        nes.remove_breakpoint(0x8001);
        assert!(!nes.step_frame(false).unwrap());
    }

    #[test]
    fn break_handle_interrupts_a_frame() {
        let mut nes = machine(&[0x4C, 0x00, 0x80]);
        let handle = nes.break_handle();
        handle.store(true, Ordering::Release);
        let cycles = nes.cycles();
        assert!(nes.step_frame(false).unwrap());
        assert_eq!(nes.cycles(), cycles + 3);
        assert!(!handle.load(Ordering::Acquire));
    }

    #[test]
    fn scanline_stepping_stops_on_the_next_line() {
        let mut nes = machine(&[0x4C, 0x00, 0x80]);
        let (line, _) = nes.ppu_position();
        assert!(!nes.step_frame(true).unwrap());
        assert_eq!(nes.ppu_position().0, line + 1);
    }

    #[test]
    fn save_state_round_trip_is_idempotent() {
        #[rustfmt::skip]
        let mut nes = machine(&[
            0xA9, 0x80,             // LDA #$80
            0x8D, 0x00, 0x20,       // STA $2000
            0xE6, 0x10,             // INC $10
            0x4C, 0x05, 0x80,       // JMP $8005
        ]);
        nes.step_frame(false).unwrap();
        nes.step_frame(true).unwrap();
        let saved = nes.save_state().unwrap();

        for _ in 0..2_000 {
            nes.step().unwrap();
        }
        let reference = (nes.debug_cpu_regs(), nes.cycles(), nes.peek_mem(0x10), nes.peek_mem(0x00));

        nes.load_state(&saved).unwrap();
        assert_eq!(nes.save_state().unwrap(), saved);
        for _ in 0..2_000 {
            nes.step().unwrap();
        }
        let replay = (nes.debug_cpu_regs(), nes.cycles(), nes.peek_mem(0x10), nes.peek_mem(0x00));
        assert_eq!(replay, reference);
    }

    #[test]
    fn state_json_helpers_round_trip() {
        let mut nes = machine(&[0xE6, 0x10, 0x4C, 0x00, 0x80]);
        nes.step_frame(false).unwrap();
        let json = nes.save_state_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], STATE_VERSION);
        assert!(value["ram"].is_string());

        let mut other = machine(&[0xE6, 0x10, 0x4C, 0x00, 0x80]);
        other.load_state_json(&json).unwrap();
        assert_eq!(other.debug_cpu_regs(), nes.debug_cpu_regs());
        assert_eq!(other.peek_mem(0x10), nes.peek_mem(0x10));
    }

    #[test]
    fn state_for_another_rom_is_rejected_without_side_effects() {
        let source = machine(&[0xE6, 0x10, 0x4C, 0x00, 0x80]);
        let saved = source.save_state().unwrap();

        let mut nes = machine(&[0xA9, 0x01]);
        let regs = nes.debug_cpu_regs();
        let err = nes.load_state(&saved).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmuError>(),
            Some(EmuError::IncompatibleState(_))
        ));
        assert_eq!(nes.debug_cpu_regs(), regs);

        let mut broken = saved.clone();
        broken["version"] = serde_json::json!(STATE_VERSION + 1);
        let mut same = machine(&[0xE6, 0x10, 0x4C, 0x00, 0x80]);
        assert!(same.load_state(&broken).is_err());
        assert!(same.load_state_json("{\"version\":1}").is_err());
    }

    #[test]
    fn controller_shifts_buttons_in_hardware_order() {
        let mut nes = machine(&[]);
        nes.set_input_controller(BUTTON_A | BUTTON_START | BUTTON_RIGHT, true);
        nes.set_mem(0x4016, 1);
        nes.set_mem(0x4016, 0);
        let bits: Vec<u8> = (0..10).map(|_| nes.read_mem(0x4016) & 0x01).collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 1, 1, 1]);

        nes.set_input_controller(BUTTON_A, false);
        nes.set_mem(0x4016, 1);
        assert_eq!(nes.read_mem(0x4016) & 0x01, 0);
        nes.set_input_controller2(BUTTON_B, true);
        nes.set_mem(0x4016, 0);
        assert_eq!(nes.read_mem(0x4017) & 0x01, 0);
        assert_eq!(nes.read_mem(0x4017) & 0x01, 1);
    }

    #[test]
    fn unmapped_reads_return_the_last_bus_value() {
        let mut nes = machine(&[]);
        nes.poke_mem(0x0005, 0x5A);
        nes.read_mem(0x0005);
        assert_eq!(nes.read_mem(0x5000), 0x5A);
        assert_eq!(nes.read_mem(0x4018), 0x5A);
        nes.read_mem(0x0005);
        assert_eq!(nes.read_mem(0x4015) & 0x20, 0x5A & 0x20);
    }

    #[test]
    fn ram_is_mirrored_every_two_kilobytes() {
        let mut nes = machine(&[]);
        nes.set_mem(0x0801, 0x33);
        assert_eq!(nes.read_mem(0x0001), 0x33);
        assert_eq!(nes.peek_mem(0x1801), 0x33);
    }

    #[test]
    fn samples_reach_the_host_callback_in_range() {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&samples);
        #[rustfmt::skip]
        let mut nes = Nes::new(
            &rom_with_program(&[
                0xA9, 0xBF,             // LDA #$BF
                0x8D, 0x00, 0x40,       // STA $4000
                0xA9, 0x01,             // LDA #$01
                0x8D, 0x15, 0x40,       // STA $4015
                0xA9, 0x40,             // LDA #$40
                0x8D, 0x02, 0x40,       // STA $4002
                0x8D, 0x03, 0x40,       // STA $4003
                0x4C, 0x12, 0x80,       // JMP $8012
            ]),
            false,
            Some(Box::new(move |sample: f32| {
                if let Ok(mut samples) = sink.lock() {
                    samples.push(sample);
                }
            })),
        )
        .unwrap();
        nes.step_frame(false).unwrap();
        nes.step_frame(false).unwrap();
        let samples = samples.lock().unwrap();
        assert!(samples.len() > 700, "only {} samples", samples.len());
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(samples.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn reboot_restores_power_on_state() {
        let mut nes = machine(&[0xE6, 0x10, 0x4C, 0x00, 0x80]);
        nes.step_frame(false).unwrap();
        assert_ne!(nes.peek_mem(0x10), 0);
        nes.reboot();
        assert_eq!(nes.peek_mem(0x10), 0);
        assert_eq!(nes.cycles(), 7);
        assert_eq!(nes.frame_count(), 0);
        assert_eq!(nes.debug_cpu_regs(), (0, 0, 0, 0x24, 0xFD, 0x8000));
    }

    #[test]
    fn unsupported_mapper_fails_to_load() {
        let rom = ines_image(5, 0, &[0; 0x8000], &[0; 0x2000]);
        let err = Nes::new(&rom, false, None).err().unwrap();
        assert_eq!(
            err.root_cause().downcast_ref::<EmuError>(),
            Some(&EmuError::UnsupportedMapper(5))
        );
    }
}
