use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::cartridge::Cartridge;
use super::error::EmuError;
use super::memory::{BANK_SIZE, BufferId, MemorySpace};
use super::state::base64_bytes;

// MMC3 ignores A12 rises that follow a low period shorter than this.
const A12_LOW_DOTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

impl Mirroring {
    fn pages(self) -> [usize; 4] {
        match self {
            Self::Horizontal => [0, 0, 1, 1],
            Self::Vertical => [0, 1, 0, 1],
            Self::OneScreenLower => [0, 0, 0, 0],
            Self::OneScreenUpper => [1, 1, 1, 1],
            Self::FourScreen => [0, 1, 2, 3],
        }
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        7 => "AxROM",
        11 => "Color Dreams",
        34 => "BNROM / NINA-001",
        66 => "GxROM",
        71 => "Camerica",
        206 => "Namco 108",
        _ => "Unsupported",
    }
}

/// Cartridge memory: the CPU- and PPU-facing spaces and the buffers they
/// window into. Only the mapper's `apply` changes the windows.
#[derive(Debug, Clone)]
pub struct Board {
    pub(crate) cpu: MemorySpace,
    pub(crate) ppu: MemorySpace,
    prg_rom: BufferId,
    prg_ram: Option<BufferId>,
    chr: BufferId,
    chr_is_ram: bool,
    ciram: BufferId,
    header_mirroring: Mirroring,
    mirroring: Mirroring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    #[serde(with = "base64_bytes")]
    pub prg_ram: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub chr_ram: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciram: Vec<u8>,
}

impl Board {
    pub fn new(cart: &Cartridge) -> Self {
        let mut cpu = MemorySpace::new("cpu", 0x10000);
        let prg_rom = cpu.add_buffer(cart.prg_rom.clone(), false);
        let prg_ram = (cart.prg_ram_size > 0).then(|| {
            let mut ram = vec![0; cart.prg_ram_size.div_ceil(BANK_SIZE) * BANK_SIZE];
            if let Some(trainer) = cart.trainer.as_ref() {
                if ram.len() >= 0x1000 + trainer.len() {
                    ram[0x1000..0x1000 + trainer.len()].copy_from_slice(trainer);
                }
            }
            cpu.add_buffer(ram, true)
        });

        let mut ppu = MemorySpace::new("ppu", 0x4000);
        let chr = ppu.add_buffer(cart.chr_data.clone(), cart.chr_is_ram);
        let ciram_size = if cart.mirroring == Mirroring::FourScreen {
            0x1000
        } else {
            0x0800
        };
        let ciram = ppu.add_buffer(vec![0; ciram_size], true);

        Self {
            cpu,
            ppu,
            prg_rom,
            prg_ram,
            chr,
            chr_is_ram: cart.chr_is_ram,
            ciram,
            header_mirroring: cart.mirroring,
            mirroring: cart.mirroring,
        }
    }

    pub fn prg_rom_len(&self) -> usize {
        self.cpu.buffer_len(self.prg_rom)
    }

    pub fn chr_len(&self) -> usize {
        self.ppu.buffer_len(self.chr)
    }

    pub fn header_mirroring(&self) -> Mirroring {
        self.header_mirroring
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    /// Maps `size` bytes of PRG ROM at `target`. Negative banks count from
    /// the end of the image; out-of-range banks wrap.
    pub fn map_prg(&mut self, target: u16, size: usize, bank: i32) -> Result<(), EmuError> {
        map_banked(&mut self.cpu, self.prg_rom, target as usize, size, bank)
    }

    pub fn map_chr(&mut self, target: u16, size: usize, bank: i32) -> Result<(), EmuError> {
        map_banked(&mut self.ppu, self.chr, target as usize, size, bank)
    }

    pub fn map_prg_ram(&mut self, enabled: bool) -> Result<(), EmuError> {
        match self.prg_ram {
            Some(ram) if enabled => map_banked(&mut self.cpu, ram, 0x6000, 0x2000, 0),
            _ => self.cpu.unmap(0x6000, 0x2000),
        }
    }

    pub fn set_mirroring(&mut self, mirroring: Mirroring) -> Result<(), EmuError> {
        let pages = self.ppu.buffer_len(self.ciram) / BANK_SIZE;
        for (table, page) in mirroring.pages().into_iter().enumerate() {
            let start = (page % pages) * BANK_SIZE;
            for base in [0x2000, 0x3000] {
                self.ppu
                    .map(self.ciram, base + table * BANK_SIZE, start, start + BANK_SIZE)?;
            }
        }
        self.mirroring = mirroring;
        Ok(())
    }

    pub fn save(&self) -> BoardState {
        BoardState {
            prg_ram: self
                .prg_ram
                .map(|ram| self.cpu.buffer(ram).to_vec())
                .unwrap_or_default(),
            chr_ram: if self.chr_is_ram {
                self.ppu.buffer(self.chr).to_vec()
            } else {
                Vec::new()
            },
            ciram: self.ppu.buffer(self.ciram).to_vec(),
        }
    }

    pub fn restore(&mut self, state: &BoardState) -> Result<()> {
        let expected_prg_ram = self.prg_ram.map_or(0, |ram| self.cpu.buffer_len(ram));
        let expected_chr_ram = if self.chr_is_ram { self.chr_len() } else { 0 };
        if state.prg_ram.len() != expected_prg_ram
            || state.chr_ram.len() != expected_chr_ram
            || state.ciram.len() != self.ppu.buffer_len(self.ciram)
        {
            bail!(EmuError::IncompatibleState(
                "cartridge RAM sizes do not match the loaded image".to_string()
            ));
        }
        if let Some(ram) = self.prg_ram {
            self.cpu.buffer_mut(ram).copy_from_slice(&state.prg_ram);
        }
        if self.chr_is_ram {
            self.ppu.buffer_mut(self.chr).copy_from_slice(&state.chr_ram);
        }
        self.ppu.buffer_mut(self.ciram).copy_from_slice(&state.ciram);
        Ok(())
    }
}

fn map_banked(
    space: &mut MemorySpace,
    buffer: BufferId,
    target: usize,
    size: usize,
    bank: i32,
) -> Result<(), EmuError> {
    let total = space.buffer_len(buffer);
    if total == 0 {
        return space.unmap(target, size);
    }
    if total >= size {
        let count = (total / size) as i64;
        let start = (bank as i64).rem_euclid(count) as usize * size;
        return space.map(buffer, target, start, start + size);
    }

    // Image smaller than the window: mirror it across.
    let mut offset = 0;
    while offset < size {
        let chunk = total.min(size - offset);
        space.map(buffer, target + offset, 0, chunk)?;
        offset += chunk;
    }
    Ok(())
}

/// Bank-switching behavior of one board family. `write_register` only
/// updates registers and reports whether the windows must be recomputed;
/// `apply` derives every window from the registers and the image sizes.
pub trait BankSwitch {
    fn write_register(&mut self, addr: u16, value: u8, cpu_cycle: u64) -> bool;
    fn apply(&self, board: &mut Board) -> Result<(), EmuError>;
    fn vram_address_change(&mut self, _addr: u16, _ppu_dot: u64) {}
    fn irq_pending(&self) -> bool {
        false
    }
    fn debug_state(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mapper {
    Nrom(Nrom),
    Mmc1(Mmc1),
    Uxrom(Uxrom),
    Cnrom(Cnrom),
    Mmc3(Mmc3),
    Axrom(Axrom),
    ColorDreams(ColorDreams),
    Bnrom(Bnrom),
    Gxrom(Gxrom),
    Camerica(Camerica),
    Namco108(Namco108),
}

macro_rules! with_chip {
    ($mapper:expr, $chip:ident => $body:expr) => {
        match $mapper {
            Mapper::Nrom($chip) => $body,
            Mapper::Mmc1($chip) => $body,
            Mapper::Uxrom($chip) => $body,
            Mapper::Cnrom($chip) => $body,
            Mapper::Mmc3($chip) => $body,
            Mapper::Axrom($chip) => $body,
            Mapper::ColorDreams($chip) => $body,
            Mapper::Bnrom($chip) => $body,
            Mapper::Gxrom($chip) => $body,
            Mapper::Camerica($chip) => $body,
            Mapper::Namco108($chip) => $body,
        }
    };
}

impl Mapper {
    pub fn write_register(&mut self, addr: u16, value: u8, cpu_cycle: u64) -> bool {
        with_chip!(self, chip => chip.write_register(addr, value, cpu_cycle))
    }

    pub fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        with_chip!(self, chip => chip.apply(board))
    }

    pub fn vram_address_change(&mut self, addr: u16, ppu_dot: u64) {
        with_chip!(self, chip => chip.vram_address_change(addr, ppu_dot))
    }

    pub fn irq_pending(&self) -> bool {
        with_chip!(self, chip => chip.irq_pending())
    }

    pub fn debug_state(&self) -> String {
        with_chip!(self, chip => chip.debug_state())
    }
}

pub fn create_mapper(cart: &Cartridge) -> Result<Mapper> {
    let mapper = match cart.mapper_id {
        0 => Mapper::Nrom(Nrom),
        1 => Mapper::Mmc1(Mmc1::default()),
        2 => Mapper::Uxrom(Uxrom::default()),
        3 => Mapper::Cnrom(Cnrom::default()),
        4 => Mapper::Mmc3(Mmc3::default()),
        7 => Mapper::Axrom(Axrom::default()),
        11 => Mapper::ColorDreams(ColorDreams::default()),
        34 => Mapper::Bnrom(Bnrom {
            nina: cart.chr_data.len() > 0x2000,
            ..Bnrom::default()
        }),
        66 => Mapper::Gxrom(Gxrom::default()),
        71 => Mapper::Camerica(Camerica {
            fire_hawk: cart.submapper_id == 1,
            ..Camerica::default()
        }),
        206 => Mapper::Namco108(Namco108::default()),
        id => bail!(EmuError::UnsupportedMapper(id)),
    };
    Ok(mapper)
}

/// The cartridge as seen from the console: board memory plus mapper logic.
#[derive(Debug, Clone)]
pub struct Cart {
    pub(crate) board: Board,
    pub(crate) mapper: Mapper,
    mapper_id: u16,
}

impl Cart {
    pub fn new(cartridge: &Cartridge) -> Result<Self> {
        let mapper = create_mapper(cartridge)?;
        let mut cart = Self {
            board: Board::new(cartridge),
            mapper,
            mapper_id: cartridge.mapper_id,
        };
        cart.reload()?;
        Ok(cart)
    }

    pub fn mapper_id(&self) -> u16 {
        self.mapper_id
    }

    /// Rebuilds every window from the current registers.
    pub fn reload(&mut self) -> Result<(), EmuError> {
        self.mapper.apply(&mut self.board)
    }

    pub fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        self.board.cpu.read(addr, open_bus)
    }

    pub fn cpu_peek(&self, addr: u16) -> Option<u8> {
        self.board.cpu.peek(addr)
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8, cpu_cycle: u64) -> Result<(), EmuError> {
        self.board.cpu.write(addr, value);
        if self.mapper.write_register(addr, value, cpu_cycle) {
            log::trace!("mapper register ${addr:04X} <- ${value:02X}");
            self.mapper.apply(&mut self.board)?;
        }
        Ok(())
    }

    pub fn ppu_read(&mut self, addr: u16, ppu_dot: u64) -> u8 {
        let addr = addr & 0x3FFF;
        self.mapper.vram_address_change(addr, ppu_dot);
        self.board.ppu.read(addr, addr as u8)
    }

    pub fn ppu_peek(&self, addr: u16) -> u8 {
        let addr = addr & 0x3FFF;
        self.board.ppu.read(addr, addr as u8)
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8, ppu_dot: u64) {
        let addr = addr & 0x3FFF;
        self.mapper.vram_address_change(addr, ppu_dot);
        self.board.ppu.write(addr, value);
    }

    pub fn vram_address_change(&mut self, addr: u16, ppu_dot: u64) {
        self.mapper.vram_address_change(addr & 0x3FFF, ppu_dot);
    }

    pub fn irq_pending(&self) -> bool {
        self.mapper.irq_pending()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nrom;

impl BankSwitch for Nrom {
    fn write_register(&mut self, _addr: u16, _value: u8, _cpu_cycle: u64) -> bool {
        false
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x4000, 0)?;
        board.map_prg(0xC000, 0x4000, -1)?;
        board.map_chr(0x0000, 0x2000, 0)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mmc1 {
    shift_register: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
    last_write_cycle: Option<u64>,
}

impl Default for Mmc1 {
    fn default() -> Self {
        Self {
            shift_register: 0x10,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
            last_write_cycle: None,
        }
    }
}

impl BankSwitch for Mmc1 {
    fn write_register(&mut self, addr: u16, value: u8, cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        // The serial port drops the second of two back-to-back writes
        // (the dummy write of a read-modify-write instruction).
        let consecutive = self
            .last_write_cycle
            .is_some_and(|last| cpu_cycle == last.wrapping_add(1));
        self.last_write_cycle = Some(cpu_cycle);
        if consecutive {
            return false;
        }

        if (value & 0x80) != 0 {
            self.shift_register = 0x10;
            self.control |= 0x0C;
            return true;
        }

        let commit = (self.shift_register & 0x01) != 0;
        self.shift_register = (self.shift_register >> 1) | ((value & 0x01) << 4);
        if !commit {
            return false;
        }

        let data = self.shift_register;
        match addr {
            0x8000..=0x9FFF => self.control = data,
            0xA000..=0xBFFF => self.chr_bank0 = data,
            0xC000..=0xDFFF => self.chr_bank1 = data,
            _ => self.prg_bank = data,
        }
        self.shift_register = 0x10;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.set_mirroring(match self.control & 0x03 {
            0 => Mirroring::OneScreenLower,
            1 => Mirroring::OneScreenUpper,
            2 => Mirroring::Vertical,
            _ => Mirroring::Horizontal,
        })?;

        // SUROM-style 512K boards use CHR bit 4 as the outer 256K PRG select.
        let outer = if board.prg_rom_len() > 0x40000 {
            (self.chr_bank0 & 0x10) as i32
        } else {
            0
        };
        let bank = (self.prg_bank & 0x0F) as i32 | outer;
        match (self.control >> 2) & 0x03 {
            0 | 1 => board.map_prg(0x8000, 0x8000, bank >> 1)?,
            2 => {
                board.map_prg(0x8000, 0x4000, outer)?;
                board.map_prg(0xC000, 0x4000, bank)?;
            }
            _ => {
                board.map_prg(0x8000, 0x4000, bank)?;
                board.map_prg(0xC000, 0x4000, outer | 0x0F)?;
            }
        }

        if (self.control & 0x10) == 0 {
            board.map_chr(0x0000, 0x2000, (self.chr_bank0 >> 1) as i32)?;
        } else {
            board.map_chr(0x0000, 0x1000, self.chr_bank0 as i32)?;
            board.map_chr(0x1000, 0x1000, self.chr_bank1 as i32)?;
        }

        board.map_prg_ram((self.prg_bank & 0x10) == 0)
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC1 control=${:02X} chr=[{:02X},{:02X}] prg=${:02X} shift=${:02X}",
            self.control, self.chr_bank0, self.chr_bank1, self.prg_bank, self.shift_register
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uxrom {
    bank: u8,
}

impl BankSwitch for Uxrom {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        self.bank = value;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x4000, self.bank as i32)?;
        board.map_prg(0xC000, 0x4000, -1)?;
        board.map_chr(0x0000, 0x2000, 0)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }

    fn debug_state(&self) -> String {
        format!("UxROM bank=${:02X}", self.bank)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cnrom {
    chr_bank: u8,
}

impl BankSwitch for Cnrom {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        self.chr_bank = value;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x8000, 0)?;
        board.map_chr(0x0000, 0x2000, self.chr_bank as i32)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }

    fn debug_state(&self) -> String {
        format!("CNROM chr=${:02X}", self.chr_bank)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mmc3 {
    bank_select: u8,
    bank_regs: [u8; 8],
    horizontal: bool,
    ram_enabled: bool,
    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    irq_pending: bool,
    a12_high: bool,
    a12_fell_at: u64,
}

impl Default for Mmc3 {
    fn default() -> Self {
        Self {
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            horizontal: false,
            ram_enabled: true,
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            irq_pending: false,
            a12_high: false,
            a12_fell_at: 0,
        }
    }
}

impl Mmc3 {
    fn clock_irq_counter(&mut self) {
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            self.irq_pending = true;
        }
    }
}

impl BankSwitch for Mmc3 {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        match addr & 0xE001 {
            0x8000 => self.bank_select = value,
            0x8001 => self.bank_regs[(self.bank_select & 0x07) as usize] = value,
            0xA000 => self.horizontal = (value & 0x01) != 0,
            0xA001 => self.ram_enabled = (value & 0x80) != 0,
            0xC000 => {
                self.irq_latch = value;
                return false;
            }
            0xC001 => {
                self.irq_counter = 0;
                self.irq_reload = true;
                return false;
            }
            0xE000 => {
                self.irq_enabled = false;
                self.irq_pending = false;
                return false;
            }
            0xE001 => {
                self.irq_enabled = true;
                return false;
            }
            _ => return false,
        }
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        let r = |index: usize| self.bank_regs[index] as i32;
        if (self.bank_select & 0x40) == 0 {
            board.map_prg(0x8000, 0x2000, r(6))?;
            board.map_prg(0xC000, 0x2000, -2)?;
        } else {
            board.map_prg(0x8000, 0x2000, -2)?;
            board.map_prg(0xC000, 0x2000, r(6))?;
        }
        board.map_prg(0xA000, 0x2000, r(7))?;
        board.map_prg(0xE000, 0x2000, -1)?;

        let (two_k, one_k) = if (self.bank_select & 0x80) == 0 {
            (0x0000, 0x1000)
        } else {
            (0x1000, 0x0000)
        };
        board.map_chr(two_k, 0x0400, r(0) & 0xFE)?;
        board.map_chr(two_k + 0x0400, 0x0400, r(0) | 0x01)?;
        board.map_chr(two_k + 0x0800, 0x0400, r(1) & 0xFE)?;
        board.map_chr(two_k + 0x0C00, 0x0400, r(1) | 0x01)?;
        for slot in 0..4u16 {
            board.map_chr(one_k + slot * 0x0400, 0x0400, r(2 + slot as usize))?;
        }

        board.map_prg_ram(self.ram_enabled)?;
        if board.header_mirroring() == Mirroring::FourScreen {
            board.set_mirroring(Mirroring::FourScreen)
        } else if self.horizontal {
            board.set_mirroring(Mirroring::Horizontal)
        } else {
            board.set_mirroring(Mirroring::Vertical)
        }
    }

    fn vram_address_change(&mut self, addr: u16, ppu_dot: u64) {
        let a12 = (addr & 0x1000) != 0;
        if a12 && !self.a12_high && ppu_dot.saturating_sub(self.a12_fell_at) >= A12_LOW_DOTS {
            self.clock_irq_counter();
        } else if !a12 && self.a12_high {
            self.a12_fell_at = ppu_dot;
        }
        self.a12_high = a12;
    }

    fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC3 bank_select=${:02X} prg=[{:02X},{:02X}] chr=[{:02X},{:02X},{:02X},{:02X},{:02X},{:02X}] irq_latch=${:02X} irq_counter=${:02X} reload={} en={} pending={}",
            self.bank_select,
            self.bank_regs[6],
            self.bank_regs[7],
            self.bank_regs[0],
            self.bank_regs[1],
            self.bank_regs[2],
            self.bank_regs[3],
            self.bank_regs[4],
            self.bank_regs[5],
            self.irq_latch,
            self.irq_counter,
            self.irq_reload,
            self.irq_enabled,
            self.irq_pending
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axrom {
    value: u8,
}

impl BankSwitch for Axrom {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        self.value = value;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x8000, (self.value & 0x0F) as i32)?;
        board.map_chr(0x0000, 0x2000, 0)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(if (self.value & 0x10) == 0 {
            Mirroring::OneScreenLower
        } else {
            Mirroring::OneScreenUpper
        })
    }

    fn debug_state(&self) -> String {
        format!("AxROM reg=${:02X}", self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorDreams {
    value: u8,
}

impl BankSwitch for ColorDreams {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        self.value = value;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x8000, (self.value & 0x03) as i32)?;
        board.map_chr(0x0000, 0x2000, (self.value >> 4) as i32)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bnrom {
    nina: bool,
    prg_bank: u8,
    chr_banks: [u8; 2],
}

impl BankSwitch for Bnrom {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        match (self.nina, addr) {
            (true, 0x7FFD) => self.prg_bank = value & 0x01,
            (true, 0x7FFE) => self.chr_banks[0] = value & 0x0F,
            (true, 0x7FFF) => self.chr_banks[1] = value & 0x0F,
            (false, 0x8000..=0xFFFF) => self.prg_bank = value,
            _ => return false,
        }
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x8000, self.prg_bank as i32)?;
        if self.nina {
            board.map_chr(0x0000, 0x1000, self.chr_banks[0] as i32)?;
            board.map_chr(0x1000, 0x1000, self.chr_banks[1] as i32)?;
        } else {
            board.map_chr(0x0000, 0x2000, 0)?;
        }
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gxrom {
    value: u8,
}

impl BankSwitch for Gxrom {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        if addr < 0x8000 {
            return false;
        }
        self.value = value;
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x8000, ((self.value >> 4) & 0x03) as i32)?;
        board.map_chr(0x0000, 0x2000, (self.value & 0x03) as i32)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Camerica {
    fire_hawk: bool,
    prg_bank: u8,
    one_screen: Option<Mirroring>,
}

impl BankSwitch for Camerica {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        match addr {
            0x8000..=0x9FFF if self.fire_hawk => {
                self.one_screen = Some(if (value & 0x10) == 0 {
                    Mirroring::OneScreenLower
                } else {
                    Mirroring::OneScreenUpper
                });
            }
            0xC000..=0xFFFF => self.prg_bank = value,
            _ => return false,
        }
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        board.map_prg(0x8000, 0x4000, self.prg_bank as i32)?;
        board.map_prg(0xC000, 0x4000, -1)?;
        board.map_chr(0x0000, 0x2000, 0)?;
        board.map_prg_ram(true)?;
        board.set_mirroring(self.one_screen.unwrap_or(board.header_mirroring()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namco108 {
    bank_select: u8,
    bank_regs: [u8; 8],
}

impl BankSwitch for Namco108 {
    fn write_register(&mut self, addr: u16, value: u8, _cpu_cycle: u64) -> bool {
        match addr & 0xE001 {
            0x8000 => self.bank_select = value & 0x07,
            0x8001 => self.bank_regs[self.bank_select as usize] = value & 0x3F,
            _ => return false,
        }
        true
    }

    fn apply(&self, board: &mut Board) -> Result<(), EmuError> {
        let r = |index: usize| self.bank_regs[index] as i32;
        board.map_prg(0x8000, 0x2000, r(6) & 0x0F)?;
        board.map_prg(0xA000, 0x2000, r(7) & 0x0F)?;
        board.map_prg(0xC000, 0x2000, -2)?;
        board.map_prg(0xE000, 0x2000, -1)?;
        board.map_chr(0x0000, 0x0800, r(0) >> 1)?;
        board.map_chr(0x0800, 0x0800, r(1) >> 1)?;
        for slot in 0..4u16 {
            board.map_chr(0x1000 + slot * 0x0400, 0x0400, r(2 + slot as usize))?;
        }
        board.map_prg_ram(true)?;
        board.set_mirroring(board.header_mirroring())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    pub(crate) fn make_cart(
        mapper_id: u16,
        submapper_id: u8,
        prg_rom: Vec<u8>,
        chr_data: Vec<u8>,
        chr_is_ram: bool,
    ) -> Cartridge {
        Cartridge {
            mapper_id,
            submapper_id,
            mirroring: Mirroring::Horizontal,
            has_battery_backed_ram: false,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size: 8 * 1024,
            trainer: None,
            sha1: String::new(),
            is_nes2: false,
        }
    }

    fn write(cart: &mut Cart, addr: u16, value: u8, cycle: u64) {
        cart.cpu_write(addr, value, cycle).unwrap();
    }

    #[test]
    fn nrom_128_mirrors_prg_into_both_halves() {
        let prg = patterned_banks(0x4000, 0x4000);
        let cart = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], false)).unwrap();
        assert_eq!(cart.cpu_read(0x8000, 0), 1);
        assert_eq!(cart.cpu_read(0xFFFF, 0), 1);
        assert_eq!(cart.board.mirroring(), Mirroring::Horizontal);
    }

    #[test]
    fn horizontal_mirroring_shares_nametables_in_pairs() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut cart = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], false)).unwrap();
        cart.ppu_write(0x2005, 0x77, 0);
        assert_eq!(cart.ppu_read(0x2405, 0), 0x77);
        assert_eq!(cart.ppu_read(0x2805, 0), 0);
        assert_eq!(cart.ppu_read(0x3005, 0), 0x77);
    }

    #[test]
    fn prg_ram_is_mapped_at_6000() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut cart = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], false)).unwrap();
        write(&mut cart, 0x6123, 0x5A, 0);
        assert_eq!(cart.cpu_read(0x6123, 0), 0x5A);
    }

    #[test]
    fn mapper2_keeps_last_bank_fixed() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let mut cart = Cart::new(&make_cart(2, 0, prg, vec![0; 0x2000], true)).unwrap();

        write(&mut cart, 0x8000, 1, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 2);
        assert_eq!(cart.cpu_read(0xC000, 0), 3);
    }

    #[test]
    fn mapper3_switches_chr_bank() {
        let prg = patterned_banks(0x8000, 0x4000);
        let chr = patterned_banks(2 * 0x2000, 0x2000);
        let mut cart = Cart::new(&make_cart(3, 0, prg, chr, false)).unwrap();

        write(&mut cart, 0x8000, 1, 0);
        assert_eq!(cart.ppu_read(0x0000, 0), 2);
    }

    #[test]
    fn chr_rom_ignores_writes_but_chr_ram_accepts_them() {
        let prg = patterned_banks(0x8000, 0x4000);
        let chr = patterned_banks(0x2000, 0x2000);
        let mut rom_cart = Cart::new(&make_cart(3, 0, prg.clone(), chr, false)).unwrap();
        rom_cart.ppu_write(0x0010, 0xAB, 0);
        assert_eq!(rom_cart.ppu_read(0x0010, 0), 1);

        let mut ram_cart = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], true)).unwrap();
        ram_cart.ppu_write(0x0010, 0xAB, 0);
        assert_eq!(ram_cart.ppu_read(0x0010, 0), 0xAB);
    }

    #[test]
    fn mapper1_shift_register_programs_prg_bank() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let chr = patterned_banks(0x2000, 0x1000);
        let mut cart = Cart::new(&make_cart(1, 0, prg, chr, false)).unwrap();

        for (cycle, bit) in [1u8, 0, 0, 0, 0].into_iter().enumerate() {
            write(&mut cart, 0xE000, bit, cycle as u64 * 4);
        }

        assert_eq!(cart.cpu_read(0x8000, 0), 2);
        assert_eq!(cart.cpu_read(0xC000, 0), 4);
    }

    #[test]
    fn mapper1_ignores_back_to_back_writes() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let chr = patterned_banks(0x2000, 0x1000);
        let mut cart = Cart::new(&make_cart(1, 0, prg, chr, false)).unwrap();

        write(&mut cart, 0xE000, 1, 10);
        write(&mut cart, 0xE000, 1, 11);
        for (step, bit) in [0u8, 0, 0, 0].into_iter().enumerate() {
            write(&mut cart, 0xE000, bit, 20 + step as u64 * 4);
        }
        assert_eq!(cart.cpu_read(0x8000, 0), 2);
    }

    #[test]
    fn mapper1_control_selects_mirroring_and_chr_mode() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let chr = patterned_banks(4 * 0x1000, 0x1000);
        let mut cart = Cart::new(&make_cart(1, 0, prg, chr, false)).unwrap();

        let mut cycle = 0;
        let mut program = |cart: &mut Cart, addr: u16, value: u8| {
            for bit in 0..5 {
                write(cart, addr, (value >> bit) & 1, cycle);
                cycle += 3;
            }
        };
        program(&mut cart, 0x8000, 0x12);
        program(&mut cart, 0xA000, 0x02);
        program(&mut cart, 0xC000, 0x03);
        assert_eq!(cart.board.mirroring(), Mirroring::Vertical);
        assert_eq!(cart.ppu_read(0x0000, 0), 3);
        assert_eq!(cart.ppu_read(0x1000, 0), 4);
    }

    fn mmc3_cart() -> Cart {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(16 * 0x0400, 0x0400);
        Cart::new(&make_cart(4, 0, prg, chr, false)).unwrap()
    }

    #[test]
    fn mapper4_prg_modes_swap_fixed_bank() {
        let mut cart = mmc3_cart();
        write(&mut cart, 0x8000, 0x06, 0);
        write(&mut cart, 0x8001, 0x03, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 4);
        assert_eq!(cart.cpu_read(0xC000, 0), 7);
        assert_eq!(cart.cpu_read(0xE000, 0), 8);

        write(&mut cart, 0x8000, 0x46, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 7);
        assert_eq!(cart.cpu_read(0xC000, 0), 4);
    }

    #[test]
    fn mapper4_chr_inversion_moves_2k_banks() {
        let mut cart = mmc3_cart();
        write(&mut cart, 0x8000, 0x00, 0);
        write(&mut cart, 0x8001, 0x04, 0);
        assert_eq!(cart.ppu_read(0x0000, 0), 5);
        assert_eq!(cart.ppu_read(0x0400, 0), 6);

        write(&mut cart, 0x8000, 0x80, 0);
        assert_eq!(cart.ppu_read(0x1000, 0), 5);
        assert_eq!(cart.ppu_read(0x1400, 0), 6);
    }

    #[test]
    fn mapper4_irq_a12_edge_filtering() {
        let mut cart = mmc3_cart();
        write(&mut cart, 0xC000, 0x01, 0);
        write(&mut cart, 0xC001, 0x00, 0);
        write(&mut cart, 0xE001, 0x00, 0);

        // First counted rise reloads the counter to 1.
        cart.vram_address_change(0x0000, 0);
        cart.vram_address_change(0x1000, 20);
        assert!(!cart.irq_pending());

        // Rise after a short low period is filtered.
        cart.vram_address_change(0x0000, 24);
        cart.vram_address_change(0x1000, 28);
        assert!(!cart.irq_pending());

        cart.vram_address_change(0x0000, 30);
        cart.vram_address_change(0x1000, 30 + 341);
        assert!(cart.irq_pending());

        write(&mut cart, 0xE000, 0x00, 0);
        assert!(!cart.irq_pending());
    }

    #[test]
    fn mapper7_switches_prg_and_onescreen_mirroring() {
        let prg = patterned_banks(4 * 0x8000, 0x8000);
        let mut cart = Cart::new(&make_cart(7, 0, prg, vec![0; 0x2000], true)).unwrap();

        write(&mut cart, 0x8000, 0x12, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 3);
        assert_eq!(cart.board.mirroring(), Mirroring::OneScreenUpper);
    }

    #[test]
    fn mapper66_switches_prg_and_chr() {
        let prg = patterned_banks(4 * 0x8000, 0x8000);
        let chr = patterned_banks(4 * 0x2000, 0x2000);
        let mut cart = Cart::new(&make_cart(66, 0, prg, chr, false)).unwrap();

        write(&mut cart, 0x8000, 0x21, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 3);
        assert_eq!(cart.ppu_read(0x0000, 0), 2);
    }

    #[test]
    fn mapper71_submapper1_controls_onescreen_mirroring() {
        let prg = patterned_banks(16 * 0x4000, 0x4000);
        let mut cart = Cart::new(&make_cart(71, 1, prg, vec![0; 0x2000], true)).unwrap();

        write(&mut cart, 0xC000, 0x07, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 8);
        assert_eq!(cart.cpu_read(0xC000, 0), 16);
        write(&mut cart, 0x9000, 0x10, 0);
        assert_eq!(cart.board.mirroring(), Mirroring::OneScreenUpper);
    }

    #[test]
    fn mapper71_submapper0_ignores_mirroring_writes() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut cart = Cart::new(&make_cart(71, 0, prg, vec![0; 0x2000], true)).unwrap();

        write(&mut cart, 0x9000, 0x10, 0);
        assert_eq!(cart.board.mirroring(), Mirroring::Horizontal);
    }

    #[test]
    fn mapper34_nina_registers_live_in_prg_ram_space() {
        let prg = patterned_banks(2 * 0x8000, 0x8000);
        let chr = patterned_banks(4 * 0x1000, 0x1000);
        let mut cart = Cart::new(&make_cart(34, 0, prg, chr, false)).unwrap();

        write(&mut cart, 0x7FFD, 1, 0);
        write(&mut cart, 0x7FFF, 3, 0);
        assert_eq!(cart.cpu_read(0x8000, 0), 2);
        assert_eq!(cart.ppu_read(0x1000, 0), 4);
        assert_eq!(cart.cpu_read(0x7FFF, 0), 3);
    }

    #[test]
    fn board_state_round_trips_ram() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut cart = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], true)).unwrap();
        write(&mut cart, 0x6000, 9, 0);
        cart.ppu_write(0x0001, 8, 0);
        cart.ppu_write(0x2002, 7, 0);
        let saved = cart.board.save();

        let prg = patterned_banks(0x8000, 0x4000);
        let mut fresh = Cart::new(&make_cart(0, 0, prg, vec![0; 0x2000], true)).unwrap();
        fresh.board.restore(&saved).unwrap();
        assert_eq!(fresh.cpu_read(0x6000, 0), 9);
        assert_eq!(fresh.ppu_read(0x0001, 0), 8);
        assert_eq!(fresh.ppu_read(0x2002, 0), 7);
    }

    #[test]
    fn unsupported_mapper_is_rejected() {
        let err = Cart::new(&make_cart(5, 0, vec![0; 0x8000], vec![0; 0x2000], false)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EmuError>(),
            Some(&EmuError::UnsupportedMapper(5))
        );
    }
}
