use serde::{Deserialize, Serialize};

use super::mapper::Cart;
use super::palette::argb;
use super::state::base64_bytes;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const DOTS_PER_SCANLINE: u16 = 341;
pub const SCANLINES_PER_FRAME: u16 = 262;

const PRE_RENDER_SCANLINE: u16 = 261;
const VBLANK_SCANLINE: u16 = 241;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

// Bits of the register latch fade after roughly 600ms without a refresh.
const OPEN_BUS_DECAY_FRAMES: u64 = 30;

#[derive(Debug, Clone, Copy)]
struct SpritePixel {
    slot: usize,
    pixel: u8,
    palette: u8,
    behind_bg: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    #[serde(with = "base64_bytes")]
    oam: Vec<u8>,
    secondary_oam: [u8; 32],
    palette_ram: [u8; 32],

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,
    open_bus_refreshed: [u64; 8],

    scanline: u16,
    dot: u16,
    odd_frame: bool,
    frame_count: u64,
    dots: u64,
    suppress_vblank: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    eval_count: usize,
    sprite_zero_next: bool,
    staged_patterns_lo: [u8; 8],
    staged_patterns_hi: [u8; 8],
    staged_x: [u8; 8],
    staged_attributes: [u8; 8],

    sprite_count: usize,
    sprite_zero_current: bool,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],

    #[serde(skip, default = "blank_frame")]
    frame_buffer: Vec<u32>,
}

fn blank_frame() -> Vec<u32> {
    vec![0xFF00_0000; FRAME_WIDTH * FRAME_HEIGHT]
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: vec![0; 256],
            secondary_oam: [0xFF; 32],
            palette_ram: [0x0F; 32],
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            open_bus_refreshed: [0; 8],
            scanline: 0,
            dot: 0,
            odd_frame: false,
            frame_count: 0,
            dots: 0,
            suppress_vblank: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            eval_count: 0,
            sprite_zero_next: false,
            staged_patterns_lo: [0; 8],
            staged_patterns_hi: [0; 8],
            staged_x: [0; 8],
            staged_attributes: [0; 8],
            sprite_count: 0,
            sprite_zero_current: false,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0; 8],
            sprite_attributes: [0; 8],
            frame_buffer: blank_frame(),
        }
    }

    /// Console reset: registers and the write latch clear, memory survives.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.write_toggle = false;
        self.read_buffer = 0;
        self.t = 0;
        self.fine_x = 0;
        self.scanline = 0;
        self.dot = 0;
        self.odd_frame = false;
        self.suppress_vblank = false;
        self.sprite_count = 0;
        self.eval_count = 0;
    }

    pub fn frame_buffer(&self) -> &[u32] {
        &self.frame_buffer
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn dot(&self) -> u16 {
        self.dot
    }

    pub fn dots(&self) -> u64 {
        self.dots
    }

    pub fn ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn vram_addr(&self) -> u16 {
        self.v
    }

    pub fn peek_oam(&self, index: u8) -> u8 {
        self.oam[index as usize]
    }

    pub fn peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[palette_index(index as u16)]
    }

    /// Level of the /NMI output; the CPU side detects the edge.
    pub fn nmi_line(&self) -> bool {
        (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0
    }

    pub fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn rendering_active(&self) -> bool {
        self.rendering_enabled() && (self.scanline < 240 || self.scanline == PRE_RENDER_SCANLINE)
    }

    pub fn cpu_read(&mut self, addr: u16, cart: &mut Cart) -> u8 {
        match addr & 0x0007 {
            2 => {
                // A read one dot before vblank starts hides the flag for the frame.
                if self.scanline == VBLANK_SCANLINE && self.dot == 1 {
                    self.suppress_vblank = true;
                }
                let value = (self.status & 0xE0) | (self.decayed_open_bus() & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.refresh_open_bus(value, 0xE0);
                value
            }
            4 => {
                let mut value = self.oam[self.oam_addr as usize];
                if (self.oam_addr & 0x03) == 2 {
                    value &= 0xE3;
                }
                self.refresh_open_bus(value, 0xFF);
                value
            }
            7 => {
                let addr = self.v & 0x3FFF;
                let value = if addr >= 0x3F00 {
                    let value = (self.palette_ram[palette_index(addr)] & 0x3F)
                        | (self.decayed_open_bus() & 0xC0);
                    self.read_buffer = cart.ppu_read(addr & 0x2FFF, self.dots);
                    self.refresh_open_bus(value, 0x3F);
                    value
                } else {
                    let value = self.read_buffer;
                    self.read_buffer = cart.ppu_read(addr, self.dots);
                    self.refresh_open_bus(value, 0xFF);
                    value
                };
                self.increment_vram_addr_cpu_access(cart);
                value
            }
            _ => self.decayed_open_bus(),
        }
    }

    /// Side-effect free view of a register for debuggers and tracing.
    pub fn peek_register(&self, addr: u16) -> u8 {
        match addr & 0x0007 {
            2 => (self.status & 0xE0) | (self.open_bus & 0x1F),
            4 => self.oam[self.oam_addr as usize],
            7 if (self.v & 0x3FFF) >= 0x3F00 => self.palette_ram[palette_index(self.v)],
            7 => self.read_buffer,
            _ => self.open_bus,
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8, cart: &mut Cart) {
        self.refresh_open_bus(value, 0xFF);
        match addr & 0x0007 {
            0 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
            }
            1 => self.mask = value,
            3 => self.oam_addr = value,
            4 => {
                if self.rendering_active() {
                    // Writes during rendering only bump the high six bits.
                    self.oam_addr = self.oam_addr.wrapping_add(4);
                } else {
                    self.oam[self.oam_addr as usize] = value;
                    self.oam_addr = self.oam_addr.wrapping_add(1);
                }
            }
            5 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x73E0)
                        | (((value as u16) & 0x07) << 12)
                        | (((value as u16) >> 3) << 5);
                }
                self.write_toggle = !self.write_toggle;
            }
            6 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                    cart.vram_address_change(self.v, self.dots);
                }
                self.write_toggle = !self.write_toggle;
            }
            7 => {
                let addr = self.v & 0x3FFF;
                if addr >= 0x3F00 {
                    self.palette_ram[palette_index(addr)] = value & 0x3F;
                } else {
                    cart.ppu_write(addr, value, self.dots);
                }
                self.increment_vram_addr_cpu_access(cart);
            }
            _ => {}
        }
    }

    pub fn tick(&mut self, cart: &mut Cart) {
        self.dots = self.dots.wrapping_add(1);

        let visible_line = self.scanline < 240;
        let pre_render = self.scanline == PRE_RENDER_SCANLINE;
        let rendering = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
        }
        if self.scanline == VBLANK_SCANLINE && self.dot == 1 {
            if !self.suppress_vblank {
                self.status |= STATUS_VBLANK;
            }
            self.suppress_vblank = false;
        }

        if (visible_line || pre_render) && rendering {
            self.clock_background(cart, pre_render);
        }

        if visible_line && (1..=256).contains(&self.dot) {
            self.render_pixel();
            if rendering {
                self.shift_sprite_registers();
            }
        }

        if (visible_line || pre_render) && rendering {
            self.clock_sprites(cart, visible_line);
        }

        if pre_render && rendering && self.odd_frame && self.dot == 339 {
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return;
        }

        self.dot += 1;
        if self.dot >= DOTS_PER_SCANLINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline == 240 {
                self.frame_count += 1;
            }
            if self.scanline >= SCANLINES_PER_FRAME {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn clock_background(&mut self, cart: &mut Cart, pre_render: bool) {
        let dot = self.dot;
        if (2..=257).contains(&dot) || (322..=337).contains(&dot) {
            self.shift_background_registers();
        }

        if (1..=256).contains(&dot) || (321..=336).contains(&dot) {
            match (dot - 1) & 0x07 {
                0 => {
                    self.load_background_shifters();
                    self.next_tile_id = cart.ppu_read(0x2000 | (self.v & 0x0FFF), self.dots);
                }
                2 => {
                    let addr = 0x23C0
                        | (self.v & 0x0C00)
                        | ((self.v >> 4) & 0x0038)
                        | ((self.v >> 2) & 0x0007);
                    let attr = cart.ppu_read(addr, self.dots);
                    let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                    self.next_tile_attr = (attr >> shift) & 0x03;
                }
                4 => {
                    let addr = self.background_pattern_addr();
                    self.next_tile_lsb = cart.ppu_read(addr, self.dots);
                }
                6 => {
                    let addr = self.background_pattern_addr() + 8;
                    self.next_tile_msb = cart.ppu_read(addr, self.dots);
                }
                7 => self.increment_coarse_x(),
                _ => {}
            }
        }

        match dot {
            256 => self.increment_y(),
            257 => {
                self.load_background_shifters();
                self.copy_horizontal_bits();
            }
            280..=304 if pre_render => self.copy_vertical_bits(),
            338 | 340 => {
                self.next_tile_id = cart.ppu_read(0x2000 | (self.v & 0x0FFF), self.dots);
            }
            _ => {}
        }
    }

    fn clock_sprites(&mut self, cart: &mut Cart, visible_line: bool) {
        match self.dot {
            1 if visible_line => self.secondary_oam = [0xFF; 32],
            257 => {
                if visible_line {
                    self.evaluate_sprites();
                } else {
                    self.eval_count = 0;
                    self.sprite_zero_next = false;
                }
            }
            321 => {
                self.sprite_count = self.eval_count;
                self.sprite_zero_current = self.sprite_zero_next;
                self.sprite_patterns_lo = self.staged_patterns_lo;
                self.sprite_patterns_hi = self.staged_patterns_hi;
                self.sprite_x = self.staged_x;
                self.sprite_attributes = self.staged_attributes;
            }
            _ => {}
        }

        if !(257..=320).contains(&self.dot) {
            return;
        }
        let slot = ((self.dot - 257) / 8) as usize;
        match (self.dot - 257) & 0x07 {
            0 | 2 => {
                cart.ppu_read(0x2000 | (self.v & 0x0FFF), self.dots);
            }
            4 => {
                let addr = self.sprite_pattern_addr(slot);
                let value = cart.ppu_read(addr, self.dots);
                self.stage_sprite_byte(slot, value, false);
            }
            6 => {
                let addr = self.sprite_pattern_addr(slot) + 8;
                let value = cart.ppu_read(addr, self.dots);
                self.stage_sprite_byte(slot, value, true);
            }
            _ => {}
        }
    }

    fn sprite_height(&self) -> i16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 { 16 } else { 8 }
    }

    fn evaluate_sprites(&mut self) {
        let height = self.sprite_height();
        let line = self.scanline as i16;
        let in_range = |y: u8| (0..height).contains(&(line - y as i16));

        self.eval_count = 0;
        self.sprite_zero_next = false;
        let mut n = 0;
        while n < 64 && self.eval_count < 8 {
            let base = n * 4;
            if in_range(self.oam[base]) {
                let slot = self.eval_count * 4;
                self.secondary_oam[slot..slot + 4].copy_from_slice(&self.oam[base..base + 4]);
                if n == 0 {
                    self.sprite_zero_next = true;
                }
                self.eval_count += 1;
            }
            n += 1;
        }

        // Once eight sprites are found the hardware walks OAM diagonally,
        // reading tile/attribute/X bytes as Y coordinates.
        let mut m = 0;
        while n < 64 {
            if in_range(self.oam[n * 4 + m]) {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }
            n += 1;
            m = (m + 1) & 0x03;
        }
    }

    fn sprite_pattern_addr(&self, slot: usize) -> u16 {
        let height = self.sprite_height() as u16;
        let (row, tile, attributes) = if slot < self.eval_count {
            let entry = &self.secondary_oam[slot * 4..slot * 4 + 4];
            let row = (self.scanline as i16 - entry[0] as i16).clamp(0, height as i16 - 1) as u16;
            (row, entry[1], entry[2])
        } else {
            (0, 0xFF, 0)
        };

        let row = if (attributes & 0x80) != 0 { height - 1 - row } else { row };
        if height == 16 {
            let table = ((tile & 0x01) as u16) * 0x1000;
            let tile = ((tile & 0xFE) as u16) + row / 8;
            table + tile * 16 + (row & 0x07)
        } else {
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 { 0x1000 } else { 0 };
            table + (tile as u16) * 16 + row
        }
    }

    fn stage_sprite_byte(&mut self, slot: usize, value: u8, high: bool) {
        if slot >= self.eval_count {
            self.staged_patterns_lo[slot] = 0;
            self.staged_patterns_hi[slot] = 0;
            self.staged_x[slot] = 0xFF;
            self.staged_attributes[slot] = 0;
            return;
        }

        let attributes = self.secondary_oam[slot * 4 + 2];
        let value = if (attributes & 0x40) != 0 { value.reverse_bits() } else { value };
        if high {
            self.staged_patterns_hi[slot] = value;
        } else {
            self.staged_patterns_lo[slot] = value;
        }
        self.staged_x[slot] = self.secondary_oam[slot * 4 + 3];
        self.staged_attributes[slot] = attributes;
    }

    fn render_pixel(&mut self) {
        let x = (self.dot - 1) as usize;
        let y = self.scanline as usize;

        let color_index = if !self.rendering_enabled() {
            // With rendering off the backdrop follows v when it points at palette RAM.
            if (self.v & 0x3F00) == 0x3F00 { (self.v & 0x1F) as u8 } else { 0 }
        } else {
            let (bg_pixel, bg_palette) = self.background_pixel(x);
            let sprite = self.sprite_pixel(x);

            if let Some(sprite) = sprite {
                if sprite.slot == 0 && self.sprite_zero_current && bg_pixel != 0 && x != 255 {
                    self.status |= STATUS_SPRITE_ZERO_HIT;
                }
            }

            match sprite {
                Some(sprite) if bg_pixel == 0 || !sprite.behind_bg => {
                    0x10 | (sprite.palette << 2) | sprite.pixel
                }
                _ if bg_pixel != 0 => (bg_palette << 2) | bg_pixel,
                _ => 0,
            }
        };

        let mut color = self.palette_ram[palette_index(color_index as u16)];
        if (self.mask & MASK_GRAYSCALE) != 0 {
            color &= 0x30;
        }
        self.frame_buffer[y * FRAME_WIDTH + x] = argb(color);
    }

    fn background_pixel(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 || (x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0) {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;
        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;
        let a0 = ((self.bg_shift_attr_lo & bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & bit) != 0) as u8;
        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    fn sprite_pixel(&self, x: usize) -> Option<SpritePixel> {
        if (self.mask & MASK_SHOW_SPRITES) == 0
            || (x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0)
        {
            return None;
        }

        (0..self.sprite_count).find_map(|slot| {
            if self.sprite_x[slot] != 0 {
                return None;
            }
            let p0 = (self.sprite_patterns_lo[slot] & 0x80) >> 7;
            let p1 = (self.sprite_patterns_hi[slot] & 0x80) >> 6;
            let pixel = p0 | p1;
            (pixel != 0).then(|| SpritePixel {
                slot,
                pixel,
                palette: self.sprite_attributes[slot] & 0x03,
                behind_bg: (self.sprite_attributes[slot] & 0x20) != 0,
            })
        })
    }

    fn background_pattern_addr(&self) -> u16 {
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 { 0x1000 } else { 0 };
        table + (self.next_tile_id as u16) * 16 + ((self.v >> 12) & 0x07)
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn shift_sprite_registers(&mut self) {
        for slot in 0..self.sprite_count {
            if self.sprite_x[slot] > 0 {
                self.sprite_x[slot] -= 1;
            } else {
                self.sprite_patterns_lo[slot] <<= 1;
                self.sprite_patterns_hi[slot] <<= 1;
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;
        let attr_lo = if (self.next_tile_attr & 0x01) != 0 { 0xFF } else { 0x00 };
        let attr_hi = if (self.next_tile_attr & 0x02) != 0 { 0xFF } else { 0x00 };
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn increment_vram_addr_cpu_access(&mut self, cart: &mut Cart) {
        if self.rendering_active() {
            // $2007 during rendering glitches into both scroll increments.
            self.increment_coarse_x();
            self.increment_y();
        } else if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = self.v.wrapping_add(32) & 0x7FFF;
        } else {
            self.v = self.v.wrapping_add(1) & 0x7FFF;
        }
        cart.vram_address_change(self.v, self.dots);
    }

    fn refresh_open_bus(&mut self, value: u8, driven: u8) {
        self.open_bus = (self.open_bus & !driven) | (value & driven);
        for bit in 0..8 {
            if (driven & (1 << bit)) != 0 {
                self.open_bus_refreshed[bit] = self.frame_count;
            }
        }
    }

    fn decayed_open_bus(&mut self) -> u8 {
        for bit in 0..8 {
            if self.frame_count.saturating_sub(self.open_bus_refreshed[bit]) > OPEN_BUS_DECAY_FRAMES {
                self.open_bus &= !(1 << bit);
            }
        }
        self.open_bus
    }
}

fn palette_index(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index >= 16 && (index & 0x03) == 0 {
        index - 16
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::mapper::tests::{make_cart, patterned_banks};

    fn chr_ram_cart() -> Cart {
        Cart::new(&make_cart(0, 0, patterned_banks(0x8000, 0x4000), vec![0; 0x2000], true))
            .unwrap()
    }

    fn set_vram_addr(ppu: &mut Ppu, cart: &mut Cart, addr: u16) {
        ppu.cpu_write(0x2006, (addr >> 8) as u8, cart);
        ppu.cpu_write(0x2006, addr as u8, cart);
    }

    fn run_to(ppu: &mut Ppu, cart: &mut Cart, scanline: u16, dot: u16) {
        while ppu.scanline() != scanline || ppu.dot() != dot {
            ppu.tick(cart);
        }
    }

    fn dots_until_next_frame_start(ppu: &mut Ppu, cart: &mut Cart) -> u64 {
        let start = ppu.dots();
        ppu.tick(cart);
        run_to(ppu, cart, 0, 0);
        ppu.dots() - start
    }

    #[test]
    fn vblank_sets_at_241_and_clears_on_status_read() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        run_to(&mut ppu, &mut cart, 241, 2);
        assert_ne!(ppu.status() & STATUS_VBLANK, 0);

        let status = ppu.cpu_read(0x2002, &mut cart);
        assert_ne!(status & STATUS_VBLANK, 0);
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);

        run_to(&mut ppu, &mut cart, PRE_RENDER_SCANLINE, 2);
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);
    }

    #[test]
    fn status_read_just_before_vblank_suppresses_flag() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        run_to(&mut ppu, &mut cart, VBLANK_SCANLINE, 1);
        let status = ppu.cpu_read(0x2002, &mut cart);
        assert_eq!(status & STATUS_VBLANK, 0);
        run_to(&mut ppu, &mut cart, VBLANK_SCANLINE, 10);
        assert_eq!(ppu.status() & STATUS_VBLANK, 0);
    }

    #[test]
    fn nmi_line_requires_enable_bit() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        run_to(&mut ppu, &mut cart, VBLANK_SCANLINE, 2);
        assert!(!ppu.nmi_line());
        ppu.cpu_write(0x2000, CTRL_NMI_ENABLE, &mut cart);
        assert!(ppu.nmi_line());
    }

    #[test]
    fn odd_frames_are_one_dot_shorter_when_rendering() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        assert_eq!(dots_until_next_frame_start(&mut ppu, &mut cart), 89_342);
        assert_eq!(dots_until_next_frame_start(&mut ppu, &mut cart), 89_342);

        ppu.cpu_write(0x2001, MASK_SHOW_BG, &mut cart);
        let first = dots_until_next_frame_start(&mut ppu, &mut cart);
        let second = dots_until_next_frame_start(&mut ppu, &mut cart);
        let mut lengths = [first, second];
        lengths.sort_unstable();
        assert_eq!(lengths, [89_341, 89_342]);
    }

    #[test]
    fn frame_counter_advances_at_scanline_240() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        run_to(&mut ppu, &mut cart, 239, 340);
        assert_eq!(ppu.frame_count(), 0);
        ppu.tick(&mut cart);
        assert_eq!(ppu.frame_count(), 1);
    }

    #[test]
    fn vram_reads_are_buffered_except_palette() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        ppu.cpu_write(0x2007, 0x11, &mut cart);
        ppu.cpu_write(0x2007, 0x22, &mut cart);

        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        let _stale = ppu.cpu_read(0x2007, &mut cart);
        assert_eq!(ppu.cpu_read(0x2007, &mut cart), 0x11);
        assert_eq!(ppu.cpu_read(0x2007, &mut cart), 0x22);

        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        ppu.cpu_write(0x2007, 0x2A, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        assert_eq!(ppu.cpu_read(0x2007, &mut cart) & 0x3F, 0x2A);
    }

    #[test]
    fn palette_backdrop_entries_mirror() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        set_vram_addr(&mut ppu, &mut cart, 0x3F10);
        ppu.cpu_write(0x2007, 0x05, &mut cart);
        assert_eq!(ppu.peek_palette(0x00), 0x05);
        set_vram_addr(&mut ppu, &mut cart, 0x3F04);
        ppu.cpu_write(0x2007, 0x06, &mut cart);
        assert_eq!(ppu.peek_palette(0x14), 0x06);
    }

    #[test]
    fn increment_32_mode_steps_down_a_row() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        ppu.cpu_write(0x2000, CTRL_VRAM_INC_32, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x2000);
        ppu.cpu_write(0x2007, 0x01, &mut cart);
        assert_eq!(ppu.vram_addr(), 0x2020);
    }

    #[test]
    fn write_only_registers_read_back_decaying_open_bus() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        ppu.cpu_write(0x2000, 0x00, &mut cart);
        ppu.cpu_write(0x2003, 0xA5, &mut cart);
        assert_eq!(ppu.cpu_read(0x2005, &mut cart), 0xA5);

        while ppu.frame_count() <= OPEN_BUS_DECAY_FRAMES + 1 {
            ppu.tick(&mut cart);
        }
        assert_eq!(ppu.cpu_read(0x2005, &mut cart), 0x00);
    }

    #[test]
    fn oam_data_port_skips_attribute_unused_bits() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        ppu.cpu_write(0x2003, 0x02, &mut cart);
        ppu.cpu_write(0x2004, 0xFF, &mut cart);
        ppu.cpu_write(0x2003, 0x02, &mut cart);
        assert_eq!(ppu.cpu_read(0x2004, &mut cart), 0xE3);
        assert_eq!(ppu.peek_oam(2), 0xFF);
    }

    fn solid_tile_scene(ppu: &mut Ppu, cart: &mut Cart) {
        // Tile 1: every pixel uses color 3.
        set_vram_addr(ppu, cart, 0x0010);
        for _ in 0..16 {
            ppu.cpu_write(0x2007, 0xFF, cart);
        }
        set_vram_addr(ppu, cart, 0x2000);
        for _ in 0..960 {
            ppu.cpu_write(0x2007, 0x01, cart);
        }
        set_vram_addr(ppu, cart, 0x3F00);
        for color in [0x0F, 0x01, 0x02, 0x30] {
            ppu.cpu_write(0x2007, color, cart);
        }
        ppu.cpu_write(0x2005, 0, cart);
        ppu.cpu_write(0x2005, 0, cart);
    }

    #[test]
    fn sprite_zero_hit_requires_opaque_overlap() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        solid_tile_scene(&mut ppu, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x0000);
        ppu.cpu_write(0x2000, 0x00, &mut cart);

        ppu.cpu_write(0x2003, 0x00, &mut cart);
        for byte in [30, 0x01, 0x00, 40] {
            ppu.cpu_write(0x2004, byte, &mut cart);
        }

        run_to(&mut ppu, &mut cart, PRE_RENDER_SCANLINE, 0);
        ppu.cpu_write(0x2001, 0x1E, &mut cart);
        run_to(&mut ppu, &mut cart, 30, 0);
        assert_eq!(ppu.status() & STATUS_SPRITE_ZERO_HIT, 0);
        run_to(&mut ppu, &mut cart, 32, 0);
        assert_ne!(ppu.status() & STATUS_SPRITE_ZERO_HIT, 0);
        assert_eq!(ppu.frame_buffer()[31 * FRAME_WIDTH + 39], argb(0x30));
    }

    #[test]
    fn ninth_sprite_on_a_line_sets_overflow() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        ppu.cpu_write(0x2003, 0x00, &mut cart);
        for sprite in 0..64u8 {
            let y = if sprite < 9 { 50 } else { 0xF0 };
            for byte in [y, 0, 0, sprite * 4] {
                ppu.cpu_write(0x2004, byte, &mut cart);
            }
        }
        run_to(&mut ppu, &mut cart, PRE_RENDER_SCANLINE, 0);
        ppu.cpu_write(0x2001, MASK_SHOW_SPRITES, &mut cart);
        run_to(&mut ppu, &mut cart, 49, 0);
        assert_eq!(ppu.status() & STATUS_SPRITE_OVERFLOW, 0);
        run_to(&mut ppu, &mut cart, 51, 0);
        assert_ne!(ppu.status() & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn disabled_rendering_shows_palette_entry_under_v() {
        let mut cart = chr_ram_cart();
        let mut ppu = Ppu::new();
        set_vram_addr(&mut ppu, &mut cart, 0x3F00);
        ppu.cpu_write(0x2007, 0x0F, &mut cart);
        ppu.cpu_write(0x2007, 0x16, &mut cart);
        set_vram_addr(&mut ppu, &mut cart, 0x3F01);
        run_to(&mut ppu, &mut cart, 1, 0);
        assert_eq!(ppu.frame_buffer()[0], argb(0x16));
    }
}
