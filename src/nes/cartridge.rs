use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};
use std::{fs, path::Path};

use super::compat::CompatDb;
use super::error::EmuError;
use super::mapper::Mirroring;

const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
    pub trainer: Option<Vec<u8>>,
    /// Uppercase hex SHA-1 of PRG+CHR, without header or trainer.
    pub sha1: String,
    pub is_nes2: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes_with_db(bytes, None)
    }

    pub fn from_bytes_with_db(bytes: &[u8], db: Option<&CompatDb>) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!(EmuError::InvalidHeader(
                "image is too small to contain an iNES header".to_string()
            ));
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!(EmuError::InvalidHeader(
                "bad magic, expected NES<EOF>".to_string()
            ));
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_id_low = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let mapper_id = if is_nes2 {
            mapper_id_low | (((bytes[8] as u16) & 0x0F) << 8)
        } else {
            mapper_id_low
        };
        let submapper_id = if is_nes2 { bytes[8] >> 4 } else { 0 };
        let mirroring = if (flags6 & 0x08) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let (prg_rom_size, chr_rom_size, prg_ram_size, chr_ram_size) = if is_nes2 {
            let prg = nes2_rom_size(bytes[4], bytes[9] & 0x0F, PRG_UNIT)?;
            let chr = nes2_rom_size(bytes[5], bytes[9] >> 4, CHR_UNIT)?;
            let prg_ram = nes2_ram_size(bytes[10] & 0x0F) + nes2_ram_size(bytes[10] >> 4);
            let chr_ram = nes2_ram_size(bytes[11] & 0x0F) + nes2_ram_size(bytes[11] >> 4);
            (prg, chr, prg_ram, chr_ram)
        } else {
            let prg_ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };
            (
                bytes[4] as usize * PRG_UNIT,
                bytes[5] as usize * CHR_UNIT,
                prg_ram_units * 8 * 1024,
                0,
            )
        };
        if prg_rom_size == 0 {
            bail!(EmuError::InvalidHeader("PRG ROM size is zero".to_string()));
        }

        let mut cursor = HEADER_LEN;
        let trainer = if trainer_present {
            let end = cursor + TRAINER_LEN;
            let trainer = take_section(bytes, cursor, TRAINER_LEN, "trainer")?;
            cursor = end;
            Some(trainer.to_vec())
        } else {
            None
        };

        let prg_rom = take_section(bytes, cursor, prg_rom_size, "PRG ROM")?.to_vec();
        cursor += prg_rom_size;
        let chr_rom = take_section(bytes, cursor, chr_rom_size, "CHR ROM")?;

        let mut hasher = Sha1::new();
        hasher.update(&prg_rom);
        hasher.update(chr_rom);
        let sha1 = hex_upper(&hasher.finalize());

        let (chr_data, chr_is_ram) = if chr_rom.is_empty() {
            (vec![0; chr_ram_size.max(CHR_UNIT)], true)
        } else {
            (chr_rom.to_vec(), false)
        };

        let mut cart = Self {
            mapper_id,
            submapper_id,
            mirroring,
            has_battery_backed_ram,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size,
            trainer,
            sha1,
            is_nes2,
        };
        if let Some(db) = db {
            cart.apply_compat(db);
        }

        log::info!(
            "loaded cartridge: mapper {} sub {} prg={}K chr={}K{} mirroring={:?} sha1={}",
            cart.mapper_id,
            cart.submapper_id,
            cart.prg_rom.len() / 1024,
            cart.chr_data.len() / 1024,
            if cart.chr_is_ram { " (RAM)" } else { "" },
            cart.mirroring,
            cart.sha1
        );
        Ok(cart)
    }

    fn apply_compat(&mut self, db: &CompatDb) {
        let Some(entry) = db.lookup(&self.sha1) else {
            return;
        };
        log::info!(
            "compatibility entry for {} overrides header: mapper {} -> {}",
            self.sha1,
            self.mapper_id,
            entry.mapper
        );
        self.mapper_id = entry.mapper;
        self.submapper_id = entry.submapper;
        if let Some(mirroring) = entry.mirroring {
            self.mirroring = mirroring;
        }
        self.has_battery_backed_ram = entry.battery;
        if let Some(size) = entry.prg_ram_size {
            self.prg_ram_size = size;
        }
        match entry.chr_ram_size {
            Some(size) if self.chr_is_ram && size > 0 => self.chr_data = vec![0; size],
            _ => {}
        }
    }
}

fn take_section<'a>(
    bytes: &'a [u8],
    start: usize,
    len: usize,
    section: &'static str,
) -> Result<&'a [u8]> {
    let available = bytes.len().saturating_sub(start);
    if available < len {
        bail!(EmuError::Truncated {
            section,
            expected: len,
            available,
        });
    }
    Ok(&bytes[start..start + len])
}

fn nes2_rom_size(lsb: u8, msb: u8, unit: usize) -> Result<usize> {
    if msb == 0x0F {
        let exponent = (lsb >> 2) as u32;
        let multiplier = ((lsb & 0x03) as usize) * 2 + 1;
        let Some(size) = 1usize
            .checked_shl(exponent)
            .and_then(|base| base.checked_mul(multiplier))
        else {
            bail!(EmuError::InvalidHeader(format!(
                "NES 2.0 size 2^{exponent}*{multiplier} overflows"
            )));
        };
        Ok(size)
    } else {
        Ok((((msb as usize) << 8) | lsb as usize) * unit)
    }
}

fn nes2_ram_size(shift: u8) -> usize {
    if shift == 0 { 0 } else { 64usize << shift }
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
