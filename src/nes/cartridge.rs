use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};
use std::{fs, path::Path};
use tracing::debug;

use super::bus::VRAM_SIZE;
use super::mapper::{Mapper, Mirroring, mapper_name};

const INES_HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;
const PRG_ROM_UNIT: usize = 16 * 1024;
const CHR_ROM_UNIT: usize = 8 * 1024;
const PRG_RAM_UNIT: usize = 8 * 1024;
const DEFAULT_CHR_RAM_SIZE: usize = 8 * 1024;

/// Raw contents of a cartridge image, before any mapper has been attached.
#[derive(Debug, Clone)]
pub struct CartridgeData {
    pub mapper_id: u16,
    pub mirroring: Mirroring,
    pub has_battery: bool,
    pub prg_rom: Vec<u8>,
    pub chr_rom: Vec<u8>,
    pub prg_ram_size: usize,
    pub chr_ram_size: usize,
}

impl CartridgeData {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_ines_bytes(&bytes)
            .with_context(|| format!("failed to parse ROM: {}", path.display()))
    }

    pub fn from_ines_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INES_HEADER_SIZE {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mut mapper_id = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        if is_nes2 {
            mapper_id |= ((bytes[8] as u16) & 0x0F) << 8;
        }

        let mirroring = if (flags6 & 0x08) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_battery = (flags6 & 0x02) != 0;
        let trainer_present = (flags6 & 0x04) != 0;

        let prg_rom_size = bytes[4] as usize * PRG_ROM_UNIT;
        let chr_rom_size = bytes[5] as usize * CHR_ROM_UNIT;
        let prg_ram_size = if !has_battery {
            0
        } else if is_nes2 {
            let shift = bytes[10] >> 4;
            if shift == 0 { PRG_RAM_UNIT } else { 64usize << shift }
        } else {
            (bytes[8] as usize).max(1) * PRG_RAM_UNIT
        };

        let mut cursor = INES_HEADER_SIZE;
        if trainer_present {
            cursor += TRAINER_SIZE;
        }

        if bytes.len() < cursor + prg_rom_size {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_rom_size
            );
        }
        let prg_rom = bytes[cursor..cursor + prg_rom_size].to_vec();
        cursor += prg_rom_size;

        if bytes.len() < cursor + chr_rom_size {
            bail!(
                "ROM truncated: expected {} CHR bytes but file ended early",
                chr_rom_size
            );
        }
        let chr_rom = bytes[cursor..cursor + chr_rom_size].to_vec();

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery,
            prg_rom,
            chr_ram_size: if chr_rom.is_empty() {
                DEFAULT_CHR_RAM_SIZE
            } else {
                0
            },
            chr_rom,
            prg_ram_size,
        })
    }

    /// Hex SHA-1 over PRG and CHR, used to identify dumps in logs.
    pub fn sha1_hex(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(&self.prg_rom);
        hasher.update(&self.chr_rom);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Byte stores shared by every mapper variant. The vectors are sized once in
/// [`Cartridge::new`] and never grow or shrink afterwards.
#[derive(Debug, Clone)]
pub(crate) struct CartridgeMemory {
    pub(crate) prg_rom: Vec<u8>,
    pub(crate) chr: Vec<u8>,
    pub(crate) chr_is_ram: bool,
    pub(crate) prg_ram: Vec<u8>,
}

impl CartridgeMemory {
    pub(crate) fn read_chr(&self, offset: usize) -> u8 {
        self.chr[offset]
    }

    pub(crate) fn write_chr(&mut self, offset: usize, value: u8) {
        if self.chr_is_ram {
            self.chr[offset] = value;
        }
    }
}

pub struct Cartridge {
    has_battery: bool,
    memory: CartridgeMemory,
    mapper: Mapper,
    // Nametables 2 and 3 for four-screen boards.
    extra_nametables: Vec<u8>,
}

impl Cartridge {
    pub fn new(data: CartridgeData) -> Result<Self> {
        if data.prg_rom.is_empty() {
            bail!("cartridge data has no PRG-ROM");
        }
        if data.chr_rom.is_empty() && data.chr_ram_size == 0 {
            bail!("cartridge data has no CHR-ROM and no CHR-RAM");
        }

        debug!(
            mapper = data.mapper_id,
            name = mapper_name(data.mapper_id),
            prg_rom = data.prg_rom.len(),
            chr_rom = data.chr_rom.len(),
            prg_ram = data.prg_ram_size,
            chr_ram = data.chr_ram_size,
            battery = data.has_battery,
            sha1 = %data.sha1_hex(),
            "loading cartridge"
        );

        let chr_is_ram = data.chr_rom.is_empty();
        let mut prg_ram_size = data.prg_ram_size;
        if data.mapper_id == 4 {
            prg_ram_size = PRG_RAM_UNIT;
        }

        let memory = CartridgeMemory {
            prg_rom: data.prg_rom,
            chr: if chr_is_ram {
                vec![0; data.chr_ram_size]
            } else {
                data.chr_rom
            },
            chr_is_ram,
            prg_ram: vec![0; prg_ram_size],
        };
        let mapper = Mapper::new(data.mapper_id, &memory, data.mirroring)?;
        let extra_nametables = if data.mirroring == Mirroring::FourScreen {
            vec![0; VRAM_SIZE]
        } else {
            Vec::new()
        };

        Ok(Self {
            has_battery: data.has_battery,
            memory,
            mapper,
            extra_nametables,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(CartridgeData::from_file(path)?)
    }

    pub fn mapper_id(&self) -> u16 {
        self.mapper.id()
    }

    pub fn mapper_name(&self) -> &'static str {
        mapper_name(self.mapper.id())
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mapper.mirroring()
    }

    pub fn has_battery(&self) -> bool {
        self.has_battery
    }

    /// Battery-backed or work RAM at $6000-$7FFF; empty when the board has none.
    pub fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    pub fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    pub fn reset(&mut self) {
        self.mapper.reset(&self.memory);
    }

    pub fn read_cpu(&self, addr: u16) -> u8 {
        self.mapper.read_cpu(&self.memory, addr)
    }

    pub fn write_cpu(&mut self, addr: u16, value: u8) {
        self.mapper.write_cpu(&mut self.memory, addr, value);
    }

    pub fn read_ppu(&self, addr: u16, vram: &[u8; VRAM_SIZE]) -> u8 {
        let addr = addr & 0x3FFF;
        if addr < 0x2000 {
            return self.mapper.read_chr(&self.memory, addr);
        }

        let offset = self.mapper.mirroring().nametable_offset(addr) as usize;
        if offset < VRAM_SIZE {
            vram[offset]
        } else {
            self.extra_nametables
                .get(offset - VRAM_SIZE)
                .copied()
                .unwrap_or(0)
        }
    }

    pub fn write_ppu(&mut self, addr: u16, value: u8, vram: &mut [u8; VRAM_SIZE]) {
        let addr = addr & 0x3FFF;
        if addr < 0x2000 {
            self.mapper.write_chr(&mut self.memory, addr, value);
            return;
        }

        let offset = self.mapper.mirroring().nametable_offset(addr) as usize;
        if offset < VRAM_SIZE {
            vram[offset] = value;
        } else if let Some(slot) = self.extra_nametables.get_mut(offset - VRAM_SIZE) {
            *slot = value;
        }
    }

    pub fn scanline(&mut self, line: u16, rendering_enabled: bool) {
        self.mapper.scanline(line, rendering_enabled);
    }

    pub fn irq_asserted(&self) -> bool {
        self.mapper.irq_asserted()
    }
}
