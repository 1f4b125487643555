use anyhow::{Result, bail};

use super::cartridge::CartridgeMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    SingleScreen0,
    SingleScreen1,
    FourScreen,
}

// Physical 1 KiB page for each of the four logical nametables.
const MIRROR_PAGES: [[u16; 4]; 5] = [
    [0, 0, 1, 1],
    [0, 1, 0, 1],
    [0, 0, 0, 0],
    [1, 1, 1, 1],
    [0, 1, 2, 3],
];

impl Mirroring {
    /// Maps a PPU nametable address ($2000-$3EFF) to an offset into nametable memory.
    /// Offsets at or above $800 only occur in four-screen mode.
    pub fn nametable_offset(self, addr: u16) -> u16 {
        let addr = addr & 0x0FFF;
        let table = (addr / 0x0400) as usize;
        MIRROR_PAGES[self as usize][table] * 0x0400 + (addr % 0x0400)
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        4 => "MMC3",
        7 => "AxROM",
        66 => "GxROM",
        _ => "Unsupported",
    }
}

fn ensure_aligned(what: &str, len: usize, bank_size: usize) -> Result<()> {
    if len % bank_size != 0 {
        bail!("{what} ({len} bytes) must be aligned to {bank_size} bytes");
    }
    Ok(())
}

fn bank_base(bank: usize, shift: u32, len: usize) -> usize {
    (bank << shift) % len
}

/// The bank-switching hardware on the cartridge board. Fixed at load time.
#[derive(Debug, Clone)]
pub enum Mapper {
    Nrom(Nrom),
    UxRom(UxRom),
    AxRom(AxRom),
    GxRom(GxRom),
    Mmc1(Mmc1),
    Mmc3(Mmc3),
}

impl Mapper {
    pub(crate) fn new(id: u16, mem: &CartridgeMemory, mirroring: Mirroring) -> Result<Self> {
        let prg_len = mem.prg_rom.len();
        let chr_len = mem.chr.len();
        let mut mapper = match id {
            0 => {
                ensure_aligned("PRG-ROM", prg_len, 0x4000)?;
                ensure_aligned("CHR", chr_len, 0x2000)?;
                if prg_len > 0x8000 {
                    bail!("NROM supports at most 32 KiB of PRG-ROM, got {prg_len} bytes");
                }
                Mapper::Nrom(Nrom::new(mirroring))
            }
            1 => {
                ensure_aligned("PRG-ROM", prg_len, 0x4000)?;
                ensure_aligned("CHR", chr_len, 0x1000)?;
                Mapper::Mmc1(Mmc1::new())
            }
            2 => {
                ensure_aligned("PRG-ROM", prg_len, 0x4000)?;
                ensure_aligned("CHR", chr_len, 0x2000)?;
                Mapper::UxRom(UxRom::new(mirroring))
            }
            4 => {
                ensure_aligned("PRG-ROM", prg_len, 0x2000)?;
                ensure_aligned("CHR", chr_len, 0x0800)?;
                Mapper::Mmc3(Mmc3::new(mirroring))
            }
            7 => {
                ensure_aligned("PRG-ROM", prg_len, 0x8000)?;
                if !mem.chr_is_ram {
                    bail!("AxROM boards require CHR-RAM");
                }
                Mapper::AxRom(AxRom::new())
            }
            66 => {
                ensure_aligned("PRG-ROM", prg_len, 0x8000)?;
                ensure_aligned("CHR", chr_len, 0x2000)?;
                Mapper::GxRom(GxRom::new(mirroring))
            }
            id => bail!("unsupported mapper {id}"),
        };
        mapper.reset(mem);
        Ok(mapper)
    }

    pub fn id(&self) -> u16 {
        match self {
            Mapper::Nrom(_) => 0,
            Mapper::Mmc1(_) => 1,
            Mapper::UxRom(_) => 2,
            Mapper::Mmc3(_) => 4,
            Mapper::AxRom(_) => 7,
            Mapper::GxRom(_) => 66,
        }
    }

    pub(crate) fn reset(&mut self, mem: &CartridgeMemory) {
        match self {
            Mapper::Nrom(m) => m.reset(mem),
            Mapper::UxRom(m) => m.reset(mem),
            Mapper::AxRom(m) => m.reset(mem),
            Mapper::GxRom(m) => m.reset(mem),
            Mapper::Mmc1(m) => m.reset(mem),
            Mapper::Mmc3(m) => m.reset(mem),
        }
    }

    pub(crate) fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        match self {
            Mapper::Nrom(m) => m.read_cpu(mem, addr),
            Mapper::UxRom(m) => m.read_cpu(mem, addr),
            Mapper::AxRom(m) => m.read_cpu(mem, addr),
            Mapper::GxRom(m) => m.read_cpu(mem, addr),
            Mapper::Mmc1(m) => m.read_cpu(mem, addr),
            Mapper::Mmc3(m) => m.read_cpu(mem, addr),
        }
    }

    pub(crate) fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        match self {
            Mapper::Nrom(_) => {
                if let Some(slot) = prg_ram_slot(mem, addr) {
                    *slot = value;
                }
            }
            Mapper::UxRom(m) => m.write_cpu(mem, addr, value),
            Mapper::AxRom(m) => m.write_cpu(mem, addr, value),
            Mapper::GxRom(m) => m.write_cpu(mem, addr, value),
            Mapper::Mmc1(m) => m.write_cpu(mem, addr, value),
            Mapper::Mmc3(m) => m.write_cpu(mem, addr, value),
        }
    }

    pub(crate) fn read_chr(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        mem.read_chr(self.chr_offset(mem, addr))
    }

    pub(crate) fn write_chr(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        let offset = self.chr_offset(mem, addr);
        mem.write_chr(offset, value);
    }

    fn chr_offset(&self, mem: &CartridgeMemory, addr: u16) -> usize {
        let addr = addr as usize & 0x1FFF;
        match self {
            Mapper::Nrom(_) | Mapper::UxRom(_) | Mapper::AxRom(_) => addr % mem.chr.len(),
            Mapper::GxRom(m) => m.chr_base | addr,
            Mapper::Mmc1(m) => m.chr_base[addr >> 12] | (addr & 0x0FFF),
            Mapper::Mmc3(m) => m.chr_base[addr >> 10] | (addr & 0x03FF),
        }
    }

    pub fn mirroring(&self) -> Mirroring {
        match self {
            Mapper::Nrom(m) => m.mirroring,
            Mapper::UxRom(m) => m.mirroring,
            Mapper::AxRom(m) => m.mirroring,
            Mapper::GxRom(m) => m.mirroring,
            Mapper::Mmc1(m) => m.mirroring,
            Mapper::Mmc3(m) => m.mirroring,
        }
    }

    pub(crate) fn scanline(&mut self, line: u16, rendering_enabled: bool) {
        if let Mapper::Mmc3(m) = self {
            m.scanline(line, rendering_enabled);
        }
    }

    pub(crate) fn irq_asserted(&self) -> bool {
        match self {
            Mapper::Mmc3(m) => m.irq_asserted,
            _ => false,
        }
    }
}

fn prg_ram_slot(mem: &mut CartridgeMemory, addr: u16) -> Option<&mut u8> {
    if !(0x6000..=0x7FFF).contains(&addr) || mem.prg_ram.is_empty() {
        return None;
    }
    let len = mem.prg_ram.len();
    mem.prg_ram.get_mut((addr as usize - 0x6000) % len)
}

fn read_prg_ram(mem: &CartridgeMemory, addr: u16) -> u8 {
    if mem.prg_ram.is_empty() {
        return 0;
    }
    mem.prg_ram[(addr as usize - 0x6000) % mem.prg_ram.len()]
}

#[derive(Debug, Clone)]
pub struct Nrom {
    mirroring: Mirroring,
    prg_base: [usize; 2],
}

impl Nrom {
    fn new(mirroring: Mirroring) -> Self {
        Self {
            mirroring,
            prg_base: [0; 2],
        }
    }

    fn reset(&mut self, mem: &CartridgeMemory) {
        let banks = mem.prg_rom.len() / 0x4000;
        self.prg_base = [0, (banks - 1) << 14];
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => read_prg_ram(mem, addr),
            0x8000..=0xFFFF => {
                let base = self.prg_base[((addr >> 14) & 1) as usize];
                mem.prg_rom[base | (addr as usize & 0x3FFF)]
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UxRom {
    mirroring: Mirroring,
    prg_base_8000: usize,
    prg_base_c000: usize,
}

impl UxRom {
    fn new(mirroring: Mirroring) -> Self {
        Self {
            mirroring,
            prg_base_8000: 0,
            prg_base_c000: 0,
        }
    }

    fn reset(&mut self, mem: &CartridgeMemory) {
        let len = mem.prg_rom.len();
        self.prg_base_8000 = 0;
        self.prg_base_c000 = len - 0x4000;
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => read_prg_ram(mem, addr),
            0x8000..=0xBFFF => mem.prg_rom[self.prg_base_8000 | (addr as usize & 0x3FFF)],
            0xC000..=0xFFFF => mem.prg_rom[self.prg_base_c000 | (addr as usize & 0x3FFF)],
            _ => 0,
        }
    }

    fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => {
                if let Some(slot) = prg_ram_slot(mem, addr) {
                    *slot = value;
                }
            }
            0x8000..=0xFFFF => {
                self.prg_base_8000 = bank_base((value & 0x0F) as usize, 14, mem.prg_rom.len());
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct AxRom {
    mirroring: Mirroring,
    prg_base: usize,
}

impl AxRom {
    fn new() -> Self {
        Self {
            mirroring: Mirroring::SingleScreen0,
            prg_base: 0,
        }
    }

    fn reset(&mut self, _mem: &CartridgeMemory) {
        self.prg_base = 0;
        self.mirroring = Mirroring::SingleScreen0;
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        if addr >= 0x8000 {
            mem.prg_rom[self.prg_base | (addr as usize & 0x7FFF)]
        } else {
            0
        }
    }

    fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        if addr < 0x8000 {
            return;
        }
        self.prg_base = bank_base((value & 0x0F) as usize, 15, mem.prg_rom.len());
        self.mirroring = if (value & 0x10) != 0 {
            Mirroring::SingleScreen1
        } else {
            Mirroring::SingleScreen0
        };
    }
}

#[derive(Debug, Clone)]
pub struct GxRom {
    mirroring: Mirroring,
    prg_base: usize,
    chr_base: usize,
}

impl GxRom {
    fn new(mirroring: Mirroring) -> Self {
        Self {
            mirroring,
            prg_base: 0,
            chr_base: 0,
        }
    }

    fn reset(&mut self, _mem: &CartridgeMemory) {
        self.prg_base = 0;
        self.chr_base = 0;
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        if addr >= 0x8000 {
            mem.prg_rom[self.prg_base | (addr as usize & 0x7FFF)]
        } else {
            0
        }
    }

    fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        if addr < 0x8000 {
            return;
        }
        self.prg_base = bank_base(((value >> 4) & 0x03) as usize, 15, mem.prg_rom.len());
        self.chr_base = bank_base((value & 0x03) as usize, 13, mem.chr.len());
    }
}

#[derive(Debug, Clone)]
pub struct Mmc1 {
    mirroring: Mirroring,
    shift_value: u8,
    shift_count: u8,
    // control, chr bank 0, chr bank 1, prg bank
    regs: [u8; 4],
    prg_ram_enabled: bool,
    prg_base: [usize; 2],
    chr_base: [usize; 2],
}

impl Mmc1 {
    fn new() -> Self {
        Self {
            mirroring: Mirroring::SingleScreen0,
            shift_value: 0,
            shift_count: 0,
            regs: [0x0C, 0, 0, 0],
            prg_ram_enabled: false,
            prg_base: [0; 2],
            chr_base: [0; 2],
        }
    }

    fn reset(&mut self, mem: &CartridgeMemory) {
        self.write_register(mem, 0, 0x0C);
        self.write_register(mem, 1, 0);
        self.write_register(mem, 2, 0);
        self.write_register(mem, 3, 0);
        self.shift_value = 0;
        self.shift_count = 0;
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF if self.prg_ram_enabled => read_prg_ram(mem, addr),
            0x8000..=0xBFFF => mem.prg_rom[self.prg_base[0] | (addr as usize & 0x3FFF)],
            0xC000..=0xFFFF => mem.prg_rom[self.prg_base[1] | (addr as usize & 0x3FFF)],
            _ => 0,
        }
    }

    fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        if addr < 0x8000 {
            if self.prg_ram_enabled {
                if let Some(slot) = prg_ram_slot(mem, addr) {
                    *slot = value;
                }
            }
            return;
        }

        if (value & 0x80) != 0 {
            self.write_register(mem, 0, self.regs[0] | 0x0C);
            self.shift_value = 0;
            self.shift_count = 0;
            return;
        }

        self.shift_value |= (value & 0x01) << self.shift_count;
        self.shift_count += 1;
        if self.shift_count == 5 {
            // Only the fifth write's address selects the target register.
            self.write_register(mem, ((addr >> 13) & 0x03) as usize, self.shift_value);
            self.shift_value = 0;
            self.shift_count = 0;
        }
    }

    fn write_register(&mut self, mem: &CartridgeMemory, reg: usize, value: u8) {
        self.regs[reg] = value;
        match reg {
            0 => {
                self.update_prg_bases(mem);
                self.update_chr_bases(mem);
                self.mirroring = match value & 0x03 {
                    0 => Mirroring::SingleScreen0,
                    1 => Mirroring::SingleScreen1,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                };
            }
            1 | 2 => self.update_chr_bases(mem),
            _ => {
                self.update_prg_bases(mem);
                self.prg_ram_enabled = !mem.prg_ram.is_empty() && (value & 0x10) == 0;
            }
        }
    }

    fn update_prg_bases(&mut self, mem: &CartridgeMemory) {
        let bank = (self.regs[3] & 0x0F) as usize;
        let last = mem.prg_rom.len() / 0x4000 - 1;
        let (lo, hi) = match (self.regs[0] >> 2) & 0x03 {
            0 | 1 => (bank & 0x0E, (bank & 0x0E) + 1),
            2 => (0, bank),
            _ => (bank, last),
        };
        let len = mem.prg_rom.len();
        self.prg_base = [bank_base(lo, 14, len), bank_base(hi, 14, len)];
    }

    fn update_chr_bases(&mut self, mem: &CartridgeMemory) {
        let (lo, hi) = if (self.regs[0] & 0x10) != 0 {
            (self.regs[1] as usize, self.regs[2] as usize)
        } else {
            let bank = (self.regs[1] & 0x1E) as usize;
            (bank, bank + 1)
        };
        let len = mem.chr.len();
        self.chr_base = [bank_base(lo, 12, len), bank_base(hi, 12, len)];
    }
}

#[derive(Debug, Clone)]
pub struct Mmc3 {
    mirroring: Mirroring,
    four_screen: bool,
    bank_select: u8,
    bank_regs: [u8; 8],
    prg_ram_enabled: bool,
    prg_ram_writable: bool,
    irq_latch: u8,
    irq_counter: u8,
    irq_enabled: bool,
    irq_asserted: bool,
    prg_base: [usize; 4],
    chr_base: [usize; 8],
}

impl Mmc3 {
    fn new(mirroring: Mirroring) -> Self {
        Self {
            mirroring,
            four_screen: mirroring == Mirroring::FourScreen,
            bank_select: 0,
            bank_regs: [0; 8],
            prg_ram_enabled: false,
            prg_ram_writable: false,
            irq_latch: 0,
            irq_counter: 0,
            irq_enabled: false,
            irq_asserted: false,
            prg_base: [0; 4],
            chr_base: [0; 8],
        }
    }

    fn reset(&mut self, mem: &CartridgeMemory) {
        self.bank_select = 0;
        self.bank_regs = [0; 8];
        self.prg_ram_enabled = false;
        self.prg_ram_writable = false;
        self.irq_latch = 0;
        self.irq_counter = 0;
        self.irq_enabled = false;
        self.irq_asserted = false;
        self.update_prg_bases(mem);
        self.update_chr_bases(mem);
    }

    fn read_cpu(&self, mem: &CartridgeMemory, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF if self.prg_ram_enabled => read_prg_ram(mem, addr),
            0x8000..=0xFFFF => {
                let slot = ((addr >> 13) & 0x03) as usize;
                mem.prg_rom[self.prg_base[slot] | (addr as usize & 0x1FFF)]
            }
            _ => 0,
        }
    }

    fn write_cpu(&mut self, mem: &mut CartridgeMemory, addr: u16, value: u8) {
        let odd = (addr & 1) != 0;
        match addr {
            0x6000..=0x7FFF => {
                if self.prg_ram_writable {
                    if let Some(slot) = prg_ram_slot(mem, addr) {
                        *slot = value;
                    }
                }
            }
            0x8000..=0x9FFF if !odd => {
                let changed = (self.bank_select ^ value) & 0xC0;
                self.bank_select = value;
                if changed != 0 {
                    self.update_prg_bases(mem);
                    self.update_chr_bases(mem);
                }
            }
            0x8000..=0x9FFF => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = match target {
                    0 | 1 => value & 0xFE,
                    6 | 7 => value & 0x3F,
                    _ => value,
                };
                if target >= 6 {
                    self.update_prg_bases(mem);
                } else {
                    self.update_chr_bases(mem);
                }
            }
            0xA000..=0xBFFF if !odd => {
                if !self.four_screen {
                    self.mirroring = if (value & 0x01) != 0 {
                        Mirroring::Horizontal
                    } else {
                        Mirroring::Vertical
                    };
                }
            }
            0xA000..=0xBFFF => {
                self.prg_ram_enabled = (value & 0x80) != 0;
                self.prg_ram_writable = self.prg_ram_enabled && (value & 0x40) == 0;
            }
            0xC000..=0xDFFF if !odd => self.irq_latch = value,
            0xC000..=0xDFFF => self.irq_counter = 0,
            0xE000..=0xFFFF if !odd => {
                self.irq_enabled = false;
                self.irq_asserted = false;
            }
            0xE000..=0xFFFF => self.irq_enabled = true,
            _ => {}
        }
    }

    /// Counts rendered lines instead of watching PPU A12 rising edges. Games that
    /// depend on the exact edge timing may see the IRQ a few dots off.
    fn scanline(&mut self, line: u16, rendering_enabled: bool) {
        if (240..261).contains(&line) || !rendering_enabled {
            return;
        }

        if self.irq_counter == 0 {
            self.irq_counter = self.irq_latch;
        } else {
            self.irq_counter -= 1;
            if self.irq_counter == 0 && self.irq_enabled {
                self.irq_asserted = true;
            }
        }
    }

    fn update_prg_bases(&mut self, mem: &CartridgeMemory) {
        let len = mem.prg_rom.len();
        let last = len / 0x2000 - 1;
        let second_last = last.saturating_sub(1);
        let r6 = self.bank_regs[6] as usize;
        let r7 = self.bank_regs[7] as usize;
        let banks = if (self.bank_select & 0x40) != 0 {
            [second_last, r7, r6, last]
        } else {
            [r6, r7, second_last, last]
        };
        for (base, bank) in self.prg_base.iter_mut().zip(banks) {
            *base = bank_base(bank, 13, len);
        }
    }

    fn update_chr_bases(&mut self, mem: &CartridgeMemory) {
        let r = self.bank_regs.map(|b| b as usize);
        let two_k = [r[0], r[0] | 1, r[1], r[1] | 1];
        let one_k = [r[2], r[3], r[4], r[5]];
        let banks = if (self.bank_select & 0x80) != 0 {
            [one_k, two_k]
        } else {
            [two_k, one_k]
        };
        let len = mem.chr.len();
        for (base, bank) in self.chr_base.iter_mut().zip(banks.concat()) {
            *base = bank_base(bank, 10, len);
        }
    }
}
