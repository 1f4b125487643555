use crate::audio::AudioSink;
use crate::video::DisplaySink;

use super::apu::{Apu, DmcMemory};
use super::cartridge::Cartridge;
use super::controller::Controller;
use super::ppu::{FRAME_HEIGHT, FRAME_WIDTH, Ppu, PpuBus};

pub const WRAM_SIZE: usize = 2048;
pub const VRAM_SIZE: usize = 2048;

pub const OAM_DMA_STALL_CYCLES: u32 = 513;
pub const DMC_DMA_STALL_CYCLES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    ApuFrame,
    ApuDmc,
    Mapper,
}

impl IrqSource {
    fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// CPU interrupt inputs. NMI is edge-triggered and latched until serviced;
/// IRQ is a level, asserted while any source holds it.
#[derive(Debug, Clone, Default)]
pub struct InterruptLines {
    nmi_line: bool,
    nmi_pending: bool,
    irq_sources: u8,
}

impl InterruptLines {
    pub fn set_nmi_line(&mut self, active: bool) {
        if active && !self.nmi_line {
            self.nmi_pending = true;
        }
        self.nmi_line = active;
    }

    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    pub fn clear_nmi(&mut self) {
        self.nmi_pending = false;
    }

    pub fn set_irq_line(&mut self, source: IrqSource, active: bool) {
        if active {
            self.irq_sources |= source.mask();
        } else {
            self.irq_sources &= !source.mask();
        }
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_sources != 0
    }
}

struct PpuLink<'a> {
    vram: &'a mut [u8; VRAM_SIZE],
    cartridge: &'a mut Cartridge,
    lines: &'a mut InterruptLines,
    display: &'a mut dyn DisplaySink,
}

impl PpuBus for PpuLink<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        self.cartridge.read_ppu(addr, self.vram)
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.cartridge.write_ppu(addr, value, self.vram);
    }

    fn set_nmi_line(&mut self, active: bool) {
        self.lines.set_nmi_line(active);
    }

    fn scanline(&mut self, line: u16, rendering_enabled: bool) {
        self.cartridge.scanline(line, rendering_enabled);
    }

    fn set_pixel(&mut self, x: u32, y: u32, rgb: u32) {
        self.display.set_pixel(x, y, rgb);
    }

    fn frame_complete(&mut self) {
        self.display.display_framebuffer();
    }
}

struct DmcLink<'a> {
    cartridge: &'a Cartridge,
    stall_cycles: &'a mut u32,
}

impl DmcMemory for DmcLink<'_> {
    fn read_sample(&mut self, addr: u16) -> u8 {
        *self.stall_cycles += DMC_DMA_STALL_CYCLES;
        self.cartridge.read_cpu(addr)
    }
}

/// CPU address space and the glue between devices. CPU cycles are
/// accumulated as pending work and replayed on the PPU and APU whenever the
/// CPU is about to observe them.
pub struct Bus {
    wram: [u8; WRAM_SIZE],
    vram: [u8; VRAM_SIZE],
    ppu: Ppu,
    apu: Apu,
    controllers: [Controller; 2],
    cartridge: Cartridge,
    display: Box<dyn DisplaySink>,
    audio: Box<dyn AudioSink>,
    lines: InterruptLines,
    pending_cycles: u32,
    cpu_cycles: u32,
    stall_cycles: u32,
}

impl Bus {
    pub fn new(
        cartridge: Cartridge,
        mut display: Box<dyn DisplaySink>,
        audio: Box<dyn AudioSink>,
    ) -> Self {
        display.resize_framebuffer(FRAME_WIDTH, FRAME_HEIGHT);
        let mut bus = Self {
            wram: [0; WRAM_SIZE],
            vram: [0; VRAM_SIZE],
            ppu: Ppu::new(),
            apu: Apu::new(audio.sample_rate()),
            controllers: [Controller::new(), Controller::new()],
            cartridge,
            display,
            audio,
            lines: InterruptLines::default(),
            pending_cycles: 0,
            cpu_cycles: 0,
            stall_cycles: 0,
        };
        bus.reset_ppu();
        bus
    }

    /// Clears memory, pending work and the interrupt lines. Devices are
    /// reset separately so the caller controls the order.
    pub fn reset(&mut self) {
        self.wram.fill(0);
        self.vram.fill(0);
        self.pending_cycles = 0;
        self.cpu_cycles = 0;
        self.stall_cycles = 0;
        self.lines = InterruptLines::default();
        for controller in &mut self.controllers {
            controller.reset();
        }
    }

    pub fn reset_ppu(&mut self) {
        let mut link = PpuLink {
            vram: &mut self.vram,
            cartridge: &mut self.cartridge,
            lines: &mut self.lines,
            display: self.display.as_mut(),
        };
        self.ppu.reset(&mut link);
    }

    pub fn reset_apu(&mut self) {
        self.apu.reset();
        self.refresh_irq_lines();
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cartridge
    }

    pub fn cartridge_mut(&mut self) -> &mut Cartridge {
        &mut self.cartridge
    }

    pub fn lines(&self) -> &InterruptLines {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut InterruptLines {
        &mut self.lines
    }

    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        if let Some(controller) = self.controllers.get_mut(port) {
            controller.set_buttons(buttons);
        }
    }

    pub fn reconfigure_audio(&mut self, sample_rate: u32, channels: u16) {
        self.audio.reconfigure(sample_rate, channels);
        self.apu.set_sample_rate(sample_rate);
    }

    /// Wrapping count of CPU cycles charged since reset.
    pub fn cpu_cycles(&self) -> u32 {
        self.cpu_cycles
    }

    pub fn pending_cycles(&self) -> u32 {
        self.pending_cycles
    }

    pub fn add_pending_cycles(&mut self, cycles: u32) {
        self.pending_cycles += cycles;
        self.cpu_cycles = self.cpu_cycles.wrapping_add(cycles);
    }

    pub fn execute_pending_cycles(&mut self) {
        let cycles = std::mem::take(&mut self.pending_cycles);
        if cycles == 0 {
            return;
        }

        let mut link = PpuLink {
            vram: &mut self.vram,
            cartridge: &mut self.cartridge,
            lines: &mut self.lines,
            display: self.display.as_mut(),
        };
        self.ppu.execute(cycles * 3, &mut link);

        let mut dmc = DmcLink {
            cartridge: &self.cartridge,
            stall_cycles: &mut self.stall_cycles,
        };
        self.apu.execute(cycles, &mut dmc, self.audio.as_mut());

        self.refresh_irq_lines();
    }

    /// CPU cycles that may run before the PPU or APU must be caught up.
    pub fn max_execution_delay(&self) -> u32 {
        let ppu = (self.ppu.max_execution_delay() / 3).max(1);
        ppu.min(self.apu.max_execution_delay())
    }

    /// Suspends the CPU for `cycles`, plus one to realign on odd cycles.
    pub fn stall_cpu(&mut self, cycles: u32) {
        self.stall_cycles += cycles + (self.cpu_cycles & 1);
    }

    pub fn take_stall_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles)
    }

    pub fn read_cpu(&mut self, addr: u16) -> u8 {
        match addr >> 12 {
            0x0 | 0x1 => self.wram[(addr & 0x07FF) as usize],
            0x2 | 0x3 => {
                self.execute_pending_cycles();
                let mut link = PpuLink {
                    vram: &mut self.vram,
                    cartridge: &mut self.cartridge,
                    lines: &mut self.lines,
                    display: self.display.as_mut(),
                };
                self.ppu.read_register(addr, &mut link)
            }
            0x4 => match addr {
                0x4015 => {
                    self.execute_pending_cycles();
                    let status = self.apu.read_status();
                    self.refresh_irq_lines();
                    status
                }
                0x4016 => self.controllers[0].read_data(),
                0x4017 => self.controllers[1].read_data(),
                _ => 0,
            },
            _ => self.cartridge.read_cpu(addr),
        }
    }

    /// Side-effect free read for tracing and disassembly. Device registers
    /// read as 0.
    pub fn peek_cpu(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.wram[(addr & 0x07FF) as usize],
            0x2000..=0x4FFF => 0,
            _ => self.cartridge.read_cpu(addr),
        }
    }

    pub fn write_cpu(&mut self, addr: u16, value: u8) {
        match addr >> 12 {
            0x0 | 0x1 => self.wram[(addr & 0x07FF) as usize] = value,
            0x2 | 0x3 => {
                self.execute_pending_cycles();
                let mut link = PpuLink {
                    vram: &mut self.vram,
                    cartridge: &mut self.cartridge,
                    lines: &mut self.lines,
                    display: self.display.as_mut(),
                };
                self.ppu.write_register(addr, value, &mut link);
            }
            0x4 => match addr {
                0x4000..=0x4013 | 0x4015 | 0x4017 => {
                    self.execute_pending_cycles();
                    self.apu.write_register(addr, value);
                    self.refresh_irq_lines();
                }
                0x4014 => self.oam_dma(value),
                0x4016 => {
                    for controller in &mut self.controllers {
                        controller.write_strobe(value & 1 != 0);
                    }
                }
                _ => {}
            },
            _ => {
                self.cartridge.write_cpu(addr, value);
                self.refresh_irq_lines();
            }
        }
    }

    pub fn read_ppu(&self, addr: u16) -> u8 {
        self.cartridge.read_ppu(addr, &self.vram)
    }

    pub fn write_ppu(&mut self, addr: u16, value: u8) {
        self.cartridge.write_ppu(addr, value, &mut self.vram);
    }

    fn oam_dma(&mut self, page: u8) {
        self.execute_pending_cycles();
        let base = u16::from(page) << 8;
        let mut bytes = [0u8; 256];
        for (offset, byte) in (0u16..).zip(bytes.iter_mut()) {
            *byte = self.read_cpu(base | offset);
        }
        self.ppu.write_oam_dma(&bytes);
        self.stall_cpu(OAM_DMA_STALL_CYCLES);
    }

    fn refresh_irq_lines(&mut self) {
        self.lines
            .set_irq_line(IrqSource::ApuFrame, self.apu.frame_irq());
        self.lines.set_irq_line(IrqSource::ApuDmc, self.apu.dmc_irq());
        self.lines
            .set_irq_line(IrqSource::Mapper, self.cartridge.irq_asserted());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::NullAudioSink;
    use crate::nes::cartridge::tests::test_data;
    use crate::nes::controller::BUTTON_START;
    use crate::video::FrameBuffer;

    pub(crate) const NMI_HANDLER: u16 = 0x9000;
    pub(crate) const IRQ_HANDLER: u16 = 0x9100;

    /// NROM-128 with `program` at $8000, CHR RAM and the three vectors
    /// pointing at $8000, [`NMI_HANDLER`] and [`IRQ_HANDLER`].
    pub(crate) fn test_cart(program: &[u8]) -> Cartridge {
        let mut prg = vec![0xEA; 0x4000];
        prg[..program.len()].copy_from_slice(program);
        prg[0x1000] = 0x40; // RTI
        prg[0x1100] = 0x40;
        prg[0x3FFA..0x4000].copy_from_slice(&[
            NMI_HANDLER as u8,
            (NMI_HANDLER >> 8) as u8,
            0x00,
            0x80,
            IRQ_HANDLER as u8,
            (IRQ_HANDLER >> 8) as u8,
        ]);
        Cartridge::new(test_data(0, prg, Vec::new())).unwrap()
    }

    pub(crate) fn test_bus(program: &[u8]) -> Bus {
        Bus::new(
            test_cart(program),
            Box::new(FrameBuffer::new()),
            Box::new(NullAudioSink::new(44_100, 1)),
        )
    }

    #[test]
    fn wram_is_mirrored() {
        let mut bus = test_bus(&[]);
        bus.write_cpu(0x0001, 0x42);
        assert_eq!(bus.read_cpu(0x0801), 0x42);
        assert_eq!(bus.read_cpu(0x1801), 0x42);
        bus.write_cpu(0x1FFF, 0x17);
        assert_eq!(bus.read_cpu(0x07FF), 0x17);
    }

    #[test]
    fn cartridge_space_reaches_prg() {
        let mut bus = test_bus(&[0xA9, 0x01]);
        assert_eq!(bus.read_cpu(0x8000), 0xA9);
        assert_eq!(bus.read_cpu(0xC001), 0x01);
        assert_eq!(bus.read_cpu(0xFFFD), 0x80);
        assert_eq!(bus.read_cpu(0x4018), 0);
        assert_eq!(bus.peek_cpu(0xC001), 0x01);
        assert_eq!(bus.peek_cpu(0x2002), 0);
    }

    #[test]
    fn flush_runs_three_dots_per_cycle() {
        let mut bus = test_bus(&[]);
        assert_eq!(bus.ppu().position(), (240, 340));
        bus.add_pending_cycles(2);
        assert_eq!(bus.ppu().position(), (240, 340));
        bus.execute_pending_cycles();
        assert_eq!(bus.ppu().position(), (241, 5));
        assert_eq!(bus.pending_cycles(), 0);
        assert_eq!(bus.cpu_cycles(), 2);
    }

    #[test]
    fn register_access_flushes_first() {
        let mut bus = test_bus(&[]);
        bus.add_pending_cycles(10);
        bus.read_cpu(0x2002);
        assert_eq!(bus.pending_cycles(), 0);

        bus.add_pending_cycles(10);
        bus.write_cpu(0x4015, 0);
        assert_eq!(bus.pending_cycles(), 0);

        bus.add_pending_cycles(10);
        bus.read_cpu(0x0000);
        assert_eq!(bus.pending_cycles(), 10);
    }

    #[test]
    fn nmi_is_edge_latched() {
        let mut lines = InterruptLines::default();
        lines.set_nmi_line(true);
        assert!(lines.nmi_pending());
        lines.clear_nmi();
        lines.set_nmi_line(true);
        assert!(!lines.nmi_pending());
        lines.set_nmi_line(false);
        lines.set_nmi_line(true);
        assert!(lines.nmi_pending());
    }

    #[test]
    fn irq_is_level_over_sources() {
        let mut lines = InterruptLines::default();
        lines.set_irq_line(IrqSource::ApuFrame, true);
        lines.set_irq_line(IrqSource::Mapper, true);
        lines.set_irq_line(IrqSource::ApuFrame, false);
        assert!(lines.irq_asserted());
        lines.set_irq_line(IrqSource::Mapper, false);
        assert!(!lines.irq_asserted());
    }

    #[test]
    fn stall_adds_one_on_odd_cycles() {
        let mut bus = test_bus(&[]);
        bus.stall_cpu(OAM_DMA_STALL_CYCLES);
        assert_eq!(bus.take_stall_cycles(), 513);
        bus.add_pending_cycles(1);
        bus.stall_cpu(OAM_DMA_STALL_CYCLES);
        assert_eq!(bus.take_stall_cycles(), 514);
        assert_eq!(bus.take_stall_cycles(), 0);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls() {
        let mut bus = test_bus(&[]);
        for i in 0..256u16 {
            bus.write_cpu(0x0200 + i, i as u8 ^ 0x5A);
        }
        bus.write_cpu(0x4014, 0x02);
        assert_eq!(bus.take_stall_cycles(), 513);

        bus.write_cpu(0x2003, 0x05);
        assert_eq!(bus.read_cpu(0x2004), 0x05 ^ 0x5A);
    }

    #[test]
    fn controller_port_reads_start_fourth() {
        let mut bus = test_bus(&[]);
        bus.set_buttons(0, BUTTON_START);
        bus.write_cpu(0x4016, 1);
        bus.write_cpu(0x4016, 0);
        let bits: Vec<u8> = (0..8).map(|_| bus.read_cpu(0x4016)).collect();
        assert_eq!(bits, [0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(bus.read_cpu(0x4017), 0);
    }

    #[test]
    fn apu_frame_irq_reaches_line_and_status_read_clears_it() {
        let mut bus = test_bus(&[]);
        bus.add_pending_cycles(30_000);
        bus.execute_pending_cycles();
        assert!(bus.lines().irq_asserted());
        assert_eq!(bus.read_cpu(0x4015) & 0x40, 0x40);
        assert!(!bus.lines().irq_asserted());
    }

    #[test]
    fn ppu_space_uses_mirrored_vram() {
        let mut bus = test_bus(&[]);
        bus.write_ppu(0x2005, 0x33);
        assert_eq!(bus.read_ppu(0x2405), 0x33);
        assert_eq!(bus.read_ppu(0x2805), 0);
        bus.write_ppu(0x0010, 0x44);
        assert_eq!(bus.read_ppu(0x0010), 0x44);
    }

    #[test]
    fn vblank_nmi_reaches_line() {
        let mut bus = test_bus(&[]);
        bus.write_cpu(0x2000, 0x80);
        let mut frames = 0;
        while !bus.lines().nmi_pending() {
            bus.add_pending_cycles(1);
            bus.execute_pending_cycles();
            frames += 1;
            assert!(frames < 2 * 29_781, "no NMI after two frames");
        }
        assert_eq!(bus.ppu().position().0, 241);
    }

    #[test]
    fn reset_clears_memory_and_lines() {
        let mut bus = test_bus(&[]);
        bus.write_cpu(0x0000, 1);
        bus.write_ppu(0x2000, 2);
        bus.lines_mut().set_nmi_line(true);
        bus.add_pending_cycles(3);
        bus.stall_cpu(10);
        bus.reset();
        assert_eq!(bus.read_cpu(0x0000), 0);
        assert_eq!(bus.read_ppu(0x2000), 0);
        assert!(!bus.lines().nmi_pending());
        assert_eq!(bus.pending_cycles(), 0);
        assert_eq!(bus.take_stall_cycles(), 0);
        assert_eq!(bus.cpu_cycles(), 0);
    }
}
