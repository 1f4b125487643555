pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod disasm;
pub mod mapper;
pub mod palette;
pub mod ppu;

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::audio::AudioSink;
use crate::config::{CpuSync, EmulatorConfig};
use crate::video::DisplaySink;

use bus::Bus;
use cartridge::Cartridge;
use cpu::{Cpu, Registers};

/// A complete console: CPU, bus, and the devices hanging off it.
pub struct System {
    cpu: Cpu,
    bus: Bus,
    sync: CpuSync,
    halted: Option<String>,
}

impl System {
    pub fn new(
        cartridge: Cartridge,
        config: &EmulatorConfig,
        display: Box<dyn DisplaySink>,
        audio: Box<dyn AudioSink>,
    ) -> Self {
        let mut cpu = Cpu::new();
        cpu.set_trace(config.trace_cpu);
        let mut system = Self {
            cpu,
            bus: Bus::new(cartridge, display, audio),
            sync: config.sync,
            halted: None,
        };
        system.reset();
        system
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        self.bus.cartridge_mut().reset();
        self.bus.reset_ppu();
        self.bus.reset_apu();
        self.cpu.reset(&mut self.bus);
        self.halted = None;
        debug!(
            mapper = self.bus.cartridge().mapper_name(),
            "reset, PC=${:04X}",
            self.cpu.registers().pc
        );
    }

    /// Runs until the PPU finishes the current frame.
    pub fn frame_step(&mut self) -> Result<()> {
        self.check_halted()?;
        let frame = self.bus.ppu().frame_number();
        while self.bus.ppu().frame_number() == frame {
            let cycles = match self.sync {
                CpuSync::Cycle => 1,
                CpuSync::Batched => self.bus.max_execution_delay(),
            };
            self.run(cycles)?;
        }
        Ok(())
    }

    /// One unit of CPU work, then the devices are caught up.
    pub fn single_step(&mut self) -> Result<()> {
        self.check_halted()?;
        self.run(1)
    }

    fn run(&mut self, cycles: u32) -> Result<()> {
        let result = self.cpu.execute(&mut self.bus, cycles);
        self.bus.execute_pending_cycles();
        if let Err(err) = &result {
            warn!("CPU halted: {err:#}");
            self.halted = Some(format!("{err:#}"));
        }
        result.map(|_| ())
    }

    fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => bail!("system is halted: {reason}"),
            None => Ok(()),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Sets the pressed buttons of controller `port` (0 or 1).
    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        self.bus.set_buttons(port, buttons);
    }

    pub fn reconfigure_audio(&mut self, sample_rate: u32, channels: u16) {
        self.bus.reconfigure_audio(sample_rate, channels);
    }

    pub fn frame_number(&self) -> u64 {
        self.bus.ppu().frame_number()
    }

    pub fn registers(&self) -> Registers {
        self.cpu.registers()
    }

    pub fn cartridge(&self) -> &Cartridge {
        self.bus.cartridge()
    }

    pub fn cartridge_mut(&mut self) -> &mut Cartridge {
        self.bus.cartridge_mut()
    }
}
