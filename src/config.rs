use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// How the frame loop interleaves the CPU with the PPU/APU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuSync {
    /// Flush the PPU and APU after every CPU unit of work.
    Cycle,
    /// Run the CPU for as long as neither the PPU nor the APU needs attention.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Emit a `trace!` disassembly line before each instruction.
    pub trace_cpu: bool,
    pub sync: CpuSync,
    pub sample_rate: u32,
    pub audio_channels: u16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            trace_cpu: false,
            sync: CpuSync::Cycle,
            sample_rate: 44_100,
            audio_channels: 1,
        }
    }
}

impl EmulatorConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("invalid emulator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            bail!("sample_rate {} is out of range 8000..=192000", self.sample_rate);
        }
        if !(1..=2).contains(&self.audio_channels) {
            bail!("audio_channels must be 1 or 2, got {}", self.audio_channels);
        }
        Ok(())
    }
}
