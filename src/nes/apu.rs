use std::f32::consts::PI;

use crate::audio::AudioSink;

/// NTSC CPU clock, rounded to whole cycles per second.
pub const CPU_CLOCK_HZ: u32 = 1_789_773;

/// CPU cycles between two hand-offs of rendered samples to the audio sink.
pub const MIX_INTERVAL: u32 = (CPU_CLOCK_HZ + 59) / 60;

const CPU_CLOCK_EXACT_HZ: f64 = 1_789_772.727_272_727_3;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [u8; 4] = [0b0100_0000, 0b0110_0000, 0b0111_1000, 0b1001_1111];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const STEP_QUARTER_1: u32 = 7_457;
const STEP_HALF_1: u32 = 14_913;
const STEP_QUARTER_3: u32 = 22_371;
const STEP_4_IRQ: u32 = 29_829;
const STEP_4_WRAP: u32 = 29_830;
const STEP_5_HALF_2: u32 = 37_281;
const STEP_5_WRAP: u32 = 37_282;

const FOUR_STEP_EVENTS: [u32; 5] = [
    STEP_QUARTER_1,
    STEP_HALF_1,
    STEP_QUARTER_3,
    STEP_4_IRQ,
    STEP_4_WRAP,
];
const FIVE_STEP_EVENTS: [u32; 5] = [
    STEP_QUARTER_1,
    STEP_HALF_1,
    STEP_QUARTER_3,
    STEP_5_HALF_2,
    STEP_5_WRAP,
];

/// Where DMC sample bytes come from. Each fetch steals CPU cycles, so the
/// implementor is expected to stall the CPU as well as read memory.
pub trait DmcMemory {
    fn read_sample(&mut self, addr: u16) -> u8;
}

pub struct Apu {
    pulse1: Pulse,
    pulse2: Pulse,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,

    frame_counter: u32,
    five_step: bool,
    frame_irq_inhibit: bool,
    frame_irq: bool,
    pending_frame_write: Option<(u8, u8)>,

    cpu_cycle: u64,
    cycles_since_mix: u32,
    resampler: Resampler,
    samples: Vec<i16>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(44_100)
    }
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            pulse1: Pulse::new(true),
            pulse2: Pulse::new(false),
            triangle: Triangle::default(),
            noise: Noise::new(),
            dmc: Dmc::new(),
            frame_counter: 0,
            five_step: false,
            frame_irq_inhibit: false,
            frame_irq: false,
            pending_frame_write: None,
            cpu_cycle: 0,
            cycles_since_mix: 0,
            resampler: Resampler::new(sample_rate),
            samples: Vec::with_capacity(2048),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.resampler.sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.resampler.sample_rate
    }

    /// Rebuilds the resampler and output filters and drops any samples not
    /// yet handed to the sink.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.resampler = Resampler::new(sample_rate);
        self.samples.clear();
    }

    pub fn frame_irq(&self) -> bool {
        self.frame_irq
    }

    pub fn dmc_irq(&self) -> bool {
        self.dmc.irq_flag
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000..=0x4003 => self.pulse1.write(addr, value),
            0x4004..=0x4007 => self.pulse2.write(addr, value),
            0x4008..=0x400B => self.triangle.write(addr, value),
            0x400C..=0x400F => self.noise.write(addr, value),
            0x4010..=0x4013 => self.dmc.write(addr, value),
            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// $4015 read: channel activity and IRQ flags. Acknowledges the frame IRQ.
    pub fn read_status(&mut self) -> u8 {
        let status = u8::from(self.pulse1.length.active())
            | (u8::from(self.pulse2.length.active()) << 1)
            | (u8::from(self.triangle.length.active()) << 2)
            | (u8::from(self.noise.length.active()) << 3)
            | (u8::from(self.dmc.bytes_remaining > 0) << 4)
            | (u8::from(self.frame_irq) << 6)
            | (u8::from(self.dmc.irq_flag) << 7);
        self.frame_irq = false;
        status
    }

    /// Runs `cycles` CPU cycles of audio, fetching DMC bytes through `memory`
    /// and handing a block of samples to `sink` every [`MIX_INTERVAL`] cycles.
    pub fn execute(&mut self, cycles: u32, memory: &mut dyn DmcMemory, sink: &mut dyn AudioSink) {
        for _ in 0..cycles {
            self.tick(memory);
            self.cycles_since_mix += 1;
            if self.cycles_since_mix >= MIX_INTERVAL {
                self.cycles_since_mix = 0;
                self.flush_samples(sink);
            }
        }
    }

    /// CPU cycles that can elapse before the APU next changes an IRQ flag or
    /// owes the sink a block.
    pub fn max_execution_delay(&self) -> u32 {
        let events = if self.five_step {
            &FIVE_STEP_EVENTS
        } else {
            &FOUR_STEP_EVENTS
        };
        let next_step = events
            .iter()
            .find(|&&step| step > self.frame_counter)
            .map_or(1, |step| step - self.frame_counter);

        let mut delay = next_step.min(MIX_INTERVAL - self.cycles_since_mix);
        if let Some((_, wait)) = self.pending_frame_write {
            delay = delay.min(u32::from(wait));
        }
        if self.dmc.bytes_remaining > 0 {
            delay = delay.min(u32::from(self.dmc.timer_counter));
        }
        delay.max(1)
    }

    fn tick(&mut self, memory: &mut dyn DmcMemory) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);

        if let Some((value, wait)) = self.pending_frame_write {
            if wait <= 1 {
                self.pending_frame_write = None;
                self.apply_frame_counter_write(value);
            } else {
                self.pending_frame_write = Some((value, wait - 1));
            }
        }

        if self.cpu_cycle & 1 == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();

        if self.dmc.wants_byte() {
            let byte = memory.read_sample(self.dmc.current_addr);
            self.dmc.load_byte(byte);
        }
        self.dmc.clock_timer();

        self.clock_frame_counter();

        if let Some(sample) = self.resampler.push(self.mix()) {
            self.samples.push(sample);
        }
    }

    fn flush_samples(&mut self, sink: &mut dyn AudioSink) {
        let channels = usize::from(sink.channels().max(1));
        let out = sink.begin_write();
        let frames = (out.len() / channels).min(self.samples.len());
        for (frame, &sample) in out.chunks_exact_mut(channels).zip(&self.samples[..frames]) {
            frame.fill(sample);
        }
        sink.end_write(frames * channels);
        self.samples.clear();
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;
        self.pulse1.length.set_enabled(value & 0x01 != 0);
        self.pulse2.length.set_enabled(value & 0x02 != 0);
        self.triangle.length.set_enabled(value & 0x04 != 0);
        self.noise.length.set_enabled(value & 0x08 != 0);
        if value & 0x10 == 0 {
            self.dmc.bytes_remaining = 0;
        } else if self.dmc.bytes_remaining == 0 {
            self.dmc.restart();
        }
    }

    fn write_frame_counter(&mut self, value: u8) {
        if value & 0x40 != 0 {
            self.frame_irq = false;
        }
        // The sequencer reset lands 3 or 4 cycles later depending on parity.
        let wait = if self.cpu_cycle & 1 == 0 { 3 } else { 4 };
        self.pending_frame_write = Some((value, wait));
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.five_step = value & 0x80 != 0;
        self.frame_irq_inhibit = value & 0x40 != 0;
        if self.frame_irq_inhibit {
            self.frame_irq = false;
        }
        self.frame_counter = 0;
        if self.five_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter += 1;
        match (self.five_step, self.frame_counter) {
            (_, STEP_QUARTER_1 | STEP_QUARTER_3) => self.clock_quarter_frame(),
            (_, STEP_HALF_1) | (true, STEP_5_HALF_2) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
            }
            (false, STEP_4_IRQ) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
                self.raise_frame_irq();
            }
            (false, STEP_4_WRAP) => {
                self.raise_frame_irq();
                self.frame_counter = 0;
            }
            (true, STEP_5_WRAP) => self.frame_counter = 0,
            _ => {}
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.frame_irq_inhibit {
            self.frame_irq = true;
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock();
        self.pulse2.envelope.clock();
        self.triangle.clock_linear_counter();
        self.noise.envelope.clock();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.length.clock();
        self.pulse1.clock_sweep();
        self.pulse2.length.clock();
        self.pulse2.clock_sweep();
        self.triangle.length.clock();
        self.noise.length.clock();
    }

    fn mix(&self) -> f32 {
        let pulse_sum = f32::from(self.pulse1.output()) + f32::from(self.pulse2.output());
        let pulse_out = if pulse_sum > 0.0 {
            95.88 / ((8128.0 / pulse_sum) + 100.0)
        } else {
            0.0
        };

        let tnd_in = f32::from(self.triangle.output()) / 8227.0
            + f32::from(self.noise.output()) / 12241.0
            + f32::from(self.dmc.output_level) / 22638.0;
        let tnd_out = if tnd_in > 0.0 {
            159.79 / ((1.0 / tnd_in) + 100.0)
        } else {
            0.0
        };

        pulse_out + tnd_out
    }
}

/// Decimates the per-cycle mixer output to the host rate and applies the
/// console's output filter chain (two high-passes and a low-pass).
struct Resampler {
    sample_rate: u32,
    phase: f64,
    high_pass_90: HighPass,
    high_pass_440: HighPass,
    low_pass_alpha: f32,
    low_pass_out: f32,
}

impl Resampler {
    fn new(sample_rate: u32) -> Self {
        let dt = 1.0 / sample_rate.max(1) as f32;
        Self {
            sample_rate,
            phase: 0.0,
            high_pass_90: HighPass::new(90.0, dt),
            high_pass_440: HighPass::new(440.0, dt),
            low_pass_alpha: dt / (rc(14_000.0) + dt),
            low_pass_out: 0.0,
        }
    }

    fn push(&mut self, input: f32) -> Option<i16> {
        self.phase += f64::from(self.sample_rate);
        if self.phase < CPU_CLOCK_EXACT_HZ {
            return None;
        }
        self.phase -= CPU_CLOCK_EXACT_HZ;

        let sample = self.high_pass_440.apply(self.high_pass_90.apply(input));
        self.low_pass_out += self.low_pass_alpha * (sample - self.low_pass_out);
        Some((self.low_pass_out.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
    }
}

fn rc(cutoff_hz: f32) -> f32 {
    1.0 / (2.0 * PI * cutoff_hz)
}

struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, dt: f32) -> Self {
        Self {
            alpha: rc(cutoff_hz) / (rc(cutoff_hz) + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, input: f32) -> f32 {
        let out = self.alpha * (self.prev_out + input - self.prev_in);
        self.prev_in = input;
        self.prev_out = out;
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LengthCounter {
    enabled: bool,
    halted: bool,
    value: u8,
}

impl LengthCounter {
    fn load(&mut self, register: u8) {
        if self.enabled {
            self.value = LENGTH_TABLE[(register >> 3) as usize];
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.value = 0;
        }
    }

    fn clock(&mut self) {
        if !self.halted && self.value > 0 {
            self.value -= 1;
        }
    }

    fn active(&self) -> bool {
        self.value > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Envelope {
    start: bool,
    looping: bool,
    constant: bool,
    period: u8,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.looping = value & 0x20 != 0;
        self.constant = value & 0x10 != 0;
        self.period = value & 0x0F;
    }

    fn clock(&mut self) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.period;
        } else if self.divider == 0 {
            self.divider = self.period;
            if self.decay > 0 {
                self.decay -= 1;
            } else if self.looping {
                self.decay = 15;
            }
        } else {
            self.divider -= 1;
        }
    }

    fn volume(&self) -> u8 {
        if self.constant { self.period } else { self.decay }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pulse {
    ones_complement: bool,
    duty: u8,
    step: u8,
    period: u16,
    timer: u16,
    length: LengthCounter,
    envelope: Envelope,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl Pulse {
    fn new(ones_complement: bool) -> Self {
        Self {
            ones_complement,
            duty: 0,
            step: 0,
            period: 0,
            timer: 0,
            length: LengthCounter::default(),
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr & 3 {
            0 => {
                self.duty = value >> 6;
                self.length.halted = value & 0x20 != 0;
                self.envelope.write(value);
            }
            1 => {
                self.sweep_enabled = value & 0x80 != 0;
                self.sweep_period = ((value >> 4) & 0x07) + 1;
                self.sweep_negate = value & 0x08 != 0;
                self.sweep_shift = value & 0x07;
                self.sweep_reload = true;
            }
            2 => self.period = (self.period & 0x0700) | u16::from(value),
            _ => {
                self.period = (self.period & 0x00FF) | (u16::from(value & 0x07) << 8);
                self.length.load(value);
                self.step = 0;
                self.envelope.start = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.period;
            self.step = (self.step + 1) & 0x07;
        } else {
            self.timer -= 1;
        }
    }

    fn sweep_target(&self) -> u16 {
        let change = self.period >> self.sweep_shift;
        if self.sweep_negate {
            self.period
                .wrapping_sub(change + u16::from(self.ones_complement))
        } else {
            self.period + change
        }
    }

    fn clock_sweep(&mut self) {
        if self.sweep_divider == 0 && self.sweep_enabled && self.sweep_shift > 0 {
            let target = self.sweep_target();
            if target <= 0x07FF {
                self.period = target;
            }
        }
        if self.sweep_divider == 0 || self.sweep_reload {
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn output(&self) -> u8 {
        let high = DUTY_TABLE[self.duty as usize] & (0x80 >> self.step) != 0;
        if !high || !self.length.active() || self.period < 8 || self.sweep_target() > 0x07FF {
            0
        } else {
            self.envelope.volume()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Triangle {
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload: bool,
    period: u16,
    timer: u16,
    length: LengthCounter,
    step: u8,
}

impl Triangle {
    fn write(&mut self, addr: u16, value: u8) {
        match addr & 3 {
            0 => {
                self.length.halted = value & 0x80 != 0;
                self.linear_reload_value = value & 0x7F;
            }
            2 => self.period = (self.period & 0x0700) | u16::from(value),
            3 => {
                self.period = (self.period & 0x00FF) | (u16::from(value & 0x07) << 8);
                self.length.load(value);
                self.linear_reload = true;
            }
            _ => {}
        }
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        // The control flag doubles as the length-counter halt.
        if !self.length.halted {
            self.linear_reload = false;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.period;
            if self.length.active() && self.linear_counter > 0 && self.period > 1 {
                self.step = (self.step + 1) & 0x1F;
            }
        } else {
            self.timer -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.length.active() || self.linear_counter == 0 || self.period < 2 {
            0
        } else {
            TRI_TABLE[self.step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Noise {
    envelope: Envelope,
    length: LengthCounter,
    short_mode: bool,
    period: u16,
    timer: u16,
    lfsr: u16,
}

impl Noise {
    fn new() -> Self {
        Self {
            envelope: Envelope::default(),
            length: LengthCounter::default(),
            short_mode: false,
            period: NOISE_PERIOD_TABLE[0],
            timer: 0,
            lfsr: 1,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr & 3 {
            0 => {
                self.length.halted = value & 0x20 != 0;
                self.envelope.write(value);
            }
            2 => {
                self.short_mode = value & 0x80 != 0;
                self.period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
            }
            3 => {
                self.length.load(value);
                self.envelope.start = true;
            }
            _ => {}
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.period;
            let tap = if self.short_mode { 6 } else { 1 };
            let feedback = (self.lfsr ^ (self.lfsr >> tap)) & 1;
            self.lfsr = (self.lfsr >> 1) | (feedback << 14);
        } else {
            self.timer -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.length.active() || self.lfsr & 1 != 0 {
            0
        } else {
            self.envelope.volume()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Dmc {
    irq_enabled: bool,
    irq_flag: bool,
    looping: bool,
    period: u16,
    timer_counter: u16,
    output_level: u8,
    sample_addr: u16,
    sample_length: u16,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
}

impl Dmc {
    fn new() -> Self {
        Self {
            irq_enabled: false,
            irq_flag: false,
            looping: false,
            period: DMC_RATE_TABLE[0],
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0xC000,
            sample_length: 1,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr & 3 {
            0 => {
                self.irq_enabled = value & 0x80 != 0;
                if !self.irq_enabled {
                    self.irq_flag = false;
                }
                self.looping = value & 0x40 != 0;
                self.period = DMC_RATE_TABLE[(value & 0x0F) as usize];
            }
            1 => self.output_level = value & 0x7F,
            2 => self.sample_addr = 0xC000 | (u16::from(value) << 6),
            _ => self.sample_length = (u16::from(value) << 4) | 1,
        }
    }

    fn restart(&mut self) {
        self.current_addr = self.sample_addr;
        self.bytes_remaining = self.sample_length;
    }

    fn wants_byte(&self) -> bool {
        self.sample_buffer.is_none() && self.bytes_remaining > 0
    }

    fn load_byte(&mut self, byte: u8) {
        self.sample_buffer = Some(byte);
        // Sample fetches wrap from $FFFF back to $8000.
        self.current_addr = self.current_addr.checked_add(1).unwrap_or(0x8000);
        self.bytes_remaining -= 1;
        if self.bytes_remaining == 0 {
            if self.looping {
                self.restart();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter > 1 {
            self.timer_counter -= 1;
            return;
        }
        self.timer_counter = self.period;

        if !self.silence {
            if self.shift_register & 1 != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }
        self.shift_register >>= 1;

        self.bits_remaining -= 1;
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(byte) => {
                    self.shift_register = byte;
                    self.silence = false;
                }
                None => self.silence = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecAudioSink {
        channels: u16,
        scratch: Vec<i16>,
        written: Vec<i16>,
        blocks: usize,
    }

    impl VecAudioSink {
        fn new(channels: u16) -> Self {
            Self {
                channels,
                scratch: vec![0; 4096],
                ..Self::default()
            }
        }
    }

    impl AudioSink for VecAudioSink {
        fn sample_rate(&self) -> u32 {
            44_100
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn reconfigure(&mut self, _sample_rate: u32, channels: u16) {
            self.channels = channels;
        }

        fn begin_write(&mut self) -> &mut [i16] {
            &mut self.scratch
        }

        fn end_write(&mut self, count: usize) {
            self.written.extend_from_slice(&self.scratch[..count]);
            self.blocks += 1;
        }
    }

    #[derive(Default)]
    struct SampleRom {
        reads: Vec<u16>,
    }

    impl DmcMemory for SampleRom {
        fn read_sample(&mut self, addr: u16) -> u8 {
            self.reads.push(addr);
            0xAA
        }
    }

    fn run(apu: &mut Apu, cycles: u32) -> (SampleRom, VecAudioSink) {
        let mut rom = SampleRom::default();
        let mut sink = VecAudioSink::new(1);
        apu.execute(cycles, &mut rom, &mut sink);
        (rom, sink)
    }

    #[test]
    fn length_counters_show_in_status() {
        let mut apu = Apu::default();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.read_status() & 0x01, 0, "disabled channel ignores length load");

        apu.write_register(0x4015, 0x0F);
        apu.write_register(0x4003, 0x08);
        apu.write_register(0x400B, 0x08);
        apu.write_register(0x400F, 0x08);
        assert_eq!(apu.read_status() & 0x0F, 0x0D);

        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.read_status() & 0x0F, 0);
    }

    #[test]
    fn four_step_sequence_raises_frame_irq() {
        let mut apu = Apu::default();
        run(&mut apu, STEP_4_IRQ - 1);
        assert!(!apu.frame_irq());
        run(&mut apu, 1);
        assert!(apu.frame_irq());

        assert_eq!(apu.read_status() & 0x40, 0x40);
        assert!(!apu.frame_irq());
    }

    #[test]
    fn inhibit_and_five_step_mode_suppress_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x40);
        run(&mut apu, 2 * STEP_4_WRAP);
        assert!(!apu.frame_irq());

        let mut apu = Apu::default();
        apu.write_register(0x4017, 0x80);
        run(&mut apu, 2 * STEP_5_WRAP);
        assert!(!apu.frame_irq());
    }

    #[test]
    fn length_counter_decrements_on_half_frames() {
        let mut apu = Apu::default();
        apu.write_register(0x4015, 0x01);
        // Index 3 loads a length of 2.
        apu.write_register(0x4003, 3 << 3);
        run(&mut apu, STEP_HALF_1);
        assert_eq!(apu.read_status() & 0x01, 0x01);
        run(&mut apu, STEP_4_IRQ - STEP_HALF_1);
        assert_eq!(apu.read_status() & 0x01, 0);
    }

    #[test]
    fn hands_one_block_per_mix_interval() {
        let mut apu = Apu::new(44_100);
        let mut rom = SampleRom::default();
        let mut sink = VecAudioSink::new(2);
        apu.execute(MIX_INTERVAL - 1, &mut rom, &mut sink);
        assert_eq!(sink.blocks, 0);

        apu.execute(1, &mut rom, &mut sink);
        assert_eq!(sink.blocks, 1);
        let frames = sink.written.len() / 2;
        assert!((734..=736).contains(&frames), "{frames} frames");
        assert!(sink.written.chunks(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn pulse_produces_signal() {
        let mut apu = Apu::new(44_100);
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0xBF);
        apu.write_register(0x4002, 0xFD);
        apu.write_register(0x4003, 0x08);
        let (_, sink) = run(&mut apu, MIX_INTERVAL);
        assert!(sink.written.iter().any(|&s| s != 0));
    }

    #[test]
    fn dmc_fetches_sample_and_raises_irq() {
        let mut apu = Apu::default();
        apu.write_register(0x4010, 0x8F);
        apu.write_register(0x4012, 0x01);
        apu.write_register(0x4013, 0x00);
        apu.write_register(0x4015, 0x10);
        assert_eq!(apu.read_status() & 0x10, 0x10);

        let (rom, _) = run(&mut apu, 1);
        assert_eq!(rom.reads, vec![0xC040]);
        assert!(apu.dmc_irq());
        assert_eq!(apu.read_status() & 0x90, 0x80);

        apu.write_register(0x4015, 0x00);
        assert!(!apu.dmc_irq());
    }

    #[test]
    fn looping_dmc_keeps_fetching() {
        let mut apu = Apu::default();
        apu.write_register(0x4010, 0x4F);
        apu.write_register(0x4015, 0x10);
        let (rom, _) = run(&mut apu, 54 * 8 * 3);
        assert!(rom.reads.len() >= 3);
        assert!(rom.reads.iter().all(|&addr| addr == 0xC000));
        assert!(!apu.dmc_irq());
    }

    #[test]
    fn execution_delay_stops_at_next_sequencer_step() {
        let mut apu = Apu::default();
        assert_eq!(apu.max_execution_delay(), STEP_QUARTER_1);
        run(&mut apu, 100);
        assert_eq!(apu.max_execution_delay(), STEP_QUARTER_1 - 100);

        run(&mut apu, STEP_4_WRAP - 100);
        assert_eq!(apu.max_execution_delay(), STEP_QUARTER_1);
    }
}
