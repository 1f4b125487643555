use super::palette::{NES_PALETTE, palette_ram_index};

pub const FRAME_WIDTH: u32 = 256;
pub const FRAME_HEIGHT: u32 = 240;

pub const DOTS_PER_LINE: u16 = 341;
pub const LINES_PER_FRAME: u16 = 262;

const PRE_RENDER_LINE: u16 = 261;

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

const SPRITE_FLIP_V: u8 = 0x80;
const SPRITE_FLIP_H: u8 = 0x40;
const SPRITE_BEHIND_BG: u8 = 0x20;

/// The PPU's view of the rest of the machine: pattern/nametable memory,
/// the NMI input of the CPU, the mapper's scanline counter and the display.
pub trait PpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    fn set_nmi_line(&mut self, active: bool);
    fn scanline(&mut self, line: u16, rendering_enabled: bool);
    fn set_pixel(&mut self, x: u32, y: u32, rgb: u32);
    fn frame_complete(&mut self);
}

/// Loopy-style VRAM address: `yyy NN YYYYY XXXXX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VramAddr(u16);

impl VramAddr {
    pub fn new(raw: u16) -> Self {
        Self(raw & 0x7FFF)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn coarse_x(self) -> u16 {
        self.0 & 0x001F
    }

    pub fn coarse_y(self) -> u16 {
        (self.0 >> 5) & 0x001F
    }

    pub fn nametable_x(self) -> u16 {
        (self.0 >> 10) & 1
    }

    pub fn nametable_y(self) -> u16 {
        (self.0 >> 11) & 1
    }

    pub fn nametable(self) -> u16 {
        (self.0 >> 10) & 3
    }

    pub fn fine_y(self) -> u16 {
        (self.0 >> 12) & 7
    }

    fn set_coarse_x(&mut self, value: u16) {
        self.0 = (self.0 & !0x001F) | (value & 0x1F);
    }

    fn set_coarse_y(&mut self, value: u16) {
        self.0 = (self.0 & !0x03E0) | ((value & 0x1F) << 5);
    }

    fn set_nametable(&mut self, value: u16) {
        self.0 = (self.0 & !0x0C00) | ((value & 3) << 10);
    }

    fn set_fine_y(&mut self, value: u16) {
        self.0 = (self.0 & !0x7000) | ((value & 7) << 12);
    }

    fn increment_coarse_x(&mut self) {
        if self.coarse_x() == 31 {
            self.set_coarse_x(0);
            self.0 ^= 0x0400;
        } else {
            self.0 += 1;
        }
    }

    fn increment_y(&mut self) {
        if self.fine_y() < 7 {
            self.0 += 0x1000;
            return;
        }
        self.set_fine_y(0);
        match self.coarse_y() {
            29 => {
                self.set_coarse_y(0);
                self.0 ^= 0x0800;
            }
            // Coarse Y 30/31 point into attribute memory and wrap without a nametable switch.
            31 => self.set_coarse_y(0),
            y => self.set_coarse_y(y + 1),
        }
    }

    fn copy_horizontal(&mut self, from: VramAddr) {
        self.0 = (self.0 & !0x041F) | (from.0 & 0x041F);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SpriteSlot {
    y: u8,
    tile: u8,
    attributes: u8,
    x: u8,
    oam_index: u8,
    pattern_lo: u8,
    pattern_hi: u8,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    last_write: u8,

    nmi_flag: bool,
    nmi_hold: bool,
    sprite_zero_hit: bool,
    sprite_overflow: bool,

    oam_addr: u8,
    oam: [u8; 256],
    palette: [u8; 32],

    v: VramAddr,
    t: VramAddr,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,

    nametable_byte: u8,
    attribute_byte: u8,
    tile_addr: u16,
    low_tile_byte: u8,
    high_tile_byte: u8,
    tile_lo: u16,
    tile_hi: u16,
    tile_attr: u8,

    secondary: [SpriteSlot; 8],
    secondary_count: usize,
    eval_index: usize,
    sprites: [SpriteSlot; 8],
    sprite_count: usize,
    sprite_fetch_addr: u16,

    cycle: u16,
    scanline: u16,
    odd_frame: bool,
    frame_number: u64,
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
            last_write: 0,
            nmi_flag: false,
            nmi_hold: false,
            sprite_zero_hit: false,
            sprite_overflow: false,
            oam_addr: 0,
            oam: [0xFF; 256],
            palette: [0; 32],
            v: VramAddr::default(),
            t: VramAddr::default(),
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            nametable_byte: 0,
            attribute_byte: 0,
            tile_addr: 0,
            low_tile_byte: 0,
            high_tile_byte: 0,
            tile_lo: 0,
            tile_hi: 0,
            tile_attr: 0,
            secondary: [SpriteSlot::default(); 8],
            secondary_count: 0,
            eval_index: 0,
            sprites: [SpriteSlot::default(); 8],
            sprite_count: 0,
            sprite_fetch_addr: 0,
            cycle: 340,
            scanline: 240,
            odd_frame: false,
            frame_number: 0,
        }
    }

    /// Power-up state: parked on the last dot of line 240, so the first
    /// frame starts with vblank. Clears the control, mask and OAM address
    /// registers through their write paths.
    pub fn reset(&mut self, bus: &mut dyn PpuBus) {
        *self = Self::new();
        self.write_register(0x2000, 0, bus);
        self.write_register(0x2001, 0, bus);
        self.write_register(0x2003, 0, bus);
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// `(scanline, dot)` of the most recently executed dot.
    pub fn position(&self) -> (u16, u16) {
        (self.scanline, self.cycle)
    }

    pub fn odd_frame(&self) -> bool {
        self.odd_frame
    }

    pub fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    /// Dots the PPU can run before anything it does becomes visible to the
    /// CPU: one dot around vblank start, otherwise the rest of the line.
    pub fn max_execution_delay(&self) -> u32 {
        if (240..=241).contains(&self.scanline) {
            1
        } else {
            u32::from(DOTS_PER_LINE - self.cycle)
        }
    }

    pub fn read_register(&mut self, addr: u16, bus: &mut dyn PpuBus) -> u8 {
        match addr & 0x0007 {
            2 => {
                let value = (self.last_write & 0x1F)
                    | (u8::from(self.sprite_overflow) << 5)
                    | (u8::from(self.sprite_zero_hit) << 6)
                    | (u8::from(self.nmi_flag) << 7);
                self.write_toggle = false;
                self.nmi_flag = false;
                self.update_nmi_line(bus);
                value
            }
            4 => self.oam[self.oam_addr as usize],
            7 => {
                if self.data_port_blocked() {
                    return 0;
                }
                let addr = self.v.raw() & 0x3FFF;
                let value = if addr >= 0x3F00 {
                    self.read_buffer = bus.read(addr - 0x1000);
                    self.read_palette(addr)
                } else {
                    let buffered = self.read_buffer;
                    self.read_buffer = bus.read(addr);
                    buffered
                };
                self.increment_vram_addr();
                value
            }
            _ => 0,
        }
    }

    pub fn write_register(&mut self, addr: u16, value: u8, bus: &mut dyn PpuBus) {
        self.last_write = value;
        match addr & 0x0007 {
            0 => {
                self.ctrl = value;
                self.t.set_nametable(u16::from(value & 0x03));
                self.update_nmi_line(bus);
            }
            1 => self.mask = value,
            3 => self.oam_addr = value,
            4 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t.set_coarse_x(u16::from(value >> 3));
                } else {
                    self.t.set_fine_y(u16::from(value & 0x07));
                    self.t.set_coarse_y(u16::from(value >> 3));
                }
                self.write_toggle = !self.write_toggle;
            }
            6 => {
                if !self.write_toggle {
                    self.t = VramAddr::new((self.t.raw() & 0x00FF) | (u16::from(value & 0x3F) << 8));
                } else {
                    self.t = VramAddr::new((self.t.raw() & 0xFF00) | u16::from(value));
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            7 => {
                if self.data_port_blocked() {
                    return;
                }
                let addr = self.v.raw() & 0x3FFF;
                if addr >= 0x3F00 {
                    self.palette[palette_ram_index(addr)] = value;
                } else {
                    bus.write(addr, value);
                }
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    /// OAM DMA payload, stored from the current OAM address with wraparound.
    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    pub fn execute(&mut self, dots: u32, bus: &mut dyn PpuBus) {
        for _ in 0..dots {
            self.advance();
            self.step(bus);
        }
    }

    fn advance(&mut self) {
        self.cycle += 1;
        if self.cycle == DOTS_PER_LINE {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline == LINES_PER_FRAME {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn step(&mut self, bus: &mut dyn PpuBus) {
        let cycle = self.cycle;
        let line = self.scanline;
        let rendering = self.rendering_enabled();
        let visible_line = line < 240;
        let pre_render = line == PRE_RENDER_LINE;
        let fetch_line = visible_line || pre_render;
        let visible_dot = (1..=256).contains(&cycle);
        let prefetch_dot = (321..=336).contains(&cycle);

        match (line, cycle) {
            (241 | PRE_RENDER_LINE, 0) => self.nmi_flag = self.nmi_hold,
            (241 | PRE_RENDER_LINE, 2) => self.update_nmi_line(bus),
            (240, 340) => {
                self.nmi_hold = true;
                self.frame_number += 1;
                bus.frame_complete();
            }
            (260, 340) => {
                self.nmi_hold = false;
                self.sprite_zero_hit = false;
                self.sprite_overflow = false;
            }
            _ => {}
        }

        if fetch_line && cycle == 1 {
            self.sprite_count = if rendering { self.secondary_count } else { 0 };
            self.secondary_count = 0;
            self.eval_index = 0;
        }

        if visible_line && visible_dot {
            self.render_pixel(bus);
        }

        if fetch_line && cycle == 260 {
            bus.scanline(line, rendering);
        }

        if !(rendering && fetch_line) {
            return;
        }

        if visible_dot || prefetch_dot {
            let evaluate = visible_line && visible_dot;
            match cycle % 8 {
                0 => {
                    if evaluate {
                        self.evaluate_sprite();
                    }
                    self.store_tile_data();
                }
                1 => self.fetch_nametable_byte(bus),
                3 => self.fetch_attribute_byte(bus),
                4 => {
                    self.v.increment_coarse_x();
                    if evaluate {
                        self.evaluate_sprite();
                    }
                }
                5 => self.low_tile_byte = bus.read(self.tile_addr),
                7 => self.high_tile_byte = bus.read(self.tile_addr + 8),
                _ => {}
            }
        }

        match cycle {
            256 => self.v.increment_y(),
            257 => self.v.copy_horizontal(self.t),
            305 if pre_render => self.v = self.t,
            _ => {}
        }

        if (257..=320).contains(&cycle) {
            self.fetch_sprite(cycle, bus);
        }
    }

    fn data_port_blocked(&self) -> bool {
        self.rendering_enabled() && (self.scanline <= 240 || self.scanline == PRE_RENDER_LINE)
    }

    fn increment_vram_addr(&mut self) {
        let step = if (self.ctrl & CTRL_VRAM_INC_32) != 0 { 32 } else { 1 };
        self.v = VramAddr::new(self.v.raw().wrapping_add(step));
    }

    fn update_nmi_line(&mut self, bus: &mut dyn PpuBus) {
        bus.set_nmi_line(self.nmi_flag && (self.ctrl & CTRL_NMI_ENABLE) != 0);
    }

    fn read_palette(&self, addr: u16) -> u8 {
        self.palette[palette_ram_index(addr)]
    }

    fn fetch_nametable_byte(&mut self, bus: &mut dyn PpuBus) {
        self.nametable_byte = bus.read(0x2000 | (self.v.raw() & 0x0FFF));
    }

    fn fetch_attribute_byte(&mut self, bus: &mut dyn PpuBus) {
        let (tx, ty) = (self.v.coarse_x(), self.v.coarse_y());
        let addr = 0x23C0 | (self.v.nametable() << 10) | ((ty >> 2) << 3) | (tx >> 2);
        let mut attr = bus.read(addr);
        if ty & 2 != 0 {
            attr >>= 4;
        }
        if tx & 2 != 0 {
            attr >>= 2;
        }
        self.attribute_byte = attr & 0x03;

        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 { 0x1000 } else { 0 };
        self.tile_addr = table + u16::from(self.nametable_byte) * 16 + self.v.fine_y();
    }

    fn store_tile_data(&mut self) {
        self.tile_lo = (self.tile_lo << 8) | u16::from(self.low_tile_byte);
        self.tile_hi = (self.tile_hi << 8) | u16::from(self.high_tile_byte);
        self.tile_attr = ((self.tile_attr << 2) | self.attribute_byte) & 0x0F;
    }

    fn sprite_height(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 { 16 } else { 8 }
    }

    /// Checks one OAM entry against the current line for the next line's
    /// sprite set. Two entries are checked per tile fetch.
    fn evaluate_sprite(&mut self) {
        if self.eval_index >= 64 || (self.secondary_count == 8 && self.sprite_overflow) {
            return;
        }
        let index = self.eval_index;
        self.eval_index += 1;

        let base = index * 4;
        let [y, tile, attributes, x] = [
            self.oam[base],
            self.oam[base + 1],
            self.oam[base + 2],
            self.oam[base + 3],
        ];
        let row = i32::from(self.scanline) - i32::from(y);
        if !(0..i32::from(self.sprite_height())).contains(&row) {
            return;
        }

        if self.secondary_count == 8 {
            self.sprite_overflow = true;
            return;
        }
        self.secondary[self.secondary_count] = SpriteSlot {
            y,
            tile,
            attributes,
            x,
            oam_index: index as u8,
            pattern_lo: 0,
            pattern_hi: 0,
        };
        self.secondary_count += 1;
    }

    fn fetch_sprite(&mut self, cycle: u16, bus: &mut dyn PpuBus) {
        let slot = usize::from((cycle - 257) / 8);
        if slot >= self.secondary_count {
            return;
        }
        match (cycle - 257) % 8 {
            2 => {
                let sprite = self.secondary[slot];
                self.sprites[slot] = sprite;
                self.sprite_fetch_addr = self.sprite_pattern_addr(&sprite);
            }
            4 => self.sprites[slot].pattern_lo = bus.read(self.sprite_fetch_addr),
            6 => self.sprites[slot].pattern_hi = bus.read(self.sprite_fetch_addr + 8),
            _ => {}
        }
    }

    fn sprite_pattern_addr(&self, sprite: &SpriteSlot) -> u16 {
        let height = self.sprite_height();
        let tile = u16::from(sprite.tile);
        let base = if height == 16 {
            (tile & 0xFE) * 16 + (tile & 1) * 0x1000
        } else {
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 { 0x1000 } else { 0 };
            table + tile * 16
        };

        let mut row = self.scanline.wrapping_sub(u16::from(sprite.y)) & (height - 1);
        if (sprite.attributes & SPRITE_FLIP_V) != 0 {
            row ^= height - 1;
        }
        // The bottom half of a tall sprite is the next tile.
        if row >= 8 {
            row += 8;
        }
        base + row
    }

    fn background_pixel(&self, x: u16) -> u8 {
        if (self.mask & MASK_SHOW_BG) == 0 || (x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0) {
            return 0;
        }
        let bit = 0x8000u16 >> (u16::from(self.fine_x) + (x & 7));
        let pixel = u8::from(self.tile_lo & bit != 0) | (u8::from(self.tile_hi & bit != 0) << 1);
        if pixel == 0 {
            return 0;
        }
        let attr = if bit >= 0x100 {
            (self.tile_attr >> 2) & 3
        } else {
            self.tile_attr & 3
        };
        (attr << 2) | pixel
    }

    fn render_pixel(&mut self, bus: &mut dyn PpuBus) {
        let x = self.cycle - 1;
        let bg = self.background_pixel(x);

        let mut sprite_color = 0;
        let mut sprite_in_front = false;
        let sprites_shown =
            (self.mask & MASK_SHOW_SPRITES) != 0 && (x >= 8 || (self.mask & MASK_SHOW_SPRITE_LEFT) != 0);
        if sprites_shown {
            for sprite in &self.sprites[..self.sprite_count] {
                let offset = x.wrapping_sub(u16::from(sprite.x));
                if offset >= 8 {
                    continue;
                }
                let shift = if (sprite.attributes & SPRITE_FLIP_H) != 0 { offset } else { 7 - offset };
                let pixel = ((sprite.pattern_lo >> shift) & 1) | (((sprite.pattern_hi >> shift) & 1) << 1);
                if pixel == 0 {
                    continue;
                }
                if sprite.oam_index == 0 && bg != 0 && x != 255 {
                    self.sprite_zero_hit = true;
                }
                sprite_color = 0x10 | ((sprite.attributes & 0x03) << 2) | pixel;
                sprite_in_front = (sprite.attributes & SPRITE_BEHIND_BG) == 0;
                break;
            }
        }

        let color = if sprite_color != 0 && (bg == 0 || sprite_in_front) {
            sprite_color
        } else {
            bg
        };
        let mut entry = self.read_palette(0x3F00 | u16::from(color));
        entry &= if (self.mask & MASK_GRAYSCALE) != 0 { 0x30 } else { 0x3F };
        bus.set_pixel(u32::from(x), u32::from(self.scanline), NES_PALETTE[entry as usize]);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct MockPpuBus {
        pub memory: Vec<u8>,
        pub nmi_line: bool,
        pub nmi_edges: u32,
        pub scanline_calls: Vec<u16>,
        pub frames: u32,
        pub pixels: Vec<u32>,
    }

    impl MockPpuBus {
        pub fn new() -> Self {
            Self {
                memory: vec![0; 0x4000],
                nmi_line: false,
                nmi_edges: 0,
                scanline_calls: Vec::new(),
                frames: 0,
                pixels: vec![0; (FRAME_WIDTH * FRAME_HEIGHT) as usize],
            }
        }

        fn pixel(&self, x: u32, y: u32) -> u32 {
            self.pixels[(y * FRAME_WIDTH + x) as usize]
        }
    }

    impl PpuBus for MockPpuBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.memory[(addr & 0x3FFF) as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.memory[(addr & 0x3FFF) as usize] = value;
        }

        fn set_nmi_line(&mut self, active: bool) {
            if active && !self.nmi_line {
                self.nmi_edges += 1;
            }
            self.nmi_line = active;
        }

        fn scanline(&mut self, line: u16, _rendering_enabled: bool) {
            self.scanline_calls.push(line);
        }

        fn set_pixel(&mut self, x: u32, y: u32, rgb: u32) {
            self.pixels[(y * FRAME_WIDTH + x) as usize] = rgb;
        }

        fn frame_complete(&mut self) {
            self.frames += 1;
        }
    }

    fn powered_on() -> (Ppu, MockPpuBus) {
        let mut ppu = Ppu::new();
        let mut bus = MockPpuBus::new();
        ppu.reset(&mut bus);
        (ppu, bus)
    }

    fn run_to(ppu: &mut Ppu, bus: &mut MockPpuBus, line: u16, cycle: u16) {
        while ppu.position() != (line, cycle) {
            ppu.execute(1, bus);
        }
    }

    // Reset parks on the last dot of line 240; run one whole frame from there.
    fn run_frame(ppu: &mut Ppu, bus: &mut MockPpuBus) {
        ppu.execute(1, bus);
        run_to(ppu, bus, 240, 340);
    }

    fn set_addr(ppu: &mut Ppu, bus: &mut MockPpuBus, addr: u16) {
        ppu.write_register(0x2006, (addr >> 8) as u8, bus);
        ppu.write_register(0x2006, addr as u8, bus);
    }

    #[test]
    fn frames_are_341_by_262_dots() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_SPRITES, &mut bus);
        while bus.frames == 0 {
            ppu.execute(1, &mut bus);
        }

        let mut dots = 0u32;
        while bus.frames == 1 {
            ppu.execute(1, &mut bus);
            dots += 1;
        }
        assert_eq!(dots, 341 * 262);
        assert_eq!(ppu.frame_number(), 2);
        assert_eq!(ppu.position(), (240, 340));
    }

    #[test]
    fn vblank_raises_nmi_and_status_read_clears_it() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2000, CTRL_NMI_ENABLE, &mut bus);
        run_frame(&mut ppu, &mut bus);
        assert!(!bus.nmi_line);

        run_to(&mut ppu, &mut bus, 241, 1);
        assert!(!bus.nmi_line);
        run_to(&mut ppu, &mut bus, 241, 2);
        assert!(bus.nmi_line);
        assert_eq!(bus.nmi_edges, 1);

        let status = ppu.read_register(0x2002, &mut bus);
        assert_eq!(status & 0x80, 0x80);
        assert!(!bus.nmi_line);
        assert_eq!(ppu.read_register(0x2002, &mut bus) & 0x80, 0);
    }

    #[test]
    fn nmi_enable_during_vblank_raises_line() {
        let (mut ppu, mut bus) = powered_on();
        run_frame(&mut ppu, &mut bus);
        run_to(&mut ppu, &mut bus, 250, 0);
        assert!(!bus.nmi_line);
        ppu.write_register(0x2000, CTRL_NMI_ENABLE, &mut bus);
        assert!(bus.nmi_line);

        run_to(&mut ppu, &mut bus, PRE_RENDER_LINE, 2);
        assert!(!bus.nmi_line);
    }

    #[test]
    fn status_low_bits_come_from_last_write() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2003, 0xFB, &mut bus);
        assert_eq!(ppu.read_register(0x2002, &mut bus), 0x1B);
    }

    #[test]
    fn scroll_and_address_writes_share_toggle() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2005, 0x7D, &mut bus);
        assert_eq!(ppu.fine_x, 5);
        assert_eq!(ppu.t.coarse_x(), 0x0F);
        ppu.write_register(0x2005, 0x5E, &mut bus);
        assert_eq!(ppu.t.coarse_y(), 0x0B);
        assert_eq!(ppu.t.fine_y(), 6);

        ppu.write_register(0x2006, 0x3D, &mut bus);
        ppu.read_register(0x2002, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x2108);
        assert_eq!(ppu.v.raw(), 0x2108);
        assert_eq!(ppu.v.nametable(), 0);
    }

    #[test]
    fn control_write_sets_nametable_bits_of_t() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2000, 0x03, &mut bus);
        assert_eq!(ppu.t.nametable(), 3);
        assert_eq!(ppu.t.nametable_x(), 1);
        assert_eq!(ppu.t.nametable_y(), 1);
    }

    #[test]
    fn data_reads_are_buffered_except_palette() {
        let (mut ppu, mut bus) = powered_on();
        bus.memory[0x2400] = 0xAA;
        bus.memory[0x2401] = 0xBB;
        bus.memory[0x2F00] = 0x77;

        set_addr(&mut ppu, &mut bus, 0x2400);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0xAA);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0xBB);

        set_addr(&mut ppu, &mut bus, 0x3F01);
        ppu.write_register(0x2007, 0x21, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x3F01);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0x21);

        set_addr(&mut ppu, &mut bus, 0x3F00);
        ppu.read_register(0x2007, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x2000);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0x77);
    }

    #[test]
    fn increment_32_mode() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2000, CTRL_VRAM_INC_32, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x2000);
        ppu.write_register(0x2007, 1, &mut bus);
        ppu.write_register(0x2007, 2, &mut bus);
        assert_eq!(bus.memory[0x2000], 1);
        assert_eq!(bus.memory[0x2020], 2);
        assert_eq!(ppu.v.raw(), 0x2040);
    }

    #[test]
    fn sprite_backdrop_palette_aliases_background() {
        let (mut ppu, mut bus) = powered_on();
        set_addr(&mut ppu, &mut bus, 0x3F10);
        ppu.write_register(0x2007, 0x2C, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x3F00);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0x2C);

        set_addr(&mut ppu, &mut bus, 0x3F04);
        ppu.write_register(0x2007, 0x15, &mut bus);
        set_addr(&mut ppu, &mut bus, 0x3F14);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0x15);
    }

    #[test]
    fn data_port_is_blocked_while_rendering() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2001, MASK_SHOW_BG, &mut bus);
        run_to(&mut ppu, &mut bus, 10, 100);
        set_addr(&mut ppu, &mut bus, 0x2000);
        ppu.write_register(0x2007, 0x55, &mut bus);
        assert_eq!(bus.memory[0x2000], 0);
        assert_eq!(ppu.read_register(0x2007, &mut bus), 0);

        run_to(&mut ppu, &mut bus, 245, 0);
        set_addr(&mut ppu, &mut bus, 0x2000);
        ppu.write_register(0x2007, 0x55, &mut bus);
        assert_eq!(bus.memory[0x2000], 0x55);
    }

    #[test]
    fn mapper_hook_runs_once_per_rendered_line() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2001, MASK_SHOW_BG, &mut bus);
        run_to(&mut ppu, &mut bus, 240, 339);
        assert_eq!(bus.scanline_calls.len(), 241);
        assert_eq!(bus.scanline_calls[0], PRE_RENDER_LINE);
        assert_eq!(bus.scanline_calls[240], 239);
    }

    #[test]
    fn ninth_sprite_sets_overflow() {
        let (mut ppu, mut bus) = powered_on();
        for i in 0..9 {
            ppu.oam[i * 4] = 20;
            ppu.oam[i * 4 + 3] = (i * 8) as u8;
        }
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut bus);

        run_to(&mut ppu, &mut bus, 20, 340);
        assert!(ppu.sprite_overflow);
        assert_eq!(ppu.secondary_count, 8);
        assert_eq!(ppu.secondary[7].oam_index, 7);

        run_to(&mut ppu, &mut bus, 21, 1);
        assert_eq!(ppu.sprite_count, 8);
        assert_eq!(ppu.read_register(0x2002, &mut bus) & 0x20, 0x20);

        run_to(&mut ppu, &mut bus, PRE_RENDER_LINE, 0);
        assert!(!ppu.sprite_overflow);
    }

    #[test]
    fn eight_sprites_do_not_overflow() {
        let (mut ppu, mut bus) = powered_on();
        for i in 0..8 {
            ppu.oam[i * 4] = 20;
        }
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut bus);
        run_to(&mut ppu, &mut bus, 20, 340);
        assert!(!ppu.sprite_overflow);
        assert_eq!(ppu.secondary_count, 8);
    }

    #[test]
    fn tall_sprite_rows_and_vertical_flip() {
        let (mut ppu, mut bus) = powered_on();
        ppu.write_register(0x2000, CTRL_SPRITE_SIZE_16, &mut bus);
        let sprite = SpriteSlot {
            y: 10,
            tile: 0x05,
            ..SpriteSlot::default()
        };
        ppu.scanline = 10;
        assert_eq!(ppu.sprite_pattern_addr(&sprite), 0x1040);
        ppu.scanline = 19;
        assert_eq!(ppu.sprite_pattern_addr(&sprite), 0x1040 + 16 + 1);

        let flipped = SpriteSlot {
            attributes: SPRITE_FLIP_V,
            ..sprite
        };
        ppu.scanline = 10;
        assert_eq!(ppu.sprite_pattern_addr(&flipped), 0x1040 + 16 + 7);
    }

    fn draw_solid_tiles(ppu: &mut Ppu, bus: &mut MockPpuBus) {
        // Tile 0: every pixel uses color 1.
        for row in 0..8 {
            bus.memory[row] = 0xFF;
        }
        set_addr(ppu, bus, 0x3F01);
        ppu.write_register(0x2007, 0x21, bus);
        set_addr(ppu, bus, 0x3F11);
        ppu.write_register(0x2007, 0x16, bus);
        set_addr(ppu, bus, 0x0000);
    }

    #[test]
    fn renders_background_and_sprite_zero_hit() {
        let (mut ppu, mut bus) = powered_on();
        draw_solid_tiles(&mut ppu, &mut bus);
        ppu.oam[..4].copy_from_slice(&[10, 0, 0, 20]);
        ppu.write_register(0x2001, 0x1E, &mut bus);

        run_frame(&mut ppu, &mut bus);
        assert_eq!(bus.pixel(5, 5), NES_PALETTE[0x21]);
        assert_eq!(bus.pixel(21, 12), NES_PALETTE[0x16]);
        assert_eq!(bus.pixel(19, 12), NES_PALETTE[0x21]);
        assert_eq!(ppu.read_register(0x2002, &mut bus) & 0x40, 0x40);
    }

    #[test]
    fn sprite_behind_opaque_background_is_hidden() {
        let (mut ppu, mut bus) = powered_on();
        draw_solid_tiles(&mut ppu, &mut bus);
        ppu.oam[4..8].copy_from_slice(&[10, 0, SPRITE_BEHIND_BG, 20]);
        ppu.write_register(0x2001, 0x1E, &mut bus);

        run_frame(&mut ppu, &mut bus);
        assert_eq!(bus.pixel(21, 12), NES_PALETTE[0x21]);
        assert_eq!(ppu.read_register(0x2002, &mut bus) & 0x40, 0);
    }

    #[test]
    fn left_column_mask_and_grayscale() {
        let (mut ppu, mut bus) = powered_on();
        draw_solid_tiles(&mut ppu, &mut bus);
        ppu.write_register(0x2001, MASK_SHOW_BG | MASK_GRAYSCALE, &mut bus);

        run_frame(&mut ppu, &mut bus);
        assert_eq!(bus.pixel(3, 3), NES_PALETTE[0x00]);
        assert_eq!(bus.pixel(8, 3), NES_PALETTE[0x20]);
    }

    #[test]
    fn coarse_y_wraps_into_next_nametable() {
        let mut addr = VramAddr::new(0x7000 | (29 << 5));
        addr.increment_y();
        assert_eq!(addr.coarse_y(), 0);
        assert_eq!(addr.nametable_y(), 1);
        assert_eq!(addr.fine_y(), 0);

        let mut addr = VramAddr::new(0x7000 | (31 << 5));
        addr.increment_y();
        assert_eq!(addr.coarse_y(), 0);
        assert_eq!(addr.nametable_y(), 0);

        let mut addr = VramAddr::new(31);
        addr.increment_coarse_x();
        assert_eq!(addr.coarse_x(), 0);
        assert_eq!(addr.nametable_x(), 1);
    }

    #[test]
    fn max_execution_delay_tracks_line_position() {
        let (mut ppu, mut bus) = powered_on();
        assert_eq!(ppu.max_execution_delay(), 1);
        run_to(&mut ppu, &mut bus, 0, 100);
        assert_eq!(ppu.max_execution_delay(), 241);
    }
}
