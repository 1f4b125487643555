/// NTSC master palette, packed 0x00RRGGBB and indexed by the 6-bit color
/// stored in palette RAM.
pub const NES_PALETTE: [u32; 64] = [
    0x666666, 0x002A88, 0x1412A7, 0x3B00A4, 0x5C007E, 0x6E0040, 0x6C0600, 0x561D00, //
    0x333500, 0x0B4800, 0x005200, 0x004F08, 0x00404D, 0x000000, 0x000000, 0x000000, //
    0xADADAD, 0x155FD9, 0x4240FF, 0x7527FE, 0xA01ACC, 0xB71E7B, 0xB53120, 0x994E00, //
    0x6B6D00, 0x388700, 0x0C9300, 0x008F32, 0x007C8D, 0x000000, 0x000000, 0x000000, //
    0xFFFEFF, 0x64B0FF, 0x9290FF, 0xC676FF, 0xF36AFF, 0xFE6ECC, 0xFE8170, 0xEA9E22, //
    0xBCBE00, 0x88D800, 0x5CE430, 0x45E082, 0x48CDDE, 0x4F4F4F, 0x000000, 0x000000, //
    0xFFFEFF, 0xC0DFFF, 0xD3D2FF, 0xE8C8FF, 0xFBC2FF, 0xFEC4EA, 0xFECCC5, 0xF7D8A5, //
    0xE4E594, 0xCFEF96, 0xBDF4AB, 0xB3F3CC, 0xB5EBF2, 0xB8B8B8, 0x000000, 0x000000, //
];

/// Maps a palette RAM address to its backing index; the sprite backdrop
/// entries 0x10/0x14/0x18/0x1C alias the background ones.
pub fn palette_ram_index(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index & 0x13 == 0x10 {
        index & 0x0F
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backdrop_entries_alias() {
        assert_eq!(palette_ram_index(0x3F10), 0x00);
        assert_eq!(palette_ram_index(0x3F14), 0x04);
        assert_eq!(palette_ram_index(0x3F1C), 0x0C);
        assert_eq!(palette_ram_index(0x3F11), 0x11);
        assert_eq!(palette_ram_index(0x3F2F), 0x0F);
    }

    #[test]
    fn grayscale_column_is_gray() {
        for entry in [0x00, 0x10, 0x20, 0x30] {
            let rgb = NES_PALETTE[entry];
            let (r, g, b) = (rgb >> 16, (rgb >> 8) & 0xFF, rgb & 0xFF);
            assert!(r.abs_diff(g) <= 1 && g.abs_diff(b) <= 1, "entry {entry:#04x}");
        }
    }
}
