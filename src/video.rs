use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};

/// Receives the PPU's pixel stream. `resize_framebuffer` is called once before
/// the first pixel; `display_framebuffer` marks the end of each frame.
pub trait DisplaySink {
    fn resize_framebuffer(&mut self, width: u32, height: u32);

    /// `rgb` is packed as 0x00RRGGBB.
    fn set_pixel(&mut self, x: u32, y: u32, rgb: u32);

    fn display_framebuffer(&mut self);
}

#[derive(Debug, Default)]
struct PresentedFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    frames_presented: u64,
}

/// Double-buffered RGBA8 sink. Pixels land in a private back buffer; each
/// `display_framebuffer` copies it to the front buffer shared with
/// [`FrameHandle`]s.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    back: Vec<u8>,
    front: Arc<Mutex<PresentedFrame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> FrameHandle {
        FrameHandle {
            front: Arc::clone(&self.front),
        }
    }
}

impl DisplaySink for FrameBuffer {
    fn resize_framebuffer(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.back = vec![0; (width * height * 4) as usize];
        if let Ok(mut front) = self.front.lock() {
            front.width = width;
            front.height = height;
            front.pixels = self.back.clone();
        }
    }

    fn set_pixel(&mut self, x: u32, y: u32, rgb: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = ((y * self.width + x) * 4) as usize;
        self.back[i] = (rgb >> 16) as u8;
        self.back[i + 1] = (rgb >> 8) as u8;
        self.back[i + 2] = rgb as u8;
        self.back[i + 3] = 0xFF;
    }

    fn display_framebuffer(&mut self) {
        if let Ok(mut front) = self.front.lock() {
            front.pixels.copy_from_slice(&self.back);
            front.frames_presented += 1;
        }
    }
}

/// Read side of a [`FrameBuffer`]; cheap to clone and safe to hand to another thread.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    front: Arc<Mutex<PresentedFrame>>,
}

impl FrameHandle {
    pub fn size(&self) -> (u32, u32) {
        self.front
            .lock()
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0))
    }

    pub fn frames_presented(&self) -> u64 {
        self.front.lock().map(|f| f.frames_presented).unwrap_or(0)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        let front = self.front.lock().ok()?;
        if x >= front.width || y >= front.height {
            return None;
        }
        let i = ((y * front.width + x) * 4) as usize;
        let p = &front.pixels[i..i + 4];
        Some(((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32)
    }

    pub fn pixels(&self) -> Vec<u8> {
        self.front
            .lock()
            .map(|f| f.pixels.clone())
            .unwrap_or_default()
    }

    pub fn sha1_hex(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.pixels());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
