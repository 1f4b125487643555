pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

/// Standard joypad: an 8-bit parallel-in, serial-out shift register.
#[derive(Debug, Clone, Default)]
pub struct Controller {
    buttons: u8,
    shift_register: u8,
    strobe: bool,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    pub fn set_buttons(&mut self, buttons: u8) {
        self.buttons = buttons;
    }

    pub fn set_button(&mut self, button: u8, pressed: bool) {
        if pressed {
            self.buttons |= button;
        } else {
            self.buttons &= !button;
        }
    }

    pub fn write_strobe(&mut self, active: bool) {
        // Falling edge latches the buttons; holding the strobe keeps reloading.
        if active || self.strobe {
            self.shift_register = self.buttons;
        }
        self.strobe = active;
    }

    pub fn read_data(&mut self) -> u8 {
        let value = self.shift_register & 0x01;
        if self.strobe {
            self.shift_register = self.buttons;
        } else {
            self.shift_register = (self.shift_register >> 1) | 0x80;
        }
        value
    }

    pub fn reset(&mut self) {
        self.shift_register = 0;
        self.strobe = false;
    }
}
