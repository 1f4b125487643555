use anyhow::{Result, bail};
use tracing::trace;

use super::bus::Bus;
use super::disasm;

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

/// `tracing` target of the per-instruction log.
pub const TRACE_TARGET: &str = "cathode8::cpu";

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub s: u8,
    pub pc: u16,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            s: 0xFD,
            pc: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
}

impl AddrMode {
    /// Operand bytes following the opcode.
    pub fn operand_len(self) -> u16 {
        match self {
            AddrMode::Implied | AddrMode::Accumulator => 0,
            AddrMode::Absolute
            | AddrMode::AbsoluteX
            | AddrMode::AbsoluteY
            | AddrMode::Indirect => 2,
            _ => 1,
        }
    }

    // Modes whose index add can carry into the high byte.
    fn page_indexed(self) -> bool {
        matches!(
            self,
            AddrMode::AbsoluteX | AddrMode::AbsoluteY | AddrMode::IndirectY
        )
    }
}

#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    Lax, Sax, Dcp, Isb, Slo, Rla, Sre, Rra,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Modify,
    Branch,
    Implied,
    Control,
}

impl Op {
    fn access(self, mode: AddrMode) -> Access {
        use Op::*;
        match self {
            Bcc | Bcs | Beq | Bmi | Bne | Bpl | Bvc | Bvs => Access::Branch,
            Brk | Jmp | Jsr | Rti | Rts | Pha | Php | Pla | Plp => Access::Control,
            Sta | Stx | Sty | Sax => Access::Write,
            Asl | Lsr | Rol | Ror | Inc | Dec | Dcp | Isb | Slo | Rla | Sre | Rra => {
                Access::Modify
            }
            _ if mode == AddrMode::Implied => Access::Implied,
            _ => Access::Read,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub mnemonic: &'static str,
    pub mode: AddrMode,
    pub op: Op,
    pub unofficial: bool,
}

impl Opcode {
    const UNKNOWN: Opcode = Opcode {
        mnemonic: "???",
        mode: AddrMode::Implied,
        op: Op::Unknown,
        unofficial: true,
    };

    const fn new(mnemonic: &'static str, mode: AddrMode, op: Op) -> Self {
        Self {
            mnemonic,
            mode,
            op,
            unofficial: false,
        }
    }

    const fn unofficial(mnemonic: &'static str, mode: AddrMode, op: Op) -> Self {
        Self {
            mnemonic,
            mode,
            op,
            unofficial: true,
        }
    }
}

pub static OPCODES: [Opcode; 256] = build_opcode_table();

const fn build_opcode_table() -> [Opcode; 256] {
    use AddrMode::*;
    use Op::*;

    // Indexed by bits 2-4 of the opcode for the `aaabbbc1` groups.
    const GROUP_MODES: [AddrMode; 8] = [
        IndirectX, ZeroPage, Immediate, Absolute, IndirectY, ZeroPageX, AbsoluteY, AbsoluteX,
    ];
    const ALU: [(&str, Op); 8] = [
        ("ORA", Ora),
        ("AND", And),
        ("EOR", Eor),
        ("ADC", Adc),
        ("STA", Sta),
        ("LDA", Lda),
        ("CMP", Cmp),
        ("SBC", Sbc),
    ];
    const COMBINED_RMW: [(u8, &str, Op); 6] = [
        (0, "SLO", Slo),
        (1, "RLA", Rla),
        (2, "SRE", Sre),
        (3, "RRA", Rra),
        (6, "DCP", Dcp),
        (7, "ISB", Isb),
    ];

    let mut t = [Opcode::UNKNOWN; 256];

    let mut aaa: usize = 0;
    while aaa < 8 {
        let mut bbb: usize = 0;
        while bbb < 8 {
            let code = (aaa << 5) | (bbb << 2) | 0x01;
            let (name, op) = ALU[aaa];
            // STA has no immediate form.
            if !(matches!(op, Sta) && bbb == 2) {
                t[code] = Opcode::new(name, GROUP_MODES[bbb], op);
            }
            bbb += 1;
        }
        aaa += 1;
    }

    let mut i = 0;
    while i < COMBINED_RMW.len() {
        let (aaa, name, op) = COMBINED_RMW[i];
        let mut bbb: usize = 0;
        while bbb < 8 {
            if bbb != 2 {
                let code = ((aaa as usize) << 5) | (bbb << 2) | 0x03;
                t[code] = Opcode::unofficial(name, GROUP_MODES[bbb], op);
            }
            bbb += 1;
        }
        i += 1;
    }

    t[0x83] = Opcode::unofficial("SAX", IndirectX, Sax);
    t[0x87] = Opcode::unofficial("SAX", ZeroPage, Sax);
    t[0x8F] = Opcode::unofficial("SAX", Absolute, Sax);
    t[0x97] = Opcode::unofficial("SAX", ZeroPageY, Sax);
    t[0xA3] = Opcode::unofficial("LAX", IndirectX, Lax);
    t[0xA7] = Opcode::unofficial("LAX", ZeroPage, Lax);
    t[0xAF] = Opcode::unofficial("LAX", Absolute, Lax);
    t[0xB3] = Opcode::unofficial("LAX", IndirectY, Lax);
    t[0xB7] = Opcode::unofficial("LAX", ZeroPageY, Lax);
    t[0xBF] = Opcode::unofficial("LAX", AbsoluteY, Lax);
    t[0xEB] = Opcode::unofficial("SBC", Immediate, Sbc);

    t[0x0A] = Opcode::new("ASL", Accumulator, Asl);
    t[0x06] = Opcode::new("ASL", ZeroPage, Asl);
    t[0x16] = Opcode::new("ASL", ZeroPageX, Asl);
    t[0x0E] = Opcode::new("ASL", Absolute, Asl);
    t[0x1E] = Opcode::new("ASL", AbsoluteX, Asl);
    t[0x2A] = Opcode::new("ROL", Accumulator, Rol);
    t[0x26] = Opcode::new("ROL", ZeroPage, Rol);
    t[0x36] = Opcode::new("ROL", ZeroPageX, Rol);
    t[0x2E] = Opcode::new("ROL", Absolute, Rol);
    t[0x3E] = Opcode::new("ROL", AbsoluteX, Rol);
    t[0x4A] = Opcode::new("LSR", Accumulator, Lsr);
    t[0x46] = Opcode::new("LSR", ZeroPage, Lsr);
    t[0x56] = Opcode::new("LSR", ZeroPageX, Lsr);
    t[0x4E] = Opcode::new("LSR", Absolute, Lsr);
    t[0x5E] = Opcode::new("LSR", AbsoluteX, Lsr);
    t[0x6A] = Opcode::new("ROR", Accumulator, Ror);
    t[0x66] = Opcode::new("ROR", ZeroPage, Ror);
    t[0x76] = Opcode::new("ROR", ZeroPageX, Ror);
    t[0x6E] = Opcode::new("ROR", Absolute, Ror);
    t[0x7E] = Opcode::new("ROR", AbsoluteX, Ror);
    t[0xC6] = Opcode::new("DEC", ZeroPage, Dec);
    t[0xD6] = Opcode::new("DEC", ZeroPageX, Dec);
    t[0xCE] = Opcode::new("DEC", Absolute, Dec);
    t[0xDE] = Opcode::new("DEC", AbsoluteX, Dec);
    t[0xE6] = Opcode::new("INC", ZeroPage, Inc);
    t[0xF6] = Opcode::new("INC", ZeroPageX, Inc);
    t[0xEE] = Opcode::new("INC", Absolute, Inc);
    t[0xFE] = Opcode::new("INC", AbsoluteX, Inc);

    t[0x86] = Opcode::new("STX", ZeroPage, Stx);
    t[0x96] = Opcode::new("STX", ZeroPageY, Stx);
    t[0x8E] = Opcode::new("STX", Absolute, Stx);
    t[0x84] = Opcode::new("STY", ZeroPage, Sty);
    t[0x94] = Opcode::new("STY", ZeroPageX, Sty);
    t[0x8C] = Opcode::new("STY", Absolute, Sty);
    t[0xA2] = Opcode::new("LDX", Immediate, Ldx);
    t[0xA6] = Opcode::new("LDX", ZeroPage, Ldx);
    t[0xB6] = Opcode::new("LDX", ZeroPageY, Ldx);
    t[0xAE] = Opcode::new("LDX", Absolute, Ldx);
    t[0xBE] = Opcode::new("LDX", AbsoluteY, Ldx);
    t[0xA0] = Opcode::new("LDY", Immediate, Ldy);
    t[0xA4] = Opcode::new("LDY", ZeroPage, Ldy);
    t[0xB4] = Opcode::new("LDY", ZeroPageX, Ldy);
    t[0xAC] = Opcode::new("LDY", Absolute, Ldy);
    t[0xBC] = Opcode::new("LDY", AbsoluteX, Ldy);
    t[0xE0] = Opcode::new("CPX", Immediate, Cpx);
    t[0xE4] = Opcode::new("CPX", ZeroPage, Cpx);
    t[0xEC] = Opcode::new("CPX", Absolute, Cpx);
    t[0xC0] = Opcode::new("CPY", Immediate, Cpy);
    t[0xC4] = Opcode::new("CPY", ZeroPage, Cpy);
    t[0xCC] = Opcode::new("CPY", Absolute, Cpy);
    t[0x24] = Opcode::new("BIT", ZeroPage, Bit);
    t[0x2C] = Opcode::new("BIT", Absolute, Bit);

    t[0x10] = Opcode::new("BPL", Relative, Bpl);
    t[0x30] = Opcode::new("BMI", Relative, Bmi);
    t[0x50] = Opcode::new("BVC", Relative, Bvc);
    t[0x70] = Opcode::new("BVS", Relative, Bvs);
    t[0x90] = Opcode::new("BCC", Relative, Bcc);
    t[0xB0] = Opcode::new("BCS", Relative, Bcs);
    t[0xD0] = Opcode::new("BNE", Relative, Bne);
    t[0xF0] = Opcode::new("BEQ", Relative, Beq);

    t[0x00] = Opcode::new("BRK", Implied, Brk);
    t[0x20] = Opcode::new("JSR", Absolute, Jsr);
    t[0x40] = Opcode::new("RTI", Implied, Rti);
    t[0x60] = Opcode::new("RTS", Implied, Rts);
    t[0x4C] = Opcode::new("JMP", Absolute, Jmp);
    t[0x6C] = Opcode::new("JMP", Indirect, Jmp);
    t[0x08] = Opcode::new("PHP", Implied, Php);
    t[0x28] = Opcode::new("PLP", Implied, Plp);
    t[0x48] = Opcode::new("PHA", Implied, Pha);
    t[0x68] = Opcode::new("PLA", Implied, Pla);

    t[0x18] = Opcode::new("CLC", Implied, Clc);
    t[0x38] = Opcode::new("SEC", Implied, Sec);
    t[0x58] = Opcode::new("CLI", Implied, Cli);
    t[0x78] = Opcode::new("SEI", Implied, Sei);
    t[0xB8] = Opcode::new("CLV", Implied, Clv);
    t[0xD8] = Opcode::new("CLD", Implied, Cld);
    t[0xF8] = Opcode::new("SED", Implied, Sed);
    t[0x88] = Opcode::new("DEY", Implied, Dey);
    t[0xCA] = Opcode::new("DEX", Implied, Dex);
    t[0xC8] = Opcode::new("INY", Implied, Iny);
    t[0xE8] = Opcode::new("INX", Implied, Inx);
    t[0x8A] = Opcode::new("TXA", Implied, Txa);
    t[0x98] = Opcode::new("TYA", Implied, Tya);
    t[0x9A] = Opcode::new("TXS", Implied, Txs);
    t[0xA8] = Opcode::new("TAY", Implied, Tay);
    t[0xAA] = Opcode::new("TAX", Implied, Tax);
    t[0xBA] = Opcode::new("TSX", Implied, Tsx);
    t[0xEA] = Opcode::new("NOP", Implied, Nop);

    let implied_nops: [usize; 6] = [0x1A, 0x3A, 0x5A, 0x7A, 0xDA, 0xFA];
    let mut i = 0;
    while i < implied_nops.len() {
        t[implied_nops[i]] = Opcode::unofficial("NOP", Implied, Nop);
        i += 1;
    }
    let immediate_nops: [usize; 5] = [0x80, 0x82, 0x89, 0xC2, 0xE2];
    let mut i = 0;
    while i < immediate_nops.len() {
        t[immediate_nops[i]] = Opcode::unofficial("NOP", Immediate, Nop);
        i += 1;
    }
    let indexed_nops: [usize; 6] = [0x14, 0x34, 0x54, 0x74, 0xD4, 0xF4];
    let mut i = 0;
    while i < indexed_nops.len() {
        t[indexed_nops[i]] = Opcode::unofficial("NOP", ZeroPageX, Nop);
        t[indexed_nops[i] + 8] = Opcode::unofficial("NOP", AbsoluteX, Nop);
        i += 1;
    }
    t[0x04] = Opcode::unofficial("NOP", ZeroPage, Nop);
    t[0x44] = Opcode::unofficial("NOP", ZeroPage, Nop);
    t[0x64] = Opcode::unofficial("NOP", ZeroPage, Nop);
    t[0x0C] = Opcode::unofficial("NOP", Absolute, Nop);

    t
}

pub struct Cpu {
    regs: Registers,
    trace: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            trace: false,
        }
    }

    pub fn registers(&self) -> Registers {
        self.regs
    }

    pub fn set_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    /// Restores the power-on register pattern and loads PC from the reset
    /// vector without charging cycles.
    pub fn reset(&mut self, bus: &mut Bus) {
        self.regs.a = 0;
        self.regs.x = 0;
        self.regs.y = 0;
        self.regs.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.regs.s = 0xFD;
        let lo = bus.read_cpu(RESET_VECTOR);
        let hi = bus.read_cpu(RESET_VECTOR + 1);
        self.regs.pc = u16::from_le_bytes([lo, hi]);
    }

    /// Runs whole units of work until at least `cycles` CPU cycles have been
    /// charged; returns the cycles actually consumed.
    pub fn execute(&mut self, bus: &mut Bus, cycles: u32) -> Result<u32> {
        let start = bus.cpu_cycles();
        while bus.cpu_cycles().wrapping_sub(start) < cycles {
            self.step(bus)?;
        }
        Ok(bus.cpu_cycles().wrapping_sub(start))
    }

    /// One unit of work: a DMA stall batch, an interrupt entry, or an instruction.
    pub fn step(&mut self, bus: &mut Bus) -> Result<()> {
        let stall = bus.take_stall_cycles();
        if stall > 0 {
            bus.add_pending_cycles(stall);
            return Ok(());
        }
        if bus.lines().nmi_pending() {
            bus.lines_mut().clear_nmi();
            self.interrupt(bus, NMI_VECTOR);
            return Ok(());
        }
        if bus.lines().irq_asserted() && !self.flag(FLAG_INTERRUPT) {
            self.interrupt(bus, IRQ_VECTOR);
            return Ok(());
        }
        self.instruction(bus)
    }

    fn interrupt(&mut self, bus: &mut Bus, vector: u16) {
        self.idle(bus);
        self.idle(bus);
        self.push_word(bus, self.regs.pc);
        self.push(bus, (self.regs.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.regs.pc = self.read_word(bus, vector);
    }

    fn instruction(&mut self, bus: &mut Bus) -> Result<()> {
        if self.trace {
            let line = disasm::trace_line(
                &disasm::disassemble(|addr| bus.peek_cpu(addr), self.regs.pc),
                &self.regs,
                bus.ppu().position(),
                bus.cpu_cycles(),
            );
            trace!(target: TRACE_TARGET, "{line}");
        }

        let pc = self.regs.pc;
        let opcode = self.fetch(bus);
        let entry = &OPCODES[opcode as usize];
        let (op, mode) = (entry.op, entry.mode);

        if op == Op::Unknown {
            self.regs.pc = pc;
            let listing = disasm::listing(|addr| bus.peek_cpu(addr), pc, 4)
                .iter()
                .map(|instr| instr.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            bail!("unknown opcode ${opcode:02X} at ${pc:04X}\n{listing}");
        }

        match op.access(mode) {
            Access::Read => {
                let (addr, crossed) = self.operand_address(bus, mode);
                if crossed {
                    self.idle(bus);
                }
                let value = self.read(bus, addr);
                self.execute_read(op, value);
            }
            Access::Write => {
                let (addr, _) = self.operand_address(bus, mode);
                if mode.page_indexed() {
                    self.idle(bus);
                }
                let value = match op {
                    Op::Stx => self.regs.x,
                    Op::Sty => self.regs.y,
                    Op::Sax => self.regs.a & self.regs.x,
                    _ => self.regs.a,
                };
                self.write(bus, addr, value);
            }
            Access::Modify if mode == AddrMode::Accumulator => {
                self.idle(bus);
                self.regs.a = self.execute_modify(op, self.regs.a);
            }
            Access::Modify => {
                let (addr, _) = self.operand_address(bus, mode);
                if mode.page_indexed() {
                    self.idle(bus);
                }
                let value = self.read(bus, addr);
                self.idle(bus);
                let result = self.execute_modify(op, value);
                self.write(bus, addr, result);
            }
            Access::Branch => {
                let taken = match op {
                    Op::Bpl => !self.flag(FLAG_NEGATIVE),
                    Op::Bmi => self.flag(FLAG_NEGATIVE),
                    Op::Bvc => !self.flag(FLAG_OVERFLOW),
                    Op::Bvs => self.flag(FLAG_OVERFLOW),
                    Op::Bcc => !self.flag(FLAG_CARRY),
                    Op::Bcs => self.flag(FLAG_CARRY),
                    Op::Bne => !self.flag(FLAG_ZERO),
                    _ => self.flag(FLAG_ZERO),
                };
                self.branch(bus, taken);
            }
            Access::Implied => {
                self.idle(bus);
                self.execute_implied(op);
            }
            Access::Control => self.execute_control(bus, op, mode),
        }
        Ok(())
    }

    /// Resolves the effective address, charging the operand fetches and the
    /// fixed index cycle of zero-page indexing. Reports whether an index add
    /// crossed a page; the caller decides what that costs.
    fn operand_address(&mut self, bus: &mut Bus, mode: AddrMode) -> (u16, bool) {
        match mode {
            AddrMode::Immediate => {
                let addr = self.regs.pc;
                self.regs.pc = self.regs.pc.wrapping_add(1);
                (addr, false)
            }
            AddrMode::ZeroPage => (u16::from(self.fetch(bus)), false),
            AddrMode::ZeroPageX | AddrMode::ZeroPageY => {
                let base = self.fetch(bus);
                self.idle(bus);
                let index = if mode == AddrMode::ZeroPageX {
                    self.regs.x
                } else {
                    self.regs.y
                };
                (u16::from(base.wrapping_add(index)), false)
            }
            AddrMode::Absolute => (self.fetch_word(bus), false),
            AddrMode::AbsoluteX | AddrMode::AbsoluteY => {
                let base = self.fetch_word(bus);
                let index = if mode == AddrMode::AbsoluteX {
                    self.regs.x
                } else {
                    self.regs.y
                };
                let addr = base.wrapping_add(u16::from(index));
                (addr, crosses_page(base, addr))
            }
            AddrMode::Indirect => {
                let ptr = self.fetch_word(bus);
                // The high byte is fetched without carrying into the pointer's page.
                let lo = self.read(bus, ptr);
                let hi = self.read(bus, (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF));
                (u16::from_le_bytes([lo, hi]), false)
            }
            AddrMode::IndirectX => {
                let zp = self.fetch(bus);
                self.idle(bus);
                (self.read_zero_page_word(bus, zp.wrapping_add(self.regs.x)), false)
            }
            AddrMode::IndirectY => {
                let zp = self.fetch(bus);
                let base = self.read_zero_page_word(bus, zp);
                let addr = base.wrapping_add(u16::from(self.regs.y));
                (addr, crosses_page(base, addr))
            }
            AddrMode::Implied | AddrMode::Accumulator | AddrMode::Relative => (0, false),
        }
    }

    fn execute_read(&mut self, op: Op, value: u8) {
        match op {
            Op::Lda => self.load_a(value),
            Op::Ldx => {
                self.regs.x = value;
                self.update_zn(value);
            }
            Op::Ldy => {
                self.regs.y = value;
                self.update_zn(value);
            }
            Op::Lax => {
                self.regs.x = value;
                self.load_a(value);
            }
            Op::Ora => self.load_a(self.regs.a | value),
            Op::And => self.load_a(self.regs.a & value),
            Op::Eor => self.load_a(self.regs.a ^ value),
            Op::Adc => self.adc(value),
            Op::Sbc => self.adc(!value),
            Op::Cmp => self.compare(self.regs.a, value),
            Op::Cpx => self.compare(self.regs.x, value),
            Op::Cpy => self.compare(self.regs.y, value),
            Op::Bit => {
                self.set_flag(FLAG_ZERO, self.regs.a & value == 0);
                self.set_flag(FLAG_OVERFLOW, value & 0x40 != 0);
                self.set_flag(FLAG_NEGATIVE, value & 0x80 != 0);
            }
            _ => {}
        }
    }

    fn execute_modify(&mut self, op: Op, value: u8) -> u8 {
        match op {
            Op::Asl => self.asl(value),
            Op::Lsr => self.lsr(value),
            Op::Rol => self.rol(value),
            Op::Ror => self.ror(value),
            Op::Inc => {
                let result = value.wrapping_add(1);
                self.update_zn(result);
                result
            }
            Op::Dec => {
                let result = value.wrapping_sub(1);
                self.update_zn(result);
                result
            }
            Op::Slo => {
                let result = self.asl(value);
                self.load_a(self.regs.a | result);
                result
            }
            Op::Rla => {
                let result = self.rol(value);
                self.load_a(self.regs.a & result);
                result
            }
            Op::Sre => {
                let result = self.lsr(value);
                self.load_a(self.regs.a ^ result);
                result
            }
            Op::Rra => {
                let result = self.ror(value);
                self.adc(result);
                result
            }
            Op::Dcp => {
                let result = value.wrapping_sub(1);
                self.compare(self.regs.a, result);
                result
            }
            Op::Isb => {
                let result = value.wrapping_add(1);
                self.adc(!result);
                result
            }
            _ => value,
        }
    }

    fn execute_implied(&mut self, op: Op) {
        match op {
            Op::Clc => self.set_flag(FLAG_CARRY, false),
            Op::Sec => self.set_flag(FLAG_CARRY, true),
            Op::Cli => self.set_flag(FLAG_INTERRUPT, false),
            Op::Sei => self.set_flag(FLAG_INTERRUPT, true),
            Op::Clv => self.set_flag(FLAG_OVERFLOW, false),
            Op::Cld => self.set_flag(FLAG_DECIMAL, false),
            Op::Sed => self.set_flag(FLAG_DECIMAL, true),
            Op::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.update_zn(self.regs.x);
            }
            Op::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.update_zn(self.regs.y);
            }
            Op::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.update_zn(self.regs.x);
            }
            Op::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.update_zn(self.regs.y);
            }
            Op::Tax => {
                self.regs.x = self.regs.a;
                self.update_zn(self.regs.x);
            }
            Op::Tay => {
                self.regs.y = self.regs.a;
                self.update_zn(self.regs.y);
            }
            Op::Tsx => {
                self.regs.x = self.regs.s;
                self.update_zn(self.regs.x);
            }
            Op::Txa => self.load_a(self.regs.x),
            Op::Tya => self.load_a(self.regs.y),
            Op::Txs => self.regs.s = self.regs.x,
            _ => {}
        }
    }

    fn execute_control(&mut self, bus: &mut Bus, op: Op, mode: AddrMode) {
        match op {
            Op::Jmp => self.regs.pc = self.operand_address(bus, mode).0,
            Op::Jsr => {
                let target = self.fetch_word(bus);
                self.idle(bus);
                self.push_word(bus, self.regs.pc.wrapping_sub(1));
                self.regs.pc = target;
            }
            Op::Rts => {
                self.idle(bus);
                self.idle(bus);
                self.regs.pc = self.pull_word(bus);
                self.idle(bus);
                self.regs.pc = self.regs.pc.wrapping_add(1);
            }
            Op::Rti => {
                self.idle(bus);
                self.idle(bus);
                let p = self.pull(bus);
                self.regs.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
                self.regs.pc = self.pull_word(bus);
            }
            Op::Pha => {
                self.idle(bus);
                self.push(bus, self.regs.a);
            }
            Op::Php => {
                self.idle(bus);
                self.push(bus, self.regs.p | FLAG_BREAK | FLAG_UNUSED);
            }
            Op::Pla => {
                self.idle(bus);
                self.idle(bus);
                let value = self.pull(bus);
                self.load_a(value);
            }
            Op::Plp => {
                self.idle(bus);
                self.idle(bus);
                let p = self.pull(bus);
                self.regs.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
            }
            Op::Brk => {
                // Padding byte.
                self.fetch(bus);
                self.push_word(bus, self.regs.pc);
                self.push(bus, self.regs.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                // An NMI raised during the pushes hijacks the vector fetch.
                bus.execute_pending_cycles();
                let vector = if bus.lines().nmi_pending() {
                    bus.lines_mut().clear_nmi();
                    NMI_VECTOR
                } else {
                    IRQ_VECTOR
                };
                self.regs.pc = self.read_word(bus, vector);
            }
            _ => {}
        }
    }

    fn branch(&mut self, bus: &mut Bus, taken: bool) {
        let offset = self.fetch(bus) as i8;
        if !taken {
            return;
        }
        self.idle(bus);
        let target = self.regs.pc.wrapping_add_signed(i16::from(offset));
        if crosses_page(self.regs.pc, target) {
            self.idle(bus);
        }
        self.regs.pc = target;
    }

    fn read(&mut self, bus: &mut Bus, addr: u16) -> u8 {
        let value = bus.read_cpu(addr);
        bus.add_pending_cycles(1);
        value
    }

    fn write(&mut self, bus: &mut Bus, addr: u16, value: u8) {
        bus.add_pending_cycles(1);
        bus.write_cpu(addr, value);
    }

    fn idle(&mut self, bus: &mut Bus) {
        bus.add_pending_cycles(1);
    }

    fn fetch(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read(bus, self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn read_word(&mut self, bus: &mut Bus, addr: u16) -> u16 {
        let lo = self.read(bus, addr);
        let hi = self.read(bus, addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn read_zero_page_word(&mut self, bus: &mut Bus, zp: u8) -> u16 {
        let lo = self.read(bus, u16::from(zp));
        let hi = self.read(bus, u16::from(zp.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }

    fn push(&mut self, bus: &mut Bus, value: u8) {
        self.write(bus, 0x0100 | u16::from(self.regs.s), value);
        self.regs.s = self.regs.s.wrapping_sub(1);
    }

    fn push_word(&mut self, bus: &mut Bus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pull(&mut self, bus: &mut Bus) -> u8 {
        self.regs.s = self.regs.s.wrapping_add(1);
        self.read(bus, 0x0100 | u16::from(self.regs.s))
    }

    fn pull_word(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.pull(bus);
        let hi = self.pull(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn flag(&self, flag: u8) -> bool {
        self.regs.p & flag != 0
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.regs.p |= flag;
        } else {
            self.regs.p &= !flag;
        }
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, value & 0x80 != 0);
    }

    fn load_a(&mut self, value: u8) {
        self.regs.a = value;
        self.update_zn(value);
    }

    // Binary only; the decimal flag has no effect on this CPU.
    fn adc(&mut self, value: u8) {
        let a = self.regs.a;
        let sum = u16::from(a) + u16::from(value) + u16::from(self.flag(FLAG_CARRY));
        let result = sum as u8;
        self.set_flag(FLAG_CARRY, sum > 0xFF);
        self.set_flag(FLAG_OVERFLOW, (!(a ^ value) & (a ^ result) & 0x80) != 0);
        self.load_a(result);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, value & 0x80 != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, value & 0x01 != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, value & 0x80 != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.flag(FLAG_CARRY)) << 7;
        self.set_flag(FLAG_CARRY, value & 0x01 != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

fn crosses_page(a: u16, b: u16) -> bool {
    (a & 0xFF00) != (b & 0xFF00)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::bus::tests::{IRQ_HANDLER, NMI_HANDLER, test_bus};
    use crate::nes::bus::{IrqSource, OAM_DMA_STALL_CYCLES};

    fn boot(program: &[u8]) -> (Cpu, Bus) {
        let mut bus = test_bus(program);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    fn step_cycles(cpu: &mut Cpu, bus: &mut Bus) -> u32 {
        let before = bus.cpu_cycles();
        cpu.step(bus).unwrap();
        bus.cpu_cycles().wrapping_sub(before)
    }

    fn stack_byte(bus: &mut Bus, s: u8) -> u8 {
        bus.read_cpu(0x0100 | u16::from(s))
    }

    #[test]
    fn table_has_every_documented_opcode() {
        let official = OPCODES.iter().filter(|op| !op.unofficial).count();
        assert_eq!(official, 151);
        assert_eq!(OPCODES[0x89].mnemonic, "NOP");
        assert_eq!(OPCODES[0x9D].mode, AddrMode::AbsoluteX);
        assert_eq!(OPCODES[0xBF].op, Op::Lax);
        assert_eq!(OPCODES[0x02].op, Op::Unknown);
        assert_eq!(OPCODES[0xBB].op, Op::Unknown);
    }

    #[test]
    fn reset_restores_fixed_register_pattern() {
        let (mut cpu, mut bus) = boot(&[0xA9, 0x42, 0xA2, 0x17, 0xA0, 0x99]);
        assert_eq!(cpu.registers().pc, 0x8000);
        assert_eq!(cpu.registers().p, 0x24);
        assert_eq!(cpu.registers().s, 0xFD);
        assert_eq!(bus.cpu_cycles(), 0);

        cpu.execute(&mut bus, 6).unwrap();
        let regs = cpu.registers();
        assert_eq!((regs.a, regs.x, regs.y), (0x42, 0x17, 0x99));

        cpu.reset(&mut bus);
        let regs = cpu.registers();
        assert_eq!((regs.a, regs.x, regs.y), (0, 0, 0));
        assert_eq!(regs.p, 0x24);
        assert_eq!(regs.s, 0xFD);
        assert_eq!(regs.pc, 0x8000);
    }

    #[test]
    fn instruction_cycle_counts() {
        let program = [
            0xA9, 0x01, // LDA #$01
            0x8D, 0x00, 0x02, // STA $0200
            0xA2, 0xFF, // LDX #$FF
            0xBD, 0x01, 0x02, // LDA $0201,X (crosses)
            0xBD, 0x00, 0x02, // LDA $0200,X
            0x9D, 0x00, 0x02, // STA $0200,X
            0xE6, 0x10, // INC $10
            0xF6, 0x10, // INC $10,X
            0x1E, 0x00, 0x02, // ASL $0200,X
            0x0A, // ASL A
            0x48, // PHA
            0x68, // PLA
            0x20, 0x20, 0x80, // JSR $8020
            0x4C, 0x00, 0x80, // JMP $8000
            0x60, // $8020: RTS
        ];
        let (mut cpu, mut bus) = boot(&program);
        let cycles: Vec<u32> = (0..15).map(|_| step_cycles(&mut cpu, &mut bus)).collect();
        assert_eq!(cycles, [2, 4, 2, 5, 4, 5, 5, 6, 7, 2, 3, 4, 6, 6, 3]);
        assert_eq!(cpu.registers().pc, 0x8000);
    }

    #[test]
    fn indirect_and_unofficial_cycle_counts() {
        let program = [
            0xA0, 0x10, // LDY #$10
            0xB1, 0x00, // LDA ($00),Y (crosses)
            0x91, 0x00, // STA ($00),Y
            0xA1, 0x00, // LDA ($00,X)
            0xC7, 0x20, // DCP $20
            0xDB, 0x00, 0x03, // DCP $0300,Y
            0xC3, 0x00, // DCP ($00,X)
            0x04, 0x20, // NOP $20
            0x1C, 0x00, 0x03, // NOP $0300,X
            0x6C, 0x00, 0x03, // JMP ($0300)
        ];
        let (mut cpu, mut bus) = boot(&program);
        bus.write_cpu(0x0000, 0xF8);
        bus.write_cpu(0x0001, 0x02);
        let cycles: Vec<u32> = (0..10).map(|_| step_cycles(&mut cpu, &mut bus)).collect();
        assert_eq!(cycles, [2, 6, 6, 6, 5, 7, 8, 3, 4, 5]);
    }

    #[test]
    fn branch_cycles() {
        let program = [
            0x18, // CLC
            0xB0, 0x10, // BCS (not taken)
            0x90, 0x00, // BCC +0
            0x90, 0x80, // BCC -128 (crosses)
        ];
        let (mut cpu, mut bus) = boot(&program);
        let cycles: Vec<u32> = (0..4).map(|_| step_cycles(&mut cpu, &mut bus)).collect();
        assert_eq!(cycles, [2, 2, 3, 4]);
        assert_eq!(cpu.registers().pc, 0x7F87);
    }

    #[test]
    fn zero_page_pointers_wrap() {
        let program = [
            0xA0, 0x00, // LDY #$00
            0xB1, 0xFF, // LDA ($FF),Y
            0xA2, 0x90, // LDX #$90
            0xB5, 0x80, // LDA $80,X
            0xA2, 0x01, // LDX #$01
            0xA1, 0xFE, // LDA ($FE,X)
        ];
        let (mut cpu, mut bus) = boot(&program);
        bus.write_cpu(0x00FF, 0x00);
        bus.write_cpu(0x0000, 0x03);
        bus.write_cpu(0x0300, 0x5A);
        bus.write_cpu(0x0010, 0x77);

        cpu.execute(&mut bus, 1).unwrap();
        cpu.execute(&mut bus, 1).unwrap();
        assert_eq!(cpu.registers().a, 0x5A);
        cpu.execute(&mut bus, 1).unwrap();
        cpu.execute(&mut bus, 1).unwrap();
        assert_eq!(cpu.registers().a, 0x77);
        cpu.execute(&mut bus, 1).unwrap();
        cpu.execute(&mut bus, 1).unwrap();
        assert_eq!(cpu.registers().a, 0x5A);
    }

    #[test]
    fn jmp_indirect_does_not_cross_page() {
        let (mut cpu, mut bus) = boot(&[0x6C, 0xFF, 0x02]);
        bus.write_cpu(0x02FF, 0x34);
        bus.write_cpu(0x0200, 0x12);
        bus.write_cpu(0x0300, 0x99);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.registers().pc, 0x1234);
    }

    #[test]
    fn adc_and_sbc_flags() {
        let program = [
            0xA9, 0x7F, // LDA #$7F
            0x69, 0x01, // ADC #$01
            0x38, // SEC
            0xE9, 0x01, // SBC #$01
            0xEB, 0x7F, // SBC #$7F (unofficial)
            0xC9, 0x00, // CMP #$00
        ];
        let (mut cpu, mut bus) = boot(&program);
        cpu.execute(&mut bus, 4).unwrap();
        let regs = cpu.registers();
        assert_eq!(regs.a, 0x80);
        assert_ne!(regs.p & FLAG_OVERFLOW, 0);
        assert_ne!(regs.p & FLAG_NEGATIVE, 0);
        assert_eq!(regs.p & FLAG_CARRY, 0);

        cpu.execute(&mut bus, 4).unwrap();
        let regs = cpu.registers();
        assert_eq!(regs.a, 0x7F);
        assert_ne!(regs.p & FLAG_CARRY, 0);
        assert_ne!(regs.p & FLAG_OVERFLOW, 0);

        cpu.execute(&mut bus, 2).unwrap();
        let regs = cpu.registers();
        assert_eq!(regs.a, 0x00);
        assert_ne!(regs.p & FLAG_ZERO, 0);
        assert_eq!(regs.p & FLAG_OVERFLOW, 0);

        cpu.execute(&mut bus, 2).unwrap();
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);
    }

    #[test]
    fn unofficial_combined_operations() {
        let program = [
            0xA7, 0x10, // LAX $10
            0x87, 0x11, // SAX $11
            0xA9, 0x05, // LDA #$05
            0xC7, 0x12, // DCP $12
            0xE7, 0x13, // ISB $13
            0x07, 0x14, // SLO $14
            0x67, 0x15, // RRA $15
        ];
        let (mut cpu, mut bus) = boot(&program);
        bus.write_cpu(0x0010, 0x3C);
        bus.write_cpu(0x0012, 0x06);
        bus.write_cpu(0x0013, 0x01);
        bus.write_cpu(0x0014, 0x81);
        bus.write_cpu(0x0015, 0x02);

        cpu.step(&mut bus).unwrap();
        assert_eq!((cpu.registers().a, cpu.registers().x), (0x3C, 0x3C));
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_cpu(0x0011), 0x3C);

        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_cpu(0x0012), 0x05);
        assert_ne!(cpu.registers().p & FLAG_ZERO, 0);
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);

        // 5 - 2 with carry set.
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_cpu(0x0013), 0x02);
        assert_eq!(cpu.registers().a, 0x03);

        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_cpu(0x0014), 0x02);
        assert_eq!(cpu.registers().a, 0x03);
        assert_ne!(cpu.registers().p & FLAG_CARRY, 0);

        // ROR with carry in: $02 -> $81, carry out 0, then 3 + $81.
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_cpu(0x0015), 0x81);
        assert_eq!(cpu.registers().a, 0x84);
    }

    #[test]
    fn nmi_entry_takes_seven_cycles() {
        let (mut cpu, mut bus) = boot(&[0xEA]);
        bus.lines_mut().set_nmi_line(true);
        assert_eq!(step_cycles(&mut cpu, &mut bus), 7);

        let regs = cpu.registers();
        assert_eq!(regs.pc, NMI_HANDLER);
        assert_eq!(regs.s, 0xFA);
        assert_ne!(regs.p & FLAG_INTERRUPT, 0);
        assert_eq!(stack_byte(&mut bus, 0xFB), 0x24);
        assert_eq!(stack_byte(&mut bus, 0xFC), 0x00);
        assert_eq!(stack_byte(&mut bus, 0xFD), 0x80);
        assert!(!bus.lines().nmi_pending());

        // RTI returns to the interrupted instruction.
        assert_eq!(step_cycles(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.registers().pc, 0x8000);
    }

    #[test]
    fn irq_waits_for_interrupt_flag() {
        let (mut cpu, mut bus) = boot(&[0x58, 0xEA]);
        bus.lines_mut().set_irq_line(IrqSource::Mapper, true);
        assert_eq!(step_cycles(&mut cpu, &mut bus), 2);
        assert_eq!(cpu.registers().pc, 0x8001);

        assert_eq!(step_cycles(&mut cpu, &mut bus), 7);
        assert_eq!(cpu.registers().pc, IRQ_HANDLER);
    }

    #[test]
    fn brk_pushes_return_address_and_break_flag() {
        let (mut cpu, mut bus) = boot(&[0x00]);
        assert_eq!(step_cycles(&mut cpu, &mut bus), 7);
        assert_eq!(cpu.registers().pc, IRQ_HANDLER);
        assert_eq!(stack_byte(&mut bus, 0xFB), 0x34);
        assert_eq!(stack_byte(&mut bus, 0xFC), 0x02);
        assert_eq!(stack_byte(&mut bus, 0xFD), 0x80);
    }

    #[test]
    fn nmi_during_brk_takes_nmi_vector() {
        let (mut cpu, mut bus) = boot(&[0x00]);
        bus.write_cpu(0x2000, 0x80);
        // Stop just after the frame ends, a couple of dots before the NMI line rises.
        while bus.ppu().frame_number() == 0 {
            bus.add_pending_cycles(1);
            bus.execute_pending_cycles();
        }
        assert!(!bus.lines().nmi_pending());

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.registers().pc, NMI_HANDLER);
        assert!(!bus.lines().nmi_pending());
        assert_ne!(stack_byte(&mut bus, 0xFB) & FLAG_BREAK, 0);
    }

    #[test]
    fn dma_stall_is_one_unit() {
        let (mut cpu, mut bus) = boot(&[0xA9, 0x02, 0x8D, 0x14, 0x40]);
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(step_cycles(&mut cpu, &mut bus), OAM_DMA_STALL_CYCLES);
        assert_eq!(cpu.registers().pc, 0x8005);
    }

    #[test]
    fn execute_reports_consumed_cycles() {
        let (mut cpu, mut bus) = boot(&[0xEE, 0x00, 0x02]);
        assert_eq!(cpu.execute(&mut bus, 1).unwrap(), 6);
    }

    #[test]
    fn unknown_opcode_is_an_error_with_listing() {
        let (mut cpu, mut bus) = boot(&[0xEA, 0x02, 0xA9, 0x01]);
        cpu.step(&mut bus).unwrap();
        let err = cpu.step(&mut bus).unwrap_err().to_string();
        assert!(err.contains("unknown opcode $02 at $8001"), "{err}");
        assert!(err.contains("LDA #$01"), "{err}");
        assert_eq!(cpu.registers().pc, 0x8001);
    }
}
