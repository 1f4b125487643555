use std::fmt;

use super::cpu::{AddrMode, OPCODES, Registers};

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub addr: u16,
    pub bytes: Vec<u8>,
    pub mnemonic: &'static str,
    pub unofficial: bool,
    pub operand: String,
}

impl Instruction {
    pub fn len(&self) -> u16 {
        self.bytes.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for Instruction {
    /// `C000  4C F5 C5  JMP $C5F5`; unofficial opcodes are marked with `*`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self
            .bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let marker = if self.unofficial { '*' } else { ' ' };
        write!(f, "{:04X}  {bytes:<8} {marker}{}", self.addr, self.mnemonic)?;
        if !self.operand.is_empty() {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

pub fn disassemble(peek: impl Fn(u16) -> u8, addr: u16) -> Instruction {
    let opcode = peek(addr);
    let entry = &OPCODES[opcode as usize];
    let bytes: Vec<u8> = (0..=entry.mode.operand_len())
        .map(|offset| peek(addr.wrapping_add(offset)))
        .collect();
    let byte = bytes.get(1).copied().unwrap_or(0);
    let word = u16::from_le_bytes([byte, bytes.get(2).copied().unwrap_or(0)]);

    let operand = match entry.mode {
        AddrMode::Implied => String::new(),
        AddrMode::Accumulator => "A".to_string(),
        AddrMode::Immediate => format!("#${byte:02X}"),
        AddrMode::ZeroPage => format!("${byte:02X}"),
        AddrMode::ZeroPageX => format!("${byte:02X},X"),
        AddrMode::ZeroPageY => format!("${byte:02X},Y"),
        AddrMode::Absolute => format!("${word:04X}"),
        AddrMode::AbsoluteX => format!("${word:04X},X"),
        AddrMode::AbsoluteY => format!("${word:04X},Y"),
        AddrMode::Indirect => format!("(${word:04X})"),
        AddrMode::IndirectX => format!("(${byte:02X},X)"),
        AddrMode::IndirectY => format!("(${byte:02X}),Y"),
        AddrMode::Relative => {
            let target = addr.wrapping_add(2).wrapping_add_signed(i16::from(byte as i8));
            format!("${target:04X}")
        }
    };

    Instruction {
        addr,
        bytes,
        mnemonic: entry.mnemonic,
        unofficial: entry.unofficial,
        operand,
    }
}

/// Disassembles `count` consecutive instructions starting at `addr`.
pub fn listing(peek: impl Fn(u16) -> u8, addr: u16, count: usize) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(count);
    let mut pc = addr;
    for _ in 0..count {
        let instr = disassemble(&peek, pc);
        pc = pc.wrapping_add(instr.len());
        out.push(instr);
    }
    out
}

/// A nestest-style log line: instruction, registers, PPU position and cycle count.
pub fn trace_line(
    instr: &Instruction,
    regs: &Registers,
    ppu_position: (u16, u16),
    cycles: u32,
) -> String {
    format!(
        "{:<47} A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X} PPU:{:>3},{:>3} CYC:{}",
        instr.to_string(),
        regs.a,
        regs.x,
        regs.y,
        regs.p,
        regs.s,
        ppu_position.0,
        ppu_position.1,
        cycles
    )
}
