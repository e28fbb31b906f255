//! Text disassembly of program words.
use crate::{
    CORE_BASE, PRAM_LEN, Program,
    ins::{Acc, ControlOp, JumpCond, Opcode, decode},
};
use std::fmt::{self, Write};

/// Column at which the MAC part of a line starts.
const MAC_COLUMN: usize = 60;

/// A disassembled program word at a given word address of the program memory.
#[derive(Debug, Clone, Copy)]
pub struct Line {
    pub address: usize,
    pub word: u32,
}

impl Line {
    fn core(&self) -> usize {
        (self.address >= CORE_BASE[1]) as usize
    }

    fn operand(&self) -> String {
        let ins = decode(self.word);
        match ins.literal() {
            Some(value) => format!("{value:#x}"),
            None => format!("iram{}[{:#04x}]", self.core(), ins.mem),
        }
    }
}

fn acc_name(acc: Acc) -> char {
    match acc {
        Acc::A => 'A',
        Acc::B => 'B',
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ins = decode(self.word);
        let mut head = format!("{:04x}: ", self.address);
        if self.core() == 1 {
            write!(head, "{:x}{:x} ", ins.eram_ctrl >> 1, ins.eram_ctrl & 1)?;
        } else if ins.eram_ctrl != 0 {
            head.push_str("<eram bits on core 0> ");
        }

        let low = self.word & 0x7F_FFFF;
        write!(
            head,
            "{:02x} {:02x} {:02x}",
            low >> 16,
            (low >> 8) & 0xFF,
            low & 0xFF
        )?;

        if ins.is_nop() {
            return f.write_str(&head);
        }

        head.push_str("            ");

        let mut operand = self.operand();
        let mut coefficient = format!("#{:#04x}", ins.coef);
        let mut negated = false;
        let mut mac = if ins.clear { "MUL" } else { "MAC" };

        let delayed = |acc: Acc| format!("acc{}(t-3)", acc_name(acc));
        let gram = format!("gram[{:#04x}]", ins.mem);
        match ins.opcode {
            Opcode::Mac | Opcode::ClrMac | Opcode::MacB | Opcode::ClrMacB => (),
            Opcode::StoreA | Opcode::StoreAIntoB | Opcode::StoreKeep => {
                write!(head, "STSATA {operand} ")?;
                operand = delayed(Acc::A);
            }
            Opcode::StoreB | Opcode::StoreBIntoB | Opcode::StoreBKeepIntoB => {
                write!(head, "STSATB {operand} ")?;
                operand = delayed(Acc::B);
            }
            Opcode::ReadGram | Opcode::ClrReadGram => operand = gram,
            Opcode::Unknown28 | Opcode::Unknown2C | Opcode::Unknown54 => mac = "<UNUSED>",
            Opcode::MulCoef => {
                if ins.coef & 4 != 0 {
                    write!(head, "STSAT{} {operand} ", acc_name(ins.acc))?;
                    operand = delayed(ins.acc);
                }

                negated = ins.coef & 8 != 0;
                coefficient = match ins.coef >> 5 {
                    6 => "eramvar".to_owned(),
                    7 => "mulcoeff5".to_owned(),
                    i => format!("mulcoeff{i}"),
                };

                if ins.coef & 16 != 0 {
                    coefficient = format!("interp({coefficient})");
                }
            }
            Opcode::Control => match ins.control() {
                Some(ControlOp::WriteMulCoef { index, source }) => {
                    write!(head, "mulcoeff{index} = {};", delayed(source))?;
                }
                Some(ControlOp::Jump(cond)) => {
                    let name = match cond {
                        JumpCond::Zero => "JZ ",
                        JumpCond::Negative => "JMI",
                        JumpCond::Positive => "JPL",
                        JumpCond::Always => "J  ",
                    };
                    write!(head, "{name} {:03x}", ins.coef)?;
                }
                Some(ControlOp::IntPins) => head.push_str("INTPINS"),
                Some(ControlOp::DoublePrecision) => {
                    mac = "DMAC";
                    operand.clear();
                }
                Some(ControlOp::WriteVarOffset) => {
                    write!(head, "ERAMVAR = acc{};", acc_name(ins.acc))?;
                }
                Some(ControlOp::WriteHost) => {
                    write!(head, "HOSTREG = acc{};", acc_name(ins.acc))?;
                }
                Some(ControlOp::WriteLatch) => {
                    write!(head, "ERAMLAT = acc{};", acc_name(ins.acc))?;
                }
                Some(ControlOp::ReadLatch { .. }) => operand = "ERAMRD".to_owned(),
                _ => write!(head, "<UNKNOWN control {:02x}>", ins.mem)?,
            },
            Opcode::StoreGramA => {
                write!(head, "{gram} = {};", delayed(Acc::A))?;
                operand = delayed(Acc::A);
            }
            Opcode::StoreGramB => {
                write!(head, "{gram} = {};", delayed(Acc::B))?;
                operand = delayed(Acc::B);
            }
            Opcode::StoreRaw | Opcode::ClrStoreRaw => write!(head, "STA {operand} ")?,
            Opcode::StoreRect | Opcode::ClrStoreRect => {
                write!(head, "RECTA {operand} ")?;
                operand = delayed(Acc::A);
            }
            Opcode::SetCondition => mac = "CMP",
            Opcode::Interp | Opcode::ClrInterp | Opcode::InterpAlt | Opcode::ClrInterpAlt => {
                operand = format!("~{operand} & 0x7fffff");
            }
            Opcode::InterpStorePos | Opcode::ClrInterpStorePos => {
                write!(head, "STSATA {operand}")?;
                operand = "mangle_pve(accA(t-3))".to_owned();
            }
            Opcode::InterpStoreNeg | Opcode::ClrInterpStoreNeg => {
                write!(head, "STSATA {operand}")?;
                operand = "abs(accA(t-3))".to_owned();
            }
        }

        let pad = MAC_COLUMN.saturating_sub(head.len());
        write!(
            f,
            "{head}{:pad$}              {mac:<4} {}, {}{coefficient} >> {}, {operand}",
            "",
            acc_name(ins.acc),
            if negated { '-' } else { ' ' },
            ins.shift,
        )
    }
}

/// Disassembles the programs of both cores.
pub fn listing(program: &Program) -> String {
    let mut out = String::new();
    for (i, base) in CORE_BASE.iter().enumerate() {
        if i != 0 {
            out.push_str("\n\n");
        }

        for address in *base..*base + PRAM_LEN {
            let line = Line {
                address,
                word: program.word(address),
            };
            writeln!(out, "{line}").expect("writing to a string never fails");
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn word(op: u8, mem: u8, shift: u8, coef: u8) -> u32 {
        ((op as u32) << 16) | ((mem as u32) << 10) | ((shift as u32) << 8) | coef as u32
    }

    #[test]
    fn nop_line() {
        let line = Line { address: 3, word: 0 };
        assert_eq!(line.to_string(), "0003: 00 00 00");
    }

    #[test]
    fn mac_line() {
        let line = Line {
            address: 0,
            word: word(0x10, 2, 1, 0x7F),
        };
        let text = line.to_string();
        assert!(text.starts_with("0000: 10 09 7f"), "{text}");
        assert!(text.ends_with("MAC  B,  #0x7f >> 6, 0x400"), "{text}");
    }

    #[test]
    fn core1_shows_eram_bits() {
        let line = Line {
            address: CORE_BASE[1] + 1,
            word: (0x13 << 23) | word(0x34, 0xEA, 0, 0),
        };
        let text = line.to_string();
        assert!(text.starts_with("0401: 91 37 a8 00"), "{text}");
        assert!(text.contains("HOSTREG = accB;"), "{text}");
    }

    #[test]
    fn mulcoef_line() {
        let line = Line {
            address: 5,
            word: word(0x30, 5, 0, (2 << 5) | 8 | 4 | 1),
        };
        let text = line.to_string();
        assert!(text.contains("STSATA iram0[0x05]"), "{text}");
        assert!(text.ends_with("MAC  A, -mulcoeff2 >> 7, accA(t-3)"), "{text}");
    }

    #[test]
    fn listing_has_both_cores() {
        let program = Program::default();
        let text = listing(&program);
        assert_eq!(text.lines().count(), 2 * PRAM_LEN + 2);
        assert!(text.contains("0400: 00 00 00 00"));
    }
}
