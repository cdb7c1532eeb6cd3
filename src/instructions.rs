// One handler per mnemonic. The handlers read the decoded instruction
// parts (opcode, opcode2, op_low/op_high, disp) left behind by step() and
// mutate registers and memory. Flag behaviour follows the Z80, including
// the undocumented X and Y bits.

use log::info;

use crate::alu::parity;
use crate::dispatch::{Handler, IndexPrefix};
use crate::processor::{Cpu, Operand, Signal};

impl Cpu {
    pub fn execute(&mut self, handler: Handler) -> Signal {
        match handler {
            Handler::NOP => {}
            Handler::LXI => self.inst_lxi(),
            Handler::STAX => self.inst_stax(),
            Handler::LDAX => self.inst_ldax(),
            Handler::STA => self.mem.set(self.op_word(), self.regs.a),
            Handler::LDA => self.regs.a = self.mem.get(self.op_word()),
            Handler::SHLD => self.inst_shld(),
            Handler::LHLD => self.inst_lhld(),
            Handler::JR => self.inst_jr(),
            Handler::JRCC => self.inst_jrcc(),
            Handler::DJNZ => self.inst_djnz(),
            Handler::EXAF => self.regs.exchange_af(),
            Handler::SCF => self.inst_scf(),
            Handler::CCF => self.inst_ccf(),
            Handler::HALT => self.inst_halt(),
            Handler::CPL => self.inst_cpl(),
            Handler::RLA => self.inst_rla(),
            Handler::RLCA => self.inst_rlca(),
            Handler::RRA => self.inst_rra(),
            Handler::RRCA => self.inst_rrca(),
            Handler::MOV => self.inst_mov(),
            Handler::MVI => self.inst_mvi(),
            Handler::INR => self.inst_inr(),
            Handler::INX => self.inst_inx(),
            Handler::DCR => self.inst_dcr(),
            Handler::DCX => self.inst_dcx(),
            Handler::DAD => self.inst_dad(),
            Handler::DAA => self.inst_daa(),
            Handler::ADD => {
                let value = self.read_field(self.opcode & 0x07);
                self.regs.a = self.regs.flags.add8(self.regs.a, value, false);
            }
            Handler::ADI => self.regs.a = self.regs.flags.add8(self.regs.a, self.op_low, false),
            Handler::ADC => {
                let value = self.read_field(self.opcode & 0x07);
                let carry = self.regs.flags.c;
                self.regs.a = self.regs.flags.add8(self.regs.a, value, carry);
            }
            Handler::ACI => {
                let carry = self.regs.flags.c;
                self.regs.a = self.regs.flags.add8(self.regs.a, self.op_low, carry);
            }
            Handler::SUB => {
                let value = self.read_field(self.opcode & 0x07);
                self.regs.a = self.regs.flags.sub8(self.regs.a, value, false);
            }
            Handler::SUI => self.regs.a = self.regs.flags.sub8(self.regs.a, self.op_low, false),
            Handler::SBC => {
                let value = self.read_field(self.opcode & 0x07);
                let carry = self.regs.flags.c;
                self.regs.a = self.regs.flags.sub8(self.regs.a, value, carry);
            }
            Handler::SBI => {
                let carry = self.regs.flags.c;
                self.regs.a = self.regs.flags.sub8(self.regs.a, self.op_low, carry);
            }
            Handler::CMP => {
                let value = self.read_field(self.opcode & 0x07);
                self.inst_compare(value);
            }
            Handler::CMPI => {
                let value = self.op_low;
                self.inst_compare(value);
            }
            Handler::AND => {
                let value = self.read_field(self.opcode & 0x07);
                self.regs.a &= value;
                self.regs.flags.h = true;
                self.logic_flags();
            }
            Handler::ANI => {
                self.regs.a &= self.op_low;
                self.regs.flags.h = true;
                self.logic_flags();
            }
            Handler::OR => {
                let value = self.read_field(self.opcode & 0x07);
                self.regs.a |= value;
                self.regs.flags.h = false;
                self.logic_flags();
            }
            Handler::ORI => {
                self.regs.a |= self.op_low;
                self.regs.flags.h = false;
                self.logic_flags();
            }
            Handler::XOR => {
                let value = self.read_field(self.opcode & 0x07);
                self.regs.a ^= value;
                self.regs.flags.h = false;
                self.logic_flags();
            }
            Handler::XRI => {
                self.regs.a ^= self.op_low;
                self.regs.flags.h = false;
                self.logic_flags();
            }
            Handler::JP => self.regs.pc = self.op_word(),
            Handler::JPCC => {
                if self.condition_met() {
                    self.regs.pc = self.op_word();
                }
            }
            Handler::RET => {
                // the magic-address trap: a RET fetched from the sentinel
                // range invokes the OS host before returning
                if self.in_magic_range() {
                    let slot = self.current_instruction - crate::memory::MAGIC_ADDRESS;
                    return Signal::OsCall(slot as usize);
                }
                self.regs.pc = self.pop();
            }
            Handler::RETCC => {
                if self.condition_met() {
                    self.regs.pc = self.pop();
                }
            }
            Handler::CALL => {
                self.push(self.regs.pc);
                self.regs.pc = self.op_word();
            }
            Handler::CALLCC => {
                if self.condition_met() {
                    self.push(self.regs.pc);
                    self.regs.pc = self.op_word();
                }
            }
            Handler::RST => {
                self.push(self.regs.pc);
                self.regs.pc = (self.opcode & 0x38) as u16;
            }
            Handler::PUSH => self.inst_push(),
            Handler::POP => self.inst_pop(),
            Handler::EXX => self.regs.exchange_main(),
            Handler::XCHG => {
                let de = self.regs.de();
                let hl = self.regs.hl();
                self.regs.set_de(hl);
                self.regs.set_hl(de);
            }
            Handler::XTHL => self.inst_xthl(),
            Handler::PCHL => {
                self.regs.pc = match self.prefix {
                    IndexPrefix::Ix => self.regs.ix(),
                    IndexPrefix::Iy => self.regs.iy(),
                    IndexPrefix::None => self.regs.hl(),
                }
            }
            Handler::SPHL => {
                self.regs.sp = match self.prefix {
                    IndexPrefix::Ix => self.regs.ix(),
                    IndexPrefix::Iy => self.regs.iy(),
                    IndexPrefix::None => self.regs.hl(),
                }
            }
            // there are no ports: reads yield zero, writes disappear
            Handler::INA => self.regs.a = 0x00,
            Handler::OUTA => {}
            Handler::EI => self.regs.iff = true,
            Handler::DI => self.regs.iff = false,
            Handler::CB => self.inst_cb(),
            Handler::INRC => self.inst_inrc(),
            Handler::OUTCR => {}
            Handler::ADCHL => self.inst_adchl(),
            Handler::SBCHL => self.inst_sbchl(),
            Handler::LRRD => self.inst_lrrd(),
            Handler::SRRD => self.inst_srrd(),
            Handler::NEG => {
                self.regs.a = self.regs.flags.sub8(0, self.regs.a, false);
            }
            // no NMI and no IFF2, so RETN and RETI degenerate to RET
            // (without the magic-address trap: the sentinel bytes are
            // plain 0xc9)
            Handler::RETN => self.regs.pc = self.pop(),
            Handler::IM => {}
            Handler::LDAI => {
                self.regs.a = self.regs.i;
                self.ldair_flags();
            }
            Handler::LDIA => self.regs.i = self.regs.a,
            Handler::LDAR => {
                self.regs.a = self.regs.r;
                self.ldair_flags();
            }
            Handler::LDRA => self.regs.r = self.regs.a,
            Handler::RLD => self.inst_rld(),
            Handler::RRD => self.inst_rrd(),
            Handler::LDI => self.block_move(true),
            Handler::LDIR => {
                self.block_move(true);
                if self.regs.flags.p {
                    self.repeat_block();
                }
            }
            Handler::LDD => self.block_move(false),
            Handler::LDDR => {
                self.block_move(false);
                if self.regs.flags.p {
                    self.repeat_block();
                }
            }
            Handler::CPI => self.block_compare(true),
            Handler::CPIR => {
                self.block_compare(true);
                if self.regs.flags.p && !self.regs.flags.z {
                    self.repeat_block();
                }
            }
            Handler::CPD => self.block_compare(false),
            Handler::CPDR => {
                self.block_compare(false);
                if self.regs.flags.p && !self.regs.flags.z {
                    self.repeat_block();
                }
            }
            Handler::INI => self.inst_ini(),
            Handler::INIR => {
                self.inst_ini();
                if self.regs.b != 0 {
                    self.repeat_block();
                }
            }
            Handler::IND => self.inst_ind(),
            Handler::INDR => {
                self.inst_ind();
                if self.regs.b != 0 {
                    self.repeat_block();
                }
            }
            Handler::OUTI => self.inst_outi(),
            Handler::OTIR => {
                self.inst_outi();
                if self.regs.b != 0 {
                    self.repeat_block();
                }
            }
            Handler::OUTD => self.inst_outd(),
            Handler::OTDR => {
                self.inst_outd();
                if self.regs.b != 0 {
                    self.repeat_block();
                }
            }
        }
        Signal::Ok
    }

    fn read_field(&mut self, n: u8) -> u8 {
        let operand = self.operand8(n, 0);
        self.read_operand(operand)
    }

    fn inst_lxi(&mut self) {
        let word = self.op_word();
        match self.opcode & 0x30 {
            0x00 => self.regs.set_bc(word),
            0x10 => self.regs.set_de(word),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.set_ix(word),
                IndexPrefix::Iy => self.regs.set_iy(word),
                IndexPrefix::None => self.regs.set_hl(word),
            },
            _ => self.regs.sp = word,
        }
    }

    fn inst_stax(&mut self) {
        let address = if self.opcode & 0x10 != 0 { self.regs.de() } else { self.regs.bc() };
        self.mem.set(address, self.regs.a);
    }

    fn inst_ldax(&mut self) {
        let address = if self.opcode & 0x10 != 0 { self.regs.de() } else { self.regs.bc() };
        self.regs.a = self.mem.get(address);
    }

    fn inst_shld(&mut self) {
        let address = self.op_word();
        let word = match self.prefix {
            IndexPrefix::Ix => self.regs.ix(),
            IndexPrefix::Iy => self.regs.iy(),
            IndexPrefix::None => self.regs.hl(),
        };
        self.mem.set_word(address, word);
    }

    fn inst_lhld(&mut self) {
        let word = self.mem.get_word(self.op_word());
        match self.prefix {
            IndexPrefix::Ix => self.regs.set_ix(word),
            IndexPrefix::Iy => self.regs.set_iy(word),
            IndexPrefix::None => self.regs.set_hl(word),
        }
    }

    fn inst_jr(&mut self) {
        let offset = self.op_low as i8 as i16 as u16;
        self.internal = self.regs.pc.wrapping_add(offset);
        self.regs.pc = self.internal;
    }

    fn inst_jrcc(&mut self) {
        let taken = match self.opcode & 0x18 {
            0x00 => !self.regs.flags.z,
            0x08 => self.regs.flags.z,
            0x10 => !self.regs.flags.c,
            _ => self.regs.flags.c,
        };
        if taken {
            self.inst_jr();
        }
    }

    fn inst_djnz(&mut self) {
        self.regs.b = self.regs.b.wrapping_sub(1);
        if self.regs.b != 0 {
            self.inst_jr();
        }
    }

    fn inst_scf(&mut self) {
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.h = false;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.n = false;
        self.regs.flags.c = true;
    }

    fn inst_ccf(&mut self) {
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.h = self.regs.flags.c;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.n = false;
        self.regs.flags.c = !self.regs.flags.c;
    }

    /// There are no interrupts to wake a halted CPU, so HALT is logged
    /// and stepped over.
    fn inst_halt(&mut self) {
        info!("0x{:04x}: HALT executed", self.current_instruction);
    }

    fn inst_cpl(&mut self) {
        self.regs.a ^= 0xff;
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.h = true;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.n = true;
    }

    /// S, Z, and P are untouched by the accumulator rotates.
    fn rot_flags(&mut self) {
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.h = false;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.n = false;
    }

    fn inst_rla(&mut self) {
        let t = ((self.regs.a as u16) << 1) | self.regs.flags.c as u16;
        self.regs.flags.c = t & 0x100 != 0;
        self.regs.a = (t & 0xff) as u8;
        self.rot_flags();
    }

    fn inst_rlca(&mut self) {
        self.regs.flags.c = self.regs.a & 0x80 != 0;
        self.regs.a = self.regs.a.rotate_left(1);
        self.rot_flags();
    }

    fn inst_rra(&mut self) {
        let mut t = self.regs.a as u16;
        if self.regs.flags.c {
            t |= 0x100;
        }
        self.regs.flags.c = t & 0x01 != 0;
        self.regs.a = (t >> 1) as u8;
        self.rot_flags();
    }

    fn inst_rrca(&mut self) {
        self.regs.flags.c = self.regs.a & 0x01 != 0;
        self.regs.a = self.regs.a.rotate_right(1);
        self.rot_flags();
    }

    fn inst_mov(&mut self) {
        let d = (self.opcode >> 3) & 0x07;
        let s = self.opcode & 0x07;
        let dst = self.operand8(d, s);
        let src = self.operand8(s, d);
        let value = self.read_operand(src);
        self.write_operand(dst, value);
    }

    fn inst_mvi(&mut self) {
        let dst = self.operand8((self.opcode >> 3) & 0x07, 0);
        let value = self.op_low;
        self.write_operand(dst, value);
    }

    fn inst_inr(&mut self) {
        // doesn't affect the carry flag
        let old_c = self.regs.flags.c;
        let operand = self.operand8((self.opcode >> 3) & 0x07, 0);
        let value = self.read_operand(operand);
        let result = self.regs.flags.add8(value, 1, false);
        self.write_operand(operand, result);
        self.regs.flags.c = old_c;
    }

    fn inst_dcr(&mut self) {
        let old_c = self.regs.flags.c;
        let operand = self.operand8((self.opcode >> 3) & 0x07, 0);
        let value = self.read_operand(operand);
        let result = self.regs.flags.sub8(value, 1, false);
        self.write_operand(operand, result);
        self.regs.flags.c = old_c;
    }

    fn inst_inx(&mut self) {
        match self.opcode & 0x30 {
            0x00 => self.regs.set_bc(self.regs.bc().wrapping_add(1)),
            0x10 => self.regs.set_de(self.regs.de().wrapping_add(1)),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.set_ix(self.regs.ix().wrapping_add(1)),
                IndexPrefix::Iy => self.regs.set_iy(self.regs.iy().wrapping_add(1)),
                IndexPrefix::None => self.regs.set_hl(self.regs.hl().wrapping_add(1)),
            },
            _ => self.regs.sp = self.regs.sp.wrapping_add(1),
        }
    }

    fn inst_dcx(&mut self) {
        match self.opcode & 0x30 {
            0x00 => self.regs.set_bc(self.regs.bc().wrapping_sub(1)),
            0x10 => self.regs.set_de(self.regs.de().wrapping_sub(1)),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.set_ix(self.regs.ix().wrapping_sub(1)),
                IndexPrefix::Iy => self.regs.set_iy(self.regs.iy().wrapping_sub(1)),
                IndexPrefix::None => self.regs.set_hl(self.regs.hl().wrapping_sub(1)),
            },
            _ => self.regs.sp = self.regs.sp.wrapping_sub(1),
        }
    }

    /// 16-bit addition without carry-in; S, Z, and P survive.
    fn inst_dad(&mut self) {
        let old_s = self.regs.flags.s;
        let old_z = self.regs.flags.z;
        let old_p = self.regs.flags.p;
        let summand = match self.opcode & 0x30 {
            0x00 => self.regs.bc(),
            0x10 => self.regs.de(),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.ix(),
                IndexPrefix::Iy => self.regs.iy(),
                IndexPrefix::None => self.regs.hl(),
            },
            _ => self.regs.sp,
        };
        match self.prefix {
            IndexPrefix::None => {
                self.internal = self.regs.hl();
                let result = self.regs.flags.add16(self.internal, summand, false);
                self.regs.set_hl(result);
            }
            IndexPrefix::Ix => {
                self.internal = self.regs.ix();
                let result = self.regs.flags.add16(self.internal, summand, false);
                self.regs.set_ix(result);
            }
            IndexPrefix::Iy => {
                self.internal = self.regs.iy();
                let result = self.regs.flags.add16(self.internal, summand, false);
                self.regs.set_iy(result);
            }
        }
        self.regs.flags.s = old_s;
        self.regs.flags.z = old_z;
        self.regs.flags.p = old_p;
    }

    /// BCD adjustment of A after an addition or subtraction.
    fn inst_daa(&mut self) {
        let high = (self.regs.a >> 4) & 0x0f;
        let low = self.regs.a & 0x0f;
        let flags = self.regs.flags;
        // adjustment byte for A
        let diff: u8 = if flags.c {
            if low < 0xa && !flags.h {
                0x60
            } else {
                0x66
            }
        } else if low < 0xa {
            if high < 0xa {
                if flags.h {
                    0x06
                } else {
                    0x00
                }
            } else if flags.h {
                0x66
            } else {
                0x60
            }
        } else if high < 0x9 {
            0x06
        } else {
            0x66
        };
        // new C flag
        let new_c = if flags.c {
            true
        } else if low < 0xa {
            high >= 0xa
        } else {
            high >= 0x9
        };
        // new H flag
        let new_h = if flags.n { flags.h && low < 0x6 } else { low >= 0xa };
        // adjust A, which sets S, Z, Y, X, and N
        self.regs.a = if flags.n {
            self.regs.flags.sub8(self.regs.a, diff, false)
        } else {
            self.regs.flags.add8(self.regs.a, diff, false)
        };
        self.regs.flags.p = parity(self.regs.a);
        self.regs.flags.c = new_c;
        self.regs.flags.h = new_h;
    }

    /// CMP leaves X and Y set from the operand, not from the difference.
    fn inst_compare(&mut self, value: u8) {
        self.regs.flags.sub8(self.regs.a, value, false);
        self.regs.flags.x = value & 0x08 != 0;
        self.regs.flags.y = value & 0x20 != 0;
    }

    fn logic_flags(&mut self) {
        self.regs.flags.s = self.regs.a & 0x80 != 0;
        self.regs.flags.z = self.regs.a == 0;
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.p = parity(self.regs.a);
        self.regs.flags.n = false;
        self.regs.flags.c = false;
    }

    fn condition_met(&self) -> bool {
        match self.opcode & 0x38 {
            0x00 => !self.regs.flags.z,
            0x08 => self.regs.flags.z,
            0x10 => !self.regs.flags.c,
            0x18 => self.regs.flags.c,
            0x20 => !self.regs.flags.p,
            0x28 => self.regs.flags.p,
            0x30 => !self.regs.flags.s,
            _ => self.regs.flags.s,
        }
    }

    fn inst_push(&mut self) {
        let word = match self.opcode & 0x30 {
            0x00 => self.regs.bc(),
            0x10 => self.regs.de(),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.ix(),
                IndexPrefix::Iy => self.regs.iy(),
                IndexPrefix::None => self.regs.hl(),
            },
            _ => self.regs.af(),
        };
        self.push(word);
    }

    fn inst_pop(&mut self) {
        let word = self.pop();
        match self.opcode & 0x30 {
            0x00 => self.regs.set_bc(word),
            0x10 => self.regs.set_de(word),
            0x20 => match self.prefix {
                IndexPrefix::Ix => self.regs.set_ix(word),
                IndexPrefix::Iy => self.regs.set_iy(word),
                IndexPrefix::None => self.regs.set_hl(word),
            },
            _ => self.regs.set_af(word),
        }
    }

    fn inst_xthl(&mut self) {
        let stacked = self.mem.get_word(self.regs.sp);
        match self.prefix {
            IndexPrefix::Ix => {
                let ix = self.regs.ix();
                self.mem.set_word(self.regs.sp, ix);
                self.regs.set_ix(stacked);
            }
            IndexPrefix::Iy => {
                let iy = self.regs.iy();
                self.mem.set_word(self.regs.sp, iy);
                self.regs.set_iy(stacked);
            }
            IndexPrefix::None => {
                let hl = self.regs.hl();
                self.mem.set_word(self.regs.sp, hl);
                self.regs.set_hl(stacked);
            }
        }
    }

    /// IN r,(C): always reads zero, flags as if zero had been read.
    fn inst_inrc(&mut self) {
        if let Some(operand) = self.io_operand((self.opcode2 >> 3) & 0x07) {
            self.write_operand(operand, 0);
        }
        self.regs.flags.s = false;
        self.regs.flags.z = true;
        self.regs.flags.y = false;
        self.regs.flags.h = false;
        self.regs.flags.x = false;
        self.regs.flags.p = false;
        self.regs.flags.n = false;
    }

    fn adc_sbc_operand(&self) -> u16 {
        match self.opcode2 & 0x30 {
            0x00 => self.regs.bc(),
            0x10 => self.regs.de(),
            0x20 => self.regs.hl(),
            _ => self.regs.sp,
        }
    }

    fn inst_adchl(&mut self) {
        self.internal = self.regs.hl();
        let value = self.adc_sbc_operand();
        let carry = self.regs.flags.c;
        let result = self.regs.flags.add16(self.internal, value, carry);
        self.regs.set_hl(result);
    }

    fn inst_sbchl(&mut self) {
        self.internal = self.regs.hl();
        let value = self.adc_sbc_operand();
        let carry = self.regs.flags.c;
        let result = self.regs.flags.sub16(self.internal, value, carry);
        self.regs.set_hl(result);
    }

    fn inst_lrrd(&mut self) {
        let word = self.mem.get_word(self.op_word());
        match self.opcode2 & 0x30 {
            0x00 => self.regs.set_bc(word),
            0x10 => self.regs.set_de(word),
            0x20 => self.regs.set_hl(word),
            _ => self.regs.sp = word,
        }
    }

    fn inst_srrd(&mut self) {
        let address = self.op_word();
        let word = match self.opcode2 & 0x30 {
            0x00 => self.regs.bc(),
            0x10 => self.regs.de(),
            0x20 => self.regs.hl(),
            _ => self.regs.sp,
        };
        self.mem.set_word(address, word);
    }

    fn ldair_flags(&mut self) {
        self.regs.flags.s = self.regs.a & 0x80 != 0;
        self.regs.flags.z = self.regs.a == 0;
        self.regs.flags.y = self.regs.a & 0x20 != 0;
        self.regs.flags.h = false;
        self.regs.flags.x = self.regs.a & 0x08 != 0;
        self.regs.flags.p = self.regs.iff;
        self.regs.flags.n = false;
    }

    fn shift_flags(&mut self, data: u8) {
        self.regs.flags.s = data & 0x80 != 0;
        self.regs.flags.z = data == 0;
        self.regs.flags.y = data & 0x20 != 0;
        self.regs.flags.h = false;
        self.regs.flags.x = data & 0x08 != 0;
        self.regs.flags.p = parity(data);
        self.regs.flags.n = false;
    }

    fn inst_rld(&mut self) {
        let hl = self.regs.hl();
        let t = self.mem.get(hl);
        self.mem.set(hl, ((t << 4) & 0xf0) | (self.regs.a & 0x0f));
        self.regs.a = (self.regs.a & 0xf0) | ((t >> 4) & 0x0f);
        let a = self.regs.a;
        self.shift_flags(a);
    }

    fn inst_rrd(&mut self) {
        let hl = self.regs.hl();
        let t = self.mem.get(hl);
        self.mem.set(hl, ((t >> 4) & 0x0f) | ((self.regs.a << 4) & 0xf0));
        self.regs.a = (self.regs.a & 0xf0) | (t & 0x0f);
        let a = self.regs.a;
        self.shift_flags(a);
    }

    /// LDI/LDD. X and Y come from the low bits of copied byte + A.
    fn block_move(&mut self, up: bool) {
        let hl = self.regs.hl();
        let de = self.regs.de();
        let byte = self.mem.get(hl);
        self.mem.set(de, byte);
        let t = byte.wrapping_add(self.regs.a);
        if up {
            self.regs.set_hl(hl.wrapping_add(1));
            self.regs.set_de(de.wrapping_add(1));
        } else {
            self.regs.set_hl(hl.wrapping_sub(1));
            self.regs.set_de(de.wrapping_sub(1));
        }
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);
        self.regs.flags.y = t & 0x02 != 0;
        self.regs.flags.h = false;
        self.regs.flags.x = t & 0x08 != 0;
        self.regs.flags.p = bc != 0;
        self.regs.flags.n = false;
    }

    /// CPI/CPD. The carry flag survives; X and Y come from the low bits
    /// of the difference minus the half carry.
    fn block_compare(&mut self, up: bool) {
        let old_c = self.regs.flags.c;
        let hl = self.regs.hl();
        let byte = self.mem.get(hl);
        let diff = self.regs.flags.sub8(self.regs.a, byte, false);
        let t = diff.wrapping_add(self.regs.flags.h as u8);
        if up {
            self.regs.set_hl(hl.wrapping_add(1));
        } else {
            self.regs.set_hl(hl.wrapping_sub(1));
        }
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);
        self.regs.flags.y = t & 0x02 != 0;
        self.regs.flags.x = t & 0x08 != 0;
        self.regs.flags.p = bc != 0;
        self.regs.flags.c = old_c;
    }

    /// The repeating block forms re-execute themselves by stepping PC
    /// back over the two opcode bytes.
    fn repeat_block(&mut self) {
        self.regs.pc = self.regs.pc.wrapping_sub(2);
    }

    // The port I/O block instructions move no real data, but their
    // register and flag side effects are faithfully strange.

    fn inst_ini(&mut self) {
        let hl = self.regs.hl();
        self.mem.set(hl, 0);
        self.regs.set_hl(hl.wrapping_add(1));
        let k = self.regs.c.wrapping_add(1) as i32;
        self.in_out_block_flags(0, k);
    }

    fn inst_ind(&mut self) {
        let hl = self.regs.hl();
        self.mem.set(hl, 0);
        self.regs.set_hl(hl.wrapping_sub(1));
        let k = self.regs.c.wrapping_sub(1) as i32;
        self.in_out_block_flags(0, k);
    }

    fn inst_outi(&mut self) {
        let hl = self.regs.hl();
        let byte = self.mem.get(hl);
        self.regs.set_hl(hl.wrapping_add(1));
        let k = byte as i32 + self.regs.l as i32;
        self.in_out_block_flags(byte, k);
    }

    fn inst_outd(&mut self) {
        let hl = self.regs.hl();
        let byte = self.mem.get(hl);
        self.regs.set_hl(hl.wrapping_sub(1));
        let k = byte as i32 + self.regs.l as i32;
        self.in_out_block_flags(byte, k);
    }

    fn in_out_block_flags(&mut self, byte: u8, k: i32) {
        let new_n = byte & 0x80 != 0;
        let new_c = k > 255;
        let new_p = parity(((k & 7) as u8) ^ self.regs.b);
        self.regs.b = self.regs.flags.sub8(self.regs.b, 1, false);
        self.regs.flags.c = new_c;
        self.regs.flags.n = new_n;
        self.regs.flags.p = new_p;
        self.regs.flags.h = new_c;
    }

    /// The whole CB plane: shifts, rotates, BIT, RES, and SET. Under an
    /// index prefix the memory operand is always indexed, and the result
    /// is also written to the register named by the low operand field,
    /// reproducing the undocumented double write.
    fn inst_cb(&mut self) {
        let r = self.opcode2 & 0x07;
        let (op1, op2): (Operand, Option<Operand>) = if self.prefix != IndexPrefix::None {
            let op1 = self.operand8(6, 0);
            let op2 = if r == 6 { None } else { Some(self.operand8(r, 6)) };
            (op1, op2)
        } else {
            (self.operand8(r, 0), None)
        };
        let mut byte = self.read_operand(op1);
        match self.opcode2 & 0xc0 {
            0x00 => {
                match self.opcode2 & 0x38 {
                    0x00 => {
                        // RLC
                        self.regs.flags.c = byte & 0x80 != 0;
                        byte = byte.rotate_left(1);
                    }
                    0x08 => {
                        // RRC
                        self.regs.flags.c = byte & 0x01 != 0;
                        byte = byte.rotate_right(1);
                    }
                    0x10 => {
                        // RL: 9-bit rotate through carry
                        let high = byte & 0x80 != 0;
                        byte = (byte << 1) | self.regs.flags.c as u8;
                        self.regs.flags.c = high;
                    }
                    0x18 => {
                        // RR
                        let low = byte & 0x01 != 0;
                        byte = (byte >> 1) | if self.regs.flags.c { 0x80 } else { 0x00 };
                        self.regs.flags.c = low;
                    }
                    0x20 => {
                        // SLA
                        self.regs.flags.c = byte & 0x80 != 0;
                        byte <<= 1;
                    }
                    0x28 => {
                        // SRA: the sign bit is preserved
                        let sign = byte & 0x80;
                        self.regs.flags.c = byte & 0x01 != 0;
                        byte = (byte >> 1) | sign;
                    }
                    0x30 => {
                        // SLL: undocumented, shifts in a one
                        self.regs.flags.c = byte & 0x80 != 0;
                        byte = (byte << 1) | 0x01;
                    }
                    _ => {
                        // SRL
                        self.regs.flags.c = byte & 0x01 != 0;
                        byte >>= 1;
                    }
                }
                self.shift_flags(byte);
            }
            0x40 => {
                // BIT modifies no operand
                byte &= 1 << ((self.opcode2 >> 3) & 0x07);
                self.regs.flags.n = false;
                self.regs.flags.z = byte == 0;
                self.regs.flags.p = byte == 0;
                self.regs.flags.h = true;
                self.regs.flags.s = byte & 0x80 != 0;
                // X and Y have complicated rules here: the memory forms
                // take them from the internal address latch
                if r == 6 {
                    self.regs.flags.x = self.internal & 0x0800 != 0;
                    self.regs.flags.y = self.internal & 0x2000 != 0;
                } else {
                    self.regs.flags.x = byte & 0x08 != 0;
                    self.regs.flags.y = byte & 0x20 != 0;
                }
                return;
            }
            0x80 => byte &= !(1 << ((self.opcode2 >> 3) & 0x07)),
            _ => byte |= 1 << ((self.opcode2 >> 3) & 0x07),
        }
        self.write_operand(op1, byte);
        if let Some(op2) = op2 {
            self.write_operand(op2, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Signal;

    fn run(program: &[u8], steps: usize) -> Cpu {
        let mut cpu = Cpu::new();
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.set(0x0100 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        for _ in 0..steps {
            cpu.step();
        }
        cpu
    }

    #[test]
    fn ld_a_and_halt() {
        let cpu = run(&[0x3e, 0x42, 0x76], 1);
        assert_eq!(cpu.regs.a, 0x42);
        assert_eq!(cpu.regs.pc, 0x0102);
    }

    #[test]
    fn parity_after_logic_ops() {
        // LD A,0x03; AND 0xff -> two bits set, even parity
        let cpu = run(&[0x3e, 0x03, 0xe6, 0xff], 2);
        assert!(cpu.regs.flags.p);
        assert!(cpu.regs.flags.h);
        assert!(!cpu.regs.flags.c);
        // LD A,0x07; XOR 0x00 -> three bits, odd parity
        let cpu = run(&[0x3e, 0x07, 0xee, 0x00], 2);
        assert!(!cpu.regs.flags.p);
        assert!(!cpu.regs.flags.h);
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        // LD A,0x15; ADD A,0x27; DAA -> 0x42
        let cpu = run(&[0x3e, 0x15, 0xc6, 0x27, 0x27], 3);
        assert_eq!(cpu.regs.a, 0x42);
        assert!(!cpu.regs.flags.c);
        // LD A,0x99; ADD A,0x01; DAA -> 0x00, carry
        let cpu = run(&[0x3e, 0x99, 0xc6, 0x01, 0x27], 3);
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.flags.c);
        assert!(cpu.regs.flags.z);
    }

    #[test]
    fn ldir_copies_and_clears_parity() {
        // LD HL,0x0200; LD DE,0x0300; LD BC,0x0004; LDIR
        let mut cpu = Cpu::new();
        let program = [0x21, 0x00, 0x02, 0x11, 0x00, 0x03, 0x01, 0x04, 0x00, 0xed, 0xb0];
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.set(0x0100 + i as u16, b);
        }
        for (i, b) in [0xde, 0xad, 0xbe, 0xef].into_iter().enumerate() {
            cpu.mem.set(0x0200 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        for _ in 0..3 + 4 {
            cpu.step();
        }
        assert_eq!(cpu.regs.bc(), 0);
        assert_eq!(cpu.regs.hl(), 0x0204);
        assert_eq!(cpu.regs.de(), 0x0304);
        assert!(!cpu.regs.flags.p);
        assert_eq!(cpu.mem.slice(0x0300, 4), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn cpir_stops_on_match() {
        // LD A,0xbe; LD HL,0x0200; LD BC,0x0010; CPIR
        let mut cpu = Cpu::new();
        let program = [0x3e, 0xbe, 0x21, 0x00, 0x02, 0x01, 0x10, 0x00, 0xed, 0xb1];
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.set(0x0100 + i as u16, b);
        }
        for (i, b) in [0xde, 0xad, 0xbe, 0xef].into_iter().enumerate() {
            cpu.mem.set(0x0200 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        for _ in 0..3 + 3 {
            cpu.step();
        }
        assert!(cpu.regs.flags.z);
        assert_eq!(cpu.regs.hl(), 0x0203);
        assert_eq!(cpu.regs.bc(), 0x000d);
    }

    #[test]
    fn bit_on_indexed_memory_takes_xy_from_the_address() {
        // LD IX,0x2020; BIT 0,(IX+0) with memory zeroed
        let cpu = run(&[0xdd, 0x21, 0x20, 0x20, 0xdd, 0xcb, 0x00, 0x46], 2);
        assert!(cpu.regs.flags.z);
        assert!(cpu.regs.flags.h);
        // effective address 0x2020: bit 11 clear, bit 13 set
        assert!(!cpu.regs.flags.x);
        assert!(cpu.regs.flags.y);
    }

    #[test]
    fn bit_on_hl_memory_takes_xy_from_the_address() {
        // LD HL,0x2020; BIT 0,(HL) with memory zeroed
        let cpu = run(&[0x21, 0x20, 0x20, 0xcb, 0x46], 2);
        assert!(cpu.regs.flags.z);
        assert!(cpu.regs.flags.h);
        // the latched address 0x2020: bit 11 clear, bit 13 set
        assert!(!cpu.regs.flags.x);
        assert!(cpu.regs.flags.y);
    }

    #[test]
    fn ini_flags_follow_the_incremented_port_register() {
        // LD HL,0x0200; LD BC,0x0210; INI
        let cpu = run(&[0x21, 0x00, 0x02, 0x01, 0x10, 0x02, 0xed, 0xa2], 3);
        assert_eq!(cpu.mem.get(0x0200), 0x00);
        assert_eq!(cpu.regs.hl(), 0x0201);
        assert_eq!(cpu.regs.b, 0x01);
        // ((C+1) & 7) ^ B = 1 ^ 2 = 3, two bits set
        assert!(cpu.regs.flags.p);
        assert!(!cpu.regs.flags.c);
        assert!(!cpu.regs.flags.n);
    }

    #[test]
    fn ind_flags_follow_the_decremented_port_register() {
        // LD HL,0x0200; LD BC,0x0209; IND
        let cpu = run(&[0x21, 0x00, 0x02, 0x01, 0x09, 0x02, 0xed, 0xaa], 3);
        assert_eq!(cpu.mem.get(0x0200), 0x00);
        assert_eq!(cpu.regs.hl(), 0x01ff);
        assert_eq!(cpu.regs.b, 0x01);
        // ((C-1) & 7) ^ B = 0 ^ 2 = 2, one bit set
        assert!(!cpu.regs.flags.p);
    }

    #[test]
    fn indexed_res_also_writes_the_named_register() {
        // LD IX,0x0200; SET 7,(IX+1),B (undocumented double write)
        let mut cpu = Cpu::new();
        let program = [0xdd, 0x21, 0x00, 0x02, 0xdd, 0xcb, 0x01, 0xf8];
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.set(0x0100 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.mem.get(0x0201), 0x80);
        assert_eq!(cpu.regs.b, 0x80);
    }

    #[test]
    fn ret_inside_magic_range_raises_the_trap() {
        let mut cpu = Cpu::new();
        cpu.mem.set(0xffed, 0xc9);
        cpu.regs.pc = 0xffed;
        cpu.regs.sp = 0xfe00;
        match cpu.step() {
            Signal::OsCall(slot) => assert_eq!(slot, 0),
            Signal::Ok => panic!("expected the magic trap to fire"),
        }
    }

    #[test]
    fn push_pop_af_round_trips_flags() {
        // SCF; PUSH AF; POP BC
        let mut cpu = run(&[0x37, 0xf5, 0xc1], 0);
        cpu.regs.sp = 0xfe00;
        cpu.regs.a = 0x5a;
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.regs.b, 0x5a);
        assert_eq!(cpu.regs.c & 0x01, 0x01);
    }

    #[test]
    fn rst_pushes_and_vectors() {
        let mut cpu = run(&[0xdf], 0); // RST 0x18
        cpu.regs.sp = 0xfe00;
        cpu.step();
        assert_eq!(cpu.regs.pc, 0x0018);
        assert_eq!(cpu.mem.get_word(0xfdfe), 0x0101);
    }

    #[test]
    fn in_a_reads_zero_and_out_is_discarded() {
        let cpu = run(&[0x3e, 0x55, 0xd3, 0x10, 0xdb, 0x10], 3);
        assert_eq!(cpu.regs.a, 0x00);
    }
}
