// The CPU proper: the fetch/decode cycle and the addressing helpers the
// instruction handlers share. One call to step() executes exactly one
// instruction (including all of its prefixes) and reports whether the
// instruction was a RET executing inside the magic address range, which
// the run loop turns into an OS service call.

use log::info;

use crate::charset::dump_char;
use crate::dispatch::{
    Descriptor, IndexPrefix, OpFlags, Plane, BASE_PLANE, ED_PLANE, PLANE_COUNT,
};
use crate::memory::{Memory, MAGIC_ADDRESS};
use crate::registers::Registers;

/// Result of executing a single instruction.
pub enum Signal {
    Ok,
    /// A RET was fetched from MAGIC_ADDRESS + slot; the OS host must
    /// service the slot before the RET completes.
    OsCall(usize),
}

/// Per-plane instruction execution counters, allocated only when counter
/// logging is enabled.
pub struct Counters {
    counts: [[u64; 256]; PLANE_COUNT],
}

impl Counters {
    pub fn new() -> Box<Self> {
        Box::new(Counters { counts: [[0; 256]; PLANE_COUNT] })
    }

    fn bump(&mut self, plane: Plane, opcode: u8) {
        self.counts[plane as usize][opcode as usize] += 1;
    }

    pub fn log_summary(&self) {
        static NAMES: [&str; PLANE_COUNT] =
            ["base", "cb", "ed", "dd base", "fd base", "dd cb", "fd cb"];
        for (plane, counts) in self.counts.iter().enumerate() {
            let total: u64 = counts.iter().sum();
            if total == 0 {
                continue;
            }
            info!("instruction counters, {} plane ({} executed):", NAMES[plane], total);
            for (op, &n) in counts.iter().enumerate() {
                if n != 0 {
                    info!("  {:02x}: {}", op, n);
                }
            }
        }
    }
}

/// Register or memory location named by a 3-bit operand field.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    IXH,
    IXL,
    IYH,
    IYL,
    Mem(u16),
}

pub struct Cpu {
    pub regs: Registers,
    pub mem: Memory,
    /// The internal address latch; its high byte leaks into the X/Y flags
    /// of BIT b,(HL) and the indexed BIT forms.
    pub internal: u16,
    pub prefix: IndexPrefix,
    pub opcode: u8,
    pub opcode2: u8,
    pub op_low: u8,
    pub op_high: u8,
    pub disp: u8,
    /// Address the current instruction (including prefixes) was fetched
    /// from; the magic-address trap keys on it.
    pub current_instruction: u16,
    pub counters: Option<Box<Counters>>,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            regs: Registers::new(),
            mem: Memory::new(),
            internal: 0,
            prefix: IndexPrefix::None,
            opcode: 0,
            opcode2: 0,
            op_low: 0,
            op_high: 0,
            disp: 0,
            current_instruction: 0,
            counters: None,
        }
    }

    /// Operand/displacement fetch.
    pub fn fetch(&mut self) -> u8 {
        let byte = self.mem.get(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        byte
    }

    /// Opcode/prefix fetch; increases R.
    pub fn fetch_m1(&mut self) -> u8 {
        let byte = self.fetch();
        self.regs.bump_r();
        byte
    }

    pub fn pop(&mut self) -> u16 {
        let mut word = self.mem.get(self.regs.sp) as u16;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        word |= (self.mem.get(self.regs.sp) as u16) << 8;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        word
    }

    pub fn push(&mut self, word: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.mem.set(self.regs.sp, (word >> 8) as u8);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.mem.set(self.regs.sp, (word & 0xff) as u8);
    }

    /// Fetch, decode, and execute one instruction.
    pub fn step(&mut self) -> Signal {
        self.current_instruction = self.regs.pc;
        // prefix-collapsing fetch: a later prefix overrides an earlier one
        self.prefix = IndexPrefix::None;
        loop {
            self.opcode = self.fetch_m1();
            match self.opcode {
                0xdd => self.prefix = IndexPrefix::Ix,
                0xfd => self.prefix = IndexPrefix::Iy,
                _ => break,
            }
        }
        let mut descriptor: Descriptor = BASE_PLANE[self.opcode as usize];
        // indexed forms carry their displacement right after the opcode
        // (for CB-prefixed forms: before the second opcode byte)
        if self.prefix != IndexPrefix::None && descriptor.flags.contains(OpFlags::DISP) {
            self.disp = self.fetch();
        }
        if self.opcode == 0xcb {
            self.opcode2 =
                if self.prefix != IndexPrefix::None { self.fetch_m1() } else { self.fetch() };
            self.count(
                match self.prefix {
                    IndexPrefix::None => Plane::Cb,
                    IndexPrefix::Ix => Plane::DdCb,
                    IndexPrefix::Iy => Plane::FdCb,
                },
                self.opcode2,
            );
        } else if self.opcode == 0xed {
            // the ED plane ignores index prefixes entirely
            self.opcode2 = self.fetch_m1();
            descriptor = ED_PLANE[self.opcode2 as usize];
            self.count(Plane::Ed, self.opcode2);
        } else {
            self.count(
                match self.prefix {
                    IndexPrefix::None => Plane::Base,
                    IndexPrefix::Ix => Plane::DdBase,
                    IndexPrefix::Iy => Plane::FdBase,
                },
                self.opcode,
            );
        }
        if descriptor.flags.contains(OpFlags::IMM8) {
            self.op_low = self.fetch();
        }
        if descriptor.flags.contains(OpFlags::IMM16) {
            self.op_low = self.fetch();
            self.op_high = self.fetch();
        }
        self.execute(descriptor.handler)
    }

    fn count(&mut self, plane: Plane, opcode: u8) {
        if let Some(counters) = self.counters.as_mut() {
            counters.bump(plane, opcode);
        }
    }

    pub fn op_word(&self) -> u16 {
        ((self.op_high as u16) << 8) | self.op_low as u16
    }

    /// Resolve an 8-bit register/memory operand field
    /// (0=b, 1=c, 2=d, 3=e, 4=h/ixh/iyh, 5=l/ixl/iyl,
    /// 6=(hl)/(ix+d)/(iy+d), 7=a). `alt` is the other operand field of the
    /// same opcode, or 0 if there is none: when it names (HL), the H and L
    /// fields stay on the main bank even under an index prefix.
    pub fn operand8(&mut self, n: u8, alt: u8) -> Operand {
        match n {
            0 => Operand::B,
            1 => Operand::C,
            2 => Operand::D,
            3 => Operand::E,
            4 => {
                if alt == 6 {
                    Operand::H
                } else {
                    match self.prefix {
                        IndexPrefix::Ix => Operand::IXH,
                        IndexPrefix::Iy => Operand::IYH,
                        IndexPrefix::None => Operand::H,
                    }
                }
            }
            5 => {
                if alt == 6 {
                    Operand::L
                } else {
                    match self.prefix {
                        IndexPrefix::Ix => Operand::IXL,
                        IndexPrefix::Iy => Operand::IYL,
                        IndexPrefix::None => Operand::L,
                    }
                }
            }
            6 => match self.prefix {
                IndexPrefix::Ix => {
                    let offset = self.disp as i8 as i16 as u16;
                    self.internal = self.regs.ix().wrapping_add(offset);
                    Operand::Mem(self.internal)
                }
                IndexPrefix::Iy => {
                    let offset = self.disp as i8 as i16 as u16;
                    self.internal = self.regs.iy().wrapping_add(offset);
                    Operand::Mem(self.internal)
                }
                IndexPrefix::None => {
                    // the latch follows plain (HL) accesses too, so
                    // BIT b,(HL) sees the address in its X/Y flags
                    self.internal = self.regs.hl();
                    Operand::Mem(self.internal)
                }
            },
            _ => Operand::A,
        }
    }

    /// Like operand8(), but for IN r,(C)/OUT (C),r: prefixes do not apply
    /// and field 6 names no operand at all.
    pub fn io_operand(&self, n: u8) -> Option<Operand> {
        match n {
            0 => Some(Operand::B),
            1 => Some(Operand::C),
            2 => Some(Operand::D),
            3 => Some(Operand::E),
            4 => Some(Operand::H),
            5 => Some(Operand::L),
            6 => None,
            _ => Some(Operand::A),
        }
    }

    pub fn read_operand(&self, operand: Operand) -> u8 {
        match operand {
            Operand::A => self.regs.a,
            Operand::B => self.regs.b,
            Operand::C => self.regs.c,
            Operand::D => self.regs.d,
            Operand::E => self.regs.e,
            Operand::H => self.regs.h,
            Operand::L => self.regs.l,
            Operand::IXH => self.regs.ixh,
            Operand::IXL => self.regs.ixl,
            Operand::IYH => self.regs.iyh,
            Operand::IYL => self.regs.iyl,
            Operand::Mem(address) => self.mem.get(address),
        }
    }

    pub fn write_operand(&mut self, operand: Operand, value: u8) {
        match operand {
            Operand::A => self.regs.a = value,
            Operand::B => self.regs.b = value,
            Operand::C => self.regs.c = value,
            Operand::D => self.regs.d = value,
            Operand::E => self.regs.e = value,
            Operand::H => self.regs.h = value,
            Operand::L => self.regs.l = value,
            Operand::IXH => self.regs.ixh = value,
            Operand::IXL => self.regs.ixl = value,
            Operand::IYH => self.regs.iyh = value,
            Operand::IYL => self.regs.iyl = value,
            Operand::Mem(address) => self.mem.set(address, value),
        }
    }

    /// The magic-address trap: true when the current instruction was
    /// fetched from the sentinel range at the top of memory.
    pub fn in_magic_range(&self) -> bool {
        self.current_instruction >= MAGIC_ADDRESS
    }

    /// Write the register state and a full memory dump to the log.
    pub fn dump_machine(&self, label: &str) {
        let r = &self.regs;
        info!("start of {} machine dump", label);
        info!(
            "a={:02x} f={} bc={:04x} de={:04x} hl={:04x}",
            r.a,
            flag_string(r.flags.to_byte()),
            r.bc(),
            r.de(),
            r.hl()
        );
        info!(
            "a'={:02x} f'={} bc'={:04x} de'={:04x} hl'={:04x}",
            r.alt_a,
            flag_string(r.alt_flags.to_byte()),
            (r.alt_b as u16) << 8 | r.alt_c as u16,
            (r.alt_d as u16) << 8 | r.alt_e as u16,
            (r.alt_h as u16) << 8 | r.alt_l as u16
        );
        info!(
            "ix={:04x} iy={:04x} sp={:04x} pc={:04x} r={:02x} i={:02x}",
            r.ix(),
            r.iy(),
            r.sp,
            r.pc,
            r.r,
            r.i
        );
        info!("interrupts {}", if r.iff { "enabled" } else { "disabled" });
        dump_memory(&self.mem, 0, crate::memory::MEMORY_SIZE);
        info!("end of {} machine dump", label);
    }
}

fn flag_string(f: u8) -> String {
    const NAMES: [char; 8] = ['s', 'z', 'y', 'h', 'x', 'p', 'n', 'c'];
    NAMES
        .iter()
        .enumerate()
        .map(|(i, &name)| if f & (0x80 >> i) != 0 { name } else { '-' })
        .collect()
}

const DUMP_LINE: usize = 8;

/// Hex dump of a section of guest memory to the log; start + length may
/// overlap the end of memory.
pub fn dump_memory(mem: &Memory, start: u16, length: usize) {
    let mut i = 0;
    while i < length {
        let n = DUMP_LINE.min(length - i);
        let mut line = format!("{:04x}:", start.wrapping_add(i as u16));
        for j in 0..DUMP_LINE {
            if j < n {
                line.push_str(&format!(" {:02x}", mem.get(start.wrapping_add((i + j) as u16))));
            } else {
                line.push_str("   ");
            }
        }
        line.push_str(" |");
        for j in 0..DUMP_LINE {
            if j < n {
                line.push(dump_char(mem.get(start.wrapping_add((i + j) as u16))));
            } else {
                line.push(' ');
            }
        }
        line.push('|');
        info!("{}", line);
        i += DUMP_LINE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_with(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new();
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.set(0x0100 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        cpu
    }

    #[test]
    fn refresh_register_counts_prefix_bytes() {
        // DD DD FD 21 34 12: collapsed prefixes, LD IY,0x1234
        let mut cpu = cpu_with(&[0xdd, 0xdd, 0xfd, 0x21, 0x34, 0x12]);
        cpu.step();
        assert_eq!(cpu.regs.r, 4);
        assert_eq!(cpu.regs.iy(), 0x1234);
        assert_eq!(cpu.regs.hl(), 0x0000);
    }

    #[test]
    fn stack_wraps_around_address_zero() {
        let mut cpu = Cpu::new();
        cpu.regs.sp = 0x0001;
        cpu.push(0x1234);
        assert_eq!(cpu.regs.sp, 0xffff);
        assert_eq!(cpu.pop(), 0x1234);
        assert_eq!(cpu.regs.sp, 0x0001);
    }

    #[test]
    fn indexed_operand_latches_internal_register() {
        let mut cpu = cpu_with(&[]);
        cpu.regs.set_ix(0x2000);
        cpu.prefix = IndexPrefix::Ix;
        cpu.disp = 0xfe; // -2
        match cpu.operand8(6, 0) {
            Operand::Mem(address) => assert_eq!(address, 0x1ffe),
            other => panic!("expected memory operand, got {other:?}"),
        }
        assert_eq!(cpu.internal, 0x1ffe);
    }

    #[test]
    fn h_field_stays_on_main_bank_when_other_operand_is_memory() {
        let mut cpu = cpu_with(&[]);
        cpu.prefix = IndexPrefix::Ix;
        assert!(matches!(cpu.operand8(4, 6), Operand::H));
        assert!(matches!(cpu.operand8(4, 0), Operand::IXH));
    }
}
