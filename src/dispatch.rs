// Instruction descriptors and the dispatch planes. Every opcode byte maps
// to a handler identity plus operand-fetch flags; the tables are built at
// compile time. The DD/FD planes are not materialized: an active index
// prefix reroutes operand decoding (H/L to IXH/IXL, (HL) to (IX+d)), which
// is exactly the substitution that would generate them. The ED plane has
// its own table because it ignores prefixes and has non-uniform operands;
// the CB plane is eleven closely related instructions and is decoded by a
// single handler.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// Indexed addressing: fetch a displacement byte when a DD/FD
        /// prefix is active.
        const DISP = 0b001;
        /// Fetch one operand byte.
        const IMM8 = 0b010;
        /// Fetch an operand word (low byte first).
        const IMM16 = 0b100;
    }
}

/// One handler per mnemonic. The base plane mostly carries the 8080
/// subset, the ED-plane handlers follow below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    NOP,
    LXI,
    STAX,
    LDAX,
    STA,
    LDA,
    SHLD,
    LHLD,
    JR,
    JRCC,
    DJNZ,
    EXAF,
    SCF,
    CCF,
    HALT,
    CPL,
    RLA,
    RLCA,
    RRA,
    RRCA,
    MOV,
    MVI,
    INR,
    INX,
    DCR,
    DCX,
    DAD,
    DAA,
    ADD,
    ADI,
    ADC,
    ACI,
    SUB,
    SUI,
    SBC,
    SBI,
    CMP,
    CMPI,
    JP,
    JPCC,
    RET,
    RETCC,
    CALL,
    CALLCC,
    RST,
    PUSH,
    POP,
    EXX,
    XCHG,
    XTHL,
    PCHL,
    SPHL,
    AND,
    ANI,
    OR,
    ORI,
    XOR,
    XRI,
    INA,
    OUTA,
    EI,
    DI,
    CB,
    // ED plane
    INRC,
    OUTCR,
    ADCHL,
    SBCHL,
    LRRD,
    SRRD,
    NEG,
    RETN,
    IM,
    LDAI,
    LDIA,
    LDAR,
    LDRA,
    RLD,
    RRD,
    LDI,
    LDIR,
    LDD,
    LDDR,
    CPI,
    CPIR,
    CPD,
    CPDR,
    INI,
    INIR,
    IND,
    INDR,
    OUTI,
    OTIR,
    OUTD,
    OTDR,
}

#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub handler: Handler,
    pub flags: OpFlags,
}

/// Index prefix in effect for the current instruction. A later DD or FD
/// byte overrides an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPrefix {
    #[default]
    None,
    Ix,
    Iy,
}

/// The seven dispatch planes, used to attribute instruction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Base,
    Cb,
    Ed,
    DdBase,
    FdBase,
    DdCb,
    FdCb,
}

pub const PLANE_COUNT: usize = 7;

const fn d(handler: Handler, flags: OpFlags) -> Descriptor {
    Descriptor { handler, flags }
}

const fn base_descriptor(op: u8) -> Descriptor {
    use Handler::*;
    match op {
        0x00 => d(NOP, OpFlags::empty()),
        0x01 | 0x11 | 0x21 | 0x31 => d(LXI, OpFlags::IMM16),
        0x02 | 0x12 => d(STAX, OpFlags::empty()),
        0x03 | 0x13 | 0x23 | 0x33 => d(INX, OpFlags::empty()),
        0x34 => d(INR, OpFlags::DISP),
        0x04 | 0x0c | 0x14 | 0x1c | 0x24 | 0x2c | 0x3c => d(INR, OpFlags::empty()),
        0x35 => d(DCR, OpFlags::DISP),
        0x05 | 0x0d | 0x15 | 0x1d | 0x25 | 0x2d | 0x3d => d(DCR, OpFlags::empty()),
        0x36 => d(MVI, OpFlags::DISP.union(OpFlags::IMM8)),
        0x06 | 0x0e | 0x16 | 0x1e | 0x26 | 0x2e | 0x3e => d(MVI, OpFlags::IMM8),
        0x07 => d(RLCA, OpFlags::empty()),
        0x08 => d(EXAF, OpFlags::empty()),
        0x09 | 0x19 | 0x29 | 0x39 => d(DAD, OpFlags::empty()),
        0x0a | 0x1a => d(LDAX, OpFlags::empty()),
        0x0b | 0x1b | 0x2b | 0x3b => d(DCX, OpFlags::empty()),
        0x0f => d(RRCA, OpFlags::empty()),
        0x10 => d(DJNZ, OpFlags::IMM8),
        0x17 => d(RLA, OpFlags::empty()),
        0x18 => d(JR, OpFlags::IMM8),
        0x1f => d(RRA, OpFlags::empty()),
        0x20 | 0x28 | 0x30 | 0x38 => d(JRCC, OpFlags::IMM8),
        0x22 => d(SHLD, OpFlags::IMM16),
        0x27 => d(DAA, OpFlags::empty()),
        0x2a => d(LHLD, OpFlags::IMM16),
        0x2f => d(CPL, OpFlags::empty()),
        0x32 => d(STA, OpFlags::IMM16),
        0x37 => d(SCF, OpFlags::empty()),
        0x3a => d(LDA, OpFlags::IMM16),
        0x3f => d(CCF, OpFlags::empty()),
        0x76 => d(HALT, OpFlags::empty()),
        // MOV forms touching (HL) take a displacement under a prefix
        0x46 | 0x4e | 0x56 | 0x5e | 0x66 | 0x6e | 0x7e => d(MOV, OpFlags::DISP),
        0x70..=0x75 | 0x77 => d(MOV, OpFlags::DISP),
        0x40..=0x7f => d(MOV, OpFlags::empty()),
        0x86 => d(ADD, OpFlags::DISP),
        0x80..=0x87 => d(ADD, OpFlags::empty()),
        0x8e => d(ADC, OpFlags::DISP),
        0x88..=0x8f => d(ADC, OpFlags::empty()),
        0x96 => d(SUB, OpFlags::DISP),
        0x90..=0x97 => d(SUB, OpFlags::empty()),
        0x9e => d(SBC, OpFlags::DISP),
        0x98..=0x9f => d(SBC, OpFlags::empty()),
        0xa6 => d(AND, OpFlags::DISP),
        0xa0..=0xa7 => d(AND, OpFlags::empty()),
        0xae => d(XOR, OpFlags::DISP),
        0xa8..=0xaf => d(XOR, OpFlags::empty()),
        0xb6 => d(OR, OpFlags::DISP),
        0xb0..=0xb7 => d(OR, OpFlags::empty()),
        0xbe => d(CMP, OpFlags::DISP),
        0xb8..=0xbf => d(CMP, OpFlags::empty()),
        0xc0 | 0xc8 | 0xd0 | 0xd8 | 0xe0 | 0xe8 | 0xf0 | 0xf8 => d(RETCC, OpFlags::empty()),
        0xc1 | 0xd1 | 0xe1 | 0xf1 => d(POP, OpFlags::empty()),
        0xc2 | 0xca | 0xd2 | 0xda | 0xe2 | 0xea | 0xf2 | 0xfa => d(JPCC, OpFlags::IMM16),
        0xc3 => d(JP, OpFlags::IMM16),
        0xc4 | 0xcc | 0xd4 | 0xdc | 0xe4 | 0xec | 0xf4 | 0xfc => d(CALLCC, OpFlags::IMM16),
        0xc5 | 0xd5 | 0xe5 | 0xf5 => d(PUSH, OpFlags::empty()),
        0xc6 => d(ADI, OpFlags::IMM8),
        0xc7 | 0xcf | 0xd7 | 0xdf | 0xe7 | 0xef | 0xf7 | 0xff => d(RST, OpFlags::empty()),
        0xc9 => d(RET, OpFlags::empty()),
        0xcb => d(CB, OpFlags::DISP),
        0xcd => d(CALL, OpFlags::IMM16),
        0xce => d(ACI, OpFlags::IMM8),
        0xd3 => d(OUTA, OpFlags::IMM8),
        0xd6 => d(SUI, OpFlags::IMM8),
        0xd9 => d(EXX, OpFlags::empty()),
        0xdb => d(INA, OpFlags::IMM8),
        0xde => d(SBI, OpFlags::IMM8),
        0xe3 => d(XTHL, OpFlags::empty()),
        0xe6 => d(ANI, OpFlags::IMM8),
        0xe9 => d(PCHL, OpFlags::empty()),
        0xeb => d(XCHG, OpFlags::empty()),
        0xee => d(XRI, OpFlags::IMM8),
        0xf3 => d(DI, OpFlags::empty()),
        0xf6 => d(ORI, OpFlags::IMM8),
        0xf9 => d(SPHL, OpFlags::empty()),
        0xfb => d(EI, OpFlags::empty()),
        0xfe => d(CMPI, OpFlags::IMM8),
        // 0xdd/0xfd are consumed by the prefix collapse, 0xed selects the
        // ED plane before the table is consulted; these slots never
        // dispatch.
        0xdd | 0xed | 0xfd => d(NOP, OpFlags::empty()),
    }
}

const fn ed_descriptor(op: u8) -> Descriptor {
    use Handler::*;
    match op {
        0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x70 | 0x78 => d(INRC, OpFlags::empty()),
        0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x71 | 0x79 => d(OUTCR, OpFlags::empty()),
        0x42 | 0x52 | 0x62 | 0x72 => d(SBCHL, OpFlags::empty()),
        0x43 | 0x53 | 0x63 | 0x73 => d(SRRD, OpFlags::IMM16),
        0x44 | 0x4c | 0x54 | 0x5c | 0x64 | 0x6c | 0x74 | 0x7c => d(NEG, OpFlags::empty()),
        0x45 | 0x4d | 0x55 | 0x5d | 0x65 | 0x6d | 0x75 | 0x7d => d(RETN, OpFlags::empty()),
        0x46 | 0x4e | 0x56 | 0x5e | 0x66 | 0x6e | 0x76 | 0x7e => d(IM, OpFlags::empty()),
        0x47 => d(LDIA, OpFlags::empty()),
        0x4a | 0x5a | 0x6a | 0x7a => d(ADCHL, OpFlags::empty()),
        0x4b | 0x5b | 0x6b | 0x7b => d(LRRD, OpFlags::IMM16),
        0x4f => d(LDRA, OpFlags::empty()),
        0x57 => d(LDAI, OpFlags::empty()),
        0x5f => d(LDAR, OpFlags::empty()),
        0x67 => d(RRD, OpFlags::empty()),
        0x6f => d(RLD, OpFlags::empty()),
        0xa0 => d(LDI, OpFlags::empty()),
        0xa1 => d(CPI, OpFlags::empty()),
        0xa2 => d(INI, OpFlags::empty()),
        0xa3 => d(OUTI, OpFlags::empty()),
        0xa8 => d(LDD, OpFlags::empty()),
        0xa9 => d(CPD, OpFlags::empty()),
        0xaa => d(IND, OpFlags::empty()),
        0xab => d(OUTD, OpFlags::empty()),
        0xb0 => d(LDIR, OpFlags::empty()),
        0xb1 => d(CPIR, OpFlags::empty()),
        0xb2 => d(INIR, OpFlags::empty()),
        0xb3 => d(OTIR, OpFlags::empty()),
        0xb8 => d(LDDR, OpFlags::empty()),
        0xb9 => d(CPDR, OpFlags::empty()),
        0xba => d(INDR, OpFlags::empty()),
        0xbb => d(OTDR, OpFlags::empty()),
        // everything else in the ED plane behaves as NOP
        _ => d(NOP, OpFlags::empty()),
    }
}

const fn build_plane(ed: bool) -> [Descriptor; 256] {
    let mut table = [d(Handler::NOP, OpFlags::empty()); 256];
    let mut op = 0;
    while op < 256 {
        table[op] = if ed { ed_descriptor(op as u8) } else { base_descriptor(op as u8) };
        op += 1;
    }
    table
}

pub static BASE_PLANE: [Descriptor; 256] = build_plane(false);
pub static ED_PLANE: [Descriptor; 256] = build_plane(true);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_plane_spot_checks() {
        assert_eq!(BASE_PLANE[0xc9].handler, Handler::RET);
        assert_eq!(BASE_PLANE[0xcd].handler, Handler::CALL);
        assert_eq!(BASE_PLANE[0xcd].flags, OpFlags::IMM16);
        assert_eq!(BASE_PLANE[0x76].handler, Handler::HALT);
        assert_eq!(BASE_PLANE[0x36].flags, OpFlags::DISP | OpFlags::IMM8);
        assert_eq!(BASE_PLANE[0x41].handler, Handler::MOV);
        assert_eq!(BASE_PLANE[0x7e].flags, OpFlags::DISP);
        assert_eq!(BASE_PLANE[0xcb].handler, Handler::CB);
    }

    #[test]
    fn ed_plane_spot_checks() {
        assert_eq!(ED_PLANE[0xb0].handler, Handler::LDIR);
        assert_eq!(ED_PLANE[0x44].handler, Handler::NEG);
        assert_eq!(ED_PLANE[0x4b].flags, OpFlags::IMM16);
        assert_eq!(ED_PLANE[0x00].handler, Handler::NOP);
        assert_eq!(ED_PLANE[0xff].handler, Handler::NOP);
        assert_eq!(ED_PLANE[0x5f].handler, Handler::LDAR);
    }

    #[test]
    fn every_memory_form_in_the_base_plane_fetches_a_displacement() {
        // all opcodes whose r/m field addresses (HL) must carry the
        // displacement flag so indexed forms decode correctly
        for op in 0x40..=0xbfu16 {
            let op = op as u8;
            if op == 0x76 {
                continue;
            }
            let uses_mem = (op & 0x07) == 6 || (op >= 0x40 && op < 0x80 && (op >> 3) & 0x07 == 6);
            assert_eq!(
                BASE_PLANE[op as usize].flags.contains(OpFlags::DISP),
                uses_mem,
                "opcode {op:#04x}"
            );
        }
    }
}
