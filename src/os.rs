// The virtual operating system. A RET executed inside the magic address
// range lands here; slot 0 dispatches on the BDOS function number in C,
// slots 1..17 are the CP/M 2.2 BIOS entries, slot 18 the host delay
// service. The handlers communicate with the guest exclusively through
// its registers and memory, following the CP/M conventions (byte results
// in A mirrored to L, word results in HL mirrored to BA).

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike};
use log::{debug, error, info, trace, warn};

use crate::boot::{DEFAULT_DMA, DMA_SIZE, DRVUSER};
use crate::boot::{ALV, DPB};
use crate::chario::{Console, ReaderDevice, SinkDevice};
use crate::config::Config;
use crate::fcb::{
    is_ambiguous, scan_directory, setup_fcb, unix_name_from_fcb, FileFlags, FileMatch,
    FileRegistry, OpenFile, ID_CHECK, MAX_FILE_SIZE,
};
use crate::memory::{Memory, MEMORY_SIZE};
use crate::processor::Cpu;

const BS: u8 = 0x08;
const HT: u8 = 0x09;
const LF: u8 = 0x0a;
const CR: u8 = 0x0d;
const SPC: u8 = 0x20;

/// Why the emulation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The CPU emulation never ran because of an earlier problem.
    NotRun,
    /// Regular termination by the program (WBOOT or BDOS 0).
    Term,
    /// Terminated by ^C at the start of a console line.
    CtrlC,
    /// The program called the BIOS cold boot entry.
    Boot,
    /// Illegal parameter in a BDOS call.
    BdosArg,
    /// Access to an invalid or unconfigured drive.
    Select,
    /// Write access to a read-only drive.
    RoDisk,
    /// Write access to a read-only file.
    RoFile,
    /// A host system call failed.
    Host,
    /// Error in the guest program logic (stale or exhausted file ids).
    Logic,
    /// A termination signal arrived.
    Signal,
}

impl Reason {
    pub fn is_error(self) -> bool {
        !matches!(self, Reason::NotRun | Reason::Term | Reason::CtrlC)
    }

    pub fn message(self) -> Option<&'static str> {
        match self {
            Reason::NotRun | Reason::Term | Reason::CtrlC => None,
            Reason::Boot => Some("BIOS cold boot entry called"),
            Reason::BdosArg => Some("invalid argument in BDOS call"),
            Reason::Select => Some("access to invalid/unconfigured disk"),
            Reason::RoDisk => Some("attempted write access to read-only disk"),
            Reason::RoFile => Some("attempted write access to read-only file"),
            Reason::Host => Some("host system call failed"),
            Reason::Logic => Some("guest program logic error"),
            Reason::Signal => Some("program execution stopped by signal"),
        }
    }
}

/// Get the sequential record offset from an FCB. Valid offsets run from
/// 0 (start of file) to 65536 (the record just past the last addressable
/// one, valid only as an end marker).
pub fn get_offset(mem: &Memory, fcb: u16) -> Option<u32> {
    let s2 = mem.get(fcb.wrapping_add(14)) as u32;
    let ex = mem.get(fcb.wrapping_add(12)) as u32;
    let cr = mem.get(fcb.wrapping_add(32)) as u32;
    if cr > 127 || ex > 31 || s2 > 16 || (s2 == 16 && (cr != 0 || ex != 0)) {
        None
    } else {
        Some((s2 << 12) | (ex << 7) | cr)
    }
}

/// Store an offset in the range 0..=65536 back into the FCB.
pub fn set_offset(mem: &mut Memory, fcb: u16, offset: u32) {
    mem.set(fcb.wrapping_add(32), (offset & 0x007f) as u8);
    mem.set(fcb.wrapping_add(12), ((offset >> 7) & 0x001f) as u8);
    mem.set(fcb.wrapping_add(14), (offset >> 12) as u8);
}

/// Get the random record number from FCB bytes 33..35; same range as the
/// sequential offset.
fn get_random(mem: &Memory, fcb: u16) -> Option<u32> {
    let r0 = mem.get(fcb.wrapping_add(33)) as u32;
    let r1 = mem.get(fcb.wrapping_add(34)) as u32;
    let r2 = mem.get(fcb.wrapping_add(35)) as u32;
    if r2 > 1 || (r2 == 1 && (r0 != 0 || r1 != 0)) {
        None
    } else {
        Some((r2 << 16) | (r1 << 8) | r0)
    }
}

fn store_random(mem: &mut Memory, fcb: u16, value: u32) {
    mem.set(fcb.wrapping_add(33), (value & 0xff) as u8);
    mem.set(fcb.wrapping_add(34), ((value >> 8) & 0xff) as u8);
    mem.set(fcb.wrapping_add(35), ((value >> 16) & 0xff) as u8);
}

fn store_file_id(mem: &mut Memory, fcb: u16, id: u16) {
    mem.set_word(fcb.wrapping_add(16), id);
    mem.set_word(fcb.wrapping_add(18), id ^ ID_CHECK);
}

/// Byte result: A, mirrored to L, with B and H cleared.
fn byte_result(cpu: &mut Cpu, value: u8) {
    cpu.regs.a = value;
    cpu.regs.l = value;
    cpu.regs.b = 0;
    cpu.regs.h = 0;
}

/// Word result: HL, mirrored to BA.
fn word_result(cpu: &mut Cpu, value: u16) {
    cpu.regs.l = (value & 0xff) as u8;
    cpu.regs.h = (value >> 8) as u8;
    cpu.regs.a = cpu.regs.l;
    cpu.regs.b = cpu.regs.h;
}

/// A calendar timestamp in the guest's format: day 1 is 1978-01-01,
/// hour/minute/second are BCD bytes.
struct CpmTime {
    day: u16,
    hour: u8,
    minute: u8,
    second: u8,
}

fn bcd_byte(value: u32) -> u8 {
    let value = value % 100;
    (((value / 10) << 4) | (value % 10)) as u8
}

fn cpm_time(datetime: DateTime<Local>) -> CpmTime {
    let base = NaiveDate::from_ymd_opt(1978, 1, 1).unwrap();
    let days = (datetime.date_naive() - base).num_days() + 1;
    // out-of-range dates are flagged by day number 0
    let day = if datetime.year() < 1978 || days < 1 || days > 65535 { 0 } else { days as u16 };
    CpmTime {
        day,
        hour: bcd_byte(datetime.hour()),
        minute: bcd_byte(datetime.minute()),
        second: bcd_byte(datetime.second()),
    }
}

fn store_cpm_time(mem: &mut Memory, address: u16, time: &CpmTime) {
    mem.set(address, (time.day & 0xff) as u8);
    mem.set(address.wrapping_add(1), (time.day >> 8) as u8);
    mem.set(address.wrapping_add(2), time.hour);
    mem.set(address.wrapping_add(3), time.minute);
}

pub struct Os {
    drives: [Option<PathBuf>; 16],
    configured_read_only: [bool; 16],
    read_only: [bool; 16],
    default_drive: usize,
    current_drive: usize,
    current_user: u8,
    current_dma: u16,
    files: FileRegistry,
    search_list: VecDeque<FileMatch>,
    console: Console,
    printer: SinkDevice,
    punch: SinkDevice,
    reader: ReaderDevice,
    /// Column the BDOS thinks the cursor is in.
    console_col: usize,
    program_return_code: u16,
    dont_close: bool,
    lines: u8,
    columns: u8,
    termination: Option<Reason>,
}

impl Os {
    pub fn new(config: &Config) -> io::Result<Os> {
        Ok(Os {
            drives: config.drives.clone(),
            configured_read_only: config.read_only,
            read_only: config.read_only,
            default_drive: config.default_drive,
            current_drive: config.default_drive,
            current_user: 0,
            current_dma: DEFAULT_DMA,
            files: FileRegistry::new(),
            search_list: VecDeque::new(),
            console: Console::new()?,
            printer: SinkDevice::new("printer", config.printer.clone(), config.printer_raw),
            punch: SinkDevice::new("punch", config.punch.clone(), config.punch_raw),
            reader: ReaderDevice::new(config.reader.clone(), config.reader_raw),
            console_col: 0,
            program_return_code: 0,
            dont_close: config.dont_close,
            lines: config.lines,
            columns: config.columns,
            termination: None,
        })
    }

    pub fn termination(&self) -> Option<Reason> {
        self.termination
    }

    pub fn terminate(&mut self, reason: Reason) {
        if self.termination.is_none() {
            self.termination = Some(reason);
        }
    }

    pub fn default_drive(&self) -> usize {
        self.default_drive
    }

    pub fn current_user(&self) -> u8 {
        self.current_user
    }

    pub fn poll_console(&mut self) {
        self.console.poll();
    }

    /// Tear everything down; returns false when the run should report
    /// failure to the host environment.
    pub fn finish(&mut self) -> bool {
        let mut ok = true;
        if self.program_return_code != 0 {
            info!("program return code is 0x{:04x}", self.program_return_code);
        }
        // CP/M 3 shades of failure collapse to a plain failed exit
        if self.program_return_code >= 0xff00 {
            ok = false;
        }
        self.files.sweep();
        self.search_list.clear();
        self.console.finish();
        if !self.printer.close() {
            ok = false;
        }
        if !self.punch.close() {
            ok = false;
        }
        if !self.reader.close() {
            ok = false;
        }
        ok
    }

    /// Entry point from the run loop: service the magic slot the guest
    /// landed on.
    pub fn call(&mut self, slot: usize, cpu: &mut Cpu) {
        match slot {
            0 => self.bdos_call(cpu),
            1 => {
                debug!("bios boot entry");
                error!("BIOS cold boot entry called by program");
                self.terminate(Reason::Boot);
            }
            2 => {
                debug!("bios wboot entry");
                self.terminate(Reason::Term);
            }
            3 => {
                cpu.regs.a = if self.console.status() { 0xff } else { 0x00 };
                debug!("bios const: a=0x{:02x}", cpu.regs.a);
            }
            4 => {
                // the high bit is not stripped
                cpu.regs.a = self.console.input();
                debug!("bios conin: a=0x{:02x}", cpu.regs.a);
            }
            5 => {
                debug!("bios conout: c=0x{:02x}", cpu.regs.c);
                self.console.out(cpu.regs.c);
            }
            6 => {
                debug!("bios list: c=0x{:02x}", cpu.regs.c);
                self.printer.out(cpu.regs.c);
            }
            7 => {
                debug!("bios punch: c=0x{:02x}", cpu.regs.c);
                self.punch.out(cpu.regs.c);
            }
            8 => {
                cpu.regs.a = self.reader.input();
                debug!("bios reader: a=0x{:02x}", cpu.regs.a);
            }
            9 => debug!("bios home"),
            10 => {
                // report "no disk parameter header"
                debug!("bios seldsk: c=0x{:02x}", cpu.regs.c);
                cpu.regs.h = 0;
                cpu.regs.l = 0;
            }
            11 => debug!("bios settrk: bc=0x{:04x}", cpu.regs.bc()),
            12 => debug!("bios setsec: bc=0x{:04x}", cpu.regs.bc()),
            13 => debug!("bios setdma: bc=0x{:04x}", cpu.regs.bc()),
            14 | 15 => {
                // sector level disk access always fails
                debug!("bios {}", if slot == 14 { "read" } else { "write" });
                cpu.regs.a = 1;
            }
            16 => {
                cpu.regs.a = if self.printer.status() { 0xff } else { 0x00 };
                debug!("bios listst: a=0x{:02x}", cpu.regs.a);
            }
            17 => {
                // identity sector translation
                debug!("bios sectran: bc=0x{:04x}", cpu.regs.bc());
                cpu.regs.l = cpu.regs.c;
                cpu.regs.h = cpu.regs.b;
            }
            _ => {
                // the 19th slot is the host delay extension
                let milliseconds = cpu.regs.bc() as u64;
                debug!("host delay: bc=0x{:04x}", cpu.regs.bc());
                self.pause(milliseconds);
            }
        }
    }

    fn bdos_call(&mut self, cpu: &mut Cpu) {
        match cpu.regs.c {
            0 => {
                debug!("system reset entry");
                self.terminate(Reason::Term);
            }
            1 => self.bdos_console_input(cpu),
            2 => self.bdos_console_output(cpu),
            3 => self.bdos_reader_input(cpu),
            4 => self.bdos_punch_output(cpu),
            5 => self.bdos_list_output(cpu),
            6 => self.bdos_direct_console_io(cpu),
            7 => self.bdos_get_io_byte(cpu),
            8 => self.bdos_set_io_byte(cpu),
            9 => self.bdos_print_string(cpu),
            10 => self.bdos_read_console_buffer(cpu),
            11 => self.bdos_get_console_status(cpu),
            12 => self.bdos_return_version_number(cpu),
            13 => self.bdos_reset_disk_system(cpu),
            14 => self.bdos_select_disk(cpu),
            15 => self.bdos_open_file(cpu),
            16 => self.bdos_close_file(cpu),
            17 => self.bdos_search_for_first(cpu),
            18 => self.bdos_search_for_next(cpu),
            19 => self.bdos_delete_file(cpu),
            20 => self.bdos_read_sequential(cpu),
            21 => self.bdos_write_sequential(cpu),
            22 => self.bdos_make_file(cpu),
            23 => self.bdos_rename_file(cpu),
            24 => self.bdos_return_log_in_vector(cpu),
            25 => self.bdos_return_current_disk(cpu),
            26 => self.bdos_set_dma_address(cpu),
            27 => self.bdos_get_addr_alloc(cpu),
            28 => self.bdos_write_protect_disk(cpu),
            29 => self.bdos_get_read_only_vector(cpu),
            30 => self.bdos_set_file_attributes(cpu),
            31 => self.bdos_get_addr_diskparams(cpu),
            32 => self.bdos_set_get_user_code(cpu),
            33 => self.bdos_read_random(cpu),
            34 => self.bdos_write_random(cpu),
            35 => self.bdos_compute_file_size(cpu),
            36 => self.bdos_set_random_record(cpu),
            37 => self.bdos_reset_drive(cpu),
            40 => self.bdos_write_random(cpu), // zero fill: sparse host files read back zeros anyway
            49 => self.bdosx_get_set_scb(cpu),
            101 => self.bdosx_return_directory_label_data(cpu),
            102 => self.bdosx_read_file_date_stamps(cpu),
            105 => self.bdosx_get_date_and_time(cpu),
            108 => self.bdosx_get_set_program_return_code(cpu),
            141 => self.bdosx_delay(cpu),
            other => {
                debug!("unsupported BDOS function {} (de=0x{:04x})", other, cpu.regs.de());
                word_result(cpu, 0);
            }
        }
    }

    // console helpers

    fn put_crlf(&mut self) {
        self.console.out(CR);
        self.console.out(LF);
        self.console_col = 0;
    }

    fn put_graph(&mut self, c: u8) {
        self.console.out(c);
        self.console_col += 1;
    }

    /// Output a character, interpreting BS, HT, LF, and CR, keeping the
    /// column counter honest.
    fn put_char(&mut self, c: u8) {
        match c {
            BS => {
                if self.console_col > 0 {
                    self.console.out(c);
                    self.console_col -= 1;
                }
            }
            LF => self.console.out(c),
            HT => {
                let spaces = ((self.console_col / 8) + 1) * 8 - self.console_col;
                for _ in 0..spaces {
                    self.put_graph(SPC);
                }
            }
            CR => {
                self.console.out(c);
                self.console_col = 0;
            }
            _ => self.put_graph(c),
        }
    }

    /// Control characters echo as ^X.
    fn put_ctrl(&mut self, c: u8) {
        if c < SPC {
            self.put_graph(0x5e); // ^
            self.put_graph(c + 0x40);
        } else {
            self.put_graph(c);
        }
    }

    /// Blocking console read with echo of graphical characters and of
    /// BS, TAB, LF, and CR.
    fn get_char(&mut self) -> u8 {
        let c = self.console.input();
        if c < SPC || c == 0x7f {
            if matches!(c, BS | HT | LF | CR) {
                self.put_char(c);
            }
        } else {
            self.put_char(c);
        }
        c
    }

    fn bdos_console_input(&mut self, cpu: &mut Cpu) {
        debug!("console input entry");
        let c = self.get_char();
        byte_result(cpu, c);
        debug!("console input exit: a=0x{:02x}", cpu.regs.a);
    }

    fn bdos_console_output(&mut self, cpu: &mut Cpu) {
        debug!("console output entry: e=0x{:02x}", cpu.regs.e);
        self.put_char(cpu.regs.e);
        byte_result(cpu, 0);
    }

    fn bdos_reader_input(&mut self, cpu: &mut Cpu) {
        debug!("reader input entry");
        let c = self.reader.input();
        byte_result(cpu, c);
        debug!("reader input exit: a=0x{:02x}", cpu.regs.a);
    }

    fn bdos_punch_output(&mut self, cpu: &mut Cpu) {
        debug!("punch output entry: e=0x{:02x}", cpu.regs.e);
        self.punch.out(cpu.regs.e);
        byte_result(cpu, 0);
    }

    fn bdos_list_output(&mut self, cpu: &mut Cpu) {
        debug!("list output entry: e=0x{:02x}", cpu.regs.e);
        self.printer.out(cpu.regs.e);
        byte_result(cpu, 0);
    }

    /// E = 0xff requests a nonblocking read (0x00 when nothing is
    /// ready); any other value goes to the console verbatim. No echoing,
    /// no control character handling.
    fn bdos_direct_console_io(&mut self, cpu: &mut Cpu) {
        debug!("direct console io entry: e=0x{:02x}", cpu.regs.e);
        if cpu.regs.e == 0xff {
            let c = if self.console.status() { self.console.input() } else { 0x00 };
            byte_result(cpu, c);
        } else {
            self.console.out(cpu.regs.e);
            byte_result(cpu, 0);
        }
    }

    fn bdos_get_io_byte(&mut self, cpu: &mut Cpu) {
        debug!("get io byte entry");
        let byte = cpu.mem.get(crate::boot::IOBYTE);
        byte_result(cpu, byte);
    }

    fn bdos_set_io_byte(&mut self, cpu: &mut Cpu) {
        debug!("set io byte entry: e=0x{:02x}", cpu.regs.e);
        cpu.mem.set(crate::boot::IOBYTE, cpu.regs.e);
        byte_result(cpu, 0);
    }

    fn bdos_print_string(&mut self, cpu: &mut Cpu) {
        debug!("print string entry: de=0x{:04x}", cpu.regs.de());
        let start = cpu.regs.de();
        let mut address = start as usize;
        loop {
            let byte = cpu.mem.get(address as u16);
            address += 1;
            if byte == 0x24 {
                // $
                break;
            }
            self.put_char(byte);
            if address == MEMORY_SIZE {
                warn!("print string: invalid string at 0x{:04x}", start);
                self.terminate(Reason::BdosArg);
                break;
            }
        }
        byte_result(cpu, 0);
    }

    /// Line editor over a caller-sized buffer at DE: byte 0 holds the
    /// capacity, byte 1 receives the length, data starts at byte 2.
    fn bdos_read_console_buffer(&mut self, cpu: &mut Cpu) {
        debug!("read console buffer entry: de=0x{:04x}", cpu.regs.de());
        let address = cpu.regs.de();
        let size = cpu.mem.get(address) as usize;
        if MEMORY_SIZE - (address as usize) >= size + 2 {
            let mut free = size;
            let mut curr = address + 2;
            // starting column, for retype and discard
            let start_col = self.console_col;
            while free > 0 {
                let c = self.console.input();
                match c {
                    // ^C at the start of the line terminates the program
                    0x03 if free == size => {
                        self.put_ctrl(c);
                        self.put_crlf();
                        debug!("program terminated by ^C");
                        self.terminate(Reason::CtrlC);
                        byte_result(cpu, 0);
                        return;
                    }
                    // ^E: physical end of line
                    0x05 => self.put_crlf(),
                    // BS/DEL: delete the last character by overtyping
                    BS | 0x7f => {
                        if free < size {
                            curr -= 1;
                            free += 1;
                            self.put_char(BS);
                            self.put_graph(SPC);
                            self.put_char(BS);
                            if cpu.mem.get(curr) < SPC {
                                // a deleted control character echoed as
                                // two columns
                                self.put_char(BS);
                                self.put_graph(SPC);
                                self.put_char(BS);
                            }
                        }
                    }
                    LF | CR => break,
                    // ^R: retype the line
                    0x12 => {
                        self.put_crlf();
                        for _ in 0..start_col {
                            self.put_graph(SPC);
                        }
                        for i in address + 2..curr {
                            let byte = cpu.mem.get(i);
                            self.put_ctrl(byte);
                        }
                    }
                    // ^U/^X: discard all previous input
                    0x15 | 0x18 => {
                        self.put_crlf();
                        for _ in 0..start_col {
                            self.put_graph(SPC);
                        }
                        curr = address + 2;
                        free = size;
                    }
                    _ => {
                        self.put_ctrl(c);
                        cpu.mem.set(curr, c);
                        curr += 1;
                        free -= 1;
                    }
                }
            }
            cpu.mem.set(address + 1, (size - free) as u8);
            self.put_char(CR);
            trace!(
                "input buffer(0x{:04x}): {:02x?}",
                address,
                cpu.mem.slice(address, 2 + size - free)
            );
        } else {
            warn!("read console buffer: invalid buffer 0x{:04x}", address);
            self.terminate(Reason::BdosArg);
        }
        byte_result(cpu, 0);
    }

    fn bdos_get_console_status(&mut self, cpu: &mut Cpu) {
        debug!("get console status entry");
        let status = if self.console.status() { 0xff } else { 0x00 };
        byte_result(cpu, status);
    }

    fn bdos_return_version_number(&mut self, cpu: &mut Cpu) {
        debug!("return version number entry");
        byte_result(cpu, 0x22);
    }

    /// Reset the current drive to the configured default (a real CP/M
    /// would select A:), restore the read-only flags, reset the DMA
    /// address.
    fn disk_reset(&mut self, mem: &mut Memory) {
        self.current_drive = self.default_drive;
        mem.set(DRVUSER, (self.current_drive as u8) | (self.current_user << 4));
        self.read_only = self.configured_read_only;
        self.current_dma = DEFAULT_DMA;
    }

    fn bdos_reset_disk_system(&mut self, cpu: &mut Cpu) {
        debug!("reset disk system entry");
        self.disk_reset(&mut cpu.mem);
        byte_result(cpu, 0);
    }

    /// Drive numbers run 0..15 with no default-drive encoding here.
    fn check_drive(&mut self, drive: usize, caller: &str) -> bool {
        if drive > 15 || self.drives[drive].is_none() {
            warn!("{}: illegal/unconfigured drive {}", caller, drive);
            self.terminate(Reason::Select);
            false
        } else {
            true
        }
    }

    fn bdos_select_disk(&mut self, cpu: &mut Cpu) {
        debug!("select disk entry: e=0x{:02x}", cpu.regs.e);
        if self.check_drive(cpu.regs.e as usize, "select disk") {
            self.current_drive = cpu.regs.e as usize;
            cpu.mem.set(DRVUSER, (self.current_drive as u8) | (self.current_user << 4));
        }
        byte_result(cpu, 0);
    }

    // FCB plumbing

    /// Fetch and validate the FCB address in DE; FCBs have different
    /// sizes depending on the function using them.
    fn get_fcb(&mut self, cpu: &Cpu, size: usize, caller: &str) -> Option<u16> {
        let fcb = cpu.regs.de();
        if MEMORY_SIZE - (fcb as usize) < size {
            warn!("{} (FCB 0x{:04x}): invalid address", caller, fcb);
            self.terminate(Reason::BdosArg);
            None
        } else {
            trace!("FCB(0x{:04x}): {:02x?}", fcb, cpu.mem.slice(fcb, size));
            Some(fcb)
        }
    }

    /// Drive byte of an FCB: 0 selects the current drive, 1..16 name
    /// A..P explicitly.
    fn get_drive(&mut self, mem: &Memory, fcb: u16, caller: &str) -> Option<usize> {
        let byte = mem.get(fcb) as usize;
        let drive = if byte == 0 { self.current_drive } else { byte - 1 };
        if drive > 15 || self.drives[drive].is_none() {
            warn!("{} (FCB 0x{:04x}): illegal/unconfigured drive", caller, fcb);
            self.terminate(Reason::Select);
            None
        } else {
            Some(drive)
        }
    }

    fn unix_name(&mut self, mem: &Memory, fcb: u16, caller: &str) -> Option<String> {
        match unix_name_from_fcb(mem.slice(fcb.wrapping_add(1), 11)) {
            Some(name) => Some(name),
            None => {
                warn!("{} (FCB 0x{:04x}): illegal file name", caller, fcb);
                None
            }
        }
    }

    /// Validate the file identifier stored in the FCB against the check
    /// word and the registry. Stale and forged identifiers are guest
    /// logic errors.
    fn fcb_file_id(&mut self, mem: &Memory, fcb: u16, caller: &str) -> Option<u16> {
        let id = mem.get_word(fcb.wrapping_add(16));
        let check = mem.get_word(fcb.wrapping_add(18));
        if id ^ check != ID_CHECK {
            warn!("{} (FCB 0x{:04x}): invalid file id in FCB", caller, fcb);
            self.terminate(Reason::Logic);
            return None;
        }
        if !self.files.contains(id) {
            warn!("{} (FCB 0x{:04x}): stale file id in FCB", caller, fcb);
            self.terminate(Reason::Logic);
            return None;
        }
        Some(id)
    }

    fn drive_dir(&self, drive: usize) -> PathBuf {
        self.drives[drive].clone().unwrap_or_default()
    }

    fn allocate_file_id(&mut self, mem: &mut Memory, fcb: u16, caller: &str) -> Option<u16> {
        match self.files.allocate() {
            Some(id) => {
                store_file_id(mem, fcb, id);
                Some(id)
            }
            None => {
                warn!("{} (FCB 0x{:04x}): more than 65535 open files", caller, fcb);
                self.terminate(Reason::Logic);
                None
            }
        }
    }

    fn bdos_open_file(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "open file";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.open_file(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn open_file(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "open file";
        let fcb = self.get_fcb(cpu, 33, FUNC)?;
        // extent must be 0..31; the S2 byte is cleared on open
        let extent = cpu.mem.get(fcb + 12) as u32;
        if extent > 31 {
            warn!("{} (FCB 0x{:04x}): illegal extent number", FUNC, fcb);
            return None;
        }
        cpu.mem.set(fcb + 14, 0);
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        let mut flags = FileFlags::empty();
        if self.read_only[drive] {
            flags |= FileFlags::READONLY_DISK;
        }
        let pattern = self.unix_name(&cpu.mem, fcb, FUNC)?;
        let ambiguous = is_ambiguous(&pattern);
        let dir = self.drive_dir(drive);
        let matches = scan_directory(&dir, &pattern, FUNC);
        // files too small for the requested extent don't match
        let entry = matches.iter().find(|m| m.records >= extent * 128)?;
        let path = dir.join(&entry.name);
        let open_result = if flags.contains(FileFlags::READONLY_DISK) {
            File::open(&path)
        } else {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    flags |= FileFlags::READONLY_FILE;
                    File::open(&path)
                }
                other => other,
            }
        };
        let file = match open_result {
            Ok(file) => file,
            Err(err) => {
                warn!("{} (FCB 0x{:04x}): could not open {}: {}", FUNC, fcb, path.display(), err);
                self.terminate(Reason::Host);
                return None;
            }
        };
        // a wildcard FCB learns the name it actually matched
        if ambiguous {
            let temp = setup_fcb(&entry.name);
            cpu.mem.slice_mut(fcb + 1, 11).copy_from_slice(&temp[1..12]);
        }
        let id = self.allocate_file_id(&mut cpu.mem, fcb, FUNC)?;
        self.files.insert(id, OpenFile { path, file, flags });
        Some(0x00)
    }

    fn bdos_make_file(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "make file";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.make_file(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn make_file(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "make file";
        let fcb = self.get_fcb(cpu, 33, FUNC)?;
        if cpu.mem.get(fcb + 12) > 31 {
            warn!("{} (FCB 0x{:04x}): illegal extent number", FUNC, fcb);
            return None;
        }
        cpu.mem.set(fcb + 14, 0);
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        if self.read_only[drive] {
            warn!("{} (FCB 0x{:04x}): disk write protected", FUNC, fcb);
            self.terminate(Reason::RoDisk);
            return None;
        }
        let name = self.unix_name(&cpu.mem, fcb, FUNC)?;
        if is_ambiguous(&name) {
            warn!("{} (FCB 0x{:04x}): ambiguous file name {}", FUNC, fcb, name);
            return None;
        }
        let path = self.drive_dir(drive).join(&name);
        let file = match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!("{} (FCB 0x{:04x}): could not create {}: {}", FUNC, fcb, path.display(), err);
                self.terminate(Reason::Host);
                return None;
            }
        };
        let id = self.allocate_file_id(&mut cpu.mem, fcb, FUNC)?;
        self.files.insert(id, OpenFile { path, file, flags: FileFlags::empty() });
        Some(0x00)
    }

    fn bdos_close_file(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "close file";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.close_file(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn close_file(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "close file";
        let fcb = self.get_fcb(cpu, 33, FUNC)?;
        let id = self.fcb_file_id(&cpu.mem, fcb, FUNC)?;
        // some programs (dBase II among them) keep using FCBs after
        // closing them; the never-close mode keeps the handle live and
        // only marks it flushed
        if self.dont_close {
            self.files.get_mut(id)?.flags.remove(FileFlags::DIRTY);
            return Some(0x00);
        }
        for i in 16..20 {
            cpu.mem.set(fcb + i, 0);
        }
        let open_file = self.files.remove(id)?;
        if open_file.flags.contains(FileFlags::DIRTY) {
            if let Err(err) = open_file.file.sync_all() {
                warn!(
                    "{} (FCB 0x{:04x}): flushing {} failed: {}",
                    FUNC,
                    fcb,
                    open_file.path.display(),
                    err
                );
                self.terminate(Reason::Host);
                return None;
            }
        }
        Some(0x00)
    }

    /// Pop the head of the search queue and render it into the DMA area
    /// as a synthesized directory entry.
    fn return_direntry(&mut self, mem: &mut Memory) -> u8 {
        let entry = match self.search_list.pop_front() {
            Some(entry) => entry,
            None => return 0xff,
        };
        let dma = self.current_dma;
        mem.fill(dma, 32, 0);
        // the rest of the DMA buffer holds unused directory entries
        mem.fill(dma.wrapping_add(32), DMA_SIZE - 32, 0xe5);
        let temp = setup_fcb(&entry.name);
        mem.slice_mut(dma.wrapping_add(1), 11).copy_from_slice(&temp[1..12]);
        // the entry is always placed in the first 32 bytes, so the
        // directory code is always 0
        0x00
    }

    fn bdos_search_for_first(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "search for first";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.search_for_first(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn search_for_first(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "search for first";
        let fcb = self.get_fcb(cpu, 32, FUNC)?;
        // a wildcard drive byte would select user areas on a real
        // system; without user areas it means the current drive
        let drive = if cpu.mem.get(fcb) == 0x3f {
            self.current_drive
        } else {
            self.get_drive(&cpu.mem, fcb, FUNC)?
        };
        let pattern = self.unix_name(&cpu.mem, fcb, FUNC)?;
        let dir = self.drive_dir(drive);
        self.search_list = scan_directory(&dir, &pattern, FUNC).into();
        Some(self.return_direntry(&mut cpu.mem))
    }

    fn bdos_search_for_next(&mut self, cpu: &mut Cpu) {
        debug!("search for next entry");
        let result = self.return_direntry(&mut cpu.mem);
        byte_result(cpu, result);
        debug!("search for next exit: a=0x{:02x}", cpu.regs.a);
    }

    fn bdos_delete_file(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "delete file";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.delete_file(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn delete_file(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "delete file";
        let fcb = self.get_fcb(cpu, 32, FUNC)?;
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        let pattern = self.unix_name(&cpu.mem, fcb, FUNC)?;
        let dir = self.drive_dir(drive);
        let matches = scan_directory(&dir, &pattern, FUNC);
        if matches.is_empty() {
            return None;
        }
        if self.read_only[drive] {
            warn!("{} (FCB 0x{:04x}): write protected disk", FUNC, fcb);
            self.terminate(Reason::RoDisk);
            return None;
        }
        for entry in &matches {
            let path = dir.join(&entry.name);
            if let Err(err) = std::fs::remove_file(&path) {
                // failure to unlink is taken as a write protected file
                warn!("{} (FCB 0x{:04x}): unlink({}) failed: {}", FUNC, fcb, path.display(), err);
                self.terminate(Reason::RoFile);
                return None;
            }
        }
        Some(0x00)
    }

    /// Seek to a record offset; the offset is in 128-byte records.
    fn seek_record(&mut self, id: u16, offset: u32, fcb: u16, caller: &str) -> Option<()> {
        let result = {
            let open_file = self.files.get_mut(id)?;
            open_file
                .file
                .seek(SeekFrom::Start(offset as u64 * 128))
                .map_err(|err| (open_file.path.display().to_string(), err))
        };
        match result {
            Ok(_) => Some(()),
            Err((path, err)) => {
                warn!("{} (FCB 0x{:04x}): seek({}) failed: {}", caller, fcb, path, err);
                self.terminate(Reason::Host);
                None
            }
        }
    }

    /// Read one 128-byte record into the DMA area; short reads are
    /// padded with SUB. Returns false at end of file.
    fn read_record(&mut self, id: u16, mem: &mut Memory, fcb: u16, caller: &str) -> Option<bool> {
        let dma = self.current_dma;
        let result = {
            let open_file = self.files.get_mut(id)?;
            fill_record(&mut open_file.file, mem.slice_mut(dma, DMA_SIZE))
                .map_err(|err| (open_file.path.display().to_string(), err))
        };
        match result {
            Ok(0) => Some(false),
            Ok(_) => {
                trace!("record(0x{:04x}): {:02x?}", dma, mem.slice(dma, DMA_SIZE));
                Some(true)
            }
            Err((path, err)) => {
                warn!("{} (FCB 0x{:04x}): read({}) failed: {}", caller, fcb, path, err);
                self.terminate(Reason::Host);
                None
            }
        }
    }

    /// Write one 128-byte record from the DMA area.
    fn write_record(&mut self, id: u16, mem: &Memory, fcb: u16, caller: &str) -> Option<()> {
        let dma = self.current_dma;
        let result = {
            let open_file = self.files.get_mut(id)?;
            let written = open_file.file.write_all(mem.slice(dma, DMA_SIZE));
            open_file.flags.insert(FileFlags::DIRTY);
            written.map_err(|err| (open_file.path.display().to_string(), err))
        };
        match result {
            Ok(()) => {
                trace!("record(0x{:04x}): {:02x?}", dma, mem.slice(dma, DMA_SIZE));
                Some(())
            }
            Err((path, err)) => {
                warn!("{} (FCB 0x{:04x}): write({}) failed: {}", caller, fcb, path, err);
                self.terminate(Reason::Host);
                None
            }
        }
    }

    /// Write protection applies per drive and per file; both are fatal
    /// to the run, not mere error codes.
    fn check_writeable(&mut self, id: u16, fcb: u16, caller: &str) -> Option<()> {
        let flags = self.files.get_mut(id)?.flags;
        if flags.contains(FileFlags::READONLY_DISK) {
            warn!("{} (FCB 0x{:04x}): write protected disk", caller, fcb);
            self.terminate(Reason::RoDisk);
            return None;
        }
        if flags.contains(FileFlags::READONLY_FILE) {
            warn!("{} (FCB 0x{:04x}): file is write protected", caller, fcb);
            self.terminate(Reason::RoFile);
            return None;
        }
        Some(())
    }

    fn bdos_read_sequential(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "read sequential";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.read_sequential(cpu);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn read_sequential(&mut self, cpu: &mut Cpu) -> u8 {
        const FUNC: &str = "read sequential";
        let Some(fcb) = self.get_fcb(cpu, 33, FUNC) else { return 0x01 };
        let Some(id) = self.fcb_file_id(&cpu.mem, fcb, FUNC) else { return 0x01 };
        let offset = match get_offset(&cpu.mem, fcb) {
            Some(offset) if offset != 65536 => offset,
            _ => {
                warn!("{} (FCB 0x{:04x}): record out of range", FUNC, fcb);
                return 0x06;
            }
        };
        if self.seek_record(id, offset, fcb, FUNC).is_none() {
            return 0x01;
        }
        match self.read_record(id, &mut cpu.mem, fcb, FUNC) {
            Some(true) => {
                set_offset(&mut cpu.mem, fcb, offset + 1);
                0x00
            }
            // 0x01 is "reading unwritten data", i.e. end of file
            _ => 0x01,
        }
    }

    fn bdos_write_sequential(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "write sequential";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.write_sequential(cpu);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn write_sequential(&mut self, cpu: &mut Cpu) -> u8 {
        const FUNC: &str = "write sequential";
        // 0x02 is "no available data block", i.e. disk full
        let Some(fcb) = self.get_fcb(cpu, 33, FUNC) else { return 0x02 };
        let Some(id) = self.fcb_file_id(&cpu.mem, fcb, FUNC) else { return 0x02 };
        if self.check_writeable(id, fcb, FUNC).is_none() {
            return 0x02;
        }
        let offset = match get_offset(&cpu.mem, fcb) {
            Some(offset) if offset != 65536 => offset,
            _ => {
                warn!("{} (FCB 0x{:04x}): record out of range", FUNC, fcb);
                return 0x06;
            }
        };
        if self.seek_record(id, offset, fcb, FUNC).is_none() {
            return 0x02;
        }
        if self.write_record(id, &cpu.mem, fcb, FUNC).is_none() {
            return 0x02;
        }
        set_offset(&mut cpu.mem, fcb, offset + 1);
        0x00
    }

    fn bdos_read_random(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "read random";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.read_random(cpu);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn read_random(&mut self, cpu: &mut Cpu) -> u8 {
        const FUNC: &str = "read random";
        let Some(fcb) = self.get_fcb(cpu, 36, FUNC) else { return 0x01 };
        let Some(id) = self.fcb_file_id(&cpu.mem, fcb, FUNC) else { return 0x01 };
        let offset = match get_random(&cpu.mem, fcb) {
            Some(offset) if offset != 65536 => offset,
            _ => {
                warn!("{} (FCB 0x{:04x}): record out of range", FUNC, fcb);
                return 0x06;
            }
        };
        if self.seek_record(id, offset, fcb, FUNC).is_none() {
            return 0x01;
        }
        match self.read_record(id, &mut cpu.mem, fcb, FUNC) {
            Some(true) => {
                // the sequential position follows the random one
                set_offset(&mut cpu.mem, fcb, offset);
                0x00
            }
            _ => 0x01,
        }
    }

    fn bdos_write_random(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "write random";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.write_random(cpu);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn write_random(&mut self, cpu: &mut Cpu) -> u8 {
        const FUNC: &str = "write random";
        // 0x05 "no available directory space": random mode does not
        // report disk-full per the CP/M documentation
        let Some(fcb) = self.get_fcb(cpu, 36, FUNC) else { return 0x05 };
        let Some(id) = self.fcb_file_id(&cpu.mem, fcb, FUNC) else { return 0x05 };
        if self.check_writeable(id, fcb, FUNC).is_none() {
            return 0x05;
        }
        let offset = match get_random(&cpu.mem, fcb) {
            Some(offset) if offset != 65536 => offset,
            _ => {
                warn!("{} (FCB 0x{:04x}): record out of range", FUNC, fcb);
                return 0x06;
            }
        };
        if self.seek_record(id, offset, fcb, FUNC).is_none() {
            return 0x05;
        }
        if self.write_record(id, &cpu.mem, fcb, FUNC).is_none() {
            return 0x05;
        }
        set_offset(&mut cpu.mem, fcb, offset);
        0x00
    }

    fn bdos_compute_file_size(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "compute file size";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.compute_file_size(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn compute_file_size(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "compute file size";
        let fcb = self.get_fcb(cpu, 36, FUNC)?;
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        let name = self.unix_name(&cpu.mem, fcb, FUNC)?;
        if is_ambiguous(&name) {
            warn!("{} (FCB 0x{:04x}): ambiguous file name {}", FUNC, fcb, name);
            return None;
        }
        let path = self.drive_dir(drive).join(&name);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("{} (FCB 0x{:04x}): stat({}) failed: {}", FUNC, fcb, path.display(), err);
                return None;
            }
        };
        if !meta.is_file() {
            warn!("{} (FCB 0x{:04x}): {} is no regular file", FUNC, fcb, path.display());
            return None;
        }
        if meta.len() > MAX_FILE_SIZE {
            warn!("{} (FCB 0x{:04x}): {} is larger than 8 MB", FUNC, fcb, path.display());
            return None;
        }
        let records = ((meta.len() + 127) / 128) as u32;
        store_random(&mut cpu.mem, fcb, records);
        Some(0x00)
    }

    fn bdos_set_random_record(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "set random record";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.set_random_record(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn set_random_record(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "set random record";
        let fcb = self.get_fcb(cpu, 36, FUNC)?;
        let offset = match get_offset(&cpu.mem, fcb) {
            Some(offset) => offset,
            None => {
                warn!("{} (FCB 0x{:04x}): invalid file offset", FUNC, fcb);
                return None;
            }
        };
        store_random(&mut cpu.mem, fcb, offset);
        Some(0x00)
    }

    fn bdos_rename_file(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "rename file";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.rename_file(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn rename_file(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "rename file";
        let fcb = self.get_fcb(cpu, 32, FUNC)?;
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        if self.read_only[drive] {
            warn!("{} (FCB 0x{:04x}): disk write protected", FUNC, fcb);
            self.terminate(Reason::RoDisk);
            return None;
        }
        // the new name sits in the second half of the FCB
        let old_name = self.unix_name(&cpu.mem, fcb, FUNC)?;
        let new_name = self.unix_name(&cpu.mem, fcb + 16, FUNC)?;
        if is_ambiguous(&old_name) {
            warn!("{} (FCB 0x{:04x}): ambiguous old file name {}", FUNC, fcb, old_name);
            return None;
        }
        if is_ambiguous(&new_name) {
            warn!("{} (FCB 0x{:04x}): ambiguous new file name {}", FUNC, fcb, new_name);
            return None;
        }
        let dir = self.drive_dir(drive);
        let old_path = dir.join(&old_name);
        let new_path = dir.join(&new_name);
        // link then unlink, so a failure can never lose the file
        if let Err(err) = std::fs::hard_link(&old_path, &new_path) {
            warn!(
                "{} (FCB 0x{:04x}): link({}, {}) failed: {}",
                FUNC,
                fcb,
                old_path.display(),
                new_path.display(),
                err
            );
            match err.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::AlreadyExists => {}
                io::ErrorKind::PermissionDenied => self.terminate(Reason::RoFile),
                _ => self.terminate(Reason::Host),
            }
            return None;
        }
        if let Err(err) = std::fs::remove_file(&old_path) {
            warn!("{} (FCB 0x{:04x}): unlink({}) failed: {}", FUNC, fcb, old_path.display(), err);
            self.terminate(Reason::Host);
            let _ = std::fs::remove_file(&new_path);
            return None;
        }
        Some(0x00)
    }

    fn bdos_return_log_in_vector(&mut self, cpu: &mut Cpu) {
        debug!("return log in vector entry");
        // all configured drives count as logged in
        let mut vector = 0u16;
        for i in (0..16).rev() {
            vector <<= 1;
            vector |= self.drives[i].is_some() as u16;
        }
        word_result(cpu, vector);
        debug!("return log in vector exit: hl=0x{:04x}", vector);
    }

    fn bdos_return_current_disk(&mut self, cpu: &mut Cpu) {
        debug!("return current disk entry");
        byte_result(cpu, self.current_drive as u8);
    }

    fn bdos_set_dma_address(&mut self, cpu: &mut Cpu) {
        let address = cpu.regs.de();
        debug!("set dma address entry: de=0x{:04x}", address);
        if MEMORY_SIZE - (address as usize) < DMA_SIZE {
            warn!("set dma address: illegal address 0x{:04x}", address);
            self.terminate(Reason::BdosArg);
        } else {
            self.current_dma = address;
        }
        byte_result(cpu, 0);
    }

    fn bdos_get_addr_alloc(&mut self, cpu: &mut Cpu) {
        debug!("get addr alloc entry");
        // one shared dummy allocation vector serves all drives
        word_result(cpu, ALV);
    }

    fn bdos_write_protect_disk(&mut self, cpu: &mut Cpu) {
        debug!("write protect disk entry");
        self.read_only[self.current_drive] = true;
        byte_result(cpu, 0);
    }

    fn bdos_get_read_only_vector(&mut self, cpu: &mut Cpu) {
        debug!("get read only vector entry");
        let mut vector = 0u16;
        for i in (0..16).rev() {
            vector <<= 1;
            vector |= self.read_only[i] as u16;
        }
        word_result(cpu, vector);
        debug!("get read only vector exit: hl=0x{:04x}", vector);
    }

    /// File attributes are not kept, but the arguments get the same
    /// scrutiny as for the real thing.
    fn bdos_set_file_attributes(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "set file attributes";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.set_file_attributes(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn set_file_attributes(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "set file attributes";
        let fcb = self.get_fcb(cpu, 32, FUNC)?;
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        if self.read_only[drive] {
            warn!("{} (FCB 0x{:04x}): disk write protected", FUNC, fcb);
            self.terminate(Reason::RoDisk);
            return None;
        }
        let name = self.unix_name(&cpu.mem, fcb, FUNC)?;
        if is_ambiguous(&name) {
            warn!("{} (FCB 0x{:04x}): ambiguous file name {}", FUNC, fcb, name);
            return None;
        }
        Some(0x00)
    }

    fn bdos_get_addr_diskparams(&mut self, cpu: &mut Cpu) {
        debug!("get addr diskparams entry");
        // one shared dummy parameter block serves all drives
        word_result(cpu, DPB);
    }

    fn bdos_set_get_user_code(&mut self, cpu: &mut Cpu) {
        debug!("get set user code entry: e=0x{:02x}", cpu.regs.e);
        if cpu.regs.e == 0xff {
            byte_result(cpu, self.current_user);
        } else {
            self.current_user = cpu.regs.e & 0x0f;
            cpu.mem.set(DRVUSER, (self.current_drive as u8) | (self.current_user << 4));
            byte_result(cpu, 0);
        }
    }

    fn bdos_reset_drive(&mut self, cpu: &mut Cpu) {
        debug!("reset drive entry: de=0x{:04x}", cpu.regs.de());
        let mut vector = cpu.regs.de();
        for drive in 0..16 {
            if vector & 1 != 0 {
                if self.drives[drive].is_none() {
                    warn!("reset drive: illegal disk {}", drive);
                    self.terminate(Reason::Select);
                } else {
                    self.read_only[drive] = self.configured_read_only[drive];
                }
            }
            vector >>= 1;
        }
        byte_result(cpu, 0);
    }

    // CP/M 3 extensions: enough of the interface that moderate users of
    // CP/M 3 facilities (dates, return codes, SCB peeks) keep working.

    fn read_scb(&self, offset: u8) -> u8 {
        match offset {
            // version byte: consistent with BDOS function 12
            0x05 => 0x22,
            0x10 => (self.program_return_code & 0xff) as u8,
            0x11 => (self.program_return_code >> 8) as u8,
            // CP/M 3 reports columns minus one but lines undecremented
            0x1a => self.columns - 1,
            0x1c => self.lines,
            // output delimiter
            0x37 => 0x24,
            0x3c => (self.current_dma & 0xff) as u8,
            0x3d => (self.current_dma >> 8) as u8,
            0x3e => self.current_drive as u8,
            0x44 => self.current_user,
            // multi sector count
            0x4a => 1,
            _ => 0x00,
        }
    }

    /// The simulated SCB is read-only; writes are accepted and ignored.
    fn bdosx_get_set_scb(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "get/set scb";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let address = cpu.regs.de();
        if MEMORY_SIZE - (address as usize) < 2 {
            warn!("{}: invalid buffer 0x{:04x}", FUNC, address);
            self.terminate(Reason::BdosArg);
            word_result(cpu, 0);
            return;
        }
        let offset = cpu.mem.get(address);
        let action = cpu.mem.get(address.wrapping_add(1));
        match action {
            0x00 => {
                let low = self.read_scb(offset) as u16;
                let high = self.read_scb(offset.wrapping_add(1)) as u16;
                word_result(cpu, (high << 8) | low);
            }
            0xfe | 0xff => word_result(cpu, 0),
            _ => {
                warn!("{}: invalid action code 0x{:02x}", FUNC, action);
                self.terminate(Reason::BdosArg);
                word_result(cpu, 0);
            }
        }
        debug!("{} exit: hl=0x{:04x}", FUNC, cpu.regs.hl());
    }

    /// The directory label always reports access and update stamps
    /// enabled and passwords disabled.
    fn bdosx_return_directory_label_data(&mut self, cpu: &mut Cpu) {
        debug!("return directory label data entry: e=0x{:02x}", cpu.regs.e);
        self.check_drive(cpu.regs.e as usize, "return directory label data");
        byte_result(cpu, 0x61);
    }

    fn bdosx_read_file_date_stamps(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "read file date stamps";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let result = self.read_file_date_stamps(cpu).unwrap_or(0xff);
        byte_result(cpu, result);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    fn read_file_date_stamps(&mut self, cpu: &mut Cpu) -> Option<u8> {
        const FUNC: &str = "read file date stamps";
        let fcb = self.get_fcb(cpu, 32, FUNC)?;
        let drive = self.get_drive(&cpu.mem, fcb, FUNC)?;
        let pattern = self.unix_name(&cpu.mem, fcb, FUNC)?;
        let dir = self.drive_dir(drive);
        let matches = scan_directory(&dir, &pattern, FUNC);
        let entry = matches.first()?;
        if is_ambiguous(&pattern) {
            let temp = setup_fcb(&entry.name);
            cpu.mem.slice_mut(fcb + 1, 11).copy_from_slice(&temp[1..12]);
        }
        // byte 12 zeroed: the file has no password
        cpu.mem.set(fcb + 12, 0);
        let accessed = cpm_time(system_local(entry.accessed));
        store_cpm_time(&mut cpu.mem, fcb + 24, &accessed);
        let modified = cpm_time(system_local(entry.modified));
        store_cpm_time(&mut cpu.mem, fcb + 28, &modified);
        Some(0x00)
    }

    fn bdosx_get_date_and_time(&mut self, cpu: &mut Cpu) {
        const FUNC: &str = "get date and time";
        debug!("{} entry: de=0x{:04x}", FUNC, cpu.regs.de());
        let address = cpu.regs.de();
        if MEMORY_SIZE - (address as usize) < 4 {
            warn!("{}: invalid buffer 0x{:04x}", FUNC, address);
            self.terminate(Reason::BdosArg);
            byte_result(cpu, 0);
            return;
        }
        let now = cpm_time(Local::now());
        store_cpm_time(&mut cpu.mem, address, &now);
        byte_result(cpu, now.second);
        debug!("{} exit: a=0x{:02x}", FUNC, cpu.regs.a);
    }

    /// Program chaining is not supported, so the initial return code is
    /// always zero; values at 0xff00 and above turn into a failed exit.
    fn bdosx_get_set_program_return_code(&mut self, cpu: &mut Cpu) {
        debug!("get/set program return code entry: de=0x{:04x}", cpu.regs.de());
        let code = cpu.regs.de();
        if code == 0xffff {
            word_result(cpu, self.program_return_code);
        } else {
            self.program_return_code = code;
            word_result(cpu, 0);
        }
    }

    /// One tick is 20 ms (the 50 Hz convention).
    fn bdosx_delay(&mut self, cpu: &mut Cpu) {
        debug!("delay entry: de=0x{:04x}", cpu.regs.de());
        let ticks = cpu.regs.de() as u64;
        self.pause(ticks * 20);
        byte_result(cpu, 0);
    }

    /// Sleep for the given number of wall clock milliseconds, polling
    /// the console at least four times a second.
    fn pause(&mut self, milliseconds: u64) {
        let end = Instant::now() + Duration::from_millis(milliseconds);
        loop {
            if crate::termination_requested() {
                break;
            }
            let now = Instant::now();
            if now >= end {
                break;
            }
            thread::sleep((end - now).min(Duration::from_millis(250)));
            self.console.poll();
        }
    }
}

fn system_local(time: SystemTime) -> DateTime<Local> {
    DateTime::<Local>::from(time)
}

/// Fill a record buffer from a file; short reads are padded with SUB.
/// Returns the number of file bytes actually read.
fn fill_record(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if filled > 0 {
        buffer[filled..].fill(0x1a);
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn offset_encoding_is_a_bijection() {
        let mut mem = Memory::new();
        let fcb = 0x005c;
        for offset in [0u32, 1, 127, 128, 4095, 4096, 65535, 65536] {
            set_offset(&mut mem, fcb, offset);
            assert_eq!(get_offset(&mem, fcb), Some(offset));
        }
        // 65536 is the end sentinel: S2 = 16, EX = CR = 0
        set_offset(&mut mem, fcb, 65536);
        assert_eq!(mem.get(fcb + 14), 16);
        assert_eq!(mem.get(fcb + 12), 0);
        assert_eq!(mem.get(fcb + 32), 0);
    }

    #[test]
    fn malformed_offsets_are_rejected() {
        let mut mem = Memory::new();
        let fcb = 0x005c;
        mem.set(fcb + 32, 128); // CR out of range
        assert_eq!(get_offset(&mem, fcb), None);
        mem.set(fcb + 32, 0);
        mem.set(fcb + 12, 32); // EX out of range
        assert_eq!(get_offset(&mem, fcb), None);
        mem.set(fcb + 12, 0);
        mem.set(fcb + 14, 16);
        mem.set(fcb + 32, 1); // past the end sentinel
        assert_eq!(get_offset(&mem, fcb), None);
    }

    #[test]
    fn random_record_range() {
        let mut mem = Memory::new();
        let fcb = 0x005c;
        store_random(&mut mem, fcb, 65536);
        assert_eq!(get_random(&mem, fcb), Some(65536));
        mem.set(fcb + 35, 2);
        assert_eq!(get_random(&mem, fcb), None);
    }

    #[test]
    fn cpm_day_number_for_the_millennium() {
        let datetime = Local.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let time = cpm_time(datetime);
        assert_eq!(time.day, 8036);
        assert_eq!(time.hour, 0x00);
        assert_eq!(time.minute, 0x00);
        assert_eq!(time.second, 0x00);
    }

    #[test]
    fn cpm_time_is_bcd() {
        let datetime = Local.with_ymd_and_hms(1983, 7, 14, 23, 59, 41).unwrap();
        let time = cpm_time(datetime);
        assert_eq!(time.hour, 0x23);
        assert_eq!(time.minute, 0x59);
        assert_eq!(time.second, 0x41);
        assert_ne!(time.day, 0);
    }

    #[test]
    fn dates_before_the_epoch_read_as_day_zero() {
        let datetime = Local.with_ymd_and_hms(1970, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(cpm_time(datetime).day, 0);
    }
}
