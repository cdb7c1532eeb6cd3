// Everything the emulator needs to know, gathered before the machine is
// built. The command line parser in main.rs produces one of these; the
// library only ever consumes the finished value, so tests can construct
// configurations directly.

use std::path::PathBuf;

/// Add a sleep of `nanoseconds` every `count` emulated instructions, to
/// slow the emulation down to something closer to period hardware.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub count: u32,
    pub nanoseconds: u64,
}

/// When to write a machine state dump to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpPolicy {
    pub startup: bool,
    pub exit: bool,
    pub error: bool,
    pub signal: bool,
}

pub struct Config {
    /// Host directory per drive; a drive is configured iff its entry is set.
    pub drives: [Option<PathBuf>; 16],
    pub read_only: [bool; 16],
    /// Default drive, 0 = A ... 15 = P.
    pub default_drive: usize,
    /// Command to run: either a Unix path (contains a slash) or a
    /// drive-relative CP/M name, with or without the .com extension.
    pub command: String,
    /// Command tail arguments, passed through to the guest.
    pub args: Vec<String>,
    pub printer: Option<PathBuf>,
    pub printer_raw: bool,
    pub punch: Option<PathBuf>,
    pub punch_raw: bool,
    pub reader: Option<PathBuf>,
    pub reader_raw: bool,
    /// Keep files open across BDOS Close, for guests that keep using
    /// closed FCBs (dBase II does).
    pub dont_close: bool,
    pub throttle: Option<Throttle>,
    pub dump: DumpPolicy,
    /// Collect per-plane instruction counters and log them at exit.
    pub count_instructions: bool,
    /// Console geometry reported through the simulated SCB.
    pub lines: u8,
    pub columns: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            drives: Default::default(),
            read_only: [false; 16],
            default_drive: 0,
            command: String::new(),
            args: Vec::new(),
            printer: None,
            printer_raw: false,
            punch: None,
            punch_raw: false,
            reader: None,
            reader_raw: false,
            dont_close: false,
            throttle: None,
            dump: DumpPolicy::default(),
            count_instructions: false,
            lines: 24,
            columns: 80,
        }
    }
}

impl Config {
    /// Apply the fallbacks the command line parser relies on: with no
    /// drive configured at all, drive A maps to the current directory.
    pub fn finish(&mut self) {
        if self.drives.iter().all(|d| d.is_none()) {
            self.drives[0] = Some(PathBuf::from("."));
        }
    }

    pub fn drive_configured(&self, drive: usize) -> bool {
        drive < 16 && self.drives[drive].is_some()
    }
}
