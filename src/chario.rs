// Character devices: the console and the printer/punch/reader trio.
//
// When stdin and stdout are the controlling terminal, the terminal is put
// into raw mode for the duration of the run (guests expect unbuffered,
// unechoed bytes) and input arrives through termion's asynchronous stdin
// reader, which also gives us a cheap nonblocking console status check.
// When either stream is redirected, plain stdio is used instead, with the
// CR/LF conventions mapped at the boundary.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Stdout, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::warn;
use termion::raw::{IntoRawMode, RawTerminal};
use termion::AsyncReader;

use crate::charset::{from_cpm, to_cpm};

const EOF_BYTE: u8 = 0x1a; // SUB, the CP/M end-of-file marker
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

pub struct Console {
    /// Raw-mode guard; restores the terminal attributes on drop.
    raw: Option<RawTerminal<Stdout>>,
    input: Option<AsyncReader>,
    pending: VecDeque<u8>,
    redirected: bool,
    /// CR/LF to LF mapping state while output is redirected.
    last_was_cr: bool,
    eof: bool,
}

impl Console {
    pub fn new() -> io::Result<Console> {
        let redirected = !termion::is_tty(&io::stdin()) || !termion::is_tty(&io::stdout());
        let (raw, input) = if redirected {
            (None, None)
        } else {
            (Some(io::stdout().into_raw_mode()?), Some(termion::async_stdin()))
        };
        Ok(Console {
            raw,
            input,
            pending: VecDeque::new(),
            redirected,
            last_was_cr: false,
            eof: false,
        })
    }

    /// Output a single guest character. Unconvertible bytes are silently
    /// dropped.
    pub fn out(&mut self, c: u8) {
        if self.redirected {
            // fold the guest's CR/LF pairs back to bare LF; a CR not
            // followed by LF goes through
            if c != LF && self.last_was_cr {
                print!("\r");
            }
            if c != CR {
                if let Some(host) = from_cpm(c) {
                    print!("{}", host);
                }
            }
            self.last_was_cr = c == CR;
            let _ = io::stdout().flush();
        } else if let Some(host) = from_cpm(c) {
            if let Some(raw) = self.raw.as_mut() {
                let mut buffer = [0u8; 4];
                let _ = raw.write_all(host.encode_utf8(&mut buffer).as_bytes());
                let _ = raw.flush();
            }
        }
    }

    /// Pull whatever the terminal has buffered into the pending queue.
    pub fn poll(&mut self) {
        if let Some(input) = self.input.as_mut() {
            let mut buffer = [0u8; 64];
            while let Ok(n) = input.read(&mut buffer) {
                if n == 0 {
                    break;
                }
                self.pending.extend(&buffer[..n]);
            }
        }
    }

    /// True when a byte can be read without blocking.
    pub fn status(&mut self) -> bool {
        if self.redirected {
            // a redirected stdin is always ready (files never block)
            return true;
        }
        self.poll();
        !self.pending.is_empty()
    }

    /// Blocking read of one guest byte. EOF (only possible on redirected
    /// input) reads as SUB; a pending termination request unblocks the
    /// read so the run loop can observe it.
    pub fn input(&mut self) -> u8 {
        if self.redirected {
            if self.eof {
                return EOF_BYTE;
            }
            let mut byte = [0u8; 1];
            loop {
                match io::stdin().read(&mut byte) {
                    Ok(0) => {
                        self.eof = true;
                        return EOF_BYTE;
                    }
                    Ok(_) => {
                        if let Some(c) = to_cpm(byte[0] as char) {
                            // guests expect CR where the host has LF
                            return if c == LF { CR } else { c };
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        if crate::termination_requested() {
                            return EOF_BYTE;
                        }
                    }
                    Err(_) => {
                        self.eof = true;
                        return EOF_BYTE;
                    }
                }
            }
        }
        loop {
            self.poll();
            if let Some(byte) = self.pending.pop_front() {
                if let Some(c) = to_cpm(byte as char) {
                    return c;
                }
                continue;
            }
            if crate::termination_requested() {
                return EOF_BYTE;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Flush pending state and restore the terminal.
    pub fn finish(&mut self) {
        if self.redirected && self.last_was_cr {
            print!("\r");
            let _ = io::stdout().flush();
        }
        self.last_was_cr = false;
        self.raw = None; // drop restores the terminal attributes
        self.input = None;
    }
}

/// Append-only output device (printer or punch). In text mode guest CR/LF
/// pairs become host line endings; in raw mode bytes pass through. An
/// error latches the device as unavailable, reported once at shutdown.
pub struct SinkDevice {
    label: &'static str,
    path: Option<PathBuf>,
    raw: bool,
    file: Option<File>,
    error: Option<io::Error>,
    pending_cr: bool,
}

impl SinkDevice {
    pub fn new(label: &'static str, path: Option<PathBuf>, raw: bool) -> SinkDevice {
        SinkDevice { label, path, raw, file: None, error: None, pending_cr: false }
    }

    fn write_host_char(&mut self, c: char) {
        if self.error.is_some() {
            return;
        }
        let mut buffer = [0u8; 4];
        let bytes = c.encode_utf8(&mut buffer).as_bytes().to_vec();
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(&bytes) {
                self.error = Some(err);
            }
        }
    }

    pub fn out(&mut self, c: u8) {
        let path = match self.path.as_ref() {
            Some(path) => path.clone(),
            None => return,
        };
        if self.error.is_some() {
            return;
        }
        if self.file.is_none() {
            match OpenOptions::new().append(true).create(true).open(&path) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    self.error = Some(err);
                    return;
                }
            }
        }
        if self.raw {
            if let Some(file) = self.file.as_mut() {
                if let Err(err) = file.write_all(&[c]) {
                    self.error = Some(err);
                }
            }
        } else {
            if c != LF && self.pending_cr {
                self.write_host_char('\r');
            }
            if c != CR {
                if let Some(host) = from_cpm(c) {
                    self.write_host_char(host);
                }
            }
            self.pending_cr = c == CR;
        }
    }

    /// Ready as long as the device is configured and has not failed.
    pub fn status(&self) -> bool {
        self.path.is_some() && self.error.is_none()
    }

    pub fn close(&mut self) -> bool {
        if self.pending_cr {
            self.write_host_char('\r');
            self.pending_cr = false;
        }
        let mut ok = true;
        if let Some(err) = self.error.take() {
            warn!("error on {}: {}", self.label, err);
            ok = false;
        }
        self.file = None;
        ok
    }
}

/// The reader device: a host file opened on first use. Text mode expands
/// the host's bare LF into the guest's CR/LF pair; end of file and any
/// error read as SUB.
pub struct ReaderDevice {
    path: Option<PathBuf>,
    raw: bool,
    file: Option<BufReader<File>>,
    error: Option<io::Error>,
    pending_lf: bool,
}

impl ReaderDevice {
    pub fn new(path: Option<PathBuf>, raw: bool) -> ReaderDevice {
        ReaderDevice { path, raw, file: None, error: None, pending_lf: false }
    }

    pub fn input(&mut self) -> u8 {
        let path = match self.path.as_ref() {
            Some(path) => path.clone(),
            None => return EOF_BYTE,
        };
        if self.error.is_some() {
            return EOF_BYTE;
        }
        if self.file.is_none() {
            match File::open(&path) {
                Ok(file) => self.file = Some(BufReader::new(file)),
                Err(err) => {
                    self.error = Some(err);
                    return EOF_BYTE;
                }
            }
        }
        if self.pending_lf {
            self.pending_lf = false;
            return LF;
        }
        let reader = self.file.as_mut().unwrap();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => return EOF_BYTE,
                Ok(_) => {
                    if self.raw {
                        return byte[0];
                    }
                    match to_cpm(byte[0] as char) {
                        Some(LF) => {
                            self.pending_lf = true;
                            return CR;
                        }
                        Some(c) => return c,
                        None => continue,
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.error = Some(err);
                    return EOF_BYTE;
                }
            }
        }
    }

    pub fn close(&mut self) -> bool {
        let mut ok = true;
        if let Some(err) = self.error.take() {
            warn!("error on reader device: {}", err);
            ok = false;
        }
        self.file = None;
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_device_text_mode_maps_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("printer.txt");
        let mut device = SinkDevice::new("printer", Some(path.clone()), false);
        for &b in b"AB\r\nC\r" {
            device.out(b);
        }
        assert!(device.close());
        // the CR before LF is suppressed, the trailing CR is flushed
        assert_eq!(std::fs::read(path).unwrap(), b"AB\nC\r");
    }

    #[test]
    fn sink_device_raw_mode_passes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("punch.bin");
        let mut device = SinkDevice::new("punch", Some(path.clone()), true);
        for &b in &[0x00u8, 0x0d, 0x0a, 0xff] {
            device.out(b);
        }
        assert!(device.close());
        assert_eq!(std::fs::read(path).unwrap(), vec![0x00, 0x0d, 0x0a, 0xff]);
    }

    #[test]
    fn unconfigured_sink_swallows_output() {
        let mut device = SinkDevice::new("printer", None, false);
        device.out(b'x');
        assert!(!device.status());
        assert!(device.close());
    }

    #[test]
    fn reader_text_mode_expands_lf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.txt");
        std::fs::write(&path, b"a\nb").unwrap();
        let mut device = ReaderDevice::new(Some(path), false);
        assert_eq!(device.input(), b'a');
        assert_eq!(device.input(), CR);
        assert_eq!(device.input(), LF);
        assert_eq!(device.input(), b'b');
        assert_eq!(device.input(), EOF_BYTE);
        assert_eq!(device.input(), EOF_BYTE);
    }

    #[test]
    fn reader_raw_mode_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.bin");
        std::fs::write(&path, [0x0a, 0x80]).unwrap();
        let mut device = ReaderDevice::new(Some(path), true);
        assert_eq!(device.input(), 0x0a);
        assert_eq!(device.input(), 0x80);
        assert_eq!(device.input(), EOF_BYTE);
    }

    #[test]
    fn unconfigured_reader_reads_eof() {
        let mut device = ReaderDevice::new(None, false);
        assert_eq!(device.input(), EOF_BYTE);
    }
}
