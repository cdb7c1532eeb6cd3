// The layer that reshapes CP/M's flat 8.3 directory world onto host
// directories: name validity, FCB name setup, wildcard matching, the
// directory scan, and the registry mapping the file identifiers stored in
// FCBs to open host files.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bitflags::bitflags;
use log::{debug, warn};

use crate::charset::{from_cpm, to_cpm};

/// Largest file the guest can address: 65536 records of 128 bytes.
pub const MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// The identifier check word stored alongside the identifier in FCB
/// bytes 16..19; a mismatch marks the FCB as referring to no open file.
pub const ID_CHECK: u16 = 0xafcb;

/// Characters valid in a CP/M file name, host side (lower case).
fn is_valid_host_char(c: char) -> bool {
    matches!(c, '#' | '$' | '-' | '@' | '0'..='9' | 'a'..='z')
}

/// Characters valid in a CP/M file name, guest side (upper case);
/// question marks are allowed because names may be ambiguous.
pub fn is_valid_in_cfn(c: u8) -> bool {
    matches!(c, 0x23 | 0x24 | 0x2d | 0x3f | 0x40 | 0x30..=0x39 | 0x41..=0x5a)
}

/// Checks whether a host base name is acceptable on both sides of the
/// boundary: 1..8 name characters, optionally a dot and 1..3 extension
/// characters, all from the CP/M portable set.
pub fn is_nice_filename(name: &str) -> bool {
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, Some(ext)),
        None => (name, None),
    };
    if base.is_empty() || base.chars().count() > 8 || !base.chars().all(is_valid_host_char) {
        return false;
    }
    match ext {
        None => true,
        Some(ext) => {
            !ext.is_empty() && ext.chars().count() <= 3 && ext.chars().all(is_valid_host_char)
        }
    }
}

/// Copy a file name part (name or extension) into an FCB field: valid
/// characters up to the field width, a trailing `*` padding the rest of
/// the field with `?`. Returns the remainder of the input.
fn handle_name_part<'a>(source: &'a [u8], field: &mut [u8]) -> &'a [u8] {
    let mut taken = 0;
    while taken < source.len() && is_valid_in_cfn(source[taken]) {
        taken += 1;
    }
    let copied = taken.min(field.len());
    field[..copied].copy_from_slice(&source[..copied]);
    let mut rest = &source[taken..];
    if rest.first() == Some(&0x2a) {
        // a star pads the rest of the field with question marks
        field[copied..].fill(0x3f);
        while let Some(&c) = rest.first() {
            if c == 0x2a || is_valid_in_cfn(c) {
                rest = &rest[1..];
            } else {
                break;
            }
        }
    }
    rest
}

/// Build the drive and name part of an FCB (the first twelve bytes) from
/// a host-side file name, which may carry a `d:` drive prefix and `*`/`?`
/// wildcards. Invalid input yields a partially filled FCB, as a real
/// CCP's parser would.
pub fn setup_fcb(name: &str) -> [u8; 12] {
    let mut fcb = [0u8; 12];
    fcb[1..12].fill(0x20);
    // convert to upper case guest characters
    let mut converted = Vec::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_uppercase) {
        match to_cpm(c) {
            Some(byte) => converted.push(byte),
            None => return fcb,
        }
    }
    let mut rest: &[u8] = &converted;
    if rest.len() >= 2 && (0x41..=0x50).contains(&rest[0]) && rest[1] == 0x3a {
        fcb[0] = rest[0] - 0x41 + 1;
        rest = &rest[2..];
    }
    let (name_field, ext_field) = fcb[1..12].split_at_mut(8);
    rest = handle_name_part(rest, name_field);
    if rest.first() != Some(&0x2e) {
        return fcb;
    }
    handle_name_part(&rest[1..], ext_field);
    fcb
}

/// Extract the file name from the 11 name bytes of an FCB and render it
/// as a lower-case host name. None if the name is not valid.
pub fn unix_name_from_fcb(name_bytes: &[u8]) -> Option<String> {
    let mut fn_part = [0u8; 8];
    let mut ext_part = [0u8; 3];
    for (i, b) in fn_part.iter_mut().enumerate() {
        *b = name_bytes[i] & 0x7f;
    }
    for (i, b) in ext_part.iter_mut().enumerate() {
        *b = name_bytes[8 + i] & 0x7f;
    }
    let fn_len = 8 - fn_part.iter().rev().take_while(|&&c| c == 0x20).count();
    let ext_len = 3 - ext_part.iter().rev().take_while(|&&c| c == 0x20).count();
    if fn_len == 0 {
        return None;
    }
    if !fn_part[..fn_len].iter().all(|&c| is_valid_in_cfn(c))
        || !ext_part[..ext_len].iter().all(|&c| is_valid_in_cfn(c))
    {
        return None;
    }
    let mut name = String::new();
    for &c in &fn_part[..fn_len] {
        name.extend(from_cpm(c)?.to_lowercase());
    }
    if ext_len > 0 {
        name.push('.');
        for &c in &ext_part[..ext_len] {
            name.extend(from_cpm(c)?.to_lowercase());
        }
    }
    Some(name)
}

pub fn is_ambiguous(name: &str) -> bool {
    name.contains('?')
}

/// Render a CP/M compatible host name into the blank-padded 11-character
/// form used for matching.
pub fn prepare_name(name: &str) -> [u8; 11] {
    let mut padded = [0x20u8; 11];
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    for (i, c) in base.bytes().take(8).enumerate() {
        padded[i] = c;
    }
    for (i, c) in ext.bytes().take(3).enumerate() {
        padded[8 + i] = c;
    }
    padded
}

/// Position-by-position comparison of two padded names; a question mark
/// in the pattern matches anything.
pub fn match_name(name: &[u8; 11], pattern: &[u8; 11]) -> bool {
    name.iter().zip(pattern.iter()).all(|(&n, &p)| p == b'?' || p == n)
}

/// One match from a directory scan.
pub struct FileMatch {
    pub name: String,
    /// File size in 128-byte records.
    pub records: u32,
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

/// List the regular files in a drive directory whose names are CP/M
/// compatible and match the given (possibly ambiguous) pattern. Files
/// larger than the guest can address are invisible. Entries the host
/// cannot stat are skipped rather than fatal.
pub fn scan_directory(directory: &Path, pattern: &str, caller: &str) -> Vec<FileMatch> {
    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("{}: cannot read {}: {}", caller, directory.display(), err);
            return matches;
        }
    };
    let pattern = prepare_name(pattern);
    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !is_nice_filename(&name) {
            continue;
        }
        if !match_name(&prepare_name(&name), &pattern) {
            continue;
        }
        // lstat: files reachable only through symlinks stay invisible
        let meta = match std::fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta,
            Err(err) => {
                debug!("{}: cannot stat {}: {}", caller, entry.path().display(), err);
                continue;
            }
        };
        if !meta.is_file() || meta.len() > MAX_FILE_SIZE {
            continue;
        }
        matches.push(FileMatch {
            name,
            records: ((meta.len() + 127) / 128) as u32,
            accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    matches
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u8 {
        /// Opened on a read-only drive.
        const READONLY_DISK = 0b001;
        /// The host file itself is read-only.
        const READONLY_FILE = 0b010;
        /// Written to since open/close.
        const DIRTY = 0b100;
    }
}

pub struct OpenFile {
    pub path: PathBuf,
    pub file: File,
    pub flags: FileFlags,
}

/// Registry of open files, keyed by the 16-bit identifiers handed out to
/// guest FCBs. Identifier allocation keeps a monotone counter with
/// wrap-around and scans for reuse, so identifiers stay stable and
/// predictable for guests that inspect them.
pub struct FileRegistry {
    files: BTreeMap<u16, OpenFile>,
    next_id: u16,
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry { files: BTreeMap::new(), next_id: 1 }
    }

    /// Allocate the next free identifier, or None when all 65535 are
    /// live (which the caller treats as a guest logic error).
    pub fn allocate(&mut self) -> Option<u16> {
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id == 0xffff { 1 } else { self.next_id + 1 };
            if !self.files.contains_key(&candidate) {
                return Some(candidate);
            }
            if self.next_id == start {
                return None;
            }
        }
    }

    pub fn insert(&mut self, id: u16, file: OpenFile) {
        self.files.insert(id, file);
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut OpenFile> {
        self.files.get_mut(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.files.contains_key(&id)
    }

    pub fn remove(&mut self, id: u16) -> Option<OpenFile> {
        self.files.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Close everything still open; programs should have closed their
    /// output files themselves.
    pub fn sweep(&mut self) {
        for (_, open_file) in std::mem::take(&mut self.files) {
            if open_file.flags.contains(FileFlags::DIRTY) {
                warn!(
                    "output file {} not explicitly closed by program",
                    open_file.path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_filenames() {
        assert!(is_nice_filename("hello.txt"));
        assert!(is_nice_filename("a"));
        assert!(is_nice_filename("file#1.$$$"));
        assert!(is_nice_filename("12345678.abc"));
        assert!(!is_nice_filename(""));
        assert!(!is_nice_filename("toolongname.txt"));
        assert!(!is_nice_filename("file.long"));
        assert!(!is_nice_filename("Upper.txt"));
        assert!(!is_nice_filename("sp ace.txt"));
        assert!(!is_nice_filename(".hidden"));
        assert!(!is_nice_filename("two..dots"));
    }

    #[test]
    fn fcb_setup_pads_and_uppercases() {
        let fcb = setup_fcb("hello.txt");
        assert_eq!(fcb[0], 0);
        assert_eq!(&fcb[1..9], b"HELLO   ");
        assert_eq!(&fcb[9..12], b"TXT");
    }

    #[test]
    fn fcb_setup_reads_drive_prefix() {
        let fcb = setup_fcb("b:prog.com");
        assert_eq!(fcb[0], 2);
        assert_eq!(&fcb[1..9], b"PROG    ");
    }

    #[test]
    fn fcb_setup_expands_stars_to_question_marks() {
        let fcb = setup_fcb("ab*.c*");
        assert_eq!(&fcb[1..9], b"AB??????");
        assert_eq!(&fcb[9..12], b"C??");
    }

    #[test]
    fn unix_name_round_trip() {
        let fcb = setup_fcb("hello.txt");
        assert_eq!(unix_name_from_fcb(&fcb[1..12]).as_deref(), Some("hello.txt"));
        let fcb = setup_fcb("noext");
        assert_eq!(unix_name_from_fcb(&fcb[1..12]).as_deref(), Some("noext"));
    }

    #[test]
    fn empty_name_is_invalid() {
        let name = [0x20u8; 11];
        assert_eq!(unix_name_from_fcb(&name), None);
    }

    #[test]
    fn matching_honors_question_marks() {
        let pattern = prepare_name("a?c.t?t");
        assert!(match_name(&prepare_name("abc.txt"), &pattern));
        assert!(match_name(&prepare_name("azc.tot"), &pattern));
        assert!(!match_name(&prepare_name("abd.txt"), &pattern));
        assert!(!match_name(&prepare_name("abc.tx"), &pattern));
    }

    #[test]
    fn identifier_allocation_skips_live_ids() {
        let mut registry = FileRegistry::new();
        let first = registry.allocate().unwrap();
        assert_eq!(first, 1);
        // nothing was inserted under 1, so it may be reused after wrap;
        // insert a placeholder to pin it
        let file = OpenFile {
            path: PathBuf::from("x"),
            file: tempfile::tempfile().unwrap(),
            flags: FileFlags::empty(),
        };
        registry.insert(first, file);
        registry.next_id = 0xffff;
        assert_eq!(registry.allocate().unwrap(), 0xffff);
        // wraps past 0 and skips the live identifier 1
        assert_eq!(registry.allocate().unwrap(), 2);
    }

    #[test]
    fn directory_scan_filters_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("other.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("NotNice.txt"), b"x").unwrap();
        let matches = scan_directory(dir.path(), "?????.txt", "test");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "hello.txt");
        assert_eq!(matches[0].records, 1);
    }
}
