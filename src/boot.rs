// Construction of the initial machine image: the memory layout of the
// emulated CP/M computer, the command file load, and the zero page
// fixtures a freshly started program expects to find.

use std::io;
use std::path::PathBuf;

use log::info;
use thiserror::Error;

use crate::charset::to_cpm;
use crate::config::Config;
use crate::fcb::{is_nice_filename, setup_fcb};
use crate::memory::{BIOS_VECTOR_COUNT, MAGIC_ADDRESS, MEMORY_SIZE};
use crate::processor::Cpu;

// Memory layout, top down. The allocation vector is 64 bytes (512 bits:
// 512 blocks of 16 KB in an 8 MB drive); one fake DPB and one fake ALV
// are shared by all drives.
pub const ALV_SIZE: usize = 64;
pub const ALV: u16 = MAGIC_ADDRESS - ALV_SIZE as u16;
pub const DPB_SIZE: usize = 15;
pub const DPB: u16 = ALV - DPB_SIZE as u16;
pub const BIOS_VECTOR: u16 = (DPB - (BIOS_VECTOR_COUNT as u16) * 3) & 0xff00;
pub const BDOS_SIZE: u16 = 11;
pub const BDOS_START: u16 = BIOS_VECTOR - BDOS_SIZE;
pub const SERIAL_NUMBER: u16 = BDOS_START - 6;
pub const CCP_STACK_COUNT: u16 = 8;
pub const CCP_STACK: u16 = SERIAL_NUMBER - CCP_STACK_COUNT * 2;
pub const TPA_START: u16 = 0x0100;
pub const BOOT_VECTOR: u16 = 0x0000;
pub const IOBYTE: u16 = 0x0003;
pub const DRVUSER: u16 = 0x0004;
pub const BDOS_ENTRY: u16 = 0x0005;
pub const DEFAULT_FCB_1: u16 = 0x005c;
pub const DEFAULT_FCB_2: u16 = 0x006c;
pub const DEFAULT_DMA: u16 = 0x0080;
pub const DMA_SIZE: usize = 128;

const JP: u8 = 0xc3;
const RET: u8 = 0xc9;

/// 0x00 0x16 0x00 marks a vanilla 2.2 system, the rest is the serial.
const SERIAL_BYTES: [u8; 6] = [0x00, 0x16, 0x00, 0xc0, 0xff, 0xee];

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("command file name ({0}) not valid")]
    BadCommandName(String),
    #[error("command file name must end in .com")]
    BadCommandExtension,
    #[error("drive {0}: not defined")]
    DriveUnconfigured(char),
    #[error("cannot open command file {path}: {source}")]
    CommandOpen { path: PathBuf, source: io::Error },
    #[error("command file {0} too large")]
    CommandTooLarge(PathBuf),
    #[error("invalid character in command line")]
    BadCommandLine,
    #[error("too many command line arguments")]
    CommandLineTooLong,
    #[error("cannot set up console: {0}")]
    Console(#[from] io::Error),
}

/// Check the command base name; Ok(true) means .com must be appended.
fn check_command_name(name: &str) -> Result<bool, SetupError> {
    if !is_nice_filename(name) {
        return Err(SetupError::BadCommandName(name.to_string()));
    }
    match name.split_once('.') {
        Some((_, "com")) => Ok(false),
        Some(_) => Err(SetupError::BadCommandExtension),
        None => Ok(true),
    }
}

/// Resolve the command to a host path: names containing a slash are Unix
/// paths, everything else is drive-qualified or default-drive-relative.
fn resolve_command(config: &Config) -> Result<PathBuf, SetupError> {
    let command = config.command.as_str();
    if command.contains('/') {
        let base = command.rsplit('/').next().unwrap_or(command);
        let add_com = check_command_name(base)?;
        Ok(PathBuf::from(if add_com { format!("{command}.com") } else { command.to_string() }))
    } else {
        let bytes = command.as_bytes();
        let (drive, name) =
            if bytes.len() >= 2 && bytes[1] == b':' && (b'a'..=b'p').contains(&bytes[0]) {
                ((bytes[0] - b'a') as usize, &command[2..])
            } else {
                (config.default_drive, command)
            };
        if !config.drive_configured(drive) {
            return Err(SetupError::DriveUnconfigured((b'a' + drive as u8) as char));
        }
        let add_com = check_command_name(name)?;
        let file = if add_com { format!("{name}.com") } else { name.to_string() };
        Ok(config.drives[drive].as_ref().unwrap().join(file))
    }
}

/// Compose the command tail: the arguments joined by single spaces,
/// uppercased and translated to the guest character set, at most 127
/// characters.
fn command_tail(config: &Config) -> Result<Vec<u8>, SetupError> {
    let mut tail = Vec::new();
    for arg in &config.args {
        tail.push(0x20);
        for c in arg.chars().flat_map(char::to_uppercase) {
            tail.push(to_cpm(c).ok_or(SetupError::BadCommandLine)?);
        }
        if tail.len() >= DMA_SIZE {
            return Err(SetupError::CommandLineTooLong);
        }
    }
    Ok(tail)
}

/// Build the initial machine image: load the command into the TPA and
/// populate everything around it.
pub fn init(config: &Config, cpu: &mut Cpu) -> Result<(), SetupError> {
    let command_file = resolve_command(config)?;
    let image = std::fs::read(&command_file)
        .map_err(|source| SetupError::CommandOpen { path: command_file.clone(), source })?;
    // the image may use the TPA up to the start of the CCP area
    if image.len() > (CCP_STACK - TPA_START) as usize {
        return Err(SetupError::CommandTooLarge(command_file));
    }
    cpu.mem.slice_mut(TPA_START, image.len()).copy_from_slice(&image);
    // RET in every magic address, so any branch into the sentinel range
    // degenerates to a trap on return
    cpu.mem.fill(MAGIC_ADDRESS, MEMORY_SIZE - MAGIC_ADDRESS as usize, RET);
    // the CCP stack, with a pushed return address to WBOOT: a program
    // returning from its top level exits cleanly
    cpu.regs.sp = SERIAL_NUMBER;
    cpu.push(BIOS_VECTOR + 3);
    cpu.mem.slice_mut(SERIAL_NUMBER, 6).copy_from_slice(&SERIAL_BYTES);
    // BDOS stub jumps to the first magic address
    cpu.mem.set(BDOS_START, JP);
    cpu.mem.set_word(BDOS_START + 1, MAGIC_ADDRESS);
    // four dummy error vectors, all pointing to the WBOOT magic address
    for i in 0..4 {
        cpu.mem.set_word(BDOS_START + 3 + 2 * i, MAGIC_ADDRESS + 2);
    }
    // BIOS jump vector: 18 entries, one per magic slot
    for i in 0..BIOS_VECTOR_COUNT as u16 {
        cpu.mem.set(BIOS_VECTOR + i * 3, JP);
        cpu.mem.set_word(BIOS_VECTOR + i * 3 + 1, MAGIC_ADDRESS + 1 + i);
    }
    write_dpb(cpu);
    // zero page fixtures
    cpu.mem.set(BOOT_VECTOR, JP);
    cpu.mem.set_word(BOOT_VECTOR + 1, BIOS_VECTOR + 3);
    cpu.mem.set(IOBYTE, 0x00);
    cpu.mem.set(DRVUSER, config.default_drive as u8);
    cpu.mem.set(BDOS_ENTRY, JP);
    cpu.mem.set_word(BDOS_ENTRY + 1, BDOS_START);
    // command tail with leading length byte
    let tail = command_tail(config)?;
    cpu.mem.set(DEFAULT_DMA, tail.len() as u8);
    cpu.mem.slice_mut(DEFAULT_DMA + 1, tail.len()).copy_from_slice(&tail);
    // the two default FCBs are parsed from the first two arguments
    cpu.mem.fill(DEFAULT_FCB_1, 36, 0);
    let fcb1 = setup_fcb(config.args.first().map(String::as_str).unwrap_or(""));
    cpu.mem.slice_mut(DEFAULT_FCB_1, 12).copy_from_slice(&fcb1);
    let fcb2 = setup_fcb(config.args.get(1).map(String::as_str).unwrap_or(""));
    cpu.mem.slice_mut(DEFAULT_FCB_2, 12).copy_from_slice(&fcb2);
    cpu.regs.pc = TPA_START;
    info!("starting execution of program {}", command_file.display());
    Ok(())
}

/// The fake disk parameter block: a 8 MB drive with 16 KB blocks and
/// 2048 directory entries, plus the matching allocation vector.
fn write_dpb(cpu: &mut Cpu) {
    // SPT (sectors per track)
    cpu.mem.set_word(DPB, 32);
    // BSH (block shift), BLM (block mask): 16K blocks
    cpu.mem.set(DPB + 2, 7);
    cpu.mem.set(DPB + 3, 127);
    // EXM (extent mask)
    cpu.mem.set(DPB + 4, 7);
    // DSM (number of data blocks - 1)
    cpu.mem.set_word(DPB + 5, 511);
    // DRM (number of directory entries - 1)
    cpu.mem.set_word(DPB + 7, 2047);
    // AL0, AL1 (directory block vector)
    cpu.mem.set(DPB + 9, 0xf0);
    cpu.mem.set(DPB + 10, 0x00);
    // CKS (directory check vector size): fixed disk
    cpu.mem.set_word(DPB + 11, 0);
    // OFF (reserved tracks)
    cpu.mem.set_word(DPB + 13, 0);
    // the allocation vector marks only the directory blocks used
    cpu.mem.set(ALV, 0xf0);
    cpu.mem.set(ALV + 1, 0x00);
    cpu.mem.fill(ALV + 2, ALV_SIZE - 2, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_consistent() {
        assert_eq!(ALV, 0xffad);
        assert_eq!(DPB, 0xff9e);
        assert_eq!(BIOS_VECTOR, 0xff00);
        assert_eq!(BDOS_START, 0xfef5);
        assert_eq!(SERIAL_NUMBER, 0xfeef);
        assert_eq!(CCP_STACK, 0xfedf);
        assert!(BIOS_VECTOR + (BIOS_VECTOR_COUNT as u16) * 3 <= DPB);
    }

    #[test]
    fn command_names_are_checked() {
        assert!(matches!(check_command_name("prog"), Ok(true)));
        assert!(matches!(check_command_name("prog.com"), Ok(false)));
        assert!(matches!(check_command_name("prog.txt"), Err(SetupError::BadCommandExtension)));
        assert!(matches!(check_command_name("Prog"), Err(SetupError::BadCommandName(_))));
    }

    #[test]
    fn boot_builds_the_expected_zero_page() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prog.com"), [0x76]).unwrap();
        let mut config = Config::default();
        config.drives[0] = Some(dir.path().to_path_buf());
        config.command = "prog".into();
        config.args = vec!["hello.txt".into(), "b:out".into()];
        let mut cpu = Cpu::new();
        init(&config, &mut cpu).unwrap();
        // JP WBOOT at 0, JP BDOS at 5
        assert_eq!(cpu.mem.get(0x0000), 0xc3);
        assert_eq!(cpu.mem.get_word(0x0001), BIOS_VECTOR + 3);
        assert_eq!(cpu.mem.get(0x0005), 0xc3);
        assert_eq!(cpu.mem.get_word(0x0006), BDOS_START);
        // program loaded at 0x0100
        assert_eq!(cpu.mem.get(0x0100), 0x76);
        assert_eq!(cpu.regs.pc, 0x0100);
        // command tail: " HELLO.TXT B:OUT"
        let len = cpu.mem.get(DEFAULT_DMA) as usize;
        let tail: Vec<u8> = cpu.mem.slice(DEFAULT_DMA + 1, len).to_vec();
        assert_eq!(tail, b" HELLO.TXT B:OUT");
        // default FCBs parsed from the first two arguments
        assert_eq!(cpu.mem.slice(DEFAULT_FCB_1 + 1, 11), b"HELLO   TXT");
        assert_eq!(cpu.mem.get(DEFAULT_FCB_2), 2);
        assert_eq!(cpu.mem.slice(DEFAULT_FCB_2 + 1, 11), b"OUT        ");
        // the sentinel range is carpeted with RET
        for address in MAGIC_ADDRESS..=0xffff {
            assert_eq!(cpu.mem.get(address), 0xc9);
        }
        // the CCP stack points a top-level RET at WBOOT
        assert_eq!(cpu.regs.sp, SERIAL_NUMBER - 2);
        assert_eq!(cpu.mem.get_word(cpu.regs.sp), BIOS_VECTOR + 3);
    }

    #[test]
    fn oversized_images_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let huge = vec![0u8; (CCP_STACK - TPA_START) as usize + 1];
        std::fs::write(dir.path().join("big.com"), huge).unwrap();
        let mut config = Config::default();
        config.drives[0] = Some(dir.path().to_path_buf());
        config.command = "big".into();
        let mut cpu = Cpu::new();
        assert!(matches!(init(&config, &mut cpu), Err(SetupError::CommandTooLarge(_))));
    }

    #[test]
    fn unix_path_commands_bypass_the_drives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.com"), [0x00]).unwrap();
        let mut config = Config::default();
        config.command = format!("{}/tool", dir.path().display());
        config.finish();
        let path = resolve_command(&config).unwrap();
        assert_eq!(path, dir.path().join("tool.com"));
    }
}
