// End-to-end scenarios: real .com images in temporary drive directories,
// executed through the public Emulator interface.

use std::path::Path;

use emz80::boot::{DEFAULT_DMA, DEFAULT_FCB_1};
use emz80::{Config, Emulator, Reason};

fn write_com(dir: &Path, name: &str, bytes: &[u8]) {
    std::fs::write(dir.join(name), bytes).unwrap();
}

fn config_for(dir: &Path, command: &str, args: &[&str]) -> Config {
    let mut config = Config::default();
    config.drives[0] = Some(dir.to_path_buf());
    config.command = command.into();
    config.args = args.iter().map(|s| s.to_string()).collect();
    config
}

#[test]
fn single_step_executes_one_instruction() {
    let dir = tempfile::tempdir().unwrap();
    // LD A,0x42; HALT
    write_com(dir.path(), "prog.com", &[0x3e, 0x42, 0x76]);
    let mut emulator = Emulator::new(config_for(dir.path(), "prog", &[])).unwrap();
    emulator.step();
    assert_eq!(emulator.cpu.regs.a, 0x42);
    assert_eq!(emulator.cpu.regs.pc, 0x0102);
}

#[test]
fn console_output_program_terminates_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    // LD C,2; LD E,'A'; CALL 5; RET
    write_com(dir.path(), "hello.com", &[0x0e, 0x02, 0x1e, 0x41, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "hello", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert_eq!(emulator.exit(), 0);
}

#[test]
fn overlapping_ldir_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    // LD HL,0x0080; LD DE,0x0080; LD BC,0x0100; LDIR; RET
    let program = [0x21, 0x80, 0x00, 0x11, 0x80, 0x00, 0x01, 0x00, 0x01, 0xed, 0xb0, 0xc9];
    write_com(dir.path(), "copy.com", &program);
    let mut emulator = Emulator::new(config_for(dir.path(), "copy", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert_eq!(emulator.cpu.regs.bc(), 0x0000);
    assert!(!emulator.cpu.regs.flags.p);
    // the overlapping copy left memory untouched
    assert_eq!(emulator.cpu.mem.slice(0x0100, program.len()), &program);
}

#[test]
fn open_stores_a_checked_file_id_in_the_fcb() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), vec![0u8; 256]).unwrap();
    // LD DE,0x005c; LD C,15; CALL 5; RET
    write_com(dir.path(), "open.com", &[0x11, 0x5c, 0x00, 0x0e, 0x0f, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator =
        Emulator::new(config_for(dir.path(), "open", &["hello.txt"])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    let id = emulator.cpu.mem.get_word(DEFAULT_FCB_1 + 16);
    let check = emulator.cpu.mem.get_word(DEFAULT_FCB_1 + 18);
    assert_ne!(id, 0);
    assert_eq!(id ^ check, 0xafcb);
}

#[test]
fn dma_without_room_for_a_record_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // LD DE,0xfff0; LD C,26; CALL 5; RET
    write_com(dir.path(), "dma.com", &[0x11, 0xf0, 0xff, 0x0e, 0x1a, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "dma", &[])).unwrap();
    emulator.run();
    // only 16 bytes remain before the address space wraps
    assert_eq!(emulator.os.termination(), Some(Reason::BdosArg));
    assert_eq!(emulator.cpu.regs.a, 0x00);
    assert_eq!(emulator.exit(), 1);
}

#[test]
fn sequential_write_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    // make file; write record 0 from the DMA area; rewind; read it back
    let program = [
        0x11, 0x5c, 0x00, // LD DE,0x005c
        0x0e, 0x16, // LD C,22 (make file)
        0xcd, 0x05, 0x00, // CALL 5
        0x11, 0x5c, 0x00, // LD DE,0x005c
        0x0e, 0x15, // LD C,21 (write sequential)
        0xcd, 0x05, 0x00, // CALL 5
        0xaf, // XOR A
        0x32, 0x7c, 0x00, // LD (0x007c),A  (current record, FCB byte 32)
        0x11, 0x5c, 0x00, // LD DE,0x005c
        0x0e, 0x14, // LD C,20 (read sequential)
        0xcd, 0x05, 0x00, // CALL 5
        0xc9, // RET
    ];
    write_com(dir.path(), "roundtrp.com", &program);
    let mut emulator =
        Emulator::new(config_for(dir.path(), "roundtrp", &["data.bin"])).unwrap();
    // the default DMA area holds the command tail at this point; that is
    // the record the program writes
    let expected: Vec<u8> = emulator.cpu.mem.slice(DEFAULT_DMA, 128).to_vec();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    // the read landed in the same buffer, byte for byte
    assert_eq!(emulator.cpu.mem.slice(DEFAULT_DMA, 128), expected.as_slice());
    // the record on disk matches too, and the offset advanced to 1
    let on_disk = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(on_disk, expected);
    assert_eq!(emulator.cpu.mem.get(DEFAULT_FCB_1 + 32), 1);
    assert_eq!(emulator.exit(), 0);
}

#[test]
fn search_synthesizes_a_directory_entry_at_the_dma() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"x").unwrap();
    // LD DE,0x005c; LD C,17; CALL 5; RET
    write_com(dir.path(), "find.com", &[0x11, 0x5c, 0x00, 0x0e, 0x11, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "find", &["*.txt"])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert_eq!(emulator.cpu.mem.slice(DEFAULT_DMA + 1, 11), b"HELLO   TXT");
    for i in 32..128 {
        assert_eq!(emulator.cpu.mem.get(DEFAULT_DMA + i), 0xe5);
    }
}

#[test]
fn calling_into_the_magic_range_behaves_like_a_service_call() {
    let dir = tempfile::tempdir().unwrap();
    // LD C,12; CALL 0xffed; RET -- calling the BDOS magic address
    // directly is indistinguishable from going through address 5
    write_com(dir.path(), "magic.com", &[0x0e, 0x0c, 0xcd, 0xed, 0xff, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "magic", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    // BDOS 12 reported version 0x22 in both A and L
    assert_eq!(emulator.cpu.regs.a, 0x22);
    assert_eq!(emulator.cpu.regs.l, 0x22);
    assert_eq!(emulator.cpu.regs.h, 0x00);
}

#[test]
fn wildcard_delete_removes_only_matches() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.tmp"), b"x").unwrap();
    std::fs::write(dir.path().join("b.tmp"), b"x").unwrap();
    std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
    // LD DE,0x005c; LD C,19; CALL 5; RET
    write_com(dir.path(), "del.com", &[0x11, 0x5c, 0x00, 0x0e, 0x13, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "del", &["*.tmp"])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert!(!dir.path().join("a.tmp").exists());
    assert!(!dir.path().join("b.tmp").exists());
    assert!(dir.path().join("keep.txt").exists());
}

#[test]
fn rename_uses_the_second_default_fcb() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.txt"), b"payload").unwrap();
    // LD DE,0x005c; LD C,23; CALL 5; RET
    write_com(dir.path(), "ren.com", &[0x11, 0x5c, 0x00, 0x0e, 0x17, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator =
        Emulator::new(config_for(dir.path(), "ren", &["old.txt", "new.txt"])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert!(!dir.path().join("old.txt").exists());
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"payload");
}

#[test]
fn deleting_on_a_read_only_drive_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"x").unwrap();
    write_com(dir.path(), "del.com", &[0x11, 0x5c, 0x00, 0x0e, 0x13, 0xcd, 0x05, 0x00, 0xc9]);
    let mut config = config_for(dir.path(), "del", &["data.txt"]);
    config.read_only[0] = true;
    let mut emulator = Emulator::new(config).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::RoDisk));
    assert!(dir.path().join("data.txt").exists());
    assert_eq!(emulator.exit(), 1);
}

#[test]
fn guest_return_codes_above_ff00_fail_the_exit() {
    let dir = tempfile::tempdir().unwrap();
    // LD DE,0xff42; LD C,108; CALL 5; RET
    write_com(dir.path(), "rc.com", &[0x11, 0x42, 0xff, 0x0e, 0x6c, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "rc", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert_eq!(emulator.exit(), 1);
}

#[test]
fn unknown_bdos_functions_return_zero() {
    let dir = tempfile::tempdir().unwrap();
    // LD HL,0xbeef; LD B,H; LD C,77; CALL 5; RET
    write_com(dir.path(), "unk.com", &[0x21, 0xef, 0xbe, 0x44, 0x0e, 0x4d, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "unk", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    assert_eq!(emulator.cpu.regs.hl(), 0x0000);
    assert_eq!(emulator.cpu.regs.bc(), 0x0000);
}

#[test]
fn selecting_an_unconfigured_drive_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // LD E,5; LD C,14; CALL 5; RET -- drive F is not configured
    write_com(dir.path(), "sel.com", &[0x1e, 0x05, 0x0e, 0x0e, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator = Emulator::new(config_for(dir.path(), "sel", &[])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Select));
    assert_eq!(emulator.exit(), 1);
}

#[test]
fn compute_file_size_rounds_up_to_records() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blob.bin"), vec![0u8; 300]).unwrap();
    // LD DE,0x005c; LD C,35; CALL 5; RET
    write_com(dir.path(), "size.com", &[0x11, 0x5c, 0x00, 0x0e, 0x23, 0xcd, 0x05, 0x00, 0xc9]);
    let mut emulator =
        Emulator::new(config_for(dir.path(), "size", &["blob.bin"])).unwrap();
    emulator.run();
    assert_eq!(emulator.os.termination(), Some(Reason::Term));
    // 300 bytes round up to 3 records in FCB bytes 33..35
    assert_eq!(emulator.cpu.mem.get(DEFAULT_FCB_1 + 33), 3);
    assert_eq!(emulator.cpu.mem.get(DEFAULT_FCB_1 + 34), 0);
    assert_eq!(emulator.cpu.mem.get(DEFAULT_FCB_1 + 35), 0);
}
