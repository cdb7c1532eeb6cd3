use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use log::LevelFilter;

use emz80::{Config, Emulator, Throttle};

/// Runs unmodified CP/M-2.2 programs on a POSIX host.
#[derive(Parser)]
#[command(name = "cpmrun", version, about)]
struct Cli {
    /// Map a drive to a host directory, e.g. `a=./work` or `b=/data:ro`
    /// (repeatable). With no mapping at all, a: becomes the current
    /// directory.
    #[arg(short = 'm', long = "drive", value_name = "LETTER=DIR[:ro]")]
    drive: Vec<String>,

    /// Default drive letter (a..p).
    #[arg(short = 'd', long = "default-drive", value_name = "LETTER", default_value = "a")]
    default_drive: char,

    /// Never actually close files, for programs that keep using FCBs
    /// after closing them.
    #[arg(short = 'n', long = "dont-close")]
    dont_close: bool,

    /// Printer output file (append).
    #[arg(long, value_name = "FILE")]
    printer: Option<PathBuf>,

    /// Write printer output byte for byte instead of as text.
    #[arg(long)]
    printer_raw: bool,

    /// Punch output file (append).
    #[arg(long, value_name = "FILE")]
    punch: Option<PathBuf>,

    /// Write punch output byte for byte instead of as text.
    #[arg(long)]
    punch_raw: bool,

    /// Reader input file.
    #[arg(long, value_name = "FILE")]
    reader: Option<PathBuf>,

    /// Read the reader file byte for byte instead of as text.
    #[arg(long)]
    reader_raw: bool,

    /// Sleep NANOS nanoseconds every COUNT emulated instructions.
    #[arg(long, value_name = "COUNT/NANOS")]
    throttle: Option<String>,

    /// Write a machine state dump to the log at the given events
    /// (repeatable).
    #[arg(long, value_enum, value_name = "EVENT")]
    dump: Vec<DumpEvent>,

    /// Increase verbosity; repeat for OS call traces and instruction
    /// counters.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Command to run: a Unix path (with a slash) or a drive-relative
    /// CP/M name; the .com extension may be left off.
    command: String,

    /// Arguments passed to the guest program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, ValueEnum)]
enum DumpEvent {
    Startup,
    Exit,
    Error,
    Signal,
    All,
}

fn parse_drive_spec(spec: &str) -> Result<(usize, PathBuf, bool)> {
    let (letter_part, rest) =
        spec.split_once('=').with_context(|| format!("invalid drive mapping `{spec}`"))?;
    let mut letters = letter_part.chars();
    let letter = letters
        .next()
        .filter(|c| ('a'..='p').contains(c) && letters.next().is_none())
        .with_context(|| format!("invalid drive letter in `{spec}` (a..p expected)"))?;
    let (dir, read_only) = match rest.strip_suffix(":ro") {
        Some(dir) => (dir, true),
        None => (rest, false),
    };
    if dir.is_empty() {
        bail!("empty directory in drive mapping `{spec}`");
    }
    Ok(((letter as u8 - b'a') as usize, PathBuf::from(dir), read_only))
}

fn parse_throttle(spec: &str) -> Result<Throttle> {
    let (count, nanoseconds) =
        spec.split_once('/').with_context(|| format!("invalid throttle `{spec}`"))?;
    let count: u32 = count.parse().with_context(|| format!("invalid throttle count `{count}`"))?;
    let nanoseconds: u64 = nanoseconds
        .parse()
        .with_context(|| format!("invalid throttle delay `{nanoseconds}`"))?;
    if count == 0 {
        bail!("throttle count must be positive");
    }
    Ok(Throttle { count, nanoseconds })
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::default();
    for spec in &cli.drive {
        let (drive, dir, read_only) = parse_drive_spec(spec)?;
        if config.drives[drive].is_some() {
            bail!("drive {} mapped more than once", (b'a' + drive as u8) as char);
        }
        config.drives[drive] = Some(dir);
        config.read_only[drive] = read_only;
    }
    if !('a'..='p').contains(&cli.default_drive) {
        bail!("invalid default drive `{}`", cli.default_drive);
    }
    config.default_drive = (cli.default_drive as u8 - b'a') as usize;
    config.command = cli.command.clone();
    config.args = cli.args.clone();
    config.printer = cli.printer.clone();
    config.printer_raw = cli.printer_raw;
    config.punch = cli.punch.clone();
    config.punch_raw = cli.punch_raw;
    config.reader = cli.reader.clone();
    config.reader_raw = cli.reader_raw;
    config.dont_close = cli.dont_close;
    if let Some(spec) = &cli.throttle {
        config.throttle = Some(parse_throttle(spec)?);
    }
    for event in &cli.dump {
        let all = *event == DumpEvent::All;
        config.dump.startup |= all || *event == DumpEvent::Startup;
        config.dump.exit |= all || *event == DumpEvent::Exit;
        config.dump.error |= all || *event == DumpEvent::Error;
        config.dump.signal |= all || *event == DumpEvent::Signal;
    }
    config.count_instructions = cli.verbose >= 2;
    config.finish();
    if !config.drive_configured(config.default_drive) {
        bail!("default drive has no definition");
    }
    Ok(config)
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
    // for security reasons, refuse to run as the super user
    if unsafe { libc::geteuid() } == 0 {
        bail!("refusing to run as the super user");
    }
    let config = build_config(&cli)?;
    let mut emulator = Emulator::new(config)?;
    emulator.run();
    Ok(emulator.exit())
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("cpmrun: {err:#}");
            process::exit(1);
        }
    }
}
