// Wires a Z80 CPU to a virtual CP/M 2.2 operating system so that
// unmodified .com programs run against host directories and the
// controlling terminal. The Emulator owns the whole machine state; the
// run loop fetches and executes instructions until the guest (or a
// signal) raises the termination flag, servicing OS calls whenever
// execution lands in the magic address range at the top of memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::error;

pub mod alu;
pub mod boot;
pub mod charset;
pub mod chario;
pub mod config;
pub mod dispatch;
pub mod fcb;
pub mod instructions;
pub mod memory;
pub mod os;
pub mod processor;
pub mod registers;

pub use boot::SetupError;
pub use config::{Config, DumpPolicy, Throttle};
pub use os::{Os, Reason};
pub use processor::{Counters, Cpu, Signal};

/// Instructions between console polls, so the terminal stays responsive
/// even when the guest ignores its console for a long stretch.
pub const POLL_INTERVAL: u32 = 128 * 1024;

static TERMINATE_SIGNAL: AtomicBool = AtomicBool::new(false);
static DUMP_SIGNAL: AtomicBool = AtomicBool::new(false);

/// True once a termination signal has been delivered; blocking console
/// reads check this so the run loop gets to observe the flag.
pub(crate) fn termination_requested() -> bool {
    TERMINATE_SIGNAL.load(Ordering::Relaxed)
}

extern "C" fn signal_handler(signal: libc::c_int) {
    if signal == libc::SIGUSR1 {
        DUMP_SIGNAL.store(true, Ordering::Relaxed);
    } else {
        TERMINATE_SIGNAL.store(true, Ordering::Relaxed);
    }
}

/// Route SIGINT, SIGTERM, and SIGQUIT into the termination flag, and
/// optionally SIGUSR1 into a machine dump request. The handlers only set
/// atomics; the run loop observes them at the next instruction boundary.
fn install_signal_handlers(dump_on_signal: bool) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaddset(&mut action.sa_mask, libc::SIGTERM);
        libc::sigaddset(&mut action.sa_mask, libc::SIGQUIT);
        libc::sigaddset(&mut action.sa_mask, libc::SIGINT);
        action.sa_flags = 0;
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGQUIT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        if dump_on_signal {
            libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub os: Os,
    dump: DumpPolicy,
    throttle: Option<Throttle>,
}

impl Emulator {
    /// Build the machine: memory image, OS state, console. The console
    /// switches to raw mode last, so setup errors leave the terminal
    /// untouched.
    pub fn new(config: Config) -> Result<Emulator, SetupError> {
        let mut cpu = Cpu::new();
        if config.count_instructions {
            cpu.counters = Some(Counters::new());
        }
        // programs use R for generating random numbers, so it starts at
        // an unpredictable value
        cpu.regs.r = rand::random::<u8>() & 0x7f;
        boot::init(&config, &mut cpu)?;
        let os = Os::new(&config)?;
        if config.dump.startup {
            cpu.dump_machine("startup");
        }
        Ok(Emulator { cpu, os, dump: config.dump, throttle: config.throttle })
    }

    /// Execute one instruction, servicing a magic-address trap when one
    /// fires.
    pub fn step(&mut self) {
        match self.cpu.step() {
            Signal::Ok => {}
            Signal::OsCall(slot) => {
                self.os.call(slot, &mut self.cpu);
                // with the host service done, the RET completes normally
                let address = self.cpu.pop();
                self.cpu.regs.pc = address;
            }
        }
    }

    /// The main loop: run until the termination flag is raised by the
    /// guest, by the host services, or by a signal.
    pub fn run(&mut self) {
        install_signal_handlers(self.dump.signal);
        let mut poll_counter: u32 = 0;
        let mut delay_counter: u32 = 0;
        loop {
            if self.os.termination().is_some() {
                break;
            }
            if TERMINATE_SIGNAL.load(Ordering::Relaxed) {
                self.os.terminate(Reason::Signal);
                break;
            }
            if DUMP_SIGNAL.swap(false, Ordering::Relaxed) {
                self.cpu.dump_machine("signal");
            }
            self.step();
            poll_counter += 1;
            if poll_counter == POLL_INTERVAL {
                poll_counter = 0;
                self.os.poll_console();
            }
            if let Some(throttle) = self.throttle {
                delay_counter += 1;
                if delay_counter >= throttle.count {
                    delay_counter = 0;
                    thread::sleep(Duration::from_nanos(throttle.nanoseconds));
                }
            }
        }
    }

    /// Tear the machine down and compute the process exit code: zero
    /// for regular termination, nonzero for error terminations and for
    /// guest return codes of 0xff00 and above.
    pub fn exit(mut self) -> i32 {
        let reason = self.os.termination().unwrap_or(Reason::NotRun);
        if self.dump.exit {
            self.cpu.dump_machine("exit");
        } else if self.dump.error && reason.is_error() {
            self.cpu.dump_machine("error");
        }
        if let Some(message) = reason.message() {
            error!("{}", message);
        }
        let mut failed = reason.is_error();
        if !self.os.finish() {
            failed = true;
        }
        if let Some(counters) = self.cpu.counters.take() {
            counters.log_summary();
        }
        if failed {
            1
        } else {
            0
        }
    }
}
