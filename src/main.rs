//! cowmon: an interactive monitor over a simulated copy-on-write kernel.
//!
//! Boots a process manager, loads a small `init` process (text, data, a
//! shared page and a stack with a frame-pointer chain) and reads monitor
//! commands from stdin.

mod logger;

use std::fmt;
use std::io::{self, BufRead, Write};

use kernel::backtrace::{FunctionSymbol, SymbolTable};
use kernel::memory::layout::{self, PAGE_SIZE, USTACKTOP, UTEXT};
use kernel::memory::PagePermissions;
use kernel::monitor::Monitor;
use kernel::process::{ProcessId, ProcessManager, SyscallError, UserContext, VmSyscalls};
use kernel::trap::AccessError;

/// Environment variable holding the physical frame count.
const FRAMES_ENV: &str = "COWMON_FRAMES";
const DEFAULT_FRAMES: usize = 1024;
const MAX_PROCESSES: usize = 64;

const DATA: u64 = UTEXT + PAGE_SIZE;
const SHARED: u64 = UTEXT + 2 * PAGE_SIZE;
const STACK: u64 = USTACKTOP - PAGE_SIZE;

#[derive(Debug)]
enum SetupError {
    Syscall(SyscallError),
    Access(AccessError),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Syscall(e) => write!(f, "{}", e),
            SetupError::Access(e) => write!(f, "{}", e),
        }
    }
}

impl From<SyscallError> for SetupError {
    fn from(e: SyscallError) -> Self {
        SetupError::Syscall(e)
    }
}

impl From<AccessError> for SetupError {
    fn from(e: AccessError) -> Self {
        SetupError::Access(e)
    }
}

fn frames_from_env() -> usize {
    match std::env::var(FRAMES_ENV) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            log::warn!("{}={:?} is not a number, using {}", FRAMES_ENV, value, DEFAULT_FRAMES);
            DEFAULT_FRAMES
        }),
        Err(_) => DEFAULT_FRAMES,
    }
}

/// Functions of the `init` image, as (start offset in text, size, name, line).
const INIT_FUNCTIONS: [(u64, u64, &str, u32); 3] = [
    (0x020, 0x60, "libmain", 23),
    (0x080, 0x80, "umain", 9),
    (0x100, 0x40, "compute", 30),
];

fn init_symbols() -> SymbolTable {
    let mut table = SymbolTable::new();
    for (offset, size, name, line) in INIT_FUNCTIONS {
        table.insert(FunctionSymbol {
            start: UTEXT + offset,
            size,
            name: name.to_string(),
            file: format!("user/{}.c", if name == "libmain" { "libmain" } else { "init" }),
            line,
        });
    }
    table
}

/// Build `init`: read-only text, writable data, a shared page and a stack
/// holding three frames (compute <- umain <- libmain).
fn load_init(pm: &mut ProcessManager) -> Result<ProcessId, SetupError> {
    let pid = pm.create_process("init")?;

    pm.page_alloc(pid, UTEXT, PagePermissions::USER_RW)?;
    for (offset, _, _, _) in INIT_FUNCTIONS {
        // push rbp; mov rbp, rsp
        pm.write_user(pid, UTEXT + offset, &[0x55, 0x48, 0x89, 0xe5])?;
    }
    pm.page_map(pid, UTEXT, pid, UTEXT, PagePermissions::USER_RO)?;

    pm.page_alloc(pid, DATA, PagePermissions::USER_RW)?;
    pm.write_u64(pid, DATA, 0x1111)?;
    pm.page_alloc(pid, SHARED, PagePermissions::USER_RW | PagePermissions::SHARED)?;
    pm.write_u64(pid, SHARED, 0x2222)?;
    pm.page_alloc(pid, STACK, PagePermissions::USER_RW)?;

    // innermost first: (frame pointer, return address)
    let frames = [
        (USTACKTOP - 0x100, UTEXT + 0x0a4),
        (USTACKTOP - 0x80, UTEXT + 0x044),
        (USTACKTOP - 0x40, UTEXT + 0x030),
    ];
    for (i, &(fp, ret)) in frames.iter().enumerate() {
        let saved = frames.get(i + 1).map_or(0, |&(next, _)| next);
        pm.write_u64(pid, fp, saved)?;
        pm.write_u64(pid, fp + 8, ret)?;
        for arg in 0..5u64 {
            pm.write_u64(pid, fp + 16 + arg * 8, i as u64 * 0x10 + arg)?;
        }
    }
    pm.set_context(
        pid,
        UserContext {
            rip: UTEXT + 0x110,
            rsp: USTACKTOP - 0x110,
            rbp: frames[0].0,
            rax: 0,
        },
    )?;
    Ok(pid)
}

fn main() {
    if let Err(e) = logger::init() {
        eprintln!("cowmon: cannot install logger: {}", e);
    }
    layout::log_layout();

    let mut manager = ProcessManager::new(frames_from_env(), MAX_PROCESSES);
    let init = match load_init(&mut manager) {
        Ok(pid) => pid,
        Err(e) => {
            log::error!("cannot load init: {}", e);
            std::process::exit(1);
        }
    };
    let symbols = init_symbols();
    let mut monitor = Monitor::new(&mut manager, init, &symbols);

    println!("Welcome to the cowmon kernel monitor!");
    println!("Type 'help' for a list of commands.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("K> ");
        if io::stdout().flush().is_err() {
            break;
        }
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                log::error!("reading stdin: {}", e);
                break;
            }
            None => break,
        };
        let mut out = String::new();
        monitor.execute(&line, &mut out);
        print!("{}", out);
    }
    println!();
}
