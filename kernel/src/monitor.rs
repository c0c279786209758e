//! Interactive kernel monitor.
//!
//! Commands operate on the active process, selected with `use`. Every
//! failure is reported to the output and never ends the monitor.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::{self, Write};

use crate::backtrace::{StackWalker, SymbolResolver, UserStack};
use crate::memory::layout::{PAGE_SIZE, PFTEMP, USTACKTOP, UTEXT, UXSTACK, UXSTACKTOP};
use crate::memory::mappings::{for_each_page, inspect};
use crate::memory::protect::{change_permission, EditMode};
use crate::memory::{MemoryError, PagePermissions};
use crate::process::{fork, ForkError, ProcessId, ProcessManager, SyscallError};
use crate::trap::AccessError;

/// Maximum number of whitespace-separated words on a command line.
pub const MAX_ARGS: usize = 16;

/// Monitor command failures. All of them are recoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// More than `MAX_ARGS` words.
    TooManyArgs,
    /// No command with this name.
    UnknownCommand(String),
    /// Wrong number of arguments; carries the usage line.
    Usage(&'static str),
    /// An argument that does not parse.
    MalformedInput(String),
    /// Permission edit on a page with no mapping.
    NotMapped(u64),
    Memory(MemoryError),
    Syscall(SyscallError),
    Fork(ForkError),
    Access(AccessError),
    /// Writing to the output failed.
    Output,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::TooManyArgs => write!(f, "Too many arguments (max {})", MAX_ARGS),
            CommandError::UnknownCommand(name) => write!(f, "Unknown command '{}'", name),
            CommandError::Usage(usage) => write!(f, "Usage: {}", usage),
            CommandError::MalformedInput(arg) => write!(f, "Invalid number '{}'", arg),
            CommandError::NotMapped(va) => {
                write!(f, "Virtual address [{:016x}] - not mapped", va)
            }
            CommandError::Memory(e) => write!(f, "{}", e),
            CommandError::Syscall(e) => write!(f, "{}", e),
            CommandError::Fork(e) => write!(f, "fork failed: {}", e),
            CommandError::Access(e) => write!(f, "{}", e),
            CommandError::Output => write!(f, "output error"),
        }
    }
}

impl From<fmt::Error> for CommandError {
    fn from(_: fmt::Error) -> Self {
        CommandError::Output
    }
}

impl From<SyscallError> for CommandError {
    fn from(e: SyscallError) -> Self {
        CommandError::Syscall(e)
    }
}

type CommandFn = fn(&mut Monitor<'_>, &[&str], &mut dyn Write) -> Result<(), CommandError>;

struct Command {
    name: &'static str,
    desc: &'static str,
    func: CommandFn,
}

static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        desc: "Display this list of commands",
        func: mon_help,
    },
    Command {
        name: "kerninfo",
        desc: "Display address-space layout and memory usage",
        func: mon_kerninfo,
    },
    Command {
        name: "backtrace",
        desc: "Display a backtrace of the active process's stack",
        func: mon_backtrace,
    },
    Command {
        name: "showmappings",
        desc: "showmappings <start> <end>: display mappings of a range",
        func: mon_showmappings,
    },
    Command {
        name: "setperm",
        desc: "setperm <va> <perm>: replace page permissions",
        func: mon_setperm,
    },
    Command {
        name: "addperm",
        desc: "addperm <va> <perm>: add page permissions",
        func: mon_addperm,
    },
    Command {
        name: "rmperm",
        desc: "rmperm <va> <perm>: remove page permissions",
        func: mon_rmperm,
    },
    Command {
        name: "peek",
        desc: "peek <va>: read a word as the active process",
        func: mon_peek,
    },
    Command {
        name: "poke",
        desc: "poke <va> <value>: write a word as the active process",
        func: mon_poke,
    },
    Command {
        name: "ps",
        desc: "List processes",
        func: mon_ps,
    },
    Command {
        name: "fork",
        desc: "Fork the active process",
        func: mon_fork,
    },
    Command {
        name: "use",
        desc: "use <pid>: select the active process",
        func: mon_use,
    },
    Command {
        name: "cowstats",
        desc: "Display copy-on-write counters",
        func: mon_cowstats,
    },
];

/// Parse a hexadecimal literal with an optional `0x`/`0X` prefix.
pub fn parse_hex(arg: &str) -> Result<u64, CommandError> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    u64::from_str_radix(digits, 16).map_err(|_| CommandError::MalformedInput(arg.to_string()))
}

/// Split a line into at most `MAX_ARGS` words.
pub fn tokenize(line: &str) -> Result<Vec<&str>, CommandError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() > MAX_ARGS {
        return Err(CommandError::TooManyArgs);
    }
    Ok(words)
}

/// Monitor state: the process table, the active process and symbols for
/// backtraces.
pub struct Monitor<'a> {
    manager: &'a mut ProcessManager,
    active: ProcessId,
    symbols: &'a dyn SymbolResolver,
}

impl<'a> Monitor<'a> {
    pub fn new(
        manager: &'a mut ProcessManager,
        active: ProcessId,
        symbols: &'a dyn SymbolResolver,
    ) -> Self {
        Self {
            manager,
            active,
            symbols,
        }
    }

    pub fn active(&self) -> ProcessId {
        self.active
    }

    pub fn manager(&self) -> &ProcessManager {
        &*self.manager
    }

    /// Run one command line.
    pub fn run_command(&mut self, line: &str, out: &mut dyn Write) -> Result<(), CommandError> {
        let argv = tokenize(line)?;
        let Some(&name) = argv.first() else {
            return Ok(());
        };
        let command = COMMANDS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        log::debug!("monitor: {}", line.trim());
        (command.func)(self, &argv[1..], out)
    }

    /// Run one command line, printing any failure instead of returning it.
    pub fn execute(&mut self, line: &str, out: &mut dyn Write) {
        if let Err(e) = self.run_command(line, out) {
            log::debug!("monitor: '{}' failed: {:?}", line.trim(), e);
            // nothing more can be done if the output itself is broken
            let _ = writeln!(out, "{}", e);
        }
    }
}

fn mon_help(_mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    for command in COMMANDS {
        writeln!(out, "{} - {}", command.name, command.desc)?;
    }
    Ok(())
}

fn mon_kerninfo(mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    writeln!(out, "User address space:")?;
    for (name, value) in [
        ("UTEXT", UTEXT),
        ("USTACKTOP", USTACKTOP),
        ("UXSTACK", UXSTACK),
        ("UXSTACKTOP", UXSTACKTOP),
        ("PFTEMP", PFTEMP),
    ] {
        writeln!(out, "  {:<11}{:016x}", name, value)?;
    }
    let mem = mon.manager.memory();
    writeln!(
        out,
        "Physical memory: {} of {} frames in use ({}KB page size), {} shared",
        mem.frames_in_use(),
        mem.capacity(),
        PAGE_SIZE / 1024,
        mem.shared_frames()
    )?;
    Ok(())
}

fn mon_backtrace(mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let context = mon
        .manager
        .context(mon.active)
        .ok_or(CommandError::Syscall(SyscallError::NoSuchProcess))?;
    let stack = UserStack {
        manager: &*mon.manager,
        pid: mon.active,
    };
    writeln!(out, "Stack backtrace:")?;
    for frame in StackWalker::new(&stack, mon.symbols, context.rbp) {
        writeln!(out, "{}", frame)?;
    }
    Ok(())
}

fn mon_showmappings(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let [raw_start, raw_end] = args else {
        return Err(CommandError::Usage("showmappings <start> <end>"));
    };
    let start = parse_hex(raw_start)?;
    let end = parse_hex(raw_end)?;
    let space = mon.manager.address_space(mon.active)?;
    writeln!(out, "Show mappings: {} - {}.", raw_start, raw_end)?;
    for report in for_each_page(&space, mon.manager.memory(), start, end) {
        writeln!(out, "{}", report)?;
    }
    Ok(())
}

fn change_perm(
    mon: &mut Monitor<'_>,
    args: &[&str],
    mode: EditMode,
    usage: &'static str,
    out: &mut dyn Write,
) -> Result<(), CommandError> {
    let [va, perm] = args else {
        return Err(CommandError::Usage(usage));
    };
    let va = parse_hex(va)?;
    let requested = PagePermissions::decode(parse_hex(perm)?);
    let (space, mem) = mon.manager.space_and_memory(mon.active)?;
    let change = change_permission(&space, mem, va, requested, mode).map_err(|e| match e {
        MemoryError::NotMapped => CommandError::NotMapped(va & !(PAGE_SIZE - 1)),
        other => CommandError::Memory(other),
    })?;
    writeln!(
        out,
        "{} (was {})",
        inspect(&space, mon.manager.memory(), change.va),
        change.before.summary()
    )?;
    Ok(())
}

fn mon_setperm(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    change_perm(mon, args, EditMode::Set, "setperm <va> <perm>", out)
}

fn mon_addperm(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    change_perm(mon, args, EditMode::Add, "addperm <va> <perm>", out)
}

fn mon_rmperm(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    change_perm(mon, args, EditMode::Remove, "rmperm <va> <perm>", out)
}

fn mon_peek(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let [va] = args else {
        return Err(CommandError::Usage("peek <va>"));
    };
    let va = parse_hex(va)?;
    let value = mon
        .manager
        .read_u64(mon.active, va)
        .map_err(CommandError::Access)?;
    writeln!(out, "[{:016x}] = {:#x}", va, value)?;
    Ok(())
}

fn mon_poke(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let [va, value] = args else {
        return Err(CommandError::Usage("poke <va> <value>"));
    };
    let va = parse_hex(va)?;
    let value = parse_hex(value)?;
    mon.manager
        .write_u64(mon.active, va, value)
        .map_err(CommandError::Access)?;
    writeln!(out, "[{:016x}] <- {:#x}", va, value)?;
    Ok(())
}

fn mon_ps(mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    writeln!(out, "  PID PARENT STATE          NAME")?;
    for process in mon.manager.processes() {
        let marker = if process.id == mon.active { '*' } else { ' ' };
        let parent = process
            .parent
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        writeln!(
            out,
            "{}{:>4} {:>6} {:<14} {}",
            marker,
            process.id,
            parent,
            process.state.to_string(),
            process.name
        )?;
    }
    mon.manager.debug_processes();
    Ok(())
}

fn mon_fork(mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let child = fork(&mut *mon.manager, mon.active).map_err(CommandError::Fork)?;
    writeln!(out, "Process {} forked child {}", mon.active, child)?;
    Ok(())
}

fn mon_use(mon: &mut Monitor<'_>, args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    let [pid] = args else {
        return Err(CommandError::Usage("use <pid>"));
    };
    let pid = pid
        .parse::<u64>()
        .map(ProcessId::new)
        .map_err(|_| CommandError::MalformedInput(pid.to_string()))?;
    mon.manager.address_space(pid)?;
    mon.active = pid;
    writeln!(out, "Active process is now {}", pid)?;
    Ok(())
}

fn mon_cowstats(mon: &mut Monitor<'_>, _args: &[&str], out: &mut dyn Write) -> Result<(), CommandError> {
    writeln!(out, "{}", mon.manager.cow_stats())?;
    Ok(())
}
