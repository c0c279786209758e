//! Monitor commands driven through `Monitor::run_command`.

use kernel::backtrace::{FunctionSymbol, SymbolTable};
use kernel::memory::layout::{PAGE_SIZE, USTACKTOP, UTEXT};
use kernel::memory::PagePermissions;
use kernel::monitor::{CommandError, Monitor};
use kernel::process::{ProcessId, ProcessManager, ProcessState, UserContext, VmSyscalls};

const DATA: u64 = UTEXT + PAGE_SIZE;
const STACK: u64 = USTACKTOP - PAGE_SIZE;

/// Frames innermost first as (frame pointer, return address).
const FRAMES: [(u64, u64); 3] = [
    (USTACKTOP - 0x100, UTEXT + 0x0a4),
    (USTACKTOP - 0x80, UTEXT + 0x044),
    (USTACKTOP - 0x40, UTEXT + 0x030),
];

fn boot() -> (ProcessManager, ProcessId) {
    let mut pm = ProcessManager::new(128, 8);
    let pid = pm.create_process("init").unwrap();
    pm.page_alloc(pid, UTEXT, PagePermissions::USER_RO).unwrap();
    pm.page_alloc(pid, DATA, PagePermissions::USER_RW).unwrap();
    pm.page_alloc(pid, STACK, PagePermissions::USER_RW).unwrap();
    pm.write_u64(pid, DATA, 0x1111).unwrap();

    for (i, &(fp, ret)) in FRAMES.iter().enumerate() {
        let saved = FRAMES.get(i + 1).map_or(0, |&(next, _)| next);
        pm.write_u64(pid, fp, saved).unwrap();
        pm.write_u64(pid, fp + 8, ret).unwrap();
        for arg in 0..5u64 {
            pm.write_u64(pid, fp + 16 + arg * 8, arg + 1).unwrap();
        }
    }
    pm.set_context(
        pid,
        UserContext {
            rip: UTEXT + 0x110,
            rsp: USTACKTOP - 0x110,
            rbp: FRAMES[0].0,
            rax: 0,
        },
    )
    .unwrap();
    (pm, pid)
}

fn symbols() -> SymbolTable {
    let mut table = SymbolTable::new();
    for (offset, size, name, line) in [(0x20, 0x60, "libmain", 23), (0x80, 0x80, "umain", 9)] {
        table.insert(FunctionSymbol {
            start: UTEXT + offset,
            size,
            name: name.to_string(),
            file: "user/init.c".to_string(),
            line,
        });
    }
    table
}

fn run(mon: &mut Monitor<'_>, line: &str) -> String {
    let mut out = String::new();
    mon.run_command(line, &mut out).unwrap();
    out
}

#[test]
fn test_showmappings_straddling_two_unmapped_pages() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);
    assert_eq!(
        run(&mut mon, "showmappings 0xffc 0x1004"),
        "Show mappings: 0xffc - 0x1004.\n\
         Virtual address [0000000000000000] - not mapped\n\
         Virtual address [0000000000001000] - not mapped\n"
    );
}

#[test]
fn test_showmappings_mapped_range() {
    let (mut pm, init) = boot();
    let (text, _) = pm.translate(init, UTEXT).unwrap();
    let (data, _) = pm.translate(init, DATA).unwrap();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    let out = run(&mut mon, "showmappings 0x800000 0x802000");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Show mappings: 0x800000 - 0x802000.");
    assert_eq!(
        lines[1],
        format!(
            "Virtual address [0000000000800000] - mapped to [{:016x}], permission: ------U-P",
            text.start_address().as_u64()
        )
    );
    assert_eq!(
        lines[2],
        format!(
            "Virtual address [0000000000801000] - mapped to [{:016x}], permission: ------UWP",
            data.start_address().as_u64()
        )
    );
    assert_eq!(lines[3], "Virtual address [0000000000802000] - not mapped");
}

#[test]
fn test_setperm_ignores_bits_outside_whitelist() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    // 0x100 is the global bit, 0x8 write-through
    let out = run(&mut mon, "setperm 0x801000 0x10e");
    assert!(out.ends_with("permission: ------UWP (was ------UWP)\n"), "{}", out);
    assert_eq!(
        mon.manager().translate(init, DATA).unwrap().1,
        PagePermissions::USER_RW
    );

    let out = run(&mut mon, "setperm 0x801000 0x2");
    assert!(out.ends_with("permission: -------WP (was ------UWP)\n"), "{}", out);
}

#[test]
fn test_rmperm_keeps_present() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    let out = run(&mut mon, "rmperm 0x801234 0xfff");
    assert!(out.starts_with("Virtual address [0000000000801000]"), "{}", out);
    assert!(out.ends_with("permission: --------P (was ------UWP)\n"), "{}", out);
    assert_eq!(
        mon.manager().translate(init, DATA).unwrap().1,
        PagePermissions::PRESENT
    );
}

#[test]
fn test_addperm_grants_write() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    run(&mut mon, "addperm 0x800000 0x2");
    assert_eq!(
        mon.manager().translate(init, UTEXT).unwrap().1,
        PagePermissions::USER_RW
    );
}

#[test]
fn test_setperm_unmapped_creates_nothing() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);
    let frames = mon.manager().memory().frames_in_use();

    let mut out = String::new();
    assert_eq!(
        mon.run_command("setperm 0x40000000 0x7", &mut out),
        Err(CommandError::NotMapped(0x4000_0000))
    );
    assert!(out.is_empty());
    assert_eq!(mon.manager().translate(init, 0x4000_0000), None);
    assert_eq!(mon.manager().memory().frames_in_use(), frames);

    mon.execute("addperm 0x40000000 0x7", &mut out);
    assert_eq!(out, "Virtual address [0000000040000000] - not mapped\n");
}

#[test]
fn test_malformed_numbers_are_reported() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    let mut out = String::new();
    assert_eq!(
        mon.run_command("setperm 0x801000 0xzz", &mut out),
        Err(CommandError::MalformedInput("0xzz".to_string()))
    );
    mon.execute("showmappings nope 0x1000", &mut out);
    assert_eq!(out, "Invalid number 'nope'\n");
    assert_eq!(
        mon.manager().translate(init, DATA).unwrap().1,
        PagePermissions::USER_RW
    );
}

#[test]
fn test_backtrace_three_frames() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    let out = run(&mut mon, "backtrace");
    let lines: Vec<&str> = out.lines().collect();
    let args = " 0000000000000001 0000000000000002 0000000000000003 \
                0000000000000004 0000000000000005";
    assert_eq!(
        lines,
        [
            "Stack backtrace:".to_string(),
            format!("  rbp {:016x}  rip {:016x}  args{}", FRAMES[0].0, FRAMES[0].1, args),
            "         user/init.c:9: umain+36".to_string(),
            format!("  rbp {:016x}  rip {:016x}  args{}", FRAMES[1].0, FRAMES[1].1, args),
            "         user/init.c:23: libmain+36".to_string(),
            format!("  rbp {:016x}  rip {:016x}  args{}", FRAMES[2].0, FRAMES[2].1, args),
            "         user/init.c:23: libmain+16".to_string(),
        ]
    );
}

#[test]
fn test_backtrace_without_symbols() {
    let (mut pm, init) = boot();
    let table = SymbolTable::new();
    let mut mon = Monitor::new(&mut pm, init, &table);

    let out = run(&mut mon, "backtrace");
    assert_eq!(out.lines().count(), 4);
    assert!(!out.contains("user/init.c"));
}

#[test]
fn test_fork_then_write_from_each_side() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);

    assert_eq!(run(&mut mon, "fork"), "Process 1 forked child 2\n");
    assert_eq!(run(&mut mon, "use 2"), "Active process is now 2\n");
    assert_eq!(
        run(&mut mon, "poke 0x801000 0xbeef"),
        "[0000000000801000] <- 0xbeef\n"
    );
    assert_eq!(
        run(&mut mon, "peek 0x801000"),
        "[0000000000801000] = 0xbeef\n"
    );
    run(&mut mon, "use 1");
    assert_eq!(
        run(&mut mon, "peek 0x801000"),
        "[0000000000801000] = 0x1111\n"
    );

    let stats = run(&mut mon, "cowstats");
    assert_eq!(
        stats,
        "[COW STATS] forks=1 shared=0 cow=2 readonly=1 faults=1 resolved=1 copied=1\n"
    );

    let ps = run(&mut mon, "ps");
    assert!(ps.contains("*   1      - ready          init"), "{}", ps);
    assert!(ps.contains("    2      1 ready          init"), "{}", ps);
}

#[test]
fn test_bad_access_kills_only_the_active_process() {
    let (mut pm, init) = boot();
    let table = symbols();
    let mut mon = Monitor::new(&mut pm, init, &table);
    run(&mut mon, "fork");
    run(&mut mon, "use 2");

    let mut out = String::new();
    let err = mon.run_command("poke 0x800000 0x1", &mut out).unwrap_err();
    assert!(matches!(err, CommandError::Access(_)));
    let child = mon.manager().get_process(ProcessId::new(2)).unwrap();
    assert_eq!(child.state, ProcessState::Terminated(139));
    assert!(mon.manager().get_process(init).unwrap().is_alive());
}
