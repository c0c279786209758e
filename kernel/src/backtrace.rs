//! Frame-pointer stack walking.
//!
//! x86_64 frame layout with frame pointers enabled:
//!
//! ```text
//!   fp + 16 + 8*i   argument slot i (i < 5)
//!   fp + 8          return address
//!   fp              caller's saved frame pointer
//! ```
//!
//! The walk follows saved frame pointers until it reaches a null pointer.
//! Memory and symbol lookup are behind traits so the walker works on any
//! stack the caller can read.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::process::{ProcessId, ProcessManager};

/// Upper bound on reported frames; protects against cyclic chains.
pub const MAX_FRAMES: usize = 64;

/// Argument slots reported per frame.
pub const ARG_SLOTS: usize = 5;

/// Word-granular read access to the memory a stack lives in.
pub trait StackMemory {
    /// Read the little-endian word at `addr`, `None` if unreadable.
    fn read_u64(&self, addr: u64) -> Option<u64>;
}

/// Debug information for a code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub file: String,
    pub line: u32,
    pub function: String,
    /// Distance of the address from the function's first instruction.
    pub offset: u64,
}

/// Symbol lookup for return addresses.
pub trait SymbolResolver {
    fn resolve(&self, addr: u64) -> Option<SymbolInfo>;
}

/// One reconstructed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub frame_pointer: u64,
    pub return_address: u64,
    pub args: [u64; ARG_SLOTS],
    pub symbol: Option<SymbolInfo>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  rbp {:016x}  rip {:016x}  args",
            self.frame_pointer, self.return_address
        )?;
        for arg in &self.args {
            write!(f, " {:016x}", arg)?;
        }
        if let Some(sym) = &self.symbol {
            write!(
                f,
                "\n         {}:{}: {}+{}",
                sym.file, sym.line, sym.function, sym.offset
            )?;
        }
        Ok(())
    }
}

/// Iterator over the frames of a stack, innermost first.
pub struct StackWalker<'a> {
    memory: &'a dyn StackMemory,
    symbols: &'a dyn SymbolResolver,
    frame_pointer: u64,
    depth: usize,
}

impl<'a> StackWalker<'a> {
    pub fn new(
        memory: &'a dyn StackMemory,
        symbols: &'a dyn SymbolResolver,
        frame_pointer: u64,
    ) -> Self {
        Self {
            memory,
            symbols,
            frame_pointer,
            depth: 0,
        }
    }

    fn read_slot(&self, slot: u64) -> Option<u64> {
        let addr = self.frame_pointer.checked_add(slot * 8)?;
        self.memory.read_u64(addr)
    }

    fn read_frame(&self) -> Option<(u64, StackFrame)> {
        let saved = self.read_slot(0)?;
        let return_address = self.read_slot(1)?;
        let mut args = [0; ARG_SLOTS];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = self.read_slot(2 + i as u64)?;
        }
        let frame = StackFrame {
            frame_pointer: self.frame_pointer,
            return_address,
            args,
            symbol: self.symbols.resolve(return_address),
        };
        Some((saved, frame))
    }
}

impl Iterator for StackWalker<'_> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.frame_pointer == 0 {
            return None;
        }
        if self.depth >= MAX_FRAMES {
            log::warn!(
                "backtrace: stopping after {} frames at rbp {:#x}",
                MAX_FRAMES,
                self.frame_pointer
            );
            self.frame_pointer = 0;
            return None;
        }
        let Some((saved, frame)) = self.read_frame() else {
            log::warn!("backtrace: unreadable frame at rbp {:#x}", self.frame_pointer);
            self.frame_pointer = 0;
            return None;
        };
        self.frame_pointer = saved;
        self.depth += 1;
        Some(frame)
    }
}

/// Walk the whole chain starting at `frame_pointer`.
pub fn backtrace(
    memory: &dyn StackMemory,
    symbols: &dyn SymbolResolver,
    frame_pointer: u64,
) -> Vec<StackFrame> {
    StackWalker::new(memory, symbols, frame_pointer).collect()
}

/// A process's user stack, read without raising page faults.
pub struct UserStack<'a> {
    pub manager: &'a ProcessManager,
    pub pid: ProcessId,
}

impl StackMemory for UserStack<'_> {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        self.manager.peek_u64(self.pid, addr)
    }
}

/// One function in a [`SymbolTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub start: u64,
    pub size: u64,
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Function ranges sorted by start address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    functions: Vec<FunctionSymbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: FunctionSymbol) {
        let at = self.functions.partition_point(|f| f.start <= symbol.start);
        self.functions.insert(at, symbol);
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, addr: u64) -> Option<SymbolInfo> {
        let idx = self.functions.partition_point(|f| f.start <= addr);
        let func = self.functions.get(idx.checked_sub(1)?)?;
        let offset = addr - func.start;
        if offset >= func.size {
            return None;
        }
        Some(SymbolInfo {
            file: func.file.clone(),
            line: func.line,
            function: func.name.clone(),
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::string::ToString;

    struct FakeStack(BTreeMap<u64, u64>);

    impl FakeStack {
        /// Frames listed innermost first as (fp, return address).
        fn chain(frames: &[(u64, u64)]) -> Self {
            let mut words = BTreeMap::new();
            for (i, &(fp, ret)) in frames.iter().enumerate() {
                let saved = frames.get(i + 1).map_or(0, |&(next, _)| next);
                words.insert(fp, saved);
                words.insert(fp + 8, ret);
                for slot in 0..ARG_SLOTS as u64 {
                    words.insert(fp + 16 + slot * 8, ret + slot);
                }
            }
            Self(words)
        }
    }

    impl StackMemory for FakeStack {
        fn read_u64(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    struct CannedSymbols;

    impl SymbolResolver for CannedSymbols {
        fn resolve(&self, addr: u64) -> Option<SymbolInfo> {
            Some(SymbolInfo {
                file: "lib/test.c".to_string(),
                line: addr as u32 & 0xff,
                function: "canned".to_string(),
                offset: 4,
            })
        }
    }

    struct NoSymbols;

    impl SymbolResolver for NoSymbols {
        fn resolve(&self, _addr: u64) -> Option<SymbolInfo> {
            None
        }
    }

    #[test]
    fn test_three_frame_chain() {
        let stack = FakeStack::chain(&[(0x7000, 0x80_0100), (0x7100, 0x80_0200), (0x7200, 0x80_0300)]);
        let frames = backtrace(&stack, &CannedSymbols, 0x7000);
        assert_eq!(frames.len(), 3);
        let rets: Vec<u64> = frames.iter().map(|f| f.return_address).collect();
        assert_eq!(rets, [0x80_0100, 0x80_0200, 0x80_0300]);
        assert_eq!(frames[1].args, [0x80_0200, 0x80_0201, 0x80_0202, 0x80_0203, 0x80_0204]);
        for frame in &frames {
            let sym = frame.symbol.as_ref().unwrap();
            assert_eq!(sym.function, "canned");
            assert_eq!(sym.line, frame.return_address as u32 & 0xff);
        }
    }

    #[test]
    fn test_lookup_failure_is_cosmetic() {
        let stack = FakeStack::chain(&[(0x7000, 0x80_0100), (0x7100, 0x80_0200)]);
        let frames = backtrace(&stack, &NoSymbols, 0x7000);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.symbol.is_none()));
        assert!(!frames[0].to_string().contains('\n'));
    }

    #[test]
    fn test_null_and_unreadable_frames_stop() {
        let stack = FakeStack::chain(&[(0x7000, 0x80_0100)]);
        assert!(backtrace(&stack, &NoSymbols, 0).is_empty());
        assert!(backtrace(&stack, &NoSymbols, 0xdead_0000).is_empty());
    }

    #[test]
    fn test_cyclic_chain_is_bounded() {
        let mut stack = FakeStack::chain(&[(0x7000, 0x80_0100)]);
        stack.0.insert(0x7000, 0x7000);
        assert_eq!(backtrace(&stack, &NoSymbols, 0x7000).len(), MAX_FRAMES);
    }

    #[test]
    fn test_symbol_table_nearest_preceding() {
        let mut table = SymbolTable::new();
        for (start, name) in [(0x80_0200, "umain"), (0x80_0020, "libmain")] {
            table.insert(FunctionSymbol {
                start,
                size: 0x100,
                name: name.to_string(),
                file: "user/hello.c".to_string(),
                line: 10,
            });
        }
        assert_eq!(table.resolve(0x80_0230).unwrap().function, "umain");
        assert_eq!(table.resolve(0x80_0030).unwrap().offset, 0x10);
        assert!(table.resolve(0x80_0010).is_none());
        assert!(table.resolve(0x80_0150).is_none());
    }

    #[test]
    fn test_frame_display() {
        let frame = StackFrame {
            frame_pointer: 0x7000,
            return_address: 0x80_0100,
            args: [1, 2, 3, 4, 5],
            symbol: Some(SymbolInfo {
                file: "user/hello.c".to_string(),
                line: 7,
                function: "umain".to_string(),
                offset: 12,
            }),
        };
        let text = frame.to_string();
        assert!(text.starts_with("  rbp 0000000000007000  rip 0000000000800100  args 0000000000000001"));
        assert!(text.ends_with("\n         user/hello.c:7: umain+12"));
    }
}
