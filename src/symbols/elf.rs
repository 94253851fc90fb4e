use crate::build_id::BuildId;
use crate::error::{Error, Result};
use object::{Object, ObjectSegment, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// A function symbol; `addr` is a virtual address in the file's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub addr: u64,
    pub len: u64,
    pub name: String,
}

impl Symbol {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.len.max(1)
    }
}

/// A loadable segment: `file_size` bytes at `file_offset` mapped at `vaddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_offset: u64,
    pub file_size: u64,
    pub vaddr: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ElfInfo {
    pub build_id: Option<BuildId>,
    pub segments: Vec<Segment>,
    /// Function symbols sorted by address.
    pub symbols: Vec<Symbol>,
}

impl ElfInfo {
    pub fn min_vaddr(&self) -> u64 {
        self.segments.iter().map(|s| s.vaddr).min().unwrap_or(0)
    }

    /// Translate a file offset, as found in a map's pgoff, to a virtual
    /// address.
    pub fn offset_to_vaddr(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| offset >= s.file_offset && offset < s.file_offset + s.file_size)
            .map(|s| s.vaddr + (offset - s.file_offset))
    }

    pub fn find_symbol(&self, vaddr: u64) -> Option<&Symbol> {
        find_symbol(&self.symbols, vaddr)
    }
}

/// The symbol covering `addr` in a list sorted by address.
pub fn find_symbol(symbols: &[Symbol], addr: u64) -> Option<&Symbol> {
    let idx = symbols.partition_point(|s| s.addr <= addr);
    symbols[..idx].last().filter(|s| s.contains(addr))
}

fn map_file(path: &Path) -> Result<memmap2::Mmap> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before returning to the
    // caller; a concurrent truncation would at worst fail the parse.
    let mmap = unsafe { memmap2::Mmap::map(&file) }?;
    Ok(mmap)
}

fn parse_error(path: &Path, e: object::Error) -> Error {
    Error::SymbolResolution(format!("Failed to parse ELF {}: {}", path.display(), e))
}

/// The GNU build id of an ELF file, if it has one.
pub fn read_build_id(path: &Path) -> Result<Option<BuildId>> {
    let mmap = map_file(path)?;
    let object = object::File::parse(&*mmap).map_err(|e| parse_error(path, e))?;
    let id = object.build_id().map_err(|e| parse_error(path, e))?;
    Ok(id.map(BuildId::from_bytes))
}

pub fn parse_elf(path: &Path) -> Result<ElfInfo> {
    let mmap = map_file(path)?;
    parse_elf_data(&mmap).map_err(|e| parse_error(path, e))
}

fn parse_elf_data(data: &[u8]) -> std::result::Result<ElfInfo, object::Error> {
    let object = object::File::parse(data)?;
    let build_id = object.build_id()?.map(BuildId::from_bytes);
    let segments = object
        .segments()
        .map(|seg| {
            let (file_offset, file_size) = seg.file_range();
            Segment {
                file_offset,
                file_size,
                vaddr: seg.address(),
            }
        })
        .collect();

    let mut symbols: Vec<Symbol> = object
        .symbols()
        .chain(object.dynamic_symbols())
        .filter(|s| s.kind() == object::SymbolKind::Text && s.address() != 0)
        .filter_map(|s| {
            let name = s.name().ok()?;
            Some(Symbol {
                addr: s.address(),
                len: s.size(),
                name: format!("{:#}", rustc_demangle::demangle(name)),
            })
        })
        .collect();
    symbols.sort_by(|a, b| a.addr.cmp(&b.addr).then(b.len.cmp(&a.len)));
    symbols.dedup_by_key(|s| s.addr);
    fill_symbol_lengths(&mut symbols, u64::MAX);
    Ok(ElfInfo {
        build_id,
        segments,
        symbols,
    })
}

/// Give zero-length symbols the gap up to the next symbol.
fn fill_symbol_lengths(symbols: &mut [Symbol], end: u64) {
    for i in 0..symbols.len() {
        if symbols[i].len == 0 {
            let next = symbols.get(i + 1).map_or(end, |s| s.addr);
            symbols[i].len = next.saturating_sub(symbols[i].addr);
        }
    }
}

/// Parse /proc/kallsyms text into text symbols. Entries with a zero
/// address, as shown to unprivileged readers, are dropped.
pub fn parse_kallsyms(text: &str) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = text
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
            let kind = parts.next()?;
            let name = parts.next()?;
            let is_text = matches!(kind, "t" | "T" | "w" | "W");
            (addr != 0 && is_text).then(|| Symbol {
                addr,
                len: 0,
                name: name.to_string(),
            })
        })
        .collect();
    symbols.sort_by_key(|s| s.addr);
    symbols.dedup_by_key(|s| s.addr);
    fill_symbol_lengths(&mut symbols, u64::MAX);
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kallsyms() {
        let symbols = parse_kallsyms(
            "ffffffff81000000 T _text\n\
             ffffffff81000100 t do_one\n\
             ffffffff81000180 D some_data\n\
             0000000000000000 T hidden\n\
             ffffffff81000200 T do_two [mod]\n",
        );
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["_text", "do_one", "do_two"]);
        assert_eq!(symbols[0].len, 0x100);
        assert_eq!(find_symbol(&symbols, 0xffffffff81000150).unwrap().name, "do_one");
        assert!(find_symbol(&symbols, 0x1000).is_none());
    }

    #[test]
    fn test_find_symbol_respects_length() {
        let symbols = vec![
            Symbol {
                addr: 0x100,
                len: 0x10,
                name: "a".to_string(),
            },
            Symbol {
                addr: 0x200,
                len: 0x10,
                name: "b".to_string(),
            },
        ];
        assert_eq!(find_symbol(&symbols, 0x105).unwrap().name, "a");
        assert!(find_symbol(&symbols, 0x150).is_none());
        assert_eq!(find_symbol(&symbols, 0x200).unwrap().name, "b");
    }

    #[test]
    fn test_parse_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let info = parse_elf(&exe).unwrap();
        assert!(!info.segments.is_empty());
        assert!(!info.symbols.is_empty());
        assert!(info.symbols.windows(2).all(|w| w[0].addr < w[1].addr));
        assert_eq!(read_build_id(&exe).unwrap(), info.build_id);
        assert!(parse_elf(Path::new("/nonexistent/binary")).is_err());
    }
}
