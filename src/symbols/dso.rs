use super::elf::{self, ElfInfo, Symbol};
use crate::thread_tree::{MapEntry, ThreadTree, is_kernel_image};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const UNKNOWN_SYMBOL: &str = "unknown";

/// Lazily loaded symbol tables for the files and kernel seen in maps.
#[derive(Debug, Default)]
pub struct DsoCache {
    /// Directory prepended to every file path, for symbols of another device.
    symfs: Option<PathBuf>,
    files: HashMap<String, Option<ElfInfo>>,
    kernel_symbols: Vec<Symbol>,
}

impl DsoCache {
    pub fn new(symfs: Option<PathBuf>) -> Self {
        DsoCache {
            symfs,
            ..Default::default()
        }
    }

    /// Use kernel symbols in /proc/kallsyms format.
    pub fn set_kallsyms(&mut self, text: &str) {
        self.kernel_symbols = elf::parse_kallsyms(text);
    }

    pub fn has_kernel_symbols(&self) -> bool {
        !self.kernel_symbols.is_empty()
    }

    fn resolve_path(&self, filename: &str) -> PathBuf {
        match &self.symfs {
            Some(root) => root.join(filename.trim_start_matches('/')),
            None => PathBuf::from(filename),
        }
    }

    fn elf_info(&mut self, filename: &str) -> Option<&ElfInfo> {
        if !self.files.contains_key(filename) {
            let path = self.resolve_path(filename);
            let info = if Path::new(filename).is_absolute() {
                elf::parse_elf(&path)
                    .map_err(|e| log::debug!("no symbols for {filename}: {e}"))
                    .ok()
            } else {
                None
            };
            self.files.insert(filename.to_string(), info);
        }
        self.files.get(filename).and_then(|i| i.as_ref())
    }

    /// Name of the function containing `ip` in `map`.
    pub fn symbol_name(&mut self, map: &MapEntry, ip: u64) -> String {
        let found = if map.in_kernel() {
            if is_kernel_image(&map.filename) {
                elf::find_symbol(&self.kernel_symbols, ip).map(|s| s.name.clone())
            } else {
                None
            }
        } else if ThreadTree::is_unknown_map(map) {
            None
        } else {
            let offset = map.file_offset(ip);
            self.elf_info(&map.filename).and_then(|info| {
                let vaddr = info.offset_to_vaddr(offset)?;
                info.find_symbol(vaddr).map(|s| s.name.clone())
            })
        };
        found.unwrap_or_else(|| UNKNOWN_SYMBOL.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::DEFAULT_KERNEL_MMAP_NAME;

    #[test]
    fn test_kernel_symbols() {
        let mut tree = ThreadTree::new();
        tree.add_kernel_map(0xffff0000, 0x10000, 0, 0, DEFAULT_KERNEL_MMAP_NAME);
        let mut cache = DsoCache::new(None);
        cache.set_kallsyms("ffff0000 T start_kernel\nffff0100 t schedule\n");
        assert!(cache.has_kernel_symbols());
        let map = tree.find_map(1, 0xffff0120);
        assert_eq!(cache.symbol_name(&map, 0xffff0120), "schedule");
        let unknown = tree.find_map(1, 0x10);
        assert_eq!(cache.symbol_name(&unknown, 0x10), UNKNOWN_SYMBOL);
    }

    #[test]
    fn test_missing_file_is_cached_as_unknown() {
        let mut tree = ThreadTree::new();
        tree.add_user_map(1, 0x1000, 0x1000, 0, 0, "/nonexistent/lib.so");
        let map = tree.find_map(1, 0x1100);
        let mut cache = DsoCache::new(Some(PathBuf::from("/tmp")));
        assert_eq!(cache.symbol_name(&map, 0x1100), UNKNOWN_SYMBOL);
        assert_eq!(cache.files.len(), 1);
        assert_eq!(
            cache.resolve_path("/system/lib/libc.so"),
            PathBuf::from("/tmp/system/lib/libc.so")
        );
    }
}
