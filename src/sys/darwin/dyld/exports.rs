//! Exports Trie Parsing
//!
//! The export trie is a prefix tree over every symbol an image exports. Each
//! node carries an optional terminal payload (flags plus an image-relative
//! address, or a re-export target) followed by edges labelled with name
//! fragments. Walking it depth-first and concatenating the fragments recovers
//! the full symbol names.

use super::DyldError;
use super::leb128::ByteCursor;
use std::collections::HashSet;
use tracing::trace;

// Export symbol flags from Apple's MachOTrie.hpp
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// Where an exported symbol lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// Image-relative address; `resolver` is set for stub-and-resolver exports.
    Address { offset: u64, resolver: Option<u64> },
    /// Defined by the library at `ordinal`, under `import_name` (empty means same name).
    ReExport { ordinal: u64, import_name: String },
}

/// One terminal node of the export trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub node_offset: usize,
    pub name: String,
    pub flags: u64,
    pub target: ExportTarget,
}

impl ExportEntry {
    pub fn kind(&self) -> u64 {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
    }

    pub fn is_weak(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
    }
}

struct TrieWalker<'a> {
    trie: &'a [u8],
    name: Vec<u8>,
    visited: HashSet<usize>,
    entries: Vec<ExportEntry>,
}

impl<'a> TrieWalker<'a> {
    fn walk(&mut self, node_offset: usize) -> Result<(), DyldError> {
        if node_offset >= self.trie.len() {
            return Err(DyldError::MalformedExportTrie {
                offset: node_offset,
                reason: "node offset past end of trie",
            });
        }
        if !self.visited.insert(node_offset) {
            return Err(DyldError::MalformedExportTrie {
                offset: node_offset,
                reason: "node reached twice",
            });
        }

        let mut cursor = ByteCursor::at(self.trie, node_offset);
        let terminal_size = cursor.read_uleb128()?;
        let children_start = cursor
            .pos()
            .checked_add(terminal_size as usize)
            .filter(|&end| end <= self.trie.len())
            .ok_or(DyldError::MalformedExportTrie {
                offset: node_offset,
                reason: "terminal payload past end of trie",
            })?;

        if terminal_size != 0 {
            let entry = self.read_terminal(&mut cursor, node_offset)?;
            trace!("export {} flags 0x{:x} at node {}", entry.name, entry.flags, node_offset);
            self.entries.push(entry);
        }

        let mut cursor = ByteCursor::at(self.trie, children_start);
        let child_count = cursor.read_u8()?;
        for _ in 0..child_count {
            let fragment = cursor.read_cstr()?;
            let child_offset = cursor.read_uleb128()? as usize;
            let prefix_len = self.name.len();
            self.name.extend_from_slice(fragment);
            self.walk(child_offset)?;
            self.name.truncate(prefix_len);
        }
        Ok(())
    }

    fn read_terminal(
        &self,
        cursor: &mut ByteCursor<'a>,
        node_offset: usize,
    ) -> Result<ExportEntry, DyldError> {
        let flags = cursor.read_uleb128()?;
        let target = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let ordinal = cursor.read_uleb128()?;
            let import_name = cursor.read_cstr()?;
            ExportTarget::ReExport {
                ordinal,
                import_name: String::from_utf8_lossy(import_name).into_owned(),
            }
        } else {
            let offset = cursor.read_uleb128()?;
            let resolver = if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                Some(cursor.read_uleb128()?)
            } else {
                None
            };
            ExportTarget::Address { offset, resolver }
        };
        Ok(ExportEntry {
            node_offset,
            name: String::from_utf8_lossy(&self.name).into_owned(),
            flags,
            target,
        })
    }
}

/// Walks the export trie and returns every exported symbol in depth-first order.
pub fn parse_exports_trie(trie: &[u8]) -> Result<Vec<ExportEntry>, DyldError> {
    if trie.is_empty() {
        return Ok(Vec::new());
    }
    let mut walker = TrieWalker {
        trie,
        name: Vec::new(),
        visited: HashSet::new(),
        entries: Vec::new(),
    };
    walker.walk(0)?;
    Ok(walker.entries)
}
