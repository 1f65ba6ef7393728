//! Per-image symbol lookup.
//!
//! A [`SymbolTable`] is built from an image's `nlist_64` entries and string
//! table, the indirect symbol table (which names the import behind every
//! stub and symbol-pointer slot), and the export trie. It answers lookups by
//! name, by exact address and by nearest preceding address.

use crate::Result;
use crate::sys::darwin::dyld::exports::{EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, ExportEntry, ExportTarget};
use crate::sys::darwin::dyld::macho::*;
use crate::sys::darwin::dyld::{DyldError, Section};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Defined in a section of this image.
    Defined,
    /// Absolute value, not slid.
    Absolute,
    /// Imported from another image.
    Undefined,
    /// Stub or symbol-pointer slot bound to an import.
    Import,
    /// Known only from the export trie.
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub kind: SymbolKind,
    pub external: bool,
}

/// An export that forwards to another library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReExport {
    pub ordinal: u64,
    pub import_name: String,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    /// `nlist_64` order, so indirect-table indices line up.
    nlist: Vec<Symbol>,
    extra: Vec<Symbol>,
    by_name: HashMap<String, SymbolRef>,
    by_address: BTreeMap<u64, SymbolRef>,
    reexports: HashMap<String, ReExport>,
}

#[derive(Debug, Clone, Copy)]
enum SymbolRef {
    Nlist(usize),
    Extra(usize),
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, r: SymbolRef) -> &Symbol {
        match r {
            SymbolRef::Nlist(i) => &self.nlist[i],
            SymbolRef::Extra(i) => &self.extra[i],
        }
    }

    fn index(&mut self, r: SymbolRef) {
        let sym = self.get(r).clone();
        match sym.kind {
            SymbolKind::Undefined => return,
            SymbolKind::Import => {
                self.by_address.entry(sym.address).or_insert(r);
                return;
            }
            _ => {}
        }
        // External definitions win over locals with the same name.
        match self.by_name.get(&sym.name).copied() {
            Some(existing) if self.get(existing).external || !sym.external => {}
            _ => {
                self.by_name.insert(sym.name.clone(), r);
            }
        }
        if sym.kind != SymbolKind::Absolute {
            self.by_address.entry(sym.address).or_insert(r);
        }
    }

    /// Builds the table from raw `nlist_64` bytes and the string table,
    /// sliding section symbols by `slide`.
    pub fn build_symbol_table(
        &mut self,
        nlists: &[u8],
        nsyms: u32,
        strtab: &[u8],
        slide: u64,
    ) -> Result<()> {
        for i in 0..nsyms as usize {
            let entry: nlist_64 = read_struct(nlists, i * std::mem::size_of::<nlist_64>())?;
            let name = string_at(strtab, entry.n_strx)?;
            let external = entry.n_type & N_EXT != 0;
            let (kind, address) = if entry.n_type & N_STAB != 0 {
                // Debug entries keep their slot so indirect indices stay valid.
                (SymbolKind::Undefined, 0)
            } else {
                match entry.n_type & N_TYPE {
                    N_SECT => (SymbolKind::Defined, entry.n_value.wrapping_add(slide)),
                    N_ABS => (SymbolKind::Absolute, entry.n_value),
                    _ => (SymbolKind::Undefined, 0),
                }
            };
            self.nlist.push(Symbol {
                name,
                address,
                kind,
                external,
            });
            self.index(SymbolRef::Nlist(self.nlist.len() - 1));
        }
        Ok(())
    }

    /// Names the import behind every stub and symbol-pointer slot.
    ///
    /// `indirect` is the raw indirect symbol table; section addresses must
    /// already be slid.
    pub fn build_dynamic_symbol_table(&mut self, sections: &[Section], indirect: &[u8]) -> Result<()> {
        for section in sections {
            let stride = match section.section_type() {
                S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS => 8,
                S_SYMBOL_STUBS if section.reserved2 != 0 => u64::from(section.reserved2),
                _ => continue,
            };
            let count = section.size / stride;
            for slot in 0..count {
                let index_offset = (u64::from(section.reserved1) + slot) as usize * 4;
                let raw = indirect
                    .get(index_offset..index_offset + 4)
                    .ok_or(DyldError::IndirectSymbolOutOfRange { index: index_offset / 4 })?;
                let symbol_index = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if symbol_index & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                    continue;
                }
                let Some(target) = self.nlist.get(symbol_index as usize) else {
                    return Err(DyldError::IndirectSymbolOutOfRange {
                        index: symbol_index as usize,
                    }
                    .into());
                };
                let symbol = Symbol {
                    name: target.name.clone(),
                    address: section.addr + slot * stride,
                    kind: SymbolKind::Import,
                    external: true,
                };
                self.extra.push(symbol);
                self.index(SymbolRef::Extra(self.extra.len() - 1));
            }
        }
        Ok(())
    }

    /// Merges export-trie entries; `header_address` anchors their offsets.
    pub fn add_exports(&mut self, entries: &[ExportEntry], header_address: u64) {
        for entry in entries {
            match &entry.target {
                ExportTarget::ReExport {
                    ordinal,
                    import_name,
                } => {
                    self.reexports.insert(
                        entry.name.clone(),
                        ReExport {
                            ordinal: *ordinal,
                            import_name: if import_name.is_empty() {
                                entry.name.clone()
                            } else {
                                import_name.clone()
                            },
                        },
                    );
                }
                ExportTarget::Address { offset, .. } => {
                    if self.by_name.contains_key(&entry.name) {
                        continue;
                    }
                    let address = if entry.kind() == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE {
                        *offset
                    } else {
                        header_address + offset
                    };
                    self.extra.push(Symbol {
                        name: entry.name.clone(),
                        address,
                        kind: SymbolKind::Export,
                        external: true,
                    });
                    self.index(SymbolRef::Extra(self.extra.len() - 1));
                }
            }
        }
    }

    /// Returns the definition of `name`, if this image defines it.
    pub fn get_symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|r| self.get(*r))
    }

    pub fn get_symbol_by_address(&self, address: u64) -> Option<&Symbol> {
        self.by_address.get(&address).map(|r| self.get(*r))
    }

    /// Returns the symbol with the greatest address not above `address`.
    pub fn get_symbol_near_address(&self, address: u64) -> Option<&Symbol> {
        self.by_address
            .range(..=address)
            .next_back()
            .map(|(_, r)| self.get(*r))
    }

    pub fn reexport(&self, name: &str) -> Option<&ReExport> {
        self.reexports.get(name)
    }

    /// Symbols in `nlist_64` order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.nlist
    }

    pub fn len(&self) -> usize {
        self.nlist.len() + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn string_at(strtab: &[u8], strx: u32) -> Result<String> {
    let rest = strtab
        .get(strx as usize..)
        .ok_or(DyldError::StringIndexOutOfRange { index: strx })?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DyldError::UnterminatedString { offset: strx as usize })?;
    Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
}
