//! Dynamic linker for Mach-O images in an emulated address space.
//!
//! The loader maps an image and its declared dependencies into the emulated
//! VM region, one slab per image, then does what dyld would do at launch:
//! slide internal pointers (rebase), resolve imports across images (bind),
//! and record what the harness needs to initialize and run the image.
//!
//! Images live in an arena owned by [`MachOLoader`]; everything else refers
//! to them by [`ImageId`].

use crate::mmap::MappedFile;
use crate::runtime::{Cpu, Protection};
use crate::staging::{FileStager, InPlace, LibraryResolver, canonical_library_name};
use crate::symbols::SymbolTable;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub mod bind;
pub mod exports;
pub mod leb128;
pub mod macho;

use bind::*;
use macho::*;

/// Granularity of image slabs in the emulated address space.
pub const IMAGE_ALIGNMENT: u64 = 0x4000;

#[derive(Debug, Error)]
pub enum MachError {
    #[error("{size} bytes at offset {offset} run past the end of the file ({len} bytes)")]
    Truncated { offset: usize, size: usize, len: usize },
    #[error("load command at offset {offset} has invalid size {cmdsize}")]
    BadCommandSize { offset: usize, cmdsize: u32 },
    #[error("dylib command at offset {offset} has no valid name")]
    BadDylibName { offset: usize },
    #[error("segment {name} at 0x{vmaddr:x} (+0x{vmsize:x}) wraps the address space")]
    SegmentOutOfRange { name: String, vmaddr: u64, vmsize: u64 },
    #[error("section {segname},{sectname} at 0x{addr:x} (+0x{size:x}) lies outside its segment")]
    SectionOutOfRange {
        segname: String,
        sectname: String,
        addr: u64,
        size: u64,
    },
}

#[derive(Debug, Error)]
pub enum DyldError {
    #[error("unexpected end of opcode data at offset {offset}")]
    UnexpectedEnd { offset: usize },
    #[error("malformed LEB128 value at offset {offset}")]
    MalformedLeb128 { offset: usize },
    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("symbol name at offset {offset} is not valid UTF-8")]
    InvalidSymbolName { offset: usize },
    #[error("string table index {index} out of range")]
    StringIndexOutOfRange { index: u32 },
    #[error("indirect symbol index {index} out of range")]
    IndirectSymbolOutOfRange { index: usize },
    #[error("address 0x{address:x} outside segment 0x{start:x}..0x{end:x}")]
    AddressOutOfSegment { address: u64, start: u64, end: u64 },
    #[error("segment index {index} out of range ({count} segments)")]
    SegmentIndexOutOfRange { index: usize, count: usize },
    #[error("unknown rebase opcode 0x{opcode:02x} at offset {offset}")]
    UnknownRebaseOpcode { opcode: u8, offset: usize },
    #[error("unknown bind opcode 0x{opcode:02x} at offset {offset}")]
    UnknownBindOpcode { opcode: u8, offset: usize },
    #[error("malformed export trie at offset {offset}: {reason}")]
    MalformedExportTrie { offset: usize, reason: &'static str },
    #[error("unsupported library ordinal {ordinal} in {image}")]
    UnsupportedOrdinal { ordinal: i64, image: String },
    #[error("unsupported bind type {bind_type}")]
    UnsupportedBindType { bind_type: u8 },
    #[error("unsupported rebase type {rebase_type}")]
    UnsupportedRebaseType { rebase_type: u8 },
    #[error("{name} is already being loaded")]
    LoadCycle { name: String },
}

/// A segment as mapped, with its address already slid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub fileoff: u64,
    pub filesize: u64,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub maxprot: u32,
    pub initprot: u32,
}

impl Segment {
    /// Bytes copied from the file.
    pub fn mapped_size(&self) -> u64 {
        self.filesize.min(self.vmsize)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.vmaddr && address - self.vmaddr < self.vmsize
    }

    /// First address past the segment.
    pub fn end(&self) -> std::result::Result<u64, MachError> {
        self.vmaddr
            .checked_add(self.vmsize)
            .ok_or_else(|| MachError::SegmentOutOfRange {
                name: self.name.clone(),
                vmaddr: self.vmaddr,
                vmsize: self.vmsize,
            })
    }

    /// Guard regions such as `__PAGEZERO` reserve address space but are never mapped.
    fn is_guard(&self) -> bool {
        self.filesize == 0 && self.initprot == 0
    }
}

/// A section as mapped, with its address already slid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub segname: String,
    pub sectname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl Section {
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE_MASK
    }

    pub fn is_zerofill(&self) -> bool {
        matches!(
            self.section_type(),
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        )
    }

    pub fn range(&self) -> Range<u64> {
        self.addr..self.addr + self.size
    }
}

/// A library named by a load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibRef {
    /// Registry name, see [`canonical_library_name`].
    pub name: String,
    /// Install path as declared.
    pub path: String,
    pub kind: DylibKind,
    pub weak: bool,
    pub upward: bool,
}

/// Index of an image in the loader's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub usize);

/// A loaded Mach-O image.
#[derive(Debug)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub path: PathBuf,
    /// Slide applied to every link-time address.
    pub base: u64,
    /// Lowest mapped address.
    pub start: u64,
    /// Page-aligned size of the slab starting at `start`.
    pub size: u64,
    /// Address of the Mach-O header.
    pub header_address: u64,
    pub filetype: u32,
    pub segments: Vec<Segment>,
    pub sections: Vec<Section>,
    /// Load, weak and upward dependencies in declaration order.
    pub dependencies: Vec<DylibRef>,
    /// Re-exported libraries in declaration order.
    pub reexports: Vec<DylibRef>,
    /// Every dylib command; bind ordinal `n` names entry `n - 1`.
    pub ordinals: Vec<DylibRef>,
    /// `LC_MAIN` entry point.
    pub entry_point: Option<u64>,
    /// `LC_ROUTINES_64` initializers.
    pub routines: Vec<u64>,
    /// Module initializers, in section order.
    pub mod_init_funcs: Vec<u64>,
    pub text: Option<Range<u64>>,
    pub bss: Option<Range<u64>>,
    pub objc_classlist: Option<Range<u64>>,
    pub objc_catlist: Option<Range<u64>>,
    pub symbols: SymbolTable,
    pub initialized: bool,
    bind_opcodes: Vec<u8>,
    lazy_bind_opcodes: Vec<u8>,
    bound: bool,
}

impl Image {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address - self.start < self.size
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Address of `name` if this image itself defines it.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols.get_symbol_by_name(name).map(|s| s.address)
    }

    pub fn section(&self, segname: &str, sectname: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.segname == segname && s.sectname == sectname)
    }
}

/// Loader configuration.
pub struct LoaderConfig {
    /// Start of the emulated VM region images are placed in.
    pub vm_start: u64,
    pub vm_size: u64,
    pub resolver: Box<dyn LibraryResolver>,
    pub stager: Box<dyn FileStager>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            vm_start: 0x1_0000_0000,
            vm_size: 12 << 30,
            resolver: Box::new(|path: &str| -> Option<PathBuf> {
                let path = PathBuf::from(path);
                path.is_file().then_some(path)
            }),
            stager: Box::new(InPlace),
        }
    }
}

pub struct MachOLoader {
    config: LoaderConfig,
    images: Vec<Image>,
    by_name: HashMap<String, ImageId>,
    loading: HashSet<String>,
    next_base: u64,
    high_water: u64,
    vm_mapped: bool,
    reported_missing: HashSet<(String, String)>,
}

impl MachOLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            images: Vec::new(),
            by_name: HashMap::new(),
            loading: HashSet::new(),
            next_base: 0,
            high_water: 0,
            vm_mapped: false,
            reported_missing: HashSet::new(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Maps the VM region if that has not happened yet.
    pub fn map_address_space(&mut self, cpu: &mut dyn Cpu) -> Result<()> {
        if !self.vm_mapped {
            debug!(
                "mapping VM region 0x{:x} (+0x{:x})",
                self.config.vm_start, self.config.vm_size
            );
            cpu.mem_map(self.config.vm_start, self.config.vm_size, Protection::All)?;
            self.vm_mapped = true;
        }
        Ok(())
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, id: ImageId) -> &Image {
        &self.images[id.0]
    }

    pub fn image_mut(&mut self, id: ImageId) -> &mut Image {
        &mut self.images[id.0]
    }

    /// Looks an image up by registry name or install path.
    pub fn find_image(&self, name: &str) -> Option<ImageId> {
        self.by_name.get(&canonical_library_name(name)).copied()
    }

    pub fn image_containing(&self, address: u64) -> Option<&Image> {
        self.images.iter().find(|image| image.contains(address))
    }

    /// Loads the image at `path`, everything it re-exports and, with
    /// `load_dylibs`, its whole dependency graph, then binds every image
    /// that has not been bound yet.
    pub fn load_module_from_file(
        &mut self,
        cpu: &mut dyn Cpu,
        path: &Path,
        load_dylibs: bool,
    ) -> Result<ImageId> {
        let id = match self.load_image(cpu, path, load_dylibs)? {
            Some(id) => id,
            None => {
                return Err(DyldError::LoadCycle {
                    name: path.display().to_string(),
                }
                .into());
            }
        };
        self.bind_pending(cpu)?;
        Ok(id)
    }

    /// Runs the bind and lazy-bind streams of every image not bound yet.
    pub fn bind_pending(&mut self, cpu: &mut dyn Cpu) -> Result<()> {
        for index in 0..self.images.len() {
            if self.images[index].bound {
                continue;
            }
            let id = ImageId(index);
            let mut reported = std::mem::take(&mut self.reported_missing);
            let result = self.bind_image(cpu, id, &mut reported);
            self.reported_missing = reported;
            result?;
            self.images[index].bound = true;
        }
        Ok(())
    }

    /// Resolves `name` as seen by importers of `id`: its own definitions,
    /// then its re-exports.
    pub fn resolve_symbol(&self, id: ImageId, name: &str) -> Option<u64> {
        let mut visited = HashSet::new();
        self.resolve_in(id, name, &mut visited)
    }

    /// Finds `name` in any loaded image, in load order.
    pub fn find_symbol(&self, name: &str) -> Option<(ImageId, u64)> {
        self.images
            .iter()
            .find_map(|image| image.symbol_address(name).map(|addr| (image.id, addr)))
    }

    fn resolve_in(&self, id: ImageId, name: &str, visited: &mut HashSet<ImageId>) -> Option<u64> {
        if !visited.insert(id) {
            return None;
        }
        let image = self.image(id);
        if let Some(address) = image.symbol_address(name) {
            return Some(address);
        }
        if let Some(reexport) = image.symbols.reexport(name) {
            let target = (reexport.ordinal as usize)
                .checked_sub(1)
                .and_then(|i| image.ordinals.get(i))
                .and_then(|dylib| self.by_name.get(&dylib.name).copied());
            if let Some(target) = target {
                if let Some(address) = self.resolve_in(target, &reexport.import_name, visited) {
                    return Some(address);
                }
            }
        }
        image
            .reexports
            .iter()
            .filter_map(|dylib| self.by_name.get(&dylib.name).copied())
            .find_map(|target| self.resolve_in(target, name, visited))
    }

    fn load_dependency(&mut self, cpu: &mut dyn Cpu, dylib: &DylibRef, load_dylibs: bool) -> Result<()> {
        if self.by_name.contains_key(&dylib.name) {
            return Ok(());
        }
        let Some(path) = self.config.resolver.resolve(&dylib.path) else {
            warn!("skipping unresolved library {}", dylib.path);
            return Ok(());
        };
        self.load_image(cpu, &path, load_dylibs)?;
        Ok(())
    }

    fn load_image(&mut self, cpu: &mut dyn Cpu, path: &Path, load_dylibs: bool) -> Result<Option<ImageId>> {
        let name = canonical_library_name(&path.to_string_lossy());
        if let Some(id) = self.by_name.get(&name) {
            return Ok(Some(*id));
        }
        if self.loading.contains(&name) {
            warn!("{} is already being loaded, skipping", name);
            return Ok(None);
        }

        let staged = self.config.stager.stage(path)?;
        let file = MappedFile::open(&staged)?;
        let data = file.data();
        let commands = LoadCommands::parse(data)?;
        debug!("loading {} ({} load commands)", name, commands.header.ncmds);

        self.map_address_space(cpu)?;
        let (lowest, extent) = slab_extent(&commands)?;
        let base = self.place(&name, lowest, extent)?;
        let mut image = Image {
            id: ImageId(self.images.len()),
            name: name.clone(),
            path: path.to_path_buf(),
            base,
            start: lowest.wrapping_add(base),
            size: extent,
            header_address: 0,
            filetype: commands.header.filetype,
            segments: Vec::new(),
            sections: Vec::new(),
            dependencies: Vec::new(),
            reexports: Vec::new(),
            ordinals: Vec::new(),
            entry_point: None,
            routines: Vec::new(),
            mod_init_funcs: Vec::new(),
            text: None,
            bss: None,
            objc_classlist: None,
            objc_catlist: None,
            symbols: SymbolTable::new(),
            initialized: false,
            bind_opcodes: Vec::new(),
            lazy_bind_opcodes: Vec::new(),
            bound: false,
        };
        debug!(
            "{} slab 0x{:x}..0x{:x} (slide 0x{:x})",
            name,
            image.start,
            image.start + image.size,
            base
        );

        map_segments(cpu, &commands, data, &mut image)?;
        load_symbols(cpu, &commands, data, &mut image)?;
        record_dylibs(&commands, &mut image);
        if let Some(entry) = &commands.entry_point {
            image.entry_point = Some(image.header_address + entry.entryoff);
        }
        if let Some(routines) = &commands.routines {
            if routines.init_address != 0 {
                image.routines.push(routines.init_address.wrapping_add(base));
            }
        }
        let rebase_opcodes = match &commands.dyld_info {
            Some(info) => {
                image.bind_opcodes = linkedit_bytes(data, info.bind_off, info.bind_size)?.to_vec();
                image.lazy_bind_opcodes =
                    linkedit_bytes(data, info.lazy_bind_off, info.lazy_bind_size)?.to_vec();
                linkedit_bytes(data, info.rebase_off, info.rebase_size)?
            }
            None => &[],
        };

        // Re-exported symbols must be visible before anything binds against this image.
        self.loading.insert(name.clone());
        let reexports = image.reexports.clone();
        let loaded = reexports
            .iter()
            .try_for_each(|dylib| self.load_dependency(cpu, dylib, load_dylibs));
        self.loading.remove(&name);
        loaded?;

        let id = ImageId(self.images.len());
        image.id = id;
        self.by_name.insert(name.clone(), id);
        self.images.push(image);

        if base != 0 {
            let segments = self.images[id.0].segments.clone();
            rebase_image(cpu, rebase_opcodes, &segments, base)?;
        }
        let init_funcs = read_init_funcs(cpu, &self.images[id.0])?;
        self.images[id.0].mod_init_funcs = init_funcs;

        if load_dylibs {
            let dependencies = self.images[id.0].dependencies.clone();
            for dylib in &dependencies {
                self.load_dependency(cpu, dylib, load_dylibs)?;
            }
        }
        Ok(Some(id))
    }

    /// Picks the slide for an image whose mapped segments span `extent`
    /// bytes from link-time address `lowest`.
    fn place(&mut self, name: &str, lowest: u64, extent: u64) -> Result<u64> {
        let floor = self.high_water.max(self.config.vm_start);
        let mut base = self.next_base;
        if lowest.wrapping_add(base) < floor {
            base = floor - lowest;
        }
        let start = lowest.wrapping_add(base);
        let end = start
            .checked_add(extent)
            .filter(|end| *end <= self.config.vm_start + self.config.vm_size)
            .ok_or_else(|| {
                Error::MemoryMapping(format!(
                    "no room for {} (0x{:x} bytes at 0x{:x})",
                    name, extent, start
                ))
            })?;
        self.next_base = base + extent;
        self.high_water = end;
        Ok(base)
    }

    fn bind_image(
        &self,
        cpu: &mut dyn Cpu,
        id: ImageId,
        reported: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        let image = self.image(id);
        debug!("binding {}", image.name);
        let streams = [
            (BindStream::Eager, &image.bind_opcodes),
            (BindStream::Lazy, &image.lazy_bind_opcodes),
        ];
        for (stream, opcodes) in streams {
            run_bind_opcodes(
                opcodes,
                &image.segments,
                stream,
                &mut |action: &BindAction<'_>| -> Result<()> {
                    self.apply_bind(cpu, image, action, reported)
                },
            )?;
        }
        Ok(())
    }

    fn apply_bind(
        &self,
        cpu: &mut dyn Cpu,
        image: &Image,
        action: &BindAction<'_>,
        reported: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        if !matches!(action.bind_type, BIND_TYPE_POINTER | BIND_TYPE_TEXT_ABSOLUTE32) {
            return Err(DyldError::UnsupportedBindType {
                bind_type: action.bind_type,
            }
            .into());
        }
        let target = match action.library_ordinal {
            BIND_SPECIAL_DYLIB_SELF => Some(image.id),
            ordinal if ordinal < 0 => {
                return Err(DyldError::UnsupportedOrdinal {
                    ordinal,
                    image: image.name.clone(),
                }
                .into());
            }
            ordinal => {
                let Some(dylib) = image.ordinals.get(ordinal as usize - 1) else {
                    warn!(
                        "{}: library ordinal {} out of range for {}",
                        image.name, ordinal, action.symbol_name
                    );
                    return Ok(());
                };
                self.by_name.get(&dylib.name).copied()
            }
        };
        let address = target.and_then(|target| self.resolve_symbol(target, action.symbol_name));
        let Some(address) = address else {
            if reported.insert((action.symbol_name.to_string(), image.name.clone())) {
                warn!(
                    "symbol {} not found for {} (ordinal {})",
                    action.symbol_name, image.name, action.library_ordinal
                );
            }
            return Ok(());
        };
        let value = address.wrapping_add_signed(action.addend);
        trace!(
            "bind 0x{:x} = 0x{:x} ({})",
            action.address, value, action.symbol_name
        );
        match action.bind_type {
            BIND_TYPE_TEXT_ABSOLUTE32 => cpu.write_u32(action.address, value as u32),
            _ => cpu.write_u64(action.address, value),
        }
    }
}

/// Link-time lowest address and page-aligned extent of the mapped segments.
fn slab_extent(commands: &LoadCommands) -> Result<(u64, u64)> {
    let mut lowest = u64::MAX;
    let mut highest = 0;
    for segment in &commands.segments {
        let c = &segment.command;
        if c.vmsize == 0 || (c.filesize == 0 && c.initprot == 0) {
            continue;
        }
        lowest = lowest.min(c.vmaddr);
        // Wrapping extents were rejected by `LoadCommands::parse`.
        highest = highest.max(c.vmaddr + c.vmsize);
    }
    if lowest == u64::MAX {
        return Ok((0, IMAGE_ALIGNMENT));
    }
    let extent = (highest - lowest)
        .checked_next_multiple_of(IMAGE_ALIGNMENT)
        .ok_or_else(|| Error::MemoryMapping(format!("image spans 0x{:x}..0x{:x}", lowest, highest)))?;
    Ok((lowest, extent))
}

fn file_range(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start.checked_add(size as usize);
    end.and_then(|end| data.get(start..end)).ok_or_else(|| {
        MachError::Truncated {
            offset: start,
            size: size as usize,
            len: data.len(),
        }
        .into()
    })
}

fn linkedit_bytes(data: &[u8], offset: u32, size: u32) -> Result<&[u8]> {
    if size == 0 {
        return Ok(&[]);
    }
    file_range(data, u64::from(offset), u64::from(size))
}

impl From<MachError> for Error {
    fn from(err: MachError) -> Self {
        Error::ObjectFormat(err.into())
    }
}

fn map_segments(cpu: &mut dyn Cpu, commands: &LoadCommands, data: &[u8], image: &mut Image) -> Result<()> {
    let slide = image.base;
    for command in &commands.segments {
        let c = &command.command;
        let segment = Segment {
            name: fixed_name(&c.segname),
            fileoff: c.fileoff,
            filesize: c.filesize,
            vmaddr: c.vmaddr.checked_add(slide).ok_or_else(|| MachError::SegmentOutOfRange {
                name: fixed_name(&c.segname),
                vmaddr: c.vmaddr,
                vmsize: c.vmsize,
            })?,
            vmsize: c.vmsize,
            maxprot: c.maxprot,
            initprot: c.initprot,
        };
        segment.end()?;
        let mapped = segment.mapped_size();
        if mapped > 0 && !segment.is_guard() {
            trace!(
                "segment {} at 0x{:x} (0x{:x} of 0x{:x} bytes)",
                segment.name, segment.vmaddr, mapped, segment.vmsize
            );
            cpu.mem_write(segment.vmaddr, file_range(data, segment.fileoff, mapped)?)?;
        }
        if segment.fileoff == 0 && segment.filesize > 0 {
            image.header_address = segment.vmaddr;
        }

        for raw in &command.sections {
            let section = Section {
                segname: fixed_name(&raw.segname),
                sectname: fixed_name(&raw.sectname),
                addr: raw.addr.wrapping_add(slide),
                size: raw.size,
                offset: raw.offset,
                flags: raw.flags,
                reserved1: raw.reserved1,
                reserved2: raw.reserved2,
            };
            if section.is_zerofill() {
                zero_fill(cpu, section.addr, section.size)?;
            } else if section.size > 0 && section.offset != 0 {
                cpu.mem_write(
                    section.addr,
                    file_range(data, u64::from(section.offset), section.size)?,
                )?;
            }
            match (section.segname.as_str(), section.sectname.as_str()) {
                ("__TEXT", "__text") => image.text = Some(section.range()),
                (_, "__bss") => image.bss = Some(section.range()),
                (_, "__objc_classlist") => image.objc_classlist = Some(section.range()),
                (_, "__objc_catlist") => image.objc_catlist = Some(section.range()),
                _ => {}
            }
            image.sections.push(section);
        }
        image.segments.push(segment);
    }
    Ok(())
}

/// Zeroes `size` bytes at `address` a page at a time.
fn zero_fill(cpu: &mut dyn Cpu, address: u64, size: u64) -> Result<()> {
    let zeros = [0u8; IMAGE_ALIGNMENT as usize];
    let mut done = 0;
    while done < size {
        let chunk = (size - done).min(IMAGE_ALIGNMENT);
        cpu.mem_write(address + done, &zeros[..chunk as usize])?;
        done += chunk;
    }
    Ok(())
}

fn load_symbols(cpu: &mut dyn Cpu, commands: &LoadCommands, data: &[u8], image: &mut Image) -> Result<()> {
    // Link-edit offsets are file offsets; the segment places them in memory.
    let linkedit_base = image
        .segments
        .iter()
        .find(|s| s.name == "__LINKEDIT")
        .map(|s| s.vmaddr.wrapping_sub(s.fileoff));

    if let Some(symtab) = &commands.symtab {
        let nlist_size = std::mem::size_of::<nlist_64>() as u64;
        let nlists = file_range(data, u64::from(symtab.symoff), u64::from(symtab.nsyms) * nlist_size)?;
        let strtab = file_range(data, u64::from(symtab.stroff), u64::from(symtab.strsize))?;
        image
            .symbols
            .build_symbol_table(nlists, symtab.nsyms, strtab, image.base)?;
        if let Some(linkedit_base) = linkedit_base {
            cpu.mem_write(linkedit_base + u64::from(symtab.symoff), nlists)?;
            cpu.mem_write(linkedit_base + u64::from(symtab.stroff), strtab)?;
        }
    }
    if let Some(dysymtab) = &commands.dysymtab {
        let indirect = file_range(
            data,
            u64::from(dysymtab.indirectsymoff),
            u64::from(dysymtab.nindirectsyms) * 4,
        )?;
        image
            .symbols
            .build_dynamic_symbol_table(&image.sections, indirect)?;
    }

    let trie = match (&commands.dyld_info, &commands.exports_trie) {
        (_, Some(trie)) => linkedit_bytes(data, trie.dataoff, trie.datasize)?,
        (Some(info), None) => linkedit_bytes(data, info.export_off, info.export_size)?,
        (None, None) => &[],
    };
    if !trie.is_empty() {
        let entries = exports::parse_exports_trie(trie)?;
        trace!("{} exports {} symbols", image.name, entries.len());
        image.symbols.add_exports(&entries, image.header_address);
    }
    Ok(())
}

fn record_dylibs(commands: &LoadCommands, image: &mut Image) {
    for dylib in &commands.dylibs {
        let reference = DylibRef {
            name: canonical_library_name(&dylib.path),
            path: dylib.path.clone(),
            kind: dylib.kind,
            weak: dylib.kind == DylibKind::Weak,
            upward: dylib.kind == DylibKind::Upward,
        };
        match dylib.kind {
            DylibKind::Load | DylibKind::Weak | DylibKind::Upward => {
                image.dependencies.push(reference.clone())
            }
            DylibKind::ReExport => image.reexports.push(reference.clone()),
            DylibKind::Lazy => {}
        }
        image.ordinals.push(reference);
    }
}

fn rebase_image(cpu: &mut dyn Cpu, opcodes: &[u8], segments: &[Segment], slide: u64) -> Result<()> {
    run_rebase_opcodes(
        opcodes,
        segments,
        slide,
        &mut |address: u64, slide: u64, rebase_type: u8| -> Result<()> {
            match rebase_type {
                REBASE_TYPE_POINTER => {
                    let value = cpu.read_u64(address)?;
                    cpu.write_u64(address, value.wrapping_add(slide))
                }
                REBASE_TYPE_TEXT_ABSOLUTE32 => {
                    let value = cpu.read_u32(address)?;
                    cpu.write_u32(address, value.wrapping_add(slide as u32))
                }
                other => Err(DyldError::UnsupportedRebaseType { rebase_type: other }.into()),
            }
        },
    )
}

/// Reads module initializers; pointer sections must already be rebased.
fn read_init_funcs(cpu: &mut dyn Cpu, image: &Image) -> Result<Vec<u64>> {
    let mut funcs = Vec::new();
    for section in &image.sections {
        match section.section_type() {
            S_MOD_INIT_FUNC_POINTERS => {
                for slot in (section.addr..section.addr + section.size).step_by(8) {
                    funcs.push(cpu.read_u64(slot)?);
                }
            }
            S_INIT_FUNC_OFFSETS => {
                for slot in (section.addr..section.addr + section.size).step_by(4) {
                    funcs.push(image.header_address + u64::from(cpu.read_u32(slot)?));
                }
            }
            _ => {}
        }
    }
    Ok(funcs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StaticMemory;
    use crate::testutil::{MachOBuilder, SEGMENT_SIZE, ScriptedCpu, TempDir};

    const VM_START: u64 = 0x1_0000_0000;

    fn loader_with(dir: &TempDir) -> MachOLoader {
        let root = dir.path().to_path_buf();
        MachOLoader::new(LoaderConfig {
            resolver: Box::new(move |path: &str| -> Option<PathBuf> {
                let candidate = root.join(canonical_library_name(path));
                candidate.is_file().then_some(candidate)
            }),
            ..LoaderConfig::default()
        })
    }

    /// `_helper` bound from ordinal 1 into the first `__DATA` slot + 0x10.
    fn bind_helper_opcodes() -> Vec<u8> {
        let mut ops = vec![0x11, 0x40];
        ops.extend_from_slice(b"_helper\0");
        ops.extend_from_slice(&[0x51, 0x71, 0x10, 0x90, 0x00]);
        ops
    }

    #[test]
    fn test_same_file_loads_once() {
        let dir = TempDir::new("dyld-once");
        // SET_TYPE_IMM(pointer); SET_SEGMENT_AND_OFFSET_ULEB(1, 0); DO_REBASE_IMM_TIMES(1); DONE
        let lib = MachOBuilder::dylib(0)
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libhelper.dylib")
            .rebase(&[0x11, 0x21, 0x00, 0x51, 0x00])
            .bind(&bind_helper_opcodes());
        let path = dir.write("libone.dylib", &lib.build());
        dir.write(
            "libhelper.dylib",
            &MachOBuilder::dylib(0).export_symbol("_helper", 0x20).build(),
        );
        let mut cpu = ScriptedCpu::new();
        let mut loader = loader_with(&dir);
        let first = loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        let counts = cpu.access_counts();
        let slot = loader.image(first).base + lib.data_address();
        let rebased = cpu.read_u64(slot).unwrap();
        let bound = cpu.read_u64(slot + 0x10).unwrap();
        assert_ne!(bound, 0);

        let second = loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(loader.images().len(), 2);
        assert_eq!(loader.find_image("/usr/lib/libone.dylib"), Some(first));
        assert_eq!(cpu.access_counts(), counts);
        assert_eq!(cpu.read_u64(slot).unwrap(), rebased);
        assert_eq!(cpu.read_u64(slot + 0x10).unwrap(), bound);
    }

    #[test]
    fn test_images_never_overlap() {
        let dir = TempDir::new("dyld-slabs");
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/liba.dylib")
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libb.dylib")
            .build();
        let path = dir.write("app", &exe);
        dir.write("liba.dylib", &MachOBuilder::dylib(0).build());
        dir.write("libb.dylib", &MachOBuilder::dylib(0).build());
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        let id = loader.load_module_from_file(&mut cpu, &path, true).unwrap();

        let images = loader.images();
        assert_eq!(images.len(), 3);
        let main = loader.image(id);
        assert_eq!(main.base, 0);
        assert_eq!(main.header_address, VM_START);
        for (i, a) in images.iter().enumerate() {
            assert!(a.start >= VM_START);
            for b in &images[i + 1..] {
                assert!(a.start + a.size <= b.start || b.start + b.size <= a.start);
            }
        }
        assert_eq!(images[1].start, VM_START + 3 * SEGMENT_SIZE);
    }

    #[test]
    fn test_binds_symbol_from_dependency() {
        let dir = TempDir::new("dyld-bind");
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libhelper.dylib")
            .bind(&bind_helper_opcodes());
        let slot = exe.data_address() + 0x10;
        let path = dir.write("app", &exe.build());
        let lib = MachOBuilder::dylib(0).export_symbol("_helper", 0x20);
        dir.write("libhelper.dylib", &lib.build());

        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        let helper = loader.find_image("libhelper.dylib").unwrap();
        let expected = loader.image(helper).base + lib.text_address() + 0x20;
        assert_eq!(cpu.read_u64(slot).unwrap(), expected);
        assert!(loader.images().iter().all(Image::is_bound));
    }

    #[test]
    fn test_lazy_bind_entries_and_addend() {
        let dir = TempDir::new("dyld-lazy");
        // Two lazy entries, each closed by DONE; the second adds 8.
        let mut lazy = vec![0x71, 0x00, 0x11, 0x40];
        lazy.extend_from_slice(b"_helper\0");
        lazy.extend_from_slice(&[0x90, 0x00, 0x71, 0x08, 0x11, 0x60, 0x08, 0x40]);
        lazy.extend_from_slice(b"_helper\0");
        lazy.extend_from_slice(&[0x90, 0x00]);
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libhelper.dylib")
            .lazy_bind(&lazy);
        let data = exe.data_address();
        let path = dir.write("app", &exe.build());
        let lib = MachOBuilder::dylib(0).export_symbol("_helper", 0);
        dir.write("libhelper.dylib", &lib.build());

        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        let (_, helper) = loader.find_symbol("_helper").unwrap();
        assert_eq!(cpu.read_u64(data).unwrap(), helper);
        assert_eq!(cpu.read_u64(data + 8).unwrap(), helper + 8);
    }

    #[test]
    fn test_zerofill_section_clears_memory() {
        let dir = TempDir::new("dyld-bss");
        let lib = MachOBuilder::dylib(0)
            .data(&vec![0xff; SEGMENT_SIZE as usize])
            .data_section("__bss", 0x100, 0x3000, S_ZEROFILL);
        let path = dir.write("libbss.dylib", &lib.build());
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        let id = loader.load_module_from_file(&mut cpu, &path, true).unwrap();

        let image = loader.image(id);
        let start = image.base + lib.data_address() + 0x100;
        assert_eq!(image.bss, Some(start..start + 0x3000));
        assert!(cpu.read_bytes(start, 0x3000).unwrap().iter().all(|b| *b == 0));
        assert_eq!(cpu.read_bytes(start - 0x10, 0x10).unwrap(), vec![0xff; 0x10]);
        assert_eq!(cpu.read_bytes(start + 0x3000, 0x10).unwrap(), vec![0xff; 0x10]);
    }

    #[test]
    fn test_rebase_and_init_funcs() {
        let dir = TempDir::new("dyld-rebase");
        let mut data = vec![0u8; 0x20];
        data[..8].copy_from_slice(&0x1040u64.to_le_bytes());
        data[8..16].copy_from_slice(&0x1080u64.to_le_bytes());
        // type pointer, segment 1 offset 0, rebase twice
        let lib = MachOBuilder::dylib(0)
            .data(&data)
            .data_section("__mod_init_func", 0, 0x10, S_MOD_INIT_FUNC_POINTERS)
            .rebase(&[0x11, 0x21, 0x00, 0x52, 0x00])
            .routine(0x100);
        let path = dir.write("libinit.dylib", &lib.build());

        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        let id = loader.load_module_from_file(&mut cpu, &path, false).unwrap();
        let image = loader.image(id);
        assert_ne!(image.base, 0);
        let slot = image.base + lib.data_address();
        assert_eq!(cpu.read_u64(slot).unwrap(), image.base + 0x1040);
        assert_eq!(image.mod_init_funcs, vec![image.base + 0x1040, image.base + 0x1080]);
        assert_eq!(image.routines, vec![image.base + lib.text_address() + 0x100]);
        assert_eq!(image.text, Some(image.base + 0x1000..image.base + 0x1100));
    }

    #[test]
    fn test_missing_symbol_is_reported_once() {
        let dir = TempDir::new("dyld-missing");
        let mut ops = Vec::new();
        for _ in 0..2 {
            ops.extend_from_slice(&[0x11, 0x40]);
            ops.extend_from_slice(b"_absent\0");
            ops.extend_from_slice(&[0x51, 0x71, 0x00, 0x90]);
        }
        ops.push(0x00);
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libhelper.dylib")
            .bind(&ops);
        let path = dir.write("app", &exe.build());
        dir.write("libhelper.dylib", &MachOBuilder::dylib(0).build());

        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        assert_eq!(loader.reported_missing.len(), 1);
        assert_eq!(cpu.read_u64(exe.data_address()).unwrap(), 0);
    }

    #[test]
    fn test_unresolved_dependency_is_skipped() {
        let dir = TempDir::new("dyld-unresolved");
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libnowhere.dylib")
            .bind(&bind_helper_opcodes());
        let path = dir.write("app", &exe.build());
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        let id = loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        assert_eq!(loader.images().len(), 1);
        assert_eq!(loader.image(id).dependencies[0].name, "libnowhere.dylib");
    }

    #[test]
    fn test_special_ordinals_are_fatal() {
        let dir = TempDir::new("dyld-special");
        let mut ops = vec![0x3f, 0x40];
        ops.extend_from_slice(b"_main\0");
        ops.extend_from_slice(&[0x51, 0x71, 0x00, 0x90, 0x00]);
        let path = dir.write("app", &MachOBuilder::executable().bind(&ops).build());
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        assert!(matches!(
            loader.load_module_from_file(&mut cpu, &path, true),
            Err(Error::DynamicLinker(DyldError::UnsupportedOrdinal { ordinal: -1, .. }))
        ));
    }

    #[test]
    fn test_bind_outside_segment_fails_load() {
        let dir = TempDir::new("dyld-bounds");
        let mut ops = vec![0x10, 0x40];
        ops.extend_from_slice(b"_main\0");
        // segment 1 offset 0x4000 is the segment end
        ops.extend_from_slice(&[0x51, 0x71, 0x80, 0x80, 0x01, 0x90, 0x00]);
        let exe = MachOBuilder::executable().export_symbol("_main", 0).bind(&ops);
        let path = dir.write("app", &exe.build());
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        assert!(matches!(
            loader.load_module_from_file(&mut cpu, &path, true),
            Err(Error::DynamicLinker(DyldError::AddressOutOfSegment { .. }))
        ));
    }

    #[test]
    fn test_reexported_symbols_resolve_through_library() {
        let dir = TempDir::new("dyld-reexport");
        let mut ops = vec![0x11, 0x40];
        ops.extend_from_slice(b"_inner\0");
        ops.extend_from_slice(&[0x51, 0x71, 0x00, 0x90, 0x00]);
        let exe = MachOBuilder::executable()
            .dependency(LC_LOAD_DYLIB, "/usr/lib/libouter.dylib")
            .bind(&ops);
        let path = dir.write("app", &exe.build());
        let outer = MachOBuilder::dylib(0)
            .dependency(LC_REEXPORT_DYLIB, "/usr/lib/libinner.dylib")
            // inner re-exports outer back, which must not loop
            .build();
        dir.write("libouter.dylib", &outer);
        let inner = MachOBuilder::dylib(0)
            .dependency(LC_REEXPORT_DYLIB, "/usr/lib/libouter.dylib")
            .export_symbol("_inner", 0x8);
        dir.write("libinner.dylib", &inner.build());

        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        loader.load_module_from_file(&mut cpu, &path, true).unwrap();
        let inner_id = loader.find_image("libinner.dylib").unwrap();
        let expected = loader.image(inner_id).base + inner.text_address() + 0x8;
        assert_eq!(cpu.read_u64(exe.data_address()).unwrap(), expected);
        assert_eq!(loader.images().len(), 3);
    }

    #[test]
    fn test_rejects_bad_images() {
        let dir = TempDir::new("dyld-bad");
        let path = dir.write("junk", b"not a mach-o file at all");
        let mut cpu = StaticMemory::new();
        let mut loader = loader_with(&dir);
        assert!(matches!(
            loader.load_module_from_file(&mut cpu, &path, true),
            Err(Error::ObjectFormat(_))
        ));
        assert!(loader.images().is_empty());
    }
}
