// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Format constants.

/// Number of equal-sized pages each sector is divided into.
pub const PAGES_PER_SECTOR: u32 = 16;
/// Pages at the start of every sector that hold header entries.
pub const HEADER_PAGES: u32 = 2;
/// Number of header entries scanned and written per sector. The header area
/// has room for 16, but only one per data page is ever used.
pub const ENTRY_SLOTS: u32 = PAGES_PER_SECTOR - HEADER_PAGES;
/// Size of a header entry in bytes.
pub const ENTRY_SIZE: u32 = 32;
/// Payload bytes carried by one data page. The first byte of the page holds
/// the used count, which has to fit in a `u8`.
pub const PAGE_PAYLOAD: u32 = 255;
/// Smallest page size the format can describe.
pub const MIN_PAGE_SIZE: u32 = PAGE_PAYLOAD + 1;
/// Width of the filename field in a header entry.
pub const FILENAME_LEN: usize = 24;
/// Versions are stored in 7 bits and wrap at this value.
pub const VERSION_MODULUS: u8 = 0x80;

/// Offset of the last-page marker within a header entry.
pub const LAST_PAGE_OFFSET: u32 = 28;
/// Offset of the delete marker within a header entry.
pub const DELETE_OFFSET: u32 = 30;
/// Offset of the end marker within a header entry.
pub const END_OFFSET: u32 = 31;
/// Bytes written when a slot is first claimed: start marker, filename,
/// version and page sequence. Everything past this is left erased until the
/// page is finalised.
pub const CLAIM_LEN: usize = LAST_PAGE_OFFSET as usize;

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;

/// Values a marker byte may legitimately hold. Anything else is corruption.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum Marker {
    /// The marker has been programmed.
    Set = 0x55,
    /// The marker is still in its erased state.
    Erased = 0xFF,
}

/// Raw 32-byte header entry as it sits in the first two pages of a sector.
///
/// Entry `n` in a sector describes data page `n` of that sector, i.e. the
/// page at `HEADER_PAGES + n`. Nothing should interpret these bytes directly;
/// use `Slot::decode`, which checks the markers.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RawEntry {
    /// `Marker::Set` once the slot has been claimed, `Marker::Erased` while
    /// the slot is free.
    pub start: u8,
    /// Filename, NUL padded. Not NUL terminated if all 24 bytes are used.
    pub filename: [u8; FILENAME_LEN],
    /// Version of the file this page belongs to, `0..VERSION_MODULUS`.
    pub version: u8,
    /// Zero-based position of this page in its version's chain.
    pub page_seq: U16LE,
    /// `Marker::Set` if this page ends the chain.
    pub last_page: u8,
    /// Unused, left erased.
    pub reserved: u8,
    /// `Marker::Set` once the entry has been superseded or erased.
    pub delete: u8,
    /// `Marker::Set` once the page has been finalised. Must agree with
    /// `start` for the entry to be trusted.
    pub end: u8,
}

impl RawEntry {
    /// Builds the prefix written when a page is claimed. Fields that are only
    /// programmed later are left in the erased state.
    pub fn claim(name: &Filename, version: Version, page_seq: u16) -> Self {
        Self {
            start: Marker::Set as u8,
            filename: name.0,
            version: version.get(),
            page_seq: page_seq.into(),
            last_page: Marker::Erased as u8,
            reserved: Marker::Erased as u8,
            delete: Marker::Erased as u8,
            end: Marker::Erased as u8,
        }
    }
}

/// A file name as stored on flash: 1 to `FILENAME_LEN` bytes, no NUL.
///
/// Names are compared by their bytes up to the first NUL, so the stored form
/// is always zero padded.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Filename([u8; FILENAME_LEN]);

impl Filename {
    /// Validates `name` for use as a filename. Returns `None` for empty names,
    /// names longer than `FILENAME_LEN` and names containing NUL.
    pub fn new(name: &[u8]) -> Option<Self> {
        if name.is_empty() || name.len() > FILENAME_LEN || name.contains(&0) {
            return None;
        }
        let mut bytes = [0; FILENAME_LEN];
        bytes[..name.len()].copy_from_slice(name);
        Some(Self(bytes))
    }

    /// Interprets the filename field of a raw entry. Anything after an
    /// embedded NUL is ignored. Returns `None` if the field is empty.
    fn from_field(field: &[u8; FILENAME_LEN]) -> Option<Self> {
        let len = field.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        Self::new(&field[..len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        &self.0[..len]
    }

    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_bytes()).ok()
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.pad(s),
            None => {
                for &b in self.as_bytes() {
                    write!(f, "{}", core::ascii::escape_default(b))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// Generation counter for one file. Stored in 7 bits, so it wraps at
/// `VERSION_MODULUS`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Version(u8);

impl Version {
    /// Version given to the first copy of a file.
    pub const FIRST: Self = Self(0);

    pub fn new(v: u8) -> Option<Self> {
        if v < VERSION_MODULUS {
            Some(Self(v))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The version that supersedes this one.
    pub fn next(self) -> Self {
        Self((self.0 + 1) % VERSION_MODULUS)
    }

    /// Compares two versions using sequence number arithmetic modulo
    /// `VERSION_MODULUS`: `self` is newer when it is less than half the
    /// version space ahead of `other`.
    pub fn sequence_cmp(self, other: Self) -> Ordering {
        let d = self.0.wrapping_sub(other.0) % VERSION_MODULUS;
        if d == 0 {
            Ordering::Equal
        } else if d < VERSION_MODULUS / 2 {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }

    pub fn is_newer_than(self, other: Self) -> bool {
        self.sequence_cmp(other) == Ordering::Greater
    }
}

/// A header entry whose start and end markers both check out.
///
/// Only `Slot::decode` produces these, so holding one means the marker checks
/// have been done.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    name: Filename,
    version: Version,
    page_seq: u16,
    last_page: bool,
    deleted: bool,
}

impl Entry {
    pub fn name(&self) -> &Filename {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn page_seq(&self) -> u16 {
        self.page_seq
    }

    pub fn is_last_page(&self) -> bool {
        self.last_page
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Checks whether this entry belongs to the chain for `name` at `version`.
    pub fn belongs_to(&self, name: &Filename, version: Version) -> bool {
        self.name == *name && self.version == version
    }
}

/// Decoded state of one header slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    /// Never claimed since the sector was last erased.
    Free,
    /// Claimed, but the page was never finalised (the end marker is still
    /// erased). This is what an interrupted write leaves behind.
    Claimed { deleted: bool },
    /// Claimed and finalised.
    Valid(Entry),
    /// Marker bytes hold values we never write, or the fields inside a
    /// finalised entry are out of range.
    Corrupt,
}

impl Slot {
    pub fn decode(raw: &RawEntry) -> Self {
        let deleted = Marker::from_u8(raw.delete) == Some(Marker::Set);
        match (Marker::from_u8(raw.start), Marker::from_u8(raw.end)) {
            (Some(Marker::Erased), _) => Self::Free,
            (Some(Marker::Set), Some(Marker::Erased)) => Self::Claimed { deleted },
            (Some(Marker::Set), Some(Marker::Set)) => {
                let name = Filename::from_field(&raw.filename);
                let version = Version::new(raw.version);
                match (name, version) {
                    (Some(name), Some(version)) => Self::Valid(Entry {
                        name,
                        version,
                        page_seq: raw.page_seq.get(),
                        last_page: Marker::from_u8(raw.last_page) == Some(Marker::Set),
                        deleted,
                    }),
                    _ => Self::Corrupt,
                }
            }
            _ => Self::Corrupt,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// A live slot is one that `purge` must not reclaim: finalised and not
    /// marked deleted.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Valid(e) if !e.deleted)
    }
}

/// The decoded header of one sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectorHeader {
    pub slots: [Slot; ENTRY_SLOTS as usize],
}

impl SectorHeader {
    /// Header of a freshly erased sector.
    pub const EMPTY: Self = Self {
        slots: [Slot::Free; ENTRY_SLOTS as usize],
    };

    /// Iterates over `(slot index, slot)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Slot)> + '_ {
        self.slots.iter().enumerate().map(|(i, s)| (i as u32, s))
    }

    pub fn first_free(&self) -> Option<u32> {
        self.iter().find(|(_, s)| s.is_free()).map(|(i, _)| i)
    }

    /// Whether any slot has ever been claimed since the last erase.
    pub fn is_used(&self) -> bool {
        self.slots.iter().any(|s| !s.is_free())
    }

    pub fn has_live(&self) -> bool {
        self.slots.iter().any(Slot::is_live)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Memory device interface.

/// Kinds of memory a device may report. Only flash can carry a filesystem.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    Flash,
    Eeprom,
    Ram,
}

/// Trait describing a byte-addressable, sector-erasable memory device.
pub trait Memory {
    /// Error type that can be produced during memory accesses.
    type Error;

    fn kind(&self) -> MemoryKind;

    /// Total size of the device in bytes. Expected to be cheap and constant.
    fn size(&self) -> u32;

    /// Size of the erase unit in bytes. Expected to be cheap and constant.
    fn sector_size(&self) -> u32;

    /// Fills `dest` with the bytes starting at `addr`.
    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` at `addr`.
    ///
    /// With flash semantics, every target byte must currently be erased
    /// (`0xFF`). The filesystem never asks otherwise.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Resets `len` bytes starting at `addr` to `0xFF`. Both must be sector
    /// aligned.
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error>;
}

/// Reasons a device can't carry the filesystem format.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GeometryError {
    /// The device isn't flash.
    NotFlash,
    /// Sector size (given) doesn't split into 16 pages of at least
    /// `MIN_PAGE_SIZE` bytes.
    SectorSize(u32),
    /// Device size (given) isn't a non-zero whole number of sectors.
    DeviceSize(u32),
}

/// Layout of the format on one particular device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    sector_size: u32,
    sector_count: u32,
}

impl Geometry {
    pub fn new(size: u32, sector_size: u32) -> Result<Self, GeometryError> {
        if sector_size % PAGES_PER_SECTOR != 0
            || sector_size / PAGES_PER_SECTOR < MIN_PAGE_SIZE
        {
            return Err(GeometryError::SectorSize(sector_size));
        }
        if size == 0 || size % sector_size != 0 {
            return Err(GeometryError::DeviceSize(size));
        }
        Ok(Self {
            sector_size,
            sector_count: size / sector_size,
        })
    }

    /// Checks `memory` and works out its geometry.
    pub fn of<M: Memory>(memory: &M) -> Result<Self, GeometryError> {
        if memory.kind() != MemoryKind::Flash {
            return Err(GeometryError::NotFlash);
        }
        Self::new(memory.size(), memory.sector_size())
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    pub fn page_size(&self) -> u32 {
        self.sector_size / PAGES_PER_SECTOR
    }

    /// Total number of data pages on the device.
    pub fn page_count(&self) -> u32 {
        self.sector_count * ENTRY_SLOTS
    }

    pub fn sector_addr(&self, sector: u32) -> u32 {
        sector * self.sector_size
    }

    /// Address of the header entry describing `page`.
    pub fn entry_addr(&self, page: PageAddr) -> u32 {
        self.sector_addr(page.sector) + page.slot * ENTRY_SIZE
    }

    /// Address of the used-count byte that starts `page`. The payload follows
    /// it directly.
    pub fn page_addr(&self, page: PageAddr) -> u32 {
        self.sector_addr(page.sector) + (HEADER_PAGES + page.slot) * self.page_size()
    }
}

/// Location of one data page: a sector and a slot within that sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageAddr {
    pub sector: u32,
    pub slot: u32,
}

impl PageAddr {
    pub fn new(sector: u32, slot: u32) -> Self {
        Self { sector, slot }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Header reading.

/// Reads and decodes the header entry describing `page`.
pub fn read_slot<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    page: PageAddr,
) -> Result<Slot, M::Error> {
    let mut raw = RawEntry::new_zeroed();
    memory.read(geometry.entry_addr(page), raw.as_bytes_mut())?;
    Ok(Slot::decode(&raw))
}

/// Reads and decodes all usable header entries of `sector`.
///
/// Slots are claimed strictly in order in a freshly erased sector, so if slot
/// 0 is free the rest of the header is not read and the sector is reported as
/// empty.
pub fn read_sector_header<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    sector: u32,
) -> Result<SectorHeader, M::Error> {
    let first = read_slot(memory, geometry, PageAddr::new(sector, 0))?;
    if first.is_free() {
        return Ok(SectorHeader::EMPTY);
    }

    let mut header = SectorHeader::EMPTY;
    header.slots[0] = first;
    for slot in 1..ENTRY_SLOTS {
        header.slots[slot as usize] = read_slot(memory, geometry, PageAddr::new(sector, slot))?;
    }
    Ok(header)
}

//////////////////////////////////////////////////////////////////////////////
// Page writing and reading.

/// Claims a free slot for page `page_seq` of `name` at `version`.
///
/// Only the start marker, filename, version and sequence are programmed. The
/// end marker stays erased until `finalise_page`, so an interruption from
/// here on leaves a `Slot::Claimed` that no reader will trust.
pub fn claim_page<M: Memory>(
    memory: &mut M,
    geometry: &Geometry,
    page: PageAddr,
    name: &Filename,
    version: Version,
    page_seq: u16,
) -> Result<(), M::Error> {
    log::trace!(
        "claiming slot {} of sector {} for {:?} v{} page {}",
        page.slot, page.sector, name, version.get(), page_seq,
    );
    let raw = RawEntry::claim(name, version, page_seq);
    memory.write(geometry.entry_addr(page), &raw.as_bytes()[..CLAIM_LEN])
}

/// Programs `data` into the payload of `page`, starting `offset` bytes in.
pub fn write_payload<M: Memory>(
    memory: &mut M,
    geometry: &Geometry,
    page: PageAddr,
    offset: u32,
    data: &[u8],
) -> Result<(), M::Error> {
    debug_assert!(offset as usize + data.len() <= PAGE_PAYLOAD as usize);
    memory.write(geometry.page_addr(page) + 1 + offset, data)
}

/// Copies payload bytes of `page`, starting `offset` bytes in, into `out`.
pub fn read_payload<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    page: PageAddr,
    offset: u32,
    out: &mut [u8],
) -> Result<(), M::Error> {
    memory.read(geometry.page_addr(page) + 1 + offset, out)
}

/// Reads the used-byte count at the start of `page`.
pub fn read_used<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    page: PageAddr,
) -> Result<u8, M::Error> {
    let mut used = [0];
    memory.read(geometry.page_addr(page), &mut used)?;
    Ok(used[0])
}

/// Finishes a page: records how many payload bytes it holds, sets the
/// last-page marker if requested, and finally sets the end marker that makes
/// the header entry trustworthy.
pub fn finalise_page<M: Memory>(
    memory: &mut M,
    geometry: &Geometry,
    page: PageAddr,
    used: u8,
    last_page: bool,
) -> Result<(), M::Error> {
    log::trace!(
        "finalising slot {} of sector {} with {} bytes{}",
        page.slot, page.sector, used, if last_page { " (last)" } else { "" },
    );
    memory.write(geometry.page_addr(page), &[used])?;

    let entry = geometry.entry_addr(page);
    if last_page {
        memory.write(entry + LAST_PAGE_OFFSET, &[Marker::Set as u8])?;
    }
    memory.write(entry + END_OFFSET, &[Marker::Set as u8])
}

/// Sets the delete marker on the entry describing `page`.
pub fn mark_deleted<M: Memory>(
    memory: &mut M,
    geometry: &Geometry,
    page: PageAddr,
) -> Result<(), M::Error> {
    log::trace!("marking slot {} of sector {} deleted", page.slot, page.sector);
    memory.write(geometry.entry_addr(page) + DELETE_OFFSET, &[Marker::Set as u8])
}

/// Marks every finalised, not-yet-deleted entry of `name` at `version` found
/// in `sectors` as deleted. Returns the number of entries marked.
pub fn mark_version_deleted<M: Memory>(
    memory: &mut M,
    geometry: &Geometry,
    sectors: impl IntoIterator<Item = u32>,
    name: &Filename,
    version: Version,
) -> Result<u32, M::Error> {
    let mut marked = 0;
    for sector in sectors {
        let header = read_sector_header(memory, geometry, sector)?;
        for (slot, s) in header.iter() {
            match s {
                Slot::Valid(e) if e.belongs_to(name, version) => {
                    if e.is_deleted() {
                        log::trace!("slot {slot} of sector {sector} already deleted");
                    } else {
                        mark_deleted(memory, geometry, PageAddr::new(sector, slot))?;
                        marked += 1;
                    }
                }
                _ => (),
            }
        }
    }
    Ok(marked)
}

//////////////////////////////////////////////////////////////////////////////
// Searches.

/// Finds the first free slot, scanning sectors circularly starting at
/// `start_sector`. Returns `Ok(None)` if every slot on the device has been
/// claimed.
pub fn find_free_page<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    start_sector: u32,
) -> Result<Option<PageAddr>, M::Error> {
    let count = geometry.sector_count();
    let start_sector = start_sector % count;

    for i in 0..count {
        let sector = (start_sector + i) % count;
        let header = read_sector_header(memory, geometry, sector)?;
        if let Some(slot) = header.first_free() {
            return Ok(Some(PageAddr::new(sector, slot)));
        }
    }

    Ok(None)
}

/// Collects the pages of the chain for `name` at `version` found in
/// `sectors`, indexed by page sequence. Deleted entries are skipped. Gaps
/// (which only corruption can produce) are left as `None`.
pub fn locate_chain<M: Memory>(
    memory: &M,
    geometry: &Geometry,
    sectors: impl IntoIterator<Item = u32>,
    name: &Filename,
    version: Version,
) -> Result<Vec<Option<PageAddr>>, M::Error> {
    let mut pages: Vec<Option<PageAddr>> = Vec::new();
    for sector in sectors {
        let header = read_sector_header(memory, geometry, sector)?;
        for (slot, s) in header.iter() {
            if let Slot::Valid(e) = s {
                if e.belongs_to(name, version) && !e.is_deleted() {
                    let seq = usize::from(e.page_seq());
                    if pages.len() <= seq {
                        pages.resize(seq + 1, None);
                    }
                    if pages[seq].is_none() {
                        pages[seq] = Some(PageAddr::new(sector, slot));
                    } else {
                        log::warn!(
                            "duplicate page {seq} of {name:?} v{} in sector {sector}",
                            version.get(),
                        );
                    }
                }
            }
        }
    }
    Ok(pages)
}
