// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A versioned, log-structured file store for raw NOR flash.
//!
//! Every sector starts with a header of 32-byte entries, one per data page,
//! naming the file, version and chain position the page belongs to. Files are
//! replaced copy-on-write: a new version is written as a fresh page chain and
//! the old chain is marked deleted once the new one is complete. The in-memory
//! index is never stored; `Filesystem::create_index` rebuilds it from the
//! sector headers alone, discarding chains that were interrupted before their
//! last page was written.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod file;
pub mod low_level;

use alloc::collections::{BTreeMap, BTreeSet};
use crate::file::{File, OpenError, OpenMode, ReadFile, WriteFile};
use crate::low_level::{
    Filename, Geometry, GeometryError, Memory, PageAddr, Slot, Version,
};

/// What the index knows about the live version of one file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub version: Version,
    /// Every sector holding at least one page of this version.
    pub sectors: BTreeSet<u32>,
    /// Size of this version in bytes.
    pub size: u32,
}

/// Slot counts over the whole device, as reported by `Filesystem::usage`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Usage {
    pub free: u32,
    /// Finalised and not deleted.
    pub live: u32,
    /// Finalised and marked deleted.
    pub deleted: u32,
    /// Claimed but never finalised.
    pub unfinished: u32,
    pub corrupt: u32,
    /// Sectors `purge` would erase right now.
    pub reclaimable_sectors: u32,
}

pub struct Filesystem<M: Memory> {
    memory: M,
    geometry: Geometry,
    index: BTreeMap<Filename, IndexEntry>,
    /// Sector where the last free page was found; searches start here.
    free_hint: u32,
    /// Set when a free-page search fails, cleared by `purge`.
    full: bool,
    /// Last version handed to a writer, per name. Abandoned chains stay on
    /// flash unmarked until the next index build, so their versions must
    /// not be reused.
    issued: BTreeMap<Filename, Version>,
}

impl<M: Memory> Filesystem<M> {
    /// Wraps `memory` without scanning it. The index starts out empty; call
    /// `create_index` (or use `mount`) before opening existing files.
    pub fn new(memory: M) -> Result<Self, MountError<M>> {
        match Geometry::of(&memory) {
            Err(e) => Err(MountError {
                memory,
                cause: MountErrorCause::Geometry(e),
            }),
            Ok(geometry) => Ok(Self {
                memory,
                geometry,
                index: BTreeMap::new(),
                free_hint: 0,
                full: false,
                issued: BTreeMap::new(),
            }),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn into_inner(self) -> M {
        self.memory
    }

    /// Whether the device ran out of free pages since the last `purge`.
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn index(&self) -> &BTreeMap<Filename, IndexEntry> {
        &self.index
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&IndexEntry> {
        self.lookup_name(&Filename::new(name)?)
    }

    pub(crate) fn lookup_name(&self, name: &Filename) -> Option<&IndexEntry> {
        self.index.get(name)
    }

    pub(crate) fn install(&mut self, name: Filename, entry: IndexEntry) {
        self.index.insert(name, entry);
    }

    /// Finds a free page for a writer, starting from the sector where the
    /// previous one was found. Returns `Ok(None)` once the device is full;
    /// nothing but `purge` can free a page, so that answer sticks until then.
    pub(crate) fn allocate_page(&mut self) -> Result<Option<PageAddr>, M::Error> {
        if self.full {
            return Ok(None);
        }
        match low_level::find_free_page(&self.memory, &self.geometry, self.free_hint)? {
            Some(page) => {
                self.free_hint = page.sector;
                Ok(Some(page))
            }
            None => {
                log::debug!("no free pages left");
                self.full = true;
                Ok(None)
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Files.

    pub fn open(&mut self, name: &[u8], mode: OpenMode) -> Result<File, OpenError<M::Error>> {
        match mode {
            OpenMode::Read => self.open_read(name).map(File::Read),
            OpenMode::Write => self.open_write(name).map(File::Write),
        }
    }

    /// Opens the current version of `name` for reading.
    pub fn open_read(&self, name: &[u8]) -> Result<ReadFile, OpenError<M::Error>> {
        let name = Filename::new(name).ok_or(OpenError::BadName)?;
        let entry = self.index.get(&name).ok_or(OpenError::NotFound)?;
        log::debug!("opening {:?} v{} for reading", name, entry.version.get());
        ReadFile::open(self, name, entry)
    }

    /// Starts writing a new version of `name`, which need not exist yet. The
    /// first page is claimed immediately.
    pub fn open_write(&mut self, name: &[u8]) -> Result<WriteFile, OpenError<M::Error>> {
        let name = Filename::new(name).ok_or(OpenError::BadName)?;
        let indexed = self.index.get(&name).map(|e| e.version);
        let last = match (indexed, self.issued.get(&name).copied()) {
            (Some(i), Some(w)) if w.is_newer_than(i) => Some(w),
            (Some(i), _) => Some(i),
            (None, w) => w,
        };
        let version = last.map_or(Version::FIRST, Version::next);
        log::debug!("opening {:?} v{} for writing", name, version.get());
        let file = WriteFile::create(self, name, version)?;
        self.issued.insert(name, version);
        Ok(file)
    }

    /// Deletes the current version of `name` by marking its pages deleted
    /// and dropping it from the index. Returns whether the file existed.
    pub fn erase(&mut self, name: &[u8]) -> Result<bool, M::Error> {
        let name = match Filename::new(name) {
            Some(name) => name,
            None => return Ok(false),
        };
        let entry = match self.index.get(&name) {
            Some(entry) => entry.clone(),
            None => return Ok(false),
        };

        let marked = low_level::mark_version_deleted(
            &mut self.memory,
            &self.geometry,
            entry.sectors.iter().copied(),
            &name,
            entry.version,
        )?;
        self.index.remove(&name);
        log::debug!("erased {:?} v{} ({marked} pages)", name, entry.version.get());
        Ok(true)
    }

    //////////////////////////////////////////////////////////////////////////
    // Whole-device operations.

    /// Rebuilds the index from the sector headers.
    ///
    /// The first pass finds, for every name, the newest version that has a
    /// last-page entry; only those chains are complete. The second pass adds
    /// the pages of those versions to the index and marks every other
    /// undeleted entry (superseded versions, interrupted writes, pages that
    /// were claimed but never finalised) as deleted.
    ///
    /// An open `WriteFile` looks exactly like an interrupted write, so its
    /// pages get marked too and its `commit` will fail with
    /// `WriteError::Reclaimed`. Rebuild only with no writer open.
    pub fn create_index(&mut self) -> Result<(), M::Error> {
        self.index.clear();

        let mut latest: BTreeMap<Filename, Version> = BTreeMap::new();
        for sector in 0..self.geometry.sector_count() {
            let header = low_level::read_sector_header(&self.memory, &self.geometry, sector)?;
            for (_, slot) in header.iter() {
                if let Slot::Valid(e) = slot {
                    if e.is_deleted() || !e.is_last_page() {
                        continue;
                    }
                    latest
                        .entry(*e.name())
                        .and_modify(|v| {
                            if e.version().is_newer_than(*v) {
                                *v = e.version();
                            }
                        })
                        .or_insert(e.version());
                }
            }
        }

        let mut marked = 0;
        for sector in 0..self.geometry.sector_count() {
            let header = low_level::read_sector_header(&self.memory, &self.geometry, sector)?;
            for (slot, s) in header.iter() {
                let page = PageAddr::new(sector, slot);
                match s {
                    Slot::Valid(e) if !e.is_deleted() => {
                        if latest.get(e.name()) == Some(&e.version()) {
                            let used = low_level::read_used(&self.memory, &self.geometry, page)?;
                            let entry = self.index.entry(*e.name()).or_insert_with(|| IndexEntry {
                                version: e.version(),
                                sectors: BTreeSet::new(),
                                size: 0,
                            });
                            entry.sectors.insert(sector);
                            entry.size += u32::from(used);
                        } else {
                            low_level::mark_deleted(&mut self.memory, &self.geometry, page)?;
                            marked += 1;
                        }
                    }
                    Slot::Claimed { deleted: false } => {
                        low_level::mark_deleted(&mut self.memory, &self.geometry, page)?;
                        marked += 1;
                    }
                    Slot::Corrupt => {
                        log::warn!("corrupt header entry in slot {slot} of sector {sector}");
                    }
                    _ => (),
                }
            }
        }

        log::debug!(
            "index built: {} files, {marked} stale entries marked deleted",
            self.index.len(),
        );
        Ok(())
    }

    /// Erases every sector that has been written to but holds no live entry,
    /// and clears the full condition. Returns the number of sectors erased.
    ///
    /// Live pages are never moved, so a sector is only reclaimed once every
    /// page in it has been superseded or erased. Don't purge while a
    /// `WriteFile` is open: its current page isn't live yet.
    pub fn purge(&mut self) -> Result<u32, M::Error> {
        let mut erased = 0;
        for sector in 0..self.geometry.sector_count() {
            let header = low_level::read_sector_header(&self.memory, &self.geometry, sector)?;
            if header.is_used() && !header.has_live() {
                log::trace!("purging sector {sector}");
                self.memory.erase(
                    self.geometry.sector_addr(sector),
                    self.geometry.sector_size(),
                )?;
                erased += 1;
            }
        }

        log::debug!("purge erased {erased} sectors");
        self.full = false;
        Ok(erased)
    }

    /// Erases the whole device, discarding every file.
    pub fn format(&mut self) -> Result<(), M::Error> {
        log::debug!("formatting {} sectors", self.geometry.sector_count());
        for sector in 0..self.geometry.sector_count() {
            self.memory.erase(
                self.geometry.sector_addr(sector),
                self.geometry.sector_size(),
            )?;
        }
        self.index.clear();
        self.free_hint = 0;
        self.full = false;
        self.issued.clear();
        Ok(())
    }

    /// Tallies the state of every slot on the device.
    pub fn usage(&self) -> Result<Usage, M::Error> {
        let mut usage = Usage::default();
        for sector in 0..self.geometry.sector_count() {
            let header = low_level::read_sector_header(&self.memory, &self.geometry, sector)?;
            for (_, slot) in header.iter() {
                match slot {
                    Slot::Free => usage.free += 1,
                    Slot::Valid(e) if e.is_deleted() => usage.deleted += 1,
                    Slot::Valid(_) => usage.live += 1,
                    Slot::Claimed { .. } => usage.unfinished += 1,
                    Slot::Corrupt => usage.corrupt += 1,
                }
            }
            if header.is_used() && !header.has_live() {
                usage.reclaimable_sectors += 1;
            }
        }
        Ok(usage)
    }
}

/// Wraps `memory` and builds the index from its contents.
pub fn mount<M: Memory>(memory: M) -> Result<Filesystem<M>, MountError<M>> {
    let mut fs = Filesystem::new(memory)?;
    match fs.create_index() {
        Ok(()) => Ok(fs),
        Err(e) => Err(MountError {
            memory: fs.into_inner(),
            cause: MountErrorCause::Memory(e),
        }),
    }
}

/// Failure to mount, handing the memory back.
pub struct MountError<M: Memory> {
    memory: M,
    cause: MountErrorCause<M::Error>,
}

impl<M: Memory> MountError<M> {
    pub fn into_inner(self) -> M {
        self.memory
    }

    pub fn cause(&self) -> &MountErrorCause<M::Error> {
        &self.cause
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MountErrorCause<E> {
    Geometry(GeometryError),
    Memory(E),
}

impl<E> From<E> for MountErrorCause<E> {
    fn from(e: E) -> Self {
        Self::Memory(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::WriteError;
    use crate::low_level::tests::FakeMemory;
    use crate::low_level::{read_sector_header, MemoryKind, ENTRY_SLOTS, PAGE_PAYLOAD};
    use alloc::vec::Vec;

    fn fresh(sectors: u32) -> Filesystem<FakeMemory> {
        Filesystem::new(FakeMemory::new(sectors)).map_err(|_| ()).unwrap()
    }

    fn remount(fs: Filesystem<FakeMemory>) -> Filesystem<FakeMemory> {
        mount(fs.into_inner()).map_err(|_| ()).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn put(fs: &mut Filesystem<FakeMemory>, name: &str, data: &[u8]) {
        let mut f = fs.open_write(name.as_bytes()).unwrap();
        assert_eq!(f.write(fs, data).unwrap(), data.len());
        f.commit(fs).unwrap();
    }

    fn get(fs: &Filesystem<FakeMemory>, name: &str) -> Vec<u8> {
        let mut f = fs.open_read(name.as_bytes()).unwrap();
        let mut out = vec![0; f.size() as usize + 1];
        let n = f.read(fs, &mut out).unwrap();
        out.truncate(n);
        out
    }

    /// Deleted flags of every valid entry for `name` at `version`.
    fn entry_flags(fs: &Filesystem<FakeMemory>, name: &str, version: u8) -> Vec<bool> {
        let name = Filename::new(name.as_bytes()).unwrap();
        let version = Version::new(version).unwrap();
        let mut flags = Vec::new();
        for sector in 0..fs.geometry().sector_count() {
            let header = read_sector_header(fs.memory(), fs.geometry(), sector).unwrap();
            for (_, slot) in header.iter() {
                if let Slot::Valid(e) = slot {
                    if e.belongs_to(&name, version) {
                        flags.push(e.is_deleted());
                    }
                }
            }
        }
        flags
    }

    #[test]
    fn rejects_unsuitable_memory() {
        let ram = FakeMemory::new(2).with_kind(MemoryKind::Ram);
        let err = Filesystem::new(ram).map(|_| ()).unwrap_err();
        assert_eq!(err.cause(), &MountErrorCause::Geometry(GeometryError::NotFlash));

        let odd = FakeMemory::with_geometry(4096 * 2, 1024);
        let err = mount(odd).map(|_| ()).unwrap_err();
        assert_eq!(err.cause(), &MountErrorCause::Geometry(GeometryError::SectorSize(1024)));
        assert_eq!(err.into_inner().size(), 8192);
    }

    #[test]
    fn bad_names() {
        let mut fs = fresh(1);
        assert_eq!(fs.open_write(b"").map(|_| ()), Err(OpenError::BadName));
        assert_eq!(fs.open_write(&[b'n'; 25]).map(|_| ()), Err(OpenError::BadName));
        assert_eq!(fs.open_read(b"a\0b").map(|_| ()), Err(OpenError::BadName));
        assert_eq!(fs.open_read(b"missing").map(|_| ()), Err(OpenError::NotFound));
        assert!(!fs.erase(b"missing").unwrap());

        // The longest allowed name works.
        put(&mut fs, "abcdefghijklmnopqrstuvwx", b"24");
        assert_eq!(get(&fs, "abcdefghijklmnopqrstuvwx"), b"24");
    }

    #[test]
    fn four_thousand_bytes_then_ten() {
        let mut fs = fresh(4);
        let big = pattern(4000, 1);
        put(&mut fs, "f", &big);

        let entry = fs.lookup(b"f").unwrap().clone();
        assert_eq!(entry.version, Version::FIRST);
        assert_eq!(entry.size, 4000);
        assert_eq!(entry.sectors.iter().copied().collect::<Vec<_>>(), [0, 1]);
        // 14 full pages in sector 0, then 255 + 175 bytes in sector 1.
        assert_eq!(entry_flags(&fs, "f", 0).len(), 16);

        put(&mut fs, "f", &pattern(10, 2));
        let entry = fs.lookup(b"f").unwrap();
        assert_eq!(entry.version.get(), 1);
        assert_eq!(entry.size, 10);
        assert_eq!(get(&fs, "f"), pattern(10, 2));

        // Every page of version 0 is marked deleted but left in place.
        let flags = entry_flags(&fs, "f", 0);
        assert_eq!(flags.len(), 16);
        assert!(flags.iter().all(|&d| d));
        assert_eq!(entry_flags(&fs, "f", 1), [false]);
    }

    #[test]
    fn committed_index_matches_rebuilt_index() {
        let mut fs = fresh(4);
        put(&mut fs, "a", &pattern(3000, 3));
        put(&mut fs, "b", &pattern(10, 4));
        put(&mut fs, "a", &pattern(700, 5));
        put(&mut fs, "c", &[]);
        assert!(fs.erase(b"b").unwrap());

        let incremental = fs.index().clone();
        fs.create_index().unwrap();
        assert_eq!(fs.index(), &incremental);

        // And rebuilding again with nothing in between changes nothing.
        fs.create_index().unwrap();
        assert_eq!(fs.index(), &incremental);

        let fs = remount(fs);
        assert_eq!(fs.index(), &incremental);
        assert_eq!(get(&fs, "a"), pattern(700, 5));
        assert_eq!(get(&fs, "c"), b"");
        assert!(fs.lookup(b"b").is_none());
    }

    #[test]
    fn interrupted_write_is_discarded_on_mount() {
        let mut fs = fresh(4);
        put(&mut fs, "doc", b"version zero");

        // Power is lost part way through writing version 1: pages are
        // claimed and some finalised, but no last page is ever written.
        let mut w = fs.open_write(b"doc").unwrap();
        w.write(&mut fs, &pattern(800, 6)).unwrap();
        drop(w);
        // A brand new file that never got committed at all.
        let mut w = fs.open_write(b"ghost").unwrap();
        w.write(&mut fs, &pattern(300, 7)).unwrap();
        drop(w);

        let fs = remount(fs);
        assert_eq!(fs.lookup(b"doc").unwrap().version, Version::FIRST);
        assert_eq!(get(&fs, "doc"), b"version zero");
        assert!(fs.lookup(b"ghost").is_none());

        // The finalised pages of the torn chains are marked deleted, and so
        // are the pages that were claimed but never finalised.
        assert_eq!(entry_flags(&fs, "doc", 1), [true, true, true]);
        assert_eq!(entry_flags(&fs, "ghost", 0), [true]);
        let usage = fs.usage().unwrap();
        assert_eq!(usage.live, 1);
        assert_eq!(usage.deleted, 4);
        assert_eq!(usage.unfinished, 2);
    }

    #[test]
    fn crash_between_commit_and_delete_prefers_newer() {
        let mut fs = fresh(2);
        put(&mut fs, "cfg", b"old");

        // Write version 1 completely, then "lose power" before the old
        // version is marked: finalise by hand instead of committing.
        let name = Filename::new(b"cfg").unwrap();
        let g = *fs.geometry();
        let page = PageAddr::new(0, 1);
        low_level::claim_page(fs.memory_mut(), &g, page, &name, Version::FIRST.next(), 0)
            .unwrap();
        low_level::write_payload(fs.memory_mut(), &g, page, 0, b"new").unwrap();
        low_level::finalise_page(fs.memory_mut(), &g, page, 3, true).unwrap();

        let fs = remount(fs);
        assert_eq!(fs.lookup(b"cfg").unwrap().version.get(), 1);
        assert_eq!(get(&fs, "cfg"), b"new");
        assert_eq!(entry_flags(&fs, "cfg", 0), [true]);
    }

    #[test]
    fn commit_refused_after_reindex_under_writer() {
        let mut fs = fresh(2);
        put(&mut fs, "doc", b"old");

        let mut w = fs.open_write(b"doc").unwrap();
        w.write(&mut fs, &pattern(300, 14)).unwrap();
        fs.create_index().unwrap();

        // The rebuild took the writer's pages for an interrupted write.
        assert_eq!(w.commit(&mut fs), Err(WriteError::Reclaimed));
        assert_eq!(fs.lookup(b"doc").unwrap().version, Version::FIRST);
        assert_eq!(get(&fs, "doc"), b"old");

        let mut fs = remount(fs);
        assert_eq!(get(&fs, "doc"), b"old");

        // Pages erased by a purge are caught the same way.
        let mut w = fs.open_write(b"doc").unwrap();
        w.write(&mut fs, &pattern(255 * 14, 15)).unwrap();
        fs.create_index().unwrap();
        assert!(fs.purge().unwrap() >= 1);
        assert_eq!(w.commit(&mut fs), Err(WriteError::Reclaimed));
        assert_eq!(get(&fs, "doc"), b"old");
    }

    #[test]
    fn version_wraps_past_127() {
        let mut fs = fresh(3);
        for i in 0..130u32 {
            put(&mut fs, "log", &i.to_le_bytes());
            fs.purge().unwrap();
        }
        assert_eq!(fs.lookup(b"log").unwrap().version.get(), 130 % 128);

        let fs = remount(fs);
        assert_eq!(fs.lookup(b"log").unwrap().version.get(), 2);
        assert_eq!(get(&fs, "log"), 129u32.to_le_bytes());
    }

    #[test]
    fn full_device_recovers_after_purge() {
        let mut fs = fresh(2);
        let capacity = (PAGE_PAYLOAD * ENTRY_SLOTS) as usize;

        // Fill sector 0 with one committed file.
        put(&mut fs, "a", &pattern(capacity, 8));

        // Writing more than the remaining sector fits comes up short, then
        // stops entirely.
        let mut w = fs.open_write(b"b").unwrap();
        let n = w.write(&mut fs, &pattern(capacity + 100, 9)).unwrap();
        assert_eq!(n, capacity);
        assert!(fs.is_full());
        assert_eq!(w.write(&mut fs, b"x").unwrap(), 0);
        assert_eq!(w.commit(&mut fs), Err(WriteError::Exhausted));
        assert_eq!(fs.open_write(b"c").map(|_| ()), Err(OpenError::Full));

        // Nothing is reclaimable while "a" is live, and "b"'s finalised pages
        // count as live until the index is rebuilt.
        assert_eq!(fs.usage().unwrap().reclaimable_sectors, 0);
        assert!(fs.erase(b"a").unwrap());
        assert_eq!(fs.usage().unwrap().reclaimable_sectors, 1);
        fs.create_index().unwrap();
        assert_eq!(fs.purge().unwrap(), 2);
        assert!(!fs.is_full());

        assert_eq!(fs.usage().unwrap().free, 2 * ENTRY_SLOTS);
        put(&mut fs, "c", &pattern(5000, 10));
        assert_eq!(get(&fs, "c"), pattern(5000, 10));
    }

    #[test]
    fn torn_pages_reclaimed_after_reindex() {
        let mut fs = fresh(2);
        put(&mut fs, "keep", b"k");

        // Fill the rest of sector 0 and part of sector 1 without committing.
        let mut w = fs.open_write(b"torn").unwrap();
        w.write(&mut fs, &pattern(255 * 15, 11)).unwrap();
        drop(w);

        // Sector 1 holds only finalised-but-uncommitted pages and one claimed
        // page; until the index build marks them, the finalised ones count as
        // live.
        assert_eq!(fs.purge().unwrap(), 0);

        fs.create_index().unwrap();
        assert_eq!(fs.purge().unwrap(), 1);
        assert_eq!(get(&fs, "keep"), b"k");
        assert_eq!(entry_flags(&fs, "torn", 0), vec![true; 13]);
    }

    #[test]
    fn purge_spares_sectors_with_live_entries() {
        let mut fs = fresh(2);
        put(&mut fs, "x", b"1");
        put(&mut fs, "x", b"2");
        put(&mut fs, "y", b"3");
        assert!(fs.erase(b"y").unwrap());

        // Sector 0 now holds deleted entries, one live entry and free slots.
        let header = read_sector_header(fs.memory(), fs.geometry(), 0).unwrap();
        assert!(header.has_live());
        assert_eq!(fs.purge().unwrap(), 0);
        assert_eq!(get(&fs, "x"), b"2");

        // Once the live entry is superseded by one in another sector, the
        // sector goes.
        let mut w = fs.open_write(b"filler").unwrap();
        w.write(&mut fs, &pattern(255 * 11, 12)).unwrap();
        drop(w);
        put(&mut fs, "x", b"3");
        assert_eq!(fs.lookup(b"x").unwrap().sectors.iter().copied().collect::<Vec<_>>(), [1]);
        fs.create_index().unwrap();
        assert_eq!(fs.purge().unwrap(), 1);
        assert_eq!(get(&fs, "x"), b"3");
    }

    #[test]
    fn corrupt_entries_are_left_alone() {
        let mut fs = fresh(1);
        put(&mut fs, "ok", b"fine");

        // Scribble an impossible start marker into slot 1.
        let addr = fs.geometry().entry_addr(PageAddr::new(0, 1)) as usize;
        fs.memory_mut().bytes_mut()[addr] = 0x12;

        fs.create_index().unwrap();
        assert_eq!(get(&fs, "ok"), b"fine");
        let usage = fs.usage().unwrap();
        assert_eq!(usage.corrupt, 1);
        assert_eq!(usage.live, 1);
        assert_eq!(usage.free, ENTRY_SLOTS - 2);
    }

    #[test]
    fn format_discards_everything() {
        let mut fs = fresh(2);
        put(&mut fs, "a", &pattern(600, 13));
        fs.format().unwrap();

        assert!(fs.index().is_empty());
        assert!(fs.memory().bytes().iter().all(|&b| b == 0xFF));
        let fs = remount(fs);
        assert!(fs.index().is_empty());
        assert_eq!(fs.usage().unwrap().free, 2 * ENTRY_SLOTS);
    }
}
