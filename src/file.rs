// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Open-file handles.
//!
//! Handles hold their own cursor state and never borrow the `Filesystem`;
//! every operation takes it as an argument instead.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use crate::low_level::{self, Filename, Memory, PageAddr, Slot, Version, PAGE_PAYLOAD};
use crate::{Filesystem, IndexEntry};

/// The two ways a file can be opened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Things that can go wrong while opening a file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenError<E> {
    /// The name is empty, too long, or contains NUL.
    BadName,
    /// No complete version of the file exists.
    NotFound,
    /// No free page is left for the first page of a new version.
    Full,
    Memory(E),
}

impl<E> From<E> for OpenError<E> {
    fn from(e: E) -> Self {
        Self::Memory(e)
    }
}

/// Things that can go wrong while reading or seeking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadError<E> {
    /// Seek target lies beyond the end of the file (given).
    End(u32),
    /// The page with the given sequence number has been reclaimed by `purge`
    /// since the file was opened.
    Stale(u16),
    /// Attempted to seek in a file opened for writing.
    NotReadable,
    Memory(E),
}

impl<E> From<E> for ReadError<E> {
    fn from(e: E) -> Self {
        Self::Memory(e)
    }
}

/// Things that can go wrong while writing or committing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError<E> {
    /// A write on this handle came up short because the device filled, so
    /// the contents are truncated and won't be committed.
    Exhausted,
    /// Pages of this handle's chain were marked deleted or erased while it
    /// was open, by `create_index` or `purge`. The chain can't be published.
    Reclaimed,
    Memory(E),
}

impl<E> From<E> for WriteError<E> {
    fn from(e: E) -> Self {
        Self::Memory(e)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Reading.

/// A file opened for reading.
///
/// The version, size and location of every page are pinned when the file is
/// opened; committing a newer version afterwards does not affect what this
/// handle reads. If `purge` reclaims the pinned pages, reads fail with
/// `ReadError::Stale`.
#[derive(Clone, Debug)]
pub struct ReadFile {
    name: Filename,
    version: Version,
    size: u32,
    pages: Vec<Option<PageAddr>>,
    /// Page sequence the cursor is in.
    seq: u16,
    /// Used-byte count of the current page.
    used: u32,
    /// Cursor offset within the current page's payload.
    offset: u32,
    position: u32,
}

impl ReadFile {
    /// Opens the version of `name` described by `entry` and positions the
    /// cursor at the start.
    pub(crate) fn open<M: Memory>(
        fs: &Filesystem<M>,
        name: Filename,
        entry: &IndexEntry,
    ) -> Result<Self, OpenError<M::Error>> {
        let pages = low_level::locate_chain(
            fs.memory(),
            fs.geometry(),
            entry.sectors.iter().copied(),
            &name,
            entry.version,
        )?;

        let mut file = Self {
            name,
            version: entry.version,
            size: entry.size,
            pages,
            seq: 0,
            used: 0,
            offset: 0,
            position: 0,
        };

        match file.load(fs, 0) {
            Ok(true) => Ok(file),
            Ok(false) | Err(ReadError::Stale(_)) => {
                log::warn!("{:?} is indexed but its first page is missing", file.name);
                Err(OpenError::NotFound)
            }
            Err(ReadError::Memory(e)) => Err(OpenError::Memory(e)),
            Err(ReadError::End(_)) | Err(ReadError::NotReadable) => Err(OpenError::NotFound),
        }
    }

    pub fn name(&self) -> &Filename {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Size of the pinned version in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current cursor position in bytes from the start of the file.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Moves the cursor to page `seq`, offset 0. Returns `Ok(false)` if the
    /// chain has no such page.
    fn load<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        seq: u16,
    ) -> Result<bool, ReadError<M::Error>> {
        let page = match self.pages.get(usize::from(seq)).copied().flatten() {
            Some(page) => page,
            None => return Ok(false),
        };
        log::trace!(
            "{:?}: page {seq} is slot {} of sector {}",
            self.name, page.slot, page.sector,
        );
        self.check_page(fs, seq, page)?;

        self.seq = seq;
        self.used = u32::from(low_level::read_used(fs.memory(), fs.geometry(), page)?);
        self.offset = 0;
        Ok(true)
    }

    /// Confirms that `page` still holds page `seq` of our version. A delete
    /// marker is fine; an erased or reused slot is not.
    fn check_page<M: Memory>(
        &self,
        fs: &Filesystem<M>,
        seq: u16,
        page: PageAddr,
    ) -> Result<(), ReadError<M::Error>> {
        match low_level::read_slot(fs.memory(), fs.geometry(), page)? {
            Slot::Valid(e) if e.belongs_to(&self.name, self.version) && e.page_seq() == seq => {
                Ok(())
            }
            _ => Err(ReadError::Stale(seq)),
        }
    }

    /// Moves the cursor to byte `offset`. Seeking to exactly `size()` is
    /// allowed and leaves the cursor at end of file. On failure the cursor
    /// stays where it was.
    pub fn seek<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        offset: u32,
    ) -> Result<(), ReadError<M::Error>> {
        log::trace!("{:?}: seek to {offset}", self.name);
        let cursor = (self.seq, self.used, self.offset);
        let result = self.move_cursor(fs, offset);
        if result.is_err() {
            (self.seq, self.used, self.offset) = cursor;
        }
        result
    }

    fn move_cursor<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        offset: u32,
    ) -> Result<(), ReadError<M::Error>> {
        if offset > self.size {
            return Err(ReadError::End(self.size));
        }

        let seq = u16::try_from(offset / PAGE_PAYLOAD)
            .map_err(|_| ReadError::End(self.size))?;
        let mut in_page = offset % PAGE_PAYLOAD;

        if !self.load(fs, seq)? {
            // The end of a file that fills its last page exactly lies just
            // past that page rather than at the start of a missing one.
            let at_end = offset == self.size && seq > 0 && in_page == 0;
            if !at_end || !self.load(fs, seq - 1)? {
                return Err(ReadError::End(self.size));
            }
            in_page = PAGE_PAYLOAD;
        }

        if self.used < in_page {
            return Err(ReadError::End(self.size));
        }
        self.offset = in_page;
        self.position = offset;
        Ok(())
    }

    /// Reads from the cursor into `out`, returning the number of bytes
    /// copied. A count short of `out.len()` means end of file was reached.
    pub fn read<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        out: &mut [u8],
    ) -> Result<usize, ReadError<M::Error>> {
        let mut done = 0;

        while done < out.len() {
            let available = self.used - self.offset;
            if available == 0 {
                let next = match self.seq.checked_add(1) {
                    Some(next) => next,
                    None => break,
                };
                if !self.load(fs, next)? {
                    log::trace!("{:?}: end of file at {}", self.name, self.position);
                    break;
                }
                continue;
            }

            let page = match self.pages[usize::from(self.seq)] {
                Some(page) => page,
                None => break,
            };
            self.check_page(fs, self.seq, page)?;

            let n = usize::min(available as usize, out.len() - done);
            low_level::read_payload(
                fs.memory(),
                fs.geometry(),
                page,
                self.offset,
                &mut out[done..done + n],
            )?;

            done += n;
            self.offset += n as u32;
            self.position += n as u32;
        }

        Ok(done)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Writing.

/// A new version of a file being written.
///
/// Writes append sequentially. Nothing becomes visible until `commit`;
/// dropping the handle without committing abandons the partial chain, which
/// the next index build marks deleted.
#[derive(Clone, Debug)]
pub struct WriteFile {
    name: Filename,
    version: Version,
    /// Sectors holding any page of the new version.
    sectors: BTreeSet<u32>,
    len: u32,
    page: PageAddr,
    seq: u16,
    /// Payload bytes written to the current page.
    offset: u32,
    exhausted: bool,
}

impl WriteFile {
    /// Starts a new chain for `name` at `version`, claiming the first page.
    pub(crate) fn create<M: Memory>(
        fs: &mut Filesystem<M>,
        name: Filename,
        version: Version,
    ) -> Result<Self, OpenError<M::Error>> {
        let page = fs.allocate_page()?.ok_or(OpenError::Full)?;
        let geometry = *fs.geometry();
        low_level::claim_page(fs.memory_mut(), &geometry, page, &name, version, 0)?;

        let mut sectors = BTreeSet::new();
        sectors.insert(page.sector);

        Ok(Self {
            name,
            version,
            sectors,
            len: 0,
            page,
            seq: 0,
            offset: 0,
            exhausted: false,
        })
    }

    pub fn name(&self) -> &Filename {
        &self.name
    }

    /// Version this handle will commit.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Bytes written so far.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether a write came up short because the device filled.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Appends `data`, returning how many bytes were written. A short count
    /// means the device is full; after that the handle accepts nothing more.
    pub fn write<M: Memory>(
        &mut self,
        fs: &mut Filesystem<M>,
        data: &[u8],
    ) -> Result<usize, WriteError<M::Error>> {
        if self.exhausted {
            return Ok(0);
        }

        let geometry = *fs.geometry();
        let mut done = 0;

        while done < data.len() {
            if self.offset == PAGE_PAYLOAD && !self.next_page(fs)? {
                break;
            }

            let n = usize::min((PAGE_PAYLOAD - self.offset) as usize, data.len() - done);
            low_level::write_payload(
                fs.memory_mut(),
                &geometry,
                self.page,
                self.offset,
                &data[done..done + n],
            )?;

            done += n;
            self.offset += n as u32;
            self.len += n as u32;
        }

        Ok(done)
    }

    /// Finalises the full current page and claims the next one. Returns
    /// `Ok(false)` and marks the handle exhausted if no page is available.
    fn next_page<M: Memory>(
        &mut self,
        fs: &mut Filesystem<M>,
    ) -> Result<bool, WriteError<M::Error>> {
        let seq = match self.seq.checked_add(1) {
            Some(seq) => seq,
            None => {
                log::debug!("{:?} reached the maximum chain length", self.name);
                self.exhausted = true;
                return Ok(false);
            }
        };
        let page = match fs.allocate_page()? {
            Some(page) => page,
            None => {
                self.exhausted = true;
                return Ok(false);
            }
        };

        let geometry = *fs.geometry();
        low_level::finalise_page(fs.memory_mut(), &geometry, self.page, PAGE_PAYLOAD as u8, false)?;
        low_level::claim_page(fs.memory_mut(), &geometry, page, &self.name, self.version, seq)?;

        self.sectors.insert(page.sector);
        self.page = page;
        self.seq = seq;
        self.offset = 0;
        Ok(true)
    }

    /// Publishes the new version: finalises the last page, marks the pages
    /// of the version it replaces as deleted, and updates the index.
    pub fn commit<M: Memory>(
        self,
        fs: &mut Filesystem<M>,
    ) -> Result<(), WriteError<M::Error>> {
        if self.exhausted {
            log::debug!("refusing to commit truncated {:?}", self.name);
            return Err(WriteError::Exhausted);
        }

        let geometry = *fs.geometry();

        // Everything written so far has to be intact before the chain can be
        // finished: the current page still claimed and unmarked, and every
        // earlier page still finalised and live.
        let current = low_level::read_slot(fs.memory(), &geometry, self.page)?;
        let earlier = low_level::locate_chain(
            fs.memory(),
            &geometry,
            self.sectors.iter().copied(),
            &self.name,
            self.version,
        )?;
        if current != (Slot::Claimed { deleted: false })
            || earlier.len() != usize::from(self.seq)
            || earlier.iter().any(Option::is_none)
        {
            log::warn!(
                "{:?} v{} was reclaimed while open; not committing",
                self.name, self.version.get(),
            );
            return Err(WriteError::Reclaimed);
        }

        low_level::finalise_page(fs.memory_mut(), &geometry, self.page, self.offset as u8, true)?;

        if let Some(old) = fs.lookup_name(&self.name).cloned() {
            if old.version != self.version {
                let marked = low_level::mark_version_deleted(
                    fs.memory_mut(),
                    &geometry,
                    old.sectors.iter().copied(),
                    &self.name,
                    old.version,
                )?;
                log::trace!("{:?}: {marked} pages of v{} deleted", self.name, old.version.get());
            }
        }

        log::debug!(
            "committed {:?} v{}: {} bytes in {} sectors",
            self.name, self.version.get(), self.len, self.sectors.len(),
        );
        fs.install(self.name, IndexEntry {
            version: self.version,
            sectors: self.sectors,
            size: self.len,
        });
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Either.

/// A file opened in a mode chosen at runtime.
///
/// Operations that don't apply to the mode behave as no-ops: reading a file
/// opened for writing (and vice versa) transfers nothing, `size` of a file
/// opened for writing is 0, and committing a file opened for reading does
/// nothing.
#[derive(Clone, Debug)]
pub enum File {
    Read(ReadFile),
    Write(WriteFile),
}

impl File {
    pub fn mode(&self) -> OpenMode {
        match self {
            Self::Read(_) => OpenMode::Read,
            Self::Write(_) => OpenMode::Write,
        }
    }

    pub fn name(&self) -> &Filename {
        match self {
            Self::Read(f) => f.name(),
            Self::Write(f) => f.name(),
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::Read(f) => f.size(),
            Self::Write(_) => 0,
        }
    }

    pub fn read<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        out: &mut [u8],
    ) -> Result<usize, ReadError<M::Error>> {
        match self {
            Self::Read(f) => f.read(fs, out),
            Self::Write(_) => Ok(0),
        }
    }

    pub fn seek<M: Memory>(
        &mut self,
        fs: &Filesystem<M>,
        offset: u32,
    ) -> Result<(), ReadError<M::Error>> {
        match self {
            Self::Read(f) => f.seek(fs, offset),
            Self::Write(_) => Err(ReadError::NotReadable),
        }
    }

    pub fn write<M: Memory>(
        &mut self,
        fs: &mut Filesystem<M>,
        data: &[u8],
    ) -> Result<usize, WriteError<M::Error>> {
        match self {
            Self::Read(_) => Ok(0),
            Self::Write(f) => f.write(fs, data),
        }
    }

    pub fn commit<M: Memory>(self, fs: &mut Filesystem<M>) -> Result<(), WriteError<M::Error>> {
        match self {
            Self::Read(_) => Ok(()),
            Self::Write(f) => f.commit(fs),
        }
    }

    /// Closes the handle and erases the current version of its file. An
    /// uncommitted write is abandoned first. Returns whether a committed
    /// version existed.
    pub fn erase<M: Memory>(self, fs: &mut Filesystem<M>) -> Result<bool, M::Error> {
        fs.erase(self.name().as_bytes())
    }
}
