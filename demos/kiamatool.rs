// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use kiamafs::low_level::{self, Memory, MemoryKind, PageAddr, Slot};
use kiamafs::Filesystem;
use rustyline::error::ReadlineError;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Parser)]
struct Kiamatool {
    /// Erase sector size of the image in bytes.
    #[clap(short, long, default_value_t = 4096)]
    sector_size: u32,

    image_file: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a new, fully erased image.
    Create {
        #[clap(long)]
        size: u32,
    },
    Format,
    Ls,
    Cat {
        name: String,
    },
    Get {
        name: String,
        out: PathBuf,
    },
    Put {
        name: String,
        input: PathBuf,
    },
    Rm {
        name: String,
    },
    Purge,
    Df,
    /// Decodes the header entries of one sector without mounting.
    Headers {
        sector: u32,
    },
    Shell,
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Kiamatool::parse();

    let path = args.image_file;
    let open = || {
        ImageMemory::open(&path, args.sector_size)
            .with_context(|| format!("opening image file {}", path.display()))
    };

    match args.cmd {
        Cmd::Create { size } => create_image(&path, args.sector_size, size)?,
        Cmd::Format => {
            let mut fs = unmounted(open()?)?;
            println!("formatting {} sectors", fs.geometry().sector_count());
            fs.format()?;
        }
        Cmd::Ls => list(&mounted(open()?)?)?,
        Cmd::Cat { name } => {
            let data = read_all(&mounted(open()?)?, name.as_bytes())?;
            println!("{}", pretty_hex::pretty_hex(&data));
        }
        Cmd::Get { name, out } => {
            let data = read_all(&mounted(open()?)?, name.as_bytes())?;
            std::fs::write(&out, &data)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("{} bytes", data.len());
        }
        Cmd::Put { name, input } => {
            let data = std::fs::read(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            write_file(&mut mounted(open()?)?, &name, &data)?;
        }
        Cmd::Rm { name } => remove(&mut mounted(open()?)?, &name)?,
        Cmd::Purge => {
            let n = mounted(open()?)?.purge()?;
            println!("erased {n} sectors");
        }
        Cmd::Df => usage(&mounted(open()?)?)?,
        Cmd::Headers { sector } => headers(&unmounted(open()?)?, sector)?,
        Cmd::Shell => shell(mounted(open()?)?)?,
    }

    Ok(())
}

fn create_image(path: &Path, sector_size: u32, size: u32) -> anyhow::Result<()> {
    if size == 0 || size % sector_size != 0 {
        bail!("image size must be a non-zero multiple of {sector_size}");
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;

    let erased = vec![0xFF; sector_size as usize];
    for _ in 0..size / sector_size {
        file.write_all(&erased)?;
    }
    println!("created {} with {} sectors", path.display(), size / sector_size);
    Ok(())
}

fn unmounted(img: ImageMemory) -> anyhow::Result<Filesystem<ImageMemory>> {
    match Filesystem::new(img) {
        Err(e) => bail!("unusable image: {:?}", e.cause()),
        Ok(fs) => Ok(fs),
    }
}

fn mounted(img: ImageMemory) -> anyhow::Result<Filesystem<ImageMemory>> {
    match kiamafs::mount(img) {
        Err(e) => bail!("could not mount: {:?}", e.cause()),
        Ok(fs) => Ok(fs),
    }
}

fn read_all(fs: &Filesystem<ImageMemory>, name: &[u8]) -> anyhow::Result<Vec<u8>> {
    let name_str = String::from_utf8_lossy(name);
    let mut f = fs.open_read(name)
        .map_err(|e| anyhow!("can't open {name_str}: {e:?}"))?;
    let mut data = vec![0; f.size() as usize];
    let n = f.read(fs, &mut data)
        .map_err(|e| anyhow!("reading {name_str}: {e:?}"))?;
    if n != data.len() {
        bail!("{name_str} should hold {} bytes but only {n} could be read", data.len());
    }
    Ok(data)
}

fn write_file(fs: &mut Filesystem<ImageMemory>, name: &str, data: &[u8]) -> anyhow::Result<()> {
    let mut f = fs.open_write(name.as_bytes())
        .map_err(|e| anyhow!("can't open {name} for writing: {e:?}"))?;
    let version = f.version();
    let n = f.write(fs, data)
        .map_err(|e| anyhow!("writing {name}: {e:?}"))?;
    if n < data.len() {
        bail!("out of space after {n} of {} bytes; run purge and retry", data.len());
    }
    f.commit(fs).map_err(|e| anyhow!("committing {name}: {e:?}"))?;
    println!("wrote {name} v{}, {n} bytes", version.get());
    Ok(())
}

fn remove(fs: &mut Filesystem<ImageMemory>, name: &str) -> anyhow::Result<()> {
    if fs.erase(name.as_bytes())? {
        println!("removed {name}");
    } else {
        println!("{name} not found");
    }
    Ok(())
}

fn list(fs: &Filesystem<ImageMemory>) -> anyhow::Result<()> {
    for (name, entry) in fs.index() {
        let data = read_all(fs, name.as_bytes())?;
        println!(
            "{:<24} v{:<3} {:>8} crc {:08x} sectors {:?}",
            name,
            entry.version.get(),
            entry.size,
            CRC32.checksum(&data),
            entry.sectors,
        );
    }
    Ok(())
}

fn usage(fs: &Filesystem<ImageMemory>) -> anyhow::Result<()> {
    let g = fs.geometry();
    let u = fs.usage()?;
    println!("{} sectors of {} bytes, {} pages", g.sector_count(), g.sector_size(), g.page_count());
    println!("- free:        {}", u.free);
    println!("- live:        {}", u.live);
    println!("- deleted:     {}", u.deleted);
    println!("- unfinished:  {}", u.unfinished);
    println!("- corrupt:     {}", u.corrupt);
    println!("- reclaimable: {} sectors", u.reclaimable_sectors);
    if fs.is_full() {
        println!("filesystem is FULL");
    }
    Ok(())
}

fn headers(fs: &Filesystem<ImageMemory>, sector: u32) -> anyhow::Result<()> {
    let g = fs.geometry();
    if sector >= g.sector_count() {
        bail!("image only has {} sectors", g.sector_count());
    }

    let header = low_level::read_sector_header(fs.memory(), g, sector)?;
    if !header.is_used() {
        println!("sector {sector} is empty");
        return Ok(());
    }
    for (slot, s) in header.iter() {
        match s {
            Slot::Free => println!("{slot:2}: free"),
            Slot::Claimed { deleted } => {
                println!("{slot:2}: claimed, never finalised{}", if *deleted { " (deleted)" } else { "" });
            }
            Slot::Valid(e) => {
                let used = low_level::read_used(fs.memory(), g, PageAddr::new(sector, slot))?;
                println!(
                    "{slot:2}: {:<24} v{:<3} page {:<5} {used:>3} bytes{}{}",
                    e.name(),
                    e.version().get(),
                    e.page_seq(),
                    if e.is_last_page() { " last" } else { "" },
                    if e.is_deleted() { " deleted" } else { "" },
                );
            }
            Slot::Corrupt => println!("{slot:2}: CORRUPT"),
        }
    }
    Ok(())
}

fn shell(mut fs: Filesystem<ImageMemory>) -> anyhow::Result<()> {
    let mut rl = rustyline::Editor::<()>::new()?;

    loop {
        match rl.readline("kiama> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str());
                match shell_command(&mut fs, &line) {
                    Ok(true) => (),
                    Ok(false) => break,
                    Err(e) => println!("error: {e:#}"),
                }
            }
            Err(ReadlineError::Eof) => {
                println!("exiting.");
                break;
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Runs one shell line. Returns `Ok(false)` when the shell should exit.
fn shell_command(fs: &mut Filesystem<ImageMemory>, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    let cmd = match words.next() {
        Some(cmd) => cmd,
        None => return Ok(true),
    };

    match (cmd, words.next()) {
        ("ls", None) => list(fs)?,
        ("cat", Some(name)) => {
            let data = read_all(fs, name.as_bytes())?;
            println!("{}", pretty_hex::pretty_hex(&data));
        }
        ("put", Some(name)) => {
            // Everything after the name, spacing preserved.
            let text = line.trim_start()[3..].trim_start()[name.len()..].trim_start();
            write_file(fs, name, text.as_bytes())?;
        }
        ("rm", Some(name)) => remove(fs, name)?,
        ("purge", None) => println!("erased {} sectors", fs.purge()?),
        ("reindex", None) => {
            fs.create_index()?;
            println!("{} files", fs.index().len());
        }
        ("df", None) => usage(fs)?,
        ("quit", None) | ("exit", None) => return Ok(false),
        _ => println!("commands: ls, cat NAME, put NAME TEXT, rm NAME, purge, reindex, df, quit"),
    }
    Ok(true)
}

/// A flash image held in a regular file. Programming checks that the target
/// bytes are erased, so the image behaves like NOR flash.
struct ImageMemory {
    file: RefCell<std::fs::File>,
    size: u32,
    sector_size: u32,
}

impl ImageMemory {
    fn open(path: impl AsRef<Path>, sector_size: u32) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len % u64::from(sector_size) != 0 {
            bail!("file is not a whole number of sectors in length");
        }
        let size = u32::try_from(file_len).context("file too large")?;

        Ok(Self {
            file: file.into(),
            size,
            sector_size,
        })
    }
}

impl Memory for ImageMemory {
    type Error = std::io::Error;

    fn kind(&self) -> MemoryKind {
        MemoryKind::Flash
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.read_exact(dest)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        let mut current = vec![0; data.len()];
        self.read(addr, &mut current)?;
        if let Some(i) = current.iter().position(|&b| b != 0xFF) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("programming unerased byte at {:#x}", addr as usize + i),
            ));
        }

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error> {
        if addr % self.sector_size != 0 || len % self.sector_size != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unaligned erase of {len:#x} bytes at {addr:#x}"),
            ));
        }

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&vec![0xFF; len as usize])
    }
}
