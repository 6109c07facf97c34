//! Minimal ISO 9660 reader.
//!
//! Enough of ECMA-119 to walk the directory tree of a boot image and copy a
//! file out of it. Rock Ridge `NM` names are honoured when present; otherwise
//! names are lowercased with the `;1` version suffix and any trailing dot
//! removed, so lookups use the names the image was built from.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};

const SECTOR_SIZE: u64 = 2048;
const FIRST_DESCRIPTOR_SECTOR: u64 = 16;
const DESCRIPTOR_PRIMARY: u8 = 1;
const DESCRIPTOR_TERMINATOR: u8 = 255;
const STANDARD_ID: &[u8] = b"CD001";
const ROOT_RECORD_OFFSET: usize = 156;
const FLAG_DIRECTORY: u8 = 0x02;
/// Upper bound on one directory extent; boot image directories are a few sectors.
const MAX_DIRECTORY_BYTES: u32 = 1 << 20;

/// One directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    pub name: String,
    pub extent: u32,
    pub size: u32,
    pub is_dir: bool,
}

pub struct IsoImage<R> {
    reader: R,
    block_size: u64,
    root: IsoEntry,
}

impl<R: Read + Seek> IsoImage<R> {
    /// Locate the primary volume descriptor.
    pub fn open(mut reader: R) -> Result<Self> {
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        let mut index = FIRST_DESCRIPTOR_SECTOR;
        loop {
            reader.seek(SeekFrom::Start(index * SECTOR_SIZE))?;
            reader
                .read_exact(&mut sector)
                .context("boot image ends before the primary volume descriptor")?;
            if &sector[1..6] != STANDARD_ID {
                anyhow::bail!("not an ISO 9660 image");
            }
            match sector[0] {
                DESCRIPTOR_PRIMARY => break,
                DESCRIPTOR_TERMINATOR => anyhow::bail!("ISO 9660 image has no primary volume descriptor"),
                _ => index += 1,
            }
        }

        let block_size = u16::from_le_bytes([sector[128], sector[129]]) as u64;
        let (root, _) = parse_record(&sector[ROOT_RECORD_OFFSET..])
            .context("malformed root directory record")?;

        Ok(Self {
            reader,
            block_size: if block_size == 0 { SECTOR_SIZE } else { block_size },
            root,
        })
    }

    /// Entries of a directory, without `.` and `..`.
    pub fn read_dir(&mut self, dir: &IsoEntry) -> Result<Vec<IsoEntry>> {
        let data = self.read_extent(dir)?;
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let len = data[pos] as usize;
            if len == 0 {
                // Records never straddle a sector; zero fill pads to the next one.
                let sector = self.block_size as usize;
                pos = (pos / sector + 1) * sector;
                continue;
            }
            let end = (pos + len).min(data.len());
            if let Some((entry, special)) = parse_record(&data[pos..end])
                && !special
            {
                entries.push(entry);
            }
            pos += len;
        }
        Ok(entries)
    }

    /// Look up an absolute path such as `/boot/vmlinuz64`. Case-insensitive.
    pub fn find(&mut self, path: &str) -> Result<Option<IsoEntry>> {
        let mut current = self.root.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_dir {
                return Ok(None);
            }
            let wanted = component.to_lowercase();
            let next = self
                .read_dir(&current)?
                .into_iter()
                .find(|e| e.name.to_lowercase() == wanted);
            match next {
                Some(entry) => current = entry,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Copy a file's contents into `out`. Returns the number of bytes copied.
    pub fn copy_to<W: Write>(&mut self, entry: &IsoEntry, out: &mut W) -> Result<u64> {
        self.reader
            .seek(SeekFrom::Start(entry.extent as u64 * self.block_size))?;
        let mut limited = (&mut self.reader).take(entry.size as u64);
        let copied = std::io::copy(&mut limited, out)?;
        if copied != entry.size as u64 {
            anyhow::bail!("{} is truncated ({} of {} bytes)", entry.name, copied, entry.size);
        }
        Ok(copied)
    }

    fn read_extent(&mut self, entry: &IsoEntry) -> Result<Vec<u8>> {
        if entry.size > MAX_DIRECTORY_BYTES {
            anyhow::bail!(
                "directory {} claims {} bytes (limit {})",
                entry.name,
                entry.size,
                MAX_DIRECTORY_BYTES
            );
        }
        let mut buf = Vec::with_capacity(entry.size as usize);
        self.copy_to(entry, &mut buf)?;
        Ok(buf)
    }
}

/// Parse one directory record. The flag is true for `.` and `..`.
fn parse_record(rec: &[u8]) -> Option<(IsoEntry, bool)> {
    if rec.len() < 34 {
        return None;
    }
    let len = (rec[0] as usize).min(rec.len());
    let extent = u32::from_le_bytes(rec[2..6].try_into().ok()?);
    let size = u32::from_le_bytes(rec[10..14].try_into().ok()?);
    let is_dir = rec[25] & FLAG_DIRECTORY != 0;
    let name_len = rec[32] as usize;
    let raw_name = rec.get(33..33 + name_len)?;

    let special = raw_name == [0] || raw_name == [1];
    let su_start = 33 + name_len + if name_len % 2 == 0 { 1 } else { 0 };
    let name = rock_ridge_name(rec.get(su_start..len).unwrap_or_default())
        .unwrap_or_else(|| normalize_name(raw_name));

    Some((
        IsoEntry {
            name,
            extent,
            size,
            is_dir,
        },
        special,
    ))
}

/// Collect the alternate name from Rock Ridge `NM` entries in the system use area.
fn rock_ridge_name(mut area: &[u8]) -> Option<String> {
    let mut name: Option<String> = None;
    while area.len() >= 4 {
        let len = area[2] as usize;
        if len < 4 || len > area.len() {
            break;
        }
        if &area[0..2] == b"NM" && len >= 5 {
            let part = String::from_utf8_lossy(&area[5..len]);
            name.get_or_insert_with(String::new).push_str(&part);
        }
        area = &area[len..];
    }
    name.filter(|n| !n.is_empty())
}

fn normalize_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw).to_lowercase();
    let name = match name.split_once(';') {
        Some((base, _)) => base.to_string(),
        None => name,
    };
    name.trim_end_matches('.').to_string()
}
