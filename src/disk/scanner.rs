//! Partition table scanning: MBR, extended (EBR) chains and GPT
//!
//! The scanner only walks the table and hands each used entry to a visitor.
//! It never registers or mounts anything.

use crate::disk::partition::{PartitionEntry, PartitionKind};
use crate::error::{BringupError, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PRIMARY_ENTRIES: usize = 4;

const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const MBR_EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

/// Logical partitions are numbered after the four primary slots
const FIRST_LOGICAL_INDEX: u32 = 4;
const MAX_LOGICAL_PARTITIONS: u32 = 128;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_ENTRY_SIZE: usize = 128;
const GPT_MAX_ENTRY_SIZE: usize = 4096;
const MAX_GPT_ENTRIES: u32 = 256;

/// Walks the partition table of a parent block device
pub trait PartitionScanner {
    /// Invoke `visitor` once for every partition found on `parent`
    ///
    /// The walk is exhaustive and synchronous; entries are delivered in
    /// table order.
    fn scan(&mut self, parent: &Path, visitor: &mut dyn FnMut(&PartitionEntry)) -> Result<()>;
}

/// Scanner reading the table straight from a device node or disk image
#[derive(Debug, Clone)]
pub struct DeviceTableScanner {
    block_size: u32,
}

impl DeviceTableScanner {
    /// Create a scanner for devices with the given logical block size
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }
}

impl PartitionScanner for DeviceTableScanner {
    fn scan(&mut self, parent: &Path, visitor: &mut dyn FnMut(&PartitionEntry)) -> Result<()> {
        log::debug!("Scanning partition table on {}", parent.display());

        let file = File::open(parent).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BringupError::DeviceNotFound(parent.to_path_buf()),
            _ => BringupError::Io(e),
        })?;

        let mut table = TableReader::new(file, self.block_size, parent);
        table.walk(visitor)
    }
}

/// Parse the partition table held by `reader`, delivering entries to `visitor`
pub fn parse_partition_table<R: Read + Seek>(
    reader: R,
    block_size: u32,
    visitor: &mut dyn FnMut(&PartitionEntry),
) -> Result<()> {
    let mut table = TableReader::new(reader, block_size, Path::new("<memory>"));
    table.walk(visitor)
}

struct TableReader<R> {
    reader: R,
    block_size: u32,
    path: PathBuf,
}

impl<R: Read + Seek> TableReader<R> {
    fn new(reader: R, block_size: u32, path: &Path) -> Self {
        Self {
            reader,
            block_size,
            path: path.to_path_buf(),
        }
    }

    fn read_block(&mut self, lba: u64) -> Result<Vec<u8>> {
        let offset = lba.checked_mul(u64::from(self.block_size)).ok_or_else(|| {
            BringupError::malformed(&self.path, format!("LBA {} out of range", lba))
        })?;
        let mut buf = vec![0u8; self.block_size as usize];

        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                BringupError::malformed(&self.path, format!("LBA {} beyond end of device", lba))
            }
            _ => BringupError::Io(e),
        })?;

        Ok(buf)
    }

    fn walk(&mut self, visitor: &mut dyn FnMut(&PartitionEntry)) -> Result<()> {
        let mbr = self.read_block(0).map_err(|e| match e {
            BringupError::MalformedPartitionTable { .. } => {
                BringupError::NoPartitionTable(self.path.clone())
            }
            other => other,
        })?;

        if !has_mbr_signature(&mbr) {
            return Err(BringupError::NoPartitionTable(self.path.clone()));
        }

        let primaries: Vec<MbrRecord> = (0..MBR_PRIMARY_ENTRIES)
            .map(|slot| MbrRecord::parse(&mbr, MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE))
            .collect();

        if primaries
            .iter()
            .any(|r| r.type_byte == MBR_TYPE_GPT_PROTECTIVE)
        {
            log::debug!("Protective MBR found, reading GPT");
            return self.walk_gpt(visitor);
        }

        for (slot, record) in primaries.iter().enumerate() {
            if record.is_unused() {
                continue;
            }

            if record.is_extended() {
                self.walk_extended(u64::from(record.start_lba), visitor)?;
                continue;
            }

            visitor(&record.to_entry(slot as u32, 0));
        }

        Ok(())
    }

    fn walk_extended(
        &mut self,
        extended_base: u64,
        visitor: &mut dyn FnMut(&PartitionEntry),
    ) -> Result<()> {
        let mut ebr_lba = extended_base;
        let mut seen = HashSet::new();
        let mut index = FIRST_LOGICAL_INDEX;

        while index < FIRST_LOGICAL_INDEX + MAX_LOGICAL_PARTITIONS {
            if !seen.insert(ebr_lba) {
                log::warn!(
                    "EBR chain on {} loops back to LBA {}",
                    self.path.display(),
                    ebr_lba
                );
                break;
            }

            let ebr = self.read_block(ebr_lba)?;
            if !has_mbr_signature(&ebr) {
                log::warn!(
                    "Missing EBR signature at LBA {} on {}",
                    ebr_lba,
                    self.path.display()
                );
                break;
            }

            let logical = MbrRecord::parse(&ebr, MBR_TABLE_OFFSET);
            let link = MbrRecord::parse(&ebr, MBR_TABLE_OFFSET + MBR_ENTRY_SIZE);

            if !logical.is_unused() {
                visitor(&logical.to_entry(index, ebr_lba));
                index += 1;
            }

            if link.is_unused() || link.start_lba == 0 {
                break;
            }
            ebr_lba = extended_base + u64::from(link.start_lba);
        }

        Ok(())
    }

    fn walk_gpt(&mut self, visitor: &mut dyn FnMut(&PartitionEntry)) -> Result<()> {
        let header = self.read_block(1)?;
        if &header[0..8] != GPT_SIGNATURE {
            return Err(BringupError::malformed(&self.path, "GPT header signature missing"));
        }

        let entries_lba = le_u64(&header, 72);
        let num_entries = le_u32(&header, 80);
        let entry_size = le_u32(&header, 84) as usize;

        if !(GPT_MIN_ENTRY_SIZE..=GPT_MAX_ENTRY_SIZE).contains(&entry_size) {
            return Err(BringupError::malformed(
                &self.path,
                format!("GPT entry size {} is not supported", entry_size),
            ));
        }

        if num_entries > MAX_GPT_ENTRIES {
            log::warn!(
                "GPT on {} declares {} entries, walking the first {}",
                self.path.display(),
                num_entries,
                MAX_GPT_ENTRIES
            );
        }

        let count = num_entries.min(MAX_GPT_ENTRIES) as usize;
        let total = count * entry_size;
        let block_size = self.block_size as usize;
        let blocks = total.div_ceil(block_size);

        let entries_end = entries_lba.checked_add(blocks as u64).ok_or_else(|| {
            BringupError::malformed(
                &self.path,
                format!("GPT entry array at LBA {} runs past the device", entries_lba),
            )
        })?;

        let mut raw = Vec::with_capacity(blocks * block_size);
        for lba in entries_lba..entries_end {
            raw.extend_from_slice(&self.read_block(lba)?);
        }

        for i in 0..count {
            let entry = &raw[i * entry_size..(i + 1) * entry_size];

            let mut guid = [0u8; 16];
            guid.copy_from_slice(&entry[0..16]);
            let type_guid = Uuid::from_bytes_le(guid);
            if type_guid.is_nil() {
                continue;
            }

            let first_lba = le_u64(entry, 32);
            let last_lba = le_u64(entry, 40);
            let block_count = match last_lba
                .checked_sub(first_lba)
                .and_then(|span| span.checked_add(1))
            {
                Some(count) => count,
                None => {
                    log::warn!(
                        "GPT entry {} on {} has an invalid range {}..={}, skipping",
                        i,
                        self.path.display(),
                        first_lba,
                        last_lba
                    );
                    continue;
                }
            };

            visitor(&PartitionEntry {
                index: i as u32,
                first_block: first_lba,
                block_count,
                kind: PartitionKind::Gpt {
                    type_guid,
                    name: decode_gpt_name(&entry[56..128]),
                },
            });
        }

        Ok(())
    }
}

/// One 16-byte MBR/EBR table record
#[derive(Debug, Clone, Copy)]
struct MbrRecord {
    status: u8,
    type_byte: u8,
    start_lba: u32,
    sector_count: u32,
}

impl MbrRecord {
    fn parse(block: &[u8], offset: usize) -> Self {
        Self {
            status: block[offset],
            type_byte: block[offset + 4],
            start_lba: le_u32(block, offset + 8),
            sector_count: le_u32(block, offset + 12),
        }
    }

    fn is_unused(&self) -> bool {
        self.type_byte == 0 || self.sector_count == 0
    }

    fn is_extended(&self) -> bool {
        MBR_EXTENDED_TYPES.contains(&self.type_byte)
    }

    fn to_entry(self, index: u32, base_lba: u64) -> PartitionEntry {
        PartitionEntry {
            index,
            first_block: base_lba + u64::from(self.start_lba),
            block_count: u64::from(self.sector_count),
            kind: PartitionKind::Mbr {
                type_byte: self.type_byte,
                bootable: self.status == 0x80,
            },
        }
    }
}

fn has_mbr_signature(block: &[u8]) -> bool {
    block.len() >= 512 && block[510..512] == MBR_SIGNATURE
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn decode_gpt_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}


#[cfg(test)]
mod tests {
    use super::test_images::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn collect(image: Vec<u8>) -> Result<Vec<PartitionEntry>> {
        let mut found = Vec::new();
        parse_partition_table(Cursor::new(image), BLOCK as u32, &mut |e| {
            found.push(e.clone())
        })?;
        Ok(found)
    }

    #[test]
    fn test_primary_entries_keep_slot_index() {
        let image = mbr_image(&[(0, 0x0c, 2048, 131072), (2, 0x83, 133120, 4096)], 4);
        let found = collect(image).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0], PartitionEntry::mbr(0, 2048, 131072, 0x0c));
        assert_eq!(found[1], PartitionEntry::mbr(2, 133120, 4096, 0x83));
    }

    #[test]
    fn test_empty_table_visits_nothing() {
        let found = collect(mbr_image(&[], 1)).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_unsigned_disk_has_no_table() {
        let err = collect(vec![0u8; 4 * BLOCK]).unwrap_err();
        assert!(matches!(err, BringupError::NoPartitionTable(_)));
    }

    #[test]
    fn test_truncated_device_has_no_table() {
        let err = collect(vec![0u8; 100]).unwrap_err();
        assert!(matches!(err, BringupError::NoPartitionTable(_)));
    }

    #[test]
    fn test_bootable_flag() {
        let mut image = mbr_image(&[(0, 0x0c, 63, 100)], 1);
        image[446] = 0x80;
        let found = collect(image).unwrap();
        assert_eq!(
            found[0].kind,
            PartitionKind::Mbr {
                type_byte: 0x0c,
                bootable: true
            }
        );
    }

    #[test]
    fn test_extended_chain_yields_logical_indices() {
        // Extended partition at LBA 8 containing two logical partitions
        let mut image = mbr_image(&[(0, 0x0c, 2, 4), (1, 0x05, 8, 64)], 80);

        let ebr1 = 8 * BLOCK;
        put_record(&mut image[ebr1..ebr1 + BLOCK], 0, 0x83, 1, 10);
        put_record(&mut image[ebr1..ebr1 + BLOCK], 1, 0x05, 20, 12);
        sign(&mut image[ebr1..ebr1 + BLOCK]);

        let ebr2 = 28 * BLOCK;
        put_record(&mut image[ebr2..ebr2 + BLOCK], 0, 0x83, 1, 11);
        sign(&mut image[ebr2..ebr2 + BLOCK]);

        let found = collect(image).unwrap();
        let summary: Vec<(u32, u64, u64)> = found
            .iter()
            .map(|e| (e.index, e.first_block, e.block_count))
            .collect();

        assert_eq!(summary, vec![(0, 2, 4), (4, 9, 10), (5, 29, 11)]);
    }

    #[test]
    fn test_extended_chain_loop_terminates() {
        let mut image = mbr_image(&[(0, 0x0f, 4, 16)], 32);

        let ebr1 = 4 * BLOCK;
        put_record(&mut image[ebr1..ebr1 + BLOCK], 0, 0x83, 1, 2);
        put_record(&mut image[ebr1..ebr1 + BLOCK], 1, 0x05, 8, 4);
        sign(&mut image[ebr1..ebr1 + BLOCK]);

        // Second EBR links back to itself
        let ebr2 = 12 * BLOCK;
        put_record(&mut image[ebr2..ebr2 + BLOCK], 0, 0x83, 1, 2);
        put_record(&mut image[ebr2..ebr2 + BLOCK], 1, 0x05, 8, 4);
        sign(&mut image[ebr2..ebr2 + BLOCK]);

        let found = collect(image).unwrap();
        let indices: Vec<u32> = found.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![4, 5]);
    }

    fn gpt_image() -> Vec<u8> {
        let mut image = mbr_image(&[(0, 0xEE, 1, 0xFFFF_FFFF)], 64);

        let hdr = BLOCK;
        image[hdr..hdr + 8].copy_from_slice(GPT_SIGNATURE);
        image[hdr + 72..hdr + 80].copy_from_slice(&2u64.to_le_bytes());
        image[hdr + 80..hdr + 84].copy_from_slice(&128u32.to_le_bytes());
        image[hdr + 84..hdr + 88].copy_from_slice(&128u32.to_le_bytes());

        let basic_data = Uuid::parse_str("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7").unwrap();
        let linux_fs = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();

        let mut put = |slot: usize, guid: Uuid, first: u64, last: u64, name: &str| {
            let off = 2 * BLOCK + slot * 128;
            image[off..off + 16].copy_from_slice(&guid.to_bytes_le());
            image[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
            image[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
            for (i, unit) in name.encode_utf16().enumerate() {
                image[off + 56 + i * 2..off + 58 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        };
        put(0, basic_data, 34, 2081, "usrfs");
        put(2, linux_fs, 2082, 4129, "pwrfs");
        image
    }

    #[test]
    fn test_gpt_entries() {
        let found = collect(gpt_image()).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].index, 0);
        assert_eq!(found[0].first_block, 34);
        assert_eq!(found[0].block_count, 2048);
        assert_eq!(found[1].index, 2);
        assert_eq!(found[1].block_count, 2048);
        match &found[1].kind {
            PartitionKind::Gpt { name, type_guid } => {
                assert_eq!(name, "pwrfs");
                assert_eq!(
                    type_guid.to_string(),
                    "0fc63daf-8483-4772-8e79-3d69d8477de4"
                );
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_gpt_full_range_entry_is_skipped() {
        let mut image = gpt_image();
        let off = 2 * BLOCK;
        image[off + 32..off + 40].copy_from_slice(&0u64.to_le_bytes());
        image[off + 40..off + 48].copy_from_slice(&u64::MAX.to_le_bytes());

        let found = collect(image).unwrap();
        let indices: Vec<u32> = found.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2]);
    }

    #[test]
    fn test_gpt_reversed_entry_is_skipped() {
        let mut image = gpt_image();
        let off = 2 * BLOCK;
        image[off + 32..off + 40].copy_from_slice(&500u64.to_le_bytes());
        image[off + 40..off + 48].copy_from_slice(&100u64.to_le_bytes());

        let found = collect(image).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 2);
    }

    #[test]
    fn test_gpt_entry_array_past_end_is_malformed() {
        let mut image = gpt_image();
        image[BLOCK + 72..BLOCK + 80].copy_from_slice(&u64::MAX.to_le_bytes());

        let err = collect(image).unwrap_err();
        assert!(matches!(err, BringupError::MalformedPartitionTable { .. }));
    }

    #[test]
    fn test_gpt_without_header_is_malformed() {
        let image = mbr_image(&[(0, 0xEE, 1, 100)], 4);
        let err = collect(image).unwrap_err();
        assert!(matches!(err, BringupError::MalformedPartitionTable { .. }));
    }

    #[test]
    fn test_device_scanner_reads_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.img");
        std::fs::write(&path, mbr_image(&[(1, 0x83, 100, 200)], 2)).unwrap();

        let mut scanner = DeviceTableScanner::new(512);
        let mut found = Vec::new();
        scanner.scan(&path, &mut |e| found.push(e.index)).unwrap();
        assert_eq!(found, vec![1]);
    }

    #[test]
    fn test_device_scanner_missing_device() {
        let mut scanner = DeviceTableScanner::new(512);
        let err = scanner
            .scan(Path::new("/nonexistent/mmcsd0"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, BringupError::DeviceNotFound(_)));
    }
}
