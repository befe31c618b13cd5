/// Flat-file persistence for the address table
///
/// Layout: `[entry_count: u64 LE][entry_count x 50-byte record]`. Records are
/// bincode fixed-int encodings of [`DiskRecord`] in slot order.

use super::table::{AddressTable, DirectoryEntry};
use peerchat_common::{Username, MAX_USERNAME_LEN};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::info;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encoded size of one record
pub const RECORD_LEN: usize = (MAX_USERNAME_LEN + 1) + 1 + 16 + 1;

/// On-disk form of a directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiskRecord {
    /// NUL padded username bytes
    username: [u8; MAX_USERNAME_LEN + 1],
    family: u8,
    /// IPv4 occupies the first four bytes
    address: [u8; 16],
    tombstone: bool,
}

impl DiskRecord {
    fn from_entry(entry: &DirectoryEntry) -> Self {
        let mut username = [0u8; MAX_USERNAME_LEN + 1];
        let bytes = entry.username.as_bytes();
        username[..bytes.len()].copy_from_slice(bytes);

        let mut address = [0u8; 16];
        let family = match entry.address {
            IpAddr::V4(v4) => {
                address[..4].copy_from_slice(&v4.octets());
                FAMILY_V4
            }
            IpAddr::V6(v6) => {
                address.copy_from_slice(&v6.octets());
                FAMILY_V6
            }
        };

        Self {
            username,
            family,
            address,
            tombstone: entry.tombstone,
        }
    }

    fn into_entry(self) -> Result<DirectoryEntry, StoreError> {
        let end = self
            .username
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StoreError::Corrupt("username not terminated".to_string()))?;
        let raw = std::str::from_utf8(&self.username[..end])
            .map_err(|_| StoreError::Corrupt("username is not utf-8".to_string()))?;
        let username =
            Username::new(raw).map_err(|e| StoreError::Corrupt(format!("bad username: {}", e)))?;

        let address = match self.family {
            FAMILY_V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.address[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(self.address)),
            other => {
                return Err(StoreError::Corrupt(format!("unknown address family {}", other)))
            }
        };

        Ok(DirectoryEntry {
            username,
            address,
            tombstone: self.tombstone,
        })
    }
}

/// Write every live entry of `table` to `path`, replacing its contents
pub fn save(table: &AddressTable, path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    bincode::serialize_into(&mut writer, &(table.len() as u64))?;
    for entry in table.iter() {
        bincode::serialize_into(&mut writer, &DiskRecord::from_entry(entry))?;
    }

    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))?
        .sync_all()?;

    info!(entries = table.len(), path = %path.display(), "saved address table");
    Ok(())
}

/// Load a table from `path`, sized by the given limits.
///
/// A missing file yields an empty table and an empty file is created in its
/// place. Records are re-inserted, so the on-disk order does not matter.
pub fn load(path: &Path, initial_capacity: usize, max_capacity: usize) -> Result<AddressTable, StoreError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "created empty address table file");
        return Ok(AddressTable::with_limits(initial_capacity, max_capacity));
    }

    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len == 0 {
        return Ok(AddressTable::with_limits(initial_capacity, max_capacity));
    }

    let mut reader = BufReader::new(file);

    let count: u64 = bincode::deserialize_from(&mut reader)?;
    let expected_len = (count as u128) * RECORD_LEN as u128 + 8;
    if expected_len != file_len as u128 {
        return Err(StoreError::Corrupt(format!(
            "header claims {} entries ({} bytes) but file is {} bytes",
            count, expected_len, file_len
        )));
    }

    let count = count as usize;
    let capacity = AddressTable::capacity_for(count, initial_capacity, max_capacity);
    let mut table = AddressTable::with_limits(capacity, max_capacity);

    for _ in 0..count {
        let record: DiskRecord = bincode::deserialize_from(&mut reader)?;
        let entry = record.into_entry()?;
        if entry.tombstone {
            continue;
        }
        table
            .insert(entry.username, entry.address)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    }

    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        return Err(StoreError::Corrupt("trailing bytes after records".to_string()));
    }

    info!(entries = table.len(), capacity = table.capacity(), path = %path.display(), "loaded address table");
    Ok(table)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Corrupt table file: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn name(s: &str) -> Username {
        Username::new(s).unwrap()
    }

    fn live_set(table: &AddressTable) -> HashSet<(Username, IpAddr)> {
        table
            .iter()
            .map(|e| (e.username.clone(), e.address))
            .collect()
    }

    #[test]
    fn test_record_is_fixed_size() {
        let short = DirectoryEntry::new(name("a"), "10.0.0.1".parse().unwrap());
        let long = DirectoryEntry::new(name(&"z".repeat(MAX_USERNAME_LEN)), "::1".parse().unwrap());

        for entry in [short, long] {
            let encoded = bincode::serialize(&DiskRecord::from_entry(&entry)).unwrap();
            assert_eq!(encoded.len(), RECORD_LEN);
        }
    }

    #[test]
    fn test_save_then_load_reproduces_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup.table");

        let mut table = AddressTable::new();
        table.insert(name("alice"), "203.0.113.5".parse().unwrap()).unwrap();
        table.insert(name("bob"), "2001:db8::42".parse().unwrap()).unwrap();
        table.insert(name("carol"), "198.51.100.7".parse().unwrap()).unwrap();
        table.delete(&name("carol")).unwrap();

        save(&table, &path).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            8 + 2 * RECORD_LEN
        );

        let loaded = load(&path, 32, 1 << 20).unwrap();
        assert_eq!(live_set(&loaded), live_set(&table));
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.contains(&name("carol")));
    }

    #[test]
    fn test_load_sizes_table_for_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup.table");

        let mut table = AddressTable::new();
        for i in 0..100u8 {
            table
                .insert(name(&format!("peer{}", i)), IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)))
                .unwrap();
        }
        save(&table, &path).unwrap();

        let loaded = load(&path, 32, 1 << 20).unwrap();
        assert_eq!(loaded.len(), 100);
        assert_eq!(loaded.capacity(), 256);
        assert_eq!(live_set(&loaded), live_set(&table));
    }

    #[test]
    fn test_missing_file_creates_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lookup.table");

        let table = load(&path, 32, 1024).unwrap();
        assert!(table.is_empty());
        assert!(path.exists());

        // The freshly created empty file loads as an empty table too.
        let again = load(&path, 32, 1024).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup.table");

        let mut table = AddressTable::new();
        table.insert(name("alice"), "203.0.113.5".parse().unwrap()).unwrap();
        table.insert(name("bob"), "203.0.113.6".parse().unwrap()).unwrap();
        save(&table, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(matches!(load(&path, 32, 1024), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_bad_family_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookup.table");

        let mut table = AddressTable::new();
        table.insert(name("alice"), "203.0.113.5".parse().unwrap()).unwrap();
        save(&table, &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // family byte follows the 8-byte header and the username buffer
        bytes[8 + MAX_USERNAME_LEN + 1] = 9;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(load(&path, 32, 1024), Err(StoreError::Corrupt(_))));
    }
}
