// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Container file formats
//!
//! Headers are JSON. Column files (shards and root indices) are framed
//! bincode: a four byte magic, the format version, the payload length and a
//! CRC32 of the payload, all little endian, followed by the payload.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::ArborMetadata;
use crate::error::{ArborResult, PersistenceError};
use crate::fields::{DataType, FieldValues};

pub const FORMAT_VERSION: u32 = 1;
pub const SHARD_MAGIC: [u8; 4] = *b"HTSH";
pub const ROOTS_MAGIC: [u8; 4] = *b"HTRT";
pub const ARBOR_TYPE: &str = "halotree";

/// magic(4) + version(4) + length(8) + checksum(4)
const FRAME_HEADER_SIZE: usize = 20;

/// Description of one saved column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedField {
    pub units: String,
    pub dtype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value of nodes never set, for analysis fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

/// Trees stored in one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIndex {
    pub tree_start: usize,
    pub tree_end: usize,
    /// Node count of every tree, in tree order.
    pub tree_sizes: Vec<usize>,
}

impl ShardIndex {
    pub fn node_count(&self) -> usize {
        self.tree_sizes.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub format_version: u32,
    pub arbor_type: String,
    pub source_name: String,
    pub source_format: String,
    pub metadata: ArborMetadata,
    pub fields: BTreeMap<String, SavedField>,
    pub total_files: usize,
    pub total_trees: usize,
    pub total_nodes: usize,
    pub shards: Vec<ShardIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisHeader {
    pub format_version: u32,
    pub fields: BTreeMap<String, SavedField>,
}

/// Columns of a shard or root index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnBlock {
    pub fields: BTreeMap<String, FieldValues>,
}

impl ColumnBlock {
    pub fn get(&self, field: &str) -> Option<&FieldValues> {
        self.fields.get(field)
    }

    /// Appends `values` to the column `field`, creating it if needed.
    pub fn append(&mut self, field: &str, values: &FieldValues) {
        match self.fields.get_mut(field) {
            Some(existing) => existing.extend(values),
            None => {
                self.fields.insert(field.to_string(), values.clone());
            }
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn write_header<T: Serialize>(path: &Path, header: &T) -> ArborResult<()> {
    let json = serde_json::to_vec_pretty(header).map_err(|e| PersistenceError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    fs::write(path, json).map_err(|e| io_error(path, e))?;
    Ok(())
}

pub fn read_header<T: DeserializeOwned>(path: &Path) -> ArborResult<T> {
    let content = fs::read(path).map_err(|e| io_error(path, e))?;
    let header = serde_json::from_slice(&content).map_err(|e| PersistenceError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(header)
}

pub fn encode_block(path: &Path, magic: [u8; 4], block: &ColumnBlock) -> ArborResult<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(block, bincode::config::standard()).map_err(|e| PersistenceError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let mut buffer = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&magic);
    buffer.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(|e| io_error(path, e))?;
    buffer.write_u64::<LittleEndian>(payload.len() as u64).map_err(|e| io_error(path, e))?;
    buffer.write_u32::<LittleEndian>(checksum).map_err(|e| io_error(path, e))?;
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

pub fn decode_block(path: &Path, magic: [u8; 4], bytes: &[u8]) -> ArborResult<ColumnBlock> {
    let corruption = |message: &str| PersistenceError::Corruption {
        path: path.to_path_buf(),
        message: message.to_string(),
    };
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(corruption("file is shorter than its frame header").into());
    }

    let mut cursor = Cursor::new(bytes);
    let mut found = [0u8; 4];
    cursor.read_exact(&mut found).map_err(|e| io_error(path, e))?;
    if found != magic {
        return Err(corruption("bad magic number").into());
    }
    let version = cursor.read_u32::<LittleEndian>().map_err(|e| io_error(path, e))?;
    if version != FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: version,
        }
        .into());
    }
    let length = cursor.read_u64::<LittleEndian>().map_err(|e| io_error(path, e))? as usize;
    let checksum = cursor.read_u32::<LittleEndian>().map_err(|e| io_error(path, e))?;

    let payload = &bytes[FRAME_HEADER_SIZE..];
    if payload.len() != length {
        return Err(corruption(&format!("payload is {} bytes, header says {}", payload.len(), length)).into());
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != checksum {
        return Err(corruption("checksum mismatch").into());
    }

    let (block, _): (ColumnBlock, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard()).map_err(|e| PersistenceError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(block)
}

pub fn write_block(path: &Path, magic: [u8; 4], block: &ColumnBlock) -> ArborResult<()> {
    let bytes = encode_block(path, magic, block)?;
    fs::write(path, bytes).map_err(|e| io_error(path, e))?;
    Ok(())
}

pub fn read_block(path: &Path, magic: [u8; 4]) -> ArborResult<ColumnBlock> {
    let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
    decode_block(path, magic, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArborError;
    use tempfile::TempDir;

    fn create_test_block() -> ColumnBlock {
        let mut block = ColumnBlock::default();
        block.append("uid", &FieldValues::Int(vec![1, 2]));
        block.append("mass", &FieldValues::Float(vec![1.5, f64::NAN]));
        block.append("uid", &FieldValues::Int(vec![3]));
        block
    }

    #[test]
    fn test_block_keeps_nan() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.shard");
        write_block(&path, SHARD_MAGIC, &create_test_block()).unwrap();

        let block = read_block(&path, SHARD_MAGIC).unwrap();
        assert_eq!(block.get("uid"), Some(&FieldValues::Int(vec![1, 2, 3])));
        let mass = block.get("mass").unwrap().to_f64_vec().unwrap();
        assert_eq!(mass[0], 1.5);
        assert!(mass[1].is_nan());
    }

    #[test]
    fn test_corruption_detected() {
        let path = Path::new("x.shard");
        let mut bytes = encode_block(path, SHARD_MAGIC, &create_test_block()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode_block(path, SHARD_MAGIC, &bytes), Err(ArborError::Persistence(PersistenceError::Corruption { .. }))));

        let bytes = encode_block(path, SHARD_MAGIC, &create_test_block()).unwrap();
        assert!(matches!(decode_block(path, ROOTS_MAGIC, &bytes), Err(ArborError::Persistence(PersistenceError::Corruption { .. }))));
        assert!(decode_block(path, SHARD_MAGIC, &bytes[..10]).is_err());
    }

    #[test]
    fn test_future_version_rejected() {
        let path = Path::new("x.shard");
        let mut bytes = encode_block(path, SHARD_MAGIC, &create_test_block()).unwrap();
        bytes[4] = 9;
        assert!(matches!(
            decode_block(path, SHARD_MAGIC, &bytes),
            Err(ArborError::Persistence(PersistenceError::UnsupportedVersion { found: 9, .. }))
        ));
    }
}
