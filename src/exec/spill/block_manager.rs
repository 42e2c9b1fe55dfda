// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Private layout of one spilled buffer file.
//!
//! ```text
//! 0..4   magic "VBUF"
//! 4..6   version (u16 le)
//! 6..8   header length (u16 le)
//! 8..16  payload length (u64 le)
//! 16..20 crc32c of payload (u32 le)
//! 20..24 reserved, zero
//! 24..   payload
//! ```
//!
//! This is not a stable format; files never outlive the process that wrote them.

use std::io::{Read, Write};

use crate::common::error::{EngineError, EngineResult};

const BLOCK_MAGIC: [u8; 4] = *b"VBUF";
const BLOCK_VERSION: u16 = 1;
pub(crate) const BLOCK_HEADER_LEN: u16 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub payload_len: u64,
    pub checksum: u32,
}

impl BlockHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u64,
            checksum: crc32c::crc32c(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN as usize] {
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        buf[..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&BLOCK_HEADER_LEN.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; BLOCK_HEADER_LEN as usize]) -> EngineResult<Self> {
        if buf[..4] != BLOCK_MAGIC {
            return Err(EngineError::StorageFormat(
                "spill block header magic mismatch".to_string(),
            ));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != BLOCK_VERSION {
            return Err(EngineError::StorageFormat(format!(
                "unsupported spill block version: {version}"
            )));
        }
        let header_len = u16::from_le_bytes([buf[6], buf[7]]);
        if header_len != BLOCK_HEADER_LEN {
            return Err(EngineError::StorageFormat(format!(
                "unsupported spill block header length: {header_len}"
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&buf[16..20]);
        if buf[20..24] != [0u8; 4] {
            return Err(EngineError::StorageFormat(
                "spill block header reserved field must be 0".to_string(),
            ));
        }
        Ok(Self {
            payload_len: u64::from_le_bytes(len_bytes),
            checksum: u32::from_le_bytes(crc_bytes),
        })
    }
}

pub fn write_block<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<BlockHeader> {
    let header = BlockHeader::for_payload(payload);
    writer.write_all(&header.to_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(header)
}

/// Read a whole block into `out`, replacing its contents.
pub fn read_block<R: Read>(reader: &mut R, out: &mut Vec<u8>) -> EngineResult<BlockHeader> {
    let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|e| EngineError::storage("read spill block header", e))?;
    let header = BlockHeader::from_bytes(&buf)?;
    let len = usize::try_from(header.payload_len).map_err(|_| {
        EngineError::StorageFormat(format!(
            "spill payload length {} does not fit in memory",
            header.payload_len
        ))
    })?;
    out.clear();
    out.resize(len, 0);
    reader
        .read_exact(out)
        .map_err(|e| EngineError::storage("read spill block payload", e))?;
    let actual = crc32c::crc32c(out);
    if actual != header.checksum {
        return Err(EngineError::StorageFormat(format!(
            "spill block checksum mismatch: expected {:#010x}, got {:#010x}",
            header.checksum, actual
        )));
    }
    Ok(header)
}
