//! Save state serialization
//!
//! States are bincode-encoded with a fixed-width little-endian configuration, prefixed by a magic
//! string and a format version so that incompatible files are rejected up front instead of
//! producing garbage state.

use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use std::io;
use std::io::{Read, Write};
use thiserror::Error;

const FILE_PREFIX: &[u8] = b"msxstate";
const HEADER_LEN: usize = FILE_PREFIX.len() + 2;

pub const SAVE_STATE_VERSION: u16 = 1;

macro_rules! bincode_config {
    () => {
        bincode::config::standard().with_little_endian().with_fixed_int_encoding()
    };
}

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Error encoding save state: {0}")]
    Encode(#[from] EncodeError),
    #[error("Error decoding save state: {0}")]
    Decode(#[from] DecodeError),
    #[error("Not a save state file")]
    PrefixMismatch,
    #[error("Unsupported save state version {found}; current version is {current}")]
    UnsupportedVersion { found: u16, current: u16 },
}

/// Serializes `state` to `writer`, preceded by the magic prefix and format version.
pub fn save_state<S: Encode, W: Write>(state: &S, writer: &mut W) -> Result<(), SaveStateError> {
    writer.write_all(FILE_PREFIX)?;
    writer.write_all(&SAVE_STATE_VERSION.to_le_bytes())?;

    bincode::encode_into_std_write(state, writer, bincode_config!())?;

    Ok(())
}

/// Deserializes a state previously written by [`save_state`].
pub fn load_state<S: Decode<()>, R: Read>(reader: &mut R) -> Result<S, SaveStateError> {
    let mut header = [0; HEADER_LEN];
    reader.read_exact(&mut header)?;

    if &header[..FILE_PREFIX.len()] != FILE_PREFIX {
        return Err(SaveStateError::PrefixMismatch);
    }

    let version = u16::from_le_bytes([header[FILE_PREFIX.len()], header[FILE_PREFIX.len() + 1]]);
    if version != SAVE_STATE_VERSION {
        return Err(SaveStateError::UnsupportedVersion {
            found: version,
            current: SAVE_STATE_VERSION,
        });
    }

    Ok(bincode::decode_from_std_read(reader, bincode_config!())?)
}
