//! Declarative description of the game's message framing and field positions.
//!
//! The byte layout is not baked into the crate. It is loaded from a JSON
//! contract so the reassembly and decoding code stays protocol-agnostic.
//! All field offsets are absolute, counted from the first byte of a frame
//! (including any magic marker).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    U8,
    U16Le,
    U16Be,
    U32Le,
    U32Be,
    U64Le,
    U64Be,
    /// LEB128, at most 10 bytes.
    Varint,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub offset: usize,
    pub kind: FieldKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FrameLayout {
    /// Bytes every frame starts with. Used to resynchronize after garbage.
    #[serde(default)]
    pub magic: Vec<u8>,
    pub length: FieldSpec,
    /// When false the declared length counts only the bytes after the length field.
    #[serde(default)]
    pub length_includes_header: bool,
    #[serde(default)]
    pub length_adjust: i64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_max_frame_len() -> usize {
    65_535
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DamageLayout {
    pub opcode_value: u64,
    pub attacker: FieldSpec,
    pub target: FieldSpec,
    pub skill: FieldSpec,
    pub amount: FieldSpec,
    #[serde(default)]
    pub crit: Option<FieldSpec>,
    #[serde(default = "default_crit_mask")]
    pub crit_mask: u64,
}

fn default_crit_mask() -> u64 {
    u64::MAX
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NicknameLayout {
    pub opcode_value: u64,
    pub entity: FieldSpec,
    /// Byte length of the UTF-8 name; the name bytes follow it directly.
    pub name_length: FieldSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolLayout {
    pub frame: FrameLayout,
    pub opcode: FieldSpec,
    pub damage: DamageLayout,
    #[serde(default)]
    pub nickname: Option<NicknameLayout>,
}

impl ProtocolLayout {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}
