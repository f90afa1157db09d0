// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use crate::util::{encode_u32, try_decode_u16, try_decode_u32};
use crate::BlockInfo;
use crate::Error;

/// Type describing the expected shape of an option's value.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone)]
pub enum OptionValueType {
    /// Opaque option value.
    Opaque,

    /// Option value is determined by the presence or absence of the option.
    Flag,

    /// Unsigned integer value, up to 32 bits.
    Integer,

    /// Unsigned integer value, at most 16 bits on the wire.
    Uint16,

    /// UTF8 string value.
    String,

    /// Integer value containing a [`BlockInfo`].
    Block,
}

/// An owned, tagged CoAP option value.
///
/// Recognized option numbers decode into the variant their
/// [`OptionValueType`] calls for; a value that doesn't fit (an oversized
/// integer, invalid UTF-8 for a string option, a reserved block size
/// exponent) is rejected while parsing rather than at access time.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum OptionValue {
    /// Unsigned integer value, wire-encoded in as few bytes as possible.
    Integer(u32),

    /// Raw bytes.
    Opaque(Vec<u8>),

    /// UTF8 string value.
    String(String),
}

impl OptionValue {
    /// Decodes the raw wire bytes of an option into the typed value the
    /// option number calls for.
    pub fn parse(number: OptionNumber, raw: &[u8]) -> Result<OptionValue, Error> {
        match number.option_value_type() {
            OptionValueType::Integer => {
                let value = try_decode_u32(raw).ok_or(Error::ParseFailure)?;
                Ok(OptionValue::Integer(value))
            }
            OptionValueType::Uint16 => {
                let value = try_decode_u16(raw).ok_or(Error::ParseFailure)?;
                Ok(OptionValue::Integer(value as u32))
            }
            OptionValueType::Block => {
                let value = try_decode_u32(raw).ok_or(Error::ParseFailure)?;
                if raw.len() > 3 {
                    return Err(Error::ParseFailure);
                }
                BlockInfo(value).valid().ok_or(Error::ParseFailure)?;
                Ok(OptionValue::Integer(value))
            }
            OptionValueType::String => {
                let value = core::str::from_utf8(raw).map_err(|_| Error::ParseFailure)?;
                Ok(OptionValue::String(value.to_string()))
            }
            OptionValueType::Opaque | OptionValueType::Flag => {
                Ok(OptionValue::Opaque(raw.to_vec()))
            }
        }
    }

    /// Encodes this value into its wire representation.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            OptionValue::Integer(x) => encode_u32(*x, &mut [0u8; 4]).to_vec(),
            OptionValue::Opaque(bytes) => bytes.clone(),
            OptionValue::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Returns the integer value, if this is an integer option.
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            OptionValue::Integer(x) => Some(*x),
            _ => None,
        }
    }

    /// Returns the string value, if this is a string option.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is an opaque option.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OptionValue::Opaque(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<u32> for OptionValue {
    fn from(x: u32) -> Self {
        OptionValue::Integer(x)
    }
}

impl From<u16> for OptionValue {
    fn from(x: u16) -> Self {
        OptionValue::Integer(x as u32)
    }
}

impl From<BlockInfo> for OptionValue {
    fn from(x: BlockInfo) -> Self {
        OptionValue::Integer(x.0)
    }
}

impl From<&str> for OptionValue {
    fn from(x: &str) -> Self {
        OptionValue::String(x.to_string())
    }
}

impl From<&[u8]> for OptionValue {
    fn from(x: &[u8]) -> Self {
        OptionValue::Opaque(x.to_vec())
    }
}
