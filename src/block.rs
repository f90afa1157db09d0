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

use std::convert::From;
use std::fmt::{Debug, Display, Formatter};

/// Type for interpreting `Block1` and `Block2` option values.
///
/// The wire value packs `(block_number << 4) | (more << 3) | szx`, where the
/// block size is `2**(szx + 4)`.
#[derive(Copy, Clone, Eq, Ord, Hash, PartialOrd, PartialEq)]
pub struct BlockInfo(pub u32);

impl BlockInfo {
    const MORE_FLAG: u32 = 0b1000;

    /// Maximum legal value for `num`.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    const SZX_RESERVED: u8 = 0b0111;

    /// Maximum legal value for `szx`.
    pub const SZX_MAX: u8 = Self::SZX_RESERVED - 1;

    /// Constructs a new `BlockInfo` from the number, more flag, and size exponent.
    pub fn new(num: u32, m: bool, szx: u8) -> Option<BlockInfo> {
        if num > Self::NUM_MAX || szx > Self::SZX_MAX {
            None
        } else {
            Some(BlockInfo((num << 4) + ((m as u32) << 3) + szx as u32))
        }
    }

    /// Computes the size exponent for a block size in bytes.
    ///
    /// The block size must be a power of two in `16..=1024`.
    pub fn szx_for_size(block_size: usize) -> Option<u8> {
        if !block_size.is_power_of_two() || block_size < 16 || block_size > 1024 {
            return None;
        }
        Some(block_size.trailing_zeros() as u8 - 4)
    }

    /// Block number value.
    #[inline]
    pub fn num(&self) -> u32 {
        self.0 >> 4
    }

    /// More flag value. If set, there are more blocks to follow.
    #[inline]
    pub fn more_flag(&self) -> bool {
        (self.0 & Self::MORE_FLAG) == Self::MORE_FLAG
    }

    /// Block size exponent field value.
    #[inline]
    pub fn szx(&self) -> u8 {
        self.0 as u8 & 0b111
    }

    /// The offset (in bytes) that this block starts at.
    #[inline]
    pub fn offset(&self) -> usize {
        let val = self.0 as usize;
        (val & !0xF) << (val & 0b0111)
    }

    /// The length of this block, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 << (self.szx() as usize + 4)
    }

    /// Checks the validity of the contained value.
    pub fn is_invalid(&self) -> bool {
        (self.num() > Self::NUM_MAX) || self.szx() == Self::SZX_RESERVED
    }

    /// Checks the contained value for validity and, if valid, returns it in an `Option`.
    pub fn valid(self) -> Option<BlockInfo> {
        if self.is_invalid() {
            None
        } else {
            Some(self)
        }
    }

    /// Returns this `BlockInfo`'s value *with* the more flag set.
    pub fn with_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 | Self::MORE_FLAG)
    }

    /// Returns this `BlockInfo`'s value *without* the more flag set.
    pub fn without_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 & !Self::MORE_FLAG)
    }
}

impl From<u32> for BlockInfo {
    fn from(x: u32) -> Self {
        BlockInfo(x)
    }
}

impl Default for BlockInfo {
    /// Returns a block info with an offset of zero and a block size of 1024.
    fn default() -> Self {
        BlockInfo(6)
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}/{}/{}",
            self.num(),
            self.more_flag() as u8,
            self.len()
        )?;
        if self.is_invalid() {
            f.write_str("(!)")
        } else {
            Ok(())
        }
    }
}

impl Debug for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "BlockInfo(0x{:06X})", self.0)?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let block = BlockInfo::default();
        assert_eq!(false, block.more_flag());
        assert_eq!(6, block.szx());
        assert_eq!(0, block.num());
        assert_eq!(1024, block.len());
        assert_eq!(0, block.offset());
        assert_eq!(false, block.is_invalid());
    }

    #[test]
    fn szx_for_size() {
        assert_eq!(Some(0), BlockInfo::szx_for_size(16));
        assert_eq!(Some(4), BlockInfo::szx_for_size(256));
        assert_eq!(Some(6), BlockInfo::szx_for_size(1024));
        assert_eq!(None, BlockInfo::szx_for_size(8));
        assert_eq!(None, BlockInfo::szx_for_size(2048));
        assert_eq!(None, BlockInfo::szx_for_size(1000));
    }

    #[test]
    fn round_trip_fields() {
        let block = BlockInfo::new(37, true, 6).unwrap();
        assert_eq!(37, block.num());
        assert_eq!(true, block.more_flag());
        assert_eq!(6, block.szx());
        assert_eq!(1024, block.len());
        assert_eq!(37 * 1024, block.offset());

        let block = block.without_more_flag();
        assert_eq!(false, block.more_flag());
        assert_eq!(37, block.num());

        let block = block.with_more_flag();
        assert_eq!(true, block.more_flag());
    }

    #[test]
    fn validity() {
        assert_eq!(false, BlockInfo(0).is_invalid());
        assert_eq!(Some(BlockInfo(1)), BlockInfo(1).valid());
        assert_eq!(true, BlockInfo(!0).is_invalid());
        assert_eq!(None, BlockInfo(!0).valid());
        assert_eq!(None, BlockInfo(BlockInfo::SZX_RESERVED as u32).valid());
        assert_eq!(None, BlockInfo::new(BlockInfo::NUM_MAX + 1, false, 6));
        assert_eq!(None, BlockInfo::new(0, false, 7));
    }
}
