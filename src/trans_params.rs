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

use crate::consts::{DEFAULT_MTU, DEFAULT_WINDOW_SIZE, MAX_PAYLOAD_SIZE};
use std::time::Duration;

/// Transmission parameters governing the reliability machinery of a
/// [`Transport`](crate::transport::Transport).
///
/// `time_wait` is the per-attempt acknowledgement timeout and
/// `max_send_attempts` bounds how often a single message or block is
/// (re)transmitted. Their product, [`TransParams::sum_time_attempts`], is the
/// overall liveness bound of an exchange: block reassembly gives up after
/// that much silence, and it also serves as the TTL of the duplicate
/// suppression cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransParams {
    /// Largest payload carried by a single datagram before the transfer
    /// goes block-wise. Must be a power of two in `16..=1024`.
    pub max_payload_size: usize,

    /// Width of the selective-repeat window, in blocks.
    pub window_size: usize,

    /// Read-buffer ceiling; larger inbound datagrams are discarded.
    pub mtu: usize,

    /// Per-attempt acknowledgement timeout.
    pub time_wait: Duration,

    /// Number of transmissions of a single message or block before the
    /// exchange fails with [`Error::MaxAttempts`](crate::Error::MaxAttempts).
    pub max_send_attempts: u32,
}

impl TransParams {
    /// The overall liveness bound: `time_wait * max_send_attempts`.
    pub fn sum_time_attempts(&self) -> Duration {
        self.time_wait * self.max_send_attempts
    }

    /// The block size exponent corresponding to `max_payload_size`.
    pub fn block_szx(&self) -> u8 {
        crate::block::BlockInfo::szx_for_size(self.max_payload_size).unwrap_or(6)
    }
}

impl Default for TransParams {
    fn default() -> Self {
        TransParams {
            max_payload_size: MAX_PAYLOAD_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            mtu: DEFAULT_MTU,
            time_wait: Duration::from_secs(3),
            max_send_attempts: 6,
        }
    }
}
