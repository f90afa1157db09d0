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

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing the traffic of a single
/// [`Transport`](crate::transport::Transport) instance.
#[derive(Debug, Default)]
pub struct Metrics {
    sent_messages: AtomicU64,
    sent_message_errors: AtomicU64,
    received_messages: AtomicU64,
    retransmit_messages: AtomicU64,
    expired_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

impl Metrics {
    /// Datagrams handed to the socket.
    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    /// Socket write failures.
    pub fn sent_message_errors(&self) -> u64 {
        self.sent_message_errors.load(Ordering::Relaxed)
    }

    /// Datagrams successfully decoded into messages.
    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    /// Retransmissions of already-sent messages or blocks.
    pub fn retransmit_messages(&self) -> u64 {
        self.retransmit_messages.load(Ordering::Relaxed)
    }

    /// Exchanges abandoned after exhausting their attempt budget.
    pub fn expired_messages(&self) -> u64 {
        self.expired_messages.load(Ordering::Relaxed)
    }

    /// Inbound messages discarded by the reader: oversized datagrams and
    /// deliveries dropped on channel overflow.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_sent(&self) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_sent_errors(&self) {
        self.sent_message_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_received(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_retransmits(&self) {
        self.retransmit_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_expired(&self) {
        self.expired_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }
}
