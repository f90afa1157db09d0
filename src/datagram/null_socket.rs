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
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display, Formatter};
use std::pin::Pin;

/// Simplified "SocketAddr" for [`NullSocket`]. Does nothing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NullSocketAddr;

impl Display for NullSocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

/// An instance of [`AsyncDatagramSocket`] that implements a simple null
/// interface, where all packets that are sent are discarded.
#[derive(Debug)]
pub struct NullSocket;

impl NullSocket {
    /// Creates a new instance of [`NullSocket`].
    pub fn new() -> NullSocket {
        NullSocket
    }
}

impl Default for NullSocket {
    fn default() -> Self {
        NullSocket::new()
    }
}

impl Unpin for NullSocket {}

impl AsyncDatagramSocket for NullSocket {}

impl DatagramSocketTypes for NullSocket {
    type SocketAddr = NullSocketAddr;
    type Error = crate::Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        Ok(NullSocketAddr)
    }

    fn remote_addr(&self) -> Option<Self::SocketAddr> {
        Some(NullSocketAddr)
    }
}

impl AsyncSendTo for NullSocket {
    fn poll_send_to(
        self: Pin<&Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
        _addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        Poll::Ready(Ok(buf.len()))
    }
}

impl AsyncRecvFrom for NullSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        _cx: &mut Context<'_>,
        _buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        Poll::Pending
    }
}
