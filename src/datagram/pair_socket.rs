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
use crate::Error;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::lock::Mutex;
use futures::prelude::*;
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display, Formatter};
use std::pin::Pin;

/// Simplified "SocketAddr" for [`PairSocket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PairSocketAddr(pub u8);

impl Display for PairSocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "pair:{}", self.0)
    }
}

/// An instance of [`AsyncDatagramSocket`] representing one end of an
/// in-memory datagram link.
///
/// [`PairSocket::pair`] returns two cross-connected ends: everything sent on
/// one end is received on the other. Each end reports the other as its
/// [`remote_addr`](DatagramSocketTypes::remote_addr), which makes a pair
/// behave like two connected UDP sockets.
#[derive(Debug)]
pub struct PairSocket {
    local: PairSocketAddr,
    peer: PairSocketAddr,
    // Message is (packet_bytes, source_addr)
    sender: Sender<(Vec<u8>, PairSocketAddr)>,
    receiver: Mutex<Receiver<(Vec<u8>, PairSocketAddr)>>,
}

impl PairSocket {
    const CHANNEL_CAPACITY: usize = 512;

    /// Creates a cross-connected pair of [`PairSocket`] instances.
    pub fn pair() -> (PairSocket, PairSocket) {
        let (to_a, from_b) = channel(Self::CHANNEL_CAPACITY);
        let (to_b, from_a) = channel(Self::CHANNEL_CAPACITY);

        let a = PairSocket {
            local: PairSocketAddr(0),
            peer: PairSocketAddr(1),
            sender: to_b,
            receiver: Mutex::new(from_b),
        };
        let b = PairSocket {
            local: PairSocketAddr(1),
            peer: PairSocketAddr(0),
            sender: to_a,
            receiver: Mutex::new(from_a),
        };
        (a, b)
    }
}

impl Unpin for PairSocket {}

impl AsyncDatagramSocket for PairSocket {}

impl DatagramSocketTypes for PairSocket {
    type SocketAddr = PairSocketAddr;
    type Error = Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<Self::SocketAddr> {
        Some(self.peer)
    }
}

impl AsyncSendTo for PairSocket {
    fn poll_send_to(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        _addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        let mut sender = self.get_ref().sender.clone();
        match sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => match sender.start_send((buf.to_vec(), self.local)) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => {
                    if e.is_full() {
                        Poll::Pending
                    } else {
                        Poll::Ready(Err(Error::IOError))
                    }
                }
            },
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::IOError)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRecvFrom for PairSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        let mut receiver_lock_future = self.get_ref().receiver.lock();
        let receiver_lock_future = Pin::new(&mut receiver_lock_future);

        if let Poll::Ready(mut receiver_guard) = receiver_lock_future.poll(cx) {
            let receiver: &mut Receiver<(Vec<u8>, PairSocketAddr)> = &mut receiver_guard;
            match receiver.poll_next_unpin(cx) {
                Poll::Ready(Some((packet, from))) => {
                    // Oversized datagrams truncate, as UDP reads do.
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Poll::Ready(Ok((len, from)))
                }
                Poll::Ready(None) => Poll::Ready(Err(Error::IOError)),
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Pending
        }
    }
}
