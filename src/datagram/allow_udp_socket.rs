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
use futures_timer::Delay;
use std::future::Future;
use std::net::UdpSocket;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// A wrapper around [`std::net::UdpSocket`] that implements
/// [`AsyncDatagramSocket`].
///
/// The underlying socket is put into non-blocking mode; when a poll would
/// block, a [`futures_timer::Delay`] is used to schedule another attempt
/// after a short interval. This is a convenience stop-gap for getting up and
/// running quickly. For production code, you would want to wrap something
/// truly asynchronous instead.
#[derive(Debug)]
pub struct AllowStdUdpSocket(UdpSocket, Mutex<Option<Delay>>, Duration);

impl AllowStdUdpSocket {
    /// The default interval between polling attempts.
    const DEFAULT_ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(30);

    /// Upgrades the given [`std::net::UdpSocket`] to an instance of
    /// [`AllowStdUdpSocket`].
    ///
    /// The caller is responsible for having put `udp_socket` into
    /// non-blocking mode.
    pub fn from_std(udp_socket: UdpSocket) -> AllowStdUdpSocket {
        AllowStdUdpSocket(
            udp_socket,
            Mutex::new(None),
            Self::DEFAULT_ASYNC_POLL_INTERVAL,
        )
    }

    /// Analog of [`std::net::UdpSocket::bind`] for [`AllowStdUdpSocket`].
    pub fn bind<A>(addr: A) -> std::io::Result<AllowStdUdpSocket>
    where
        A: std::net::ToSocketAddrs,
    {
        let udp_socket = UdpSocket::bind(addr)?;
        udp_socket.set_nonblocking(true)?;
        Ok(AllowStdUdpSocket::from_std(udp_socket))
    }

    fn wait_for_data(&self, cx: &mut Context<'_>) {
        let mut lock = self.1.lock().expect("Lock failed");
        match lock.as_mut() {
            Some(delay) => delay.reset(self.2),
            None => *lock = Some(Delay::new(self.2)),
        }
        if let Some(delay) = lock.as_mut() {
            let _ = Pin::new(delay).poll(cx);
        }
    }
}

impl Unpin for AllowStdUdpSocket {}

impl AsyncDatagramSocket for AllowStdUdpSocket {}

impl DatagramSocketTypes for AllowStdUdpSocket {
    type SocketAddr = std::net::SocketAddr;
    type Error = std::io::Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        self.0.local_addr()
    }

    fn remote_addr(&self) -> Option<Self::SocketAddr> {
        self.0.peer_addr().ok()
    }
}

impl AsyncSendTo for AllowStdUdpSocket {
    fn poll_send_to(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        match self.get_ref().0.send_to(buf, addr) {
            Ok(written) => Poll::Ready(Ok(written)),
            Err(e) => {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    self.get_ref().wait_for_data(cx);
                    Poll::Pending
                } else {
                    Poll::Ready(Err(e))
                }
            }
        }
    }
}

impl AsyncRecvFrom for AllowStdUdpSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        match self.0.recv_from(buf) {
            Ok((size, from)) => Poll::Ready(Ok((size, from))),
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    self.wait_for_data(cx);
                    Poll::Pending
                }
                _ => Poll::Ready(Err(e)),
            },
        }
    }
}

impl Deref for AllowStdUdpSocket {
    type Target = UdpSocket;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
