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

//! The reliable request/response transport.
//!
//! [`Transport`] turns an [`AsyncDatagramSocket`] into a reliable CoAP
//! channel: confirmable messages are retransmitted until acknowledged,
//! payloads above the block size travel as selective-repeat block-wise
//! transfers, and a single reader task demultiplexes inbound traffic onto
//! the in-flight exchanges by `(peer, token)`.

use crate::datagram::{AsyncDatagramSocket, AsyncRecvFrom, AsyncSendTo};
use crate::message::{codec, Message, MsgToken, MsgType, Scheme};
use crate::metrics::Metrics;
use crate::security::{PlainSecurity, SecurityLayer};
use crate::trans_params::TransParams;
use crate::Error;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::select;
use futures::stream::FuturesUnordered;
use futures_timer::Delay;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

mod arq;

/// Upper bound on queued deliveries per exchange. The reader never blocks;
/// anything beyond this is dropped and metered.
const CHANNEL_CAPACITY: usize = 1024;

/// A decoded message together with the peer it arrived from.
#[derive(Debug, Clone)]
pub struct InboundMessage<A> {
    /// The decoded message.
    pub message: Message,

    /// Address of the peer that sent it.
    pub sender: A,
}

/// The demultiplexing identity of an in-flight exchange.
type ExchangeKey<A> = (A, MsgToken);

type ChannelMap<A> = Mutex<HashMap<ExchangeKey<A>, mpsc::Sender<InboundMessage<A>>>>;

/// Removes an exchange's demux entry when its owner is done with it, on
/// every exit path.
struct ChannelGuard<'a, A: Eq + Hash> {
    map: &'a ChannelMap<A>,
    key: ExchangeKey<A>,
}

impl<'a, A: Eq + Hash> Drop for ChannelGuard<'a, A> {
    fn drop(&mut self) {
        self.map.lock().expect("Lock failed").remove(&self.key);
    }
}

fn register_channel<'a, A>(
    map: &'a ChannelMap<A>,
    key: ExchangeKey<A>,
) -> (ChannelGuard<'a, A>, mpsc::Receiver<InboundMessage<A>>)
where
    A: Copy + Eq + Hash,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    map.lock().expect("Lock failed").insert(key, tx);
    (ChannelGuard { map, key }, rx)
}

/// Waits for the next delivery on an exchange channel, failing with
/// [`Error::MaxAttempts`] once `timeout` passes in silence.
async fn next_or_timeout<A>(
    rx: &mut mpsc::Receiver<InboundMessage<A>>,
    timeout: Duration,
) -> Result<InboundMessage<A>, Error> {
    let mut delay = Delay::new(timeout).fuse();
    let mut next = rx.next();
    select! {
        inbound = next => inbound.ok_or(Error::Cancelled),
        _ = delay => Err(Error::MaxAttempts),
    }
}

fn is_ping_ack(message: &Message) -> bool {
    message.msg_type.is_rst() && message.code.is_empty()
}

enum TaskOutcome<A> {
    Assembled(Result<InboundMessage<A>, Error>),
    HandlerDone,
}

enum Event<A, E> {
    Inbound(Result<(usize, A), E>),
    Task(TaskOutcome<A>),
}

/// A reliable CoAP transport over an injected datagram socket.
///
/// One instance serves both roles: [`send`](Transport::send) drives
/// client-style confirmable exchanges on the caller's task, while
/// [`receive_loop`](Transport::receive_loop) is the dedicated reader that
/// decodes, demultiplexes, and hands server-style traffic to the supplied
/// handler. The reader must be running for `send` to observe responses.
pub struct Transport<US: AsyncDatagramSocket, SL = PlainSecurity> {
    socket: US,
    security: SL,
    params: TransParams,
    metrics: Metrics,
    exchanges: ChannelMap<US::SocketAddr>,
    block1_channels: ChannelMap<US::SocketAddr>,
    block2_channels: ChannelMap<US::SocketAddr>,
    dedup: Mutex<HashMap<ExchangeKey<US::SocketAddr>, Instant>>,
}

impl<US: AsyncDatagramSocket, SL> fmt::Debug for Transport<US, SL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("params", &self.params)
            .finish()
    }
}

impl<US: AsyncDatagramSocket> Transport<US, PlainSecurity> {
    /// Creates a transport without a security layer.
    pub fn new(socket: US, params: TransParams) -> Self {
        Transport::with_security(socket, PlainSecurity, params)
    }
}

impl<US, SL> Transport<US, SL>
where
    US: AsyncDatagramSocket,
    SL: SecurityLayer<US::SocketAddr>,
{
    /// Creates a transport with the given security layer.
    pub fn with_security(socket: US, security: SL, params: TransParams) -> Self {
        Transport {
            socket,
            security,
            params,
            metrics: Metrics::default(),
            exchanges: Mutex::new(HashMap::new()),
            block1_channels: Mutex::new(HashMap::new()),
            block2_channels: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
        }
    }

    /// Borrows a reference to the underlying socket.
    pub fn socket(&self) -> &US {
        &self.socket
    }

    /// Traffic counters for this transport instance.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The transmission parameters this transport was built with.
    pub fn params(&self) -> &TransParams {
        &self.params
    }

    /// Sends a message to the socket's pre-bound peer and, for confirmable
    /// messages, waits for the response.
    ///
    /// * `CON` messages run the retransmission machinery: the datagram is
    ///   rewritten to the socket every `time_wait` until a reply with the
    ///   same token arrives, for at most `max_send_attempts` writes. Large
    ///   payloads go block-wise, and block-wise responses are reassembled
    ///   before being returned.
    /// * `NON` and `RST` messages are written once; no reply is awaited and
    ///   `Ok(None)` is returned.
    /// * Any other type fails with [`Error::UnsupportedType`].
    ///
    /// On [`Error::SessionExpired`] or [`Error::SessionNotFound`] from the
    /// security layer, the transport performs one fresh handshake and
    /// retries the exchange once.
    pub async fn send(&self, message: Message) -> Result<Option<Message>, Error> {
        let peer = self.socket.remote_addr().ok_or(Error::InvalidArgument)?;

        match message.msg_type {
            MsgType::Con => {
                if message.scheme() == Scheme::Secure {
                    self.security
                        .handshake(peer, message.proxy_addr.as_deref())?;
                }

                match self.send_con(&message, peer).await {
                    Err(Error::SessionExpired) | Err(Error::SessionNotFound) => {
                        if message.scheme() == Scheme::Secure {
                            self.security
                                .handshake(peer, message.proxy_addr.as_deref())?;
                        }
                        self.send_con(&message, peer).await.map(Some)
                    }
                    other => other.map(Some),
                }
            }
            MsgType::Non | MsgType::Rst => {
                self.transmit_to(&message, peer).await?;
                Ok(None)
            }
            MsgType::Ack => Err(Error::UnsupportedType),
        }
    }

    /// Sends a reply to an arbitrary peer.
    ///
    /// Accepts `ACK`, `NON`, and `RST` messages. An `ACK` whose payload
    /// exceeds the block size is streamed as a block-wise response transfer
    /// and this method resolves once the peer has acknowledged every block.
    pub async fn send_to(&self, message: Message, dest: US::SocketAddr) -> Result<(), Error> {
        match message.msg_type {
            MsgType::Ack => {
                if message.payload.len() > self.params.max_payload_size {
                    if message.token.len() > 8 {
                        return Err(Error::InvalidArgument);
                    }
                    let key = (dest, MsgToken::new(&message.token));
                    let (_guard, mut rx) = register_channel(&self.block2_channels, key);
                    self.send_arq_block2_ack(&mut rx, &message, dest).await
                } else {
                    self.transmit_to(&message, dest).await
                }
            }
            MsgType::Non | MsgType::Rst => self.transmit_to(&message, dest).await,
            MsgType::Con => Err(Error::UnsupportedType),
        }
    }

    async fn send_con(
        &self,
        message: &Message,
        peer: US::SocketAddr,
    ) -> Result<Message, Error> {
        if message.payload.len() > self.params.max_payload_size {
            return self.send_arq_block1_con(message, peer).await;
        }

        // Encode once; retransmissions reuse the same datagram.
        let data = self.prepare_outbound(message, peer)?;
        let key = (peer, MsgToken::new(&message.token));
        let (_guard, mut rx) = register_channel(&self.exchanges, key);

        let mut attempts = 0u32;
        loop {
            if attempts > 0 {
                self.metrics.incr_retransmits();
            }
            attempts += 1;
            self.write_raw(&data, peer).await?;

            let inbound = match next_or_timeout(&mut rx, self.params.time_wait).await {
                Err(Error::MaxAttempts) => {
                    if attempts == self.params.max_send_attempts {
                        self.metrics.incr_expired();
                        return Err(Error::MaxAttempts);
                    }
                    continue;
                }
                Err(e) => return Err(e),
                Ok(inbound) => inbound,
            };

            if is_ping_ack(&inbound.message) {
                return Ok(inbound.message);
            }

            if inbound.message.msg_type.is_ack() && inbound.message.code.is_empty() {
                // The peer will deliver the response block-wise.
                return self.receive_arq_block2(&mut rx, message, None, peer).await;
            }

            if inbound.message.block2().is_some() {
                return self
                    .receive_arq_block2(&mut rx, message, Some(inbound), peer)
                    .await;
            }

            return Ok(inbound.message);
        }
    }

    fn prepare_outbound(
        &self,
        message: &Message,
        dest: US::SocketAddr,
    ) -> Result<Vec<u8>, Error> {
        let mut secured = message.clone();
        self.security.security_output(&mut secured, dest)?;
        codec::serialize(&secured)
    }

    async fn write_raw(&self, data: &[u8], dest: US::SocketAddr) -> Result<(), Error> {
        self.metrics.incr_sent();
        match self.socket.send_to(data, dest).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.incr_sent_errors();
                error!("send_to: io error: {} (dest={})", e, dest);
                Err(Error::IOError)
            }
        }
    }

    pub(crate) async fn transmit_to(
        &self,
        message: &Message,
        dest: US::SocketAddr,
    ) -> Result<(), Error> {
        let data = self.prepare_outbound(message, dest)?;
        self.write_raw(&data, dest).await
    }

    /// Runs the reader task: decodes each inbound datagram, routes it to
    /// the exchange or block transfer it belongs to, and hands everything
    /// else to `handler`.
    ///
    /// The handler receives one-shot requests and the terminal results of
    /// inbound block-wise transfers; the future it returns is driven by the
    /// reader between socket reads, so it may reply through this same
    /// transport. Decode failures never terminate the loop; socket errors
    /// do.
    pub async fn receive_loop<'a, F>(&'a self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(Result<InboundMessage<US::SocketAddr>, Error>) -> BoxFuture<'a, ()>,
    {
        let mut buf = vec![0u8; self.params.mtu + 1];
        let mut tasks: FuturesUnordered<BoxFuture<'a, TaskOutcome<US::SocketAddr>>> =
            FuturesUnordered::new();

        loop {
            let event = {
                let mut recv = self.socket.recv_from(&mut buf).fuse();
                let mut finished = tasks.select_next_some();
                select! {
                    result = recv => Event::Inbound(result),
                    outcome = finished => Event::Task(outcome),
                }
            };

            match event {
                Event::Inbound(Err(e)) => {
                    error!("receive: io error: {}", e);
                    return Err(Error::IOError);
                }
                Event::Inbound(Ok((len, sender))) => {
                    if len == 0 || len > self.params.mtu {
                        self.metrics.incr_dropped();
                        continue;
                    }

                    let mut message = match codec::deserialize(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping undecodable datagram from {}: {}", sender, e);
                            continue;
                        }
                    };
                    self.metrics.incr_received();

                    if let Err(e) = self.security.security_input(&mut message, None) {
                        warn!("security input rejected message from {}: {}", sender, e);
                        continue;
                    }

                    debug!("inbound from {}: {}", sender, message);
                    self.route_inbound(message, sender, &mut tasks, &mut handler);
                }
                Event::Task(TaskOutcome::Assembled(result)) => {
                    let done = handler(result);
                    tasks.push(done.map(|_| TaskOutcome::HandlerDone).boxed());
                }
                Event::Task(TaskOutcome::HandlerDone) => {}
            }
        }
    }

    /// Routes one decoded message. Precedence: the in-flight exchange
    /// registered for `(peer, token)`, then block transfer channels, then
    /// the deduplicated one-shot handler path.
    fn route_inbound<'a, F>(
        &'a self,
        message: Message,
        sender: US::SocketAddr,
        tasks: &mut FuturesUnordered<BoxFuture<'a, TaskOutcome<US::SocketAddr>>>,
        handler: &mut F,
    ) where
        F: FnMut(Result<InboundMessage<US::SocketAddr>, Error>) -> BoxFuture<'a, ()>,
    {
        let token = match MsgToken::try_new(&message.token) {
            Some(token) => token,
            None => return,
        };
        let key = (sender, token);
        let inbound = InboundMessage { message, sender };

        // An in-flight exchange gets first claim on traffic with its token:
        // responses, block acknowledgements, and inbound response blocks.
        let inbound = match self.offer(&self.exchanges, &key, inbound) {
            None => return,
            Some(inbound) => inbound,
        };

        if inbound.message.block1().is_some() {
            let inbound = match self.offer(&self.block1_channels, &key, inbound) {
                None => return,
                Some(inbound) => inbound,
            };

            if inbound.message.msg_type.is_con() {
                // First block of a new inbound transfer: stand up a
                // reassembly task and feed it this block.
                let (guard, mut rx) = register_channel(&self.block1_channels, key);
                tasks.push(
                    async move {
                        let _guard = guard;
                        let result = self.receive_arq_block1(&mut rx).await;
                        TaskOutcome::Assembled(result)
                    }
                    .boxed(),
                );
                self.offer(&self.block1_channels, &key, inbound);
            }
            return;
        }

        if inbound.message.block2().is_some() {
            if inbound.message.msg_type.is_ack() {
                self.offer(&self.block2_channels, &key, inbound);
            }
            return;
        }

        // One-shot traffic. Retransmissions of the same confirmable within
        // the liveness bound must not invoke the handler twice.
        {
            let now = Instant::now();
            let ttl = self.params.sum_time_attempts();
            let mut dedup = self.dedup.lock().expect("Lock failed");
            dedup.retain(|_, seen| now.duration_since(*seen) < ttl);
            if dedup.contains_key(&key) {
                return;
            }
            dedup.insert(key, now);
        }

        let done = handler(Ok(inbound));
        tasks.push(done.map(|_| TaskOutcome::HandlerDone).boxed());
    }

    /// Hands `inbound` to the channel registered under `key` in `map`.
    /// Returns the message back when no channel is registered; a full or
    /// closed channel consumes (and meters) the message instead.
    fn offer(
        &self,
        map: &ChannelMap<US::SocketAddr>,
        key: &ExchangeKey<US::SocketAddr>,
        inbound: InboundMessage<US::SocketAddr>,
    ) -> Option<InboundMessage<US::SocketAddr>> {
        let mut map = map.lock().expect("Lock failed");
        match map.get_mut(key) {
            Some(tx) => {
                if let Err(e) = tx.try_send(inbound) {
                    self.metrics.incr_dropped();
                    if e.is_full() {
                        warn!("exchange queue full; dropping delivery for {}", key.1);
                    }
                }
                None
            }
            None => Some(inbound),
        }
    }
}
