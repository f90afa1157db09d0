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

use async_coap_arq::datagram::{
    AsyncDatagramSocket, AsyncRecvFrom, AsyncSendTo, DatagramSocketTypes, NullSocket, PairSocket,
    PairSocketAddr,
};
use async_coap_arq::message::codec;
use async_coap_arq::prelude::*;
use futures::executor::{block_on, LocalPool, LocalSpawner};
use futures::prelude::*;
use futures::task::{Context, LocalSpawnExt, Poll};
use futures_timer::Delay;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A socket wrapper whose filter can swallow outbound datagrams, for
/// exercising retransmission and NACK behavior.
struct LossySocket<S: AsyncDatagramSocket> {
    inner: S,
    drop_filter: Mutex<Box<dyn FnMut(&[u8]) -> bool + Send>>,
}

impl<S: AsyncDatagramSocket> LossySocket<S> {
    fn new<F>(inner: S, drop_filter: F) -> LossySocket<S>
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        LossySocket {
            inner,
            drop_filter: Mutex::new(Box::new(drop_filter)),
        }
    }
}

impl<S: AsyncDatagramSocket> AsyncDatagramSocket for LossySocket<S> {}

impl<S: AsyncDatagramSocket> DatagramSocketTypes for LossySocket<S> {
    type SocketAddr = S::SocketAddr;
    type Error = S::Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<Self::SocketAddr> {
        self.inner.remote_addr()
    }
}

impl<S: AsyncDatagramSocket> AsyncSendTo for LossySocket<S> {
    fn poll_send_to(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        let this = self.get_ref();
        let swallow = (this.drop_filter.lock().unwrap())(buf);
        if swallow {
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&this.inner).poll_send_to(cx, buf, addr)
    }
}

impl<S: AsyncDatagramSocket> AsyncRecvFrom for LossySocket<S> {
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        Pin::new(&self.get_ref().inner).poll_recv_from(cx, buf)
    }
}

fn fast_params() -> TransParams {
    TransParams {
        max_payload_size: 1024,
        window_size: 4,
        time_wait: Duration::from_millis(80),
        max_send_attempts: 6,
        ..TransParams::default()
    }
}

/// Spawns a server's reader task whose handler answers each delivered
/// message with whatever `respond` produces.
fn spawn_server<F>(spawner: &LocalSpawner, server: Arc<Transport<PairSocket>>, mut respond: F)
where
    F: FnMut(&InboundMessage<PairSocketAddr>) -> Option<Message> + 'static,
{
    spawner
        .spawn_local(async move {
            let responder = server.clone();
            let _ = server
                .receive_loop(move |inbound| {
                    let reply = match &inbound {
                        Ok(inbound) => respond(inbound).map(|message| (message, inbound.sender)),
                        Err(_) => None,
                    };
                    let responder = responder.clone();
                    async move {
                        if let Some((message, dest)) = reply {
                            let _ = responder.send_to(message, dest).await;
                        }
                    }
                    .boxed()
                })
                .await;
        })
        .expect("spawn failed");
}

/// Spawns a reader task that only feeds the demultiplexer.
fn spawn_reader<S>(spawner: &LocalSpawner, transport: Arc<Transport<S>>)
where
    S: AsyncDatagramSocket + 'static,
    S::SocketAddr: 'static,
{
    spawner
        .spawn_local(async move {
            let _ = transport.receive_loop(|_| async {}.boxed()).await;
        })
        .expect("spawn failed");
}

#[test]
fn small_get_ack() {
    let (client_sock, server_sock) = PairSocket::pair();
    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let mut pool = LocalPool::new();
    spawn_server(&pool.spawner(), server, |inbound| {
        let mut reply = Message::ack_to(&inbound.message, MsgCode::SuccessContent);
        reply.payload = b"hi".to_vec();
        Some(reply)
    });
    spawn_reader(&pool.spawner(), client.clone());

    let mut request = Message::request(MsgCode::MethodGet);
    request.token = vec![0x01];
    let msg_id = request.msg_id;

    let response = pool
        .run_until(client.send(request))
        .expect("send failed")
        .expect("no response");

    assert_eq!(MsgType::Ack, response.msg_type);
    assert_eq!(MsgCode::SuccessContent, response.code);
    assert_eq!(b"hi".to_vec(), response.payload);
    assert_eq!(msg_id, response.msg_id);
    assert_eq!(0, client.metrics().retransmit_messages());
}

#[test]
fn big_put_runs_block1() {
    let payload: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();

    let (client_sock, server_sock) = PairSocket::pair();
    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let received = Arc::new(Mutex::new(None));
    let mut pool = LocalPool::new();
    {
        let received = received.clone();
        spawn_server(&pool.spawner(), server, move |inbound| {
            *received.lock().unwrap() = Some(inbound.message.payload.clone());
            Some(Message::ack_to(&inbound.message, MsgCode::SuccessChanged))
        });
    }
    spawn_reader(&pool.spawner(), client.clone());

    let mut request = Message::request(MsgCode::MethodPut);
    request.payload = payload.clone();

    let response = pool
        .run_until(client.send(request))
        .expect("send failed")
        .expect("no response");

    assert_eq!(MsgCode::SuccessChanged, response.code);
    assert_eq!(Some(payload), *received.lock().unwrap());
    assert_eq!(0, client.metrics().retransmit_messages());
    assert_eq!(0, client.metrics().expired_messages());
}

#[test]
fn lossy_block1_replays_only_the_missing_block() {
    let payload: Vec<u8> = (0..5000).map(|i| (i % 199) as u8).collect();

    let (client_sock, server_sock) = PairSocket::pair();
    let mut dropped = false;
    let client_sock = LossySocket::new(client_sock, move |datagram| {
        if dropped {
            return false;
        }
        if let Ok(message) = codec::deserialize(datagram) {
            if message.msg_type == MsgType::Con && message.block1().map(|b| b.num()) == Some(2) {
                dropped = true;
                return true;
            }
        }
        false
    });

    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let received = Arc::new(Mutex::new(None));
    let mut pool = LocalPool::new();
    {
        let received = received.clone();
        spawn_server(&pool.spawner(), server, move |inbound| {
            if inbound.message.block1().is_some() {
                *received.lock().unwrap() = Some(inbound.message.payload.clone());
                Some(Message::ack_to(&inbound.message, MsgCode::SuccessChanged))
            } else {
                None
            }
        });
    }
    spawn_reader(&pool.spawner(), client.clone());

    let mut request = Message::request(MsgCode::MethodPut);
    request.payload = payload.clone();

    let response = pool
        .run_until(client.send(request))
        .expect("send failed")
        .expect("no response");

    assert_eq!(MsgCode::SuccessChanged, response.code);
    assert_eq!(Some(payload), *received.lock().unwrap());
    // Only the dropped block is replayed; it can go out twice when two
    // NACKs cross it on the wire, but nothing else is retransmitted.
    let retransmits = client.metrics().retransmit_messages();
    assert!(
        (1..=2).contains(&retransmits),
        "retransmits: {}",
        retransmits
    );
    assert_eq!(0, client.metrics().expired_messages());
}

#[test]
fn block2_response_is_reassembled() {
    let payload: Vec<u8> = (0..4096).map(|i| (i % 233) as u8).collect();

    let (client_sock, server_sock) = PairSocket::pair();
    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let mut pool = LocalPool::new();
    {
        let payload = payload.clone();
        spawn_server(&pool.spawner(), server, move |inbound| {
            let mut reply = Message::ack_to(&inbound.message, MsgCode::SuccessContent);
            reply.payload = payload.clone();
            Some(reply)
        });
    }
    spawn_reader(&pool.spawner(), client.clone());

    let mut request = Message::request(MsgCode::MethodGet);
    request.token = vec![0x02];

    let response = pool
        .run_until(client.send(request))
        .expect("send failed")
        .expect("no response");

    assert_eq!(MsgCode::SuccessContent, response.code);
    assert_eq!(payload, response.payload);
}

struct SecState {
    session_ok: AtomicBool,
    output_poisoned: AtomicBool,
    handshakes: AtomicU32,
}

/// A security layer whose pre-existing session expires on first use, so the
/// transport has to re-handshake and retry exactly once.
struct ExpiringSecurity(Arc<SecState>);

impl SecurityLayer<PairSocketAddr> for ExpiringSecurity {
    fn handshake(&self, _peer: PairSocketAddr, _proxy_addr: Option<&str>) -> Result<(), Error> {
        if !self.0.session_ok.load(Ordering::SeqCst) {
            self.0.handshakes.fetch_add(1, Ordering::SeqCst);
            self.0.session_ok.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn security_output(
        &self,
        _message: &mut Message,
        _peer: PairSocketAddr,
    ) -> Result<(), Error> {
        if !self.0.output_poisoned.swap(true, Ordering::SeqCst) {
            self.0.session_ok.store(false, Ordering::SeqCst);
            return Err(Error::SessionExpired);
        }
        Ok(())
    }

    fn security_input(
        &self,
        _message: &mut Message,
        _proxy_addr: Option<&str>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn session_expiry_is_recovered_with_one_handshake() {
    let (client_sock, server_sock) = PairSocket::pair();

    let state = Arc::new(SecState {
        session_ok: AtomicBool::new(true),
        output_poisoned: AtomicBool::new(false),
        handshakes: AtomicU32::new(0),
    });
    let client = Arc::new(Transport::with_security(
        client_sock,
        ExpiringSecurity(state.clone()),
        fast_params(),
    ));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let mut pool = LocalPool::new();
    spawn_server(&pool.spawner(), server, |inbound| {
        Some(Message::ack_to(&inbound.message, MsgCode::SuccessContent))
    });
    {
        let client = client.clone();
        pool.spawner()
            .spawn_local(async move {
                let _ = client.receive_loop(|_| async {}.boxed()).await;
            })
            .expect("spawn failed");
    }

    let mut request = Message::request(MsgCode::MethodGet);
    request.set_scheme(Scheme::Secure);

    let response = pool.run_until(client.send(request)).expect("send failed");
    assert!(response.is_some());
    assert_eq!(1, state.handshakes.load(Ordering::SeqCst));
}

#[test]
fn total_loss_times_out_after_max_attempts() {
    let params = TransParams {
        time_wait: Duration::from_millis(60),
        max_send_attempts: 3,
        ..fast_params()
    };
    let client = Transport::new(NullSocket::new(), params);

    let mut request = Message::request(MsgCode::MethodGet);
    request.payload = b"ping".to_vec();

    let started = Instant::now();
    let result = block_on(client.send(request));
    let elapsed = started.elapsed();

    assert_eq!(Err(Error::MaxAttempts), result);
    assert!(elapsed >= Duration::from_millis(180), "elapsed: {:?}", elapsed);
    assert_eq!(3, client.metrics().sent_messages());
    assert_eq!(2, client.metrics().retransmit_messages());
    assert_eq!(1, client.metrics().expired_messages());
}

#[test]
fn lossy_endpoint_is_survived_by_retransmission() {
    let (client_sock, server_sock) = PairSocket::pair();
    let mut remaining_drops = 2u32;
    let client_sock = LossySocket::new(client_sock, move |_| {
        if remaining_drops > 0 {
            remaining_drops -= 1;
            true
        } else {
            false
        }
    });

    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let mut pool = LocalPool::new();
    spawn_server(&pool.spawner(), server, |inbound| {
        Some(Message::ack_to(&inbound.message, MsgCode::SuccessContent))
    });
    spawn_reader(&pool.spawner(), client.clone());

    let request = Message::request(MsgCode::MethodGet);
    let response = pool.run_until(client.send(request)).expect("send failed");

    assert!(response.is_some());
    assert_eq!(2, client.metrics().retransmit_messages());
    assert_eq!(3, client.metrics().sent_messages());
}

#[test]
fn concurrent_exchanges_stay_isolated() {
    let (client_sock, server_sock) = PairSocket::pair();
    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let mut pool = LocalPool::new();
    spawn_server(&pool.spawner(), server, |inbound| {
        // Echo the token back as the payload.
        let mut reply = Message::ack_to(&inbound.message, MsgCode::SuccessContent);
        reply.payload = inbound.message.token.clone();
        Some(reply)
    });
    spawn_reader(&pool.spawner(), client.clone());

    let mut first = Message::request(MsgCode::MethodGet);
    first.token = vec![0x11];
    let mut second = Message::request(MsgCode::MethodGet);
    second.token = vec![0x22];

    let (first_response, second_response) = pool.run_until(futures::future::join(
        client.send(first),
        client.send(second),
    ));

    assert_eq!(
        vec![0x11],
        first_response.expect("send failed").expect("no response").payload
    );
    assert_eq!(
        vec![0x22],
        second_response.expect("send failed").expect("no response").payload
    );
}

#[test]
fn duplicate_confirmables_invoke_the_handler_once() {
    let (client_sock, server_sock) = PairSocket::pair();
    let client = Arc::new(Transport::new(client_sock, fast_params()));
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let invocations = Arc::new(AtomicU32::new(0));
    let mut pool = LocalPool::new();
    {
        let invocations = invocations.clone();
        spawn_server(&pool.spawner(), server, move |inbound| {
            invocations.fetch_add(1, Ordering::SeqCst);
            Some(Message::ack_to(&inbound.message, MsgCode::SuccessContent))
        });
    }
    spawn_reader(&pool.spawner(), client.clone());

    let mut message = Message::request(MsgCode::MethodPost);
    message.token = vec![0x09];
    let duplicate = message.clone();

    let first = pool.run_until(client.send(message));
    assert!(first.expect("send failed").is_some());

    // The same confirmable again, well inside the suppression TTL: the
    // handler must not run a second time, so no response ever comes.
    let second = pool.run_until(client.send(duplicate));
    assert_eq!(Err(Error::MaxAttempts), second);

    assert_eq!(1, invocations.load(Ordering::SeqCst));
}

#[test]
fn block1_reassembly_tolerates_any_arrival_order() {
    let payload: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<Vec<u8>> = payload.chunks(1024).map(|c| c.to_vec()).collect();

    let (raw_client, server_sock) = PairSocket::pair();
    let server = Arc::new(Transport::new(server_sock, fast_params()));

    let received = Arc::new(Mutex::new(None));
    let mut pool = LocalPool::new();
    {
        let received = received.clone();
        spawn_server(&pool.spawner(), server, move |inbound| {
            *received.lock().unwrap() = Some(inbound.message.payload.clone());
            Some(Message::ack_to(&inbound.message, MsgCode::SuccessChanged))
        });
    }

    pool.run_until(async {
        for i in [2usize, 0, 4, 1, 3].iter() {
            let mut block_message = Message::new(MsgType::Con, MsgCode::MethodPut);
            block_message.token = vec![0x07];
            block_message.insert_option(
                OptionNumber::BLOCK1,
                BlockInfo::new(*i as u32, *i < 4, 6).unwrap(),
            );
            block_message.insert_option(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE, 4u16);
            block_message.payload = chunks[*i].clone();

            let datagram = codec::serialize(&block_message).unwrap();
            raw_client
                .send_to(&datagram, PairSocketAddr(1))
                .await
                .expect("raw send failed");
        }

        for _ in 0..100u32 {
            if received.lock().unwrap().is_some() {
                break;
            }
            Delay::new(Duration::from_millis(10)).await;
        }
    });

    assert_eq!(Some(payload), *received.lock().unwrap());
}
