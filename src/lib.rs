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

//! An experimental, asynchronous reliable-transport core for the
//! Constrained Application Protocol (CoAP).
//!
//! This crate turns a datagram socket into a reliable request/response
//! channel: confirmable messages are retransmitted until acknowledged,
//! payloads above the block size travel as selective-repeat block-wise
//! transfers (`Block1` for requests, `Block2` for responses) with
//! window-offset NACKs, and a single reader task demultiplexes inbound
//! traffic onto the in-flight exchanges by `(peer, token)`.
//!
//! The socket is an injected capability: anything implementing
//! [`datagram::AsyncDatagramSocket`] will do, be it UDP, DTLS, or an
//! in-memory link. A second injected capability, [`SecurityLayer`], is
//! invoked around the codec and owns session state; the transport reacts
//! to its session errors by re-handshaking once and retrying.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::prelude::*;
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//! use async_coap_arq::prelude::*;
//! use async_coap_arq::datagram::AllowStdUdpSocket;
//!
//! let socket = AllowStdUdpSocket::bind("[::]:0").expect("UDP bind failed");
//! socket.connect("coap.me:5683").expect("UDP connect failed");
//!
//! let transport = Arc::new(Transport::new(socket, TransParams::default()));
//!
//! let mut pool = LocalPool::new();
//!
//! // The reader task must be running for responses to be observed.
//! let reader = transport.clone();
//! pool.spawner()
//!     .spawn_local(async move {
//!         let _ = reader.receive_loop(|_| async {}.boxed()).await;
//!     })
//!     .expect("spawn failed");
//!
//! let mut request = Message::request(MsgCode::MethodGet);
//! request.insert_option(OptionNumber::URI_PATH, "test");
//!
//! let response = pool
//!     .run_until(transport.send(request))
//!     .expect("CoAP request failed");
//!
//! println!("Got response: {:?}", response);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod message;
pub mod option;

mod block;
pub use block::*;

mod trans_params;
pub use trans_params::*;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::*;

mod util;

mod metrics;
pub use metrics::Metrics;

mod security;
pub use security::*;

pub mod datagram;

pub mod transport;
pub use transport::InboundMessage;
pub use transport::Transport;

#[doc(hidden)]
pub mod prelude {
    pub use super::message::Message;
    pub use super::message::MsgCode;
    pub use super::message::MsgCodeClass;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;
    pub use super::message::Scheme;

    pub use super::option::OptionNumber;
    pub use super::option::OptionValue;

    pub use super::transport::InboundMessage;
    pub use super::transport::Transport;

    pub use super::BlockInfo;
    pub use super::Error;
    pub use super::TransParams;

    pub use super::PlainSecurity;
    pub use super::SecurityLayer;
}
