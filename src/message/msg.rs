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
use crate::option::{OptionNumber, OptionValue};
use crate::BlockInfo;
use std::collections::HashMap;

/// Transport scheme of a message: plain CoAP or CoAP over the security layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scheme {
    /// Plain-text CoAP.
    Plain,

    /// CoAP behind the security input/output layer.
    Secure,
}

const URI_SCHEME_SECURE: u32 = 1;

/// An owned CoAP message.
///
/// Options are kept ordered by option number, which is what the wire
/// encoding requires; use [`Message::insert_option`] and friends rather
/// than manipulating the list directly.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    /// Message type: `CON`, `NON`, `ACK`, or `RST`.
    pub msg_type: MsgType,

    /// Message code, e.g. `GET` or `2.05 Content`.
    pub code: MsgCode,

    /// Message ID correlating a `CON` with its `ACK`/`RST` on the wire.
    /// Chosen once at construction; retransmission never rewrites it.
    pub msg_id: MsgId,

    /// Token correlating a response with its request, at most eight bytes.
    pub token: Vec<u8>,

    options: Vec<(OptionNumber, OptionValue)>,

    /// Opaque message payload.
    pub payload: Vec<u8>,

    /// Proxy address this message should be relayed through, if any.
    /// Not part of the wire encoding.
    pub proxy_addr: Option<String>,
}

impl Message {
    /// Creates a new message of the given type and code with a freshly
    /// chosen message id and an empty token.
    pub fn new(msg_type: MsgType, code: MsgCode) -> Message {
        Message {
            msg_type,
            code,
            msg_id: rand::random::<u16>(),
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
            proxy_addr: None,
        }
    }

    /// Creates a new `CON` request with a fresh random token.
    pub fn request(code: MsgCode) -> Message {
        let mut message = Message::new(MsgType::Con, code);
        message.token = rand::random::<[u8; 6]>().to_vec();
        message
    }

    /// Returns the ordered option list.
    pub fn options(&self) -> &[(OptionNumber, OptionValue)] {
        &self.options
    }

    /// Inserts an option, keeping the list ordered by option number.
    /// A repeated number is placed after its existing instances.
    pub fn insert_option<V: Into<OptionValue>>(&mut self, number: OptionNumber, value: V) {
        let at = self
            .options
            .iter()
            .position(|(n, _)| *n > number)
            .unwrap_or(self.options.len());
        self.options.insert(at, (number, value.into()));
    }

    /// Removes every instance of the given option number.
    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|(n, _)| *n != number);
    }

    /// Replaces any existing instances of the given option number with a
    /// single value.
    pub fn set_option<V: Into<OptionValue>>(&mut self, number: OptionNumber, value: V) {
        self.remove_option(number);
        self.insert_option(number, value);
    }

    /// Returns the first instance of the given option, if present.
    pub fn option(&self, number: OptionNumber) -> Option<&OptionValue> {
        self.options
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v)
    }

    /// Returns the integer value of the given option, if present and typed
    /// as an integer.
    pub fn option_uint(&self, number: OptionNumber) -> Option<u32> {
        self.option(number).and_then(OptionValue::as_uint)
    }

    /// Returns the `Block1` option value, if present and valid.
    pub fn block1(&self) -> Option<BlockInfo> {
        self.option_uint(OptionNumber::BLOCK1)
            .and_then(|x| BlockInfo(x).valid())
    }

    /// Returns the `Block2` option value, if present and valid.
    pub fn block2(&self) -> Option<BlockInfo> {
        self.option_uint(OptionNumber::BLOCK2)
            .and_then(|x| BlockInfo(x).valid())
    }

    /// Returns the `Content-Format` option value, if present.
    pub fn content_format(&self) -> Option<u16> {
        self.option_uint(OptionNumber::CONTENT_FORMAT)
            .map(|x| x as u16)
    }

    /// Returns the `Window-Offset` NACK value, if present.
    pub fn window_offset(&self) -> Option<u16> {
        self.option_uint(OptionNumber::WINDOW_OFFSET)
            .map(|x| x as u16)
    }

    /// Returns the advertised selective-repeat window size, if present.
    pub fn selective_repeat_window_size(&self) -> Option<u16> {
        self.option_uint(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE)
            .map(|x| x as u16)
    }

    /// Returns the transport scheme this message asks for.
    pub fn scheme(&self) -> Scheme {
        match self.option_uint(OptionNumber::URI_SCHEME) {
            Some(URI_SCHEME_SECURE) => Scheme::Secure,
            _ => Scheme::Plain,
        }
    }

    /// Sets the transport scheme option.
    pub fn set_scheme(&mut self, scheme: Scheme) {
        match scheme {
            Scheme::Plain => self.remove_option(OptionNumber::URI_SCHEME),
            Scheme::Secure => self.set_option(OptionNumber::URI_SCHEME, URI_SCHEME_SECURE),
        }
    }

    /// Constructs an `ACK` reply to `inbound` with the given code.
    ///
    /// Token and message id are taken from `inbound`; a `Block1` or
    /// `Block2` option on `inbound` is echoed so the peer can correlate the
    /// acknowledgement with the block it covers.
    pub fn ack_to(inbound: &Message, code: MsgCode) -> Message {
        let mut ack = Message {
            msg_type: MsgType::Ack,
            code,
            msg_id: inbound.msg_id,
            token: inbound.token.clone(),
            options: Vec::new(),
            payload: Vec::new(),
            proxy_addr: inbound.proxy_addr.clone(),
        };
        if let Some(block) = inbound.block1() {
            ack.insert_option(OptionNumber::BLOCK1, block);
        }
        if let Some(block) = inbound.block2() {
            ack.insert_option(OptionNumber::BLOCK2, block);
        }
        ack
    }

    /// Constructs a block acknowledgement that doubles as a NACK.
    ///
    /// When a block below `block_number` is still missing from `received`,
    /// the reply carries a `Window-Offset` option naming the lowest such
    /// block number and echoes the peer's advertised window size.
    pub fn ack_to_with_window_offset(
        inbound: &Message,
        code: MsgCode,
        window_size: u16,
        block_number: u32,
        received: &HashMap<u32, Vec<u8>>,
    ) -> Message {
        let mut ack = Message::ack_to(inbound, code);
        if let Some(missing) = (0..block_number).find(|n| !received.contains_key(n)) {
            ack.insert_option(OptionNumber::WINDOW_OFFSET, missing as u16);
            ack.insert_option(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE, window_size);
        }
        ack
    }

    /// Constructs the empty `ACK` that precedes a block-wise response,
    /// advertising the window size the response blocks will use.
    pub fn empty_ack_with_window_size(reply: &Message, window_size: u16) -> Message {
        let mut ack = Message {
            msg_type: MsgType::Ack,
            code: MsgCode::Empty,
            msg_id: reply.msg_id,
            token: reply.token.clone(),
            options: Vec::new(),
            payload: Vec::new(),
            proxy_addr: reply.proxy_addr.clone(),
        };
        ack.insert_option(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE, window_size);
        ack
    }

    pub(crate) fn with_options(
        msg_type: MsgType,
        code: MsgCode,
        msg_id: MsgId,
        token: Vec<u8>,
        options: Vec<(OptionNumber, OptionValue)>,
        payload: Vec<u8>,
    ) -> Message {
        Message {
            msg_type,
            code,
            msg_id,
            token,
            options,
            payload,
            proxy_addr: None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:?} mid=0x{:04X}", self.msg_type, self.code, self.msg_id)?;
        if !self.token.is_empty() {
            f.write_str(" tok=")?;
            for b in &self.token {
                write!(f, "{:02X}", b)?;
            }
        }
        for (number, value) in &self.options {
            match value.as_uint() {
                Some(x) => write!(f, " {}:{}", number, x)?,
                None => write!(f, " {}", number)?,
            }
        }
        if !self.payload.is_empty() {
            write!(f, " {}B", self.payload.len())?;
        }
        Ok(())
    }
}
