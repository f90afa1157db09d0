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

//! Low-level message codec functions.

use super::*;
use crate::option::{OptionNumber, OptionValue};
use crate::Error;

/// The largest option value length the extended length encoding can express.
pub const MAX_OPTION_VALUE_SIZE: usize = 269 + 0xFFFF;

/// Appends one option to `buffer` using the delta+length encoding.
///
/// `prev_key` must not exceed `key`; options are written in ascending
/// option-number order.
fn encode_option(
    buffer: &mut Vec<u8>,
    prev_key: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(), Error> {
    if prev_key > key {
        return Err(Error::InvalidArgument);
    }

    if value.len() > MAX_OPTION_VALUE_SIZE {
        log::warn!("option value too long: {} bytes", value.len());
        return Err(Error::InvalidArgument);
    }

    let delta = (key - prev_key) as usize;
    let header_index = buffer.len();
    let mut header = 0u8;
    buffer.push(0);

    if delta >= 269 {
        header |= 14 << 4;
        buffer.push(((delta - 269) >> 8) as u8);
        buffer.push((delta - 269) as u8);
    } else if delta >= 13 {
        header |= 13 << 4;
        buffer.push((delta - 13) as u8);
    } else {
        header |= (delta as u8) << 4;
    }

    let len = value.len();
    if len >= 269 {
        header |= 14;
        buffer.push(((len - 269) >> 8) as u8);
        buffer.push((len - 269) as u8);
    } else if len >= 13 {
        header |= 13;
        buffer.push((len - 13) as u8);
    } else {
        header |= len as u8;
    }

    buffer[header_index] = header;
    buffer.extend_from_slice(value);

    Ok(())
}

/// Decodes one option from a `core::slice::Iter`, advancing the iterator
/// past it. The first byte must not be the end-of-options marker.
fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<(OptionNumber, &'a [u8]), Error> {
    macro_rules! try_next {
        ($iter:expr) => {
            match ($iter).next() {
                Some(x) => *x,
                None => return Err(Error::ParseFailure),
            }
        };
    }

    let header: u8 = try_next!(iter);

    let key_delta: u32 = match header >> 4 {
        13 => 13u32 + try_next!(iter) as u32,
        14 => {
            let msb = try_next!(iter) as u32;
            269u32 + (msb << 8) + try_next!(iter) as u32
        }
        15 => return Err(Error::ParseFailure),
        delta => delta as u32,
    };

    let len = match header & 0xF {
        13 => 13usize + try_next!(iter) as usize,
        14 => {
            let msb = try_next!(iter) as usize;
            269usize + (msb << 8) + try_next!(iter) as usize
        }
        15 => return Err(Error::ParseFailure),
        len => len as usize,
    };

    let key = last_option.0 as u32 + key_delta;
    if key > core::u16::MAX as u32 {
        // Don't let the key wrap.
        return Err(Error::ParseFailure);
    }
    let key = OptionNumber(key as u16);

    if len == 0 {
        return Ok((key, &[]));
    }

    if iter.as_slice().len() < len {
        return Err(Error::ParseFailure);
    }

    let value: &'a [u8] = &iter.as_slice()[..len];
    iter.nth(len - 1);

    Ok((key, value))
}

/// Serializes a [`Message`] into a stand-alone UDP CoAP datagram.
pub fn serialize(message: &Message) -> Result<Vec<u8>, Error> {
    if message.token.len() > 8 {
        return Err(Error::InvalidArgument);
    }

    let mut buffer =
        Vec::with_capacity(5 + message.token.len() + message.payload.len() + message.options().len() * 8);

    buffer.push(
        (COAP_VERSION << COAP_MSG_VER_OFFS)
            | ((message.msg_type as u8) << COAP_MSG_T_OFFS)
            | message.token.len() as u8,
    );
    buffer.push(message.code as u8);
    buffer.push((message.msg_id >> 8) as u8);
    buffer.push(message.msg_id as u8);
    buffer.extend_from_slice(&message.token);

    let mut last_option = OptionNumber(0);
    for (number, value) in message.options() {
        encode_option(&mut buffer, last_option, *number, &value.to_wire())?;
        last_option = *number;
    }

    if !message.payload.is_empty() {
        buffer.push(0xFF);
        buffer.extend_from_slice(&message.payload);
    }

    Ok(buffer)
}

/// Deserializes a stand-alone UDP CoAP datagram into a [`Message`].
pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
    if data.is_empty() {
        return Err(Error::NilMessage);
    }
    if data.len() < 4 {
        return Err(Error::ParseFailure);
    }
    if data[0] >> COAP_MSG_VER_OFFS != COAP_VERSION {
        return Err(Error::ParseFailure);
    }

    let msg_type = MsgType::try_from((data[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS)
        .ok_or(Error::ParseFailure)?;
    let code = MsgCode::try_from(data[1]).ok_or(Error::UnknownMessageCode)?;
    let msg_id = ((data[2] as u16) << 8) | data[3] as u16;

    let token_len = (data[0] & COAP_MSG_TKL_MASK) as usize;
    if token_len > 8 {
        return Err(Error::ParseFailure);
    }
    if data.len() < 4 + token_len {
        return Err(Error::ParseFailure);
    }
    let token = data[4..4 + token_len].to_vec();

    let mut iter = data[4 + token_len..].iter();
    let mut last_option = OptionNumber(0);
    let mut options = Vec::new();

    let payload = loop {
        match iter.as_slice().first() {
            None => break Vec::new(),
            Some(&0xFF) => {
                let payload = &iter.as_slice()[1..];
                if payload.is_empty() {
                    // A payload marker must be followed by payload bytes.
                    return Err(Error::ParseFailure);
                }
                break payload.to_vec();
            }
            Some(_) => {
                let (number, raw) = decode_option(&mut iter, last_option)?;
                options.push((number, OptionValue::parse(number, raw)?));
                last_option = number;
            }
        }
    };

    Ok(Message::with_options(
        msg_type, code, msg_id, token, options, payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockInfo;

    #[test]
    fn message_rfc7252_fig_16() {
        let mut message = Message::new(MsgType::Con, MsgCode::MethodGet);
        message.msg_id = 0x7d34;
        message.insert_option(OptionNumber::URI_PATH, "temperature");

        let datagram = serialize(&message).unwrap();
        let expected: &[u8] = &[
            0b01000000, 1, 0x7d, 0x34, 0xbb, b't', b'e', b'm', b'p', b'e', b'r', b'a', b't', b'u',
            b'r', b'e',
        ];
        assert_eq!(expected, &datagram[..]);

        let parsed = deserialize(&datagram).unwrap();
        assert_eq!(message, parsed);

        let mut reply = Message::new(MsgType::Ack, MsgCode::SuccessContent);
        reply.msg_id = 0x7d34;
        reply.payload = b"22.3 C".to_vec();
        let datagram = serialize(&reply).unwrap();
        let expected: &[u8] = &[
            0b01100000, 69, 0x7d, 0x34, 0xff, b'2', b'2', b'.', b'3', b' ', b'C',
        ];
        assert_eq!(expected, &datagram[..]);
    }

    #[test]
    fn message_rfc7252_fig_17() {
        let mut message = Message::new(MsgType::Con, MsgCode::MethodGet);
        message.msg_id = 0x7d34;
        message.token = vec![0x20];
        message.insert_option(OptionNumber::URI_PATH, "temperature");

        let datagram = serialize(&message).unwrap();
        let expected: &[u8] = &[
            0b01000001, 1, 0x7d, 0x34, 0x20, 0xbb, b't', b'e', b'm', b'p', b'e', b'r', b'a', b't',
            b'u', b'r', b'e',
        ];
        assert_eq!(expected, &datagram[..]);
        assert_eq!(message, deserialize(&datagram).unwrap());
    }

    #[test]
    fn header_bit_layout() {
        let mut message = Message::new(MsgType::Ack, MsgCode::SuccessContent);
        message.msg_id = 0xBEEF;
        message.token = vec![1, 2, 3, 4, 5];

        let datagram = serialize(&message).unwrap();
        assert_eq!(1, datagram[0] >> 6);
        assert_eq!(MsgType::Ack as u8, (datagram[0] >> 4) & 0b11);
        assert_eq!(5, datagram[0] & 0b1111);
        assert_eq!(0x45, datagram[1]);
        assert_eq!(0xBE, datagram[2]);
        assert_eq!(0xEF, datagram[3]);
        assert_eq!(&[1, 2, 3, 4, 5], &datagram[4..9]);
    }

    #[test]
    fn round_trip_every_token_length() {
        for len in 0..=8usize {
            let mut message = Message::new(MsgType::Con, MsgCode::MethodPost);
            message.token = (0..len as u8).collect();
            message.payload = b"payload".to_vec();
            let parsed = deserialize(&serialize(&message).unwrap()).unwrap();
            assert_eq!(message, parsed, "token length {}", len);
        }
    }

    #[test]
    fn round_trip_option_kinds() {
        let mut message = Message::new(MsgType::Con, MsgCode::MethodPut);
        message.token = vec![0xAA, 0xBB];
        message.insert_option(OptionNumber::IF_MATCH, &[0xDE, 0xAD][..]);
        message.insert_option(OptionNumber::URI_PATH, "blocks");
        message.insert_option(OptionNumber::CONTENT_FORMAT, 0u32);
        message.insert_option(OptionNumber::BLOCK1, BlockInfo::new(3, true, 6).unwrap());
        message.insert_option(OptionNumber::URI_SCHEME, 1u32);
        message.insert_option(OptionNumber::WINDOW_OFFSET, 2u16);
        message.insert_option(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE, 4u16);
        message.payload = vec![0u8; 300];

        let datagram = serialize(&message).unwrap();
        let parsed = deserialize(&datagram).unwrap();
        assert_eq!(message, parsed);
        assert_eq!(Some(0), parsed.content_format());
    }

    #[test]
    fn round_trip_extended_length_option() {
        let mut message = Message::new(MsgType::Con, MsgCode::MethodPost);
        // Lengths straddling both extended length encodings.
        for len in [12usize, 13, 268, 269, 400].iter() {
            message.set_option(OptionNumber::IF_MATCH, vec![0x5A; *len].as_slice());
            let parsed = deserialize(&serialize(&message).unwrap()).unwrap();
            assert_eq!(message, parsed, "value length {}", len);
        }
    }

    #[test]
    fn serialize_rejects_long_token() {
        let mut message = Message::new(MsgType::Con, MsgCode::MethodGet);
        message.token = vec![0; 9];
        assert_eq!(Err(Error::InvalidArgument), serialize(&message));
    }

    #[test]
    fn deserialize_rejects_garbage() {
        // Empty datagram decodes to no message at all.
        assert_eq!(Err(Error::NilMessage), deserialize(&[]));
        // Truncated header.
        assert_eq!(Err(Error::ParseFailure), deserialize(&[0x40, 1, 0]));
        // Reserved version.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0b10000000, 1, 0, 0])
        );
        // Token length beyond the header.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0b01000011, 1, 0, 0, 0xAA])
        );
        // Token length field above eight.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0b01001111, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15])
        );
        // Unknown message code.
        assert_eq!(Err(Error::UnknownMessageCode), deserialize(&[0x40, 0x21, 0, 0]));
        // Reserved option nibble.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0x40, 1, 0, 0, 0xF0])
        );
        // Option value runs past the datagram.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0x40, 1, 0, 0, 0xB3, b'a'])
        );
        // Payload marker with nothing after it.
        assert_eq!(
            Err(Error::ParseFailure),
            deserialize(&[0x40, 1, 0, 0, 0xFF])
        );
    }

    #[test]
    fn typed_option_mismatch_is_a_decode_error() {
        // Window-Offset is sixteen bits; a three-byte value must not parse.
        let datagram = &[
            0x40, 1, 0, 0, // header
            0xE3, ((3001 - 269) >> 8) as u8, ((3001 - 269) & 0xFF) as u8, 1, 2, 3,
        ];
        assert_eq!(Err(Error::ParseFailure), deserialize(datagram));
    }
}
