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

//! Selective-repeat block-wise transfers.
//!
//! Payloads above the block size are split into numbered blocks and sent
//! inside a sliding window. The receiver acknowledges every block it sees;
//! when it notices a hole it attaches a `Window-Offset` option naming the
//! lowest missing block, and only that part of the window is replayed.
//! Reassembly buffers blocks by number and delivers the joined payload once
//! every block up to the final one has arrived.

use super::*;
use crate::block::BlockInfo;
use crate::message::MsgCode;
use crate::option::OptionNumber;

/// A retransmission slot: one block of an in-flight transfer.
#[derive(Debug, Clone)]
pub(crate) struct Packet {
    message: Message,
    acked: bool,
    attempts: u32,
    last_send: Option<Instant>,
}

impl Packet {
    fn is_due(&self, now: Instant, time_wait: Duration) -> bool {
        match self.last_send {
            Some(sent) => now.duration_since(sent) >= time_wait,
            None => true,
        }
    }
}

/// Reassembly state: received blocks by number, and the total block count
/// once a block without the more flag has committed it.
struct Reassembly {
    buf: HashMap<u32, Vec<u8>>,
    total_blocks: Option<u32>,
}

impl Reassembly {
    fn new() -> Reassembly {
        Reassembly {
            buf: HashMap::new(),
            total_blocks: None,
        }
    }

    /// Stores one block. Returns the joined payload when the transfer
    /// became complete, `None` otherwise.
    fn feed(&mut self, block: BlockInfo, payload: &[u8]) -> Option<Vec<u8>> {
        if let Some(total) = self.total_blocks {
            if block.more_flag() && block.num() >= total {
                // A block past the committed end; the trailer already fixed
                // the transfer's length.
                return None;
            }
        }

        if !block.more_flag() {
            self.total_blocks = Some(block.num() + 1);
        }
        self.buf.insert(block.num(), payload.to_vec());

        let total = self.total_blocks?;
        if self.buf.len() as u32 != total {
            return None;
        }

        let mut joined = Vec::new();
        for i in 0..total {
            joined.extend_from_slice(self.buf.get(&i)?);
        }
        Some(joined)
    }

    /// The acknowledgement for `inbound`, a NACK when the peer advertised a
    /// window and a block below `block_number` is still missing.
    fn continue_ack(&self, inbound: &Message, block_number: u32) -> Message {
        match inbound.selective_repeat_window_size() {
            Some(window) => Message::ack_to_with_window_offset(
                inbound,
                MsgCode::SuccessContinue,
                window,
                block_number,
                &self.buf,
            ),
            None => Message::ack_to(inbound, MsgCode::SuccessContinue),
        }
    }
}

impl<US, SL> Transport<US, SL>
where
    US: AsyncDatagramSocket,
    SL: SecurityLayer<US::SocketAddr>,
{
    /// Splits `message` into block packets carrying the given block option.
    ///
    /// Every block keeps the original token and options, carries the
    /// advertised window size, and gets its own message id.
    fn build_packets(
        &self,
        message: &Message,
        kind: OptionNumber,
        window: usize,
    ) -> Result<Vec<Packet>, Error> {
        let szx = self.params.block_szx();
        let chunks: Vec<&[u8]> = message.payload.chunks(self.params.max_payload_size).collect();
        let mut packets = Vec::with_capacity(chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            let more = i + 1 < chunks.len();
            let block = BlockInfo::new(i as u32, more, szx).ok_or(Error::InvalidArgument)?;

            let mut block_message = Message::new(MsgType::Con, message.code);
            block_message.token = message.token.clone();
            block_message.proxy_addr = message.proxy_addr.clone();
            for (number, value) in message.options() {
                if *number == kind || *number == OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE {
                    continue;
                }
                block_message.insert_option(*number, value.clone());
            }
            block_message.insert_option(kind, block);
            block_message
                .insert_option(OptionNumber::SELECTIVE_REPEAT_WINDOW_SIZE, window as u16);
            block_message.payload = chunk.to_vec();

            packets.push(Packet {
                message: block_message,
                acked: false,
                attempts: 0,
                last_send: None,
            });
        }

        Ok(packets)
    }

    /// Transmits every due, unacknowledged block inside the window
    /// `shift..shift+window`, bounding each block's attempts.
    async fn send_packets(
        &self,
        packets: &mut [Packet],
        window: usize,
        shift: usize,
        dest: US::SocketAddr,
    ) -> Result<(), Error> {
        if shift == packets.len() {
            // The window base has passed the last block.
            return Ok(());
        }

        let stop = (shift + window).min(packets.len());
        let now = Instant::now();

        for packet in packets[shift..stop].iter_mut() {
            if packet.acked || !packet.is_due(now, self.params.time_wait) {
                continue;
            }
            if packet.attempts == self.params.max_send_attempts {
                self.metrics.incr_expired();
                return Err(Error::MaxAttempts);
            }
            if packet.attempts > 0 {
                self.metrics.incr_retransmits();
            }
            packet.attempts += 1;
            packet.last_send = Some(now);
            self.transmit_to(&packet.message, dest).await?;
        }

        if stop == packets.len() {
            // Liveness check on the trailing edge of the window.
            if let Some(sent) = packets[stop - 1].last_send {
                if !packets[stop - 1].acked
                    && now.duration_since(sent) >= self.params.sum_time_attempts()
                {
                    self.metrics.incr_expired();
                    return Err(Error::MaxAttempts);
                }
            }
        }

        Ok(())
    }

    /// Replays the blocks a `Window-Offset` NACK reported missing:
    /// `offset..min(shift+window, block_number)`, immediately and without
    /// waiting for their retransmission timer.
    async fn send_packets_by_window_offset(
        &self,
        packets: &mut [Packet],
        window: usize,
        shift: usize,
        block_number: usize,
        offset: usize,
        dest: US::SocketAddr,
    ) -> Result<(), Error> {
        if shift == packets.len() {
            return Ok(());
        }

        let stop = (shift + window).min(block_number).min(packets.len());
        let start = offset.min(stop);
        let now = Instant::now();

        for packet in packets[start..stop].iter_mut() {
            if packet.acked {
                continue;
            }
            if packet.attempts == self.params.max_send_attempts {
                self.metrics.incr_expired();
                return Err(Error::MaxAttempts);
            }
            if packet.attempts > 0 {
                self.metrics.incr_retransmits();
            }
            packet.attempts += 1;
            packet.last_send = Some(now);
            self.transmit_to(&packet.message, dest).await?;
        }

        Ok(())
    }

    /// Client side of a block-wise request: streams the request blocks and
    /// resolves with the terminal response.
    pub(crate) async fn send_arq_block1_con(
        &self,
        message: &Message,
        peer: US::SocketAddr,
    ) -> Result<Message, Error> {
        if message.token.len() > 8 {
            return Err(Error::InvalidArgument);
        }

        let num_blocks =
            (message.payload.len() + self.params.max_payload_size - 1) / self.params.max_payload_size;
        let window = num_blocks.min(self.params.window_size);
        let mut packets = self.build_packets(message, OptionNumber::BLOCK1, window)?;

        let key = (peer, MsgToken::new(&message.token));
        let (_guard, mut rx) = register_channel(&self.exchanges, key);

        let mut shift = 0usize;
        self.send_packets(&mut packets, window, shift, peer).await?;

        loop {
            let inbound = match next_or_timeout(&mut rx, self.params.sum_time_attempts()).await {
                Err(Error::MaxAttempts) => {
                    self.send_packets(&mut packets, window, shift, peer).await?;
                    continue;
                }
                Err(e) => return Err(e),
                Ok(inbound) => inbound,
            };

            if !inbound.message.msg_type.is_ack() {
                continue;
            }

            if inbound.message.code.is_empty() {
                return self.receive_arq_block2(&mut rx, message, None, peer).await;
            }

            if inbound.message.block2().is_some() {
                return self
                    .receive_arq_block2(&mut rx, message, Some(inbound), peer)
                    .await;
            }

            let block = match inbound.message.block1() {
                Some(block) => block,
                None => continue,
            };
            let n = block.num() as usize;

            if let Some(offset) = inbound.message.window_offset() {
                self.send_packets_by_window_offset(
                    &mut packets,
                    window,
                    shift,
                    n,
                    offset as usize,
                    peer,
                )
                .await?;
            }

            if n < packets.len() {
                if inbound.message.code != MsgCode::SuccessContinue {
                    return Ok(inbound.message);
                }
                packets[n].acked = true;
                if n == shift {
                    while shift < packets.len() && packets[shift].acked {
                        shift += 1;
                    }
                    self.send_packets(&mut packets, window, shift, peer).await?;
                }
            }
        }
    }

    /// Server side of a block-wise response: announces the window with an
    /// empty `ACK`, then streams the response blocks until the peer's final
    /// acknowledgement.
    pub(crate) async fn send_arq_block2_ack(
        &self,
        rx: &mut mpsc::Receiver<InboundMessage<US::SocketAddr>>,
        message: &Message,
        dest: US::SocketAddr,
    ) -> Result<(), Error> {
        let num_blocks =
            (message.payload.len() + self.params.max_payload_size - 1) / self.params.max_payload_size;
        let window = num_blocks.min(self.params.window_size);

        let announce = Message::empty_ack_with_window_size(message, window as u16);
        self.transmit_to(&announce, dest).await?;

        let mut packets = self.build_packets(message, OptionNumber::BLOCK2, window)?;
        let mut shift = 0usize;
        self.send_packets(&mut packets, window, shift, dest).await?;

        loop {
            let inbound = match next_or_timeout(rx, self.params.sum_time_attempts()).await {
                Err(Error::MaxAttempts) => {
                    self.send_packets(&mut packets, window, shift, dest).await?;
                    continue;
                }
                Err(e) => return Err(e),
                Ok(inbound) => inbound,
            };

            if !inbound.message.msg_type.is_ack() {
                continue;
            }
            let block = match inbound.message.block2() {
                Some(block) => block,
                None => continue,
            };
            let n = block.num() as usize;

            if n < packets.len() {
                if inbound.message.code != MsgCode::SuccessContinue {
                    return Ok(());
                }

                if let Some(offset) = inbound.message.window_offset() {
                    self.send_packets_by_window_offset(
                        &mut packets,
                        window,
                        shift,
                        n,
                        offset as usize,
                        dest,
                    )
                    .await?;
                }

                packets[n].acked = true;
                if n == shift {
                    while shift < packets.len() && packets[shift].acked {
                        shift += 1;
                    }
                    self.send_packets(&mut packets, window, shift, dest).await?;
                }
            }
        }
    }

    /// Reassembles an inbound block-wise request, acknowledging each block.
    ///
    /// The terminal acknowledgement is not sent here: the caller's reply to
    /// the assembled message doubles as the acknowledgement of its final
    /// block.
    pub(crate) async fn receive_arq_block1(
        &self,
        rx: &mut mpsc::Receiver<InboundMessage<US::SocketAddr>>,
    ) -> Result<InboundMessage<US::SocketAddr>, Error> {
        let mut reassembly = Reassembly::new();

        loop {
            let mut inbound = match next_or_timeout(rx, self.params.sum_time_attempts()).await {
                Err(Error::MaxAttempts) => {
                    self.metrics.incr_expired();
                    return Err(Error::MaxAttempts);
                }
                Err(e) => return Err(e),
                Ok(inbound) => inbound,
            };

            let block = match inbound.message.block1() {
                Some(block) => block,
                None => continue,
            };
            if !inbound.message.msg_type.is_con() {
                continue;
            }

            if let Some(joined) = reassembly.feed(block, &inbound.message.payload) {
                inbound.message.payload = joined;
                return Ok(inbound);
            }

            let ack = reassembly.continue_ack(&inbound.message, block.num());
            self.transmit_to(&ack, inbound.sender).await?;
        }
    }

    /// Reassembles an inbound block-wise response, optionally seeded with a
    /// first block that arrived on the originating exchange.
    pub(crate) async fn receive_arq_block2(
        &self,
        rx: &mut mpsc::Receiver<InboundMessage<US::SocketAddr>>,
        orig: &Message,
        first: Option<InboundMessage<US::SocketAddr>>,
        peer: US::SocketAddr,
    ) -> Result<Message, Error> {
        let mut reassembly = Reassembly::new();

        if let Some(inbound) = first {
            if let Some(message) = self
                .process_block2(&mut reassembly, inbound, orig, peer)
                .await?
            {
                return Ok(message);
            }
        }

        loop {
            let inbound = match next_or_timeout(rx, self.params.sum_time_attempts()).await {
                Err(Error::MaxAttempts) => {
                    self.metrics.incr_expired();
                    return Err(Error::MaxAttempts);
                }
                Err(e) => return Err(e),
                Ok(inbound) => inbound,
            };

            if let Some(message) = self
                .process_block2(&mut reassembly, inbound, orig, peer)
                .await?
            {
                return Ok(message);
            }
        }
    }

    async fn process_block2(
        &self,
        reassembly: &mut Reassembly,
        mut inbound: InboundMessage<US::SocketAddr>,
        orig: &Message,
        peer: US::SocketAddr,
    ) -> Result<Option<Message>, Error> {
        let block = match inbound.message.block2() {
            Some(block) => block,
            None => return Ok(None),
        };
        if !inbound.message.msg_type.is_con() {
            return Ok(None);
        }

        if let Some(joined) = reassembly.feed(block, &inbound.message.payload) {
            inbound.message.payload = joined;
            let mut ack = Message::ack_to(&inbound.message, MsgCode::Empty);
            ack.proxy_addr = orig.proxy_addr.clone();
            self.transmit_to(&ack, peer).await?;
            return Ok(Some(inbound.message));
        }

        let mut ack = reassembly.continue_ack(&inbound.message, block.num());
        ack.proxy_addr = orig.proxy_addr.clone();
        self.transmit_to(&ack, peer).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{NullSocket, NullSocketAddr};
    use futures::executor::block_on;

    fn test_params() -> TransParams {
        TransParams {
            max_payload_size: 1024,
            window_size: 4,
            time_wait: Duration::from_millis(50),
            max_send_attempts: 3,
            ..TransParams::default()
        }
    }

    fn test_transport() -> Transport<NullSocket> {
        Transport::new(NullSocket::new(), test_params())
    }

    fn big_request(len: usize) -> Message {
        let mut message = Message::request(MsgCode::MethodPut);
        message.insert_option(OptionNumber::URI_PATH, "upload");
        message.payload = (0..len).map(|i| i as u8).collect();
        message
    }

    #[test]
    fn packets_cover_the_payload() {
        let transport = test_transport();
        let message = big_request(5000);
        let packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 4)
            .unwrap();

        assert_eq!(5, packets.len());
        for (i, packet) in packets.iter().enumerate() {
            let block = packet.message.block1().unwrap();
            assert_eq!(i as u32, block.num());
            assert_eq!(i < 4, block.more_flag());
            assert_eq!(6, block.szx());
            assert_eq!(Some(4), packet.message.selective_repeat_window_size());
            assert_eq!(message.token, packet.message.token);
            assert_eq!(MsgType::Con, packet.message.msg_type);
            assert!(packet.message.option(OptionNumber::URI_PATH).is_some());
        }
        assert_eq!(1024, packets[0].message.payload.len());
        assert_eq!(5000 - 4 * 1024, packets[4].message.payload.len());

        let mut joined = Vec::new();
        for packet in &packets {
            joined.extend_from_slice(&packet.message.payload);
        }
        assert_eq!(message.payload, joined);
    }

    #[test]
    fn initial_burst_fills_the_window() {
        let transport = test_transport();
        let message = big_request(8 * 1024);
        let mut packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 4)
            .unwrap();

        block_on(transport.send_packets(&mut packets, 4, 0, NullSocketAddr)).unwrap();

        let attempts: Vec<u32> = packets.iter().map(|p| p.attempts).collect();
        assert_eq!(vec![1, 1, 1, 1, 0, 0, 0, 0], attempts);
    }

    #[test]
    fn window_advancement_transmits_fresh_blocks() {
        let transport = test_transport();
        let message = big_request(8 * 1024);
        let mut packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 4)
            .unwrap();

        block_on(transport.send_packets(&mut packets, 4, 0, NullSocketAddr)).unwrap();
        for packet in packets[..4].iter_mut() {
            packet.acked = true;
        }

        block_on(transport.send_packets(&mut packets, 4, 4, NullSocketAddr)).unwrap();
        let attempts: Vec<u32> = packets.iter().map(|p| p.attempts).collect();
        assert_eq!(vec![1, 1, 1, 1, 1, 1, 1, 1], attempts);
    }

    #[test]
    fn window_offset_replays_only_the_hole() {
        let transport = test_transport();
        let message = big_request(6 * 1024);
        let mut packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 4)
            .unwrap();

        block_on(transport.send_packets(&mut packets, 4, 0, NullSocketAddr)).unwrap();
        block_on(transport.send_packets(&mut packets, 4, 2, NullSocketAddr)).unwrap();
        for n in [0usize, 1, 3, 4].iter() {
            packets[*n].acked = true;
        }

        // NACK: lowest missing block is 2, reported while acking block 5.
        block_on(transport.send_packets_by_window_offset(
            &mut packets,
            4,
            2,
            5,
            2,
            NullSocketAddr,
        ))
        .unwrap();

        assert_eq!(2, packets[2].attempts);
        assert_eq!(1, packets[0].attempts);
        assert_eq!(1, packets[3].attempts);
        assert_eq!(1, transport.metrics().retransmit_messages());
    }

    #[test]
    fn exhausted_block_fails_the_transfer() {
        let transport = test_transport();
        let message = big_request(2 * 1024);
        let mut packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 2)
            .unwrap();

        for _ in 0..3 {
            block_on(transport.send_packets(&mut packets, 2, 0, NullSocketAddr)).unwrap();
            for packet in packets.iter_mut() {
                packet.last_send = Some(Instant::now() - Duration::from_secs(1));
            }
        }

        assert_eq!(
            Err(Error::MaxAttempts),
            block_on(transport.send_packets(&mut packets, 2, 0, NullSocketAddr))
        );
        assert_eq!(1, transport.metrics().expired_messages());
    }

    #[test]
    fn completed_window_sends_nothing() {
        let transport = test_transport();
        let message = big_request(2 * 1024);
        let mut packets = transport
            .build_packets(&message, OptionNumber::BLOCK1, 2)
            .unwrap();

        block_on(transport.send_packets(&mut packets, 2, 0, NullSocketAddr)).unwrap();
        for packet in packets.iter_mut() {
            packet.acked = true;
        }

        // Window base past the last block: clean no-op.
        assert_eq!(
            Ok(()),
            block_on(transport.send_packets(&mut packets, 2, 2, NullSocketAddr))
        );
        let attempts: Vec<u32> = packets.iter().map(|p| p.attempts).collect();
        assert_eq!(vec![1, 1], attempts);
    }

    #[test]
    fn reassembly_accepts_any_permutation() {
        for order in [
            vec![0usize, 1, 2, 3, 4],
            vec![4, 3, 2, 1, 0],
            vec![2, 0, 4, 1, 3],
        ]
        .iter()
        {
            let payload: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
            let chunks: Vec<&[u8]> = payload.chunks(1024).collect();

            let mut reassembly = Reassembly::new();
            let mut joined = None;
            for i in order {
                let block = BlockInfo::new(*i as u32, *i < 4, 6).unwrap();
                if let Some(out) = reassembly.feed(block, chunks[*i]) {
                    joined = Some(out);
                }
            }
            assert_eq!(Some(payload), joined, "order {:?}", order);
        }
    }

    #[test]
    fn reassembly_duplicate_blocks_are_idempotent() {
        let mut reassembly = Reassembly::new();
        let block0 = BlockInfo::new(0, true, 6).unwrap();
        assert!(reassembly.feed(block0, &[1; 16]).is_none());
        assert!(reassembly.feed(block0, &[1; 16]).is_none());

        let block1 = BlockInfo::new(1, false, 6).unwrap();
        let joined = reassembly.feed(block1, &[2; 16]).unwrap();
        assert_eq!(32, joined.len());
    }

    #[test]
    fn reassembly_discards_blocks_past_the_committed_end() {
        let mut reassembly = Reassembly::new();
        let trailer = BlockInfo::new(1, false, 6).unwrap();
        assert!(reassembly.feed(trailer, &[2; 16]).is_none());

        let stray = BlockInfo::new(5, true, 6).unwrap();
        assert!(reassembly.feed(stray, &[9; 16]).is_none());

        let block0 = BlockInfo::new(0, true, 6).unwrap();
        let joined = reassembly.feed(block0, &[1; 16]).unwrap();
        assert_eq!(vec![1u8; 16].into_iter().chain(vec![2u8; 16]).collect::<Vec<u8>>(), joined);
    }
}
