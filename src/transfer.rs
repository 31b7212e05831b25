//! Lockstep block transfer.
//!
//! A [`Sender`] reads the source in 512-byte blocks and waits for each ACK
//! before moving on; a [`Receiver`] writes DATA blocks in order and ACKs each
//! one. Neither touches the network: they consume [`Event`]s and return
//! [`Action`]s, and [`drive`] pumps them over a [`Transport`].
//!
//! A transfer ends when a block shorter than 512 bytes has been acknowledged,
//! so a source whose length is an exact multiple of 512 ends with an empty
//! block.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::packet::TftpPacket;
use crate::transport::Transport;
use crate::{BLOCK_SIZE, DEF_TIMEOUT_MS, MAX_ATTEMPTS};

/// Per-exchange timing and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long each wait for the next datagram lasts.
    pub timeout: Duration,
    /// Attempt bound for the roles that give up.
    pub max_attempts: u8,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

/// What to do when a wait times out.
///
/// Server roles retry forever, client roles give up after a fixed number of
/// failed waits on the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Unbounded,
    Bounded(u8),
}

impl RetryPolicy {
    fn exhausted(self, timeouts: u8) -> bool {
        match self {
            RetryPolicy::Unbounded => false,
            RetryPolicy::Bounded(max) => timeouts >= max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Packet(TftpPacket),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit this packet, then keep waiting.
    Send(TftpPacket),
    /// Nothing to transmit; keep waiting.
    Wait,
    /// The exchange is complete once the packet, if any, is transmitted.
    Finish(Option<TftpPacket>),
}

/// One side of a transfer, as a transition function over events.
pub trait Machine {
    fn on_event(&mut self, event: Event) -> Result<Action, TransferError>;

    /// Blocks and payload bytes accepted so far.
    fn totals(&self) -> (u64, u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub blocks: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferSummary {
    /// Throughput in MB/s.
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1024.0 / 1024.0
    }
}

/// Sending side: DATA out, ACK in.
pub struct Sender<R> {
    source: R,
    block: u16,
    in_flight: TftpPacket,
    in_flight_len: usize,
    timeouts: u8,
    policy: RetryPolicy,
    blocks: u64,
    bytes: u64,
}

impl<R: Read> Sender<R> {
    /// Reads block #1 from `source`; send [`Sender::current`] to begin.
    pub fn new(mut source: R, policy: RetryPolicy) -> Result<Self, TransferError> {
        let data = read_chunk(&mut source)?;
        let in_flight_len = data.len();
        Ok(Self {
            source,
            block: 1,
            in_flight: TftpPacket::DATA { block: 1, data },
            in_flight_len,
            timeouts: 0,
            policy,
            blocks: 0,
            bytes: 0,
        })
    }

    /// The DATA packet awaiting acknowledgment.
    pub fn current(&self) -> &TftpPacket {
        &self.in_flight
    }

    pub fn block(&self) -> u16 {
        self.block
    }
}

impl<R: Read> Machine for Sender<R> {
    fn on_event(&mut self, event: Event) -> Result<Action, TransferError> {
        match event {
            Event::Timeout => {
                self.timeouts = self.timeouts.saturating_add(1);
                if self.policy.exhausted(self.timeouts) {
                    return Err(TransferError::RetriesExhausted {
                        block: self.block,
                        attempts: self.timeouts,
                    });
                }
                warn!(block = self.block, "timeout, retransmitting");
                Ok(Action::Send(self.in_flight.clone()))
            }
            Event::Packet(TftpPacket::ACK(ack)) if ack == self.block => {
                debug!(block = ack, "ack");
                self.blocks += 1;
                self.bytes += self.in_flight_len as u64;
                if self.in_flight_len < BLOCK_SIZE {
                    return Ok(Action::Finish(None));
                }

                let data = read_chunk(&mut self.source)?;
                self.block = self.block.wrapping_add(1);
                self.in_flight_len = data.len();
                self.in_flight = TftpPacket::DATA {
                    block: self.block,
                    data,
                };
                self.timeouts = 0;
                Ok(Action::Send(self.in_flight.clone()))
            }
            Event::Packet(TftpPacket::ACK(ack)) => {
                debug!(expected = self.block, got = ack, "ignoring stale ack");
                Ok(Action::Wait)
            }
            Event::Packet(TftpPacket::ERROR { code, msg }) => Err(TransferError::Remote {
                code,
                message: msg,
            }),
            Event::Packet(other) => {
                warn!(packet = %other, "unexpected packet while awaiting ack");
                Ok(Action::Wait)
            }
        }
    }

    fn totals(&self) -> (u64, u64) {
        (self.blocks, self.bytes)
    }
}

/// Receiving side: DATA in, ACK out.
pub struct Receiver<W> {
    sink: W,
    last_block: u16,
    last_ack: Option<TftpPacket>,
    timeouts: u8,
    policy: RetryPolicy,
    blocks: u64,
    bytes: u64,
}

impl<W: Write> Receiver<W> {
    pub fn new(sink: W, policy: RetryPolicy) -> Self {
        Self {
            sink,
            last_block: 0,
            last_ack: None,
            timeouts: 0,
            policy,
            blocks: 0,
            bytes: 0,
        }
    }

    /// ACK #0, accepting a write request. It is resent on timeout until
    /// block #1 arrives.
    pub fn handshake(&mut self) -> TftpPacket {
        let ack = TftpPacket::ACK(0);
        self.last_ack = Some(ack.clone());
        ack
    }

    pub fn last_block(&self) -> u16 {
        self.last_block
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> Machine for Receiver<W> {
    fn on_event(&mut self, event: Event) -> Result<Action, TransferError> {
        match event {
            Event::Timeout => {
                self.timeouts = self.timeouts.saturating_add(1);
                if self.policy.exhausted(self.timeouts) {
                    return Err(TransferError::RetriesExhausted {
                        block: self.last_block.wrapping_add(1),
                        attempts: self.timeouts,
                    });
                }
                match &self.last_ack {
                    Some(ack) => {
                        warn!(block = self.last_block, "timeout, retransmitting ack");
                        Ok(Action::Send(ack.clone()))
                    }
                    None => Ok(Action::Wait),
                }
            }
            Event::Packet(TftpPacket::DATA { block, data })
                if block == self.last_block.wrapping_add(1) =>
            {
                self.sink.write_all(&data)?;
                self.last_block = block;
                self.timeouts = 0;
                self.blocks += 1;
                self.bytes += data.len() as u64;
                debug!(block, size = data.len(), "data");

                let ack = TftpPacket::ACK(block);
                self.last_ack = Some(ack.clone());
                if data.len() < BLOCK_SIZE {
                    self.sink.flush()?;
                    Ok(Action::Finish(Some(ack)))
                } else {
                    Ok(Action::Send(ack))
                }
            }
            Event::Packet(TftpPacket::DATA { block, .. }) => {
                debug!(
                    expected = self.last_block.wrapping_add(1),
                    got = block,
                    "ignoring out-of-order or duplicate block"
                );
                Ok(Action::Wait)
            }
            Event::Packet(TftpPacket::ERROR { code, msg }) => Err(TransferError::Remote {
                code,
                message: msg,
            }),
            Event::Packet(other) => {
                warn!(packet = %other, "unexpected packet while awaiting data");
                Ok(Action::Wait)
            }
        }
    }

    fn totals(&self) -> (u64, u64) {
        (self.blocks, self.bytes)
    }
}

/// Runs `machine` to completion over `transport`.
///
/// The caller sends whatever opens the exchange (the first DATA block or the
/// handshake ACK) before calling this.
pub async fn drive<T, M>(
    transport: &mut T,
    machine: &mut M,
    timeout: Duration,
) -> Result<TransferSummary, TransferError>
where
    T: Transport,
    M: Machine,
{
    drive_from(transport, machine, None, timeout).await
}

/// Like [`drive`], but handles `first` before waiting on the transport.
pub async fn drive_from<T, M>(
    transport: &mut T,
    machine: &mut M,
    mut first: Option<Event>,
    timeout: Duration,
) -> Result<TransferSummary, TransferError>
where
    T: Transport,
    M: Machine,
{
    let start = Instant::now();
    loop {
        let event = match first.take() {
            Some(event) => event,
            None => transport
                .recv(timeout)
                .await
                .map_err(TransferError::Transport)?,
        };
        match machine.on_event(event)? {
            Action::Send(pkt) => transport
                .send(&pkt)
                .await
                .map_err(TransferError::Transport)?,
            Action::Wait => {}
            Action::Finish(pkt) => {
                if let Some(pkt) = pkt {
                    transport
                        .send(&pkt)
                        .await
                        .map_err(TransferError::Transport)?;
                }
                let (blocks, bytes) = machine.totals();
                return Ok(TransferSummary {
                    blocks,
                    bytes,
                    elapsed: start.elapsed(),
                });
            }
        }
    }
}

/// Remove the partial output of a failed receive.
pub(crate) fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(file = %path.display(), "partial file removed"),
        Err(e) => warn!(file = %path.display(), "failed to remove partial file: {e}"),
    }
}

// Fill one block, short only at end of input.
fn read_chunk<R: Read>(source: &mut R) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(BLOCK_SIZE);
    source.by_ref().take(BLOCK_SIZE as u64).read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ack(block: u16) -> Event {
        Event::Packet(TftpPacket::ACK(block))
    }

    fn data(block: u16, payload: &[u8]) -> Event {
        Event::Packet(TftpPacket::DATA {
            block,
            data: payload.to_vec(),
        })
    }

    // Ack every block in order and collect what went on the wire.
    fn send_all(len: usize) -> Vec<TftpPacket> {
        let source: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut sender = Sender::new(Cursor::new(source), RetryPolicy::Unbounded).unwrap();
        let mut sent = vec![sender.current().clone()];
        loop {
            match sender.on_event(ack(sender.block())).unwrap() {
                Action::Send(pkt) => sent.push(pkt),
                Action::Finish(None) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        sent
    }

    #[test]
    fn block_count_follows_short_block_rule() {
        for (len, blocks) in [(0, 1), (1, 1), (511, 1), (512, 2), (513, 2), (1024, 3), (1500, 3)] {
            let sent = send_all(len);
            assert_eq!(sent.len(), blocks, "file of {len} bytes");

            let last = sent.last().unwrap();
            let TftpPacket::DATA { data, .. } = last else {
                panic!("not data: {last}");
            };
            assert_eq!(data.len(), len % BLOCK_SIZE);
        }
    }

    #[test]
    fn sender_blocks_count_up_from_one() {
        let sent = send_all(3 * BLOCK_SIZE + 10);
        let blocks: Vec<u16> = sent
            .iter()
            .map(|pkt| match pkt {
                TftpPacket::DATA { block, .. } => *block,
                other => panic!("not data: {other}"),
            })
            .collect();
        assert_eq!(blocks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn sender_ignores_stale_and_foreign_packets() {
        let source = vec![7u8; BLOCK_SIZE + 1];
        let mut sender = Sender::new(Cursor::new(source), RetryPolicy::Bounded(3)).unwrap();
        assert!(matches!(sender.on_event(ack(1)).unwrap(), Action::Send(_)));
        assert_eq!(sender.block(), 2);

        assert_eq!(sender.on_event(ack(1)).unwrap(), Action::Wait);
        assert_eq!(sender.on_event(ack(9)).unwrap(), Action::Wait);
        assert_eq!(sender.on_event(data(2, b"x")).unwrap(), Action::Wait);
        assert_eq!(sender.block(), 2);

        assert_eq!(sender.on_event(ack(2)).unwrap(), Action::Finish(None));
        assert_eq!(sender.totals(), (2, BLOCK_SIZE as u64 + 1));
    }

    #[test]
    fn bounded_sender_gives_up_after_three_waits() {
        let mut sender = Sender::new(Cursor::new(b"hello".to_vec()), RetryPolicy::Bounded(3)).unwrap();
        let first = sender.current().clone();
        assert_eq!(sender.on_event(Event::Timeout).unwrap(), Action::Send(first.clone()));
        assert_eq!(sender.on_event(Event::Timeout).unwrap(), Action::Send(first));
        match sender.on_event(Event::Timeout) {
            Err(TransferError::RetriesExhausted { block: 1, attempts: 3 }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stale_ack_does_not_reset_retry_budget() {
        let mut sender = Sender::new(Cursor::new(b"hello".to_vec()), RetryPolicy::Bounded(3)).unwrap();
        sender.on_event(Event::Timeout).unwrap();
        sender.on_event(ack(0)).unwrap();
        sender.on_event(Event::Timeout).unwrap();
        assert!(sender.on_event(Event::Timeout).is_err());
    }

    #[test]
    fn unbounded_sender_retransmits_forever() {
        let mut sender = Sender::new(Cursor::new(b"hello".to_vec()), RetryPolicy::Unbounded).unwrap();
        let first = sender.current().clone();
        for _ in 0..1000 {
            assert_eq!(sender.on_event(Event::Timeout).unwrap(), Action::Send(first.clone()));
        }
        assert_eq!(sender.on_event(ack(1)).unwrap(), Action::Finish(None));
    }

    #[test]
    fn error_packet_aborts_sender() {
        let mut sender = Sender::new(Cursor::new(vec![0u8; 600]), RetryPolicy::Unbounded).unwrap();
        let err = sender
            .on_event(Event::Packet(TftpPacket::file_not_found()))
            .unwrap_err();
        match err {
            TransferError::Remote { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "File not found ");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn receiver_writes_blocks_in_order() {
        let mut receiver = Receiver::new(Vec::new(), RetryPolicy::Unbounded);
        assert_eq!(receiver.handshake(), TftpPacket::ACK(0));

        let full = vec![b'a'; BLOCK_SIZE];
        assert_eq!(
            receiver.on_event(data(1, &full)).unwrap(),
            Action::Send(TftpPacket::ACK(1))
        );
        assert_eq!(
            receiver.on_event(data(2, b"AB")).unwrap(),
            Action::Finish(Some(TftpPacket::ACK(2)))
        );

        let mut expected = full.clone();
        expected.extend_from_slice(b"AB");
        assert_eq!(receiver.totals(), (2, expected.len() as u64));
        assert_eq!(receiver.into_inner(), expected);
    }

    #[test]
    fn receiver_drops_duplicate_and_reordered_blocks() {
        let mut receiver = Receiver::new(Vec::new(), RetryPolicy::Unbounded);
        receiver.handshake();

        let full = vec![b'z'; BLOCK_SIZE];
        receiver.on_event(data(1, &full)).unwrap();
        assert_eq!(receiver.on_event(data(1, &full)).unwrap(), Action::Wait);
        assert_eq!(receiver.on_event(data(3, b"late")).unwrap(), Action::Wait);
        assert_eq!(receiver.on_event(ack(1)).unwrap(), Action::Wait);
        assert_eq!(receiver.last_block(), 1);
        assert_eq!(receiver.into_inner(), full);
    }

    #[test]
    fn receiver_resends_last_ack_on_timeout() {
        let mut receiver = Receiver::new(Vec::new(), RetryPolicy::Unbounded);
        receiver.handshake();
        assert_eq!(
            receiver.on_event(Event::Timeout).unwrap(),
            Action::Send(TftpPacket::ACK(0))
        );

        receiver.on_event(data(1, &[1u8; BLOCK_SIZE])).unwrap();
        assert_eq!(
            receiver.on_event(Event::Timeout).unwrap(),
            Action::Send(TftpPacket::ACK(1))
        );
    }

    #[test]
    fn receiver_without_ack_just_waits() {
        let mut receiver = Receiver::new(Vec::new(), RetryPolicy::Bounded(2));
        assert_eq!(receiver.on_event(Event::Timeout).unwrap(), Action::Wait);
        assert!(matches!(
            receiver.on_event(Event::Timeout),
            Err(TransferError::RetriesExhausted { block: 1, attempts: 2 })
        ));
    }

    #[test]
    fn error_packet_aborts_receiver() {
        let mut receiver = Receiver::new(Vec::new(), RetryPolicy::Unbounded);
        let err = receiver
            .on_event(Event::Packet(TftpPacket::ERROR {
                code: 3,
                msg: "disk full".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote { code: 3, .. }));
    }
}
