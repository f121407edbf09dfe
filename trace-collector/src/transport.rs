use std::{collections::BTreeMap, io, mem, task::Poll};

use serde::Serialize;
use thiserror::Error;
use trace_wire::{DecodeError, HeaderParseError, MetaHeader, ProducerId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed metapacket header: {0}")]
    Header(#[from] HeaderParseError),
    #[error("metapacket of {length} bytes exceeds the limit {max}")]
    TooLong { length: u32, max: usize },
    #[error("{producer} packet at byte {position}: {source}")]
    Decode {
        producer: ProducerId,
        position: usize,
        #[source]
        source: DecodeError,
    },
    #[error("stream ends inside a metapacket, {0} bytes left")]
    Truncated(usize),
}

/// Cuts a byte stream into metapackets, bytes may arrive in arbitrary pieces.
pub struct MetapacketParser {
    acc: Vec<u8>,
    pos: usize,
    max_packet_size: usize,
}

impl MetapacketParser {
    pub fn new(max_packet_size: usize) -> Self {
        MetapacketParser {
            acc: vec![],
            pos: 0,
            max_packet_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.pos == self.acc.len() {
            self.acc.clear();
            self.pos = 0;
        } else if self.pos > self.acc.len() / 2 {
            self.acc.drain(..self.pos);
            self.pos = 0;
        }
        self.acc.extend_from_slice(bytes);
    }

    pub fn poll(&mut self) -> Poll<Result<(MetaHeader, Vec<u8>), TransportError>> {
        let bytes = &self.acc[self.pos..];
        if bytes.len() < MetaHeader::SIZE {
            return Poll::Pending;
        }
        let header_bytes =
            <[u8; MetaHeader::SIZE]>::try_from(&bytes[..MetaHeader::SIZE]).expect("checked above");
        let header = match MetaHeader::try_from(header_bytes) {
            Ok(v) => v,
            Err(err) => return Poll::Ready(Err(err.into())),
        };
        if header.length as usize > self.max_packet_size {
            return Poll::Ready(Err(TransportError::TooLong {
                length: header.length,
                max: self.max_packet_size,
            }));
        }
        let end = MetaHeader::SIZE + header.length as usize;
        if bytes.len() < end {
            return Poll::Pending;
        }
        let payload = bytes[MetaHeader::SIZE..end].to_vec();
        self.pos += end;
        Poll::Ready(Ok((header, payload)))
    }

    pub fn buffered(&self) -> usize {
        self.acc.len() - self.pos
    }

    /// At the end of the stream, nothing may be left unparsed.
    pub fn finish(&mut self) -> Result<(), TransportError> {
        let left = self.buffered();
        self.acc.clear();
        self.pos = 0;
        if left != 0 {
            Err(TransportError::Truncated(left))
        } else {
            Ok(())
        }
    }
}

/// Bytes of a long packet whose last metapacket has not arrived yet.
#[derive(Default)]
struct MetaFrame {
    acc: Vec<u8>,
    chunks: u32,
}

/// Joins the metapackets of long packets, one open frame per producer.
#[derive(Default)]
pub struct Reassembler {
    frames: BTreeMap<ProducerId, MetaFrame>,
    dropped_chunks: u64,
    dropped_bytes: u64,
}

impl Reassembler {
    /// Returns the packet once complete.
    pub fn feed(&mut self, header: &MetaHeader, payload: Vec<u8>) -> Option<Vec<u8>> {
        let producer = header.producer;
        if header.clean_start() {
            if let Some(frame) = self.frames.remove(&producer) {
                log::warn!(
                    "{producer} packet restarted, drop {} bytes of {} chunks",
                    frame.acc.len(),
                    frame.chunks
                );
                self.dropped_chunks += u64::from(frame.chunks);
                self.dropped_bytes += frame.acc.len() as u64;
            }
            if header.clean_end() {
                return Some(payload);
            }
            log::debug!("{producer} open long packet");
            self.frames.insert(
                producer,
                MetaFrame {
                    acc: payload,
                    chunks: 1,
                },
            );
            return None;
        }

        let Some(frame) = self.frames.get_mut(&producer) else {
            log::warn!(
                "{producer} continuation without a start, drop {} bytes",
                payload.len()
            );
            self.dropped_chunks += 1;
            self.dropped_bytes += payload.len() as u64;
            return None;
        };
        frame.acc.extend_from_slice(&payload);
        frame.chunks += 1;
        if !header.clean_end() {
            return None;
        }
        let frame = self.frames.remove(&producer)?;
        log::debug!(
            "{producer} close long packet, {} bytes in {} chunks",
            frame.acc.len(),
            frame.chunks
        );
        Some(frame.acc)
    }

    pub fn open(&self) -> usize {
        self.frames.len()
    }

    /// Drops every open frame, returns the producers that had one.
    pub fn close(&mut self) -> Vec<ProducerId> {
        let frames = mem::take(&mut self.frames);
        frames
            .into_iter()
            .map(|(producer, frame)| {
                log::warn!(
                    "{producer} stream ends inside a long packet, drop {} bytes",
                    frame.acc.len()
                );
                self.dropped_chunks += u64::from(frame.chunks);
                self.dropped_bytes += frame.acc.len() as u64;
                producer
            })
            .collect()
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TransportStats {
    pub metapackets: u64,
    pub bytes: u64,
    pub packets: u64,
    pub dropped_chunks: u64,
}

/// Receive side of one connection: bytes in, complete packets out.
pub struct Transport {
    parser: MetapacketParser,
    reassembler: Reassembler,
    stats: TransportStats,
}

impl Transport {
    pub fn new(max_packet_size: usize) -> Self {
        Transport {
            parser: MetapacketParser::new(max_packet_size),
            reassembler: Reassembler::default(),
            stats: TransportStats::default(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.stats.bytes += bytes.len() as u64;
        self.parser.push(bytes);
    }

    /// The next complete packet, `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<(ProducerId, Vec<u8>)>, TransportError> {
        loop {
            let (header, payload) = match self.parser.poll() {
                Poll::Pending => return Ok(None),
                Poll::Ready(v) => v?,
            };
            self.stats.metapackets += 1;
            let packet = self.reassembler.feed(&header, payload);
            self.stats.dropped_chunks = self.reassembler.dropped_chunks();
            if let Some(packet) = packet {
                self.stats.packets += 1;
                return Ok(Some((header.producer, packet)));
            }
        }
    }

    /// End of stream, open long packets are lost.
    pub fn finish(&mut self) -> Result<Vec<ProducerId>, TransportError> {
        let open = self.reassembler.close();
        self.stats.dropped_chunks = self.reassembler.dropped_chunks();
        self.parser.finish()?;
        Ok(open)
    }

    pub fn open_frames(&self) -> usize {
        self.reassembler.open()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}
