use std::io;

use bitflags::bitflags;
use thiserror::Error;

use super::ProducerId;

bitflags! {
    pub struct MetaFlags: u8 {
        /// This metapacket finishes the packet of its producer.
        const CLEAN_END = 0b01;
        /// This metapacket begins a new packet of its producer.
        const CLEAN_START = 0b10;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("unknown flags {0:#04x}")]
    Flags(u8),
}

/// `producer:u32, length:i32, flags:u8`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    pub producer: ProducerId,
    pub length: u32,
    pub flags: MetaFlags,
}

impl MetaHeader {
    pub const SIZE: usize = 9;

    pub fn clean_start(&self) -> bool {
        self.flags.contains(MetaFlags::CLEAN_START)
    }

    pub fn clean_end(&self) -> bool {
        self.flags.contains(MetaFlags::CLEAN_END)
    }
}

impl TryFrom<[u8; MetaHeader::SIZE]> for MetaHeader {
    type Error = HeaderParseError;

    fn try_from(v: [u8; MetaHeader::SIZE]) -> Result<Self, Self::Error> {
        let producer = {
            let mut x = [0; 4];
            x.clone_from_slice(&v[..4]);
            ProducerId(u32::from_be_bytes(x))
        };
        let length = {
            let mut x = [0; 4];
            x.clone_from_slice(&v[4..8]);
            i32::from_be_bytes(x)
        };
        if length < 0 {
            return Err(HeaderParseError::NegativeLength(length));
        }
        let flags = MetaFlags::from_bits(v[8]).ok_or(HeaderParseError::Flags(v[8]))?;

        Ok(MetaHeader {
            producer,
            length: length as u32,
            flags,
        })
    }
}

impl<'a> From<&'a MetaHeader> for [u8; MetaHeader::SIZE] {
    fn from(
        MetaHeader {
            producer,
            length,
            flags,
        }: &'a MetaHeader,
    ) -> Self {
        let mut v = [0; MetaHeader::SIZE];
        v[..4].clone_from_slice(&producer.0.to_be_bytes());
        v[4..8].clone_from_slice(&length.to_be_bytes());
        v[8] = flags.bits();
        v
    }
}

/// Splits one packet into metapackets carrying at most `chunk_size` bytes of payload.
/// An empty packet still yields one metapacket with both flags set.
pub fn split(producer: ProducerId, packet: &[u8], chunk_size: usize) -> Split<'_> {
    Split {
        producer,
        rest: packet,
        chunk_size: chunk_size.max(1),
        started: false,
    }
}

pub struct Split<'a> {
    producer: ProducerId,
    rest: &'a [u8],
    chunk_size: usize,
    started: bool,
}

impl<'a> Iterator for Split<'a> {
    type Item = (MetaHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.started && self.rest.is_empty() {
            return None;
        }
        let mut flags = MetaFlags::empty();
        if !self.started {
            flags |= MetaFlags::CLEAN_START;
            self.started = true;
        }
        let len = self.chunk_size.min(self.rest.len());
        let (chunk, rest) = self.rest.split_at(len);
        self.rest = rest;
        if rest.is_empty() {
            flags |= MetaFlags::CLEAN_END;
        }
        let header = MetaHeader {
            producer: self.producer,
            length: chunk.len() as u32,
            flags,
        };
        Some((header, chunk))
    }
}

/// Writes the packet as a sequence of metapackets, does not flush.
pub fn write_packet<W>(
    w: &mut W,
    producer: ProducerId,
    packet: &[u8],
    chunk_size: usize,
) -> io::Result<()>
where
    W: io::Write,
{
    for (header, chunk) in split(producer, packet, chunk_size) {
        w.write_all(&<[u8; MetaHeader::SIZE]>::from(&header))?;
        w.write_all(chunk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{split, write_packet, MetaFlags, MetaHeader, HeaderParseError};
    use crate::ProducerId;

    #[test]
    fn header_layout() {
        let header = MetaHeader {
            producer: ProducerId(3),
            length: 0x0102,
            flags: MetaFlags::CLEAN_START | MetaFlags::CLEAN_END,
        };
        let bytes = <[u8; MetaHeader::SIZE]>::from(&header);
        assert_eq!(hex::encode(bytes), "000000030000010203");
        assert_eq!(MetaHeader::try_from(bytes), Ok(header));
    }

    #[test]
    fn malformed_header() {
        let negative = hex::decode("00000001ffffffff03").expect("valid constant");
        let negative = <[u8; MetaHeader::SIZE]>::try_from(negative.as_slice()).expect("9 bytes");
        assert_eq!(
            MetaHeader::try_from(negative),
            Err(HeaderParseError::NegativeLength(-1))
        );

        let flags = hex::decode("000000010000000004").expect("valid constant");
        let flags = <[u8; MetaHeader::SIZE]>::try_from(flags.as_slice()).expect("9 bytes");
        assert_eq!(MetaHeader::try_from(flags), Err(HeaderParseError::Flags(4)));
    }

    #[test]
    fn split_flags() {
        let packet = [1, 2, 3, 4, 5];
        let chunks = split(ProducerId(1), &packet, 2)
            .map(|(h, c)| (h.flags.bits(), c.to_vec()))
            .collect::<Vec<_>>();
        assert_eq!(
            chunks,
            vec![(0b10, vec![1, 2]), (0b00, vec![3, 4]), (0b01, vec![5])]
        );

        let single = split(ProducerId(1), &packet, 8).collect::<Vec<_>>();
        assert_eq!(single.len(), 1);
        assert!(single[0].0.clean_start() && single[0].0.clean_end());
    }

    #[test]
    fn empty_packet() {
        let mut out = vec![];
        write_packet(&mut out, ProducerId(7), &[], 16).unwrap();
        assert_eq!(hex::encode(out), "000000070000000003");
    }
}
