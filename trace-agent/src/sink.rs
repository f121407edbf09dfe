use std::io;

use parking_lot::{Mutex, MutexGuard};
use trace_wire::{metapacket, ProducerId};

/// Where complete packets go.
pub trait PacketSink: Send + Sync {
    /// Takes a complete packet. The buffer may be handed back for reuse.
    fn send(&self, producer: ProducerId, packet: Vec<u8>) -> io::Result<Option<Vec<u8>>>;

    fn flush(&self) -> io::Result<()>;
}

/// Frames packets into metapackets on a byte stream.
pub struct StreamSink<W> {
    chunk_size: usize,
    stream: Mutex<W>,
}

impl<W> StreamSink<W> {
    pub fn new(stream: W, chunk_size: usize) -> Self {
        StreamSink {
            chunk_size,
            stream: Mutex::new(stream),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, W> {
        self.stream.lock()
    }

    pub fn into_inner(self) -> W {
        self.stream.into_inner()
    }
}

impl<W> PacketSink for StreamSink<W>
where
    W: io::Write + Send,
{
    fn send(&self, producer: ProducerId, packet: Vec<u8>) -> io::Result<Option<Vec<u8>>> {
        log::debug!("{producer} send {} bytes", packet.len());
        let mut stream = self.stream.lock();
        metapacket::write_packet(&mut *stream, producer, &packet, self.chunk_size)?;
        Ok(Some(packet))
    }

    fn flush(&self) -> io::Result<()> {
        self.stream.lock().flush()
    }
}

/// Keeps whole packets in order, for tests and in-process collectors.
#[derive(Default)]
pub struct MemorySink {
    packets: Mutex<Vec<(ProducerId, Vec<u8>)>>,
}

impl MemorySink {
    pub fn take(&self) -> Vec<(ProducerId, Vec<u8>)> {
        std::mem::take(&mut *self.packets.lock())
    }
}

impl PacketSink for MemorySink {
    fn send(&self, producer: ProducerId, packet: Vec<u8>) -> io::Result<Option<Vec<u8>>> {
        self.packets.lock().push((producer, packet));
        Ok(None)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}
