use parking_lot::Mutex;

/// Spare packet buffers, recycled after the sink is done with them.
pub struct PacketPool {
    packet_size: usize,
    limit: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl PacketPool {
    pub fn new(packet_size: usize, limit: usize) -> Self {
        PacketPool {
            packet_size,
            limit,
            free: Mutex::new(Vec::with_capacity(limit)),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.packet_size))
    }

    pub fn put(&self, mut packet: Vec<u8>) {
        packet.clear();
        // a packet that grew past a long registration is not worth keeping
        if packet.capacity() > self.packet_size * 2 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.limit {
            free.push(packet);
        }
    }

    pub fn spare(&self) -> usize {
        self.free.lock().len()
    }
}

/// Whether a packet must be handed over before the next message.
pub fn is_full(packet: &[u8], packet_size: usize, max_message_size: usize) -> bool {
    packet.len() + max_message_size > packet_size
}

#[cfg(test)]
mod tests {
    use super::{is_full, PacketPool};

    #[test]
    fn free_list_is_bounded() {
        let pool = PacketPool::new(64, 2);
        let packets = (0..3).map(|_| pool.take()).collect::<Vec<_>>();
        assert!(packets.iter().all(|p| p.capacity() >= 64));
        for mut p in packets {
            p.extend_from_slice(b"data");
            pool.put(p);
        }
        assert_eq!(pool.spare(), 2);
        assert!(pool.take().is_empty());
    }

    #[test]
    fn threshold() {
        assert!(!is_full(&[0; 3840], 4096, 256));
        assert!(is_full(&[0; 3841], 4096, 256));
    }
}
