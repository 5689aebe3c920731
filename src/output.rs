mod recordings;
mod remux;
mod ring;

use std::sync::Mutex;

use crossbeam::channel::{bounded, Receiver, Sender};
use ffmpeg::{Packet, Rational};

pub use recordings::RecordingsManager;
pub use remux::{Remuxer, RemuxerWorker};
pub use ring::PacketRingBuffer;

const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out point for a camera's compressed packets. Remuxers subscribe while
/// an event is live and unsubscribe by dropping their receiver.
#[derive(Default)]
pub struct PacketHub {
    subscribers: Mutex<Vec<Sender<(Packet, Rational)>>>,
}

impl PacketHub {
    pub fn new() -> PacketHub {
        PacketHub::default()
    }

    pub fn subscribe(&self) -> Receiver<(Packet, Rational)> {
        let (tx, rx) = bounded(PACKET_CHANNEL_CAPACITY);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Clones the packet once per live subscriber; dropped receivers are
    /// pruned, a full mailbox loses this packet for that subscriber only.
    pub fn publish(&self, packet: &Packet, time_base: Rational) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| match tx.try_send((packet.clone(), time_base)) {
                Ok(()) => true,
                Err(crossbeam::channel::TrySendError::Full(_)) => true,
                Err(crossbeam::channel::TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pts: i64) -> Packet {
        let mut packet = Packet::copy(&[0u8; 16]);
        packet.set_pts(Some(pts));
        packet
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let hub = PacketHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.publish(&packet(1), Rational::new(1, 25));
        assert_eq!(a.try_recv().unwrap().0.pts(), Some(1));
        assert_eq!(b.try_recv().unwrap().0.pts(), Some(1));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = PacketHub::new();
        let keep = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(&packet(2), Rational::new(1, 25));
        assert_eq!(hub.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
