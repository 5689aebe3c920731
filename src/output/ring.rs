use std::{collections::VecDeque, sync::RwLock};

use ffmpeg::{Packet, Rational};

const DEFAULT_DURATION_LIMIT_SECS: f64 = 2.0;

struct RingInner {
    buffer: VecDeque<(Packet, f64)>,
    total_seconds: f64,
    last_pts: Option<i64>,
}

/// Sliding window of a camera's most recent compressed packets, bounded by
/// duration rather than count.
///
/// When a new event begins, its output file can be prepended with these
/// packets so it starts at the most recent keyframe instead of mid-GOP.
pub struct PacketRingBuffer {
    duration_limit: f64,
    inner: RwLock<RingInner>,
}

impl Default for PacketRingBuffer {
    fn default() -> PacketRingBuffer {
        PacketRingBuffer::new(DEFAULT_DURATION_LIMIT_SECS)
    }
}

impl PacketRingBuffer {
    pub fn new(duration_limit_secs: f64) -> PacketRingBuffer {
        PacketRingBuffer {
            duration_limit: duration_limit_secs,
            inner: RwLock::new(RingInner {
                buffer: VecDeque::new(),
                total_seconds: 0.0,
                last_pts: None,
            }),
        }
    }

    /// Appends a clone of `packet` and shrinks from the front until the
    /// accumulated duration fits the limit again. The packet's duration is
    /// estimated from its own `duration` field, falling back to the pts
    /// delta against the previous packet.
    pub fn push(&self, packet: &Packet, time_base: Rational) {
        let tick = f64::from(time_base);
        let mut inner = self.inner.write().unwrap();

        let mut duration = 0.0;
        if packet.duration() > 0 {
            duration = packet.duration() as f64 * tick;
        } else if let (Some(pts), Some(last_pts)) = (packet.pts(), inner.last_pts) {
            duration = ((pts - last_pts) as f64 * tick).max(0.0);
        }
        inner.last_pts = packet.pts();

        inner.buffer.push_back((packet.clone(), duration));
        inner.total_seconds += duration;
        while inner.total_seconds > self.duration_limit {
            let Some((_, front_duration)) = inner.buffer.pop_front() else {
                break;
            };
            inner.total_seconds -= front_duration;
        }
    }

    /// Independent clones of the buffered packets, oldest first; the caller
    /// owns them.
    pub fn extract_all(&self) -> Vec<Packet> {
        let inner = self.inner.read().unwrap();
        inner.buffer.iter().map(|(packet, _)| packet.clone()).collect()
    }

    pub fn buffered_seconds(&self) -> f64 {
        self.inner.read().unwrap().total_seconds
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB: Rational = Rational(1, 25);

    fn packet(pts: i64, duration: i64) -> Packet {
        let mut packet = Packet::copy(&[0u8; 8]);
        packet.set_pts(Some(pts));
        packet.set_duration(duration);
        packet
    }

    #[test]
    fn keeps_roughly_the_duration_limit() {
        let ring = PacketRingBuffer::new(2.0);
        // 4 seconds of 25fps packets, 1 tick each.
        for i in 0..100 {
            ring.push(&packet(i, 1), TB);
        }
        // Never more than limit + one packet worth; allow for float drift in
        // the accumulator.
        assert!(ring.buffered_seconds() <= 2.0 + 1.0 / 25.0 + 1e-9);
        let kept = ring.len();
        assert!((49..=51).contains(&kept));

        let extracted = ring.extract_all();
        assert_eq!(extracted.len(), kept);
        assert_eq!(extracted[kept - 1].pts(), Some(99));
        assert_eq!(extracted[0].pts(), Some(99 - kept as i64 + 1));
    }

    #[test]
    fn falls_back_to_pts_delta_without_duration() {
        let ring = PacketRingBuffer::new(1.0);
        for i in 0..60 {
            ring.push(&packet(i, 0), TB);
        }
        // First packet has no delta, the rest carry 1/25s each.
        assert!(ring.buffered_seconds() <= 1.0 + 1.0 / 25.0 + f64::EPSILON);
        assert!(ring.len() < 60);
    }

    #[test]
    fn extract_does_not_drain() {
        let ring = PacketRingBuffer::new(2.0);
        ring.push(&packet(0, 1), TB);
        ring.push(&packet(1, 1), TB);
        assert_eq!(ring.extract_all().len(), 2);
        assert_eq!(ring.extract_all().len(), 2);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn oversized_single_packet_passes_through() {
        let ring = PacketRingBuffer::new(1.0);
        ring.push(&packet(0, 100), TB); // 4 seconds in one packet
        assert!(ring.is_empty());
        // The accumulator went back to zero with the eviction.
        assert!(ring.buffered_seconds().abs() < f64::EPSILON);
    }
}
