use std::cmp::min;
use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};


/// A FIFO of byte segments with partial-consumption bookkeeping.
///
/// Data is enqueued as whole segments and dequeued as an arbitrary number of
/// bytes. When a dequeue request covers exactly one unconsumed segment, that
/// segment is handed out by move instead of being copied; this is what makes
/// the queue suitable as the outbound buffer of a connection, where the
/// common case is "enqueue a message, write it out in one piece".
///
/// Partially consumed segments are advanced in place; a segment is removed
/// as soon as it is fully consumed, so `segments_queued` never counts empty
/// segments.
#[derive(Default)]
pub struct ByteQueue {
    segments: VecDeque<Bytes>,
    total_bytes: usize,
}

impl ByteQueue {
    pub fn new() -> ByteQueue {
        ByteQueue::default()
    }

    /// Appends a segment to the back of the queue. `Vec<u8>` and `BytesMut`
    /// convert without copying. Empty segments are not stored.
    pub fn enqueue(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.total_bytes += data.len();
        self.segments.push_back(data);
    }

    /// Removes and returns up to `num_bytes` from the front of the queue.
    /// Fewer bytes are returned if the queue holds fewer.
    pub fn dequeue(&mut self, num_bytes: usize) -> Bytes {
        let mut remaining = min(num_bytes, self.total_bytes);
        if remaining == 0 {
            return Bytes::new();
        }

        // whole-segment transfer: the head segment exactly covers the request
        if self.segments[0].len() == remaining {
            self.total_bytes -= remaining;
            return self.segments.pop_front().expect("checked non-empty");
        }

        // a single head segment larger than the request can still be split
        //  off without copying
        if self.segments[0].len() > remaining {
            self.total_bytes -= remaining;
            return self.segments[0].split_to(remaining);
        }

        let mut result = BytesMut::with_capacity(remaining);
        while remaining > 0 {
            let front = self.segments.front_mut().expect("total_bytes is exact");
            let bytes_to_consume = min(remaining, front.len());
            result.extend_from_slice(&front[..bytes_to_consume]);
            front.advance(bytes_to_consume);
            remaining -= bytes_to_consume;
            self.total_bytes -= bytes_to_consume;
            if front.is_empty() {
                self.segments.pop_front();
            }
        }
        result.freeze()
    }

    /// Returns up to `num_bytes` from the front of the queue without
    /// removing them.
    pub fn peek(&self, num_bytes: usize) -> Bytes {
        let mut remaining = min(num_bytes, self.total_bytes);
        if remaining == 0 {
            return Bytes::new();
        }

        if self.segments[0].len() >= remaining {
            return self.segments[0].slice(..remaining);
        }

        let mut result = BytesMut::with_capacity(remaining);
        for segment in &self.segments {
            let bytes_to_copy = min(remaining, segment.len());
            result.extend_from_slice(&segment[..bytes_to_copy]);
            remaining -= bytes_to_copy;
            if remaining == 0 {
                break;
            }
        }
        result.freeze()
    }

    /// Removes up to `num_bytes` from the front of the queue, returning
    /// nothing.
    pub fn drop_bytes(&mut self, num_bytes: usize) {
        let mut remaining = min(num_bytes, self.total_bytes);
        while remaining > 0 {
            let front = self.segments.front_mut().expect("total_bytes is exact");
            let bytes_to_consume = min(remaining, front.len());
            front.advance(bytes_to_consume);
            remaining -= bytes_to_consume;
            self.total_bytes -= bytes_to_consume;
            if front.is_empty() {
                self.segments.pop_front();
            }
        }
    }

    pub fn segments_queued(&self) -> usize {
        self.segments.len()
    }

    pub fn bytes_queued(&self) -> usize {
        self.total_bytes
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_queued_is_exact() {
        let mut queue = ByteQueue::new();
        assert_eq!(0, queue.bytes_queued());

        queue.enqueue(vec![1u8; 10]);
        queue.enqueue(vec![2u8; 25]);
        queue.enqueue(vec![3u8; 7]);
        assert_eq!(42, queue.bytes_queued());
        assert_eq!(3, queue.segments_queued());

        let _ = queue.dequeue(12);
        assert_eq!(30, queue.bytes_queued());

        queue.drop_bytes(30);
        assert_eq!(0, queue.bytes_queued());
        assert_eq!(0, queue.segments_queued());
    }

    #[test]
    fn test_whole_segment_fast_path() {
        let mut queue = ByteQueue::new();
        let data: Vec<u8> = (0..100).collect();
        queue.enqueue(data.clone());

        let dequeued = queue.dequeue(100);
        assert_eq!(data.as_slice(), dequeued.as_ref());
        assert_eq!(0, queue.segments_queued());
        assert_eq!(0, queue.bytes_queued());
    }

    #[test]
    fn test_dequeue_spanning_segments() {
        let mut queue = ByteQueue::new();
        let first: Vec<u8> = (0..50).collect();
        let second: Vec<u8> = (50..100).collect();
        queue.enqueue(first);
        queue.enqueue(second);

        let dequeued = queue.dequeue(70);
        let expected: Vec<u8> = (0..70).collect();
        assert_eq!(expected.as_slice(), dequeued.as_ref());
        assert_eq!(1, queue.segments_queued());
        assert_eq!(30, queue.bytes_queued());
    }

    #[test]
    fn test_peek_is_idempotent() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1u8, 2, 3]);
        queue.enqueue(vec![4u8, 5, 6, 7]);

        let first = queue.peek(5);
        let second = queue.peek(5);
        assert_eq!(first, second);
        assert_eq!(&[1u8, 2, 3, 4, 5][..], first.as_ref());
        assert_eq!(7, queue.bytes_queued());
        assert_eq!(2, queue.segments_queued());
    }

    #[test]
    fn test_split_dequeue_equals_combined_dequeue() {
        let data: Vec<u8> = (0..60).collect();

        let mut split = ByteQueue::new();
        split.enqueue(data.clone());
        split.enqueue(data.clone());
        let mut combined = ByteQueue::new();
        combined.enqueue(data.clone());
        combined.enqueue(data.clone());

        let mut split_result = split.dequeue(45).to_vec();
        split_result.extend_from_slice(&split.dequeue(30));
        assert_eq!(split_result.as_slice(), combined.dequeue(75).as_ref());
        assert_eq!(split.bytes_queued(), combined.bytes_queued());
    }

    #[test]
    fn test_drop_equals_discarded_dequeue() {
        let mut dropped = ByteQueue::new();
        let mut dequeued = ByteQueue::new();
        for queue in [&mut dropped, &mut dequeued] {
            queue.enqueue(vec![9u8; 33]);
            queue.enqueue(vec![7u8; 20]);
        }

        dropped.drop_bytes(40);
        let _ = dequeued.dequeue(40);
        assert_eq!(dropped.peek(10), dequeued.peek(10));
        assert_eq!(dropped.bytes_queued(), dequeued.bytes_queued());
        assert_eq!(dropped.segments_queued(), dequeued.segments_queued());
    }

    #[test]
    fn test_dequeue_beyond_total_empties_the_queue() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1u8; 8]);
        queue.enqueue(vec![2u8; 8]);

        let dequeued = queue.dequeue(1000);
        assert_eq!(16, dequeued.len());
        assert_eq!(0, queue.segments_queued());
        assert_eq!(0, queue.bytes_queued());
    }

    #[test]
    fn test_segments_never_exceed_enqueues() {
        let mut queue = ByteQueue::new();
        for i in 0..5 {
            queue.enqueue(vec![i as u8; 10]);
        }
        assert!(queue.segments_queued() <= 5);

        queue.drop_bytes(15);
        assert!(queue.segments_queued() <= 5);
        assert_eq!(35, queue.bytes_queued());
    }
}
