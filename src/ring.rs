//! A multi-producer, multi-consumer ring queue living in shared memory.
//!
//! The algorithm is the classic two-cursor design: producers and consumers
//! each have a `head` (claimed) and `tail` (published) cursor. Claiming a
//! slot is a single CAS on `head`; publishing it is a spin-CAS on `tail` so
//! that a slower claimer never lets a faster one publish out of order ahead
//! of it. Every entry is a `u32` token (an index into whatever fixed pool
//! backs this ring, e.g. a packet buffer pool) -- never a raw pointer --
//! so the queue itself never reasons about pointer validity.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// Ring capacity is bounded the same way the wire format bounds packet
/// pool size: a fixed, compile-time maximum, with the live capacity
/// (must be a power of two, <= this max) configured at `init()` time.
pub const RING_MAX_ELEMENTS: usize = 4096;

#[repr(C)]
struct Span {
    head: AtomicU32,
    tail: AtomicU32,
}

impl Span {
    const fn zeroed() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

/// A ring queue of opaque `u32` tokens. Lives inline in a [`crate::shm::Segment`].
#[repr(C)]
pub struct Ring {
    elements: u32,
    mask: u32,
    producer: CachePadded<Span>,
    consumer: CachePadded<Span>,
    data: [AtomicU32; RING_MAX_ELEMENTS],
}

impl Ring {
    /// Initialize a zero-filled ring (as freshly attached shared memory
    /// always is) with the given live capacity. Must be called exactly
    /// once, by the creator, before any producer or consumer runs.
    ///
    /// # Safety
    /// `ring` must point at a zero-initialized, appropriately sized and
    /// aligned `Ring` that no other thread or process is using yet.
    pub unsafe fn init(ring: *mut Ring, elements: usize) {
        assert!(elements > 0 && elements.is_power_of_two());
        assert!(elements <= RING_MAX_ELEMENTS);

        std::ptr::addr_of_mut!((*ring).elements).write(elements as u32);
        std::ptr::addr_of_mut!((*ring).mask).write((elements - 1) as u32);
    }

    /// Number of entries ready to be dequeued. For consumers.
    pub fn pending(&self) -> u32 {
        let head = self.consumer.head.load(Ordering::SeqCst);
        let tail = self.producer.tail.load(Ordering::SeqCst);
        tail.wrapping_sub(head)
    }

    /// Number of free slots available to producers.
    pub fn available(&self) -> u32 {
        let head = self.producer.head.load(Ordering::SeqCst);
        let tail = self.consumer.tail.load(Ordering::SeqCst);
        self.elements.wrapping_add(tail.wrapping_sub(head))
    }

    /// Attempt to enqueue a token. Returns `Err(token)` if the ring is full.
    pub fn queue(&self, token: u32) -> Result<(), u32> {
        loop {
            let head = self.producer.head.load(Ordering::SeqCst);
            let tail = self.consumer.tail.load(Ordering::SeqCst);

            if self.elements.wrapping_add(tail.wrapping_sub(head)) == 0 {
                return Err(token);
            }

            let next = head.wrapping_add(1);
            if self
                .producer
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let slot = (head & self.mask) as usize;
            self.data[slot].store(token, Ordering::SeqCst);

            while self
                .producer
                .tail
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                std::hint::spin_loop();
            }

            return Ok(());
        }
    }

    /// Attempt to dequeue a token. Returns `None` if the ring is empty.
    pub fn dequeue(&self) -> Option<u32> {
        loop {
            let head = self.consumer.head.load(Ordering::SeqCst);
            let tail = self.producer.tail.load(Ordering::SeqCst);

            if tail.wrapping_sub(head) == 0 {
                return None;
            }

            let next = head.wrapping_add(1);
            if self
                .consumer
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let slot = (head & self.mask) as usize;
            let token = self.data[slot].load(Ordering::SeqCst);

            while self
                .consumer
                .tail
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                std::hint::spin_loop();
            }

            return Some(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fresh(elements: usize) -> Box<Ring> {
        let mut boxed: Box<Ring> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { Ring::init(boxed.as_mut() as *mut Ring, elements) };
        boxed
    }

    #[test]
    fn queue_dequeue_fifo() {
        let ring = fresh(8);
        for i in 0..8u32 {
            ring.queue(i).unwrap();
        }
        assert!(ring.queue(99).is_err());
        for i in 0..8u32 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn wraps_around_mask() {
        let ring = fresh(4);
        for i in 0..4u32 {
            ring.queue(i).unwrap();
        }
        assert_eq!(ring.dequeue(), Some(0));
        assert_eq!(ring.dequeue(), Some(1));
        ring.queue(10).unwrap();
        ring.queue(11).unwrap();
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), Some(3));
        assert_eq!(ring.dequeue(), Some(10));
        assert_eq!(ring.dequeue(), Some(11));
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn concurrent_producers_consumers_preserve_count() {
        let ring = Arc::new(fresh(256));
        let produced = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let consumed = Arc::new(std::sync::atomic::AtomicU32::new(0));

        std::thread::scope(|s| {
            for _ in 0..4 {
                let ring = Arc::clone(&ring);
                let produced = Arc::clone(&produced);
                s.spawn(move || {
                    for _ in 0..2000 {
                        loop {
                            if ring.queue(1).is_ok() {
                                produced.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                });
            }

            for _ in 0..4 {
                let ring = Arc::clone(&ring);
                let consumed = Arc::clone(&consumed);
                s.spawn(move || {
                    for _ in 0..2000 {
                        loop {
                            if ring.dequeue().is_some() {
                                consumed.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                });
            }
        });

        assert_eq!(produced.load(Ordering::SeqCst), 8000);
        assert_eq!(consumed.load(Ordering::SeqCst), 8000);
        assert_eq!(ring.pending(), 0);
    }
}
