use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    Congested,
}

#[repr(align(64))]
struct CacheAlignedAtomic(AtomicUsize);

/// A wait-free SPSC ring buffer carrying accepted sockets from one accept
/// loop to one dedicated dispatcher.
///
/// ## Mechanical Sympathy
/// - **Cache-Line Padding**: Head and Tail live on separate cache lines so
///   producer and consumer never false-share.
/// - **Power-of-Two Sizing**: Index wrapping is a bitwise AND.
///
/// ## Contract
/// Exactly one thread calls `try_push` and exactly one thread calls `pop`.
pub struct SqBridge<T> {
    head: CacheAlignedAtomic,
    tail: CacheAlignedAtomic,
    buffer: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
}

impl<T> SqBridge<T> {
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity.is_power_of_two(), "Capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Arc::new(Self {
            head: CacheAlignedAtomic(AtomicUsize::new(0)),
            tail: CacheAlignedAtomic(AtomicUsize::new(0)),
            buffer,
            mask: capacity - 1,
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Pushes `item`, handing it back when the ring is full.
    pub fn try_push(&self, item: T) -> Result<(), (DropReason, T)> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) > self.mask {
            return Err((DropReason::Congested, item));
        }

        // # Safety: Only the producer writes slot `head`, and the consumer
        // will not read it until the Release store below publishes it.
        unsafe {
            *self.buffer[head & self.mask].get() = Some(item);
        }

        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        // # Safety: Only the consumer takes slot `tail`; the Acquire load of
        // `head` makes the producer's write visible.
        let item = unsafe { (*self.buffer[tail & self.mask].get()).take() };

        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        item
    }

    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

unsafe impl<T: Send> Send for SqBridge<T> {}
unsafe impl<T: Send> Sync for SqBridge<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_hands_item_back() {
        let bridge = SqBridge::new(4);
        for i in 0..4 {
            assert!(bridge.try_push(i).is_ok());
        }
        assert_eq!(bridge.try_push(99), Err((DropReason::Congested, 99)));
        assert_eq!(bridge.pop(), Some(0));
        assert!(bridge.try_push(4).is_ok());
        let drained: Vec<i32> = std::iter::from_fn(|| bridge.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(bridge.is_empty());
    }

    #[test]
    fn cross_thread_fifo() {
        let bridge = SqBridge::new(8);
        let producer = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let mut item = i;
                    loop {
                        match bridge.try_push(item) {
                            Ok(()) => break,
                            Err((_, back)) => {
                                item = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            })
        };
        let mut expected = 0u32;
        while expected < 1000 {
            if let Some(v) = bridge.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
