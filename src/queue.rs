//! Bounded queue of fixed-size elements, stored in the kernel heap
//!
//! A queue is a 20-byte descriptor block plus an element buffer, both
//! allocated from the arena:
//!
//! ```text
//!   +0  element_size  u32
//!   +4  capacity      u32   (elements)
//!   +8  head          u32   (elements ever written, wrapping)
//!   +12 tail          u32   (elements ever removed, wrapping)
//!   +16 buffer        u32   (arena offset of the element buffer)
//! ```
//!
//! `head` and `tail` run freely and wrap at `u32`, so occupancy is simply
//! `head - tail` and the queue can be completely full. Slots are
//! `counter % capacity`; when the capacity is not a power of two the slot
//! sequence jumps once every 2^32 elements as the counters wrap.
//!
//! Nothing is locked: a put or get runs start to finish between two yields.
//!
//! Author: Moroya Sakamoto

use log::{debug, warn};

use crate::heap::{Heap, HeapPtr};
use crate::kernel::Kernel;
use crate::time::Deadline;

const ELEMENT_SIZE: usize = 0;
const CAPACITY: usize = 4;
const HEAD: usize = 8;
const TAIL: usize = 12;
const BUFFER: usize = 16;
/// Bytes of the in-arena descriptor
pub const DESCRIPTOR_SIZE: usize = 20;

/// Handle to a queue living in a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle(HeapPtr);

impl QueueHandle {
    /// Plain integer form, e.g. to pass as a task argument
    pub const fn to_raw(self) -> usize {
        self.0.to_raw()
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(HeapPtr::from_raw(raw))
    }
}

/// Borrowed view of one queue
pub struct Queue<'h, const N: usize> {
    heap: &'h mut Heap<N>,
    desc: usize,
}

impl<'h, const N: usize> Queue<'h, N> {
    /// Allocate a queue of `count` elements of `element_size` bytes.
    ///
    /// `None` when either allocation fails (nothing stays allocated) or
    /// either dimension is zero.
    pub fn create(heap: &mut Heap<N>, element_size: usize, count: usize) -> Option<QueueHandle> {
        if element_size == 0 || count == 0 {
            return None;
        }
        // Dimensions are stored as u32
        let bytes = element_size.checked_mul(count)?;
        let (element_size32, count32) = (
            u32::try_from(element_size).ok()?,
            u32::try_from(count).ok()?,
        );

        let desc = heap.malloc(DESCRIPTOR_SIZE)?;
        let Some(buffer) = heap.malloc(bytes) else {
            heap.free(desc);
            return None;
        };

        let base = desc.offset();
        heap.write_u32(base + ELEMENT_SIZE, element_size32);
        heap.write_u32(base + CAPACITY, count32);
        heap.write_u32(base + HEAD, 0);
        heap.write_u32(base + TAIL, 0);
        heap.write_u32(base + BUFFER, buffer.offset() as u32);
        Some(QueueHandle(desc))
    }

    /// Release the buffer, then the descriptor. The handle is dead after this.
    pub fn destroy(heap: &mut Heap<N>, handle: QueueHandle) {
        let buffer = HeapPtr::from_raw(heap.read_u32(handle.0.offset() + BUFFER) as usize);
        heap.free(buffer);
        heap.free(handle.0);
    }

    pub fn open(heap: &'h mut Heap<N>, handle: QueueHandle) -> Self {
        Self {
            heap,
            desc: handle.0.offset(),
        }
    }

    fn field(&self, at: usize) -> u32 {
        self.heap.read_u32(self.desc + at)
    }

    fn set_field(&mut self, at: usize, value: u32) {
        self.heap.write_u32(self.desc + at, value);
    }

    fn buffer(&self) -> HeapPtr {
        HeapPtr::from_raw(self.field(BUFFER) as usize)
    }

    pub fn element_size(&self) -> usize {
        self.field(ELEMENT_SIZE) as usize
    }

    pub fn capacity(&self) -> usize {
        self.field(CAPACITY) as usize
    }

    /// Elements waiting to be read
    pub fn used(&self) -> usize {
        self.field(HEAD).wrapping_sub(self.field(TAIL)) as usize
    }

    /// Elements that can be written without blocking
    pub fn free(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Bytes a read of up to `n` elements can fill right now
    pub fn readable_bytes(&self, n: usize) -> usize {
        n.min(self.used()) * self.element_size()
    }

    /// Slot of a counter value
    fn slot(&self, counter: u32) -> usize {
        (counter % self.field(CAPACITY)) as usize
    }

    /// Write up to `n` elements from `data`; returns how many fit.
    pub fn put(&mut self, data: &[u8], n: usize) -> usize {
        let size = self.element_size();
        let n = n.min(self.free()).min(data.len() / size);
        if n == 0 {
            return 0;
        }

        let head = self.field(HEAD);
        let start = self.slot(head);
        let first = n.min(self.capacity() - start);
        let buffer = self.buffer();

        self.heap
            .bytes_mut(buffer.add(start * size), first * size)
            .copy_from_slice(&data[..first * size]);
        if first < n {
            self.heap
                .bytes_mut(buffer, (n - first) * size)
                .copy_from_slice(&data[first * size..n * size]);
        }

        self.set_field(HEAD, head.wrapping_add(n as u32));
        n
    }

    /// Copy up to `n` elements into `out` without consuming them
    pub fn peek(&self, out: &mut [u8], n: usize) -> usize {
        let size = self.element_size();
        let n = n.min(self.used()).min(out.len() / size);
        if n == 0 {
            return 0;
        }

        let start = self.slot(self.field(TAIL));
        let first = n.min(self.capacity() - start);
        let buffer = self.buffer();

        out[..first * size]
            .copy_from_slice(self.heap.bytes(buffer.add(start * size), first * size));
        if first < n {
            out[first * size..n * size]
                .copy_from_slice(self.heap.bytes(buffer, (n - first) * size));
        }
        n
    }

    /// Consume up to `n` elements into `out`
    pub fn get(&mut self, out: &mut [u8], n: usize) -> usize {
        let n = self.peek(out, n);
        self.discard(n)
    }

    /// Consume up to `n` elements unread
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.used());
        let tail = self.field(TAIL);
        self.set_field(TAIL, tail.wrapping_add(n as u32));
        n
    }
}

impl Kernel {
    /// Allocate a queue in the kernel heap
    pub fn queue_create(&self, element_size: usize, count: usize) -> Option<QueueHandle> {
        let handle = self.with_heap(|heap| Queue::create(heap, element_size, count));
        match handle {
            Some(handle) => debug!(
                "queue: created {}x{} B at {:#x}",
                count,
                element_size,
                handle.to_raw()
            ),
            None => warn!("queue: cannot allocate {}x{} B", count, element_size),
        }
        handle
    }

    pub fn queue_destroy(&self, handle: QueueHandle) {
        self.with_heap(|heap| Queue::destroy(heap, handle));
        debug!("queue: destroyed {:#x}", handle.to_raw());
    }

    pub fn queue_used(&self, handle: QueueHandle) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).used())
    }

    pub fn queue_free(&self, handle: QueueHandle) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).free())
    }

    /// Non-blocking put; returns the number of elements written
    pub fn queue_put(&self, handle: QueueHandle, data: &[u8], n: usize) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).put(data, n))
    }

    /// Put and yield until all `n` elements are in or `timeout` ticks pass.
    /// Returns the count written, short on timeout.
    pub fn queue_put_wait(
        &self,
        handle: QueueHandle,
        data: &[u8],
        n: usize,
        timeout: u32,
    ) -> usize {
        // Only whole elements the slice holds can ever be written
        let size = self.with_heap(|heap| Queue::open(heap, handle).element_size());
        let n = n.min(data.len() / size);
        let deadline = Deadline::new(self.now(), timeout);
        let mut written = 0;
        loop {
            let put = self.with_heap(|heap| {
                let mut queue = Queue::open(heap, handle);
                let offset = written * queue.element_size();
                queue.put(&data[offset.min(data.len())..], n - written)
            });
            written += put;
            if written == n || deadline.expired(self.now()) {
                return written;
            }
            self.yield_now();
        }
    }

    pub fn queue_peek(&self, handle: QueueHandle, out: &mut [u8], n: usize) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).peek(out, n))
    }

    pub fn queue_get(&self, handle: QueueHandle, out: &mut [u8], n: usize) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).get(out, n))
    }

    /// Get and yield until `n` elements arrived or `timeout` ticks pass.
    /// Returns the count read, short on timeout.
    pub fn queue_get_wait(
        &self,
        handle: QueueHandle,
        out: &mut [u8],
        n: usize,
        timeout: u32,
    ) -> usize {
        let size = self.with_heap(|heap| Queue::open(heap, handle).element_size());
        let n = n.min(out.len() / size);
        let deadline = Deadline::new(self.now(), timeout);
        let mut read = 0;
        loop {
            let got = self.with_heap(|heap| {
                let mut queue = Queue::open(heap, handle);
                let offset = (read * queue.element_size()).min(out.len());
                queue.get(&mut out[offset..], n - read)
            });
            read += got;
            if read == n || deadline.expired(self.now()) {
                return read;
            }
            self.yield_now();
        }
    }

    /// Drop up to `n` elements unread
    pub fn queue_discard(&self, handle: QueueHandle, n: usize) -> usize {
        self.with_heap(|heap| Queue::open(heap, handle).discard(n))
    }
}
