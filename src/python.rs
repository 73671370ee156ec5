//! Python bindings (feature `python`)
//!
//! Host-side access to the arena heap and the bounded queue, for poking at
//! allocator behaviour and buffer sizing from a notebook. Each object owns
//! a private arena; nothing here schedules tasks.
//!
//! Author: Moroya Sakamoto

use pyo3::exceptions::{PyMemoryError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::config::ARENA_SIZE;
use crate::heap::{Heap, HeapPtr};
use crate::queue::{Queue, QueueHandle};

fn formatted_heap() -> Box<Heap<ARENA_SIZE>> {
    let mut heap = Box::new(Heap::new());
    heap.init();
    heap
}

#[pyclass(name = "Heap", module = "coop_rtos")]
pub struct PyHeap {
    heap: Box<Heap<ARENA_SIZE>>,
}

#[pymethods]
impl PyHeap {
    #[new]
    fn new() -> Self {
        Self {
            heap: formatted_heap(),
        }
    }

    /// Payload offset, or None when nothing fits
    fn malloc(&mut self, size: usize) -> Option<usize> {
        self.heap.malloc(size).map(HeapPtr::offset)
    }

    fn free(&mut self, ptr: usize) -> PyResult<()> {
        // Reject offsets that cannot be payloads; anything else is trusted
        let Some(payload) = self.heap.payload(ptr) else {
            return Err(PyValueError::new_err(format!("{ptr} is not a heap pointer")));
        };
        self.heap.free(payload);
        Ok(())
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.heap.stats();
        let dict = PyDict::new_bound(py);
        dict.set_item("total", stats.total)?;
        dict.set_item("used", stats.used)?;
        dict.set_item("free", stats.free)?;
        dict.set_item("blocks", stats.blocks)?;
        dict.set_item("largest_free", stats.largest_free)?;
        Ok(dict)
    }

    fn check(&self) -> bool {
        self.heap.check()
    }

    /// (offset, size, used) for every block
    fn blocks(&self) -> Vec<(usize, usize, bool)> {
        self.heap
            .blocks()
            .map(|block| (block.offset, block.size, block.used))
            .collect()
    }
}

#[pyclass(name = "Queue", module = "coop_rtos")]
pub struct PyQueue {
    heap: Box<Heap<ARENA_SIZE>>,
    handle: QueueHandle,
}

impl PyQueue {
    fn queue(&mut self) -> Queue<'_, ARENA_SIZE> {
        Queue::open(&mut *self.heap, self.handle)
    }
}

#[pymethods]
impl PyQueue {
    #[new]
    fn new(element_size: usize, count: usize) -> PyResult<Self> {
        let mut heap = formatted_heap();
        match Queue::create(&mut *heap, element_size, count) {
            Some(handle) => Ok(Self { heap, handle }),
            None if element_size == 0 || count == 0 => {
                Err(PyValueError::new_err("element_size and count must be non-zero"))
            }
            None => Err(PyMemoryError::new_err(format!(
                "{count}x{element_size} B does not fit the {ARENA_SIZE} B arena"
            ))),
        }
    }

    /// Write whole elements from `data`; returns how many were written
    fn put(&mut self, data: &[u8]) -> usize {
        let mut queue = self.queue();
        let n = data.len() / queue.element_size();
        queue.put(data, n)
    }

    fn get<'py>(&mut self, py: Python<'py>, n: usize) -> Bound<'py, PyBytes> {
        let mut queue = self.queue();
        let mut out = vec![0u8; queue.readable_bytes(n)];
        let read = queue.get(&mut out, n);
        out.truncate(read * queue.element_size());
        PyBytes::new_bound(py, &out)
    }

    fn peek<'py>(&mut self, py: Python<'py>, n: usize) -> Bound<'py, PyBytes> {
        let queue = self.queue();
        let mut out = vec![0u8; queue.readable_bytes(n)];
        let read = queue.peek(&mut out, n);
        out.truncate(read * queue.element_size());
        PyBytes::new_bound(py, &out)
    }

    fn discard(&mut self, n: usize) -> usize {
        self.queue().discard(n)
    }

    #[getter]
    fn used(&mut self) -> usize {
        self.queue().used()
    }

    #[getter]
    fn free(&mut self) -> usize {
        self.queue().free()
    }

    #[getter]
    fn capacity(&mut self) -> usize {
        self.queue().capacity()
    }

    fn __len__(&mut self) -> usize {
        self.used()
    }
}

#[pymodule]
fn coop_rtos(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyHeap>()?;
    m.add_class::<PyQueue>()?;
    m.add("ARENA_SIZE", ARENA_SIZE)?;
    Ok(())
}
