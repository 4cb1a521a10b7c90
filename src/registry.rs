// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The async registry (component R): a singly-linked list of loaded-image
//! records with a single writer and lock-free readers.
//!
//! This is a poor-man's epoch reclaimer, not a general-purpose concurrent
//! list: there is exactly one mutator path (image-load/unload callbacks,
//! which run outside signal context and may spin), and the only thing a
//! reader is ever allowed to do is walk `next` pointers and bump a
//! refcount. A remover splices its node out with a release store — making
//! it unreachable from `head` — and only then spins until the refcount
//! drains to zero before freeing it. Readers therefore never observe a
//! dangling pointer: by the time a node is freed, no reader holds a
//! reference to it, and no new reader can acquire one because the node is
//! no longer reachable from `head`.
//!
//! See `update_metadata`/`update_config` in the originating crash handler
//! for the same swap-based ownership-transfer idiom applied to a single
//! pointer instead of a list.

use portable_atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};
use std::ptr;

use crate::image::ImageRecord;

struct Node {
    data: ImageRecord,
    next: AtomicPtr<Node>,
}

/// Process-wide singleton registry of loaded-image records.
pub struct Registry {
    head: AtomicPtr<Node>,
    write_lock: AtomicBool,
    refcount: AtomicIsize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
            write_lock: AtomicBool::new(false),
            refcount: AtomicIsize::new(0),
        }
    }

    fn lock(&self) {
        while self
            .write_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.write_lock.store(false, Ordering::Release);
    }

    /// Writer-only, not async-safe: appends a new image record to the list.
    pub fn append(&self, record: ImageRecord) {
        let node = Box::into_raw(Box::new(Node {
            data: record,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        self.lock();
        let mut tail = self.head.load(Ordering::Relaxed);
        if tail.is_null() {
            // Publish as head. Release ensures a concurrent acquire-load of
            // `head` sees a fully constructed node.
            self.head.store(node, Ordering::Release);
        } else {
            // SAFETY: `tail` is non-null and was published by a prior append
            // under this same writer lock; only the writer (us, holding the
            // lock) ever mutates `next`, so walking it here is race-free.
            loop {
                let next = unsafe { &(*tail).next };
                let n = next.load(Ordering::Relaxed);
                if n.is_null() {
                    next.store(node, Ordering::Release);
                    break;
                }
                tail = n;
            }
        }
        self.unlock();
    }

    /// Writer-only, not async-safe: removes the image record matching
    /// `header_addr`, if any, and frees it once all readers have drained.
    /// Returns whether a matching record was found.
    pub fn remove(&self, header_addr: u64) -> bool {
        self.lock();

        let mut prev: *mut Node = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: `cur` was published by a prior append and is reachable
            // from `head`; we hold the write lock so no concurrent writer
            // can mutate the chain underneath us.
            let node = unsafe { &*cur };
            if node.data.header_addr == header_addr {
                let next = node.next.load(Ordering::Relaxed);
                if prev.is_null() {
                    self.head.store(next, Ordering::Release);
                } else {
                    // SAFETY: `prev` is a live node still owned by this list.
                    unsafe { &*prev }.next.store(next, Ordering::Release);
                }

                // The node is now unreachable from `head`; any reader that
                // already holds a pointer to it got it before this point and
                // is reflected in `refcount`. Spin until they're done.
                while self.refcount.load(Ordering::Acquire) > 0 {
                    core::hint::spin_loop();
                }

                // SAFETY: unreachable, and no reader references it (refcount
                // drained above), so we have sole ownership again.
                drop(unsafe { Box::from_raw(cur) });
                self.unlock();
                return true;
            }
            prev = cur;
            cur = node.next.load(Ordering::Relaxed);
        }

        self.unlock();
        false
    }

    /// Async-safe: begin a read-side critical section. Must be paired with
    /// [`Registry::end_read`]. Prefer [`Registry::read`] which pairs these
    /// automatically via RAII.
    fn begin_read(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn end_read(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Async-safe: returns a guard that allows lock-free iteration over the
    /// current image records. Holding the guard prevents any concurrently
    /// spliced-out node from being freed.
    pub fn read(&self) -> ReadGuard<'_> {
        self.begin_read();
        ReadGuard { registry: self }
    }

    /// Async-safe: linear scan returning the first image whose text range
    /// contains `addr`. Includes the x86_64 fast-reject for addresses that
    /// cannot possibly be valid.
    pub fn image_containing_address(&self, addr: u64) -> Option<ImageRecord> {
        if !crate::image::is_plausible_code_address(addr) {
            return None;
        }
        let guard = self.read();
        guard
            .iter()
            .find(|img| img.text_range.contains(addr))
            .cloned()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.read().iter().count()
    }
}

/// RAII guard pairing [`Registry::begin_read`]/[`Registry::end_read`].
/// Async-safe to construct, hold, and drop.
pub struct ReadGuard<'a> {
    registry: &'a Registry,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_read();
    }
}

impl<'a> ReadGuard<'a> {
    /// Lock-free traversal of the current image chain, starting at `head`
    /// (acquire-loaded) and following `next` (acquire-loaded) until null.
    pub fn iter(&self) -> RegistryIter<'a> {
        RegistryIter {
            next: self.registry.head.load(Ordering::Acquire),
            _guard: std::marker::PhantomData,
        }
    }
}

pub struct RegistryIter<'a> {
    next: *mut Node,
    _guard: std::marker::PhantomData<&'a Registry>,
}

impl<'a> Iterator for RegistryIter<'a> {
    type Item = &'a ImageRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: the caller holds a `ReadGuard`, which keeps `refcount` > 0
        // for as long as any node reachable at guard-creation time might
        // still be in use; a writer will not free a node while refcount is
        // nonzero. `next` was acquire-loaded, pairing with the remover's
        // release store, so we observe a fully linked chain.
        let node = unsafe { &*self.next };
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageRecordBuilder;

    fn image(header_addr: u64) -> ImageRecord {
        ImageRecordBuilder::new(header_addr, 0, true).build()
    }

    #[test]
    fn append_and_iterate() {
        let reg = Registry::new();
        reg.append(image(1));
        reg.append(image(2));
        reg.append(image(3));
        let seen: Vec<u64> = reg.read().iter().map(|i| i.header_addr).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn remove_head_middle_tail() {
        let reg = Registry::new();
        reg.append(image(1));
        reg.append(image(2));
        reg.append(image(3));

        assert!(reg.remove(2));
        let seen: Vec<u64> = reg.read().iter().map(|i| i.header_addr).collect();
        assert_eq!(seen, vec![1, 3]);

        assert!(reg.remove(1));
        let seen: Vec<u64> = reg.read().iter().map(|i| i.header_addr).collect();
        assert_eq!(seen, vec![3]);

        assert!(reg.remove(3));
        assert_eq!(reg.len(), 0);

        assert!(!reg.remove(99));
    }

    #[test]
    fn image_containing_address_fast_rejects_low_addresses() {
        let reg = Registry::new();
        let mut img = image(0x1000);
        img.text_range = crate::image::Range::new(0x1000, 0x100);
        reg.append(img);

        assert!(reg.image_containing_address(0x1050).is_some());
        assert!(reg.image_containing_address(0x50).is_none());
    }

    #[test]
    fn reader_survives_concurrent_writer_remove() {
        use std::sync::Arc;
        use std::thread;

        let reg = Arc::new(Registry::new());
        for i in 0..64 {
            reg.append(image(i));
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let guard = reg.read();
                    let count = guard.iter().count();
                    assert!(count <= 64);
                }
            }));
        }

        for i in 0..64 {
            reg.remove(i);
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 0);
    }
}
