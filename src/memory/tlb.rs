// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the sechellia project.

//! Translation lookaside buffer
//!
//! The execution engine's cache of completed fills. Entries are keyed by
//! `(asid, vmid, virtual page number)`; leaves carrying the global bit live
//! in an ASID-agnostic map.

use std::cell::RefCell;

use rustc_hash::FxHashMap;
use uluru::LRUCache;

use crate::memory::{Prot, PAGE_SHIFT};

#[derive(Copy, Clone, Debug)]
pub struct TlbEntry {
    /// Host-physical page frame number.
    pub ppn: u64,
    /// Intersection of translation and PMP permissions.
    pub prot: Prot,
    /// Natural size of the underlying mapping, after the PMP cap.
    pub page_size: u64,
}

type Key = (u16, u16, u64);
type GlobalKey = (u16, u64);

struct TlbInner {
    map: FxHashMap<Key, TlbEntry>,
    lru: LRUCache<Key, 2048>,
    global_map: FxHashMap<GlobalKey, TlbEntry>,
    global_lru: LRUCache<GlobalKey, 1024>,
}

/// Translation lookaside buffer
pub struct Tlb {
    inner: RefCell<TlbInner>,
}

impl Tlb {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            inner: TlbInner {
                map: FxHashMap::default(),
                lru: LRUCache::default(),
                global_map: FxHashMap::default(),
                global_lru: LRUCache::default(),
            }
            .into(),
        }
    }

    /// Look up the page containing `vaddr`.
    pub fn get(&self, asid: u16, vmid: u16, vaddr: u64) -> Option<TlbEntry> {
        let vpn = vaddr >> PAGE_SHIFT;
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.global_map.get(&(vmid, vpn)).copied() {
            inner.global_lru.touch(|a| a == &(vmid, vpn));
            return Some(entry);
        }
        let key = (asid, vmid, vpn);
        if let Some(entry) = inner.map.get(&key).copied() {
            inner.lru.touch(|a| a == &key);
            return Some(entry);
        }
        None
    }

    /// Install a translation for the page containing `vaddr`.
    pub fn insert(&self, is_global: bool, asid: u16, vmid: u16, vaddr: u64, entry: TlbEntry) {
        let vpn = vaddr >> PAGE_SHIFT;
        let mut inner = self.inner.borrow_mut();
        if is_global {
            if let Some(to_remove) = inner.global_lru.insert((vmid, vpn)) {
                inner.global_map.remove(&to_remove);
            }
            inner.global_map.insert((vmid, vpn), entry);
        } else {
            let key = (asid, vmid, vpn);
            if let Some(to_remove) = inner.lru.insert(key) {
                inner.map.remove(&to_remove);
            }
            inner.map.insert(key, entry);
        }
    }

    /// Drop every entry for the page containing `vaddr` (`SFENCE.VMA` with an
    /// address operand).
    pub fn flush_page(&self, vaddr: u64) {
        let vpn = vaddr >> PAGE_SHIFT;
        let mut inner = self.inner.borrow_mut();
        inner.map.retain(|(_, _, k), _| *k != vpn);
        inner.global_map.retain(|(_, k), _| *k != vpn);
    }

    /// Drop every non-global entry for `asid`.
    pub fn flush_asid(&self, asid: u16) {
        let mut inner = self.inner.borrow_mut();
        inner.map.retain(|(a, _, _), _| *a != asid);
    }

    /// Clear buffer
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.map.clear();
        inner.lru.clear();
        inner.global_map.clear();
        inner.global_lru.clear();
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}
