//! Paged guest memory with dirty-page tracking.
//!
//! Page contents are opaque 32-bit words standing in for a 4 KiB page. Every
//! mutation and every dirty-set snapshot goes through one short critical
//! section, so `snapshot_and_clear` observes a write either entirely or not at
//! all and no dirty mark is ever dropped between rounds.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub const PAGE_SIZE_BYTES: u64 = 4096;

const WORD_BITS: usize = 64;

/// Number of 4 KiB pages backing `memory_mb` megabytes.
pub fn pages_for(memory_mb: u64) -> usize {
    (memory_mb * 1024 * 1024 / PAGE_SIZE_BYTES) as usize
}

/// Fixed-size page bitmap used for dirty tracking and transfer sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtySet {
    words: Vec<u64>,
    page_count: usize,
}

impl DirtySet {
    pub fn empty(page_count: usize) -> Self {
        Self {
            words: vec![0; page_count.div_ceil(WORD_BITS)],
            page_count,
        }
    }

    /// Every page in `0..page_count`.
    pub fn full(page_count: usize) -> Self {
        let mut set = Self {
            words: vec![u64::MAX; page_count.div_ceil(WORD_BITS)],
            page_count,
        };
        let tail = page_count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = set.words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        set
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn insert(&mut self, index: usize) -> bool {
        self.check(index);
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        let was_set = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was_set
    }

    pub fn remove(&mut self, index: usize) -> bool {
        self.check(index);
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        let was_set = self.words[word] & (1 << bit) != 0;
        self.words[word] &= !(1 << bit);
        was_set
    }

    pub fn contains(&self, index: usize) -> bool {
        self.check(index);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn union_with(&mut self, other: &DirtySet) {
        assert_eq!(
            self.page_count, other.page_count,
            "cannot union page sets of different sizes"
        );
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= *src;
        }
    }

    pub fn iter(&self) -> DirtyPages<'_> {
        DirtyPages {
            words: &self.words,
            word_index: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.page_count,
            "page index {} out of range (0..{})",
            index,
            self.page_count
        );
    }
}

/// Ascending iterator over the pages of a [`DirtySet`].
pub struct DirtyPages<'a> {
    words: &'a [u64],
    word_index: usize,
    current: u64,
}

impl Iterator for DirtyPages<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_index * WORD_BITS + bit);
            }
            self.word_index += 1;
            self.current = *self.words.get(self.word_index)?;
        }
    }
}

#[derive(Debug)]
struct MemoryInner {
    pages: Vec<u32>,
    dirty: DirtySet,
    frozen: bool,
    // Pages a post-copy destination still expects from its source.
    pending: Option<DirtySet>,
    demand_faults: u64,
}

#[derive(Debug)]
pub struct PagedMemory {
    total_pages: usize,
    inner: Mutex<MemoryInner>,
}

impl PagedMemory {
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            inner: Mutex::new(MemoryInner {
                pages: vec![0; total_pages],
                dirty: DirtySet::empty(total_pages),
                frozen: false,
                pending: None,
                demand_faults: 0,
            }),
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.total_pages,
            "page index {} out of range (0..{})",
            index,
            self.total_pages
        );
    }

    /// Store `value` in page `index` and mark it dirty.
    ///
    /// Returns `false` once the region has been frozen for stop-and-copy.
    pub fn write(&self, index: usize, value: u32) -> bool {
        self.check(index);
        let mut inner = self.lock();
        Self::apply_write(&mut inner, index, value)
    }

    /// Apply a whole workload tick under a single lock acquisition.
    pub fn write_batch(&self, writes: &[(usize, u32)]) -> usize {
        for &(index, _) in writes {
            self.check(index);
        }
        let mut inner = self.lock();
        writes
            .iter()
            .filter(|&&(index, value)| Self::apply_write(&mut inner, index, value))
            .count()
    }

    fn apply_write(inner: &mut MemoryInner, index: usize, value: u32) -> bool {
        if inner.frozen {
            return false;
        }
        if let Some(pending) = inner.pending.as_mut() {
            if pending.remove(index) {
                inner.demand_faults += 1;
            }
        }
        inner.pages[index] = value;
        inner.dirty.insert(index);
        true
    }

    pub fn read_page(&self, index: usize) -> u32 {
        self.check(index);
        self.lock().pages[index]
    }

    /// Atomically take the dirty set and leave an empty one behind.
    pub fn snapshot_and_clear(&self) -> DirtySet {
        let mut inner = self.lock();
        std::mem::replace(&mut inner.dirty, DirtySet::empty(self.total_pages))
    }

    /// Freeze the region and take the final dirty set in one critical section.
    ///
    /// No write is accepted after this returns, so the snapshot is the last
    /// delta the region will ever produce.
    pub fn freeze_and_snapshot(&self) -> DirtySet {
        let mut inner = self.lock();
        inner.frozen = true;
        std::mem::replace(&mut inner.dirty, DirtySet::empty(self.total_pages))
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Copy the selected pages into `dest` without marking them dirty there.
    ///
    /// Source values are read under the source lock, then installed under the
    /// destination lock; the two locks are never held together.
    pub fn copy_pages_to(&self, dest: &PagedMemory, pages: &DirtySet) -> usize {
        assert_eq!(
            self.total_pages, dest.total_pages,
            "source and destination regions differ in size"
        );
        let values: Vec<(usize, u32)> = {
            let inner = self.lock();
            pages.iter().map(|index| (index, inner.pages[index])).collect()
        };
        dest.install_pages(&values);
        values.len()
    }

    /// Read several pages under one lock acquisition.
    pub fn read_pages(&self, indices: &[usize]) -> Vec<(usize, u32)> {
        for &index in indices {
            self.check(index);
        }
        let inner = self.lock();
        indices
            .iter()
            .map(|&index| (index, inner.pages[index]))
            .collect()
    }

    /// Store incoming page contents as transferred data (no dirty mark).
    pub fn install_pages(&self, values: &[(usize, u32)]) {
        let mut inner = self.lock();
        for &(index, value) in values {
            inner.pages[index] = value;
        }
    }

    /// Pages whose content is non-zero. A freshly reserved region is all
    /// zeroes, so only these need to travel.
    pub fn non_zero_pages(&self) -> DirtySet {
        let inner = self.lock();
        let mut set = DirtySet::empty(self.total_pages);
        for (index, &value) in inner.pages.iter().enumerate() {
            if value != 0 {
                set.insert(index);
            }
        }
        set
    }

    /// Mark `pages` as not yet resident; local writes to them count as demand
    /// faults and make them resident with the written value.
    pub fn begin_pending(&self, pages: DirtySet) {
        assert_eq!(pages.page_count(), self.total_pages);
        self.lock().pending = Some(pages);
    }

    /// Up to `max` page indices still awaiting transfer, lowest first.
    pub fn next_pending_batch(&self, max: usize) -> Vec<usize> {
        let inner = self.lock();
        match inner.pending.as_ref() {
            Some(pending) => pending.iter().take(max).collect(),
            None => Vec::new(),
        }
    }

    /// Install pushed pages that are still pending; pages already made
    /// resident by a local write keep their newer content.
    pub fn install_pending(&self, values: &[(usize, u32)]) -> usize {
        let mut inner = self.lock();
        let mut installed = 0;
        for &(index, value) in values {
            let still_pending = inner
                .pending
                .as_mut()
                .is_some_and(|pending| pending.remove(index));
            if still_pending {
                inner.pages[index] = value;
                installed += 1;
            }
        }
        if inner.pending.as_ref().is_some_and(DirtySet::is_empty) {
            inner.pending = None;
        }
        installed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.as_ref().map_or(0, DirtySet::count)
    }

    pub fn demand_faults(&self) -> u64 {
        self.lock().demand_faults
    }

    pub fn contents(&self) -> Vec<u32> {
        self.lock().pages.clone()
    }
}
