// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Node, PageCache};
use crate::{branch::Branch, key::InternalKey, page::Page, Lsn, Record, UserKey, ValueKind};
use std::ops::Bound;
use std::sync::Arc;

/// Maps user-key range bounds onto the memory index's internal-key space
/// so that a skiplist range covers exactly the wanted keys with all their
/// versions.
#[must_use]
pub fn memindex_bounds(
    lo: Bound<&UserKey>,
    hi: Bound<&UserKey>,
) -> (Bound<InternalKey>, Bound<InternalKey>) {
    let lo = match lo {
        Bound::Unbounded => Bound::Unbounded,
        // the smallest entry of a key is its chain head (highest LSN)
        Bound::Included(key) => Bound::Included(InternalKey::new(
            key.clone(),
            Lsn::MAX,
            ValueKind::Value,
        )),
        // the largest entry of a key carries LSN 0
        Bound::Excluded(key) => {
            Bound::Excluded(InternalKey::new(key.clone(), 0, ValueKind::Value))
        }
    };

    let hi = match hi {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(key) => {
            Bound::Included(InternalKey::new(key.clone(), 0, ValueKind::Value))
        }
        Bound::Excluded(key) => Bound::Excluded(InternalKey::new(
            key.clone(),
            Lsn::MAX,
            ValueKind::Value,
        )),
    };

    (lo, hi)
}

/// Lazily pages through one branch, yielding records within user-key
/// bounds
///
/// Positioning binary-searches the branch trailer and then the landing
/// page; pages are only loaded on demand through the shared cache, so a
/// cursor touching three keys loads one page, not the branch.
pub struct BranchRangeIter {
    node: Arc<Node>,
    branch: Arc<Branch>,
    cache: Arc<PageCache>,

    lo: Bound<UserKey>,
    hi: Bound<UserKey>,

    /// `cum[i]` = number of records in pages `0..i`
    cum: Vec<u64>,

    /// Absolute record window `[front_abs, back_abs)`
    front_abs: u64,
    back_abs: u64,

    initialized_front: bool,
    initialized_back: bool,

    front_page: Option<(usize, Page)>,
    back_page: Option<(usize, Page)>,
}

impl BranchRangeIter {
    #[must_use]
    pub fn new(
        node: Arc<Node>,
        branch: Arc<Branch>,
        cache: Arc<PageCache>,
        lo: Bound<UserKey>,
        hi: Bound<UserKey>,
    ) -> Self {
        let mut cum = Vec::with_capacity(branch.pages.len() + 1);
        cum.push(0);

        for page in &branch.pages {
            #[allow(clippy::expect_used)]
            let prev = *cum.last().expect("cum is non-empty");
            cum.push(prev + u64::from(page.item_count));
        }

        #[allow(clippy::expect_used)]
        let total = *cum.last().expect("cum is non-empty");

        Self {
            node,
            branch,
            cache,
            lo,
            hi,
            cum,
            front_abs: 0,
            back_abs: total,
            initialized_front: false,
            initialized_back: false,
            front_page: None,
            back_page: None,
        }
    }

    fn total(&self) -> u64 {
        #[allow(clippy::expect_used)]
        *self.cum.last().expect("cum is non-empty")
    }

    fn load_page(&self, idx: usize) -> crate::Result<Page> {
        self.node.read_page(&self.branch, idx, &self.cache)
    }

    /// Resolves the lower bound into an absolute record index.
    fn init_front(&mut self) -> crate::Result<()> {
        self.initialized_front = true;

        let (key, excluded) = match &self.lo {
            Bound::Unbounded => return Ok(()),
            Bound::Included(key) => (key.clone(), false),
            Bound::Excluded(key) => (key.clone(), true),
        };

        let page_idx = self.branch.lower_page(&key);

        if page_idx >= self.branch.pages.len() {
            self.front_abs = self.total();
            return Ok(());
        }

        let page = self.load_page(page_idx)?;

        let in_page = if excluded {
            page.upper_bound(&key)
        } else {
            page.lower_bound(&key, Lsn::MAX)
        };

        #[allow(clippy::indexing_slicing)]
        {
            self.front_abs = self.cum[page_idx] + in_page as u64;
        }

        self.front_page = Some((page_idx, page));
        Ok(())
    }

    /// Resolves the upper bound into an absolute record index.
    fn init_back(&mut self) -> crate::Result<()> {
        self.initialized_back = true;

        let (key, excluded) = match &self.hi {
            Bound::Unbounded => return Ok(()),
            Bound::Included(key) => (key.clone(), false),
            Bound::Excluded(key) => (key.clone(), true),
        };

        let page_idx = self.branch.upper_page(&key);

        if page_idx == 0 {
            self.back_abs = 0;
            return Ok(());
        }

        let page_idx = page_idx - 1;
        let page = self.load_page(page_idx)?;

        let in_page = if excluded {
            page.lower_bound(&key, Lsn::MAX)
        } else {
            page.upper_bound(&key)
        };

        #[allow(clippy::indexing_slicing)]
        {
            self.back_abs = self.cum[page_idx] + in_page as u64;
        }

        self.back_page = Some((page_idx, page));
        Ok(())
    }

    /// Page index containing the absolute record index.
    fn page_of(&self, abs: u64) -> usize {
        #[allow(clippy::indexing_slicing)]
        let idx = self
            .cum
            .partition_point(|count| *count <= abs)
            .saturating_sub(1);

        idx
    }
}

impl Iterator for BranchRangeIter {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized_front {
            fail_iter!(self.init_front());
        }
        if !self.initialized_back {
            fail_iter!(self.init_back());
        }

        if self.front_abs >= self.back_abs {
            return None;
        }

        let page_idx = self.page_of(self.front_abs);

        let cached = match &self.front_page {
            Some((idx, page)) if *idx == page_idx => page.clone(),
            _ => {
                let page = fail_iter!(self.load_page(page_idx));
                self.front_page = Some((page_idx, page.clone()));
                page
            }
        };

        #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
        let in_page = (self.front_abs - self.cum[page_idx]) as usize;

        self.front_abs += 1;
        Some(Ok(cached.get(in_page)))
    }
}

impl DoubleEndedIterator for BranchRangeIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if !self.initialized_front {
            fail_iter!(self.init_front());
        }
        if !self.initialized_back {
            fail_iter!(self.init_back());
        }

        if self.front_abs >= self.back_abs {
            return None;
        }

        self.back_abs -= 1;
        let page_idx = self.page_of(self.back_abs);

        let cached = match &self.back_page {
            Some((idx, page)) if *idx == page_idx => page.clone(),
            _ => {
                let page = fail_iter!(self.load_page(page_idx));
                self.back_page = Some((page_idx, page.clone()));
                page
            }
        };

        #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
        let in_page = (self.back_abs - self.cum[page_idx]) as usize;

        Some(Ok(cached.get(in_page)))
    }
}
