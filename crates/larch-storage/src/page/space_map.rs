//! Space map pages.
//!
//! A space map page is a bitmap over the page numbers of its container:
//! bit set means allocated. One space map page covers
//! `(page_size - header) * 8` pages, which bounds the container size;
//! Larch containers keep their single space map at page 1.

use larch_common::constants::PAGE_HEADER_SIZE;

use super::Page;

/// View over a page interpreted as a space allocation bitmap.
pub struct SpaceMapPage<'a> {
    page: &'a mut Page,
}

impl<'a> SpaceMapPage<'a> {
    /// Wraps a page.
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    /// Number of pages this bitmap covers.
    pub fn capacity(&self) -> u32 {
        ((self.page.size() - PAGE_HEADER_SIZE) * 8) as u32
    }

    /// Returns whether `page_no` is marked allocated.
    pub fn is_allocated(&self, page_no: u32) -> bool {
        debug_assert!(page_no < self.capacity());
        let byte = PAGE_HEADER_SIZE + (page_no / 8) as usize;
        let bit = page_no % 8;
        self.page.bytes()[byte] & (1 << bit) != 0
    }

    /// Marks `page_no` allocated or free.
    pub fn set_allocated(&mut self, page_no: u32, allocated: bool) {
        debug_assert!(page_no < self.capacity());
        let byte = PAGE_HEADER_SIZE + (page_no / 8) as usize;
        let bit = page_no % 8;
        if allocated {
            self.page.bytes_mut()[byte] |= 1 << bit;
        } else {
            self.page.bytes_mut()[byte] &= !(1 << bit);
        }
    }

    /// Finds the first free page number at or after `from`.
    pub fn first_free(&self, from: u32) -> Option<u32> {
        (from..self.capacity()).find(|p| !self.is_allocated(*p))
    }
}
