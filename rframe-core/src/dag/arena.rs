// vim: tw=80
//! A generation-indexed arena
//!
//! Nodes of a DAG refer to each other by [`Idx`] rather than by pointer.  The
//! whole arena is freed at once by [`Arena::clear`], which also invalidates
//! every index handed out so far.

use std::ops::{Index, IndexMut};

/// Handle to an item in an [`Arena`]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Idx {
    index: u32,
    generation: u32,
}

impl Idx {
    /// Position of the item within its arena
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
pub struct Arena<T> {
    items: Vec<T>,
    generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena{items: Vec::new(), generation: 0}
    }
}

impl<T> Arena<T> {
    /// Free every item, and invalidate all outstanding indices
    pub fn clear(&mut self) {
        self.items.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn get(&self, idx: Idx) -> Option<&T> {
        if idx.generation == self.generation {
            self.items.get(idx.index())
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, idx: Idx) -> Option<&mut T> {
        if idx.generation == self.generation {
            self.items.get_mut(idx.index())
        } else {
            None
        }
    }

    /// # Panics
    ///
    /// If the arena already holds `u32::MAX` items.
    pub fn insert(&mut self, item: T) -> Idx {
        let index = u32::try_from(self.items.len())
            .expect("Arena overflow");
        self.items.push(item);
        Idx{index, generation: self.generation}
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over live items along with their indices
    pub fn iter(&self) -> impl Iterator<Item=(Idx, &T)> {
        let generation = self.generation;
        self.items.iter()
            .enumerate()
            .map(move |(i, item)| (Idx{index: i as u32, generation}, item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// # Panics
///
/// If `idx` was handed out before the last [`Arena::clear`].  Use
/// [`Arena::get`] where that can happen.
impl<T> Index<Idx> for Arena<T> {
    type Output = T;

    fn index(&self, idx: Idx) -> &T {
        self.get(idx).expect("Stale arena index")
    }
}

/// # Panics
///
/// Like [`Index`], on a stale index.
impl<T> IndexMut<Idx> for Arena<T> {
    fn index_mut(&mut self, idx: Idx) -> &mut T {
        self.get_mut(idx).expect("Stale arena index")
    }
}

// LCOV_EXCL_STOP
