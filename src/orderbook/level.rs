//! Price levels and the per-side level collection.
//!
//! [`LevelCollection`] is generic over the level type ([`PriceKeyed`]) and the
//! side ordering ([`Orderable`]). The ordering picks the `BTreeMap` key so that
//! plain forward iteration is always best-price-first:
//!
//! - [`Ascending`] keys by `Price` (asks, lowest first)
//! - [`Descending`] keys by `Reverse<Price>` (bids, highest first)
//!
//! Lookups, inserts and removals are O(log n); the best level is the first
//! map entry.

use std::cmp::Reverse;
use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt::Debug;
use std::marker::PhantomData;

use serde::Serialize;

use crate::error::Error;
use crate::types::{Price, Sequence, Size};

/// Anything stored in a level collection, keyed by its price.
pub trait PriceKeyed {
    /// Key of the level
    fn price(&self) -> Price;

    /// Aggregate size at the level
    fn size(&self) -> Size;

    /// Replace size and sequence stamp in place
    fn set_size(&mut self, size: Size, sequence: Option<Sequence>);
}

/// Ordering of one book side.
pub trait Orderable {
    /// Map key whose natural order is best-first for this side
    type Key: Ord + Copy + Debug;

    /// Key for a price
    fn key(price: Price) -> Self::Key;
}

/// Lowest price first (asks)
#[derive(Debug, Clone, Copy, Default)]
pub struct Ascending;

/// Highest price first (bids)
#[derive(Debug, Clone, Copy, Default)]
pub struct Descending;

impl Orderable for Ascending {
    type Key = Price;

    #[inline]
    fn key(price: Price) -> Price {
        price
    }
}

impl Orderable for Descending {
    type Key = Reverse<Price>;

    #[inline]
    fn key(price: Price) -> Reverse<Price> {
        Reverse(price)
    }
}

/// Aggregate size resting at one price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    /// Level price
    pub price: Price,
    /// Aggregate size, never zero inside a collection
    pub size: Size,
    /// Sequence of the diff or snapshot that last set this level
    pub sequence: Option<Sequence>,
}

impl PriceLevel {
    /// Create a level
    pub fn new(price: Price, size: Size) -> Self {
        Self {
            price,
            size,
            sequence: None,
        }
    }

    /// Stamp the level with a sequence
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl PriceKeyed for PriceLevel {
    fn price(&self) -> Price {
        self.price
    }

    fn size(&self) -> Size {
        self.size
    }

    fn set_size(&mut self, size: Size, sequence: Option<Sequence>) {
        self.size = size;
        if sequence.is_some() {
            self.sequence = sequence;
        }
    }
}

/// What a keyed write did to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    /// A new level was inserted
    Inserted,
    /// An existing level's size changed in place
    Updated,
    /// A level was removed
    Removed,
    /// Nothing changed (removal of an absent level)
    Unchanged,
}

/// One side of a book: levels unique by price, iterated best-first.
#[derive(Debug, Clone)]
pub struct LevelCollection<L, O: Orderable> {
    levels: BTreeMap<O::Key, L>,
    _order: PhantomData<O>,
}

impl<L, O: Orderable> Default for LevelCollection<L, O> {
    fn default() -> Self {
        Self {
            levels: BTreeMap::new(),
            _order: PhantomData,
        }
    }
}

impl<L: PriceKeyed, O: Orderable> LevelCollection<L, O> {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`] if a level already exists at that price.
    pub fn insert(&mut self, level: L) -> Result<(), Error> {
        let price = level.price();
        match self.levels.entry(O::key(price)) {
            Entry::Occupied(_) => Err(Error::DuplicateKey { price }),
            Entry::Vacant(slot) => {
                slot.insert(level);
                Ok(())
            }
        }
    }

    /// Change the size of an existing level without replacing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingKey`] if no level exists at that price.
    pub fn update(
        &mut self,
        price: Price,
        size: Size,
        sequence: Option<Sequence>,
    ) -> Result<(), Error> {
        let level = self
            .levels
            .get_mut(&O::key(price))
            .ok_or(Error::MissingKey { price })?;
        level.set_size(size, sequence);
        Ok(())
    }

    /// Remove the level at `price`; absent levels are a no-op
    pub fn remove(&mut self, price: Price) -> Option<L> {
        self.levels.remove(&O::key(price))
    }

    /// Level at `price`
    pub fn get(&self, price: Price) -> Option<&L> {
        self.levels.get(&O::key(price))
    }

    /// Whether a level exists at `price`
    pub fn contains(&self, price: Price) -> bool {
        self.levels.contains_key(&O::key(price))
    }

    /// Best level (lowest ask / highest bid)
    pub fn best(&self) -> Option<&L> {
        self.levels.values().next()
    }

    /// Levels best-first
    pub fn iter(&self) -> impl Iterator<Item = &L> + '_ {
        self.levels.values()
    }

    /// Top `n` levels, best first
    pub fn top(&self, n: usize) -> impl Iterator<Item = &L> + '_ {
        self.levels.values().take(n)
    }

    /// Sum of all level sizes
    pub fn total_size(&self) -> Size {
        self.levels.values().map(PriceKeyed::size).sum()
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the side holds no levels
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Drop every level
    pub fn clear(&mut self) {
        self.levels.clear();
    }
}
