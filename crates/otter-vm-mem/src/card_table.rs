//! Card table for generational write barriers
//!
//! The covered heap range `[min_address, min_address + pool_size)` is split
//! into power-of-two cards; each card is one byte of barrier state. Mutators
//! mark cards concurrently (different cards never interfere). `initialize`,
//! `clear_all` and whole-table scans are expected to run at a safepoint.
//!
//! Card byte layout:
//!
//! ```text
//!   bit 7     bits 6..3    bit 2      bit 1   bit 0
//! +-------+-------------+-----------+-------+--------+
//! |  hot  |  hot value  | processed | young | marked |
//! +-------+-------------+-----------+-------+--------+
//! ```
//!
//! The hot value saturates between `MIN_HOT_VALUE` and `MAX_HOT_VALUE`.
//! The hot flag is independent of the value.

use std::fmt;
use std::ops::BitOr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::CardTableConfig;
use crate::error::{MemError, Result};

const MARKED_BIT: u8 = 1 << 0;
const YOUNG_BIT: u8 = 1 << 1;
const PROCESSED_BIT: u8 = 1 << 2;
const HOT_VALUE_SHIFT: u32 = 3;
const HOT_VALUE_MASK: u8 = 0b1111 << HOT_VALUE_SHIFT;
const HOT_FLAG_BIT: u8 = 1 << 7;

/// Lowest hot value
pub const MIN_HOT_VALUE: u8 = 0;
/// Highest hot value
pub const MAX_HOT_VALUE: u8 = 15;

/// Status bits decoded from a raw card value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus {
    /// Card was written since the last scan
    pub marked: bool,
    /// Card covers young-generation memory
    pub young: bool,
    /// Card was already handled by the current scan
    pub processed: bool,
}

/// Barrier state of one card.
#[repr(transparent)]
#[derive(Default)]
pub struct Card(AtomicU8);

impl Card {
    /// A clear card
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Raw card value
    #[inline]
    pub fn value(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn set_bits(&self, bits: u8) {
        self.0.fetch_or(bits, Ordering::Release);
    }

    #[inline]
    fn clear_bits(&self, bits: u8) {
        self.0.fetch_and(!bits, Ordering::Release);
    }

    /// Decode the status bits of `value`
    pub const fn get_status(value: u8) -> CardStatus {
        CardStatus {
            marked: value & MARKED_BIT != 0,
            young: value & YOUNG_BIT != 0,
            processed: value & PROCESSED_BIT != 0,
        }
    }

    /// Set the marked bit
    #[inline]
    pub fn mark(&self) {
        self.set_bits(MARKED_BIT);
    }

    /// Clear the marked bit
    #[inline]
    pub fn unmark(&self) {
        self.clear_bits(MARKED_BIT);
    }

    /// Marked bit
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.value() & MARKED_BIT != 0
    }

    /// Set the young bit
    #[inline]
    pub fn set_young(&self) {
        self.set_bits(YOUNG_BIT);
    }

    /// Young bit
    #[inline]
    pub fn is_young(&self) -> bool {
        self.value() & YOUNG_BIT != 0
    }

    /// Consume the mark: clears marked, sets processed
    pub fn set_processed(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Release, Ordering::Acquire, |v| {
                Some((v & !MARKED_BIT) | PROCESSED_BIT)
            });
    }

    /// Processed bit
    #[inline]
    pub fn is_processed(&self) -> bool {
        self.value() & PROCESSED_BIT != 0
    }

    /// Hot flag
    #[inline]
    pub fn is_hot(&self) -> bool {
        self.value() & HOT_FLAG_BIT != 0
    }

    /// Set the hot flag
    #[inline]
    pub fn set_hot(&self) {
        self.set_bits(HOT_FLAG_BIT);
    }

    /// Clear the hot flag; the hot value is kept
    #[inline]
    pub fn reset_hot(&self) {
        self.clear_bits(HOT_FLAG_BIT);
    }

    /// Current hot value
    #[inline]
    pub fn hot_value(&self) -> u8 {
        (self.value() & HOT_VALUE_MASK) >> HOT_VALUE_SHIFT
    }

    fn update_hot_value(&self, f: impl Fn(u8) -> u8) {
        let _ = self
            .0
            .fetch_update(Ordering::Release, Ordering::Acquire, |v| {
                let hot = f((v & HOT_VALUE_MASK) >> HOT_VALUE_SHIFT);
                Some((v & !HOT_VALUE_MASK) | (hot << HOT_VALUE_SHIFT))
            });
    }

    /// Raise the hot value, saturating at `MAX_HOT_VALUE`
    pub fn increment_hot_value(&self) {
        self.update_hot_value(|hot| (hot + 1).min(MAX_HOT_VALUE));
    }

    /// Lower the hot value, saturating at `MIN_HOT_VALUE`
    pub fn decrement_hot_value(&self) {
        self.update_hot_value(|hot| hot.saturating_sub(1).max(MIN_HOT_VALUE));
    }

    /// Hot value is at its floor
    #[inline]
    pub fn is_min_hot_value(&self) -> bool {
        self.hot_value() == MIN_HOT_VALUE
    }

    /// Hot value is at its ceiling
    #[inline]
    pub fn is_max_hot_value(&self) -> bool {
        self.hot_value() == MAX_HOT_VALUE
    }

    /// Zero status, hot value and hot flag
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// True if nothing is set
    #[inline]
    pub fn is_clear(&self) -> bool {
        self.value() == 0
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Card({:#010b})", self.value())
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRange {
    /// First address
    pub start: usize,
    /// One past the last address
    pub end: usize,
}

impl MemRange {
    /// Range `[start, end)`
    pub const fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Length in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// True if the range covers no bytes
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True if `addr` lies inside
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Which cards `CardTable::visit_marked` reports, and what it does to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitFlags(u8);

impl VisitFlags {
    /// Report marked cards
    pub const VISIT_MARKED: VisitFlags = VisitFlags(1 << 0);
    /// Report processed cards
    pub const VISIT_PROCESSED: VisitFlags = VisitFlags(1 << 1);
    /// Mark reported cards processed
    pub const SET_PROCESSED: VisitFlags = VisitFlags(1 << 2);

    /// True if every flag in `other` is set
    #[inline]
    pub const fn contains(self, other: VisitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for VisitFlags {
    type Output = VisitFlags;

    fn bitor(self, rhs: VisitFlags) -> VisitFlags {
        VisitFlags(self.0 | rhs.0)
    }
}

/// Card table covering one heap range.
pub struct CardTable {
    min_address: usize,
    pool_size: usize,
    card_bits: u32,
    cards_count: usize,
    cards: OnceLock<Box<[Card]>>,
}

impl CardTable {
    /// Describe a table over `[min_address, min_address + pool_size)`.
    ///
    /// Both bounds must be card aligned. No memory is committed until
    /// `initialize`.
    pub fn new(min_address: usize, pool_size: usize, card_bits: u32) -> Result<Self> {
        let card_size = 1usize.checked_shl(card_bits).unwrap_or(0);
        if card_size < 2 {
            return Err(MemError::InvalidCardSize(card_size));
        }
        let unaligned = MemError::UnalignedHeapRange {
            start: min_address,
            size: pool_size,
            card_size,
        };
        if pool_size == 0
            || min_address % card_size != 0
            || pool_size % card_size != 0
            || min_address.checked_add(pool_size).is_none()
        {
            return Err(unaligned);
        }

        Ok(Self {
            min_address,
            pool_size,
            card_bits,
            cards_count: pool_size >> card_bits,
            cards: OnceLock::new(),
        })
    }

    /// `new` with the card size taken from `config`
    pub fn with_config(
        min_address: usize,
        pool_size: usize,
        config: &CardTableConfig,
    ) -> Result<Self> {
        Self::new(min_address, pool_size, config.card_bits)
    }

    /// Commit the card array, all cards clear.
    ///
    /// # Panics
    /// If called more than once.
    pub fn initialize(&self) {
        let cards: Box<[Card]> = (0..self.cards_count).map(|_| Card::new()).collect();
        if self.cards.set(cards).is_err() {
            panic!("CardTable::initialize called twice");
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::mem",
            min_address = self.min_address,
            pool_size = self.pool_size,
            cards = self.cards_count,
            "Card table initialized"
        );
    }

    #[inline]
    fn cards(&self) -> &[Card] {
        match self.cards.get() {
            Some(cards) => cards,
            None => panic!("CardTable used before initialize"),
        }
    }

    /// First covered address
    #[inline]
    pub fn min_address(&self) -> usize {
        self.min_address
    }

    /// Bytes per card
    #[inline]
    pub fn card_size(&self) -> usize {
        1 << self.card_bits
    }

    /// Number of cards
    #[inline]
    pub fn cards_count(&self) -> usize {
        self.cards_count
    }

    /// Index of the card covering `addr`
    #[inline]
    pub fn card_index(&self, addr: usize) -> usize {
        debug_assert!(
            addr >= self.min_address && addr - self.min_address < self.pool_size,
            "address {addr:#x} outside card table range"
        );
        (addr - self.min_address) >> self.card_bits
    }

    /// Card covering `addr`
    #[inline]
    pub fn get_card_ptr(&self, addr: usize) -> &Card {
        &self.cards()[self.card_index(addr)]
    }

    /// Mark the card covering `addr`
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        self.get_card_ptr(addr).mark();
    }

    /// True if the card covering `addr` is marked
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.get_card_ptr(addr).is_marked()
    }

    fn index_of(&self, card: &Card) -> usize {
        let cards = self.cards();
        let offset = (std::ptr::from_ref(card) as usize)
            .wrapping_sub(cards.as_ptr() as usize)
            / std::mem::size_of::<Card>();
        assert!(offset < cards.len(), "card does not belong to this table");
        offset
    }

    /// First address covered by `card`
    pub fn get_card_start_address(&self, card: &Card) -> usize {
        self.min_address + (self.index_of(card) << self.card_bits)
    }

    /// Address range covered by `card`
    pub fn get_memory_range(&self, card: &Card) -> MemRange {
        let start = self.get_card_start_address(card);
        MemRange::new(start, start + self.card_size())
    }

    /// Every card in index order
    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards().iter()
    }

    /// Clear every card in one bulk store.
    ///
    /// Takes `&mut self`: no barrier may touch the table during the wipe.
    pub fn clear_all(&mut self) {
        let Some(cards) = self.cards.get_mut() else {
            panic!("CardTable used before initialize");
        };
        // SAFETY: Card is repr(transparent) over AtomicU8, which has the
        // layout of u8, and the exclusive borrow rules out concurrent access.
        unsafe { std::ptr::write_bytes(cards.as_mut_ptr().cast::<u8>(), 0, cards.len()) };
    }

    /// Cards overlapping `[begin, end)`
    fn cards_in(&self, begin: usize, end: usize) -> &[Card] {
        if begin >= end {
            return &[];
        }
        let first = self.card_index(begin);
        let last = self.card_index(end - 1);
        &self.cards()[first..=last]
    }

    /// Clear every card overlapping `[begin, end)`
    pub fn clear_card_range(&self, begin: usize, end: usize) {
        for card in self.cards_in(begin, end) {
            card.clear();
        }
    }

    /// Set the young bit on every card overlapping `range`
    pub fn mark_cards_as_young(&self, range: MemRange) {
        for card in self.cards_in(range.start, range.end) {
            card.set_young();
        }
    }

    /// Report runs of selected cards as coalesced address ranges.
    ///
    /// With `SET_PROCESSED`, each reported card's mark is consumed.
    pub fn visit_marked(&self, mut visitor: impl FnMut(MemRange), flags: VisitFlags) {
        let visit_marked = flags.contains(VisitFlags::VISIT_MARKED);
        let visit_processed = flags.contains(VisitFlags::VISIT_PROCESSED);
        let set_processed = flags.contains(VisitFlags::SET_PROCESSED);
        let card_size = self.card_size();

        let mut run: Option<MemRange> = None;
        for (index, card) in self.iter().enumerate() {
            let status = Card::get_status(card.value());
            let selected =
                (visit_marked && status.marked) || (visit_processed && status.processed);
            if !selected {
                if let Some(range) = run.take() {
                    visitor(range);
                }
                continue;
            }

            if set_processed {
                card.set_processed();
            }
            let start = self.min_address + (index << self.card_bits);
            run = match run {
                Some(range) => Some(MemRange::new(range.start, start + card_size)),
                None => Some(MemRange::new(start, start + card_size)),
            };
        }
        if let Some(range) = run {
            visitor(range);
        }
    }
}

impl<'a> IntoIterator for &'a CardTable {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
