//! Object-start maps.
//!
//! One byte per card, holding the offset within the card of the first
//! object that begins there, or a sentinel when the card's first bytes
//! belong to an object that began in an earlier card. Card scanning
//! uses the map to find the object overlapping the start of a marked
//! card without walking the whole generation.

use crate::{
    cell::Cell,
    heap::cards::{CARD_BITS, CARD_SIZE},
};

/// Sentinel: no object starts inside this card.
pub const CARD_STARTS_INSIDE_OBJECT: u8 = 0xff;

pub struct ObjectStartMap
{
    pub start: Cell,
    offsets: Vec<u8>,
}

impl ObjectStartMap
{
    pub fn new(start: Cell, size: Cell) -> Self
    {
        Self{
            start,
            offsets: vec![CARD_STARTS_INSIDE_OBJECT; (size >> CARD_BITS) as usize],
        }
    }

    pub fn clear(&mut self)
    {
        self.offsets.fill(CARD_STARTS_INSIDE_OBJECT);
    }

    /// Cover `additional` more bytes of the region.
    pub fn grow(&mut self, additional: Cell)
    {
        let cards = (additional >> CARD_BITS) as usize;
        self.offsets
            .extend(std::iter::repeat(CARD_STARTS_INSIDE_OBJECT).take(cards));
    }

    fn card_of(&self, addr: Cell) -> usize
    {
        ((addr - self.start) >> CARD_BITS) as usize
    }

    /// Record that an object begins at `obj`, unless an earlier object
    /// already starts in the same card.
    pub fn record_object_start_offset(&mut self, obj: Cell)
    {
        let card = self.card_of(obj);
        let offset = (obj & (CARD_SIZE - 1)) as u8;
        if offset < self.offsets[card] {
            self.offsets[card] = offset;
        }
    }

    /// The first object whose extent overlaps card `card_index`
    /// (an index relative to this map's region). Scans backwards to
    /// the nearest card in which an object starts.
    pub fn find_object_containing_card(&self, card_index: Cell) -> Cell
    {
        let mut card = card_index as usize;
        loop {
            if self.offsets[card] != CARD_STARTS_INSIDE_OBJECT {
                return self.start
                    + ((card as Cell) << CARD_BITS)
                    + self.offsets[card] as Cell;
            }
            debug_assert!(card > 0, "no object start below card {card_index}");
            card -= 1;
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn earlier_start_in_card_wins()
    {
        let mut starts = ObjectStartMap::new(0x1000, 0x400);
        starts.record_object_start_offset(0x1030);
        starts.record_object_start_offset(0x1010);
        starts.record_object_start_offset(0x1020);
        assert_eq!(starts.find_object_containing_card(0), 0x1010);
    }

    #[test]
    fn sentinel_cards_defer_to_earlier_cards()
    {
        let mut starts = ObjectStartMap::new(0, 0x400);
        // One object starting at 0x10 spans several cards.
        starts.record_object_start_offset(0x10);
        assert_eq!(starts.find_object_containing_card(3), 0x10);
    }

    #[test]
    fn clear_forgets_recorded_starts()
    {
        let mut starts = ObjectStartMap::new(0, 0x400);
        starts.record_object_start_offset(0x85);
        starts.clear();
        starts.record_object_start_offset(0x90);
        assert_eq!(starts.find_object_containing_card(2), 0x90);
    }

    mod properties
    {
        use {super::super::*, proptest::prelude::*};

        proptest!
        {
            #[test]
            fn found_start_is_the_lowest_recorded_in_or_before_the_card(
                mut offsets in proptest::collection::vec(0u32..0x3f0, 1..24),
                card in 0u32..16,
            )
            {
                // Always give card 0 a start so the backward scan has
                // a floor.
                offsets.push(0);
                let mut starts = ObjectStartMap::new(0, 0x400);
                for &offset in &offsets {
                    starts.record_object_start_offset(offset & !0xf);
                }

                let found = starts.find_object_containing_card(card);
                let card_end = (card + 1) << CARD_BITS;
                prop_assert!(found < card_end);
                // It is a recorded start, and the greatest candidate:
                // the first object of the nearest populated card.
                prop_assert!(offsets.iter().any(|&o| o & !0xf == found));
                let found_card = found >> CARD_BITS;
                prop_assert!(
                    !offsets.iter().any(|&o| {
                        let o = o & !0xf;
                        o >> CARD_BITS > found_card && o < card_end
                            || o >> CARD_BITS == found_card && o < found
                    }),
                    "found is not the greatest candidate start"
                );
            }
        }
    }
}
