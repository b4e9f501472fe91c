use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

// Aggregated depth for one option, prices in ticks (see Normaliser)
#[derive(Debug, Clone, Default)]
pub struct ExternalBook {
    // price -> size (aggregate)
    bids: BTreeMap<i64, u64>, // highest price = best bid
    asks: BTreeMap<i64, u64>, // lowest price  = best ask
}

impl ExternalBook {
    pub fn new() -> Self {
        Self::default()
    }

    // Replace the whole book with a fresh snapshot
    #[cfg(test)]
    pub fn apply_snapshot(&mut self, bids: &[(i64, u64)], asks: &[(i64, u64)]) {
        self.replace_side(BookSide::Bid, bids);
        self.replace_side(BookSide::Ask, asks);
    }

    /// Book messages may carry only one side; the other keeps its levels.
    /// Zero-size levels are not kept.
    pub fn replace_side(&mut self, side: BookSide, levels: &[(i64, u64)]) {
        let book = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        book.clear();
        for &(p, s) in levels {
            if s > 0 {
                *book.entry(p).or_insert(0) += s;
            }
        }
    }

    pub fn bbo(&self) -> (Option<(i64, u64)>, Option<(i64, u64)>) {
        let best_bid = self.bids.iter().next_back().map(|(p, s)| (*p, *s));
        let best_ask = self.asks.iter().next().map(|(p, s)| (*p, *s));
        (best_bid, best_ask)
    }

    pub fn depth(&self, side: BookSide) -> usize {
        match side {
            BookSide::Bid => self.bids.len(),
            BookSide::Ask => self.asks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
