//! Contract and topic predicate used both for building `eth_getLogs`
//! queries and for local bloom pruning.

use alloy::{
    primitives::{Address, B256, Bloom, BloomInput},
    rpc::types::Filter as LogQuery,
};

/// Number of topic positions an EVM log can carry.
const TOPIC_POSITIONS: usize = 4;

/// Saturation threshold beyond which local bloom checks stop paying off.
const HEAVY_THRESHOLD: usize = 20;

/// Which contracts and topics the scanner is interested in.
///
/// An empty contract list matches any address; an empty set at a topic
/// position matches any value there. Positions are AND-ed, values within a
/// position are OR-ed, mirroring the `eth_getLogs` topic semantics.
///
/// Immutable once handed to the scanner; build it up front:
///
/// ```
/// use alloy::primitives::{address, b256};
/// use chainwatch::Filter;
///
/// let transfer = b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
/// let filter = Filter::new()
///     .contract(address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"))
///     .event_signature(transfer);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Filter {
    contracts: Vec<Address>,
    topics: Vec<Vec<B256>>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one contract address to listen to.
    #[must_use]
    pub fn contract(mut self, address: Address) -> Self {
        self.contracts.push(address);
        self
    }

    /// Adds several contract addresses to listen to.
    #[must_use]
    pub fn contracts(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.contracts.extend(addresses);
        self
    }

    /// Adds candidate hashes at topic `position`, growing the positional
    /// list with wildcard entries in between. Position 0 is conventionally
    /// the event signature.
    #[must_use]
    pub fn topic(mut self, position: usize, hashes: impl IntoIterator<Item = B256>) -> Self {
        if self.topics.len() <= position {
            self.topics.resize_with(position + 1, Vec::new);
        }
        self.topics[position].extend(hashes);
        self
    }

    /// Shorthand for a single candidate at topic position 0.
    #[must_use]
    pub fn event_signature(self, hash: B256) -> Self {
        self.topic(0, [hash])
    }

    /// Builds the upstream query for an inclusive block range.
    ///
    /// Only the first four topic positions are sent upstream; EVM logs
    /// cannot carry more.
    pub fn to_query(&self, from: u64, to: u64) -> LogQuery {
        let mut query = LogQuery::new().from_block(from).to_block(to);
        if !self.contracts.is_empty() {
            query = query.address(self.contracts.clone());
        }
        for (position, hashes) in self.topics.iter().take(TOPIC_POSITIONS).enumerate() {
            if !hashes.is_empty() {
                query.topics[position] = hashes.clone().into();
            }
        }
        query
    }

    /// Whether the filter is too wide for local bloom checks to be useful.
    ///
    /// With more than [`HEAVY_THRESHOLD`] contracts, or that many candidates
    /// at any topic position, the 2048-bit bloom rarely rules a block out,
    /// so the header fetch would be wasted.
    pub fn is_heavy(&self) -> bool {
        self.contracts.len() > HEAVY_THRESHOLD
            || self.topics.iter().any(|hashes| hashes.len() > HEAVY_THRESHOLD)
    }

    /// May-contain check against a block header's logs bloom.
    ///
    /// Returns `false` only when the block definitely holds no matching
    /// log: some configured contract must test into the bloom, and so must
    /// at least one candidate at every non-wildcard topic position.
    pub fn matches_bloom(&self, bloom: &Bloom) -> bool {
        if !self.contracts.is_empty()
            && !self
                .contracts
                .iter()
                .any(|address| bloom.contains_input(BloomInput::Raw(address.as_slice())))
        {
            return false;
        }

        for hashes in &self.topics {
            if hashes.is_empty() {
                continue;
            }
            if !hashes.iter().any(|hash| bloom.contains_input(BloomInput::Raw(hash.as_slice()))) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256};

    const TRANSFER: B256 =
        b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

    #[test]
    fn to_query_carries_block_bounds() {
        let query = Filter::new().to_query(7, 42);
        assert_eq!(query.get_from_block(), Some(7));
        assert_eq!(query.get_to_block(), Some(42));
    }

    #[test]
    fn to_query_carries_contracts_and_topics() {
        let contract = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        let query = Filter::new()
            .contract(contract)
            .event_signature(TRANSFER)
            .to_query(1, 2);

        assert!(query.address.matches(&contract));
        assert!(query.topics[0].matches(&TRANSFER));
        assert!(query.topics[1].is_empty());
    }

    #[test]
    fn empty_filter_sends_wildcards() {
        let query = Filter::new().to_query(0, 10);
        assert!(query.address.is_empty());
        assert!(query.topics.iter().all(|topic| topic.is_empty()));
        assert_eq!(query.get_from_block(), Some(0));
        assert_eq!(query.get_to_block(), Some(10));
    }

    #[test]
    fn topic_grows_positions_with_wildcards() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let filter = Filter::new().topic(2, [hash]);

        assert_eq!(filter.topics.len(), 3);
        assert!(filter.topics[0].is_empty());
        assert!(filter.topics[1].is_empty());
        assert_eq!(filter.topics[2], vec![hash]);
    }

    #[test]
    fn topics_beyond_position_three_stay_local() {
        let hash = B256::with_last_byte(1);
        let filter = Filter::new().topic(5, [hash]);

        // EVM logs carry at most four topics, so nothing is sent upstream...
        let query = filter.to_query(1, 2);
        assert!(query.topics.iter().all(|topic| topic.is_empty()));

        // ...but the local bloom predicate still evaluates the position.
        assert!(!filter.matches_bloom(&Bloom::default()));
    }

    #[test]
    fn heavy_when_many_contracts_or_topics() {
        let addresses = (0..21).map(|i| Address::with_last_byte(i as u8));
        assert!(Filter::new().contracts(addresses).is_heavy());

        let hashes = (0..21).map(|i| B256::with_last_byte(i as u8));
        assert!(Filter::new().topic(1, hashes).is_heavy());

        assert!(!Filter::new().contract(Address::ZERO).is_heavy());
    }

    #[test]
    fn bloom_rejects_absent_contract() {
        let configured = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        let other = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");

        let mut bloom = Bloom::default();
        bloom.accrue(BloomInput::Raw(other.as_slice()));

        let filter = Filter::new().contract(configured);
        assert!(!filter.matches_bloom(&bloom));

        bloom.accrue(BloomInput::Raw(configured.as_slice()));
        assert!(filter.matches_bloom(&bloom));
    }

    #[test]
    fn bloom_is_an_and_across_positions() {
        let contract = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        let indexed = b256!("000000000000000000000000d8da6bf26964af9d7eed9e03e53415d37aa96045");

        let mut bloom = Bloom::default();
        bloom.accrue(BloomInput::Raw(contract.as_slice()));
        bloom.accrue(BloomInput::Raw(TRANSFER.as_slice()));

        // Contract and topic0 present, but position 1 candidate absent.
        let filter = Filter::new()
            .contract(contract)
            .event_signature(TRANSFER)
            .topic(1, [indexed]);
        assert!(!filter.matches_bloom(&bloom));

        bloom.accrue(BloomInput::Raw(indexed.as_slice()));
        assert!(filter.matches_bloom(&bloom));
    }

    #[test]
    fn bloom_wildcard_positions_are_skipped() {
        let filter = Filter::new();
        assert!(filter.matches_bloom(&Bloom::default()));
    }
}
