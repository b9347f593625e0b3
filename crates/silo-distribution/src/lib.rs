//! Data distribution: deterministic mapping of a `(length, offset)` range of
//! a logical object onto per-server stripes.
//!
//! Every policy produces the same monotonically increasing `block_id`
//! sequence for the same input range; only the `(server index, in-server
//! offset)` placement differs. This is what lets a read locate the stripes a
//! prior write produced, regardless of policy parameters.

use serde::{Deserialize, Serialize};

/// Default stripe size, 512 KiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 512 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("server index {index} out of range (server count {count})")]
    IndexOutOfRange { index: u32, count: u32 },
    #[error("distribution requires at least one server")]
    NoServers,
    #[error("block size must be non-zero")]
    ZeroBlockSize,
}

/// One contiguous range assigned to a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripe {
    pub index: u32,
    pub length: u64,
    /// Offset within the server's dense per-object byte stream.
    pub offset: u64,
    pub block_id: u64,
}

/// Placement policy parameters. The cursor lives in [`Distribution`]; the
/// variants carry only per-policy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "policy")]
pub enum Policy {
    RoundRobin { start_index: u32 },
    SingleServer { index: u32 },
    Weighted { weights: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    block_size: u64,
    server_count: u32,
    policy: Policy,

    #[serde(skip)]
    length: u64,
    #[serde(skip)]
    offset: u64,
}

impl Distribution {
    pub fn round_robin(server_count: u32) -> Self {
        Self::new(server_count, Policy::RoundRobin { start_index: 0 })
    }

    pub fn single_server(server_count: u32) -> Self {
        Self::new(server_count, Policy::SingleServer { index: 0 })
    }

    /// All servers start with weight 1; adjust with [`set_weight`].
    ///
    /// [`set_weight`]: Distribution::set_weight
    pub fn weighted(server_count: u32) -> Self {
        Self::new(
            server_count,
            Policy::Weighted {
                weights: vec![1; server_count as usize],
            },
        )
    }

    fn new(server_count: u32, policy: Policy) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            server_count,
            policy,
            length: 0,
            offset: 0,
        }
    }

    pub fn server_count(&self) -> u32 {
        self.server_count
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: u64) -> Result<(), Error> {
        if block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }
        self.block_size = block_size;
        Ok(())
    }

    pub fn set_start_index(&mut self, start_index: u32) -> Result<(), Error> {
        self.check_index(start_index)?;
        match &mut self.policy {
            Policy::RoundRobin { start_index: s } => *s = start_index,
            _ => {}
        }
        Ok(())
    }

    pub fn set_index(&mut self, index: u32) -> Result<(), Error> {
        self.check_index(index)?;
        match &mut self.policy {
            Policy::SingleServer { index: i } => *i = index,
            _ => {}
        }
        Ok(())
    }

    pub fn set_weight(&mut self, index: u32, weight: u32) -> Result<(), Error> {
        self.check_index(index)?;
        match &mut self.policy {
            Policy::Weighted { weights } => weights[index as usize] = weight,
            _ => {}
        }
        Ok(())
    }

    fn check_index(&self, index: u32) -> Result<(), Error> {
        if index >= self.server_count {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.server_count,
            });
        }
        Ok(())
    }

    /// Rearm the cursor for a new `(length, offset)` range.
    pub fn reset(&mut self, length: u64, offset: u64) {
        self.length = length;
        self.offset = offset;
    }

    /// Advance the cursor by one stripe. Returns `None` once the range is
    /// exhausted.
    pub fn next_stripe(&mut self) -> Option<Stripe> {
        if self.length == 0 {
            return None;
        }

        let block = self.offset / self.block_size;
        let displacement = self.offset % self.block_size;
        let length = self.length.min(self.block_size - displacement);

        let (index, server_block) = self.place(block);
        let stripe = Stripe {
            index,
            length,
            offset: server_block * self.block_size + displacement,
            block_id: block,
        };

        self.length -= length;
        self.offset += length;

        Some(stripe)
    }

    /// Map a logical block onto `(server index, per-server block number)`.
    /// Per-server block numbers are dense so backends storing one byte
    /// stream per server pack without holes.
    fn place(&self, block: u64) -> (u32, u64) {
        let n = self.server_count as u64;

        match &self.policy {
            Policy::RoundRobin { start_index } => {
                let index = ((*start_index as u64 + block) % n) as u32;
                (index, block / n)
            }
            Policy::SingleServer { index } => (*index, block),
            Policy::Weighted { weights } => {
                let total: u64 = weights.iter().map(|w| *w as u64).sum();
                let round = block / total;
                let mut position = block % total;

                for (index, weight) in weights.iter().enumerate() {
                    let weight = *weight as u64;
                    if position < weight {
                        return (index as u32, round * weight + position);
                    }
                    position -= weight;
                }

                unreachable!("position is bounded by the weight sum");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BLOCK_SIZE: u64 = DEFAULT_BLOCK_SIZE - 1;

    fn collect(distribution: &mut Distribution) -> Vec<Stripe> {
        let mut stripes = Vec::new();
        while let Some(stripe) = distribution.next_stripe() {
            stripes.push(stripe);
        }
        stripes
    }

    /// Shared fixture: two servers, block size one below the default stripe
    /// size, four blocks starting at offset 42.
    fn fixture(mut distribution: Distribution) -> Vec<Stripe> {
        distribution.set_block_size(BLOCK_SIZE).unwrap();
        distribution.reset(4 * BLOCK_SIZE, 42);
        collect(&mut distribution)
    }

    #[test]
    fn round_robin() {
        let mut distribution = Distribution::round_robin(2);
        distribution.set_start_index(1).unwrap();
        let stripes = fixture(distribution);

        assert_eq!(stripes.len(), 5);
        assert_eq!(stripes[0], Stripe { index: 1, length: BLOCK_SIZE - 42, offset: 42, block_id: 0 });
        assert_eq!(stripes[1], Stripe { index: 0, length: BLOCK_SIZE, offset: 0, block_id: 1 });
        assert_eq!(stripes[2], Stripe { index: 1, length: BLOCK_SIZE, offset: BLOCK_SIZE, block_id: 2 });
        assert_eq!(stripes[3], Stripe { index: 0, length: BLOCK_SIZE, offset: BLOCK_SIZE, block_id: 3 });
        assert_eq!(stripes[4], Stripe { index: 1, length: 42, offset: 2 * BLOCK_SIZE, block_id: 4 });
    }

    #[test]
    fn single_server() {
        let mut distribution = Distribution::single_server(2);
        distribution.set_index(1).unwrap();
        let stripes = fixture(distribution);

        assert_eq!(stripes.len(), 5);
        for (i, stripe) in stripes.iter().enumerate() {
            assert_eq!(stripe.index, 1);
            assert_eq!(stripe.block_id, i as u64);
        }
        assert_eq!(stripes[0].offset, 42);
        assert_eq!(stripes[1].offset, BLOCK_SIZE);
        assert_eq!(stripes[2].offset, 2 * BLOCK_SIZE);
        assert_eq!(stripes[3].offset, 3 * BLOCK_SIZE);
        assert_eq!(stripes[4].offset, 4 * BLOCK_SIZE);
        assert_eq!(stripes[4].length, 42);
    }

    #[test]
    fn weighted() {
        let mut distribution = Distribution::weighted(2);
        distribution.set_weight(0, 1).unwrap();
        distribution.set_weight(1, 2).unwrap();
        let stripes = fixture(distribution);

        assert_eq!(stripes.len(), 5);
        assert_eq!(stripes[0], Stripe { index: 0, length: BLOCK_SIZE - 42, offset: 42, block_id: 0 });
        assert_eq!(stripes[1], Stripe { index: 1, length: BLOCK_SIZE, offset: 0, block_id: 1 });
        assert_eq!(stripes[2], Stripe { index: 1, length: BLOCK_SIZE, offset: BLOCK_SIZE, block_id: 2 });
        assert_eq!(stripes[3], Stripe { index: 0, length: BLOCK_SIZE, offset: BLOCK_SIZE, block_id: 3 });
        assert_eq!(stripes[4], Stripe { index: 1, length: 42, offset: 2 * BLOCK_SIZE, block_id: 4 });
    }

    #[test]
    fn stripe_lengths_sum_to_request() {
        for make in [
            Distribution::round_robin as fn(u32) -> Distribution,
            Distribution::single_server,
            Distribution::weighted,
        ] {
            let mut distribution = make(3);
            distribution.reset(3 * DEFAULT_BLOCK_SIZE + 17, 99);

            let stripes = collect(&mut distribution);
            let total: u64 = stripes.iter().map(|s| s.length).sum();
            assert_eq!(total, 3 * DEFAULT_BLOCK_SIZE + 17);

            // Block ids are identical across policies for identical input.
            for (i, stripe) in stripes.iter().enumerate() {
                assert_eq!(stripe.block_id, i as u64);
            }
        }
    }

    #[test]
    fn two_servers_one_megabyte() {
        let mut distribution = Distribution::round_robin(2);
        distribution.reset(1024 * 1024, 0);

        let stripes = collect(&mut distribution);
        assert_eq!(
            stripes,
            vec![
                Stripe { index: 0, length: 524288, offset: 0, block_id: 0 },
                Stripe { index: 1, length: 524288, offset: 0, block_id: 1 },
            ],
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let mut distribution = Distribution::round_robin(2);
        distribution.reset(0, 4096);
        assert_eq!(distribution.next_stripe(), None);
    }

    #[test]
    fn out_of_range_parameters_rejected() {
        let mut distribution = Distribution::round_robin(2);
        assert_eq!(
            distribution.set_start_index(2),
            Err(Error::IndexOutOfRange { index: 2, count: 2 }),
        );

        let mut distribution = Distribution::single_server(1);
        assert!(distribution.set_index(3).is_err());
        assert!(distribution.set_block_size(0).is_err());
    }

    #[test]
    fn policy_round_trips_through_serde() {
        let mut distribution = Distribution::weighted(2);
        distribution.set_weight(1, 4).unwrap();
        distribution.set_block_size(1024).unwrap();
        distribution.reset(4096, 0);

        let encoded = serde_json::to_string(&distribution).unwrap();
        let mut decoded: Distribution = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.block_size(), 1024);
        // The cursor is transient and not part of the serialized form.
        decoded.reset(4096, 0);
        distribution.reset(4096, 0);
        let a = collect(&mut distribution);
        let b = collect(&mut decoded);
        assert_eq!(a, b);
    }
}
