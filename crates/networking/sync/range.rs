//! Arithmetic over the 256-bit hash space: chunking it into contiguous
//! intervals for concurrent retrieval and projecting how much of a storage
//! trie is still undelivered.

use ethereum_types::{H256, U256, U512};
use thiserror::Error;
use vela_common::constants::MAX_HASH;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EstimateError {
    #[error("last hash empty")]
    EmptyLastHash,
    #[error("too few slots for estimation")]
    OutOfRange,
}

/// Returns `h + 1`. Callers only advance cursors strictly below [`MAX_HASH`],
/// so wrap-around is never observable.
pub fn inc_hash(h: H256) -> H256 {
    let (next, _) = U256::from_big_endian(h.as_bytes()).overflowing_add(U256::one());
    H256(next.to_big_endian())
}

/// Iterator over contiguous intervals covering `(start, MAX_HASH]` in `chunks`
/// pieces. The step is `2^256 / chunks - 1`; the final interval is clamped to
/// [`MAX_HASH`] to absorb the rounding loss.
pub struct HashRange {
    current: U256,
    step: U256,
}

impl HashRange {
    pub fn new(start: H256, chunks: u64) -> Self {
        let step = (U512::one() << 256usize) / U512::from(chunks.max(1)) - U512::one();
        let step = U256::try_from(step).unwrap_or(U256::MAX);
        Self {
            current: U256::from_big_endian(start.as_bytes()),
            step,
        }
    }

    /// Advances to the next interval, returning false once the space is
    /// exhausted.
    pub fn next(&mut self) -> bool {
        let (bump, overflow) = self.step.overflowing_add(U256::one());
        if overflow {
            return false;
        }
        let (next, overflow) = self.current.overflowing_add(bump);
        if overflow {
            return false;
        }
        self.current = next;
        true
    }

    pub fn start(&self) -> H256 {
        H256(self.current.to_big_endian())
    }

    pub fn end(&self) -> H256 {
        let (end, overflow) = self.current.overflowing_add(self.step);
        if overflow {
            return MAX_HASH;
        }
        H256(end.to_big_endian())
    }
}

/// Splits `[0, MAX_HASH]` into `chunks` intervals for the initial account
/// partition. Successive intervals share the boundary-plus-one property and
/// the last one always ends at [`MAX_HASH`].
pub fn partition_account_ranges(chunks: u64) -> Vec<(H256, H256)> {
    let chunks = chunks.max(1);
    let step = {
        let wide = (U512::one() << 256usize) / U512::from(chunks) - U512::one();
        U256::try_from(wide).unwrap_or(U256::MAX)
    };
    let mut ranges = Vec::with_capacity(chunks as usize);
    let mut next = U256::zero();
    for i in 0..chunks {
        let last = if i == chunks - 1 {
            MAX_HASH
        } else {
            H256((next + step).to_big_endian())
        };
        ranges.push((H256(next.to_big_endian()), last));
        if i != chunks - 1 {
            next = next + step + U256::one();
        }
    }
    ranges
}

/// Roughly how many slots are left in a contract storage, assuming the slot
/// hashes are evenly distributed over the hash space.
pub fn estimate_remaining_slots(hashes: usize, last: H256) -> Result<u64, EstimateError> {
    if last.is_zero() {
        return Err(EstimateError::EmptyLastHash);
    }
    let space = U512::from(U256::MAX) * U512::from(hashes)
        / U512::from(U256::from_big_endian(last.as_bytes()));
    if space > U512::from(u64::MAX) {
        // Gigantic address space, probably too few or malicious slots
        return Err(EstimateError::OutOfRange);
    }
    Ok(space.as_u64() - hashes as u64)
}
