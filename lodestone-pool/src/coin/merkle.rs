//! Merkle branch computation for stratum jobs.
//!
//! A stratum job ships the branch hashes a miner needs to fold its own
//! coinbase hash into the merkle root, instead of the full transaction
//! list. The branch is fixed for a given template, so it is computed once
//! per job and cached.

use super::sha256d;

/// Hash two nodes into their parent.
fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// Compute the branch steps for a template whose first transaction (the
/// coinbase) is not yet known. `tx_hashes` are the remaining transaction
/// hashes in template order, in internal byte order.
pub fn branch_steps(tx_hashes: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut steps = Vec::new();
    let mut level = tx_hashes.to_vec();

    while !level.is_empty() {
        steps.push(level[0]);

        // Counting the coinbase slot, the row has level.len() + 1 nodes;
        // odd rows repeat their last node.
        if level.len() % 2 == 0 {
            let last = *level.last().expect("level is non-empty");
            level.push(last);
        }

        level = level[1..]
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    steps
}

/// Fold `first` (the coinbase hash) through the branch to the merkle root.
pub fn root_with_first(first: [u8; 32], steps: &[[u8; 32]]) -> [u8; 32] {
    steps
        .iter()
        .fold(first, |acc, step| hash_pair(&acc, step))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straightforward bottom-up merkle root over the full hash list.
    fn reference_root(mut level: Vec<[u8; 32]>) -> [u8; 32] {
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            level = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
        }
        level[0]
    }

    fn fake_hash(seed: u8) -> [u8; 32] {
        [seed; 32]
    }

    #[test]
    fn empty_branch_for_coinbase_only_block() {
        let steps = branch_steps(&[]);
        assert!(steps.is_empty());
        let coinbase = fake_hash(0xcb);
        assert_eq!(root_with_first(coinbase, &steps), coinbase);
    }

    #[test]
    fn branch_matches_reference_for_small_trees() {
        let coinbase = fake_hash(0xcb);
        for tx_count in 1..=9 {
            let tx_hashes: Vec<[u8; 32]> = (1..=tx_count).map(|i| fake_hash(i as u8)).collect();

            let steps = branch_steps(&tx_hashes);
            let via_branch = root_with_first(coinbase, &steps);

            let mut all = vec![coinbase];
            all.extend_from_slice(&tx_hashes);
            let direct = reference_root(all);

            assert_eq!(via_branch, direct, "tree with {tx_count} transactions");
        }
    }

    #[test]
    fn single_transaction_branch_is_that_hash() {
        let tx = fake_hash(7);
        assert_eq!(branch_steps(&[tx]), vec![tx]);
    }
}
