//! Proof-of-work for key issuance
//!
//! Argon2id over `node_id || salt` must produce a hash with at least
//! `difficulty` trailing zero bits. Mining tries random salts; validation
//! recomputes a single hash, so the cost asymmetry is mining-heavy and
//! verification-light. Memory-hardness keeps ASIC farms from trivializing
//! the key faucet.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::common::{current_epoch, now_seconds, Hash256, NodeId};
use crate::error::{Error, Result};

/// Salt length in bytes (128 bits)
pub const SALT_SIZE: usize = 16;

/// Difficulty and Argon2 cost parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowConfig {
    /// Required trailing zero bits in the hash
    pub difficulty: u32,
    /// Argon2 memory cost in KiB
    pub memory_cost: u32,
    /// Argon2 iterations
    pub time_cost: u32,
    /// Argon2 lanes
    pub parallelism: u32,
}

impl PowConfig {
    /// Fast settings for tests and development
    pub const TEST: Self = PowConfig {
        difficulty: 4,
        memory_cost: 256,
        time_cost: 1,
        parallelism: 1,
    };

    /// Production settings: validation stays cheap (~5 ms) because it runs
    /// on every issuance request; mining cost comes from difficulty, not
    /// from per-hash cost
    pub const PRODUCTION: Self = PowConfig {
        difficulty: 20,
        memory_cost: 4096,
        time_cost: 1,
        parallelism: 1,
    };
}

impl Default for PowConfig {
    fn default() -> Self {
        Self::PRODUCTION
    }
}

/// A mined proof-of-work solution
#[derive(Debug, Clone, PartialEq)]
pub struct PowSolution {
    pub node_id: NodeId,
    pub salt: [u8; SALT_SIZE],
    pub hash: Hash256,
    pub difficulty: u32,
    pub epoch: u64,
    pub found_at: u64,
    pub attempts: u64,
}

/// Argon2id hash of `node_id || salt` under the given cost parameters
fn pow_hash(node_id: &NodeId, salt: &[u8; SALT_SIZE], config: &PowConfig) -> Result<Hash256> {
    let params = Params::new(
        config.memory_cost,
        config.time_cost,
        config.parallelism,
        Some(32),
    )
    .map_err(|e| Error::InvalidArgument(format!("argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(node_id.as_bytes(), salt, &mut out)
        .map_err(|e| {
            log::debug!("argon2 failure: {e}");
            Error::PowInvalidSolution
        })?;
    Ok(out)
}

/// Count whether a hash carries at least `difficulty` trailing zero bits
pub fn check_difficulty(hash: &Hash256, difficulty: u32) -> bool {
    let mut zero_bits = 0u32;
    for &byte in hash.iter().rev() {
        if byte == 0 {
            zero_bits += 8;
        } else {
            zero_bits += byte.trailing_zeros();
            break;
        }
        if zero_bits >= difficulty {
            return true;
        }
    }
    zero_bits >= difficulty
}

/// Mine a solution for `node_id` by trying random salts until one meets
/// the difficulty. Returns after `max_attempts` tries with a timeout error
/// so callers never spin forever on a mis-tuned difficulty.
pub fn mine(node_id: NodeId, config: &PowConfig, max_attempts: u64) -> Result<PowSolution> {
    log::info!(
        "mining pow for {node_id:?} at difficulty {} (trailing zero bits)",
        config.difficulty
    );
    let mut attempts = 0u64;

    while attempts < max_attempts {
        attempts += 1;

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let hash = pow_hash(&node_id, &salt, config)?;
        if check_difficulty(&hash, config.difficulty) {
            log::info!("pow solution found after {attempts} attempts");
            return Ok(PowSolution {
                node_id,
                salt,
                hash,
                difficulty: config.difficulty,
                epoch: current_epoch(),
                found_at: now_seconds(),
                attempts,
            });
        }

        if attempts % 1000 == 0 {
            log::debug!("pow mining progress: {attempts} attempts");
        }
    }

    Err(Error::PowTimeout)
}

/// Verify a claimed solution: the hash must be the Argon2id output for
/// `(node_id, salt)` and must meet the required difficulty
pub fn verify(solution: &PowSolution, config: &PowConfig) -> Result<()> {
    let recomputed = pow_hash(&solution.node_id, &solution.salt, config)?;
    if recomputed != solution.hash {
        return Err(Error::PowInvalidSolution);
    }
    if !check_difficulty(&solution.hash, config.difficulty) {
        return Err(Error::PowInsufficientDifficulty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_difficulty_boundaries() {
        // 8 trailing zero bits
        let mut hash = [0xFFu8; 32];
        hash[31] = 0x00;
        assert!(check_difficulty(&hash, 8));
        assert!(!check_difficulty(&hash, 9));

        // 12 trailing zero bits
        let mut hash = [0xFFu8; 32];
        hash[31] = 0x00;
        hash[30] = 0xF0;
        assert!(check_difficulty(&hash, 12));
        assert!(!check_difficulty(&hash, 13));

        // All zeros meets any difficulty up to 256
        assert!(check_difficulty(&[0u8; 32], 256));
    }

    #[test]
    fn test_mine_and_verify() {
        let node = NodeId([1u8; 32]);
        let solution = mine(node, &PowConfig::TEST, 1_000_000).unwrap();

        assert!(solution.attempts > 0);
        assert!(verify(&solution, &PowConfig::TEST).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_hash() {
        let node = NodeId([1u8; 32]);
        let mut solution = mine(node, &PowConfig::TEST, 1_000_000).unwrap();
        solution.hash[0] ^= 0x01;

        assert!(verify(&solution, &PowConfig::TEST).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_node() {
        let solution = mine(NodeId([1u8; 32]), &PowConfig::TEST, 1_000_000).unwrap();
        let stolen = PowSolution {
            node_id: NodeId([2u8; 32]),
            ..solution
        };

        // The hash no longer matches argon2(node_id || salt)
        assert!(verify(&stolen, &PowConfig::TEST).is_err());
    }

    #[test]
    fn test_verify_rejects_insufficient_difficulty() {
        let node = NodeId([1u8; 32]);
        let solution = mine(node, &PowConfig::TEST, 1_000_000).unwrap();

        // Demand far more zeros than the solution was mined for
        let strict = PowConfig {
            difficulty: 200,
            ..PowConfig::TEST
        };
        assert!(matches!(
            verify(&solution, &strict),
            Err(Error::PowInsufficientDifficulty) | Err(Error::PowInvalidSolution)
        ));
    }

    #[test]
    fn test_mine_times_out() {
        let node = NodeId([1u8; 32]);
        let impossible = PowConfig {
            difficulty: 256,
            ..PowConfig::TEST
        };
        assert!(matches!(
            mine(node, &impossible, 3),
            Err(Error::PowTimeout)
        ));
    }
}
