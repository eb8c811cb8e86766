//! Monetary policy: block subsidy schedule and amount ranges

use crate::constants::*;
use crate::params::ChainParams;
use crate::types::*;

/// GetBlockSubsidy
///
/// The subsidy starts at 50 coins and halves every
/// `subsidy_halving_interval` blocks; after 64 halvings it is zero.
pub fn get_block_subsidy(height: Height, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Sum of all subsidies from genesis up to and including `height`.
pub fn total_supply(height: Height, params: &ChainParams) -> Amount {
    let interval = params.subsidy_halving_interval;
    let mut total = 0i64;
    let mut start = 0u64;
    while start <= height {
        let subsidy = get_block_subsidy(start, params);
        if subsidy == 0 {
            break;
        }
        let end = (start + interval - 1).min(height);
        total += subsidy * (end - start + 1) as i64;
        start += interval;
    }
    total
}

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_schedule() {
        let params = ChainParams::mainnet();
        assert_eq!(get_block_subsidy(0, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(get_block_subsidy(420_000, &params), 1_250_000_000);
        assert_eq!(get_block_subsidy(210_000 * 64, &params), 0);
    }

    #[test]
    fn test_regtest_halves_early() {
        let params = ChainParams::regtest();
        assert_eq!(get_block_subsidy(149, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(150, &params), 25 * COIN);
    }

    #[test]
    fn test_supply_never_exceeds_max_money() {
        let params = ChainParams::mainnet();
        let supply = total_supply(u64::MAX / 2, &params);
        assert!(supply <= MAX_MONEY);
        assert_eq!(total_supply(0, &params), 50 * COIN);
        assert_eq!(total_supply(210_000, &params), 210_000 * 50 * COIN + 25 * COIN);
    }

    #[test]
    fn test_money_range() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
        assert!(!money_range(MAX_MONEY + 1));
    }
}
