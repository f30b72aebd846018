//! Bonus tables and rank thresholds.
//!
//! All amounts are plain configuration so tests and deployments can vary
//! them without touching the engine. Missing keys fall back to the
//! production defaults.

use std::{fs, path::Path};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ReferralError, Result},
    model::{Rank, UserType},
};

pub const DEFAULT_MAX_DEPTH: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BonusConfig {
    /// Deepest closure-table level materialized and paid.
    pub max_depth: u32,
    /// Direct bonus for a player referrer, in v-coins.
    pub player_direct_bonus: Decimal,
    /// Direct bonus for an influencer referrer, in cash.
    pub influencer_direct_bonus: Decimal,
    /// Share of each deposit paid to an influencer's level-1 referrer.
    pub deposit_percent: Decimal,
    pub rank_thresholds: RankThresholds,
    pub depth_bonuses: DepthBonusTable,
    /// Whether the first qualifying action pays the level-1 direct bonus
    /// again on top of the registration bonus.
    pub pay_direct_bonus_on_first_action: bool,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            player_direct_bonus: dec!(1000),
            influencer_direct_bonus: dec!(500),
            deposit_percent: dec!(0.10),
            rank_thresholds: RankThresholds::default(),
            depth_bonuses: DepthBonusTable::default(),
            pay_direct_bonus_on_first_action: true,
        }
    }
}

/// Active-referral counts needed for each tier. Standard is always 0.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RankThresholds {
    pub silver: u32,
    pub gold: u32,
    pub platinum: u32,
}

impl Default for RankThresholds {
    fn default() -> Self {
        Self {
            silver: 5,
            gold: 20,
            platinum: 50,
        }
    }
}

impl RankThresholds {
    pub fn threshold(&self, rank: Rank) -> u32 {
        match rank {
            Rank::Standard => 0,
            Rank::Silver => self.silver,
            Rank::Gold => self.gold,
            Rank::Platinum => self.platinum,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankAmounts {
    pub standard: Decimal,
    pub silver: Decimal,
    pub gold: Decimal,
    pub platinum: Decimal,
}

impl RankAmounts {
    pub fn get(&self, rank: Rank) -> Decimal {
        match rank {
            Rank::Standard => self.standard,
            Rank::Silver => self.silver,
            Rank::Gold => self.gold,
            Rank::Platinum => self.platinum,
        }
    }

    fn all(&self) -> [Decimal; 4] {
        [self.standard, self.silver, self.gold, self.platinum]
    }
}

/// Depth bonus per (user type, rank).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DepthBonusTable {
    pub player: RankAmounts,
    pub influencer: RankAmounts,
}

impl Default for DepthBonusTable {
    fn default() -> Self {
        Self {
            player: RankAmounts {
                standard: dec!(100),
                silver: dec!(150),
                gold: dec!(200),
                platinum: dec!(250),
            },
            influencer: RankAmounts {
                standard: dec!(50),
                silver: dec!(75),
                gold: dec!(100),
                platinum: dec!(125),
            },
        }
    }
}

impl DepthBonusTable {
    pub fn lookup(&self, user_type: UserType, rank: Rank) -> Decimal {
        match user_type {
            UserType::Player => self.player.get(rank),
            UserType::Influencer => self.influencer.get(rank),
        }
    }
}

impl BonusConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: BonusConfig =
            toml::from_str(raw).map_err(|err| ReferralError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            ReferralError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(ReferralError::Config("max_depth must be at least 1".into()));
        }
        let t = &self.rank_thresholds;
        if !(t.silver <= t.gold && t.gold <= t.platinum) {
            return Err(ReferralError::Config(format!(
                "rank thresholds must ascend: silver={} gold={} platinum={}",
                t.silver, t.gold, t.platinum
            )));
        }
        if self.deposit_percent < Decimal::ZERO || self.deposit_percent > Decimal::ONE {
            return Err(ReferralError::Config(format!(
                "deposit_percent must be within [0, 1], got {}",
                self.deposit_percent
            )));
        }
        let amounts = [self.player_direct_bonus, self.influencer_direct_bonus]
            .into_iter()
            .chain(self.depth_bonuses.player.all())
            .chain(self.depth_bonuses.influencer.all());
        for amount in amounts {
            if amount < Decimal::ZERO {
                return Err(ReferralError::Config(format!(
                    "bonus amounts must not be negative, got {amount}"
                )));
            }
        }
        Ok(())
    }
}
