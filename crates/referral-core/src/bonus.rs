use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    config::BonusConfig,
    model::{Currency, EntryKind, Rank, UserType},
    money,
};

/// A computed bonus, not yet credited.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bonus {
    pub amount: Decimal,
    pub currency: Currency,
    pub kind: EntryKind,
}

/// Pure bonus rules over a [`BonusConfig`].
pub struct BonusCalculator<'a> {
    config: &'a BonusConfig,
}

impl<'a> BonusCalculator<'a> {
    pub fn new(config: &'a BonusConfig) -> Self {
        Self { config }
    }

    /// Level-1 bonus, keyed only by the payee's type. `None` when the
    /// configured amount is zero.
    pub fn direct_bonus(&self, payee: UserType) -> Option<Bonus> {
        let amount = match payee {
            UserType::Influencer => self.config.influencer_direct_bonus,
            UserType::Player => self.config.player_direct_bonus,
        };
        let amount = money::round(amount);
        if amount <= Decimal::ZERO {
            return None;
        }
        Some(Bonus {
            amount,
            currency: payee.payout_currency(),
            kind: EntryKind::ReferralBonus,
        })
    }

    /// Rank-based bonus for an ancestor at `level`. `None` when the level is
    /// outside `[1, max_depth]` or the table yields zero.
    pub fn depth_bonus(&self, payee: UserType, rank: Rank, level: u32) -> Option<Bonus> {
        if level < 1 || level > self.config.max_depth {
            return None;
        }
        let amount = money::round(self.config.depth_bonuses.lookup(payee, rank));
        if amount <= Decimal::ZERO {
            return None;
        }
        Some(Bonus {
            amount,
            currency: payee.payout_currency(),
            kind: EntryKind::DepthBonus,
        })
    }

    /// Recurring deposit share. Only a level-1 influencer is paid.
    pub fn deposit_bonus(&self, payee: UserType, level: u32, deposit: Decimal) -> Option<Bonus> {
        if level != 1 || payee != UserType::Influencer || deposit <= Decimal::ZERO {
            return None;
        }
        let amount = money::round(deposit * self.config.deposit_percent);
        if amount <= Decimal::ZERO {
            return None;
        }
        Some(Bonus {
            amount,
            currency: Currency::Cash,
            kind: EntryKind::DepositPercent,
        })
    }
}
