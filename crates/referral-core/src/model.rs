use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;

pub type MemberId = u64;
pub type EntryId = u64;
pub type NotificationId = u64;
pub type WithdrawalId = u64;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Player,
    Influencer,
}

impl UserType {
    /// Influencers are paid in cash, players in v-coins.
    pub fn payout_currency(self) -> Currency {
        match self {
            UserType::Player => Currency::VCoins,
            UserType::Influencer => Currency::Cash,
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserType::Player => f.write_str("player"),
            UserType::Influencer => f.write_str("influencer"),
        }
    }
}

/// Rank tiers, ordered from lowest to highest.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    #[default]
    Standard,
    Silver,
    Gold,
    Platinum,
}

impl Rank {
    pub fn as_str(self) -> &'static str {
        match self {
            Rank::Standard => "standard",
            Rank::Silver => "silver",
            Rank::Gold => "gold",
            Rank::Platinum => "platinum",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    VCoins,
    Cash,
}

impl Currency {
    pub fn symbol(self) -> &'static str {
        match self {
            Currency::VCoins => "V-Coins",
            Currency::Cash => "₽",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    /// External account key (unique per member).
    pub identity_key: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub referral_code: String,
    /// Set once at creation.
    pub referrer: Option<MemberId>,
    pub user_type: UserType,
    pub rank: Rank,
    pub v_coins_balance: Decimal,
    pub cash_balance: Decimal,
    pub total_deposits: Decimal,
    pub active_referrals_count: u32,
    pub is_admin: bool,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn balance(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::VCoins => self.v_coins_balance,
            Currency::Cash => self.cash_balance,
        }
    }

    pub(crate) fn balance_mut(&mut self, currency: Currency) -> &mut Decimal {
        match currency {
            Currency::VCoins => &mut self.v_coins_balance,
            Currency::Cash => &mut self.cash_balance,
        }
    }

    pub fn display_name(&self) -> &str {
        if !self.first_name.is_empty() {
            &self.first_name
        } else if let Some(username) = &self.username {
            username
        } else {
            "member"
        }
    }
}

/// Attributes supplied by the caller when registering a member.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NewMember {
    pub identity_key: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    pub is_admin: bool,
}

impl NewMember {
    pub fn new(identity_key: i64, first_name: impl Into<String>, user_type: UserType) -> Self {
        Self {
            identity_key,
            first_name: first_name.into(),
            user_type,
            ..Self::default()
        }
    }
}

/// One closure-table row: `ancestor` recruited `descendant` at distance `level`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralRelation {
    pub ancestor: MemberId,
    pub descendant: MemberId,
    pub level: u32,
    pub has_paid_first_bonus: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    ReferralBonus,
    DepthBonus,
    DepositPercent,
    Withdrawal,
}

/// Append-only ledger entry. Balances are a projection of these rows.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user: MemberId,
    pub amount: Decimal,
    pub currency: Currency,
    pub kind: EntryKind,
    pub related_user: Option<MemberId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A single bonus credited by an event, as reported back to the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BonusPayout {
    pub recipient_id: MemberId,
    pub level: u32,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_id: EntryId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReferralBonus,
    TournamentBonus,
    DepositBonus,
    RankUpgrade,
    WithdrawalApproved,
    WithdrawalRejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub user: MemberId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalMethod {
    Card,
    Crypto,
}

impl FromStr for WithdrawalMethod {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "card" => Ok(WithdrawalMethod::Card),
            "crypto" => Ok(WithdrawalMethod::Crypto),
            other => Err(ReferralError::Validation(format!(
                "method must be 'card' or 'crypto', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for WithdrawalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawalMethod::Card => f.write_str("card"),
            WithdrawalMethod::Crypto => f.write_str("crypto"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user: MemberId,
    pub amount: Decimal,
    pub method: WithdrawalMethod,
    pub wallet_address: String,
    pub status: WithdrawalStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum WithdrawalDecision {
    Approve,
    Reject { reason: Option<String> },
}
