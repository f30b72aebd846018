//! Read-only views over the closure table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{Currency, EntryKind, MemberId, UserType},
    store::LedgerState,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralNode {
    pub member_id: MemberId,
    pub username: Option<String>,
    pub first_name: String,
    pub user_type: UserType,
    pub level: u32,
    pub direct_referrals_count: u32,
    pub total_referrals_count: usize,
    pub registered_at: DateTime<Utc>,
    pub children: Vec<ReferralNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralTree {
    pub member_id: MemberId,
    pub referral_code: String,
    pub depth: u32,
    pub total_referrals: usize,
    /// Descendant count per level, within `depth`.
    pub levels: BTreeMap<u32, usize>,
    pub children: Vec<ReferralNode>,
}

/// Nest every descendant of `root` down to `depth` under its referrer.
///
/// Nodes are assembled bottom-up, deepest level first, so the build is a
/// single pass over the relation rows with no recursion.
pub fn build_tree(state: &LedgerState, root: MemberId, depth: u32) -> Result<ReferralTree> {
    let root_member = state.require_member(root)?;
    let rows = state.descendants_of(root, depth);

    let mut levels: BTreeMap<u32, usize> = BTreeMap::new();
    for row in &rows {
        *levels.entry(row.level).or_default() += 1;
    }

    let mut children_of: BTreeMap<MemberId, Vec<ReferralNode>> = BTreeMap::new();
    for row in rows.iter().rev() {
        let member = state.require_member(row.descendant)?;
        let mut children = children_of.remove(&member.id).unwrap_or_default();
        children.reverse();
        let node = ReferralNode {
            member_id: member.id,
            username: member.username.clone(),
            first_name: member.first_name.clone(),
            user_type: member.user_type,
            level: row.level,
            direct_referrals_count: state.direct_referral_count(member.id),
            total_referrals_count: state.descendant_count(member.id),
            registered_at: member.created_at,
            children,
        };
        let parent = member.referrer.unwrap_or(root);
        children_of.entry(parent).or_default().push(node);
    }

    let mut children = children_of.remove(&root).unwrap_or_default();
    children.reverse();

    Ok(ReferralTree {
        member_id: root,
        referral_code: root_member.referral_code.clone(),
        depth,
        total_referrals: rows.len(),
        levels,
        children,
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralStats {
    pub member_id: MemberId,
    pub direct_referrals: u32,
    pub active_referrals: u32,
    pub total_referrals: usize,
    pub levels: BTreeMap<u32, usize>,
    pub earned_v_coins: Decimal,
    pub earned_cash: Decimal,
}

/// Referral counts and bonus totals (withdrawals excluded) for `member`.
pub fn referral_stats(state: &LedgerState, member: MemberId, max_depth: u32) -> Result<ReferralStats> {
    let m = state.require_member(member)?;
    let mut levels: BTreeMap<u32, usize> = BTreeMap::new();
    let rows = state.descendants_of(member, max_depth);
    for row in &rows {
        *levels.entry(row.level).or_default() += 1;
    }

    let mut earned_v_coins = Decimal::ZERO;
    let mut earned_cash = Decimal::ZERO;
    for entry in state.entries_for(member) {
        if entry.kind == EntryKind::Withdrawal {
            continue;
        }
        match entry.currency {
            Currency::VCoins => earned_v_coins += entry.amount,
            Currency::Cash => earned_cash += entry.amount,
        }
    }

    Ok(ReferralStats {
        member_id: member,
        direct_referrals: state.direct_referral_count(member),
        active_referrals: m.active_referrals_count,
        total_referrals: rows.len(),
        levels,
        earned_v_coins,
        earned_cash,
    })
}
