//! Rank tiers derived from the active-referral count.

use chrono::{DateTime, Utc};

use crate::{
    config::RankThresholds,
    model::{Member, MemberId, Notification, NotificationKind, Rank},
    store::{IdAllocator, LedgerMutation},
};

/// Highest tier whose threshold `active_referrals` meets.
pub fn rank_for(thresholds: &RankThresholds, active_referrals: u32) -> Rank {
    [Rank::Platinum, Rank::Gold, Rank::Silver]
        .into_iter()
        .find(|rank| active_referrals >= thresholds.threshold(*rank))
        .unwrap_or(Rank::Standard)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankChange {
    pub member: MemberId,
    pub from: Rank,
    pub to: Rank,
}

impl RankChange {
    pub fn is_upgrade(&self) -> bool {
        self.to > self.from
    }
}

/// Compare the computed tier with the stored one.
pub fn evaluate(
    thresholds: &RankThresholds,
    member: &Member,
    active_referrals: u32,
) -> Option<RankChange> {
    let to = rank_for(thresholds, active_referrals);
    (to != member.rank).then_some(RankChange {
        member: member.id,
        from: member.rank,
        to,
    })
}

/// Persist the new tier and tell the member about it.
pub fn change_mutations(
    change: RankChange,
    ids: &mut IdAllocator,
    at: DateTime<Utc>,
) -> Vec<LedgerMutation> {
    let (title, verb) = if change.is_upgrade() {
        ("Rank Upgrade", "upgraded")
    } else {
        ("Rank Change", "changed")
    };
    vec![
        LedgerMutation::SetRank {
            member: change.member,
            rank: change.to,
        },
        LedgerMutation::Notify {
            notification: Notification {
                id: ids.next_notification(),
                user: change.member,
                title: title.to_string(),
                message: format!(
                    "Congratulations! Your rank has been {verb} from {} to {}",
                    change.from, change.to
                ),
                kind: NotificationKind::RankUpgrade,
                is_read: false,
                created_at: at,
            },
        },
    ]
}
