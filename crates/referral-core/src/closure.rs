//! Closure-table builder.
//!
//! A new member is linked to its referrer at level 1 and to each of the
//! referrer's ancestors one level further away, stopping at `max_depth`.
//! Ancestry is read from existing rows, so no parent-pointer walk is needed.

use chrono::{DateTime, Utc};

use crate::{
    error::{ReferralError, Result},
    model::{MemberId, ReferralRelation},
    store::LedgerState,
};

/// Rows linking `new_member` to every ancestor through `referrer`.
///
/// `referrer_ancestry` must hold the referrer's own ancestor rows with
/// `level < max_depth`.
pub fn plan_relations(
    max_depth: u32,
    new_member: MemberId,
    referrer: Option<MemberId>,
    referrer_ancestry: &[&ReferralRelation],
    at: DateTime<Utc>,
) -> Result<Vec<ReferralRelation>> {
    let Some(referrer) = referrer else {
        return Ok(Vec::new());
    };
    if new_member == referrer {
        return Err(ReferralError::Validation(format!(
            "member {new_member} cannot refer itself"
        )));
    }

    let mut rows = Vec::with_capacity(referrer_ancestry.len() + 1);
    rows.push(ReferralRelation {
        ancestor: referrer,
        descendant: new_member,
        level: 1,
        has_paid_first_bonus: false,
        created_at: at,
    });
    for row in referrer_ancestry {
        let level = row.level + 1;
        if level > max_depth || row.ancestor == new_member {
            continue;
        }
        rows.push(ReferralRelation {
            ancestor: row.ancestor,
            descendant: new_member,
            level,
            has_paid_first_bonus: false,
            created_at: at,
        });
    }
    Ok(rows)
}

/// [`plan_relations`] reading the referrer's ancestry from `state`.
pub fn build_closure(
    state: &LedgerState,
    max_depth: u32,
    new_member: MemberId,
    referrer: Option<MemberId>,
    at: DateTime<Utc>,
) -> Result<Vec<ReferralRelation>> {
    let ancestry = match referrer {
        Some(referrer) => state.ancestors_of(referrer, Some(max_depth)),
        None => Vec::new(),
    };
    plan_relations(max_depth, new_member, referrer, &ancestry, at)
}
