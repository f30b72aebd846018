//! Bonus distribution engine.
//!
//! Each public operation plans a batch of [`LedgerMutation`]s against the
//! current state and commits it with [`LedgerState::apply_mutations`] while
//! holding the state lock. The lock is the single serialized path for
//! balance updates, so two events touching the same ancestor cannot lose
//! an update. Notifications reach the sink only after the commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use crate::{
    bonus::{Bonus, BonusCalculator},
    closure,
    config::BonusConfig,
    error::{ReferralError, Result},
    model::{
        BonusPayout, Currency, EntryId, EntryKind, LedgerEntry, Member, MemberId, NewMember,
        Notification, NotificationKind, ReferralRelation, UserType, Withdrawal,
        WithdrawalDecision, WithdrawalId, WithdrawalMethod, WithdrawalStatus,
    },
    money,
    notify::{NotificationSink, TracingSink},
    rank::{self, RankChange},
    store::{IdAllocator, LedgerMutation, LedgerSnapshot, LedgerState},
    tree::{self, ReferralStats, ReferralTree},
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 8;

/// Mutations and identifiers accumulated for one event.
struct EventPlan {
    ids: IdAllocator,
    at: DateTime<Utc>,
    mutations: Vec<LedgerMutation>,
}

impl EventPlan {
    fn new(ids: IdAllocator, at: DateTime<Utc>) -> Self {
        Self {
            ids,
            at,
            mutations: Vec::new(),
        }
    }

    fn push(&mut self, mutation: LedgerMutation) {
        self.mutations.push(mutation);
    }

    fn entry(
        &mut self,
        user: MemberId,
        amount: Decimal,
        currency: Currency,
        kind: EntryKind,
        related_user: Option<MemberId>,
        description: String,
    ) -> EntryId {
        let id = self.ids.next_entry();
        self.push(LedgerMutation::AppendEntry {
            entry: LedgerEntry {
                id,
                user,
                amount,
                currency,
                kind,
                related_user,
                description,
                created_at: self.at,
            },
        });
        id
    }

    /// Credit `bonus` to `payee` and record the matching ledger entry.
    fn pay(
        &mut self,
        payee: &Member,
        bonus: Bonus,
        source: &Member,
        level: u32,
        description: String,
    ) -> BonusPayout {
        self.push(LedgerMutation::Credit {
            member: payee.id,
            currency: bonus.currency,
            amount: bonus.amount,
        });
        let transaction_id = self.entry(
            payee.id,
            bonus.amount,
            bonus.currency,
            bonus.kind,
            Some(source.id),
            description,
        );
        BonusPayout {
            recipient_id: payee.id,
            level,
            amount: bonus.amount,
            currency: bonus.currency,
            transaction_id,
        }
    }

    fn notify(&mut self, user: MemberId, title: &str, message: String, kind: NotificationKind) {
        let id = self.ids.next_notification();
        self.push(LedgerMutation::Notify {
            notification: Notification {
                id,
                user,
                title: title.to_string(),
                message,
                kind,
                is_read: false,
                created_at: self.at,
            },
        });
    }

    fn rank_change(&mut self, change: RankChange) {
        let mutations = rank::change_mutations(change, &mut self.ids, self.at);
        self.mutations.extend(mutations);
    }

    fn notifications(&self) -> Vec<Notification> {
        self.mutations
            .iter()
            .filter_map(|m| match m {
                LedgerMutation::Notify { notification } => Some(notification.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct ReferralEngine {
    config: BonusConfig,
    state: Mutex<LedgerState>,
    sink: Arc<dyn NotificationSink>,
}

impl ReferralEngine {
    pub fn new(config: BonusConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: BonusConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        Self::from_state(config, LedgerState::new(), sink)
    }

    pub fn from_snapshot(
        config: BonusConfig,
        snapshot: LedgerSnapshot,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        Self::from_state(config, LedgerState::from_snapshot(snapshot)?, sink)
    }

    fn from_state(
        config: BonusConfig,
        state: LedgerState,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(state),
            sink,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().snapshot()
    }

    pub fn state_root(&self) -> String {
        hex::encode(self.state.lock().state_root())
    }

    /// Plan under the lock, commit, then deliver notifications.
    fn run<T>(
        &self,
        event: Option<&str>,
        plan_event: impl FnOnce(&LedgerState, &mut EventPlan) -> Result<T>,
    ) -> Result<T> {
        let now = Utc::now();
        let (value, notifications) = {
            let mut state = self.state.lock();
            let mut plan = EventPlan::new(state.ids(), now);
            let value = plan_event(&*state, &mut plan)?;
            if !plan.mutations.is_empty() || event.is_some() {
                state.apply_mutations(&plan.mutations, event, now)?;
            }
            (value, plan.notifications())
        };
        for notification in &notifications {
            self.sink.deliver(notification);
        }
        Ok(value)
    }

    /// Create a member, link it into the closure table and pay the
    /// registration bonus to its referrer.
    #[instrument(skip(self, attrs), fields(identity = attrs.identity_key))]
    pub fn register(&self, attrs: NewMember, referrer_code: Option<&str>) -> Result<Member> {
        let referrer_code = referrer_code.map(str::trim).filter(|code| !code.is_empty());
        let calc = BonusCalculator::new(&self.config);

        let member = self.run(None, |state, plan| {
            if state.member_by_identity(attrs.identity_key).is_some() {
                warn!("identity already registered");
                return Err(ReferralError::Conflict(format!(
                    "identity {} is already registered",
                    attrs.identity_key
                )));
            }
            let referrer = match referrer_code {
                Some(code) => Some(state.member_by_code(code).ok_or_else(|| {
                    ReferralError::Validation(format!("invalid referral code '{code}'"))
                })?),
                None => None,
            };

            let member = Member {
                id: plan.ids.next_member(),
                identity_key: attrs.identity_key,
                username: attrs.username.clone(),
                first_name: attrs.first_name.clone(),
                last_name: attrs.last_name.clone(),
                referral_code: generate_referral_code(state),
                referrer: referrer.map(|r| r.id),
                user_type: attrs.user_type,
                rank: Default::default(),
                v_coins_balance: Decimal::ZERO,
                cash_balance: Decimal::ZERO,
                total_deposits: Decimal::ZERO,
                active_referrals_count: 0,
                is_admin: attrs.is_admin,
                is_blocked: false,
                created_at: plan.at,
            };
            plan.push(LedgerMutation::InsertMember {
                member: member.clone(),
            });

            let Some(referrer) = referrer else {
                return Ok(member);
            };

            let relations = closure::build_closure(
                state,
                self.config.max_depth,
                member.id,
                Some(referrer.id),
                plan.at,
            )?;
            debug!(rows = relations.len(), "closure rows planned");
            plan.push(LedgerMutation::LinkRelations { relations });

            if let Some(bonus) = calc.direct_bonus(referrer.user_type) {
                plan.pay(
                    referrer,
                    bonus,
                    &member,
                    1,
                    format!(
                        "Direct referral bonus from {} (level 1)",
                        member.display_name()
                    ),
                );
                plan.notify(
                    referrer.id,
                    "New Referral",
                    format!(
                        "{} joined using your referral link! You received {} {}",
                        member.display_name(),
                        bonus.amount,
                        bonus.currency.symbol()
                    ),
                    NotificationKind::ReferralBonus,
                );
            } else {
                debug!(referrer = referrer.id, "direct bonus is zero, nothing paid");
            }

            let active = referrer.active_referrals_count + 1;
            plan.push(LedgerMutation::SetActiveReferrals {
                member: referrer.id,
                count: active,
            });
            if let Some(change) = rank::evaluate(&self.config.rank_thresholds, referrer, active) {
                plan.rank_change(change);
            }
            Ok(member)
        })?;

        info!(member = member.id, referrer = ?member.referrer, "member registered");
        Ok(member)
    }

    /// Pay the one-time chain bonus for `member`'s first qualifying action
    /// (e.g. first tournament). Edges already paid are skipped, so a replay
    /// returns an empty list.
    #[instrument(skip(self))]
    pub fn complete_first_qualifying_action(
        &self,
        member: MemberId,
        action_id: &str,
    ) -> Result<Vec<BonusPayout>> {
        let calc = BonusCalculator::new(&self.config);

        let payouts = self.run(None, |state, plan| {
            let descendant = state.require_member(member)?;
            let mut payouts = Vec::new();

            for row in state.ancestors_of(member, None) {
                if row.has_paid_first_bonus {
                    continue;
                }
                let ancestor = state.require_member(row.ancestor)?;

                if row.level == 1 {
                    let paid = self
                        .config
                        .pay_direct_bonus_on_first_action
                        .then(|| calc.direct_bonus(ancestor.user_type))
                        .flatten();
                    if let Some(bonus) = paid {
                        payouts.push(plan.pay(
                            ancestor,
                            bonus,
                            descendant,
                            1,
                            format!(
                                "First tournament bonus from {} (level 1)",
                                descendant.display_name()
                            ),
                        ));
                    }

                    let active = state.direct_referral_count(ancestor.id);
                    if active != ancestor.active_referrals_count {
                        plan.push(LedgerMutation::SetActiveReferrals {
                            member: ancestor.id,
                            count: active,
                        });
                    }
                    if let Some(change) =
                        rank::evaluate(&self.config.rank_thresholds, ancestor, active)
                    {
                        plan.rank_change(change);
                    }

                    if let Some(bonus) = paid {
                        plan.notify(
                            ancestor.id,
                            "Tournament Bonus",
                            format!(
                                "{} completed their first tournament! You received {} {}",
                                descendant.display_name(),
                                bonus.amount,
                                bonus.currency.symbol()
                            ),
                            NotificationKind::TournamentBonus,
                        );
                    }
                } else if let Some(bonus) =
                    calc.depth_bonus(ancestor.user_type, ancestor.rank, row.level)
                {
                    payouts.push(plan.pay(
                        ancestor,
                        bonus,
                        descendant,
                        row.level,
                        format!(
                            "Depth bonus from {} (level {})",
                            descendant.display_name(),
                            row.level
                        ),
                    ));
                    plan.notify(
                        ancestor.id,
                        "Depth Bonus",
                        format!(
                            "Level {} referral {} completed first tournament! You received {} {}",
                            row.level,
                            descendant.display_name(),
                            bonus.amount,
                            bonus.currency.symbol()
                        ),
                        NotificationKind::TournamentBonus,
                    );
                } else {
                    debug!(ancestor = ancestor.id, level = row.level, "no depth bonus");
                }

                plan.push(LedgerMutation::MarkFirstBonusPaid {
                    ancestor: row.ancestor,
                    descendant: member,
                });
            }
            Ok(payouts)
        })?;

        info!(payouts = payouts.len(), "first qualifying action settled");
        Ok(payouts)
    }

    /// Record a deposit and pay the recurring deposit share to a level-1
    /// influencer. Each `deposit_id` is accepted once.
    #[instrument(skip(self, amount), fields(amount = %amount))]
    pub fn process_deposit(
        &self,
        member: MemberId,
        amount: Decimal,
        deposit_id: &str,
    ) -> Result<Vec<BonusPayout>> {
        let amount = money::validate_amount(amount).map_err(|err| {
            warn!("rejected deposit amount");
            err
        })?;
        let deposit_id = deposit_id.trim();
        if deposit_id.is_empty() {
            return Err(ReferralError::Validation("deposit id is required".into()));
        }
        let event = format!("deposit:{deposit_id}");
        let calc = BonusCalculator::new(&self.config);
        let percent = (self.config.deposit_percent * Decimal::ONE_HUNDRED).normalize();

        let payouts = self.run(Some(&event), |state, plan| {
            let depositor = state.require_member(member)?;
            if state.is_event_applied(&event) {
                return Err(ReferralError::Conflict(format!(
                    "deposit {deposit_id} was already processed"
                )));
            }
            plan.push(LedgerMutation::RecordDeposit { member, amount });

            let mut payouts = Vec::new();
            let Some(row) = state.direct_relation(member) else {
                return Ok(payouts);
            };
            let referrer = state.require_member(row.ancestor)?;
            if let Some(bonus) = calc.deposit_bonus(referrer.user_type, row.level, amount) {
                payouts.push(plan.pay(
                    referrer,
                    bonus,
                    depositor,
                    row.level,
                    format!(
                        "{percent}% from {} deposit of {amount}{} (level 1)",
                        depositor.display_name(),
                        Currency::Cash.symbol()
                    ),
                ));
                plan.notify(
                    referrer.id,
                    "Deposit Bonus",
                    format!(
                        "{} made a deposit of {amount}{}! You received {}{} ({percent}%)",
                        depositor.display_name(),
                        Currency::Cash.symbol(),
                        bonus.amount,
                        Currency::Cash.symbol()
                    ),
                    NotificationKind::DepositBonus,
                );
            }
            Ok(payouts)
        })?;

        info!(payouts = payouts.len(), "deposit processed");
        Ok(payouts)
    }

    /// Read-only referral tree of `member`, `max_depth` clamped to
    /// `[1, config.max_depth]`.
    pub fn referral_chain(
        &self,
        actor: MemberId,
        member: MemberId,
        max_depth: u32,
    ) -> Result<ReferralTree> {
        let state = self.state.lock();
        let principal = principal(&state, actor)?;
        ensure_can_view(principal, member)?;
        let depth = max_depth.clamp(1, self.config.max_depth);
        tree::build_tree(&state, member, depth)
    }

    pub fn referral_stats(&self, actor: MemberId, member: MemberId) -> Result<ReferralStats> {
        let state = self.state.lock();
        let principal = principal(&state, actor)?;
        ensure_can_view(principal, member)?;
        tree::referral_stats(&state, member, self.config.max_depth)
    }

    /// Ancestor rows of `member`, ascending by level.
    pub fn ancestors(&self, member: MemberId) -> Result<Vec<ReferralRelation>> {
        let state = self.state.lock();
        state.require_member(member)?;
        Ok(state
            .ancestors_of(member, None)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn member(&self, id: MemberId) -> Result<Member> {
        self.state.lock().require_member(id).cloned()
    }

    pub fn member_by_code(&self, code: &str) -> Result<Member> {
        self.state
            .lock()
            .member_by_code(code.trim())
            .cloned()
            .ok_or_else(|| ReferralError::NotFound {
                entity: "referral code",
                key: code.to_string(),
            })
    }

    /// Ledger entries of `member`, newest first.
    pub fn transactions(&self, member: MemberId) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock();
        state.require_member(member)?;
        Ok(state.entries_for(member).into_iter().cloned().collect())
    }

    pub fn notifications(&self, member: MemberId) -> Result<Vec<Notification>> {
        let state = self.state.lock();
        state.require_member(member)?;
        Ok(state.notifications_for(member).into_iter().cloned().collect())
    }

    /// Returns how many notifications were unread.
    pub fn mark_notifications_read(&self, member: MemberId) -> Result<usize> {
        self.run(None, |state, plan| {
            state.require_member(member)?;
            let unread = state
                .notifications_for(member)
                .iter()
                .filter(|n| !n.is_read)
                .count();
            if unread > 0 {
                plan.push(LedgerMutation::MarkNotificationsRead { member });
            }
            Ok(unread)
        })
    }

    pub fn withdrawals(&self, member: MemberId) -> Result<Vec<Withdrawal>> {
        let state = self.state.lock();
        state.require_member(member)?;
        Ok(state.withdrawals_for(member).into_iter().cloned().collect())
    }

    /// File a pending cash withdrawal. Only influencers may withdraw.
    #[instrument(skip(self, amount, wallet_address), fields(amount = %amount))]
    pub fn request_withdrawal(
        &self,
        actor: MemberId,
        amount: Decimal,
        method: WithdrawalMethod,
        wallet_address: &str,
    ) -> Result<Withdrawal> {
        let amount = money::validate_amount(amount)?;
        let wallet_address = wallet_address.trim();
        if wallet_address.is_empty() {
            return Err(ReferralError::Validation("wallet address is required".into()));
        }

        let withdrawal = self.run(None, |state, plan| {
            let principal = principal(state, actor)?;
            if principal.user_type != UserType::Influencer {
                return Err(ReferralError::PermissionDenied(
                    "only influencers can withdraw funds".into(),
                ));
            }
            if principal.cash_balance < amount {
                return Err(ReferralError::Validation(format!(
                    "insufficient balance: {} < {amount}",
                    principal.cash_balance
                )));
            }
            let withdrawal = Withdrawal {
                id: plan.ids.next_withdrawal(),
                user: principal.id,
                amount,
                method,
                wallet_address: wallet_address.to_string(),
                status: WithdrawalStatus::Pending,
                rejection_reason: None,
                created_at: plan.at,
                processed_at: None,
            };
            plan.push(LedgerMutation::PutWithdrawal {
                withdrawal: withdrawal.clone(),
            });
            Ok(withdrawal)
        })?;

        info!(withdrawal = withdrawal.id, "withdrawal requested");
        Ok(withdrawal)
    }

    /// Approve or reject a pending withdrawal (admins only). Approval debits
    /// the cash balance; if it no longer covers the amount the request is
    /// rejected instead.
    #[instrument(skip(self))]
    pub fn review_withdrawal(
        &self,
        actor: MemberId,
        withdrawal: WithdrawalId,
        decision: WithdrawalDecision,
    ) -> Result<Withdrawal> {
        let reviewed = self.run(None, |state, plan| {
            let admin = principal(state, actor)?;
            if !admin.is_admin {
                return Err(ReferralError::PermissionDenied(
                    "admin access required".into(),
                ));
            }
            let current = state
                .withdrawal(withdrawal)
                .ok_or_else(|| ReferralError::NotFound {
                    entity: "withdrawal",
                    key: withdrawal.to_string(),
                })?;
            if current.status != WithdrawalStatus::Pending {
                return Err(ReferralError::Conflict(format!(
                    "withdrawal {withdrawal} was already processed"
                )));
            }
            let owner = state.require_member(current.user)?;

            let mut updated = current.clone();
            updated.processed_at = Some(plan.at);
            let rejection = match decision {
                WithdrawalDecision::Approve if owner.cash_balance >= current.amount => {
                    updated.status = WithdrawalStatus::Approved;
                    plan.push(LedgerMutation::Debit {
                        member: owner.id,
                        currency: Currency::Cash,
                        amount: current.amount,
                    });
                    plan.entry(
                        owner.id,
                        current.amount,
                        Currency::Cash,
                        EntryKind::Withdrawal,
                        None,
                        format!(
                            "Withdrawal to {}: {}",
                            current.method, current.wallet_address
                        ),
                    );
                    plan.notify(
                        owner.id,
                        "Withdrawal Approved",
                        format!(
                            "Your withdrawal request for {}{} has been approved and processed.",
                            current.amount,
                            Currency::Cash.symbol()
                        ),
                        NotificationKind::WithdrawalApproved,
                    );
                    None
                }
                WithdrawalDecision::Approve => Some("insufficient balance".to_string()),
                WithdrawalDecision::Reject { reason } => {
                    Some(reason.unwrap_or_else(|| "not specified".to_string()))
                }
            };
            if let Some(reason) = rejection {
                updated.status = WithdrawalStatus::Rejected;
                plan.notify(
                    owner.id,
                    "Withdrawal Rejected",
                    format!(
                        "Your withdrawal request for {}{} has been rejected. Reason: {reason}",
                        current.amount,
                        Currency::Cash.symbol()
                    ),
                    NotificationKind::WithdrawalRejected,
                );
                updated.rejection_reason = Some(reason);
            }
            plan.push(LedgerMutation::PutWithdrawal {
                withdrawal: updated.clone(),
            });
            Ok(updated)
        })?;

        info!(status = ?reviewed.status, "withdrawal reviewed");
        Ok(reviewed)
    }

    /// Block or unblock `member` (admins only).
    #[instrument(skip(self))]
    pub fn set_blocked(&self, actor: MemberId, member: MemberId, blocked: bool) -> Result<Member> {
        self.run(None, |state, plan| {
            let admin = principal(state, actor)?;
            if !admin.is_admin {
                return Err(ReferralError::PermissionDenied(
                    "admin access required".into(),
                ));
            }
            if admin.id == member {
                return Err(ReferralError::Validation(
                    "admins cannot change their own blocked flag".into(),
                ));
            }
            let mut target = state.require_member(member)?.clone();
            target.is_blocked = blocked;
            plan.push(LedgerMutation::SetBlocked { member, blocked });
            Ok(target)
        })
    }
}

/// Resolve the acting member; blocked members cannot act.
fn principal(state: &LedgerState, actor: MemberId) -> Result<&Member> {
    let member = state.require_member(actor)?;
    if member.is_blocked {
        return Err(ReferralError::PermissionDenied(format!(
            "member {actor} is blocked"
        )));
    }
    Ok(member)
}

fn ensure_can_view(principal: &Member, target: MemberId) -> Result<()> {
    if principal.id != target && !principal.is_admin {
        return Err(ReferralError::PermissionDenied(format!(
            "member {} may not read member {target}",
            principal.id
        )));
    }
    Ok(())
}

fn generate_referral_code(state: &LedgerState) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !state.code_in_use(&code) {
            return code;
        }
    }
}
