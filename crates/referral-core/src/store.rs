use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{ReferralError, Result},
    model::{
        Currency, EntryId, LedgerEntry, Member, MemberId, Notification, NotificationId, Rank,
        ReferralRelation, Withdrawal, WithdrawalId, WithdrawalStatus,
    },
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Number of committed batches.
    pub height: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_event: Option<String>,
}

/// Last identifiers handed out by the store.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IdAllocator {
    pub member: MemberId,
    pub entry: EntryId,
    pub notification: NotificationId,
    pub withdrawal: WithdrawalId,
}

impl IdAllocator {
    pub fn next_member(&mut self) -> MemberId {
        self.member += 1;
        self.member
    }

    pub fn next_entry(&mut self) -> EntryId {
        self.entry += 1;
        self.entry
    }

    pub fn next_notification(&mut self) -> NotificationId {
        self.notification += 1;
        self.notification
    }

    pub fn next_withdrawal(&mut self) -> WithdrawalId {
        self.withdrawal += 1;
        self.withdrawal
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    InsertMember {
        member: Member,
    },
    /// Conflict-tolerant: rows whose (ancestor, descendant) pair already
    /// exists are skipped, never overwritten.
    LinkRelations {
        relations: Vec<ReferralRelation>,
    },
    Credit {
        member: MemberId,
        currency: Currency,
        amount: Decimal,
    },
    Debit {
        member: MemberId,
        currency: Currency,
        amount: Decimal,
    },
    RecordDeposit {
        member: MemberId,
        amount: Decimal,
    },
    SetActiveReferrals {
        member: MemberId,
        count: u32,
    },
    SetRank {
        member: MemberId,
        rank: Rank,
    },
    SetBlocked {
        member: MemberId,
        blocked: bool,
    },
    MarkFirstBonusPaid {
        ancestor: MemberId,
        descendant: MemberId,
    },
    AppendEntry {
        entry: LedgerEntry,
    },
    Notify {
        notification: Notification,
    },
    MarkNotificationsRead {
        member: MemberId,
    },
    PutWithdrawal {
        withdrawal: Withdrawal,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub ids: IdAllocator,
    pub members: Vec<Member>,
    pub relations: Vec<ReferralRelation>,
    pub entries: Vec<LedgerEntry>,
    pub notifications: Vec<Notification>,
    pub withdrawals: Vec<Withdrawal>,
    pub applied_events: Vec<String>,
    /// Hex SHA-256 merkle root over balances, relation rows and entries.
    pub state_root: String,
}

impl LedgerSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Account store, closure table and append-only ledger.
///
/// Every write goes through [`LedgerState::apply_mutations`], which
/// validates the whole batch before touching anything.
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    ids: IdAllocator,
    members: BTreeMap<MemberId, Member>,
    identities: BTreeMap<i64, MemberId>,
    codes: BTreeMap<String, MemberId>,
    referrals: BTreeMap<MemberId, Vec<MemberId>>,
    // keyed (descendant, ancestor)
    relations: BTreeMap<(MemberId, MemberId), ReferralRelation>,
    descendants: BTreeMap<MemberId, BTreeSet<MemberId>>,
    entries: Vec<LedgerEntry>,
    notifications: Vec<Notification>,
    withdrawals: BTreeMap<WithdrawalId, Withdrawal>,
    applied_events: BTreeSet<String>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> IdAllocator {
        self.ids
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn require_member(&self, id: MemberId) -> Result<&Member> {
        self.members
            .get(&id)
            .ok_or_else(|| ReferralError::member_not_found(id))
    }

    pub fn member_by_code(&self, code: &str) -> Option<&Member> {
        self.codes.get(code).and_then(|id| self.members.get(id))
    }

    pub fn member_by_identity(&self, identity_key: i64) -> Option<&Member> {
        self.identities
            .get(&identity_key)
            .and_then(|id| self.members.get(id))
    }

    pub fn code_in_use(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    /// Members whose `referrer` is `id`, in registration order.
    pub fn direct_referrals(&self, id: MemberId) -> &[MemberId] {
        self.referrals.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn direct_referral_count(&self, id: MemberId) -> u32 {
        self.direct_referrals(id).len() as u32
    }

    pub fn relation(&self, ancestor: MemberId, descendant: MemberId) -> Option<&ReferralRelation> {
        self.relations.get(&(descendant, ancestor))
    }

    /// Ancestor rows of `descendant`, ascending by level. With `below` set,
    /// only rows with `level < below` are returned.
    pub fn ancestors_of(&self, descendant: MemberId, below: Option<u32>) -> Vec<&ReferralRelation> {
        let mut rows: Vec<&ReferralRelation> = self
            .relations
            .range((descendant, MemberId::MIN)..=(descendant, MemberId::MAX))
            .map(|(_, row)| row)
            .filter(|row| below.map_or(true, |limit| row.level < limit))
            .collect();
        rows.sort_by_key(|row| row.level);
        rows
    }

    pub fn direct_relation(&self, descendant: MemberId) -> Option<&ReferralRelation> {
        self.ancestors_of(descendant, Some(2)).into_iter().next()
    }

    /// Descendant rows of `ancestor` with `level <= max_level`, ordered by
    /// level then registration order.
    pub fn descendants_of(&self, ancestor: MemberId, max_level: u32) -> Vec<&ReferralRelation> {
        let mut rows: Vec<&ReferralRelation> = self
            .descendants
            .get(&ancestor)
            .into_iter()
            .flatten()
            .filter_map(|descendant| self.relations.get(&(*descendant, ancestor)))
            .filter(|row| row.level <= max_level)
            .collect();
        rows.sort_by_key(|row| (row.level, row.descendant));
        rows
    }

    pub fn descendant_count(&self, ancestor: MemberId) -> usize {
        self.descendants.get(&ancestor).map_or(0, BTreeSet::len)
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Ledger entries of `member`, newest first.
    pub fn entries_for(&self, member: MemberId) -> Vec<&LedgerEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.user == member)
            .collect()
    }

    /// Notifications of `member`, newest first.
    pub fn notifications_for(&self, member: MemberId) -> Vec<&Notification> {
        self.notifications
            .iter()
            .rev()
            .filter(|n| n.user == member)
            .collect()
    }

    pub fn withdrawal(&self, id: WithdrawalId) -> Option<&Withdrawal> {
        self.withdrawals.get(&id)
    }

    pub fn withdrawals_for(&self, member: MemberId) -> Vec<&Withdrawal> {
        self.withdrawals
            .values()
            .rev()
            .filter(|w| w.user == member)
            .collect()
    }

    pub fn is_event_applied(&self, key: &str) -> bool {
        self.applied_events.contains(key)
    }

    /// Commit a batch atomically. `event` is recorded so the same key cannot
    /// be applied twice.
    pub fn apply_mutations(
        &mut self,
        mutations: &[LedgerMutation],
        event: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(key) = event {
            if self.applied_events.contains(key) {
                return Err(ReferralError::Conflict(format!(
                    "event {key} was already applied"
                )));
            }
        }

        self.check_batch(mutations)?;

        for mutation in mutations {
            self.apply_one(mutation);
        }

        self.meta.height += 1;
        self.meta.updated_at = Some(at);
        self.meta.last_event = event.map(str::to_owned);
        if let Some(key) = event {
            self.applied_events.insert(key.to_owned());
        }
        Ok(())
    }

    fn check_batch<'a>(&'a self, mutations: &'a [LedgerMutation]) -> Result<()> {
        let mut batch = BatchView::new(self);
        for mutation in mutations {
            match mutation {
                LedgerMutation::InsertMember { member } => {
                    if self.members.contains_key(&member.id) || batch.members.contains_key(&member.id)
                    {
                        return Err(ReferralError::Conflict(format!(
                            "member id {} already exists",
                            member.id
                        )));
                    }
                    if self.identities.contains_key(&member.identity_key)
                        || !batch.identities.insert(member.identity_key)
                    {
                        return Err(ReferralError::Conflict(format!(
                            "identity {} is already registered",
                            member.identity_key
                        )));
                    }
                    if self.codes.contains_key(&member.referral_code)
                        || !batch.codes.insert(member.referral_code.as_str())
                    {
                        return Err(ReferralError::Conflict(format!(
                            "referral code {} is already taken",
                            member.referral_code
                        )));
                    }
                    if let Some(referrer) = member.referrer {
                        if referrer == member.id {
                            return Err(ReferralError::Invariant(format!(
                                "member {} cannot refer itself",
                                member.id
                            )));
                        }
                        batch.require_member(referrer)?;
                    }
                    if member.v_coins_balance < Decimal::ZERO
                        || member.cash_balance < Decimal::ZERO
                    {
                        return Err(ReferralError::Invariant(format!(
                            "member {} created with a negative balance",
                            member.id
                        )));
                    }
                    batch.members.insert(member.id, member);
                }
                LedgerMutation::LinkRelations { relations } => {
                    for row in relations {
                        batch.require_member(row.ancestor)?;
                        batch.require_member(row.descendant)?;
                        if row.ancestor == row.descendant || row.level == 0 {
                            return Err(ReferralError::Invariant(format!(
                                "invalid relation {} -> {} at level {}",
                                row.ancestor, row.descendant, row.level
                            )));
                        }
                        batch.relations.insert((row.descendant, row.ancestor));
                    }
                }
                LedgerMutation::Credit {
                    member,
                    currency,
                    amount,
                } => {
                    if *amount < Decimal::ZERO {
                        return Err(ReferralError::Invariant(format!(
                            "negative credit of {amount} to member {member}"
                        )));
                    }
                    let balance = batch.balance_mut(*member, *currency)?;
                    *balance += *amount;
                }
                LedgerMutation::Debit {
                    member,
                    currency,
                    amount,
                } => {
                    if *amount < Decimal::ZERO {
                        return Err(ReferralError::Invariant(format!(
                            "negative debit of {amount} from member {member}"
                        )));
                    }
                    let balance = batch.balance_mut(*member, *currency)?;
                    if *balance < *amount {
                        return Err(ReferralError::Invariant(format!(
                            "debit of {amount} would make member {member} balance negative"
                        )));
                    }
                    *balance -= *amount;
                }
                LedgerMutation::RecordDeposit { member, amount } => {
                    batch.require_member(*member)?;
                    if *amount <= Decimal::ZERO {
                        return Err(ReferralError::Invariant(format!(
                            "non-positive deposit {amount} for member {member}"
                        )));
                    }
                }
                LedgerMutation::SetActiveReferrals { member, .. }
                | LedgerMutation::SetRank { member, .. }
                | LedgerMutation::SetBlocked { member, .. }
                | LedgerMutation::MarkNotificationsRead { member } => {
                    batch.require_member(*member)?;
                }
                LedgerMutation::MarkFirstBonusPaid {
                    ancestor,
                    descendant,
                } => {
                    let key = (*descendant, *ancestor);
                    if !self.relations.contains_key(&key) && !batch.relations.contains(&key) {
                        return Err(ReferralError::NotFound {
                            entity: "relation",
                            key: format!("{ancestor}->{descendant}"),
                        });
                    }
                }
                LedgerMutation::AppendEntry { entry } => {
                    batch.require_member(entry.user)?;
                    if entry.id <= batch.last_entry {
                        return Err(ReferralError::Invariant(format!(
                            "ledger entry {} is not newer than {}",
                            entry.id, batch.last_entry
                        )));
                    }
                    if entry.amount <= Decimal::ZERO {
                        return Err(ReferralError::Invariant(format!(
                            "ledger entry {} has non-positive amount {}",
                            entry.id, entry.amount
                        )));
                    }
                    batch.last_entry = entry.id;
                }
                LedgerMutation::Notify { notification } => {
                    batch.require_member(notification.user)?;
                    if notification.id <= batch.last_notification {
                        return Err(ReferralError::Invariant(format!(
                            "notification {} is not newer than {}",
                            notification.id, batch.last_notification
                        )));
                    }
                    batch.last_notification = notification.id;
                }
                LedgerMutation::PutWithdrawal { withdrawal } => {
                    batch.require_member(withdrawal.user)?;
                    match self.withdrawals.get(&withdrawal.id) {
                        Some(current) if current.status != WithdrawalStatus::Pending => {
                            return Err(ReferralError::Conflict(format!(
                                "withdrawal {} was already processed",
                                withdrawal.id
                            )));
                        }
                        Some(_) => {}
                        None if withdrawal.id <= self.ids.withdrawal => {
                            return Err(ReferralError::NotFound {
                                entity: "withdrawal",
                                key: withdrawal.id.to_string(),
                            });
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_one(&mut self, mutation: &LedgerMutation) {
        match mutation {
            LedgerMutation::InsertMember { member } => self.insert_member(member.clone()),
            LedgerMutation::LinkRelations { relations } => {
                for row in relations {
                    self.insert_relation(row.clone());
                }
            }
            LedgerMutation::Credit {
                member,
                currency,
                amount,
            } => {
                if let Some(m) = self.members.get_mut(member) {
                    *m.balance_mut(*currency) += *amount;
                }
            }
            LedgerMutation::Debit {
                member,
                currency,
                amount,
            } => {
                if let Some(m) = self.members.get_mut(member) {
                    *m.balance_mut(*currency) -= *amount;
                }
            }
            LedgerMutation::RecordDeposit { member, amount } => {
                if let Some(m) = self.members.get_mut(member) {
                    m.total_deposits += *amount;
                }
            }
            LedgerMutation::SetActiveReferrals { member, count } => {
                if let Some(m) = self.members.get_mut(member) {
                    m.active_referrals_count = *count;
                }
            }
            LedgerMutation::SetRank { member, rank } => {
                if let Some(m) = self.members.get_mut(member) {
                    m.rank = *rank;
                }
            }
            LedgerMutation::SetBlocked { member, blocked } => {
                if let Some(m) = self.members.get_mut(member) {
                    m.is_blocked = *blocked;
                }
            }
            LedgerMutation::MarkFirstBonusPaid {
                ancestor,
                descendant,
            } => {
                if let Some(row) = self.relations.get_mut(&(*descendant, *ancestor)) {
                    row.has_paid_first_bonus = true;
                }
            }
            LedgerMutation::AppendEntry { entry } => {
                self.ids.entry = self.ids.entry.max(entry.id);
                self.entries.push(entry.clone());
            }
            LedgerMutation::Notify { notification } => {
                self.ids.notification = self.ids.notification.max(notification.id);
                self.notifications.push(notification.clone());
            }
            LedgerMutation::MarkNotificationsRead { member } => {
                for n in self.notifications.iter_mut().filter(|n| n.user == *member) {
                    n.is_read = true;
                }
            }
            LedgerMutation::PutWithdrawal { withdrawal } => {
                self.ids.withdrawal = self.ids.withdrawal.max(withdrawal.id);
                self.withdrawals.insert(withdrawal.id, withdrawal.clone());
            }
        }
    }

    fn insert_member(&mut self, member: Member) {
        self.ids.member = self.ids.member.max(member.id);
        self.identities.insert(member.identity_key, member.id);
        self.codes.insert(member.referral_code.clone(), member.id);
        if let Some(referrer) = member.referrer {
            self.referrals.entry(referrer).or_default().push(member.id);
        }
        self.members.insert(member.id, member);
    }

    /// Returns `false` when the pair already existed.
    fn insert_relation(&mut self, row: ReferralRelation) -> bool {
        let key = (row.descendant, row.ancestor);
        if self.relations.contains_key(&key) {
            return false;
        }
        self.descendants
            .entry(row.ancestor)
            .or_default()
            .insert(row.descendant);
        self.relations.insert(key, row);
        true
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_merkle_root(&self.members, &self.relations, &self.entries)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            ids: self.ids,
            members: self.members.values().cloned().collect(),
            relations: self.relations.values().cloned().collect(),
            entries: self.entries.clone(),
            notifications: self.notifications.clone(),
            withdrawals: self.withdrawals.values().cloned().collect(),
            applied_events: self.applied_events.iter().cloned().collect(),
            state_root: hex::encode(self.state_root()),
        }
    }

    /// Rebuild a store from a snapshot, refusing one whose root no longer
    /// matches its contents.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self> {
        let mut state = LedgerState {
            meta: snapshot.meta,
            ids: snapshot.ids,
            ..LedgerState::default()
        };
        for member in snapshot.members {
            if state.members.contains_key(&member.id)
                || state.identities.contains_key(&member.identity_key)
            {
                return Err(ReferralError::Invariant(format!(
                    "snapshot contains member {} twice",
                    member.id
                )));
            }
            state.insert_member(member);
        }
        for referred in state.referrals.values_mut() {
            referred.sort_unstable();
        }
        for row in snapshot.relations {
            if !state.members.contains_key(&row.ancestor)
                || !state.members.contains_key(&row.descendant)
            {
                return Err(ReferralError::Invariant(format!(
                    "snapshot relation {} -> {} references an unknown member",
                    row.ancestor, row.descendant
                )));
            }
            if !state.insert_relation(row) {
                return Err(ReferralError::Invariant(
                    "snapshot contains a duplicate relation row".into(),
                ));
            }
        }
        for entry in &snapshot.entries {
            state.ids.entry = state.ids.entry.max(entry.id);
        }
        for n in &snapshot.notifications {
            state.ids.notification = state.ids.notification.max(n.id);
        }
        state.entries = snapshot.entries;
        state.notifications = snapshot.notifications;
        for w in snapshot.withdrawals {
            state.ids.withdrawal = state.ids.withdrawal.max(w.id);
            state.withdrawals.insert(w.id, w);
        }
        state.applied_events = snapshot.applied_events.into_iter().collect();

        let root = hex::encode(state.state_root());
        if root != snapshot.state_root {
            return Err(ReferralError::Invariant(format!(
                "snapshot root mismatch: recorded {}, computed {root}",
                snapshot.state_root
            )));
        }
        Ok(state)
    }
}

/// Projection of a batch over the committed state, used by the validation pass.
struct BatchView<'a> {
    state: &'a LedgerState,
    members: BTreeMap<MemberId, &'a Member>,
    identities: BTreeSet<i64>,
    codes: BTreeSet<&'a str>,
    relations: BTreeSet<(MemberId, MemberId)>,
    balances: BTreeMap<(MemberId, Currency), Decimal>,
    last_entry: EntryId,
    last_notification: NotificationId,
}

impl<'a> BatchView<'a> {
    fn new(state: &'a LedgerState) -> Self {
        Self {
            state,
            members: BTreeMap::new(),
            identities: BTreeSet::new(),
            codes: BTreeSet::new(),
            relations: BTreeSet::new(),
            balances: BTreeMap::new(),
            last_entry: state.ids.entry,
            last_notification: state.ids.notification,
        }
    }

    fn lookup(&self, id: MemberId) -> Option<&'a Member> {
        self.state
            .members
            .get(&id)
            .or_else(|| self.members.get(&id).copied())
    }

    fn require_member(&self, id: MemberId) -> Result<&'a Member> {
        self.lookup(id)
            .ok_or_else(|| ReferralError::member_not_found(id))
    }

    fn balance_mut(&mut self, id: MemberId, currency: Currency) -> Result<&mut Decimal> {
        let member = self.require_member(id)?;
        Ok(self
            .balances
            .entry((id, currency))
            .or_insert_with(|| member.balance(currency)))
    }
}

/// State root: one merkle subtree per record kind, joined under a
/// domain tag so a balance leaf can never collide with a relation leaf.
fn compute_merkle_root(
    members: &BTreeMap<MemberId, Member>,
    relations: &BTreeMap<(MemberId, MemberId), ReferralRelation>,
    entries: &[LedgerEntry],
) -> [u8; 32] {
    let balances: Vec<[u8; 32]> = members
        .values()
        .map(|member| -> [u8; 32] {
            Sha256::new()
                .chain_update(member.id.to_le_bytes())
                .chain_update(member.rank.as_str())
                .chain_update(member.v_coins_balance.to_string())
                .chain_update(member.cash_balance.to_string())
                .chain_update(member.total_deposits.to_string())
                .chain_update(member.active_referrals_count.to_le_bytes())
                .finalize()
                .into()
        })
        .collect();
    let edges: Vec<[u8; 32]> = relations
        .values()
        .map(|row| -> [u8; 32] {
            Sha256::new()
                .chain_update(row.ancestor.to_le_bytes())
                .chain_update(row.descendant.to_le_bytes())
                .chain_update(row.level.to_le_bytes())
                .chain_update([u8::from(row.has_paid_first_bonus)])
                .finalize()
                .into()
        })
        .collect();
    let ledger: Vec<[u8; 32]> = entries
        .iter()
        .map(|entry| -> [u8; 32] {
            Sha256::new()
                .chain_update(entry.id.to_le_bytes())
                .chain_update(entry.user.to_le_bytes())
                .chain_update(entry.amount.to_string())
                .chain_update(entry.currency.symbol())
                .finalize()
                .into()
        })
        .collect();

    Sha256::new()
        .chain_update(b"referral-state")
        .chain_update(subtree_root(b"members", balances))
        .chain_update(subtree_root(b"relations", edges))
        .chain_update(subtree_root(b"entries", ledger))
        .finalize()
        .into()
}

/// Pairwise fold under `tag`; an unpaired node is promoted unchanged.
fn subtree_root(tag: &[u8], mut level: Vec<[u8; 32]>) -> [u8; 32] {
    if level.is_empty() {
        return Sha256::new()
            .chain_update(tag)
            .chain_update(b"empty")
            .finalize()
            .into();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| -> [u8; 32] {
                match pair {
                    [left, right] => Sha256::new()
                        .chain_update(tag)
                        .chain_update(left)
                        .chain_update(right)
                        .finalize()
                        .into(),
                    _ => pair[0],
                }
            })
            .collect();
    }
    level[0]
}
