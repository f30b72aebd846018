use std::{sync::Arc, thread};

use referral_core::{
    model::{
        Currency, EntryKind, Member, NewMember, NotificationKind, Rank, UserType,
        WithdrawalDecision, WithdrawalMethod, WithdrawalStatus,
    },
    notify::MemorySink,
    store::LedgerSnapshot,
    BonusConfig, ReferralEngine, ReferralError,
};
use rust_decimal_macros::dec;

struct Fixture {
    engine: ReferralEngine,
    sink: Arc<MemorySink>,
    next_identity: i64,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(BonusConfig::default())
    }

    fn with_config(config: BonusConfig) -> Self {
        let sink = Arc::new(MemorySink::new());
        let engine = ReferralEngine::with_sink(config, sink.clone()).unwrap();
        Self {
            engine,
            sink,
            next_identity: 1000,
        }
    }

    fn join(&mut self, name: &str, user_type: UserType, referrer: Option<&Member>) -> Member {
        self.next_identity += 1;
        self.engine
            .register(
                NewMember::new(self.next_identity, name, user_type),
                referrer.map(|r| r.referral_code.as_str()),
            )
            .unwrap()
    }

    fn admin(&mut self) -> Member {
        self.next_identity += 1;
        let mut attrs = NewMember::new(self.next_identity, "Root", UserType::Player);
        attrs.is_admin = true;
        self.engine.register(attrs, None).unwrap()
    }

    /// m0 <- m1 <- ... <- m(len-1), all players.
    fn chain(&mut self, len: usize) -> Vec<Member> {
        let mut members: Vec<Member> = Vec::with_capacity(len);
        for i in 0..len {
            let member = self.join(&format!("m{i}"), UserType::Player, members.last());
            members.push(member);
        }
        members
    }

    fn reload(&self, member: &Member) -> Member {
        self.engine.member(member.id).unwrap()
    }
}

#[test]
fn registration_without_referrer_creates_no_rows() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    assert!(fx.engine.ancestors(a.id).unwrap().is_empty());
    assert_eq!(a.referral_code.len(), 8);
    assert_eq!(a.rank, Rank::Standard);
    assert!(fx.sink.delivered().is_empty());
}

#[test]
fn chain_links_every_ancestor_with_its_distance() {
    let mut fx = Fixture::new();
    let members = fx.chain(6);
    let last = members.last().unwrap();

    let rows = fx.engine.ancestors(last.id).unwrap();
    assert_eq!(rows.len(), 5);
    for (i, row) in rows.iter().enumerate() {
        let level = i as u32 + 1;
        assert_eq!(row.level, level);
        assert_eq!(row.ancestor, members[members.len() - 1 - level as usize].id);
        assert!(!row.has_paid_first_bonus);
    }
}

#[test]
fn closure_stops_at_max_depth() {
    let mut fx = Fixture::new();
    let members = fx.chain(12);
    let last = members.last().unwrap();

    let rows = fx.engine.ancestors(last.id).unwrap();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows.last().unwrap().level, 10);
    assert_eq!(rows.last().unwrap().ancestor, members[1].id);
    assert!(rows.iter().all(|row| row.ancestor != members[0].id));
}

#[test]
fn direct_bonus_is_paid_on_registration() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let i = fx.join("Ivy", UserType::Influencer, None);
    fx.join("Bob", UserType::Player, Some(&a));
    fx.join("Cat", UserType::Player, Some(&i));

    let a = fx.reload(&a);
    assert_eq!(a.v_coins_balance, dec!(1000));
    assert_eq!(a.cash_balance, dec!(0));
    assert_eq!(a.active_referrals_count, 1);

    let i = fx.reload(&i);
    assert_eq!(i.cash_balance, dec!(500));
    assert_eq!(i.v_coins_balance, dec!(0));

    let entries = fx.engine.transactions(i.id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::ReferralBonus);
    assert_eq!(entries[0].currency, Currency::Cash);
    assert_eq!(entries[0].description, "Direct referral bonus from Cat (level 1)");

    let notes = fx.engine.notifications(a.id).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].title, "New Referral");
}

#[test]
fn first_action_pays_referrer_once() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a));

    let payouts = fx.engine.complete_first_qualifying_action(b.id, "t-1").unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].recipient_id, a.id);
    assert_eq!(payouts[0].level, 1);
    assert_eq!(payouts[0].amount, dec!(1000));
    assert_eq!(payouts[0].currency, Currency::VCoins);
    assert_eq!(fx.reload(&a).v_coins_balance, dec!(2000));
    assert!(fx.engine.ancestors(b.id).unwrap()[0].has_paid_first_bonus);

    let root = fx.engine.state_root();
    let again = fx.engine.complete_first_qualifying_action(b.id, "t-2").unwrap();
    assert!(again.is_empty());
    assert_eq!(fx.reload(&a).v_coins_balance, dec!(2000));
    assert_eq!(fx.engine.state_root(), root);

    let titles: Vec<String> = fx
        .engine
        .notifications(a.id)
        .unwrap()
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(titles, vec!["Tournament Bonus", "New Referral"]);
}

#[test]
fn first_action_pays_depth_bonus_to_grandparent() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a));
    let c = fx.join("Cat", UserType::Player, Some(&b));

    let payouts = fx.engine.complete_first_qualifying_action(c.id, "t-1").unwrap();
    assert_eq!(payouts.len(), 2);
    assert_eq!((payouts[0].recipient_id, payouts[0].level), (b.id, 1));
    assert_eq!((payouts[1].recipient_id, payouts[1].level), (a.id, 2));
    assert_eq!(payouts[1].amount, dec!(100));
    assert!(payouts[0].transaction_id < payouts[1].transaction_id);
    assert!(fx
        .engine
        .ancestors(c.id)
        .unwrap()
        .iter()
        .all(|row| row.has_paid_first_bonus));
    // B's own edge to A is untouched by C's action.
    assert!(!fx.engine.ancestors(b.id).unwrap()[0].has_paid_first_bonus);

    // A: 1000 for B's registration plus the level-2 depth bonus.
    assert_eq!(fx.reload(&a).v_coins_balance, dec!(1100));
    // B: 1000 for C's registration plus 1000 for C's first action.
    assert_eq!(fx.reload(&b).v_coins_balance, dec!(2000));

    let a_entries = fx.engine.transactions(a.id).unwrap();
    assert_eq!(a_entries[0].kind, EntryKind::DepthBonus);
    assert_eq!(a_entries[0].related_user, Some(c.id));
    assert_eq!(a_entries[0].description, "Depth bonus from Cat (level 2)");
}

#[test]
fn deep_chain_pays_every_level_up_to_the_cap() {
    let mut fx = Fixture::new();
    let members = fx.chain(12);
    let last = members.last().unwrap();

    let payouts = fx
        .engine
        .complete_first_qualifying_action(last.id, "t-1")
        .unwrap();
    let levels: Vec<u32> = payouts.iter().map(|p| p.level).collect();
    assert_eq!(levels, (1..=10).collect::<Vec<_>>());
    assert!(payouts[1..].iter().all(|p| p.amount == dec!(100)));
    // m0 sits at level 11 and only holds its registration bonus for m1.
    assert_eq!(fx.reload(&members[0]).v_coins_balance, dec!(1000));
}

#[test]
fn depth_bonus_follows_ancestor_rank_and_type() {
    let mut fx = Fixture::new();
    let top = fx.join("Top", UserType::Influencer, None);
    let mid = fx.join("Mid", UserType::Player, Some(&top));
    for n in 0..4 {
        fx.join(&format!("extra{n}"), UserType::Player, Some(&top));
    }
    assert_eq!(fx.reload(&top).rank, Rank::Silver);

    let leaf = fx.join("Leaf", UserType::Player, Some(&mid));
    let payouts = fx.engine.complete_first_qualifying_action(leaf.id, "t").unwrap();
    let top_payout = payouts.iter().find(|p| p.recipient_id == top.id).unwrap();
    assert_eq!(top_payout.level, 2);
    assert_eq!(top_payout.amount, dec!(75));
    assert_eq!(top_payout.currency, Currency::Cash);
}

#[test]
fn fifth_referral_promotes_to_silver_once() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    for n in 0..4 {
        fx.join(&format!("r{n}"), UserType::Player, Some(&i));
    }
    assert_eq!(fx.reload(&i).rank, Rank::Standard);
    fx.sink.take();

    fx.join("r4", UserType::Player, Some(&i));
    let i = fx.reload(&i);
    assert_eq!(i.rank, Rank::Silver);
    assert_eq!(i.active_referrals_count, 5);
    assert_eq!(i.cash_balance, dec!(2500));

    let delivered = fx.sink.take();
    let upgrades: Vec<_> = delivered
        .iter()
        .filter(|n| n.kind == NotificationKind::RankUpgrade)
        .collect();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(upgrades[0].user, i.id);
    assert_eq!(
        upgrades[0].message,
        "Congratulations! Your rank has been upgraded from standard to silver"
    );

    fx.join("r5", UserType::Player, Some(&i));
    assert!(fx
        .sink
        .take()
        .iter()
        .all(|n| n.kind != NotificationKind::RankUpgrade));
}

#[test]
fn deposit_pays_influencer_referrer_ten_percent() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let p = fx.join("Pat", UserType::Player, Some(&i));

    let payouts = fx.engine.process_deposit(p.id, dec!(1000), "dep-1").unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].recipient_id, i.id);
    assert_eq!(payouts[0].amount, dec!(100.00));
    assert_eq!(payouts[0].currency, Currency::Cash);

    assert_eq!(fx.reload(&i).cash_balance, dec!(600));
    assert_eq!(fx.reload(&p).total_deposits, dec!(1000));

    let entry = &fx.engine.transactions(i.id).unwrap()[0];
    assert_eq!(entry.kind, EntryKind::DepositPercent);
    assert_eq!(entry.description, "10% from Pat deposit of 1000.00₽ (level 1)");
    assert_eq!(
        fx.engine.notifications(i.id).unwrap()[0].kind,
        NotificationKind::DepositBonus
    );
}

#[test]
fn deposit_under_player_referrer_pays_nothing() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let p = fx.join("Pat", UserType::Player, Some(&a));

    let payouts = fx.engine.process_deposit(p.id, dec!(250.50), "dep-1").unwrap();
    assert!(payouts.is_empty());
    assert_eq!(fx.reload(&p).total_deposits, dec!(250.50));
    assert_eq!(fx.reload(&a).cash_balance, dec!(0));
}

#[test]
fn deposit_only_reaches_the_direct_referrer() {
    let mut fx = Fixture::new();
    let top = fx.join("Top", UserType::Influencer, None);
    let mid = fx.join("Mid", UserType::Influencer, Some(&top));
    let leaf = fx.join("Leaf", UserType::Player, Some(&mid));

    let payouts = fx.engine.process_deposit(leaf.id, dec!(10), "dep-1").unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].recipient_id, mid.id);
    assert_eq!(fx.reload(&top).cash_balance, dec!(500));
}

#[test]
fn replayed_deposit_is_rejected_without_side_effects() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let p = fx.join("Pat", UserType::Player, Some(&i));

    fx.engine.process_deposit(p.id, dec!(40), "dep-7").unwrap();
    let root = fx.engine.state_root();
    let err = fx.engine.process_deposit(p.id, dec!(40), "dep-7").unwrap_err();
    assert!(matches!(err, ReferralError::Conflict(_)));
    assert_eq!(fx.engine.state_root(), root);
    assert_eq!(fx.reload(&i).cash_balance, dec!(504));
}

#[test]
fn events_for_unknown_members_are_not_found() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.engine.complete_first_qualifying_action(42, "t"),
        Err(ReferralError::NotFound { .. })
    ));
    assert!(matches!(
        fx.engine.process_deposit(42, dec!(5), "d"),
        Err(ReferralError::NotFound { .. })
    ));
}

#[test]
fn duplicate_identity_is_a_conflict() {
    let fx = Fixture::new();
    fx.engine
        .register(NewMember::new(7, "Ann", UserType::Player), None)
        .unwrap();
    let err = fx
        .engine
        .register(NewMember::new(7, "Ann", UserType::Player), None)
        .unwrap_err();
    assert!(matches!(err, ReferralError::Conflict(_)));
}

#[test]
fn referral_tree_nests_descendants_under_their_referrer() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a));
    let c = fx.join("Cat", UserType::Influencer, Some(&a));
    let d = fx.join("Dan", UserType::Player, Some(&b));

    let tree = fx.engine.referral_chain(a.id, a.id, 10).unwrap();
    assert_eq!(tree.depth, 10);
    assert_eq!(tree.total_referrals, 3);
    assert_eq!(tree.levels.get(&1), Some(&2));
    assert_eq!(tree.levels.get(&2), Some(&1));

    let ids: Vec<u64> = tree.children.iter().map(|n| n.member_id).collect();
    assert_eq!(ids, vec![b.id, c.id]);
    let b_node = &tree.children[0];
    assert_eq!(b_node.direct_referrals_count, 1);
    assert_eq!(b_node.children.len(), 1);
    assert_eq!(b_node.children[0].member_id, d.id);
    assert_eq!(b_node.children[0].level, 2);
    assert!(tree.children[1].children.is_empty());

    let shallow = fx.engine.referral_chain(a.id, a.id, 0).unwrap();
    assert_eq!(shallow.depth, 1);
    assert_eq!(shallow.total_referrals, 2);
    assert!(shallow.children.iter().all(|n| n.children.is_empty()));

    assert_eq!(fx.engine.referral_chain(a.id, a.id, 99).unwrap().depth, 10);
}

#[test]
fn only_self_or_admin_can_read_a_tree() {
    let mut fx = Fixture::new();
    let admin = fx.admin();
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a));

    assert!(matches!(
        fx.engine.referral_chain(b.id, a.id, 3),
        Err(ReferralError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.engine.referral_stats(b.id, a.id),
        Err(ReferralError::PermissionDenied(_))
    ));
    assert_eq!(
        fx.engine.referral_chain(admin.id, a.id, 3).unwrap().total_referrals,
        1
    );
}

#[test]
fn stats_sum_bonus_earnings() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let p = fx.join("Pat", UserType::Player, Some(&i));
    fx.join("Sam", UserType::Player, Some(&p));
    fx.engine.process_deposit(p.id, dec!(300), "d-1").unwrap();

    let stats = fx.engine.referral_stats(i.id, i.id).unwrap();
    assert_eq!(stats.direct_referrals, 1);
    assert_eq!(stats.total_referrals, 2);
    assert_eq!(stats.earned_cash, dec!(530));
    assert_eq!(stats.earned_v_coins, dec!(0));
}

#[test]
fn withdrawal_lifecycle() {
    let mut fx = Fixture::new();
    let admin = fx.admin();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let p = fx.join("Pat", UserType::Player, Some(&i));

    assert!(matches!(
        fx.engine
            .request_withdrawal(p.id, dec!(1), WithdrawalMethod::Card, "4111"),
        Err(ReferralError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.engine
            .request_withdrawal(i.id, dec!(600), WithdrawalMethod::Card, "4111"),
        Err(ReferralError::Validation(_))
    ));
    assert!(matches!(
        fx.engine
            .request_withdrawal(i.id, dec!(10), WithdrawalMethod::Card, "  "),
        Err(ReferralError::Validation(_))
    ));

    let w = fx
        .engine
        .request_withdrawal(i.id, dec!(200), WithdrawalMethod::Crypto, "0xabc")
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Pending);
    assert_eq!(fx.reload(&i).cash_balance, dec!(500));

    assert!(matches!(
        fx.engine
            .review_withdrawal(i.id, w.id, WithdrawalDecision::Approve),
        Err(ReferralError::PermissionDenied(_))
    ));

    let approved = fx
        .engine
        .review_withdrawal(admin.id, w.id, WithdrawalDecision::Approve)
        .unwrap();
    assert_eq!(approved.status, WithdrawalStatus::Approved);
    assert!(approved.processed_at.is_some());
    assert_eq!(fx.reload(&i).cash_balance, dec!(300));

    let entry = &fx.engine.transactions(i.id).unwrap()[0];
    assert_eq!(entry.kind, EntryKind::Withdrawal);
    assert_eq!(entry.description, "Withdrawal to crypto: 0xabc");

    assert!(matches!(
        fx.engine
            .review_withdrawal(admin.id, w.id, WithdrawalDecision::Approve),
        Err(ReferralError::Conflict(_))
    ));

    // Earned cash excludes the withdrawal.
    assert_eq!(
        fx.engine.referral_stats(i.id, i.id).unwrap().earned_cash,
        dec!(500)
    );
}

#[test]
fn approval_rejects_when_balance_no_longer_covers_it() {
    let mut fx = Fixture::new();
    let admin = fx.admin();
    let i = fx.join("Ivy", UserType::Influencer, None);
    fx.join("Pat", UserType::Player, Some(&i));

    let first = fx
        .engine
        .request_withdrawal(i.id, dec!(400), WithdrawalMethod::Card, "4111")
        .unwrap();
    let second = fx
        .engine
        .request_withdrawal(i.id, dec!(300), WithdrawalMethod::Card, "4111")
        .unwrap();

    fx.engine
        .review_withdrawal(admin.id, first.id, WithdrawalDecision::Approve)
        .unwrap();
    let second = fx
        .engine
        .review_withdrawal(admin.id, second.id, WithdrawalDecision::Approve)
        .unwrap();
    assert_eq!(second.status, WithdrawalStatus::Rejected);
    assert_eq!(second.rejection_reason.as_deref(), Some("insufficient balance"));
    assert_eq!(fx.reload(&i).cash_balance, dec!(100));

    let rejected = fx.engine.notifications(i.id).unwrap();
    assert_eq!(rejected[0].kind, NotificationKind::WithdrawalRejected);
}

#[test]
fn explicit_rejection_keeps_reason() {
    let mut fx = Fixture::new();
    let admin = fx.admin();
    let i = fx.join("Ivy", UserType::Influencer, None);
    fx.join("Pat", UserType::Player, Some(&i));
    let w = fx
        .engine
        .request_withdrawal(i.id, dec!(50), WithdrawalMethod::Card, "4111")
        .unwrap();

    let w = fx
        .engine
        .review_withdrawal(
            admin.id,
            w.id,
            WithdrawalDecision::Reject {
                reason: Some("card mismatch".into()),
            },
        )
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Rejected);
    assert_eq!(w.rejection_reason.as_deref(), Some("card mismatch"));
    assert_eq!(fx.reload(&i).cash_balance, dec!(500));
    assert_eq!(fx.engine.withdrawals(i.id).unwrap().len(), 1);
}

#[test]
fn blocked_members_cannot_act() {
    let mut fx = Fixture::new();
    let admin = fx.admin();
    let i = fx.join("Ivy", UserType::Influencer, None);
    fx.join("Pat", UserType::Player, Some(&i));

    assert!(matches!(
        fx.engine.set_blocked(i.id, admin.id, true),
        Err(ReferralError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.engine.set_blocked(admin.id, admin.id, true),
        Err(ReferralError::Validation(_))
    ));

    let blocked = fx.engine.set_blocked(admin.id, i.id, true).unwrap();
    assert!(blocked.is_blocked);
    assert!(matches!(
        fx.engine
            .request_withdrawal(i.id, dec!(10), WithdrawalMethod::Card, "4111"),
        Err(ReferralError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.engine.referral_chain(i.id, i.id, 2),
        Err(ReferralError::PermissionDenied(_))
    ));

    fx.engine.set_blocked(admin.id, i.id, false).unwrap();
    assert!(fx.engine.referral_chain(i.id, i.id, 2).is_ok());
}

#[test]
fn notifications_can_be_marked_read() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    fx.join("Bob", UserType::Player, Some(&a));
    fx.join("Cat", UserType::Player, Some(&a));

    assert_eq!(fx.engine.mark_notifications_read(a.id).unwrap(), 2);
    assert!(fx
        .engine
        .notifications(a.id)
        .unwrap()
        .iter()
        .all(|n| n.is_read));
    assert_eq!(fx.engine.mark_notifications_read(a.id).unwrap(), 0);
}

#[test]
fn concurrent_deposits_do_not_lose_updates() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let players: Vec<Member> = (0..8)
        .map(|n| fx.join(&format!("p{n}"), UserType::Player, Some(&i)))
        .collect();

    let engine = Arc::new(fx.engine);
    let handles: Vec<_> = players
        .into_iter()
        .map(|player| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for n in 0..25 {
                    engine
                        .process_deposit(player.id, dec!(10), &format!("{}-{n}", player.id))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 8 registrations at 500 plus 200 deposits at 1.00.
    let i = engine.member(i.id).unwrap();
    assert_eq!(i.cash_balance, dec!(4200));
    assert_eq!(engine.transactions(i.id).unwrap().len(), 208);
}

#[test]
fn concurrent_first_actions_pay_each_edge_once() {
    let mut fx = Fixture::new();
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a)).id;

    let engine = Arc::new(fx.engine);
    let handles: Vec<_> = (0..6)
        .map(|n| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .complete_first_qualifying_action(b, &format!("t-{n}"))
                    .unwrap()
                    .len()
            })
        })
        .collect();
    let paid: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(paid, 1);
    assert_eq!(engine.member(a.id).unwrap().v_coins_balance, dec!(2000));
}

#[test]
fn snapshot_round_trip_preserves_state_and_id_sequence() {
    let mut fx = Fixture::new();
    let i = fx.join("Ivy", UserType::Influencer, None);
    let p = fx.join("Pat", UserType::Player, Some(&i));
    fx.engine.process_deposit(p.id, dec!(99.99), "d-1").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fx.engine.snapshot().save(&path).unwrap();

    let restored = ReferralEngine::from_snapshot(
        BonusConfig::default(),
        LedgerSnapshot::load(&path).unwrap(),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    assert_eq!(restored.state_root(), fx.engine.state_root());
    assert_eq!(restored.member(i.id).unwrap().cash_balance, dec!(510.00));

    assert!(matches!(
        restored.process_deposit(p.id, dec!(99.99), "d-1"),
        Err(ReferralError::Conflict(_))
    ));
    let q = restored
        .register(NewMember::new(77, "Quin", UserType::Player), Some(&i.referral_code))
        .unwrap();
    assert_eq!(q.id, p.id + 1);
}

#[test]
fn custom_config_changes_amounts() {
    let config = BonusConfig::from_toml_str(
        r#"
        max_depth = 3
        player_direct_bonus = "250"

        [depth_bonuses.player]
        standard = "7.5"
        silver = "10"
        gold = "12.5"
        platinum = "15"
        "#,
    )
    .unwrap();
    let mut fx = Fixture::with_config(config);
    let members = fx.chain(5);
    let last = members.last().unwrap();

    assert_eq!(fx.engine.ancestors(last.id).unwrap().len(), 3);
    let payouts = fx
        .engine
        .complete_first_qualifying_action(last.id, "t")
        .unwrap();
    let amounts: Vec<_> = payouts.iter().map(|p| p.amount).collect();
    assert_eq!(amounts, vec![dec!(250), dec!(7.50), dec!(7.50)]);
}

#[test]
fn zero_direct_bonus_still_links_counts_and_ranks() {
    let config = BonusConfig::from_toml_str(r#"player_direct_bonus = "0""#).unwrap();
    let mut fx = Fixture::with_config(config);
    let a = fx.join("Ann", UserType::Player, None);
    let b = fx.join("Bob", UserType::Player, Some(&a));

    assert_eq!(fx.engine.ancestors(b.id).unwrap().len(), 1);
    let a_now = fx.reload(&a);
    assert_eq!(a_now.v_coins_balance, dec!(0));
    assert_eq!(a_now.active_referrals_count, 1);
    assert!(fx.engine.transactions(a.id).unwrap().is_empty());
    assert!(fx.engine.notifications(a.id).unwrap().is_empty());

    let payouts = fx.engine.complete_first_qualifying_action(b.id, "t-1").unwrap();
    assert!(payouts.is_empty());
    assert!(fx.engine.ancestors(b.id).unwrap()[0].has_paid_first_bonus);
    assert_eq!(fx.reload(&a).v_coins_balance, dec!(0));

    for n in 0..4 {
        fx.join(&format!("r{n}"), UserType::Player, Some(&a));
    }
    let a_now = fx.reload(&a);
    assert_eq!(a_now.rank, Rank::Silver);
    assert_eq!(a_now.active_referrals_count, 5);
    let notes = fx.engine.notifications(a.id).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::RankUpgrade);
}

#[test]
fn first_action_promotes_referrer_under_lowered_threshold() {
    let strict = BonusConfig::from_toml_str("[rank_thresholds]\nsilver = 10").unwrap();
    let mut fx = Fixture::with_config(strict);
    let ivy = fx.join("Ivy", UserType::Influencer, None);
    let referrals: Vec<Member> = (0..5)
        .map(|n| fx.join(&format!("p{n}"), UserType::Player, Some(&ivy)))
        .collect();
    assert_eq!(fx.reload(&ivy).rank, Rank::Standard);

    let sink = Arc::new(MemorySink::new());
    let engine =
        ReferralEngine::from_snapshot(BonusConfig::default(), fx.engine.snapshot(), sink.clone())
            .unwrap();

    let payouts = engine
        .complete_first_qualifying_action(referrals[0].id, "t-1")
        .unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].recipient_id, ivy.id);

    let promoted = engine.member(ivy.id).unwrap();
    assert_eq!(promoted.rank, Rank::Silver);
    assert_eq!(promoted.active_referrals_count, 5);
    assert_eq!(promoted.cash_balance, dec!(3000));

    let delivered = sink.take();
    let kinds: Vec<NotificationKind> = delivered.iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![NotificationKind::RankUpgrade, NotificationKind::TournamentBonus]
    );

    engine
        .complete_first_qualifying_action(referrals[1].id, "t-2")
        .unwrap();
    let after = engine.member(ivy.id).unwrap();
    assert_eq!(after.rank, Rank::Silver);
    assert_eq!(after.active_referrals_count, 5);
    assert!(sink
        .take()
        .iter()
        .all(|n| n.kind != NotificationKind::RankUpgrade));
}
