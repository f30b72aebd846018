use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use referral_core::{
    model::{MemberId, NewMember, UserType, WithdrawalDecision, WithdrawalId, WithdrawalMethod},
    money,
    notify::TracingSink,
    store::LedgerSnapshot,
    BonusConfig, ErrorKind, ReferralEngine, ReferralError,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

//==================== Аргументы ====================//

/// Referral ledger: closure-table graph, bonus distribution, withdrawals.
#[derive(Parser, Debug)]
#[command(name = "referral", version, about, long_about = None)]
struct Cli {
    /// JSON snapshot holding the ledger state (created on first write)
    #[arg(long, default_value = "referral_state.json")]
    state: PathBuf,

    /// TOML file with bonus amounts and rank thresholds
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a member, optionally under a referral code
    Register {
        #[arg(long)]
        identity: i64,
        #[arg(long)]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        influencer: bool,
        #[arg(long)]
        admin: bool,
        /// Referral code of the inviting member
        #[arg(long)]
        code: Option<String>,
    },
    /// Settle the first qualifying action (e.g. first tournament) of a member
    CompleteAction {
        member: MemberId,
        #[arg(long, default_value = "first-tournament")]
        action_id: String,
    },
    /// Record a deposit and pay the influencer share
    Deposit {
        member: MemberId,
        #[arg(value_parser = money::parse_amount)]
        amount: Decimal,
        #[arg(long)]
        deposit_id: String,
    },
    /// Referral tree of a member
    Chain {
        member: MemberId,
        /// Acting member (defaults to the member itself)
        #[arg(long)]
        actor: Option<MemberId>,
        #[arg(long, default_value_t = 3)]
        depth: u32,
    },
    /// Referral counts and earnings
    Stats {
        member: MemberId,
        #[arg(long)]
        actor: Option<MemberId>,
    },
    /// Member profile and balances
    Show { member: MemberId },
    /// Ledger entries, newest first
    History { member: MemberId },
    /// Notifications, newest first
    Notifications {
        member: MemberId,
        #[arg(long)]
        mark_read: bool,
    },
    /// Request a cash withdrawal (influencers only)
    Withdraw {
        member: MemberId,
        #[arg(value_parser = money::parse_amount)]
        amount: Decimal,
        #[arg(long)]
        method: WithdrawalMethod,
        #[arg(long)]
        wallet: String,
    },
    /// Withdrawal requests of a member
    Withdrawals { member: MemberId },
    /// Approve or reject a pending withdrawal (admins only)
    ReviewWithdrawal {
        withdrawal: WithdrawalId,
        #[arg(long)]
        actor: MemberId,
        #[arg(value_enum)]
        decision: DecisionArg,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Block or unblock a member (admins only)
    Block {
        member: MemberId,
        #[arg(long)]
        actor: MemberId,
        #[arg(long)]
        unblock: bool,
    },
    /// Merkle root over balances, relation rows and ledger entries
    Root,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
}

impl Command {
    fn writes_state(&self) -> bool {
        !matches!(
            self,
            Command::Chain { .. }
                | Command::Stats { .. }
                | Command::Show { .. }
                | Command::History { .. }
                | Command::Notifications {
                    mark_read: false,
                    ..
                }
                | Command::Withdrawals { .. }
                | Command::Root
        )
    }
}

//==================== Состояние ====================//

fn load_config(path: Option<&Path>) -> Result<BonusConfig> {
    match path {
        Some(path) => BonusConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(BonusConfig::default()),
    }
}

fn open_engine(state: &Path, config: BonusConfig) -> Result<ReferralEngine> {
    if !state.exists() {
        debug!(path = %state.display(), "no snapshot yet, starting empty");
        return Ok(ReferralEngine::new(config)?);
    }
    let snapshot = LedgerSnapshot::load(state)
        .with_context(|| format!("reading snapshot {}", state.display()))?;
    let engine = ReferralEngine::from_snapshot(config, snapshot, Arc::new(TracingSink))
        .with_context(|| format!("restoring snapshot {}", state.display()))?;
    Ok(engine)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

//==================== Команды ====================//

fn execute(engine: &ReferralEngine, command: Command) -> Result<Value> {
    match command {
        Command::Register {
            identity,
            first_name,
            last_name,
            username,
            influencer,
            admin,
            code,
        } => {
            let attrs = NewMember {
                identity_key: identity,
                username,
                first_name,
                last_name,
                user_type: if influencer {
                    UserType::Influencer
                } else {
                    UserType::Player
                },
                is_admin: admin,
            };
            to_value(&engine.register(attrs, code.as_deref())?)
        }
        Command::CompleteAction { member, action_id } => {
            to_value(&engine.complete_first_qualifying_action(member, &action_id)?)
        }
        Command::Deposit {
            member,
            amount,
            deposit_id,
        } => to_value(&engine.process_deposit(member, amount, &deposit_id)?),
        Command::Chain {
            member,
            actor,
            depth,
        } => to_value(&engine.referral_chain(actor.unwrap_or(member), member, depth)?),
        Command::Stats { member, actor } => {
            to_value(&engine.referral_stats(actor.unwrap_or(member), member)?)
        }
        Command::Show { member } => to_value(&engine.member(member)?),
        Command::History { member } => to_value(&engine.transactions(member)?),
        Command::Notifications { member, mark_read } => {
            let notifications = engine.notifications(member)?;
            if mark_read {
                let marked = engine.mark_notifications_read(member)?;
                return Ok(json!({ "notifications": notifications, "marked_read": marked }));
            }
            to_value(&notifications)
        }
        Command::Withdraw {
            member,
            amount,
            method,
            wallet,
        } => to_value(&engine.request_withdrawal(member, amount, method, &wallet)?),
        Command::Withdrawals { member } => to_value(&engine.withdrawals(member)?),
        Command::ReviewWithdrawal {
            withdrawal,
            actor,
            decision,
            reason,
        } => {
            let decision = match decision {
                DecisionArg::Approve if reason.is_some() => {
                    bail!("--reason only applies to a rejection")
                }
                DecisionArg::Approve => WithdrawalDecision::Approve,
                DecisionArg::Reject => WithdrawalDecision::Reject { reason },
            };
            to_value(&engine.review_withdrawal(actor, withdrawal, decision)?)
        }
        Command::Block {
            member,
            actor,
            unblock,
        } => to_value(&engine.set_blocked(actor, member, !unblock)?),
        Command::Root => Ok(json!({
            "state_root": engine.state_root(),
            "height": engine.snapshot().meta.height,
        })),
    }
}

fn run(cli: Cli) -> Result<Value> {
    let config = load_config(cli.config.as_deref())?;
    let engine = open_engine(&cli.state, config)?;
    let writes = cli.command.writes_state();

    let output = execute(&engine, cli.command)?;

    if writes {
        let snapshot = engine.snapshot();
        snapshot
            .save(&cli.state)
            .with_context(|| format!("writing snapshot {}", cli.state.display()))?;
        info!(
            path = %cli.state.display(),
            height = snapshot.meta.height,
            root = %snapshot.state_root,
            "state saved"
        );
    }
    Ok(output)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// коды выхода: 2 занят clap (ошибка аргументов), 1 для всего прочего
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ReferralError>().map(ReferralError::kind) {
        Some(ErrorKind::NotFound) => 3,
        Some(ErrorKind::Validation) => 4,
        Some(ErrorKind::Conflict) => 5,
        Some(ErrorKind::PermissionDenied) => 6,
        Some(ErrorKind::Invariant) => 7,
        Some(ErrorKind::Internal) | None => 1,
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let rendered = run(cli).and_then(|output| Ok(serde_json::to_string_pretty(&output)?));
    match rendered {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
