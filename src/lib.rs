//! partyledger: a shared energy ledger for group food ordering.
//!
//! Parties pool a finite **energy budget**; members place orders for menu
//! items against it. The ledger keeps three things consistent under
//! concurrent requests: party budgets, order lines and the menu catalog
//! they reference.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state access routes through `DbBroker`:
//! - Reads on fresh WAL connections
//! - Writes in SQLite `IMMEDIATE` transactions, retried on `SQLITE_BUSY`
//! - Audit logging (`ledger.events.jsonl`)
//!
//! ## Ledger core
//!
//! [`core::ledger`] is the only code that debits or credits a budget:
//! order placement and removal, menu item and party cascades, leaving a
//! party, top-ups. At every commit,
//! `energy_budget + Σ order cost == initial_budget` for each party.
//!
//! ## Subsystems (Plugins)
//!
//! - `menu`: the shared catalog
//! - `party`: parties, join secrets, memberships
//! - `user`: accounts with `guest` / `admin` roles
//! - `order`: order placement surface
//!
//! # Examples
//!
//! ```bash
//! partyledger init --admin root --admin-password hunter22
//! partyledger --user root --password hunter22 menu add Dumplings --cost 4
//! partyledger --user root --password hunter22 party create friday --secret s3 --budget 10
//! partyledger user register ana --new-password ana123
//! partyledger --user ana --password ana123 party join friday --secret s3
//! partyledger --user ana --password ana123 --party friday order place --menu 1
//! ```

pub mod core;
pub mod plugins;

use crate::core::{broker::DbBroker, db, error::LedgerError, identity::RequestContext, store::Store, time};
use clap::{Parser, Subcommand};
use plugins::{catalog, orders, party, users};
use std::path::PathBuf;

pub const ROOT_ENV: &str = "PARTYLEDGER_ROOT";
const DEFAULT_ROOT_DIR: &str = ".partyledger";

#[derive(Parser, Debug)]
#[clap(
    name = "partyledger",
    version = env!("CARGO_PKG_VERSION"),
    about = "Shared energy-budget ledger for party food ordering"
)]
struct Cli {
    /// Store directory (defaults to $PARTYLEDGER_ROOT, then ./.partyledger).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Username to act as.
    #[clap(long, global = true)]
    user: Option<String>,
    /// Password for --user.
    #[clap(long, global = true)]
    password: Option<String>,
    /// Party (by name) to act in; you must have joined it.
    #[clap(long, global = true)]
    party: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and, optionally, the first admin account.
    Init {
        #[clap(long)]
        admin: Option<String>,
        #[clap(long, requires = "admin")]
        admin_password: Option<String>,
    },
    /// User accounts.
    User(users::UserCli),
    /// Menu catalog.
    Menu(catalog::MenuCli),
    /// Parties and memberships.
    Party(party::PartyCli),
    /// Orders against the party budget.
    Order(orders::OrderCli),
    /// Show the mutation audit log (admin).
    Audit,
    /// Print the command schema of every subsystem.
    Schema,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::User(_) => "user",
            Command::Menu(_) => "menu",
            Command::Party(_) => "party",
            Command::Order(_) => "order",
            Command::Audit => "audit",
            Command::Schema => "schema",
        }
    }
}

fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf, LedgerError> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Ok(root) = std::env::var(ROOT_ENV) {
        if !root.trim().is_empty() {
            return Ok(PathBuf::from(root));
        }
    }
    Ok(std::env::current_dir()?.join(DEFAULT_ROOT_DIR))
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Build the request identity from the global flags.
fn resolve_identity(
    store: &Store,
    user: Option<&str>,
    password: Option<&str>,
    party_name: Option<&str>,
) -> Result<Option<RequestContext>, LedgerError> {
    let ctx = match (user, password) {
        (None, None) => None,
        (Some(user), Some(password)) => Some(users::authenticate(store, user, password)?),
        (Some(_), None) => {
            return Err(LedgerError::Unauthorized("--password is required with --user".into()));
        }
        (None, Some(_)) => {
            return Err(LedgerError::BadRequest("--password given without --user".into()));
        }
    };
    match (ctx, party_name) {
        (Some(ctx), Some(name)) => Ok(Some(party::enter_party(store, ctx, name)?)),
        (None, Some(_)) => Err(LedgerError::Unauthorized(
            "--party requires --user and --password".into(),
        )),
        (ctx, None) => Ok(ctx),
    }
}

fn dispatch(store: &Store, cli: Cli) -> Result<serde_json::Value, LedgerError> {
    let ctx = resolve_identity(
        store,
        cli.user.as_deref(),
        cli.password.as_deref(),
        cli.party.as_deref(),
    )?;
    let ctx = ctx.as_ref();

    match cli.command {
        Command::Init {
            admin,
            admin_password,
        } => {
            let admin = match (admin, admin_password) {
                (Some(name), Some(pw)) => Some(users::bootstrap_admin(store, &name, &pw)?),
                (Some(_), None) => {
                    return Err(LedgerError::BadRequest(
                        "--admin-password is required with --admin".into(),
                    ));
                }
                _ => None,
            };
            Ok(time::command_envelope(
                "init",
                serde_json::json!({
                    "root": store.root.to_string_lossy(),
                    "db": store.db_path().to_string_lossy(),
                    "admin": admin,
                }),
            ))
        }
        Command::User(c) => users::run_user_cli(store, ctx, c),
        Command::Menu(c) => catalog::run_menu_cli(store, ctx, c),
        Command::Party(c) => party::run_party_cli(store, ctx, c),
        Command::Order(c) => orders::run_order_cli(store, ctx, c),
        Command::Audit => {
            crate::core::identity::authenticated(ctx)?.require_admin()?;
            let events = DbBroker::new(store).read_events()?;
            Ok(time::command_envelope(
                "audit",
                serde_json::json!({ "events": events }),
            ))
        }
        Command::Schema => Ok(time::command_envelope(
            "schema",
            serde_json::json!({
                "subsystems": [
                    users::schema(),
                    catalog::schema(),
                    party::schema(),
                    orders::schema(),
                ]
            }),
        )),
    }
}

/// Parse arguments, run one command and print its JSON envelope.
///
/// Success goes to stdout; failures print an error envelope to stderr and
/// are returned so the binary can pick an exit code.
pub fn run() -> Result<(), LedgerError> {
    let cli = Cli::parse();
    let cmd = cli.command.name();

    let result = resolve_root(cli.root.clone())
        .and_then(|root| Store::open(&root))
        .and_then(|store| {
            init_tracing(&store.config.log.level);
            db::initialize_ledger_db(&store)?;
            dispatch(&store, cli)
        });

    match result {
        Ok(out) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&out)
                    .map_err(|e| LedgerError::Internal(e.to_string()))?
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(cmd, error = %e, "command failed");
            eprintln!("{}", time::error_envelope(cmd, &e));
            Err(e)
        }
    }
}
