use crate::core::broker::DbBroker;
use crate::core::credentials::default_hasher;
use crate::core::error::LedgerError;
use crate::core::identity::{self, RequestContext};
use crate::core::ledger;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[clap(name = "party", about = "Create, join and administer parties.")]
pub struct PartyCli {
    #[clap(subcommand)]
    pub command: PartyCommand,
}

#[derive(Subcommand, Debug)]
pub enum PartyCommand {
    /// Create a party with a join secret and an energy budget (admin).
    Create {
        #[clap(value_name = "NAME")]
        name: String,
        #[clap(long)]
        secret: String,
        #[clap(long)]
        budget: i64,
    },
    /// List parties.
    List,
    /// Show one party.
    Get {
        #[clap(long)]
        id: i64,
    },
    /// Change name, secret, initial budget or active flag (admin).
    Update {
        #[clap(long)]
        id: i64,
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        secret: Option<String>,
        #[clap(long)]
        budget: Option<i64>,
        #[clap(long)]
        active: Option<bool>,
    },
    /// Add energy to a party and reopen it (admin).
    TopUp {
        #[clap(long)]
        id: i64,
        #[clap(long)]
        amount: i64,
    },
    /// Delete a party with all of its orders and memberships (admin).
    Delete {
        #[clap(long)]
        id: i64,
    },
    /// Join a party by name and secret.
    Join {
        #[clap(value_name = "NAME")]
        name: String,
        #[clap(long)]
        secret: String,
    },
    /// Leave the party given with --party, refunding your orders.
    Leave,
    /// Show the party given with --party.
    Current,
    /// List members of a party.
    Members {
        #[clap(long)]
        id: i64,
    },
    /// Show a party's state and ledger balance (admin).
    Audit {
        #[clap(long)]
        id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: i64,
    pub name: String,
    pub initial_budget: i64,
    pub energy_budget: i64,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyUpdate {
    pub name: Option<String>,
    pub credential: Option<String>,
    pub initial_budget: Option<i64>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedParty {
    pub party_id: i64,
    pub party_name: String,
    pub already_member: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: i64,
    pub username: String,
    pub joined_at: String,
}

const PARTY_COLUMNS: &str = "id, name, initial_budget, energy_budget, is_active, created_at";

fn party_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Party> {
    Ok(Party {
        id: row.get(0)?,
        name: row.get(1)?,
        initial_budget: row.get(2)?,
        energy_budget: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn read_party(conn: &Connection, id: i64) -> Result<Option<Party>, LedgerError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM parties WHERE id = ?1", PARTY_COLUMNS),
            [id],
            party_from_row,
        )
        .optional()?)
}

fn require_name(name: &str) -> Result<&str, LedgerError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LedgerError::BadRequest("party name must not be empty".into()));
    }
    Ok(name)
}

pub fn create_party(
    store: &Store,
    ctx: &RequestContext,
    name: &str,
    credential: &str,
    initial_budget: i64,
) -> Result<Party, LedgerError> {
    ctx.require_admin()?;
    let name = require_name(name)?;
    if credential.is_empty() {
        return Err(LedgerError::BadRequest("party secret must not be empty".into()));
    }
    if initial_budget <= 0 {
        return Err(LedgerError::BadRequest("initial budget must be positive".into()));
    }
    let party = DbBroker::new(store).with_tx(&ctx.actor(), None, "party.create", |tx| {
        tx.execute(
            "INSERT INTO parties(name, credential_hash, initial_budget, energy_budget, is_active, created_at)
             VALUES(?1, ?2, ?3, ?3, 1, ?4)",
            params![
                name,
                default_hasher().hash(credential),
                initial_budget,
                time::now_epoch_z()
            ],
        )
        .map_err(|e| LedgerError::from(e).unique_as_conflict("party name"))?;
        let id = tx.last_insert_rowid();
        read_party(tx, id)?.ok_or_else(|| LedgerError::Internal(format!("party {} vanished", id)))
    })?;
    tracing::info!(party_id = party.id, budget = initial_budget, "party created");
    Ok(party)
}

pub fn list_parties(store: &Store) -> Result<Vec<Party>, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM parties ORDER BY id",
            PARTY_COLUMNS
        ))?;
        let parties = stmt
            .query_map([], party_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parties)
    })
}

pub fn get_party(store: &Store, id: i64) -> Result<Party, LedgerError> {
    DbBroker::new(store)
        .with_read(|conn| read_party(conn, id))?
        .ok_or_else(|| LedgerError::NotFound(format!("party {}", id)))
}

/// Apply an admin edit. A new initial budget keeps already placed orders paid for.
pub fn update_party(
    store: &Store,
    ctx: &RequestContext,
    id: i64,
    update: &PartyUpdate,
) -> Result<Party, LedgerError> {
    ctx.require_admin()?;
    let name = update.name.as_deref().map(require_name).transpose()?;
    if update.credential.as_deref() == Some("") {
        return Err(LedgerError::BadRequest("party secret must not be empty".into()));
    }
    DbBroker::new(store).with_tx(&ctx.actor(), None, "party.update", |tx| {
        if read_party(tx, id)?.is_none() {
            return Err(LedgerError::NotFound(format!("party {}", id)));
        }
        if let Some(name) = name {
            tx.execute("UPDATE parties SET name = ?1 WHERE id = ?2", params![name, id])
                .map_err(|e| LedgerError::from(e).unique_as_conflict("party name"))?;
        }
        if let Some(credential) = &update.credential {
            tx.execute(
                "UPDATE parties SET credential_hash = ?1 WHERE id = ?2",
                params![default_hasher().hash(credential), id],
            )?;
        }
        if let Some(initial_budget) = update.initial_budget {
            ledger::rebase_initial_budget(tx, id, initial_budget)?;
        }
        if let Some(active) = update.active {
            tx.execute(
                "UPDATE parties SET is_active = ?1 WHERE id = ?2",
                params![active, id],
            )?;
        }
        read_party(tx, id)?.ok_or_else(|| LedgerError::NotFound(format!("party {}", id)))
    })
}

/// Verify a party's join secret and record membership. Joining twice is a no-op.
pub fn join_party(
    store: &Store,
    ctx: &RequestContext,
    party_name: &str,
    credential: &str,
) -> Result<JoinedParty, LedgerError> {
    let party_name = require_name(party_name)?;
    let joined = DbBroker::new(store).with_tx(&ctx.actor(), None, "party.join", |tx| {
        let found: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, name, credential_hash FROM parties WHERE name = ?1 AND is_active = 1",
                [party_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (party_id, name, hash) = found
            .ok_or_else(|| LedgerError::NotFound(format!("open party '{}'", party_name)))?;
        if !default_hasher().verify(credential, &hash) {
            return Err(LedgerError::Unauthorized("wrong party secret".into()));
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO memberships(party_id, user_id, joined_at) VALUES(?1, ?2, ?3)",
            params![party_id, ctx.user_id, time::now_epoch_z()],
        )?;
        Ok(JoinedParty {
            party_id,
            party_name: name,
            already_member: inserted == 0,
        })
    });
    match &joined {
        Ok(j) => tracing::info!(party_id = j.party_id, user_id = ctx.user_id, "joined party"),
        Err(e) => tracing::warn!(user_id = ctx.user_id, error = %e, "join rejected"),
    }
    joined
}

pub fn is_member(store: &Store, user_id: i64, party_id: i64) -> Result<bool, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        Ok(conn
            .query_row(
                "SELECT 1 FROM memberships WHERE party_id = ?1 AND user_id = ?2",
                params![party_id, user_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    })
}

/// Attach the named party to `ctx`. The caller must already be a member.
pub fn enter_party(
    store: &Store,
    ctx: RequestContext,
    party_name: &str,
) -> Result<RequestContext, LedgerError> {
    let party_name = require_name(party_name)?;
    let party_id: i64 = DbBroker::new(store)
        .with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM parties WHERE name = ?1",
                    [party_name],
                    |row| row.get(0),
                )
                .optional()?)
        })?
        .ok_or_else(|| LedgerError::NotFound(format!("party '{}'", party_name)))?;
    if !is_member(store, ctx.user_id, party_id)? {
        return Err(LedgerError::Forbidden(format!(
            "not a member of party '{}'",
            party_name
        )));
    }
    Ok(ctx.in_party(party_id))
}

/// The party attached to the request, if it still exists.
pub fn current_party(store: &Store, ctx: &RequestContext) -> Result<Option<Party>, LedgerError> {
    match ctx.party_id {
        None => Ok(None),
        Some(id) => DbBroker::new(store).with_read(|conn| read_party(conn, id)),
    }
}

pub fn list_members(store: &Store, party_id: i64) -> Result<Vec<Member>, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        if read_party(conn, party_id)?.is_none() {
            return Err(LedgerError::NotFound(format!("party {}", party_id)));
        }
        let mut stmt = conn.prepare(
            "SELECT u.id, u.username, m.joined_at FROM memberships m
             JOIN users u ON m.user_id = u.id
             WHERE m.party_id = ?1 ORDER BY m.joined_at, u.id",
        )?;
        let members = stmt
            .query_map([party_id], |row| {
                Ok(Member {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    joined_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "party",
        "version": "0.1.0",
        "description": "Parties sharing one energy budget",
        "commands": [
            { "name": "create", "parameters": ["name", "secret", "budget"] },
            { "name": "list", "parameters": [] },
            { "name": "get", "parameters": ["id"] },
            { "name": "update", "parameters": ["id", "name", "secret", "budget", "active"] },
            { "name": "top-up", "parameters": ["id", "amount"] },
            { "name": "delete", "parameters": ["id"] },
            { "name": "join", "parameters": ["name", "secret"] },
            { "name": "leave", "parameters": [] },
            { "name": "current", "parameters": [] },
            { "name": "members", "parameters": ["id"] },
            { "name": "audit", "parameters": ["id"] }
        ],
        "storage": ["ledger.db#parties", "ledger.db#memberships"]
    })
}

pub fn run_party_cli(
    store: &Store,
    ctx: Option<&RequestContext>,
    cli: PartyCli,
) -> Result<serde_json::Value, LedgerError> {
    let out = match cli.command {
        PartyCommand::Create {
            name,
            secret,
            budget,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let party = create_party(store, ctx, &name, &secret, budget)?;
            time::command_envelope("party.create", serde_json::json!({ "party": party }))
        }
        PartyCommand::List => {
            let parties = list_parties(store)?;
            time::command_envelope("party.list", serde_json::json!({ "parties": parties }))
        }
        PartyCommand::Get { id } => {
            let party = get_party(store, id)?;
            time::command_envelope("party.get", serde_json::json!({ "party": party }))
        }
        PartyCommand::Update {
            id,
            name,
            secret,
            budget,
            active,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let update = PartyUpdate {
                name,
                credential: secret,
                initial_budget: budget,
                active,
            };
            let party = update_party(store, ctx, id, &update)?;
            time::command_envelope("party.update", serde_json::json!({ "party": party }))
        }
        PartyCommand::TopUp { id, amount } => {
            let ctx = identity::authenticated(ctx)?;
            let budget = ledger::top_up_party(store, ctx, id, amount)?;
            time::command_envelope("party.top_up", serde_json::json!({ "budget": budget }))
        }
        PartyCommand::Delete { id } => {
            let ctx = identity::authenticated(ctx)?;
            let cascade = ledger::delete_party(store, ctx, id)?;
            time::command_envelope("party.delete", serde_json::json!({ "cascade": cascade }))
        }
        PartyCommand::Join { name, secret } => {
            let ctx = identity::authenticated(ctx)?;
            let joined = join_party(store, ctx, &name, &secret)?;
            time::command_envelope("party.join", serde_json::json!({ "joined": joined }))
        }
        PartyCommand::Leave => {
            let ctx = identity::authenticated(ctx)?;
            let report = ledger::leave_party(store, ctx)?;
            time::command_envelope("party.leave", serde_json::json!({ "left": report }))
        }
        PartyCommand::Current => {
            let ctx = identity::authenticated(ctx)?;
            let party = current_party(store, ctx)?;
            time::command_envelope(
                "party.current",
                serde_json::json!({ "has_party": party.is_some(), "party": party }),
            )
        }
        PartyCommand::Members { id } => {
            identity::authenticated(ctx)?;
            let members = list_members(store, id)?;
            time::command_envelope("party.members", serde_json::json!({ "members": members }))
        }
        PartyCommand::Audit { id } => {
            identity::authenticated(ctx)?.require_admin()?;
            let state = ledger::party_state(store, id)?;
            let balance = ledger::balance(store, id)?;
            time::command_envelope(
                "party.audit",
                serde_json::json!({ "state": state, "balance": balance }),
            )
        }
    };
    Ok(out)
}
