use crate::core::broker::DbBroker;
use crate::core::credentials::{self, default_hasher};
use crate::core::error::LedgerError;
use crate::core::identity::{self, RequestContext, Role};
use crate::core::ledger::{self, PartyRefund};
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

const MAX_USERNAME_LEN: usize = 64;

#[derive(Parser, Debug)]
#[clap(name = "user", about = "Manage user accounts.")]
pub struct UserCli {
    #[clap(subcommand)]
    pub command: UserCommand,
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Register a new guest account.
    Register {
        #[clap(value_name = "USERNAME")]
        username: String,
        #[clap(long)]
        new_password: String,
    },
    /// Create an account with an explicit role (admin).
    Add {
        #[clap(value_name = "USERNAME")]
        username: String,
        #[clap(long)]
        new_password: String,
        #[clap(long, default_value = "guest")]
        role: String,
    },
    /// Show the authenticated caller.
    Whoami,
    /// List accounts.
    List,
    /// Show one account.
    Get {
        #[clap(long)]
        id: i64,
    },
    /// Change username, password or role of an account (admin).
    Update {
        #[clap(long)]
        id: i64,
        #[clap(long)]
        username: Option<String>,
        #[clap(long)]
        new_password: Option<String>,
        #[clap(long)]
        role: Option<String>,
    },
    /// Delete an account, refunding its open orders (admin).
    Delete {
        #[clap(long)]
        id: i64,
    },
    /// Change the caller's own password.
    Passwd {
        #[clap(long)]
        old: String,
        #[clap(long)]
        new: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeletion {
    pub user_id: i64,
    pub refunds: Vec<PartyRefund>,
    pub removed_memberships: i64,
}

fn validate_username(username: &str) -> Result<&str, LedgerError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(LedgerError::BadRequest("username must not be empty".into()));
    }
    if username.len() > MAX_USERNAME_LEN || username.chars().any(char::is_whitespace) {
        return Err(LedgerError::BadRequest(format!(
            "username must be at most {} characters without whitespace",
            MAX_USERNAME_LEN
        )));
    }
    Ok(username)
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_user(raw: (i64, String, String, String)) -> Result<User, LedgerError> {
    let (id, username, role, created_at) = raw;
    Ok(User {
        id,
        username,
        role: role.parse()?,
        created_at,
    })
}

fn read_user(conn: &Connection, id: i64) -> Result<Option<User>, LedgerError> {
    conn.query_row(
        "SELECT id, username, role, created_at FROM users WHERE id = ?1",
        [id],
        user_from_row,
    )
    .optional()?
    .map(into_user)
    .transpose()
}

fn insert_user(
    conn: &Connection,
    username: &str,
    password: &str,
    role: Role,
) -> Result<User, LedgerError> {
    let created_at = time::now_epoch_z();
    conn.execute(
        "INSERT INTO users(username, password_hash, role, created_at) VALUES(?1, ?2, ?3, ?4)",
        params![
            username,
            default_hasher().hash(password),
            role.as_str(),
            created_at
        ],
    )
    .map_err(|e| LedgerError::from(e).unique_as_conflict("username"))?;
    Ok(User {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        role,
        created_at,
    })
}

/// Self-service registration. New accounts are always guests.
pub fn register_user(store: &Store, username: &str, password: &str) -> Result<User, LedgerError> {
    let username = validate_username(username)?;
    credentials::validate_password(password)?;
    let user = DbBroker::new(store).with_tx("anonymous", None, "user.register", |tx| {
        insert_user(tx, username, password, Role::Guest)
    })?;
    tracing::info!(user_id = user.id, "user registered");
    Ok(user)
}

pub fn create_user(
    store: &Store,
    ctx: &RequestContext,
    username: &str,
    password: &str,
    role: Role,
) -> Result<User, LedgerError> {
    ctx.require_admin()?;
    let username = validate_username(username)?;
    credentials::validate_password(password)?;
    let user = DbBroker::new(store).with_tx(&ctx.actor(), None, "user.add", |tx| {
        insert_user(tx, username, password, role)
    })?;
    tracing::info!(user_id = user.id, role = %user.role, "user created");
    Ok(user)
}

/// Create the first admin account. Refused once any admin exists.
pub fn bootstrap_admin(store: &Store, username: &str, password: &str) -> Result<User, LedgerError> {
    let username = validate_username(username)?;
    credentials::validate_password(password)?;
    DbBroker::new(store).with_tx("system", None, "user.bootstrap_admin", |tx| {
        let admins: i64 = tx.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |row| row.get(0),
        )?;
        if admins > 0 {
            return Err(LedgerError::Conflict("an admin account already exists".into()));
        }
        insert_user(tx, username, password, Role::Admin)
    })
}

/// Verify credentials and build the request identity for this user.
pub fn authenticate(
    store: &Store,
    username: &str,
    password: &str,
) -> Result<RequestContext, LedgerError> {
    let found: Option<(i64, String, String)> = DbBroker::new(store).with_read(|conn| {
        Ok(conn
            .query_row(
                "SELECT id, password_hash, role FROM users WHERE username = ?1",
                [username.trim()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    })?;
    match found {
        Some((id, hash, role)) if default_hasher().verify(password, &hash) => {
            Ok(RequestContext::new(id, role.parse()?))
        }
        _ => {
            tracing::warn!(username = username.trim(), "authentication failed");
            Err(LedgerError::Unauthorized("invalid username or password".into()))
        }
    }
}

pub fn change_password(
    store: &Store,
    ctx: &RequestContext,
    old_password: &str,
    new_password: &str,
) -> Result<(), LedgerError> {
    if old_password.is_empty() || new_password.is_empty() {
        return Err(LedgerError::BadRequest(
            "old and new password must not be empty".into(),
        ));
    }
    credentials::validate_password(new_password)?;
    DbBroker::new(store).with_tx(&ctx.actor(), None, "user.passwd", |tx| {
        let current: String = tx
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                [ctx.user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", ctx.user_id)))?;
        if !default_hasher().verify(old_password, &current) {
            return Err(LedgerError::Unauthorized("old password is incorrect".into()));
        }
        tx.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![default_hasher().hash(new_password), ctx.user_id],
        )?;
        Ok(())
    })
}

pub fn list_users(store: &Store) -> Result<Vec<User>, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, username, role, created_at FROM users ORDER BY id")?;
        let raw = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(into_user).collect()
    })
}

pub fn get_user(store: &Store, id: i64) -> Result<User, LedgerError> {
    DbBroker::new(store)
        .with_read(|conn| read_user(conn, id))?
        .ok_or_else(|| LedgerError::NotFound(format!("user {}", id)))
}

pub fn update_user(
    store: &Store,
    ctx: &RequestContext,
    id: i64,
    update: &UserUpdate,
) -> Result<User, LedgerError> {
    ctx.require_admin()?;
    let username = update.username.as_deref().map(validate_username).transpose()?;
    if let Some(password) = &update.password {
        credentials::validate_password(password)?;
    }
    DbBroker::new(store).with_tx(&ctx.actor(), None, "user.update", |tx| {
        if read_user(tx, id)?.is_none() {
            return Err(LedgerError::NotFound(format!("user {}", id)));
        }
        if let Some(username) = username {
            tx.execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                params![username, id],
            )
            .map_err(|e| LedgerError::from(e).unique_as_conflict("username"))?;
        }
        if let Some(password) = &update.password {
            tx.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![default_hasher().hash(password), id],
            )?;
        }
        if let Some(role) = update.role {
            tx.execute(
                "UPDATE users SET role = ?1 WHERE id = ?2",
                params![role.as_str(), id],
            )?;
        }
        read_user(tx, id)?.ok_or_else(|| LedgerError::NotFound(format!("user {}", id)))
    })
}

/// Delete an account. Its open orders are refunded to their parties first.
pub fn delete_user(
    store: &Store,
    ctx: &RequestContext,
    id: i64,
) -> Result<UserDeletion, LedgerError> {
    ctx.require_admin()?;
    if id == ctx.user_id {
        return Err(LedgerError::Conflict("cannot delete your own account".into()));
    }
    let intent_ref = time::new_intent_ref("user.delete");
    let deletion = DbBroker::new(store).with_tx(&ctx.actor(), Some(&intent_ref), "user.delete", |tx| {
        if read_user(tx, id)?.is_none() {
            return Err(LedgerError::NotFound(format!("user {}", id)));
        }
        let refunds = ledger::purge_user_orders(tx, id)?;
        let removed_memberships =
            tx.execute("DELETE FROM memberships WHERE user_id = ?1", [id])? as i64;
        tx.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(UserDeletion {
            user_id: id,
            refunds,
            removed_memberships,
        })
    })?;
    tracing::info!(user_id = id, parties = deletion.refunds.len(), "user deleted");
    Ok(deletion)
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "user",
        "version": "0.1.0",
        "description": "User accounts with guest and admin roles",
        "commands": [
            { "name": "register", "parameters": ["username", "new_password"] },
            { "name": "add", "parameters": ["username", "new_password", "role"] },
            { "name": "whoami", "parameters": [] },
            { "name": "list", "parameters": [] },
            { "name": "get", "parameters": ["id"] },
            { "name": "update", "parameters": ["id", "username", "new_password", "role"] },
            { "name": "delete", "parameters": ["id"] },
            { "name": "passwd", "parameters": ["old", "new"] }
        ],
        "storage": ["ledger.db#users"]
    })
}

pub fn run_user_cli(
    store: &Store,
    ctx: Option<&RequestContext>,
    cli: UserCli,
) -> Result<serde_json::Value, LedgerError> {
    let out = match cli.command {
        UserCommand::Register {
            username,
            new_password,
        } => {
            let user = register_user(store, &username, &new_password)?;
            time::command_envelope("user.register", serde_json::json!({ "user": user }))
        }
        UserCommand::Add {
            username,
            new_password,
            role,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let user = create_user(store, ctx, &username, &new_password, role.parse::<Role>()?)?;
            time::command_envelope("user.add", serde_json::json!({ "user": user }))
        }
        UserCommand::Whoami => {
            let ctx = identity::authenticated(ctx)?;
            let user = get_user(store, ctx.user_id)?;
            time::command_envelope(
                "user.whoami",
                serde_json::json!({ "user": user, "party_id": ctx.party_id }),
            )
        }
        UserCommand::List => {
            identity::authenticated(ctx)?.require_admin()?;
            let users = list_users(store)?;
            time::command_envelope("user.list", serde_json::json!({ "users": users }))
        }
        UserCommand::Get { id } => {
            identity::authenticated(ctx)?.require_admin()?;
            let user = get_user(store, id)?;
            time::command_envelope("user.get", serde_json::json!({ "user": user }))
        }
        UserCommand::Update {
            id,
            username,
            new_password,
            role,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let update = UserUpdate {
                username,
                password: new_password,
                role: role.as_deref().map(str::parse::<Role>).transpose()?,
            };
            let user = update_user(store, ctx, id, &update)?;
            time::command_envelope("user.update", serde_json::json!({ "user": user }))
        }
        UserCommand::Delete { id } => {
            let ctx = identity::authenticated(ctx)?;
            let deletion = delete_user(store, ctx, id)?;
            time::command_envelope("user.delete", serde_json::json!({ "deletion": deletion }))
        }
        UserCommand::Passwd { old, new } => {
            let ctx = identity::authenticated(ctx)?;
            change_password(store, ctx, &old, &new)?;
            time::command_envelope("user.passwd", serde_json::json!({ "user_id": ctx.user_id }))
        }
    };
    Ok(out)
}
