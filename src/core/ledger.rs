//! Energy ledger: the only code that moves a party's budget.
//!
//! Every mutation here runs as one `IMMEDIATE` transaction through
//! [`DbBroker::with_tx`]. The budget debit is a compare-and-decrement
//! (`... WHERE energy_budget >= cost`), refunds are bounded by the party's
//! initial budget, and the invariant
//!
//! ```text
//! energy_budget + Σ orders.energy_cost (party) == initial_budget
//! ```
//!
//! holds at every commit point.

use crate::core::broker::DbBroker;
use crate::core::error::LedgerError;
use crate::core::identity::RequestContext;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::catalog;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::env;

pub const FAULT_STAGE_ENV: &str = "PARTYLEDGER_FAULT_STAGE";
const MAX_REQUEST_TOKEN_LEN: usize = 128;

/// Points inside ledger transactions where a test can force a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStage {
    AfterOrderInsert,
    AfterBudgetDebit,
    AfterOrderDelete,
    AfterRefund,
    BeforeMenuDelete,
}

impl FaultStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultStage::AfterOrderInsert => "after_order_insert",
            FaultStage::AfterBudgetDebit => "after_budget_debit",
            FaultStage::AfterOrderDelete => "after_order_delete",
            FaultStage::AfterRefund => "after_refund",
            FaultStage::BeforeMenuDelete => "before_menu_delete",
        }
    }
}

fn fault_point(stage: FaultStage) -> Result<(), LedgerError> {
    match env::var(FAULT_STAGE_ENV) {
        Ok(v) if v == stage.as_str() => Err(LedgerError::Internal(format!(
            "FAULT_INJECTED stage={}",
            stage.as_str()
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyState {
    Active,
    /// Budget is zero, whether or not exhaustion also cleared the active flag.
    Exhausted,
    /// Deactivated by an admin with budget left.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub party_id: i64,
    pub menu_id: i64,
    pub energy_cost: i64,
    pub energy_left: i64,
    /// The request token matched an order that already existed.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedOrder {
    pub order_id: i64,
    pub party_id: i64,
    pub refunded: i64,
    pub energy_left: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRefund {
    pub party_id: i64,
    pub orders: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuCascade {
    pub menu_id: i64,
    pub removed_orders: i64,
    pub refunds: Vec<PartyRefund>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyCascade {
    pub party_id: i64,
    pub removed_orders: i64,
    pub removed_memberships: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveReport {
    pub party_id: i64,
    pub removed_orders: i64,
    pub refunded: i64,
    pub energy_left: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyBudget {
    pub party_id: i64,
    pub initial_budget: i64,
    pub energy_budget: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub party_id: i64,
    pub initial_budget: i64,
    pub energy_left: i64,
    pub committed: i64,
    pub balanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyOrderRow {
    pub order_id: i64,
    pub username: String,
    pub menu_name: String,
    pub menu_id: i64,
    pub image_urls: Vec<String>,
    /// Unit cost paid when these lines were placed.
    pub energy_cost: i64,
    pub quantity: i64,
    pub total_cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyOrders {
    pub party_id: i64,
    pub energy_left: i64,
    pub orders: Vec<PartyOrderRow>,
}

fn party_budget_row(conn: &Connection, party_id: i64) -> Result<PartyBudget, LedgerError> {
    conn.query_row(
        "SELECT initial_budget, energy_budget, is_active FROM parties WHERE id = ?1",
        [party_id],
        |row| {
            Ok(PartyBudget {
                party_id,
                initial_budget: row.get(0)?,
                energy_budget: row.get(1)?,
                active: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound(format!("party {}", party_id)))
}

/// Σ snapshot cost of the party's live orders.
pub fn committed_energy(conn: &Connection, party_id: i64) -> Result<i64, LedgerError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(energy_cost), 0) FROM orders WHERE party_id = ?1",
        [party_id],
        |row| row.get(0),
    )?)
}

/// Credit `amount` back to a party. Fails instead of lifting the budget past its initial value.
fn refund_party(conn: &Connection, party_id: i64, amount: i64) -> Result<(), LedgerError> {
    if amount == 0 {
        return Ok(());
    }
    let updated = conn.execute(
        "UPDATE parties SET energy_budget = energy_budget + ?1
         WHERE id = ?2 AND energy_budget + ?1 <= initial_budget",
        params![amount, party_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::Internal(format!(
            "refund of {} to party {} would break its budget bounds",
            amount, party_id
        )));
    }
    Ok(())
}

fn validate_request_token(token: Option<&str>) -> Result<Option<&str>, LedgerError> {
    match token.map(str::trim) {
        None => Ok(None),
        Some("") => Err(LedgerError::BadRequest("request token must not be empty".into())),
        Some(t) if t.len() > MAX_REQUEST_TOKEN_LEN => Err(LedgerError::BadRequest(format!(
            "request token longer than {} bytes",
            MAX_REQUEST_TOKEN_LEN
        ))),
        Some(t) => Ok(Some(t)),
    }
}

/// Debit one menu item against the caller's party.
///
/// With a `request_token`, a retry of an already committed placement returns
/// the original order (`replayed = true`) and leaves the budget alone.
pub fn place_order(
    store: &Store,
    ctx: &RequestContext,
    menu_id: i64,
    request_token: Option<&str>,
) -> Result<PlacedOrder, LedgerError> {
    let party_id = ctx.require_party()?;
    if menu_id <= 0 {
        return Err(LedgerError::BadRequest(format!("invalid menu item id {}", menu_id)));
    }
    let token = validate_request_token(request_token)?;
    let deactivate_on_exhaustion = store.config.ledger.deactivate_on_exhaustion;
    let intent_ref = time::new_intent_ref("order.place");
    let broker = DbBroker::new(store);

    let placed = broker.with_tx(&ctx.actor(), Some(&intent_ref), "order.place", |tx| {
        if let Some(token) = token {
            let existing: Option<(i64, i64, i64, i64, i64)> = tx
                .query_row(
                    "SELECT id, party_id, user_id, menu_id, energy_cost
                     FROM orders WHERE request_token = ?1",
                    [token],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;
            if let Some((order_id, o_party, o_user, o_menu, energy_cost)) = existing {
                if o_party != party_id || o_user != ctx.user_id || o_menu != menu_id {
                    return Err(LedgerError::Conflict(format!(
                        "request token '{}' was used for a different order",
                        token
                    )));
                }
                let budget = party_budget_row(tx, party_id)?;
                return Ok(PlacedOrder {
                    order_id,
                    party_id,
                    menu_id,
                    energy_cost,
                    energy_left: budget.energy_budget,
                    replayed: true,
                });
            }
        }

        let energy_cost = catalog::lookup_energy_cost(tx, menu_id)?;
        let budget = party_budget_row(tx, party_id)?;
        // An exhausted party reports the shortfall, not its closed state.
        if budget.energy_budget < energy_cost {
            return Err(LedgerError::InsufficientBudget {
                party_id,
                required: energy_cost,
                available: budget.energy_budget,
            });
        }
        if !budget.active {
            return Err(LedgerError::Conflict(format!(
                "party {} is not accepting orders",
                party_id
            )));
        }

        tx.execute(
            "INSERT INTO orders(party_id, user_id, menu_id, energy_cost, request_token, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![party_id, ctx.user_id, menu_id, energy_cost, token, time::now_epoch_z()],
        )?;
        let order_id = tx.last_insert_rowid();
        fault_point(FaultStage::AfterOrderInsert)?;

        let debited = tx.execute(
            "UPDATE parties SET energy_budget = energy_budget - ?1
             WHERE id = ?2 AND energy_budget >= ?1",
            params![energy_cost, party_id],
        )?;
        if debited == 0 {
            return Err(LedgerError::InsufficientBudget {
                party_id,
                required: energy_cost,
                available: budget.energy_budget,
            });
        }
        fault_point(FaultStage::AfterBudgetDebit)?;

        let energy_left = budget.energy_budget - energy_cost;
        if energy_left == 0 && deactivate_on_exhaustion {
            tx.execute("UPDATE parties SET is_active = 0 WHERE id = ?1", [party_id])?;
        }

        Ok(PlacedOrder {
            order_id,
            party_id,
            menu_id,
            energy_cost,
            energy_left,
            replayed: false,
        })
    });

    match &placed {
        Ok(p) if p.replayed => {
            tracing::info!(order_id = p.order_id, party_id, "order placement replayed")
        }
        Ok(p) => tracing::info!(
            order_id = p.order_id,
            party_id,
            user_id = ctx.user_id,
            menu_id,
            cost = p.energy_cost,
            energy_left = p.energy_left,
            "order placed"
        ),
        Err(e) => tracing::warn!(party_id, menu_id, error = %e, "order rejected"),
    }
    placed
}

/// Cancel one order line and credit its cost back.
///
/// Only the line's owner may cancel it; admins may cancel any line in the
/// party. Lines of other parties are reported as not found.
pub fn remove_order(
    store: &Store,
    ctx: &RequestContext,
    order_id: i64,
) -> Result<RemovedOrder, LedgerError> {
    let party_id = ctx.require_party()?;
    let intent_ref = time::new_intent_ref("order.remove");
    let broker = DbBroker::new(store);

    let removed = broker.with_tx(&ctx.actor(), Some(&intent_ref), "order.remove", |tx| {
        let line: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT party_id, user_id, energy_cost FROM orders WHERE id = ?1",
                [order_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (owner_party, owner_user, energy_cost) = match line {
            Some(l) if l.0 == party_id => l,
            _ => return Err(LedgerError::NotFound(format!("order {}", order_id))),
        };
        if owner_user != ctx.user_id && !ctx.is_admin() {
            return Err(LedgerError::Forbidden(format!(
                "order {} belongs to another user",
                order_id
            )));
        }

        tx.execute("DELETE FROM orders WHERE id = ?1", [order_id])?;
        fault_point(FaultStage::AfterOrderDelete)?;
        refund_party(tx, owner_party, energy_cost)?;
        fault_point(FaultStage::AfterRefund)?;

        let budget = party_budget_row(tx, owner_party)?;
        Ok(RemovedOrder {
            order_id,
            party_id: owner_party,
            refunded: energy_cost,
            energy_left: budget.energy_budget,
        })
    });

    match &removed {
        Ok(r) => tracing::info!(
            order_id,
            party_id,
            refunded = r.refunded,
            energy_left = r.energy_left,
            "order removed"
        ),
        Err(e) => tracing::warn!(order_id, party_id, error = %e, "order removal rejected"),
    }
    removed
}

/// Refund and delete every order of a menu item, then the item itself.
pub fn delete_menu_item(
    store: &Store,
    ctx: &RequestContext,
    menu_id: i64,
) -> Result<MenuCascade, LedgerError> {
    ctx.require_admin()?;
    let intent_ref = time::new_intent_ref("menu.delete");
    let broker = DbBroker::new(store);

    let cascade = broker.with_tx(&ctx.actor(), Some(&intent_ref), "menu.delete", |tx| {
        catalog::lookup_energy_cost(tx, menu_id)?;

        let mut stmt = tx.prepare(
            "SELECT party_id, COUNT(*), SUM(energy_cost) FROM orders
             WHERE menu_id = ?1 GROUP BY party_id ORDER BY party_id",
        )?;
        let refunds = stmt
            .query_map([menu_id], |row| {
                Ok(PartyRefund {
                    party_id: row.get(0)?,
                    orders: row.get(1)?,
                    amount: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for refund in &refunds {
            refund_party(tx, refund.party_id, refund.amount)?;
        }
        fault_point(FaultStage::AfterRefund)?;

        let removed_orders = tx.execute("DELETE FROM orders WHERE menu_id = ?1", [menu_id])? as i64;
        fault_point(FaultStage::BeforeMenuDelete)?;
        tx.execute("DELETE FROM menus WHERE id = ?1", [menu_id])?;

        Ok(MenuCascade {
            menu_id,
            removed_orders,
            refunds,
        })
    })?;

    tracing::info!(
        menu_id,
        removed_orders = cascade.removed_orders,
        parties = cascade.refunds.len(),
        "menu item deleted"
    );
    Ok(cascade)
}

/// Remove a party with its orders and memberships. Budgets die with it.
pub fn delete_party(
    store: &Store,
    ctx: &RequestContext,
    party_id: i64,
) -> Result<PartyCascade, LedgerError> {
    ctx.require_admin()?;
    let intent_ref = time::new_intent_ref("party.delete");
    let broker = DbBroker::new(store);

    let cascade = broker.with_tx(&ctx.actor(), Some(&intent_ref), "party.delete", |tx| {
        party_budget_row(tx, party_id)?;
        let removed_orders = tx.execute("DELETE FROM orders WHERE party_id = ?1", [party_id])? as i64;
        let removed_memberships =
            tx.execute("DELETE FROM memberships WHERE party_id = ?1", [party_id])? as i64;
        tx.execute("DELETE FROM parties WHERE id = ?1", [party_id])?;
        Ok(PartyCascade {
            party_id,
            removed_orders,
            removed_memberships,
        })
    })?;

    tracing::info!(
        party_id,
        removed_orders = cascade.removed_orders,
        removed_memberships = cascade.removed_memberships,
        "party deleted"
    );
    Ok(cascade)
}

/// Leave the caller's party, refunding every order they still hold in it.
pub fn leave_party(store: &Store, ctx: &RequestContext) -> Result<LeaveReport, LedgerError> {
    let party_id = ctx.require_party()?;
    let intent_ref = time::new_intent_ref("party.leave");
    let broker = DbBroker::new(store);

    let report = broker.with_tx(&ctx.actor(), Some(&intent_ref), "party.leave", |tx| {
        party_budget_row(tx, party_id)?;
        let (orders, refunded): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(energy_cost), 0) FROM orders
             WHERE party_id = ?1 AND user_id = ?2",
            params![party_id, ctx.user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let left = tx.execute(
            "DELETE FROM memberships WHERE party_id = ?1 AND user_id = ?2",
            params![party_id, ctx.user_id],
        )?;
        if left == 0 && orders == 0 {
            return Err(LedgerError::NotFound(format!(
                "user {} is not a member of party {}",
                ctx.user_id, party_id
            )));
        }

        tx.execute(
            "DELETE FROM orders WHERE party_id = ?1 AND user_id = ?2",
            params![party_id, ctx.user_id],
        )?;
        fault_point(FaultStage::AfterOrderDelete)?;
        refund_party(tx, party_id, refunded)?;

        let budget = party_budget_row(tx, party_id)?;
        Ok(LeaveReport {
            party_id,
            removed_orders: orders,
            refunded,
            energy_left: budget.energy_budget,
        })
    })?;

    tracing::info!(
        party_id,
        user_id = ctx.user_id,
        refunded = report.refunded,
        "user left party"
    );
    Ok(report)
}

/// Refund and delete every order a user holds in any party. Runs inside the caller's transaction.
pub(crate) fn purge_user_orders(
    conn: &Connection,
    user_id: i64,
) -> Result<Vec<PartyRefund>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT party_id, COUNT(*), SUM(energy_cost) FROM orders
         WHERE user_id = ?1 GROUP BY party_id ORDER BY party_id",
    )?;
    let refunds = stmt
        .query_map([user_id], |row| {
            Ok(PartyRefund {
                party_id: row.get(0)?,
                orders: row.get(1)?,
                amount: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for refund in &refunds {
        refund_party(conn, refund.party_id, refund.amount)?;
    }
    conn.execute("DELETE FROM orders WHERE user_id = ?1", [user_id])?;
    Ok(refunds)
}

/// Set a new initial budget, keeping committed orders paid for. Runs inside the caller's transaction.
pub(crate) fn rebase_initial_budget(
    conn: &Connection,
    party_id: i64,
    initial_budget: i64,
) -> Result<i64, LedgerError> {
    if initial_budget <= 0 {
        return Err(LedgerError::BadRequest("initial budget must be positive".into()));
    }
    party_budget_row(conn, party_id)?;
    let committed = committed_energy(conn, party_id)?;
    if initial_budget < committed {
        return Err(LedgerError::Conflict(format!(
            "party {} already has {} energy committed to orders",
            party_id, committed
        )));
    }
    let energy_left = initial_budget - committed;
    conn.execute(
        "UPDATE parties SET initial_budget = ?1, energy_budget = ?2 WHERE id = ?3",
        params![initial_budget, energy_left, party_id],
    )?;
    Ok(energy_left)
}

/// Raise a party's budget by `amount` and reopen it for orders.
pub fn top_up_party(
    store: &Store,
    ctx: &RequestContext,
    party_id: i64,
    amount: i64,
) -> Result<PartyBudget, LedgerError> {
    ctx.require_admin()?;
    if amount <= 0 {
        return Err(LedgerError::BadRequest("top-up amount must be positive".into()));
    }
    let broker = DbBroker::new(store);
    let budget = broker.with_tx(&ctx.actor(), None, "party.top_up", |tx| {
        let updated = tx.execute(
            "UPDATE parties SET initial_budget = initial_budget + ?1,
                                energy_budget = energy_budget + ?1,
                                is_active = 1
             WHERE id = ?2",
            params![amount, party_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("party {}", party_id)));
        }
        party_budget_row(tx, party_id)
    })?;
    tracing::info!(party_id, amount, energy_left = budget.energy_budget, "party topped up");
    Ok(budget)
}

pub fn party_state(store: &Store, party_id: i64) -> Result<PartyState, LedgerError> {
    let budget = DbBroker::new(store).with_read(|conn| party_budget_row(conn, party_id))?;
    Ok(if budget.energy_budget == 0 {
        PartyState::Exhausted
    } else if !budget.active {
        PartyState::Closed
    } else {
        PartyState::Active
    })
}

/// Check the conservation invariant for one party.
pub fn balance(store: &Store, party_id: i64) -> Result<LedgerBalance, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        let budget = party_budget_row(conn, party_id)?;
        let committed = committed_energy(conn, party_id)?;
        Ok(LedgerBalance {
            party_id,
            initial_budget: budget.initial_budget,
            energy_left: budget.energy_budget,
            committed,
            balanced: budget.energy_budget + committed == budget.initial_budget
                && budget.energy_budget >= 0,
        })
    })
}

/// Orders of the caller's party grouped by user, menu item and paid unit cost,
/// with the remaining budget. A repriced item shows one row per price.
pub fn get_party_orders(store: &Store, ctx: &RequestContext) -> Result<PartyOrders, LedgerError> {
    let party_id = ctx.require_party()?;
    DbBroker::new(store).with_read(|conn| {
        let budget = party_budget_row(conn, party_id)?;
        let mut stmt = conn.prepare(
            "SELECT MIN(o.id), u.username, m.name, m.id, m.image_urls, o.energy_cost,
                    COUNT(*), SUM(o.energy_cost)
             FROM orders o
             JOIN users u ON o.user_id = u.id
             JOIN menus m ON o.menu_id = m.id
             WHERE o.party_id = ?1
             GROUP BY u.id, m.id, o.energy_cost
             ORDER BY MIN(o.id)",
        )?;
        let orders = stmt
            .query_map([party_id], |row| {
                Ok(PartyOrderRow {
                    order_id: row.get(0)?,
                    username: row.get(1)?,
                    menu_name: row.get(2)?,
                    menu_id: row.get(3)?,
                    image_urls: catalog::image_urls_column(row, 4)?,
                    energy_cost: row.get(5)?,
                    quantity: row.get(6)?,
                    total_cost: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PartyOrders {
            party_id,
            energy_left: budget.energy_budget,
            orders,
        })
    })
}
