use crate::core::error::LedgerError;
use crate::core::identity::{self, RequestContext};
use crate::core::ledger;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(name = "order", about = "Order against the party's shared energy budget.")]
pub struct OrderCli {
    #[clap(subcommand)]
    pub command: OrderCommand,
}

#[derive(Subcommand, Debug)]
pub enum OrderCommand {
    /// Order one menu item for the party given with --party.
    Place {
        #[clap(long)]
        menu: i64,
        /// Idempotency token; resubmitting the same token never orders twice.
        #[clap(long)]
        token: Option<String>,
    },
    /// Cancel one of your order lines and refund its energy.
    Remove {
        #[clap(long)]
        id: i64,
    },
    /// Show the party's orders grouped by user and item, with energy left.
    List,
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "order",
        "version": "0.1.0",
        "description": "Order lines debited against a party's energy budget",
        "commands": [
            { "name": "place", "parameters": ["menu", "token"] },
            { "name": "remove", "parameters": ["id"] },
            { "name": "list", "parameters": [] }
        ],
        "storage": ["ledger.db#orders"]
    })
}

pub fn run_order_cli(
    store: &Store,
    ctx: Option<&RequestContext>,
    cli: OrderCli,
) -> Result<serde_json::Value, LedgerError> {
    let ctx = identity::authenticated(ctx)?;
    let out = match cli.command {
        OrderCommand::Place { menu, token } => {
            let placed = ledger::place_order(store, ctx, menu, token.as_deref())?;
            time::command_envelope("order.place", serde_json::json!({ "order": placed }))
        }
        OrderCommand::Remove { id } => {
            let removed = ledger::remove_order(store, ctx, id)?;
            time::command_envelope("order.remove", serde_json::json!({ "removed": removed }))
        }
        OrderCommand::List => {
            let view = ledger::get_party_orders(store, ctx)?;
            time::command_envelope(
                "order.list",
                serde_json::json!({
                    "party_id": view.party_id,
                    "energy_left": view.energy_left,
                    "orders": view.orders,
                }),
            )
        }
    };
    Ok(out)
}
