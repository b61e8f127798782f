use crate::core::broker::DbBroker;
use crate::core::error::LedgerError;
use crate::core::identity::{self, RequestContext};
use crate::core::ledger;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[clap(name = "menu", about = "Manage the shared menu catalog.")]
pub struct MenuCli {
    #[clap(subcommand)]
    pub command: MenuCommand,
}

#[derive(Subcommand, Debug)]
pub enum MenuCommand {
    /// Add a menu item (admin).
    Add {
        #[clap(value_name = "NAME")]
        name: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Energy debited from a party per order.
        #[clap(long)]
        cost: i64,
        /// Image URL; repeat for several.
        #[clap(long = "image", value_name = "URL")]
        images: Vec<String>,
    },
    /// List menu items.
    List,
    /// Show one menu item.
    Get {
        #[clap(long)]
        id: i64,
    },
    /// Replace a menu item's name, description, cost and images (admin).
    Update {
        #[clap(long)]
        id: i64,
        #[clap(long)]
        name: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long)]
        cost: i64,
        #[clap(long = "image", value_name = "URL")]
        images: Vec<String>,
    },
    /// Delete a menu item, refunding every party that ordered it (admin).
    Delete {
        #[clap(long)]
        id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub energy_cost: i64,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItemInput {
    pub name: String,
    pub description: String,
    pub energy_cost: i64,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

pub const MAX_IMAGE_URLS: usize = 5;

impl MenuItemInput {
    pub fn new(name: &str, description: &str, energy_cost: i64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            energy_cost,
            image_urls: Vec::new(),
        }
    }

    pub fn with_images<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.image_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    fn image_urls_json(&self) -> Result<String, LedgerError> {
        serde_json::to_string(&self.image_urls)
            .map_err(|e| LedgerError::Internal(format!("encode image urls: {}", e)))
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::BadRequest("menu item name must not be empty".into()));
        }
        if self.energy_cost <= 0 {
            return Err(LedgerError::BadRequest(
                "menu item energy cost must be greater than 0".into(),
            ));
        }
        if self.image_urls.len() > MAX_IMAGE_URLS {
            return Err(LedgerError::BadRequest(format!(
                "a menu item takes at most {} images",
                MAX_IMAGE_URLS
            )));
        }
        if self.image_urls.iter().any(|url| url.trim().is_empty()) {
            return Err(LedgerError::BadRequest("image url must not be empty".into()));
        }
        Ok(())
    }
}

/// Decode the JSON list kept in `menus.image_urls`.
pub(crate) fn image_urls_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn menu_item_row(row: &Row<'_>) -> rusqlite::Result<MenuItem> {
    Ok(MenuItem {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        energy_cost: row.get(3)?,
        image_urls: image_urls_column(row, 4)?,
    })
}

fn read_menu_item(conn: &Connection, id: i64) -> Result<Option<MenuItem>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT id, name, description, energy_cost, image_urls FROM menus WHERE id = ?1",
            [id],
            menu_item_row,
        )
        .optional()?)
}

/// Current energy cost of a menu item, as priced by the ledger.
pub fn lookup_energy_cost(conn: &Connection, menu_id: i64) -> Result<i64, LedgerError> {
    conn.query_row(
        "SELECT energy_cost FROM menus WHERE id = ?1",
        [menu_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound(format!("menu item {}", menu_id)))
}

pub fn create_menu_item(
    store: &Store,
    ctx: &RequestContext,
    input: &MenuItemInput,
) -> Result<MenuItem, LedgerError> {
    ctx.require_admin()?;
    input.validate()?;
    let images = input.image_urls_json()?;
    let broker = DbBroker::new(store);
    let item = broker.with_tx(&ctx.actor(), None, "menu.add", |tx| {
        tx.execute(
            "INSERT INTO menus(name, description, energy_cost, image_urls)
             VALUES(?1, ?2, ?3, ?4)",
            params![input.name.trim(), input.description, input.energy_cost, images],
        )
        .map_err(|e| LedgerError::from(e).unique_as_conflict("menu item name"))?;
        Ok(MenuItem {
            id: tx.last_insert_rowid(),
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            energy_cost: input.energy_cost,
            image_urls: input.image_urls.clone(),
        })
    })?;
    tracing::info!(menu_id = item.id, cost = item.energy_cost, "menu item created");
    Ok(item)
}

pub fn list_menu_items(store: &Store) -> Result<Vec<MenuItem>, LedgerError> {
    DbBroker::new(store).with_read(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, name, description, energy_cost, image_urls FROM menus ORDER BY id",
        )?;
        let items = stmt
            .query_map([], menu_item_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    })
}

pub fn get_menu_item(store: &Store, id: i64) -> Result<MenuItem, LedgerError> {
    DbBroker::new(store)
        .with_read(|conn| read_menu_item(conn, id))?
        .ok_or_else(|| LedgerError::NotFound(format!("menu item {}", id)))
}

/// Cost changes apply to future orders only; placed lines keep their snapshot.
pub fn update_menu_item(
    store: &Store,
    ctx: &RequestContext,
    id: i64,
    input: &MenuItemInput,
) -> Result<MenuItem, LedgerError> {
    ctx.require_admin()?;
    input.validate()?;
    let images = input.image_urls_json()?;
    let broker = DbBroker::new(store);
    broker.with_tx(&ctx.actor(), None, "menu.update", |tx| {
        let updated = tx
            .execute(
                "UPDATE menus SET name = ?1, description = ?2, energy_cost = ?3, image_urls = ?4
                 WHERE id = ?5",
                params![input.name.trim(), input.description, input.energy_cost, images, id],
            )
            .map_err(|e| LedgerError::from(e).unique_as_conflict("menu item name"))?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("menu item {}", id)));
        }
        read_menu_item(tx, id)?
            .ok_or_else(|| LedgerError::NotFound(format!("menu item {}", id)))
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "menu",
        "version": "0.1.0",
        "description": "Shared menu catalog priced in energy",
        "commands": [
            { "name": "add", "parameters": ["name", "description", "cost", "image"] },
            { "name": "list", "parameters": [] },
            { "name": "get", "parameters": ["id"] },
            { "name": "update", "parameters": ["id", "name", "description", "cost", "image"] },
            { "name": "delete", "parameters": ["id"] }
        ],
        "storage": ["ledger.db#menus"]
    })
}

pub fn run_menu_cli(
    store: &Store,
    ctx: Option<&RequestContext>,
    cli: MenuCli,
) -> Result<serde_json::Value, LedgerError> {
    let out = match cli.command {
        MenuCommand::Add {
            name,
            description,
            cost,
            images,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let input = MenuItemInput::new(&name, &description, cost).with_images(images);
            let item = create_menu_item(store, ctx, &input)?;
            time::command_envelope("menu.add", serde_json::json!({ "item": item }))
        }
        MenuCommand::List => {
            let items = list_menu_items(store)?;
            time::command_envelope("menu.list", serde_json::json!({ "items": items }))
        }
        MenuCommand::Get { id } => {
            let item = get_menu_item(store, id)?;
            time::command_envelope("menu.get", serde_json::json!({ "item": item }))
        }
        MenuCommand::Update {
            id,
            name,
            description,
            cost,
            images,
        } => {
            let ctx = identity::authenticated(ctx)?;
            let input = MenuItemInput::new(&name, &description, cost).with_images(images);
            let item = update_menu_item(store, ctx, id, &input)?;
            time::command_envelope("menu.update", serde_json::json!({ "item": item }))
        }
        MenuCommand::Delete { id } => {
            let ctx = identity::authenticated(ctx)?;
            let cascade = ledger::delete_menu_item(store, ctx, id)?;
            time::command_envelope("menu.delete", serde_json::json!({ "cascade": cascade }))
        }
    };
    Ok(out)
}
