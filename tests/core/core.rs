#[path = "../common/mod.rs"]
mod common;

use common::Fixture;
use partyledger::core::broker::DbBroker;
use partyledger::core::config::LedgerConfig;
use partyledger::core::error::{ErrorKind, LedgerError};
use partyledger::core::identity::RequestContext;
use partyledger::core::ledger::{self, PartyState};
use partyledger::plugins::catalog::{self, MenuItemInput};
use partyledger::plugins::party;
use std::sync::{Arc, Barrier};

fn assert_balanced(fx: &Fixture, party_id: i64) {
    let balance = ledger::balance(&fx.store, party_id).expect("balance");
    assert!(balance.balanced, "ledger out of balance: {balance:?}");
}

struct ScenarioA {
    party_id: i64,
    menu_id: i64,
    u1: RequestContext,
    u2: RequestContext,
    u1_order: i64,
    u2_order: i64,
}

/// Party budget 10, item cost 4, three guests ordering one item each.
fn scenario_a(fx: &Fixture) -> ScenarioA {
    let party_id = fx.party("friday", 10);
    let menu_id = fx.menu("dumplings", 4);
    let u1 = fx.member(&fx.guest("u1"), "friday");
    let u2 = fx.member(&fx.guest("u2"), "friday");
    let u3 = fx.member(&fx.guest("u3"), "friday");

    let first = ledger::place_order(&fx.store, &u1, menu_id, None).expect("u1 order");
    assert_eq!(first.energy_left, 6);
    assert_eq!(fx.order_count(party_id), 1);

    let second = ledger::place_order(&fx.store, &u2, menu_id, None).expect("u2 order");
    assert_eq!(second.energy_left, 2);

    let third = ledger::place_order(&fx.store, &u3, menu_id, None);
    match third {
        Err(LedgerError::InsufficientBudget {
            required,
            available,
            ..
        }) => {
            assert_eq!(required, 4);
            assert_eq!(available, 2);
        }
        other => panic!("expected InsufficientBudget, got {other:?}"),
    }
    assert_eq!(fx.budget(party_id), 2);
    assert_eq!(fx.order_count(party_id), 2);

    ScenarioA {
        party_id,
        menu_id,
        u1,
        u2,
        u1_order: first.order_id,
        u2_order: second.order_id,
    }
}

#[test]
fn orders_debit_until_the_budget_runs_short() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);
    assert_balanced(&fx, s.party_id);
}

#[test]
fn removing_an_order_refunds_its_cost() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);

    let removed = ledger::remove_order(&fx.store, &s.u1, s.u1_order).expect("remove");
    assert_eq!(removed.refunded, 4);
    assert_eq!(removed.energy_left, 6);
    assert_eq!(fx.budget(s.party_id), 6);

    let view = ledger::get_party_orders(&fx.store, &s.u2).expect("party orders");
    assert_eq!(view.orders.len(), 1);
    assert_eq!(view.orders[0].order_id, s.u2_order);
    assert_eq!(view.orders[0].username, "u2");
    assert_balanced(&fx, s.party_id);
}

#[test]
fn deleting_a_menu_item_refunds_every_open_order() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);
    ledger::remove_order(&fx.store, &s.u1, s.u1_order).expect("remove");

    let cascade = ledger::delete_menu_item(&fx.store, &fx.admin, s.menu_id).expect("delete");
    assert_eq!(cascade.removed_orders, 1);
    assert_eq!(cascade.refunds.len(), 1);
    assert_eq!(cascade.refunds[0].amount, 4);

    assert_eq!(fx.budget(s.party_id), 10);
    assert_eq!(fx.order_count(s.party_id), 0);
    let err = catalog::get_menu_item(&fx.store, s.menu_id).expect_err("item is gone");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_balanced(&fx, s.party_id);
}

#[test]
fn menu_cascade_refunds_each_party_separately() {
    let fx = Fixture::new();
    let red = fx.party("red", 20);
    let blue = fx.party("blue", 15);
    let green = fx.party("green", 9);
    let soup = fx.menu("soup", 3);
    let bread = fx.menu("bread", 2);

    let ana = fx.member(&fx.guest("ana"), "red");
    let ben = fx.member(&fx.guest("ben"), "red");
    let cai = fx.member(&fx.guest("cai"), "blue");
    let dee = fx.member(&fx.guest("dee"), "green");

    for ctx in [&ana, &ana, &ben, &cai] {
        ledger::place_order(&fx.store, ctx, soup, None).expect("soup");
    }
    ledger::place_order(&fx.store, &ben, bread, None).expect("bread");
    ledger::place_order(&fx.store, &dee, bread, None).expect("bread");

    assert_eq!(fx.budget(red), 20 - 9 - 2);
    assert_eq!(fx.budget(blue), 15 - 3);
    assert_eq!(fx.budget(green), 9 - 2);

    let cascade = ledger::delete_menu_item(&fx.store, &fx.admin, soup).expect("delete soup");
    assert_eq!(cascade.removed_orders, 4);
    let refunds: Vec<(i64, i64, i64)> = cascade
        .refunds
        .iter()
        .map(|r| (r.party_id, r.orders, r.amount))
        .collect();
    assert_eq!(refunds, vec![(red, 3, 9), (blue, 1, 3)]);

    assert_eq!(fx.budget(red), 18);
    assert_eq!(fx.budget(blue), 15);
    assert_eq!(fx.budget(green), 7, "parties without the item are untouched");
    assert_eq!(fx.order_count(red), 1);
    assert_eq!(fx.order_count(green), 1);
    for party_id in [red, blue, green] {
        assert_balanced(&fx, party_id);
    }
}

#[test]
fn cascade_refunds_the_price_that_was_paid() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let menu_id = fx.menu("tea", 2);
    let guest = fx.member(&fx.guest("ana"), "friday");

    ledger::place_order(&fx.store, &guest, menu_id, None).expect("order");
    catalog::update_menu_item(
        &fx.store,
        &fx.admin,
        menu_id,
        &MenuItemInput::new("tea", "now pricier", 5),
    )
    .expect("reprice");
    assert_eq!(fx.budget(party_id), 8, "repricing leaves committed orders alone");
    assert_balanced(&fx, party_id);

    let cascade = ledger::delete_menu_item(&fx.store, &fx.admin, menu_id).expect("delete");
    assert_eq!(cascade.refunds[0].amount, 2);
    assert_eq!(fx.budget(party_id), 10);
}

#[test]
fn order_removal_is_owner_only_except_for_admins() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);

    let err = ledger::remove_order(&fx.store, &s.u2, s.u1_order).expect_err("not owner");
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(fx.budget(s.party_id), 2);

    let admin = fx.member(&fx.admin, "friday");
    let removed = ledger::remove_order(&fx.store, &admin, s.u1_order).expect("admin removes");
    assert_eq!(removed.energy_left, 6);
    assert_balanced(&fx, s.party_id);
}

#[test]
fn orders_of_other_parties_are_not_found() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);
    fx.party("saturday", 10);
    let outsider = fx.member(&fx.guest("zed"), "saturday");

    let err = ledger::remove_order(&fx.store, &outsider, s.u1_order).expect_err("foreign order");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = ledger::remove_order(&fx.store, &s.u1, 9_999).expect_err("missing order");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(fx.budget(s.party_id), 2);
}

#[test]
fn place_order_rejects_bad_input_without_touching_the_budget() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let guest = fx.guest("ana");

    let err = ledger::place_order(&fx.store, &guest, 1, None).expect_err("no party");
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let member = fx.member(&guest, "friday");
    let err = ledger::place_order(&fx.store, &member, 0, None).expect_err("bad id");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    let err = ledger::place_order(&fx.store, &member, 42, None).expect_err("no such item");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let menu_id = fx.menu("tea", 1);
    let ghost = guest.clone().in_party(party_id + 100);
    let err = ledger::place_order(&fx.store, &ghost, menu_id, None).expect_err("no such party");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = ledger::place_order(&fx.store, &member, menu_id, Some("   ")).expect_err("blank");
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    assert_eq!(fx.budget(party_id), 10);
    assert_eq!(fx.total_orders(), 0);
}

#[test]
fn request_token_makes_placement_idempotent() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let menu_id = fx.menu("dumplings", 4);
    let other_menu = fx.menu("tea", 1);
    let ana = fx.member(&fx.guest("ana"), "friday");
    let ben = fx.member(&fx.guest("ben"), "friday");

    let first = ledger::place_order(&fx.store, &ana, menu_id, Some("req-1")).expect("first");
    assert!(!first.replayed);
    let retry = ledger::place_order(&fx.store, &ana, menu_id, Some("req-1")).expect("retry");
    assert!(retry.replayed);
    assert_eq!(retry.order_id, first.order_id);
    assert_eq!(retry.energy_left, 6);
    assert_eq!(fx.budget(party_id), 6);
    assert_eq!(fx.order_count(party_id), 1);

    let err = ledger::place_order(&fx.store, &ana, other_menu, Some("req-1"))
        .expect_err("different item");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = ledger::place_order(&fx.store, &ben, menu_id, Some("req-1"))
        .expect_err("different user");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let fresh = ledger::place_order(&fx.store, &ana, menu_id, Some("req-2")).expect("new token");
    assert!(!fresh.replayed);
    assert_eq!(fx.budget(party_id), 2);
    assert_balanced(&fx, party_id);
}

#[test]
fn exhausted_party_stays_exhausted_until_topped_up() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 8);
    let menu_id = fx.menu("dumplings", 4);
    let ana = fx.member(&fx.guest("ana"), "friday");

    assert_eq!(ledger::party_state(&fx.store, party_id).unwrap(), PartyState::Active);
    ledger::place_order(&fx.store, &ana, menu_id, None).expect("first");
    ledger::place_order(&fx.store, &ana, menu_id, None).expect("second");
    assert_eq!(
        ledger::party_state(&fx.store, party_id).unwrap(),
        PartyState::Exhausted
    );
    assert!(!party::get_party(&fx.store, party_id).unwrap().active);

    let err = ledger::place_order(&fx.store, &ana, menu_id, None).expect_err("empty");
    assert_eq!(err.kind(), ErrorKind::InsufficientBudget);

    let err = party::join_party(&fx.store, &fx.guest("ben"), "friday", common::PARTY_SECRET)
        .expect_err("closed parties take no new members");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let budget = ledger::top_up_party(&fx.store, &fx.admin, party_id, 4).expect("top up");
    assert!(budget.active);
    assert_eq!(budget.initial_budget, 12);
    assert_eq!(budget.energy_budget, 4);
    assert_eq!(ledger::party_state(&fx.store, party_id).unwrap(), PartyState::Active);

    ledger::place_order(&fx.store, &ana, menu_id, None).expect("after top-up");
    assert_balanced(&fx, party_id);
}

#[test]
fn exhaustion_keeps_party_open_when_configured() {
    let mut config = LedgerConfig::default();
    config.ledger.deactivate_on_exhaustion = false;
    let fx = Fixture::with_config(config);
    let party_id = fx.party("friday", 4);
    let menu_id = fx.menu("dumplings", 4);
    let ana = fx.member(&fx.guest("ana"), "friday");

    let placed = ledger::place_order(&fx.store, &ana, menu_id, None).expect("order");
    assert_eq!(
        ledger::party_state(&fx.store, party_id).unwrap(),
        PartyState::Exhausted
    );

    let removed = ledger::remove_order(&fx.store, &ana, placed.order_id).expect("remove");
    assert_eq!(removed.energy_left, 4);
    assert_eq!(ledger::party_state(&fx.store, party_id).unwrap(), PartyState::Active);
}

#[test]
fn admin_closed_party_rejects_orders() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let menu_id = fx.menu("tea", 1);
    let ana = fx.member(&fx.guest("ana"), "friday");

    let update = party::PartyUpdate {
        active: Some(false),
        ..Default::default()
    };
    party::update_party(&fx.store, &fx.admin, party_id, &update).expect("close");
    assert_eq!(ledger::party_state(&fx.store, party_id).unwrap(), PartyState::Closed);
    let err = ledger::place_order(&fx.store, &ana, menu_id, None).expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fx.budget(party_id), 10);
}

#[test]
fn top_up_validates_input() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let guest = fx.guest("ana");

    let err = ledger::top_up_party(&fx.store, &guest, party_id, 5).expect_err("guest");
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = ledger::top_up_party(&fx.store, &fx.admin, party_id, 0).expect_err("zero");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    let err = ledger::top_up_party(&fx.store, &fx.admin, 777, 5).expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn leaving_a_party_refunds_the_leavers_orders() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);

    let report = ledger::leave_party(&fx.store, &s.u1).expect("leave");
    assert_eq!(report.removed_orders, 1);
    assert_eq!(report.refunded, 4);
    assert_eq!(report.energy_left, 6);
    assert!(!party::is_member(&fx.store, s.u1.user_id, s.party_id).unwrap());
    assert!(party::is_member(&fx.store, s.u2.user_id, s.party_id).unwrap());
    assert_eq!(fx.order_count(s.party_id), 1);
    assert_balanced(&fx, s.party_id);

    let err = ledger::leave_party(&fx.store, &s.u1).expect_err("already left");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn deleting_a_party_drops_its_orders_and_members_only() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);
    let other = fx.party("saturday", 5);
    let zed = fx.member(&fx.guest("zed"), "saturday");
    ledger::place_order(&fx.store, &zed, s.menu_id, None).expect("order");

    let err = ledger::delete_party(&fx.store, &s.u1, s.party_id).expect_err("guest");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let cascade = ledger::delete_party(&fx.store, &fx.admin, s.party_id).expect("delete");
    assert_eq!(cascade.removed_orders, 2);
    assert_eq!(cascade.removed_memberships, 3);
    assert_eq!(
        party::get_party(&fx.store, s.party_id).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(fx.total_orders(), 1);
    assert_eq!(fx.budget(other), 1);

    let err = ledger::get_party_orders(&fx.store, &s.u2).expect_err("party gone");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = ledger::delete_party(&fx.store, &fx.admin, s.party_id).expect_err("twice");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn party_orders_group_by_user_and_item() {
    let fx = Fixture::new();
    fx.party("friday", 30);
    let soup = fx.menu("soup", 3);
    let tea = fx.menu("tea", 1);
    let ana = fx.member(&fx.guest("ana"), "friday");
    let ben = fx.member(&fx.guest("ben"), "friday");

    ledger::place_order(&fx.store, &ana, soup, None).unwrap();
    ledger::place_order(&fx.store, &ben, tea, None).unwrap();
    ledger::place_order(&fx.store, &ana, soup, None).unwrap();
    ledger::place_order(&fx.store, &ana, tea, None).unwrap();

    let view = ledger::get_party_orders(&fx.store, &ben).expect("view");
    assert_eq!(view.energy_left, 30 - 8);
    let rows: Vec<(&str, &str, i64, i64)> = view
        .orders
        .iter()
        .map(|r| (r.username.as_str(), r.menu_name.as_str(), r.quantity, r.total_cost))
        .collect();
    assert_eq!(
        rows,
        vec![("ana", "soup", 2, 6), ("ben", "tea", 1, 1), ("ana", "tea", 1, 1)]
    );

    let outsider = fx.guest("cai");
    let err = ledger::get_party_orders(&fx.store, &outsider).expect_err("no party");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[test]
fn party_orders_split_rows_by_the_price_paid() {
    let fx = Fixture::new();
    fx.party("friday", 30);
    let soup = catalog::create_menu_item(
        &fx.store,
        &fx.admin,
        &MenuItemInput::new("soup", "", 3).with_images(["https://img.test/soup.jpg"]),
    )
    .expect("menu")
    .id;
    let ana = fx.member(&fx.guest("ana"), "friday");

    ledger::place_order(&fx.store, &ana, soup, None).unwrap();
    ledger::place_order(&fx.store, &ana, soup, None).unwrap();
    let repriced = MenuItemInput::new("soup", "", 5).with_images(["https://img.test/soup.jpg"]);
    catalog::update_menu_item(&fx.store, &fx.admin, soup, &repriced).expect("reprice");
    ledger::place_order(&fx.store, &ana, soup, None).unwrap();

    let view = ledger::get_party_orders(&fx.store, &ana).expect("view");
    assert_eq!(view.energy_left, 30 - 11);
    let rows: Vec<(i64, i64, i64)> = view
        .orders
        .iter()
        .map(|r| (r.energy_cost, r.quantity, r.total_cost))
        .collect();
    assert_eq!(rows, vec![(3, 2, 6), (5, 1, 5)]);
    for row in &view.orders {
        assert_eq!(row.quantity * row.energy_cost, row.total_cost);
        assert_eq!(row.image_urls, vec!["https://img.test/soup.jpg"]);
    }
}

#[test]
fn racing_orders_for_the_last_item_admit_exactly_one() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 4);
    let menu_id = fx.menu("dumplings", 4);
    let racers: Vec<RequestContext> = (0..6)
        .map(|i| fx.member(&fx.guest(&format!("racer{i}")), "friday"))
        .collect();

    let store = Arc::new(fx.store.clone());
    let barrier = Arc::new(Barrier::new(racers.len()));
    let handles: Vec<_> = racers
        .into_iter()
        .map(|ctx| {
            let store = Arc::clone(&store);
            let gate = Arc::clone(&barrier);
            std::thread::spawn(move || {
                gate.wait();
                ledger::place_order(&store, &ctx, menu_id, None)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("racer thread"))
        .collect();
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let short = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientBudget { .. })))
        .count();
    assert_eq!(wins, 1, "{results:?}");
    assert_eq!(short, results.len() - 1, "{results:?}");
    assert_eq!(fx.budget(party_id), 0);
    assert_eq!(fx.order_count(party_id), 1);
    assert_balanced(&fx, party_id);
}

#[test]
fn ledger_writes_are_audited() {
    let fx = Fixture::new();
    let s = scenario_a(&fx);
    ledger::remove_order(&fx.store, &s.u1, s.u1_order).unwrap();

    let events = DbBroker::new(&fx.store).read_events().expect("events");
    let places: Vec<_> = events.iter().filter(|e| e.op == "order.place").collect();
    assert_eq!(places.len(), 3);
    assert_eq!(places.iter().filter(|e| e.status == "error").count(), 1);
    assert!(places.iter().all(|e| e.intent_ref.is_some()));

    let removal = events
        .iter()
        .find(|e| e.op == "order.remove")
        .expect("removal event");
    assert_eq!(removal.actor, s.u1.actor());
    assert_eq!(removal.status, "success");
}

#[test]
fn committed_order_is_reported_even_if_the_audit_log_is_unwritable() {
    let fx = Fixture::new();
    let party_id = fx.party("friday", 10);
    let menu_id = fx.menu("dumplings", 4);
    let ana = fx.member(&fx.guest("ana"), "friday");

    let audit = fx.store.audit_log_path().expect("audit enabled");
    let _ = std::fs::remove_file(&audit);
    std::fs::create_dir_all(&audit).expect("block the audit path");

    let placed = ledger::place_order(&fx.store, &ana, menu_id, None).expect("order commits");
    assert_eq!(placed.energy_left, 6);
    assert_eq!(fx.budget(party_id), 6);
    assert_eq!(fx.order_count(party_id), 1);
    assert_balanced(&fx, party_id);
}
