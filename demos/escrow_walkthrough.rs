//! Walks one trade through payment and confirmation, and a second one into a
//! timeout, logging each step.
//!
//! Run with `RUST_LOG=debug cargo run --example escrow_walkthrough`.
use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use escrow_ledger::{
    AccountId, Actor, AdvanceCommand, Asset, EscrowConfig, EscrowService, ManualClock, TimeStamp,
    TradeEvent, TradeTerms,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("walkthrough.db"))?);
    let clock = Arc::new(ManualClock::new(TimeStamp::new()));
    let config = EscrowConfig::load(None).context("loading configuration")?;
    let service = EscrowService::with_clock(db, config, clock.clone())?;

    let usdt = Asset::new("USDT")?;
    let (seller, buyer) = (AccountId::new(), AccountId::new());
    service.credit(&seller, &usdt, 100, "wallet-deposit-1")?;

    let terms = TradeTerms::builder()
        .set_seller(seller.clone())
        .set_buyer(buyer.clone())
        .set_asset(usdt.clone())
        .set_amount(40)
        .set_price(7)
        .build()?;

    let trade_id = service.create_escrow_trade(terms.clone(), None)?;
    info!(%trade_id, balance = ?service.balance(&seller, &usdt)?, "seller funds escrowed");

    service.advance_trade(AdvanceCommand::new(
        trade_id.clone(),
        TradeEvent::MarkPaid,
        Actor::Party(buyer.clone()),
    ))?;
    let status = service.advance_trade(AdvanceCommand::new(
        trade_id.clone(),
        TradeEvent::ConfirmReceipt,
        Actor::Party(seller.clone()),
    ))?;
    info!(
        %trade_id,
        %status,
        seller = ?service.balance(&seller, &usdt)?,
        buyer = ?service.balance(&buyer, &usdt)?,
        "first trade settled"
    );

    // the second trade is never paid
    let abandoned = service.create_escrow_trade(terms, None)?;
    clock.advance(Duration::seconds(service.config().payment_window().num_seconds() + 1));
    let expired = service.expire_due_trades()?;
    info!(
        count = expired.len(),
        status = %service.trade_status(&abandoned)?.status(),
        seller = ?service.balance(&seller, &usdt)?,
        "sweeper ran"
    );

    for record in service.audit_trail(&trade_id)? {
        info!(token = %record.token, kind = %record.kind, amount = record.amount, "journal");
    }
    Ok(())
}
