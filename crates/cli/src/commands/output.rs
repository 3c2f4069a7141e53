//! Printing results to stdout.

#![allow(clippy::print_stdout)]

use cartwright_core::{CartItem, Price, WishlistItem};
use cartwright_storefront::offers::OfferView;
use cartwright_storefront::pricing::PriceSummary;
use serde::Serialize;

use super::{CliError, Session};

fn json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn cart(session: &Session, items: &[CartItem]) -> Result<(), CliError> {
    if session.json {
        return json(items);
    }
    if items.is_empty() {
        println!("Cart is empty");
        return Ok(());
    }
    let currency = session.storefront().config().currency;
    for item in items {
        println!(
            "{:>10}  {:<32} {:>4} x {:>10}  {:>10}",
            item.id.as_str(),
            item.name,
            item.quantity,
            Price::new(item.unit_price, currency).display(),
            Price::new(item.line_total(), currency).display(),
        );
    }
    println!(
        "{} item(s), {}",
        session.storefront().cart().total_item_count(),
        Price::new(session.storefront().cart().total_price(), currency)
    );
    Ok(())
}

pub fn wishlist(session: &Session, items: &[WishlistItem]) -> Result<(), CliError> {
    if session.json {
        return json(items);
    }
    if items.is_empty() {
        println!("Wishlist is empty");
        return Ok(());
    }
    let currency = session.storefront().config().currency;
    for item in items {
        println!(
            "{:>10}  {:<32} {:>10}",
            item.id.as_str(),
            item.name,
            Price::new(item.unit_price, currency).display()
        );
    }
    Ok(())
}

pub fn offers(session: &Session, views: &[OfferView]) -> Result<(), CliError> {
    if session.json {
        return json(views);
    }
    if views.is_empty() {
        println!("No offers available");
        return Ok(());
    }
    let currency = session.storefront().config().currency;
    for view in views {
        let amount = view.discount_amount.unwrap_or(view.estimated_discount);
        println!(
            "{:<12} {:<32} {:<10} {:>10}{}",
            view.offer.id.as_str(),
            view.offer.title,
            format!("{:?}", view.state).to_lowercase(),
            Price::new(amount, currency).display(),
            view.reason
                .as_deref()
                .map(|reason| format!("  ({reason})"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

pub fn summary(session: &Session, summary: &PriceSummary) -> Result<(), CliError> {
    if session.json {
        return json(&summary.rounded());
    }
    for (label, amount) in summary.lines(session.storefront().config().currency) {
        println!("{label:<10} {amount:>12}");
    }
    Ok(())
}
