//! Offer eligibility, validation and the applied set.
//!
//! # State machine
//!
//! ```text
//! Ineligible -> Eligible -> Validating -> Applied
//!                                      -> Rejected
//! ```
//!
//! - Eligibility is local and synchronous (scope and time window).
//! - The applied discount always comes from the remote validation authority.
//! - Applied offers and rejections are bound to the cart revision they were
//!   validated against. Any change to the cart returns them to `Eligible`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cartwright_core::{
    AppliedOffer, CartItem, Offer, OfferId, OfferScope, OfferState, ValidationRequest,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::notify::Notifier;
use crate::remote::{RemoteOfferService, bounded};
use crate::session::SessionState;
use crate::store::CartStore;

const STALE_CART_REASON: &str = "Your cart changed while this offer was being checked.";
const ZERO_DISCOUNT_REASON: &str = "This offer does not reduce your total.";
const DEFAULT_REJECTION_REASON: &str = "This offer cannot be applied to your cart.";

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whether `offer` can be applied to `items` at `now`.
#[must_use]
pub fn is_eligible(offer: &Offer, items: &[CartItem], now: DateTime<Utc>) -> bool {
    offer.is_active_at(now) && !matched_scope_ids(offer, items).is_empty()
}

/// Scope ids from the cart that make `offer` eligible.
///
/// Store-wide offers match on the seller of any item; product and service
/// offers match on the item id itself.
#[must_use]
pub fn matched_scope_ids(offer: &Offer, items: &[CartItem]) -> Vec<String> {
    let Some(scope_id) = offer.scope_id() else {
        return Vec::new();
    };
    let matched = match offer.scope {
        OfferScope::StoreWide => items.iter().any(|item| {
            item.seller_id
                .as_ref()
                .is_some_and(|seller| seller.as_str() == scope_id)
        }),
        OfferScope::Product | OfferScope::Service => {
            items.iter().any(|item| item.id.as_str() == scope_id)
        }
    };
    if matched {
        vec![scope_id.to_string()]
    } else {
        Vec::new()
    }
}

/// How a call to [`OfferEngine::apply`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Confirmed with a positive discount.
    Applied(AppliedOffer),
    /// Refused, with a reason for the user.
    Rejected { reason: String },
    /// A validation for this offer is already in flight.
    AlreadyValidating,
    /// Already applied to the current cart.
    AlreadyApplied,
    /// Outside its window or not matching the cart.
    Ineligible,
}

/// A catalog offer and its state against the current cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferView {
    pub offer: Offer,
    pub state: OfferState,
    /// Reason for a rejection.
    pub reason: Option<String>,
    /// Local estimate shown before applying. Zero when not eligible.
    pub estimated_discount: Decimal,
    /// Server-confirmed discount when applied.
    pub discount_amount: Option<Decimal>,
}

#[derive(Default)]
struct OfferBook {
    catalog: IndexMap<OfferId, Offer>,
    applied: IndexMap<OfferId, AppliedOffer>,
    validating: HashSet<OfferId>,
    rejected: HashMap<OfferId, Rejection>,
}

struct Rejection {
    reason: String,
    cart_revision: u64,
}

impl OfferBook {
    /// Drop applied offers and rejections that no longer describe the cart.
    fn sync(&mut self, revision: u64, now: DateTime<Utc>) {
        self.applied.retain(|id, applied| {
            let keep = applied.cart_revision == revision && applied.offer.is_active_at(now);
            if !keep {
                debug!(offer_id = %id, "Dropping applied offer for changed cart");
            }
            keep
        });
        self.rejected
            .retain(|_, rejection| rejection.cart_revision == revision);
    }
}

/// Removes the in-flight marker however validation ends.
struct ValidatingGuard<'a> {
    book: &'a Mutex<OfferBook>,
    id: OfferId,
}

impl Drop for ValidatingGuard<'_> {
    fn drop(&mut self) {
        lock(self.book).validating.remove(&self.id);
    }
}

/// Resolves offers against the cart. Cheaply cloneable.
#[derive(Clone)]
pub struct OfferEngine {
    inner: Arc<OfferEngineInner>,
}

struct OfferEngineInner {
    remote: Arc<dyn RemoteOfferService>,
    cart: CartStore,
    session: SessionState,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    timeout: Duration,
    book: Mutex<OfferBook>,
}

impl OfferEngine {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteOfferService>,
        cart: CartStore,
        session: SessionState,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OfferEngineInner {
                remote,
                cart,
                session,
                clock,
                notifier,
                timeout,
                book: Mutex::new(OfferBook::default()),
            }),
        }
    }

    /// Load the offer catalog, dropping offers that violate their invariants.
    ///
    /// Returns the number of offers kept.
    ///
    /// # Errors
    ///
    /// Returns a network failure if the catalog cannot be fetched; the
    /// previous catalog is kept.
    #[instrument(skip(self))]
    pub async fn refresh_catalog(&self) -> Result<usize> {
        let offers = bounded(self.inner.timeout, self.inner.remote.list_offers()).await?;

        let mut catalog = IndexMap::with_capacity(offers.len());
        for offer in offers {
            if let Err(e) = offer.validate() {
                warn!(offer_id = %offer.id, error = %e, "Dropping invalid offer");
                continue;
            }
            if catalog.contains_key(&offer.id) {
                warn!(offer_id = %offer.id, "Dropping duplicate offer");
                continue;
            }
            catalog.insert(offer.id.clone(), offer);
        }

        let kept = catalog.len();
        let mut book = self.book();
        book.applied.retain(|id, _| catalog.contains_key(id));
        book.rejected.retain(|id, _| catalog.contains_key(id));
        book.catalog = catalog;
        info!(offers = kept, "Offer catalog loaded");
        Ok(kept)
    }

    /// Validate an offer against the current cart and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an offer not in the catalog, or a
    /// network failure if validation does not complete (the offer stays
    /// eligible).
    #[instrument(skip(self), fields(offer_id = %offer_id))]
    pub async fn apply(&self, offer_id: &OfferId) -> Result<ApplyOutcome> {
        let now = self.inner.clock.now();
        let cart = self.inner.cart.snapshot();
        let epoch = self.inner.session.epoch();

        let offer = {
            let mut book = self.book();
            book.sync(cart.revision, now);
            let offer = book
                .catalog
                .get(offer_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("offer {offer_id}")))?;
            if book.validating.contains(offer_id) {
                return Ok(ApplyOutcome::AlreadyValidating);
            }
            if book.applied.contains_key(offer_id) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            if !is_eligible(&offer, &cart.items, now) {
                return Ok(ApplyOutcome::Ineligible);
            }
            book.validating.insert(offer_id.clone());
            offer
        };
        let validating = ValidatingGuard {
            book: &self.inner.book,
            id: offer_id.clone(),
        };

        let request = ValidationRequest {
            offer_id: offer_id.clone(),
            amount: cart.items.iter().map(CartItem::line_total).sum(),
            scope_ids: matched_scope_ids(&offer, &cart.items),
        };
        let verdict = match bounded(self.inner.timeout, self.inner.remote.validate_offer(&request))
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                drop(validating);
                let err = StoreError::from(e);
                self.inner.notifier.error(err.user_message());
                return Err(err);
            }
        };

        let rejection = if self.inner.cart.revision() != cart.revision
            || self.inner.session.epoch() != epoch
        {
            Some(STALE_CART_REASON.to_string())
        } else if !verdict.valid {
            Some(
                verdict
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string()),
            )
        } else if verdict.discount_amount <= Decimal::ZERO {
            Some(ZERO_DISCOUNT_REASON.to_string())
        } else {
            None
        };

        let outcome = {
            let mut book = self.book();
            book.validating.remove(offer_id);
            match rejection {
                Some(reason) => {
                    book.rejected.insert(
                        offer_id.clone(),
                        Rejection {
                            reason: reason.clone(),
                            cart_revision: cart.revision,
                        },
                    );
                    ApplyOutcome::Rejected { reason }
                }
                None => {
                    let applied = AppliedOffer {
                        offer,
                        discount_amount: verdict.discount_amount,
                        cart_revision: cart.revision,
                        applied_at: now,
                    };
                    book.rejected.remove(offer_id);
                    book.applied.insert(offer_id.clone(), applied.clone());
                    ApplyOutcome::Applied(applied)
                }
            }
        };
        drop(validating);

        match &outcome {
            ApplyOutcome::Rejected { reason } => {
                info!(reason = %reason, "Offer rejected");
                self.inner.notifier.warning(reason.clone());
            }
            ApplyOutcome::Applied(applied) => {
                info!(discount = %applied.discount_amount, "Offer applied");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Un-apply an offer. No remote call. Returns whether it was applied.
    #[instrument(skip(self), fields(offer_id = %offer_id))]
    pub fn remove(&self, offer_id: &OfferId) -> bool {
        let mut book = self.synced_book();
        book.rejected.remove(offer_id);
        book.applied.shift_remove(offer_id).is_some()
    }

    /// Offers applied to the current cart.
    #[must_use]
    pub fn applied(&self) -> Vec<AppliedOffer> {
        self.synced_book().applied.values().cloned().collect()
    }

    /// Catalog offers eligible for the current cart.
    #[must_use]
    pub fn eligible(&self) -> Vec<Offer> {
        let now = self.inner.clock.now();
        let items = self.inner.cart.all();
        self.book()
            .catalog
            .values()
            .filter(|offer| is_eligible(offer, &items, now))
            .cloned()
            .collect()
    }

    /// State of one catalog offer.
    #[must_use]
    pub fn state(&self, offer_id: &OfferId) -> Option<OfferState> {
        self.offers()
            .into_iter()
            .find(|view| &view.offer.id == offer_id)
            .map(|view| view.state)
    }

    /// Every catalog offer with its state against the current cart.
    #[must_use]
    pub fn offers(&self) -> Vec<OfferView> {
        let now = self.inner.clock.now();
        let cart = self.inner.cart.snapshot();
        let subtotal: Decimal = cart.items.iter().map(CartItem::line_total).sum();

        let mut book = self.book();
        book.sync(cart.revision, now);
        book.catalog
            .values()
            .map(|offer| {
                let eligible = is_eligible(offer, &cart.items, now);
                let applied = book.applied.get(&offer.id);
                let rejection = book.rejected.get(&offer.id);
                let state = if book.validating.contains(&offer.id) {
                    OfferState::Validating
                } else if applied.is_some() {
                    OfferState::Applied
                } else if rejection.is_some() {
                    OfferState::Rejected
                } else if eligible {
                    OfferState::Eligible
                } else {
                    OfferState::Ineligible
                };
                OfferView {
                    offer: offer.clone(),
                    state,
                    reason: rejection.map(|r| r.reason.clone()),
                    estimated_discount: if eligible {
                        offer.estimated_discount(subtotal)
                    } else {
                        Decimal::ZERO
                    },
                    discount_amount: applied.map(|a| a.discount_amount),
                }
            })
            .collect()
    }

    /// Forget applied offers and rejections, keeping the catalog.
    pub fn reset(&self) {
        let mut book = self.book();
        book.applied.clear();
        book.rejected.clear();
    }

    fn book(&self) -> MutexGuard<'_, OfferBook> {
        lock(&self.inner.book)
    }

    fn synced_book(&self) -> MutexGuard<'_, OfferBook> {
        let now = self.inner.clock.now();
        let revision = self.inner.cart.revision();
        let mut book = self.book();
        book.sync(revision, now);
        book
    }
}

fn lock(book: &Mutex<OfferBook>) -> MutexGuard<'_, OfferBook> {
    book.lock().unwrap_or_else(PoisonError::into_inner)
}
