//! Command implementations.
//!
//! Every command runs against one [`Session`]: the engine opened over the
//! local data directory and the HTTP backend from the environment.

use std::sync::Arc;

use cartwright_core::{CartItem, IdError, ItemError, ProductId, SellerId, WishlistItem};
use cartwright_storefront::Storefront;
use cartwright_storefront::config::StorefrontConfig;
use cartwright_storefront::error::StoreError;
use cartwright_storefront::notify::{Notification, NotificationLevel};
use cartwright_storefront::offers::SystemClock;
use cartwright_storefront::remote::{HttpBackend, RemoteError};
use cartwright_storefront::state::Services;
use cartwright_storefront::storage::{FileStorage, StorageError};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

pub mod auth;
pub mod cart;
pub mod offers;
mod output;
pub mod wishlist;

/// Errors that end a command.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid id: {0}")]
    Id(#[from] IdError),

    #[error("invalid item: {0}")]
    Item(#[from] ItemError),

    #[error("cannot open data directory: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot build HTTP client: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot encode output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Product details given on the command line.
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub image: String,
    pub seller: Option<String>,
}

impl Product {
    fn cart_item(self) -> Result<CartItem, CliError> {
        let item = CartItem::new(ProductId::parse(&self.id)?, self.name, self.price, self.image)?;
        Ok(match self.seller {
            Some(seller) => item.with_seller(SellerId::parse(&seller)?),
            None => item,
        })
    }

    fn wishlist_item(self) -> Result<WishlistItem, CliError> {
        Ok(WishlistItem::from(&self.cart_item()?))
    }
}

/// The opened engine plus output settings.
pub struct Session {
    storefront: Storefront,
    notifications: broadcast::Receiver<Notification>,
    json: bool,
}

impl Session {
    /// Open the engine and load the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or HTTP client cannot be set up.
    pub async fn open(config: StorefrontConfig, json: bool) -> Result<Self, CliError> {
        let storage = FileStorage::open(&config.data_dir).await?;
        let backend = HttpBackend::new(&config.remote)?;
        tracing::debug!(data_dir = %config.data_dir.display(), "Opening storefront");

        let storefront = Storefront::open(
            config.engine,
            Arc::new(storage),
            Services::http(&backend),
            Arc::new(SystemClock),
        )
        .await?;
        let notifications = storefront.notifications();
        storefront.start().await;

        Ok(Self {
            storefront,
            notifications,
            json,
        })
    }

    /// Log pending notifications and stop the engine.
    pub fn finish(mut self) {
        while let Ok(notification) = self.notifications.try_recv() {
            match notification.level {
                NotificationLevel::Info => tracing::info!("{}", notification.message),
                NotificationLevel::Warning => tracing::warn!("{}", notification.message),
                NotificationLevel::Error => tracing::error!("{}", notification.message),
            }
        }
        self.storefront.shutdown();
    }

    const fn storefront(&self) -> &Storefront {
        &self.storefront
    }
}

fn product_id(raw: &str) -> Result<ProductId, CliError> {
    Ok(ProductId::parse(raw)?)
}
