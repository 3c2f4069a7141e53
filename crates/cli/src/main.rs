//! Cartwright CLI - drive the cart engine from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Guest cart, persisted under CARTWRIGHT_DATA_DIR
//! cw cart add 42 --name "Tea" --price 10 --quantity 2
//! cw cart show
//!
//! # Sign in: the guest cart is merged into the account
//! cw login --token "$TOKEN"
//!
//! # Offers and the priced summary
//! cw offers list
//! cw summary --offer SPRING5
//! ```
//!
//! # Commands
//!
//! - `login` / `logout` - Switch between guest and authenticated mode
//! - `cart` - Show and edit the cart
//! - `wishlist` - Show and edit the wishlist
//! - `offers` - List offers or apply one
//! - `summary` - Price the cart, optionally with offers applied

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::process::ExitCode;

use cartwright_storefront::config::StorefrontConfig;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "cw")]
#[command(author, version, about = "Cartwright cart and pricing CLI")]
struct Cli {
    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a session token and merge the guest cart
    Login {
        /// Session token issued by the auth provider
        #[arg(long)]
        token: String,

        /// Account id, attached to error reports
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Sign out; the cart shown afterwards is the (empty) guest cart
    Logout,
    /// Show and edit the cart
    Cart {
        #[command(subcommand)]
        action: CartAction,
    },
    /// Show and edit the wishlist
    Wishlist {
        #[command(subcommand)]
        action: WishlistAction,
    },
    /// List or apply offers
    Offers {
        #[command(subcommand)]
        action: OfferAction,
    },
    /// Price the cart
    Summary {
        /// Offer to validate and apply first (repeatable)
        #[arg(long = "offer")]
        offers: Vec<String>,
    },
}

/// Product details for commands that create a line.
#[derive(clap::Args)]
struct ProductArgs {
    /// Product id
    id: String,

    /// Display name
    #[arg(long)]
    name: String,

    /// Unit price
    #[arg(long)]
    price: Decimal,

    /// Image URI
    #[arg(long, default_value = "")]
    image: String,

    /// Seller the product belongs to
    #[arg(long)]
    seller: Option<String>,
}

#[derive(Subcommand)]
enum CartAction {
    /// Show the cart
    Show,
    /// Add units of a product
    Add {
        #[command(flatten)]
        product: ProductArgs,

        /// Units to add
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
    },
    /// Remove a line
    Remove {
        /// Product id
        id: String,
    },
    /// Set a line's quantity (zero or less removes it)
    Set {
        /// Product id
        id: String,

        /// New quantity
        #[arg(allow_hyphen_values = true)]
        quantity: i64,
    },
    /// Remove every line
    Clear,
}

#[derive(Subcommand)]
enum WishlistAction {
    /// Show the wishlist
    Show,
    /// Save a product
    Add {
        #[command(flatten)]
        product: ProductArgs,
    },
    /// Unsave a product
    Remove {
        /// Product id
        id: String,
    },
    /// Move a saved product into the cart
    Move {
        /// Product id
        id: String,

        /// Units to add to the cart
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
    },
}

#[derive(Subcommand)]
enum OfferAction {
    /// List offers with their state against the cart
    List,
    /// Validate and apply an offer, then print the summary
    Apply {
        /// Offer id
        id: String,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &StorefrontConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cartwright_storefront=info,cartwright_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match StorefrontConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing();
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Sentry before the subscriber so the tracing layer has a client
    let _sentry_guard = init_sentry(&config);
    init_tracing();

    if let Err(e) = run(cli, config).await {
        tracing::error!("Command failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli, config: StorefrontConfig) -> Result<(), commands::CliError> {
    let session = commands::Session::open(config, cli.json).await?;

    let result = match cli.command {
        Commands::Login { token, user_id } => {
            commands::auth::login(&session, token, user_id.as_deref()).await
        }
        Commands::Logout => commands::auth::logout(&session).await,
        Commands::Cart { action } => match action {
            CartAction::Show => {
                commands::cart::show(&session);
                Ok(())
            }
            CartAction::Add { product, quantity } => {
                commands::cart::add(&session, product.into(), quantity).await
            }
            CartAction::Remove { id } => commands::cart::remove(&session, &id).await,
            CartAction::Set { id, quantity } => {
                commands::cart::set_quantity(&session, &id, quantity).await
            }
            CartAction::Clear => commands::cart::clear(&session).await,
        },
        Commands::Wishlist { action } => match action {
            WishlistAction::Show => {
                commands::wishlist::show(&session);
                Ok(())
            }
            WishlistAction::Add { product } => {
                commands::wishlist::add(&session, product.into()).await
            }
            WishlistAction::Remove { id } => commands::wishlist::remove(&session, &id).await,
            WishlistAction::Move { id, quantity } => {
                commands::wishlist::move_to_cart(&session, &id, quantity).await
            }
        },
        Commands::Offers { action } => match action {
            OfferAction::List => {
                commands::offers::list(&session);
                Ok(())
            }
            OfferAction::Apply { id } => commands::offers::summary(&session, &[id]).await,
        },
        Commands::Summary { offers } => commands::offers::summary(&session, &offers).await,
    };

    session.finish();
    result
}

impl From<ProductArgs> for commands::Product {
    fn from(args: ProductArgs) -> Self {
        Self {
            id: args.id,
            name: args.name,
            price: args.price,
            image: args.image,
            seller: args.seller,
        }
    }
}
