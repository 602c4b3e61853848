//! Naked Pineapple cart CLI - drive the cart engine from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Show the guest cart (no credential needed)
//! np-cart show
//!
//! # Add two units of a product to the guest cart
//! np-cart add sunhat --price 24.00 --quantity 2 --name "Straw Sunhat"
//!
//! # Sign in and merge the guest cart into the account
//! np-cart --customer cust_123 login
//!
//! # Edit the account cart
//! np-cart --customer cust_123 set sunhat 3
//! np-cart --customer cust_123 remove sunhat
//!
//! # Watch the account cart for server-side removals
//! np-cart --customer cust_123 watch --interval-secs 30
//! ```
//!
//! # Commands
//!
//! - `show` - Print the cart
//! - `add` / `set` / `remove` / `clear` - Edit the cart
//! - `login` - Sign in, merging the guest cart
//! - `logout` - Show the guest cart that remains on the device after sign-out
//! - `watch` - Revalidate periodically and print notices
//!
//! Without `--customer` every command works on the guest cart file only.

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use naked_pineapple_cart::{CartConfig, ConfigError};
use rust_decimal::Decimal;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "np-cart")]
#[command(author, version, about = "Naked Pineapple cart client")]
struct Cli {
    /// Act as this signed-in customer (requires `CART_API_TOKEN`)
    #[arg(long, global = true)]
    customer: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cart
    Show,
    /// Add units of a product
    Add {
        /// Product ID
        product: String,

        /// Unit price in the store currency
        #[arg(short, long)]
        price: Decimal,

        /// Variant index
        #[arg(short, long, default_value_t = 0)]
        variant: u32,

        /// Units to add
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,

        /// Display name (defaults to the product ID)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Set the quantity of a line (0 removes it)
    Set {
        /// Product ID
        product: String,

        /// New quantity
        quantity: u32,

        /// Variant index
        #[arg(short, long, default_value_t = 0)]
        variant: u32,
    },
    /// Remove a line
    Remove {
        /// Product ID
        product: String,

        /// Variant index
        #[arg(short, long, default_value_t = 0)]
        variant: u32,
    },
    /// Empty the cart
    Clear {
        /// Return reserved stock to inventory
        #[arg(long)]
        restock: bool,
    },
    /// Sign in, merging the guest cart into the account
    Login,
    /// Sign out and show the guest cart
    Logout,
    /// Revalidate periodically and print notices until interrupted
    Watch {
        /// Seconds between revalidations
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &CartConfig) -> Option<sentry::ClientInitGuard> {
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

/// Tracing is not set up before configuration loads, so report directly.
#[allow(clippy::print_stderr)]
fn report_config_error(err: &ConfigError) {
    eprintln!("Configuration error: {err}");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match CartConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&e);
            std::process::exit(2);
        }
    };

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "naked_pineapple_cart=info,naked_pineapple_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli, &config).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: &CartConfig) -> Result<(), Box<dyn std::error::Error>> {
    let customer = cli.customer.as_deref();
    match cli.command {
        Commands::Show => commands::cart::show(config, customer).await?,
        Commands::Add {
            product,
            price,
            variant,
            quantity,
            name,
        } => {
            let item = commands::cart::NewItem {
                product,
                variant,
                quantity,
                price,
                name,
            };
            commands::cart::add(config, customer, item).await?;
        }
        Commands::Set {
            product,
            quantity,
            variant,
        } => commands::cart::set(config, customer, &product, variant, quantity).await?,
        Commands::Remove { product, variant } => {
            commands::cart::remove(config, customer, &product, variant).await?;
        }
        Commands::Clear { restock } => commands::cart::clear(config, customer, restock).await?,
        Commands::Login => {
            let customer = customer.ok_or("login requires --customer")?;
            commands::session::login(config, customer).await?;
        }
        Commands::Logout => {
            commands::session::logout(config).await?;
        }
        Commands::Watch { interval_secs } => {
            let customer = customer.ok_or("watch requires --customer")?;
            commands::watch::run(config, customer, interval_secs).await?;
        }
    }
    Ok(())
}
