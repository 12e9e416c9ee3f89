use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::fs::File;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use estate_history::temporal::parse_timestamp;
use estate_history::{
    export_history_csv, verify_timeline, with_kind_store, AppConfig, Clock, CurrencyPrice,
    Persistence, Stores, TemporalStore, Versioned, VersioningError,
};

const USAGE: &str = "\
Usage: estate-history <command>

Commands:
  init                                   Create tables for every versioned kind
  price set <currency> <price> [--at T]  Set a currency price (creates it if new)
  show <kind> <id> [--as-of T]           Current attributes, or as of time T
  history <kind> <id>                    Closed history rows, oldest first
  verify <kind> <id>                     Check the timeline for gaps and overlaps
  export <kind> <id> <file.csv>          Write all history rows as CSV
  snapshot <kind> <T>                    Every entity of a kind as of time T

Kinds: realtor, user, currency_price. Times are RFC 3339.";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,estate_history=info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = AppConfig::from_env();
    let stores = Stores::open(&config)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["init"] => {
            println!("✓ Database ready: {}", config.db_path.display());
            Ok(())
        }
        ["price", "set", currency, price, rest @ ..] => {
            let at = flag_time(rest, "--at")?;
            set_price(&stores.currency_prices, currency, price, at)
        }
        ["show", kind, id, rest @ ..] => {
            let as_of = flag_time(rest, "--as-of")?;
            with_kind_store!(stores, *kind, |store| show(store, id, as_of), unknown_kind(kind))
        }
        ["history", kind, id] => {
            with_kind_store!(stores, *kind, |store| history(store, id), unknown_kind(kind))
        }
        ["verify", kind, id] => {
            with_kind_store!(stores, *kind, |store| verify(store, id), unknown_kind(kind))
        }
        ["export", kind, id, path] => {
            with_kind_store!(stores, *kind, |store| export(store, id, path), unknown_kind(kind))
        }
        ["snapshot", kind, time] => {
            let at = parse_time(time)?;
            with_kind_store!(stores, *kind, |store| snapshot(store, at), unknown_kind(kind))
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn unknown_kind(kind: &str) -> Result<()> {
    Err(anyhow!(
        "unknown kind '{}' (expected realtor, user or currency_price)",
        kind
    ))
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(text).with_context(|| format!("Invalid RFC 3339 timestamp: {}", text))
}

/// Value of `--flag T` in the trailing arguments, if present.
fn flag_time(rest: &[&str], flag: &str) -> Result<Option<DateTime<Utc>>> {
    match rest {
        [] => Ok(None),
        [name, value] if *name == flag => parse_time(value).map(Some),
        _ => bail!("unexpected arguments: {}", rest.join(" ")),
    }
}

/// `update` the price, or `create` it if the currency is new. Without
/// `--at`, the plain variants stamp after reading the current record.
fn set_price<B, C>(
    store: &TemporalStore<CurrencyPrice, B, C>,
    currency: &str,
    price: &str,
    at: Option<DateTime<Utc>>,
) -> Result<()>
where
    B: Persistence<CurrencyPrice>,
    C: Clock,
{
    let attrs = CurrencyPrice::parse(price).with_context(|| format!("Invalid price: {}", price))?;

    let updated = match at {
        Some(at) => store.update_at(currency, attrs.clone(), at),
        None => store.update(currency, attrs.clone()),
    };
    match updated {
        Ok(closed) => {
            let since = closed
                .valid_until
                .map(|t| t.to_string())
                .unwrap_or_default();
            println!(
                "✓ {} price set to {} (previous value kept for {} → {})",
                currency, attrs.price, closed.valid_since, since
            );
        }
        Err(VersioningError::NotFound { .. }) => {
            match at {
                Some(at) => store.create_at(currency, attrs.clone(), at)?,
                None => store.create(currency, attrs.clone())?,
            };
            println!("✓ {} created with price {}", currency, attrs.price);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn show<A, B, C>(store: &TemporalStore<A, B, C>, id: &str, as_of: Option<DateTime<Utc>>) -> Result<()>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    match as_of {
        Some(time) => {
            let attrs = store.read_as_of(id, time)?;
            println!("{} {} as of {}:", store.kind(), id, time);
            println!("{}", serde_json::to_string_pretty(&attrs)?);
        }
        None => {
            let record = store.read_record(id)?;
            println!(
                "{} {} (since {}, generation {}):",
                store.kind(),
                id,
                record.effective_since,
                record.generation
            );
            println!("{}", serde_json::to_string_pretty(&record.attrs)?);
        }
    }
    Ok(())
}

fn history<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Result<()>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let mut count = 0;
    for row in store.read_history(id)? {
        let row = row?;
        let until = row
            .valid_until
            .map(|t| t.to_string())
            .unwrap_or_else(|| "open".to_string());
        println!(
            "[{} → {}] {}",
            row.valid_since,
            until,
            serde_json::to_string(&row.attrs)?
        );
        count += 1;
    }
    println!("✓ {} history row(s)", count);
    Ok(())
}

fn verify<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Result<()>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let report = verify_timeline(store, id)?;
    for issue in &report.issues {
        println!("  {:?} [gen {}] {}: {}", issue.severity, issue.generation, issue.at, issue.issue);
    }
    println!("{}", report.summary());

    if !report.is_consistent() {
        bail!("timeline of {} '{}' is inconsistent", store.kind(), id);
    }
    println!("✅ Timeline consistent");
    Ok(())
}

fn export<A, B, C>(store: &TemporalStore<A, B, C>, id: &str, path: &str) -> Result<()>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let written = export_history_csv(store, id, file)?;
    println!("✓ Exported {} history row(s) to {}", written, path);
    Ok(())
}

fn snapshot<A, B, C>(store: &TemporalStore<A, B, C>, at: DateTime<Utc>) -> Result<()>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let snapshot = store.snapshot_as_of(at)?;
    for (id, attrs) in &snapshot.values {
        println!("{}\t{}", id, serde_json::to_string(attrs)?);
    }
    println!("✓ {} {}(s) as of {}", snapshot.count(), store.kind(), at);
    Ok(())
}
