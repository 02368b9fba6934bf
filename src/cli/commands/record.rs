//! Per-key record commands.

use std::time::Duration;

use chrono::Utc;
use console::style;

use brute_store::{ClientRecord, ClientStore, ClientValue, DieselClientStore};

/// Seconds from the command line; zero means no expiry.
fn lifetime_from_secs(secs: Option<u64>) -> Option<Duration> {
    secs.map(Duration::from_secs)
}

fn print_record(record: &ClientRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

pub async fn cmd_get(store: &DieselClientStore, key: &str) -> anyhow::Result<()> {
    match store.get(key).await? {
        Some(record) => print_record(&record),
        None => {
            println!("{} No record for {}", style("!").yellow(), key);
            Ok(())
        }
    }
}

pub async fn cmd_set(
    store: &DieselClientStore,
    key: &str,
    count: u64,
    lifetime: Option<u64>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let value = ClientValue {
        count,
        first_request: now,
        last_request: now,
    };
    store.set(key, &value, lifetime_from_secs(lifetime)).await?;

    match store.get(key).await? {
        Some(record) => print_record(&record),
        // Lifetime already elapsed
        None => {
            println!("{} Record for {} expired immediately", style("!").yellow(), key);
            Ok(())
        }
    }
}

pub async fn cmd_hit(
    store: &DieselClientStore,
    key: &str,
    lifetime: Option<u64>,
) -> anyhow::Result<()> {
    let previous = store.increment(key, lifetime_from_secs(lifetime)).await?;
    let count = previous.map_or(1, |p| p.count.saturating_add(1));
    println!("{} {} has {} request(s)", style("→").cyan(), key, count);
    Ok(())
}

pub async fn cmd_reset(store: &DieselClientStore, key: &str) -> anyhow::Result<()> {
    match store.reset(key).await? {
        Some(record) => {
            println!("{} Reset {}", style("✓").green(), key);
            print_record(&record)
        }
        None => {
            println!("{} No record for {}", style("!").yellow(), key);
            Ok(())
        }
    }
}
