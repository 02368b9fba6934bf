//! Expiry maintenance commands.

use std::sync::Arc;
use std::time::Duration;

use console::style;

use brute_store::{spawn_sweeper, ClientStore, DieselClientStore};

/// Delete expired records once.
pub async fn cmd_purge(store: &DieselClientStore) -> anyhow::Result<()> {
    let removed = store.purge_expired().await?;
    println!(
        "{} Removed {} expired record(s) from {}",
        style("✓").green(),
        removed,
        store.table().qualified_name()
    );
    Ok(())
}

/// Run the sweeper until Ctrl-C.
pub async fn cmd_sweep(store: DieselClientStore, interval: u64) -> anyhow::Result<()> {
    // Fail fast on a bad connection instead of logging from the loop
    store.pool().await?;

    println!(
        "{} Sweeping {} every {}s (Ctrl-C to stop)",
        style("→").cyan(),
        store.table().qualified_name(),
        interval
    );

    let handle = spawn_sweeper(Arc::new(store), Duration::from_secs(interval));
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;

    println!("{} Sweeper stopped", style("✓").green());
    Ok(())
}
