//! Initialize command.

use console::style;

use brute_store::DieselClientStore;

/// Create the schema, client table and expiry index if missing.
pub async fn cmd_init(store: &DieselClientStore) -> anyhow::Result<()> {
    store.init_schema().await?;

    println!(
        "{} Initialized client table {}",
        style("✓").green(),
        store.table().qualified_name()
    );

    Ok(())
}
