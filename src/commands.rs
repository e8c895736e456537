//! Operator commands: generate, status, reset, search.
//!
//! These run once and print to stdout; the proxy transports never share a
//! process with them.

use crate::cache::SchemaCache;
use crate::config::Config;
use crate::index::Bm25Index;
use crate::supervisor::ChildManager;
use std::sync::Arc;

/// Spawn each configured server once, persist its tool schemas, stop it.
/// Returns `false` when any server failed.
pub async fn generate(config: &Config) -> anyhow::Result<bool> {
    let order = config.file.servers.names();
    if order.is_empty() {
        println!("No servers configured in {}", config.path.display());
        return Ok(true);
    }

    let cache = SchemaCache::new(config.cache_file(), order.clone());
    cache.load().await;

    let manager = ChildManager::new(&config.file.servers, config.settings());
    let mut failures = 0usize;

    for name in &order {
        match manager.discover_tools(name).await {
            Ok(tools) => {
                println!("{name}: {} tool(s)", tools.len());
                cache.update_server(name, tools);
            }
            Err(e) => {
                failures += 1;
                eprintln!("{name}: {e}");
                tracing::warn!(server = %name, error = %e, "schema generation failed");
            }
        }
        manager.stop_server(name).await;
    }

    cache.retain_servers(&order);
    cache.save().await?;
    println!(
        "Cached {} tool(s) from {}/{} server(s) at {}",
        cache.tool_count(),
        order.len() - failures,
        order.len(),
        cache.path().display()
    );
    Ok(failures == 0)
}

/// Print configured servers and a cache summary.
pub async fn status(config: &Config) -> anyhow::Result<()> {
    println!("Config: {}", config.path.display());
    println!("Mode: {:?}", config.settings().mode);

    if config.file.servers.is_empty() {
        println!("No servers configured.");
    } else {
        println!("Servers:");
        for (name, entry) in config.file.servers.iter() {
            let mut traits = Vec::new();
            if entry.persistent {
                traits.push("persistent".to_string());
            }
            if entry.preload {
                traits.push("preload".to_string());
            }
            if let Some(idle) = entry.idle_timeout {
                traits.push(format!("idle {idle}s"));
            }
            let suffix = if traits.is_empty() {
                String::new()
            } else {
                format!(" [{}]", traits.join(", "))
            };
            println!("  {name}: {}{suffix}", entry.command);
        }
    }

    let cache = SchemaCache::new(config.cache_file(), config.file.servers.names());
    if cache.load().await {
        println!("Cache ({}):", cache.path().display());
        for (name, tools, cached_at) in cache.summary() {
            println!("  {name}: {tools} tool(s), cached {cached_at}");
        }
    } else {
        println!("Cache: absent (run `generate` to build it)");
    }
    Ok(())
}

/// Delete the cache file.
pub async fn reset(config: &Config) -> anyhow::Result<()> {
    let path = config.cache_file();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => println!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("Nothing to remove at {}", path.display());
        }
        Err(e) => return Err(e).map_err(anyhow::Error::from),
    }
    Ok(())
}

/// Offline BM25 query against the cached schemas, for diagnostics.
pub async fn search(config: &Config, query: &str) -> anyhow::Result<()> {
    let cache = Arc::new(SchemaCache::new(
        config.cache_file(),
        config.file.servers.names(),
    ));
    if !cache.load().await {
        println!("Cache is empty; run `generate` first.");
        return Ok(());
    }

    let tools = cache.all_tools(false);
    let index = Bm25Index::build(tools.iter().map(|t| (t.server.as_str(), &t.schema)));
    let hits = index.query(query, 10);

    if hits.is_empty() {
        println!("No matches for '{query}' across {} tool(s).", index.len());
        return Ok(());
    }
    println!("Top matches for '{query}':");
    for hit in hits {
        let description = cache
            .tool_schema(&hit.server, &hit.tool)
            .and_then(|s| s.description)
            .unwrap_or_default();
        println!("  {:>7.3}  {} ({})  {description}", hit.score, hit.tool, hit.server);
    }
    Ok(())
}
