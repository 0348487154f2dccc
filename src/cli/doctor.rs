use std::path::Path;

use spreadarb_core::config::types::AppConfig;

pub fn run_doctor(config_dir: &Path) -> anyhow::Result<()> {
    println!("--- Spreadarb Config Doctor ---");
    println!("Config directory: {}", config_dir.display());

    match AppConfig::load_from(config_dir) {
        Ok(config) => {
            println!("[OK] Configuration loaded successfully.");
            println!("Execution Mode: {:?}", config.execution_mode);
            println!("Engine:");
            println!("  Order Timeout: {} ms", config.engine.order_timeout_ms);
            println!("  Poll Interval: {} ms", config.engine.order_poll_interval_ms);
            println!("  Close Attempts: {}", config.engine.max_close_attempts);
            println!("  Max Pairs: {}", config.engine.max_pairs);
            println!(
                "Persistence Retry: {} attempts, {}..{} ms",
                config.persistence.max_attempts,
                config.persistence.base_delay_ms,
                config.persistence.max_delay_ms
            );
            match config.settings.max_concurrent_trades {
                Some(n) => println!("Max Concurrent Trades: {n}"),
                None => println!("Max Concurrent Trades: unbounded"),
            }

            println!("Exchanges Configured: {}", config.exchanges.len());
            for ex in &config.exchanges {
                println!("  - {} (quote balance {})", ex.name, ex.quote_balance);
                if ex.symbols.is_empty() {
                    println!("    Symbols: [NONE]");
                } else {
                    println!("    Symbols: {}", ex.symbols.join(", "));
                }
            }
            if config.exchanges.len() < 2 {
                println!("[WARN] At least two exchanges are needed to trade a spread.");
            }

            println!("Seed Pairs: {}", config.pairs.len());
            for seed in &config.pairs {
                println!(
                    "  - {} entry {}% exit {}% volume {} in {} part(s), stop-loss {}{}",
                    seed.symbol,
                    seed.params.entry_spread_pct,
                    seed.params.exit_spread_pct,
                    seed.params.volume,
                    seed.params.n_orders,
                    seed.params.stop_loss,
                    if seed.start { " [auto-start]" } else { "" }
                );
            }

            println!("\n[OK] All checks passed.");
        }
        Err(e) => {
            println!("[FAIL] Configuration validation failed.");
            println!("Error: {e}");
            println!("\nEdit {}/default.toml or add a local.toml override.", config_dir.display());
        }
    }

    Ok(())
}
