//! Sandbox
//!
//! Builds a small graph (a counter, two derived cells and an effect printing
//! them) and increments the counter once a second until Ctrl-C.
//!
//! Set `RUST_LOG=signals_core=trace` to watch reads, commits and flushes.

use std::fmt::Display;
use std::time::Duration;

use signals_core::reactive::{Readable, SignalContext};
use signals_core::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Read any cell and format its value.
async fn render<T: Display>(cell: &impl Readable<T>) -> Result<String> {
    Ok(cell.read().await?.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ctx = SignalContext::new();
    let counter = ctx.state(0u64);

    let is_even = {
        let counter = counter.clone();
        ctx.computed_fn(move || counter.get() % 2 == 0)
    };
    let parity = {
        let is_even = is_even.clone();
        ctx.computed(move |_| {
            let is_even = is_even.clone();
            async move {
                let label = if is_even.get().await? { "even" } else { "odd" };
                Ok::<_, signals_core::SignalError>(label.to_string())
            }
        })
    };

    let effect = {
        let (counter, parity) = (counter.clone(), parity.clone());
        ctx.effect(move |_| {
            let (counter, parity) = (counter.clone(), parity.clone());
            async move {
                let counter = render(&counter).await?;
                let parity = render(&parity).await?;
                info!(%counter, %parity, "counter changed");
                Ok(())
            }
        })
        .await?
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = counter.update(|n| n + 1).await {
                    warn!(error = %err, "update failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(runs = effect.run_count(), "shutting down");
                break;
            }
        }
    }

    effect.dispose();
    Ok(())
}
