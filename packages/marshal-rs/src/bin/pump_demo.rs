//! Simulated installer session.
//!
//! A worker thread "copies files", reporting progress through the event bus
//! and asking the home thread for values with `send`. The home thread pumps
//! the context and the dispatcher until the worker shuts the context down.
//!
//! ```text
//! RUST_LOG=marshal=trace cargo run --bin pump-demo
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marshal::{
    AsyncContext, Dispatcher, EventBusExt, InProcessBus, MarshalConfig, MessageDispatcher,
    Property, PropertyChangedNotifier, ScheduleOptions,
};

#[derive(Debug)]
struct CopyProgress {
    percent: u8,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marshal=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let config = MarshalConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let context = Arc::new(AsyncContext::from_config(&config).context("Failed to build context")?);
    let dispatcher = Arc::new(MessageDispatcher::new());
    let bus = Arc::new(InProcessBus::new());

    let notifier = Arc::new(PropertyChangedNotifier::with_dispatcher(dispatcher.clone()));
    let status = Arc::new(Property::new("status", String::from("Idle"), notifier.clone()));
    {
        let status = status.clone();
        notifier.add_handler(move |name| {
            tracing::info!(property = name, value = %status.get(), "property changed");
        });
    }

    {
        let status = status.clone();
        bus.subscribe(move |event: &CopyProgress| {
            status.set(format!("Copying files ({}%)", event.percent));
        });
    }

    let heartbeats = Arc::new(AtomicUsize::new(0));
    {
        let heartbeats = heartbeats.clone();
        context.scheduler().schedule(
            Arc::new(move || {
                let beat = heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(beat, "heartbeat");
            }),
            ScheduleOptions::periodic(Duration::from_millis(50)).with_max_executions(3),
        )?;
    }

    let worker = {
        let context = context.clone();
        let bus = bus.clone();
        let send_timeout = config.send_timeout;
        thread::Builder::new()
            .name("copy-worker".to_string())
            .spawn(move || -> Result<u32> {
                let mut acknowledged = 0;
                for step in 1..=5u8 {
                    thread::sleep(Duration::from_millis(30));
                    bus.publish(&CopyProgress { percent: step * 20 });
                    context.post(move || tracing::debug!(step, "step recorded on home thread"));
                    acknowledged += context.send_timeout(move || u32::from(step), send_timeout)?;
                }
                context.shutdown();
                Ok(acknowledged)
            })
            .context("Failed to spawn worker")?
    };

    let mut operations = 0;
    let mut events = 0;
    while !context.is_shutdown() {
        operations += context.process_pending_operations()?;
        events += dispatcher.process_events()?;
        thread::sleep(config.pump_interval);
    }
    events += dispatcher.process_events()?;

    let acknowledged = worker
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;

    tracing::info!(
        operations,
        events,
        acknowledged,
        heartbeats = heartbeats.load(Ordering::SeqCst),
        status = %status.get(),
        "session complete"
    );

    dispatcher.shutdown();
    Ok(())
}
