mod core;
mod cycle;
mod fetch;
mod http;
mod socket;
mod store;
mod timer;

use std::sync::Arc;

use scrobble_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A formatted WARN/ERROR log line forwarded to socket clients.
#[derive(Debug, Clone)]
pub struct LogLine(pub String);

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<LogLine>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<LogLine>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to clients to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is OK
        let _ = self.sender.send(LogLine(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (log_tx, _) = broadcast::channel::<LogLine>(100);

    let data_dir = scrobble_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,scrobble_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: timer ticks and client commands funnel into PollerCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::PollerEvent>(256);

    let poller = core::PollerCore::new(
        config.poll.period(),
        Arc::new(store::JsonFileStore::new(config.daemon.settings_file.clone())),
        Arc::new(timer::TokioTimer::new()),
        Arc::new(fetch::LastFmFetcher::new(&config.api)?),
        event_tx.clone(),
    );
    let cache = poller.cache();

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        cache.clone(),
        event_tx.clone(),
        log_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            cache.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = shutdown_tx.send(core::PollerEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    poller.run(event_rx).await;

    Ok(())
}
