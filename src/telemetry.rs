use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "configserver=info,tower_http=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Development environments get human readable output, everything else
/// gets one JSON object per line.
pub fn init(human_readable: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if human_readable {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    }
}
