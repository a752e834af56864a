use tracing_subscriber::{fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins; otherwise `TENDER_LOG_LEVEL`, then `info`.
/// `TENDER_LOG_FORMAT=json` switches to structured output.
pub fn init_tracing() {
    let fallback = std::env::var("TENDER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("TENDER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    if let Err(err) = tracing_subscriber::registry().with(filter).with(layer).try_init() {
        eprintln!("warning: tracing subscriber already installed: {err}");
    }
}
