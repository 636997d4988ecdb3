use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Client-side crates that log every request and watch frame at debug.
const QUIET_TARGETS: [&str; 4] = ["kube_client", "hyper_util", "tower", "rustls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Unknown formats fall back to JSON, with a warning on stderr since the
    /// subscriber does not exist yet.
    pub fn parse(format: &str) -> Self {
        match format.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" | "compact" | "text" => Self::Pretty,
            _ => {
                eprintln!(
                    "WARN: Invalid log format '{}', defaulting to 'json'. Valid options: json, pretty",
                    format
                );
                Self::Json
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

/// Filter directives for `level`, with the Kubernetes client stack capped at
/// warn unless tracing everything.
fn directives(level: &str) -> String {
    let level = level.trim().to_lowercase();
    if level == "trace" {
        return level;
    }

    QUIET_TARGETS
        .iter()
        .fold(level, |acc, target| format!("{},{}=warn", acc, target))
}

/// `RUST_LOG` wins over `level`; an unparsable `level` falls back to info.
fn env_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    EnvFilter::try_new(directives(level)).unwrap_or_else(|e| {
        eprintln!("WARN: Invalid log level '{}' ({}), defaulting to 'info'", level, e);
        EnvFilter::new(directives("info"))
    })
}

/// Install the global subscriber.
///
/// JSON lines carry the fields of the current span, so the node name set on
/// the root span ends up on every line.
pub fn init(format: &str, level: &str) -> Result<()> {
    let format = LogFormat::parse(format);
    let registry = tracing_subscriber::registry().with(env_filter(level));

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_timer(UtcTime::rfc_3339()),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?,
    }

    tracing::debug!(log_format = format.as_str(), log_level = level, "Logging initialized");
    Ok(())
}
