//! Tracing setup for hosts and controller executables.
//!
//! Logs always go to stderr: a controller's stdout carries the readiness
//! marker the host waits for.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Level variable consulted when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "MULTICOSIM_LOG";

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Filter directives for a `MULTICOSIM_LOG` level.
fn filter_directives(level: &str) -> String {
    format!("multicosim={level},multicosim::process={level},multicosim::bridge={level}")
}

/// Install the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` wins when set; otherwise `MULTICOSIM_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var(LOG_ENV).ok().as_deref());
        EnvFilter::new(filter_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!(level_from(None), "info");
        assert_eq!(level_from(Some("debug")), "debug");
        assert_eq!(level_from(Some("warning")), "warn");
        assert_eq!(level_from(Some("loud")), "info");
    }

    #[test]
    fn directives_parse_as_filter() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("multicosim=debug"));
        assert!(directives.contains("multicosim::bridge=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
