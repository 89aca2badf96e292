//! Tracing/logging initialization.
//!
//! | variable | default |
//! |----------|---------|
//! | `LOG_FORMAT` | `json` (`pretty` for local runs) |
//! | `RUST_LOG` | - |
//! | `LOG_LEVEL` | `info`, used when `RUST_LOG` is unset |
//! | `ENABLE_FILE_LOGGING` | `false` |
//! | `LOG_FILE_PATH` | `logs/jobforge.log` |

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ::tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_LEVEL: &str = "info";
const DEFAULT_FILE_PATH: &str = "logs/jobforge.log";

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

impl LogFormat {
    /// `pretty` selects [`LogFormat::Pretty`]; anything else is JSON.
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
    /// Events are also appended here when set.
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_LEVEL.to_string(),
            file_path: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let file_logging = get("ENABLE_FILE_LOGGING").is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        });

        Self {
            format: LogFormat::parse(get("LOG_FORMAT").as_deref()),
            filter: get("RUST_LOG")
                .or_else(|| get("LOG_LEVEL"))
                .unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            file_path: file_logging.then(|| {
                get("LOG_FILE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_PATH))
            }),
        }
    }
}

/// Install the global subscriber. Returns `Ok(false)` if one was already set.
///
/// Fails only when the log file cannot be opened.
pub fn init_with(config: &LogConfig) -> io::Result<bool> {
    Ok(subscriber(config)?.try_init().is_ok())
}

/// Stdout layer plus the optional file layer, behind one filter.
fn subscriber(config: &LogConfig) -> io::Result<impl Subscriber + Send + Sync + 'static> {
    // An unparsable filter falls back to the default level.
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    let file_layer = match &config.file_path {
        Some(path) => Some(format_layer(config.format, Mutex::new(open_append(path)?), false)),
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(config.format, io::stdout, true))
        .with(file_layer))
}

fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("jobforge-{name}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("yaml")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" Pretty ")), LogFormat::Pretty);
    }

    #[test]
    fn log_level_applies_when_rust_log_is_unset() {
        assert_eq!(config(&[]), LogConfig::default());
        assert_eq!(config(&[("LOG_LEVEL", "DEBUG")]).filter, "DEBUG");
        assert_eq!(
            config(&[("LOG_LEVEL", "debug"), ("RUST_LOG", "jobforge_infra=trace")]).filter,
            "jobforge_infra=trace"
        );
    }

    #[test]
    fn file_output_is_opt_in() {
        assert_eq!(config(&[("LOG_FILE_PATH", "/tmp/x.log")]).file_path, None);
        assert_eq!(
            config(&[("ENABLE_FILE_LOGGING", "true")]).file_path,
            Some(PathBuf::from(DEFAULT_FILE_PATH))
        );
        assert_eq!(
            config(&[("ENABLE_FILE_LOGGING", "1"), ("LOG_FILE_PATH", "/var/log/jf.log")]).file_path,
            Some(PathBuf::from("/var/log/jf.log"))
        );
    }

    #[test]
    fn events_are_appended_to_the_log_file() {
        let dir = scratch_dir("file-log");
        let path = dir.join("nested").join("app.log");
        let config = LogConfig {
            file_path: Some(path.clone()),
            ..Default::default()
        };

        let subscriber = subscriber(&config).unwrap();
        ::tracing::subscriber::with_default(subscriber, || {
            ::tracing::info!(job_id = "j-1", "written to file");
            ::tracing::debug!("below the filter");
        });

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("written to file"));
        assert!(contents.contains("j-1"));
        assert!(!contents.contains("below the filter"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn second_init_is_a_no_op() {
        init_with(&LogConfig::default()).unwrap();
        assert!(!init_with(&LogConfig::default()).unwrap());
    }
}
