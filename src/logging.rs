use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Output format of the diagnostic log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str, format: LogFormat, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "sitemux=debug".to_string()
    } else {
        format!("sitemux={level}")
    };
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&default_filter))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}

pub struct AccessLogger {
    file: Option<Arc<Mutex<std::fs::File>>>,
    format: AccessLogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLogFormat {
    Json,
    CommonLog,
    Combined,
}

impl AccessLogFormat {
    pub fn parse(name: &str) -> Self {
        match name {
            "json" => AccessLogFormat::Json,
            "common" => AccessLogFormat::CommonLog,
            _ => AccessLogFormat::Combined,
        }
    }
}

#[derive(Debug)]
pub struct LogEntry {
    pub request_id: Uuid,
    pub remote_addr: String,
    pub host: Option<String>,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub response_size: usize,
    pub duration_ms: f64,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AccessLogger {
    pub fn new(log_path: Option<&str>, format: AccessLogFormat) -> Result<Self> {
        let file = if let Some(path) = log_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open access log: {}", path))?;
            Some(Arc::new(Mutex::new(file)))
        } else {
            None
        };

        Ok(Self { file, format })
    }

    pub async fn log(&self, entry: LogEntry) {
        let log_line = self.format_entry(&entry);

        if let Some(ref file) = self.file {
            let mut file_guard = file.lock().await;
            if let Err(e) = writeln!(file_guard, "{}", log_line) {
                error!("Failed to write access log: {}", e);
            }
            if let Err(e) = file_guard.flush() {
                error!("Failed to flush access log: {}", e);
            }
        } else {
            println!("{}", log_line);
        }
    }

    fn format_entry(&self, entry: &LogEntry) -> String {
        match self.format {
            AccessLogFormat::Json => json!({
                "timestamp": entry.timestamp.to_rfc3339(),
                "request_id": entry.request_id.to_string(),
                "remote_addr": entry.remote_addr,
                "host": entry.host,
                "method": entry.method,
                "uri": entry.uri,
                "status": entry.status,
                "response_size": entry.response_size,
                "duration_ms": entry.duration_ms,
                "user_agent": entry.user_agent,
                "referer": entry.referer
            })
            .to_string(),
            AccessLogFormat::CommonLog => {
                format!(
                    "{} - - [{}] \"{} {} HTTP/1.1\" {} {}",
                    entry.remote_addr,
                    entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                    entry.method,
                    entry.uri,
                    entry.status,
                    entry.response_size
                )
            }
            AccessLogFormat::Combined => {
                format!(
                    "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\" {}",
                    entry.remote_addr,
                    entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                    entry.method,
                    entry.uri,
                    entry.status,
                    entry.response_size,
                    entry.referer.as_deref().unwrap_or("-"),
                    entry.user_agent.as_deref().unwrap_or("-"),
                    entry.host.as_deref().unwrap_or("-")
                )
            }
        }
    }
}
