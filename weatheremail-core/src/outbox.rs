//! File-backed collaborators used by the command-line sender.
//!
//! Subscribers come from a JSON array on disk, delivery events are appended
//! as JSON lines, and messages are written to an outbox directory instead
//! of being handed to a mail server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::NotifyError;
use crate::model::{DeliveryEvent, EmailMessage, Subscriber};
use crate::notifier::{Mailer, SubscriberStore, TEMPLATE_NAME, TemplateRenderer};

#[derive(Debug)]
pub struct JsonSubscriberStore {
    subscribers_path: PathBuf,
    events_path: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonSubscriberStore {
    pub fn new(subscribers_path: impl Into<PathBuf>, events_path: impl Into<PathBuf>) -> Self {
        Self {
            subscribers_path: subscribers_path.into(),
            events_path: events_path.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// Every event recorded so far, oldest first.
    pub async fn events(&self) -> Result<Vec<DeliveryEvent>, NotifyError> {
        let contents = match fs::read_to_string(&self.events_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(&self.events_path, e)),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| store_error(&self.events_path, e))
            })
            .collect()
    }
}

fn store_error(path: &Path, err: impl std::fmt::Display) -> NotifyError {
    NotifyError::Store(format!("{}: {err}", path.display()))
}

#[async_trait]
impl SubscriberStore for JsonSubscriberStore {
    async fn active_subscribers(
        &self,
        newsletter: Option<&str>,
    ) -> Result<Vec<Subscriber>, NotifyError> {
        let contents = fs::read_to_string(&self.subscribers_path)
            .await
            .map_err(|e| store_error(&self.subscribers_path, e))?;
        let all: Vec<Subscriber> = serde_json::from_str(&contents)
            .map_err(|e| store_error(&self.subscribers_path, e))?;

        let active: Vec<Subscriber> = all
            .into_iter()
            .filter(|s| s.subscribed)
            .filter(|s| newsletter.is_none_or(|n| s.newsletter == n))
            .collect();
        debug!(count = active.len(), ?newsletter, "loaded active subscribers");
        Ok(active)
    }

    async fn record_event(&self, event: DeliveryEvent) -> Result<(), NotifyError> {
        let mut line =
            serde_json::to_string(&event).map_err(|e| store_error(&self.events_path, e))?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .map_err(|e| store_error(&self.events_path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| store_error(&self.events_path, e))?;
        file.flush()
            .await
            .map_err(|e| store_error(&self.events_path, e))
    }
}

/// Mailer that writes each message to `<dir>/<n>-<recipient>.eml`, or only
/// logs it when no directory is set.
#[derive(Debug)]
pub struct OutboxMailer {
    dir: Option<PathBuf>,
    counter: AtomicUsize,
}

impl OutboxMailer {
    pub fn to_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn dry_run() -> Self {
        Self {
            dir: None,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Header values go out verbatim, so a line break would start a new header.
fn header_value<'a>(name: &str, value: &'a str) -> Result<&'a str, NotifyError> {
    if value.contains(['\r', '\n']) {
        return Err(NotifyError::Mail(format!("line break in {name} header")));
    }
    Ok(value)
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        let from = header_value("From", &message.from)?;
        let to = header_value("To", &message.to)?;
        let subject = header_value("Subject", &message.subject)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(dir) = &self.dir else {
            info!(to, subject, "dry run, message not written");
            return Ok(());
        };

        fs::create_dir_all(dir)
            .await
            .map_err(|e| NotifyError::Mail(format!("{}: {e}", dir.display())))?;

        let path = dir.join(format!("{n:05}-{}.eml", file_safe(to)));
        let contents = format!(
            "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
            message.html_body
        );
        fs::write(&path, contents)
            .await
            .map_err(|e| NotifyError::Mail(format!("{}: {e}", path.display())))?;

        debug!(path = %path.display(), "message written to outbox");
        Ok(())
    }
}

/// Built-in HTML body for the weather discount email.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscountTemplate;

impl TemplateRenderer for DiscountTemplate {
    fn render(&self, name: &str, data: &Value) -> Result<String, NotifyError> {
        if name != TEMPLATE_NAME {
            return Err(NotifyError::Render(format!("unknown template '{name}'")));
        }

        let today = data
            .get("today")
            .ok_or_else(|| NotifyError::Render("missing 'today' in template data".into()))?;
        let weather = today.get("weather").and_then(Value::as_str).unwrap_or("Unknown");
        let feels = today
            .get("feelslike_f")
            .and_then(Value::as_f64)
            .map(|f| format!("{f:.0}°F"))
            .unwrap_or_else(|| "n/a".to_string());
        let subject = data.get("subject").and_then(Value::as_str).unwrap_or_default();

        let mut html = String::new();
        html.push_str("<html><body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", escape(subject)));
        html.push_str(&format!(
            "<p>Current weather: {} (feels like {})</p>\n",
            escape(weather),
            feels
        ));
        if let Some(icon) = today.get("icon_url").and_then(Value::as_str) {
            html.push_str(&format!("<img src=\"{}\" alt=\"\">\n", escape(icon)));
        }
        html.push_str("</body></html>\n");
        Ok(html)
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
