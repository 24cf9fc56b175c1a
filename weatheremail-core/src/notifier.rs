//! Bulk weather-discount mailing.
//!
//! Subscribers are grouped by (city, state); each location costs two
//! provider calls (conditions, then almanac) no matter how many people live
//! there, after which one message per subscriber is rendered, sent and
//! recorded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::WeatherSource;
use crate::error::{ApiError, NotifyError};
use crate::model::{Almanac, Conditions, DeliveryEvent, EmailMessage, LocationKey, Subscriber};

pub const TEMPLATE_NAME: &str = "weather_discount_email";

/// Temperature gap (°F) between feels-like and the seasonal average that
/// flips the subject away from neutral.
pub const COMFORT_MARGIN_F: f64 = 5.0;

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Active subscribers, optionally restricted to one newsletter.
    async fn active_subscribers(
        &self,
        newsletter: Option<&str>,
    ) -> Result<Vec<Subscriber>, NotifyError>;

    async fn record_event(&self, event: DeliveryEvent) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, data: &Value) -> Result<String, NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Subject {
    LessNice,
    Nice,
    Neutral,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::LessNice => "Not so nice out? That's okay, enjoy a discount on us.",
            Subject::Nice => "It's nice out! Enjoy a discount on us.",
            Subject::Neutral => "Enjoy a discount on us",
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the subject line for a location. Bad-weather checks win ties.
pub fn classify_subject(weather: &str, feels_like_f: f64, average_f: f64) -> Subject {
    let weather = weather.trim().to_lowercase();

    if matches!(weather.as_str(), "overcast" | "rain") || average_f - feels_like_f >= COMFORT_MARGIN_F
    {
        return Subject::LessNice;
    }
    if weather == "clear" || feels_like_f - average_f >= COMFORT_MARGIN_F {
        return Subject::Nice;
    }
    Subject::Neutral
}

/// Partition subscribed entries by location, in order of first appearance.
pub fn group_by_location(subscribers: Vec<Subscriber>) -> Vec<(LocationKey, Vec<Subscriber>)> {
    let mut index: HashMap<LocationKey, usize> = HashMap::new();
    let mut groups: Vec<(LocationKey, Vec<Subscriber>)> = Vec::new();

    for subscriber in subscribers.into_iter().filter(|s| s.subscribed) {
        let key = LocationKey::from(&subscriber.city);
        match index.get(&key) {
            Some(&i) => groups[i].1.push(subscriber),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![subscriber]));
            }
        }
    }

    groups
}

/// What to do when one location fails mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the whole run and return the partial report inside the error.
    #[default]
    Abort,
    /// Log, record the location as skipped, and move on.
    SkipLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLocation {
    pub location: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Locations whose weather was fetched successfully.
    pub locations: usize,
    /// Messages accepted by the mailer, including any whose delivery event
    /// then failed to record.
    pub sent: usize,
    /// Provider calls attempted, successful or not.
    pub api_calls: usize,
    pub skipped: Vec<SkippedLocation>,
    pub interrupted: bool,
}

enum Progress {
    Done,
    Interrupted,
}

pub struct BulkNotifier {
    weather: Arc<dyn WeatherSource>,
    store: Arc<dyn SubscriberStore>,
    mailer: Arc<dyn Mailer>,
    renderer: Arc<dyn TemplateRenderer>,
    sender: String,
    policy: FailurePolicy,
}

impl BulkNotifier {
    pub fn new(
        weather: Arc<dyn WeatherSource>,
        store: Arc<dyn SubscriberStore>,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn TemplateRenderer>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            weather,
            store,
            mailer,
            renderer,
            sender: sender.into(),
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send one discount email to every active subscriber of `newsletter`.
    ///
    /// Locations are processed one at a time. Cancelling `cancel` stops the
    /// run at the next await point and returns the counts so far with
    /// `interrupted` set.
    #[instrument(skip(self, cancel), level = "info")]
    pub async fn run(
        &self,
        newsletter: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport, NotifyError> {
        let subscribers = self.store.active_subscribers(Some(newsletter)).await?;
        let groups = group_by_location(subscribers);
        info!(locations = groups.len(), "starting bulk send");

        let mut report = RunReport::default();

        for (key, subscribers) in &groups {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match self
                .process_location(key, subscribers, newsletter, cancel, &mut report)
                .await
            {
                Ok(Progress::Done) => {}
                Ok(Progress::Interrupted) => {
                    report.interrupted = true;
                    break;
                }
                Err(err) => match self.policy {
                    FailurePolicy::Abort => {
                        return Err(NotifyError::Aborted {
                            report,
                            source: Box::new(err),
                        });
                    }
                    FailurePolicy::SkipLocation => {
                        warn!(location = %key, error = %err, "skipping location");
                        report.skipped.push(SkippedLocation {
                            location: key.to_string(),
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }

        info!(
            sent = report.sent,
            locations = report.locations,
            api_calls = report.api_calls,
            interrupted = report.interrupted,
            "bulk send finished"
        );
        Ok(report)
    }

    async fn process_location(
        &self,
        key: &LocationKey,
        subscribers: &[Subscriber],
        newsletter: &str,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Progress, NotifyError> {
        let Some((conditions, almanac)) = self.fetch_weather(key, cancel, report).await? else {
            return Ok(Progress::Interrupted);
        };
        report.locations += 1;

        let subject = classify_subject(&conditions.weather, conditions.feelslike_f, almanac.average());
        info!(location = %key, %subject, recipients = subscribers.len(), "weather fetched");

        for subscriber in subscribers {
            if cancel.is_cancelled() {
                return Ok(Progress::Interrupted);
            }
            self.notify(subscriber, &conditions, subject, newsletter, report)
                .await?;
        }

        Ok(Progress::Done)
    }

    /// Conditions first, then almanac; `None` if cancelled in between.
    async fn fetch_weather(
        &self,
        key: &LocationKey,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Option<(Conditions, Almanac)>, NotifyError> {
        let query = key.query();
        let wrap = |source: ApiError| NotifyError::Api {
            location: key.to_string(),
            source,
        };

        report.api_calls += 1;
        let conditions = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = self.weather.conditions(&query) => res.map_err(wrap)?,
        };

        report.api_calls += 1;
        let almanac = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = self.weather.almanac(&query) => res.map_err(wrap)?,
        };

        Ok(Some((conditions, almanac)))
    }

    async fn notify(
        &self,
        subscriber: &Subscriber,
        conditions: &Conditions,
        subject: Subject,
        newsletter: &str,
        report: &mut RunReport,
    ) -> Result<(), NotifyError> {
        let data = json!({
            "today": conditions,
            "subject": subject.as_str(),
            "email": subscriber.email,
        });
        let html_body = self.renderer.render(TEMPLATE_NAME, &data)?;

        let message = EmailMessage {
            from: self.sender.clone(),
            to: subscriber.email.clone(),
            subject: subject.as_str().to_string(),
            html_body,
        };
        self.mailer.send(&message).await?;
        // Counted once the mailer accepts it, even if recording fails below.
        report.sent += 1;

        self.store
            .record_event(DeliveryEvent {
                subscriber_id: subscriber.id,
                recipient: subscriber.email.clone(),
                sender: self.sender.clone(),
                newsletter: newsletter.to_string(),
                subject: message.subject,
                date_sent: Utc::now(),
            })
            .await?;

        info!(email = %subscriber.email, %subject, "email sent");
        Ok(())
    }
}
