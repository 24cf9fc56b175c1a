//! Core library for the `weatheremail` sender.
//!
//! This crate defines:
//! - A per-minute token bucket and the HTTP session it guards
//! - The Weather Underground client (request paths, error normalization)
//! - The bulk notifier that mails subscribers grouped by city
//! - Configuration and file-backed collaborators for the CLI
//!
//! It is used by `weatheremail-cli`, but the notifier only depends on traits,
//! so other stores or mailers can be plugged in.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod notifier;
pub mod outbox;
pub mod query;
pub mod rate_limit;

pub use client::{WeatherClient, WeatherSource};
pub use config::Config;
pub use error::{ApiError, NotifyError};
pub use model::{Almanac, City, Conditions, DeliveryEvent, EmailMessage, LocationKey, Subscriber};
pub use notifier::{
    BulkNotifier, FailurePolicy, Mailer, RunReport, Subject, SubscriberStore, TemplateRenderer,
    classify_subject,
};
pub use query::{FeatureSettings, Query};
pub use rate_limit::{RateLimitedSession, TokenBucket};
