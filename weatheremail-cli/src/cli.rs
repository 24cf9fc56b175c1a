use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use inquire::{CustomType, Password, Text};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weatheremail_core::notifier::SubscriberStore;
use weatheremail_core::outbox::{DiscountTemplate, JsonSubscriberStore, OutboxMailer};
use weatheremail_core::{
    BulkNotifier, Conditions, Config, FailurePolicy, FeatureSettings, NotifyError, Query,
    RateLimitedSession, RunReport, WeatherClient, classify_subject,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weatheremail", version, about = "Weather-based discount newsletter sender")]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store the API key, sender address and call limit.
    Configure,

    /// Show current conditions and the subject line they would produce.
    Conditions {
        #[command(flatten)]
        location: LocationArgs,

        /// Language code passed to the provider, e.g. "EN".
        #[arg(long)]
        lang: Option<String>,
    },

    /// Send the weather discount email to every active subscriber.
    SendEmails {
        /// Newsletter whose subscribers receive the email.
        #[arg(short, long)]
        newsletter: Option<String>,

        /// API call limit per minute.
        #[arg(short = 'l', long)]
        api_limit: Option<u32>,

        /// JSON array of subscribers.
        #[arg(long)]
        subscribers: PathBuf,

        /// File that delivery events are appended to (JSON lines).
        #[arg(long, default_value = "events.jsonl")]
        events: PathBuf,

        /// Directory to write messages into; without it messages are only logged.
        #[arg(long)]
        outbox: Option<PathBuf>,

        /// Skip a city whose weather lookup fails instead of aborting the run.
        #[arg(long)]
        skip_failed: bool,
    },
}

#[derive(Debug, Args)]
pub struct LocationArgs {
    #[arg(long)]
    pub city: Option<String>,
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub country: Option<String>,
    #[arg(long)]
    pub zipcode: Option<String>,
    #[arg(long)]
    pub airport: Option<String>,
    #[arg(long, allow_hyphen_values = true, requires = "lon")]
    pub lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lon: Option<f64>,
}

impl From<LocationArgs> for Query {
    fn from(args: LocationArgs) -> Self {
        Query {
            latitude: args.lat,
            longitude: args.lon,
            zipcode: args.zipcode,
            airportcode: args.airport,
            city: args.city,
            state: args.state,
            country: args.country,
        }
    }
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure => configure(),
            Command::Conditions { location, lang } => show_conditions(location.into(), lang).await,
            Command::SendEmails {
                newsletter,
                api_limit,
                subscribers,
                events,
                outbox,
                skip_failed,
            } => {
                let config = Config::load()?;
                let newsletter = newsletter.unwrap_or_else(|| config.newsletter().to_string());
                let limit = api_limit.unwrap_or_else(|| config.api_limit());
                let policy = if skip_failed {
                    FailurePolicy::SkipLocation
                } else {
                    FailurePolicy::Abort
                };

                let store = JsonSubscriberStore::new(subscribers, events);
                let mailer = match outbox {
                    Some(dir) => OutboxMailer::to_dir(dir),
                    None => OutboxMailer::dry_run(),
                };

                send_emails(&config, &newsletter, limit, policy, store, mailer).await
            }
        }
    }
}

fn configure() -> anyhow::Result<()> {
    let mut config = Config::load()?;

    let api_key = Password::new("Weather Underground API key:")
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;
    let from_email = Text::new("Sender address:")
        .with_default(config.from_email())
        .prompt()
        .context("Failed to read sender address")?;
    let api_limit = CustomType::<u32>::new("API calls per minute:")
        .with_default(config.api_limit())
        .with_error_message("Please enter a positive whole number")
        .prompt()
        .context("Failed to read API limit")?;

    if api_limit == 0 {
        return Err(anyhow!("API limit must be at least 1 call per minute"));
    }

    config.api_key = Some(api_key);
    config.from_email = Some(from_email);
    config.api_limit = Some(api_limit);
    config.save()?;

    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

fn build_client(config: &Config, limit: u32) -> anyhow::Result<WeatherClient> {
    let session = Arc::new(RateLimitedSession::new(limit)?);
    let client = WeatherClient::with_base_url(session, config.api_key()?, config.base_url())?;
    Ok(client)
}

async fn show_conditions(query: Query, lang: Option<String>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let client = build_client(&config, config.api_limit())?;

    let settings = lang.map(|l| FeatureSettings::new().set("lang", l));
    let body = client
        .get("conditions", &query, settings.as_ref())
        .await
        .context("Failed to fetch current conditions")?;
    let today = body
        .get("current_observation")
        .ok_or_else(|| anyhow!("Response has no current_observation section"))?;
    let conditions: Conditions = serde_json::from_value(today.clone())
        .context("Failed to parse current conditions")?;
    let almanac = client.almanac(&query).await?;
    let subject = classify_subject(&conditions.weather, conditions.feelslike_f, almanac.average());

    let place = today
        .pointer("/display_location/full")
        .and_then(|v| v.as_str())
        .unwrap_or("requested location");
    println!("Weather for {place}");
    println!("  Condition:   {}", conditions.weather);
    println!("  Feels like:  {:.1}°F", conditions.feelslike_f);
    println!("  Normal avg:  {:.1}°F", almanac.average());
    println!("  Subject:     {subject}");
    Ok(())
}

async fn send_emails(
    config: &Config,
    newsletter: &str,
    limit: u32,
    policy: FailurePolicy,
    store: JsonSubscriberStore,
    mailer: OutboxMailer,
) -> anyhow::Result<()> {
    let client = build_client(config, limit)?;
    let store: Arc<dyn SubscriberStore> = Arc::new(store);

    let notifier = BulkNotifier::new(
        Arc::new(client),
        store,
        Arc::new(mailer),
        Arc::new(DiscountTemplate),
        config.from_email(),
    )
    .with_policy(policy);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    info!(newsletter, limit, started = %Local::now().format("%Y-%m-%d %H:%M:%S"), "sending");
    match notifier.run(newsletter, &cancel).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(err) => {
            if let NotifyError::Aborted { report, .. } = &err {
                print_report(report);
            }
            Err(err.into())
        }
    }
}

fn print_report(report: &RunReport) {
    if report.interrupted {
        println!("\nInterrupted before all subscribers were processed.");
    }
    println!("\nSent {} emails", report.sent);
    println!("Got weather for {} cities", report.locations);
    println!("Made {} calls to wunderground API", report.api_calls);
    for skipped in &report.skipped {
        println!("Skipped {}: {}", skipped.location, skipped.reason);
    }
}
