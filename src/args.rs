use clap::{ArgGroup, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "herald")]
#[command(
    version = const_format::formatcp!("{}", env!("CARGO_PKG_VERSION")),
    about = "Herald: push notification delivery and deduplication engine",
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) command: Subcommand,

    /// Path to the TOML configuration, defaults to `herald.toml` if it exists
    #[arg(long, short, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Print version
    #[arg(short, long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Subcommand {
    #[command(subcommand)]
    Server(Server),
    #[command(flatten)]
    Operator(Operator),
}

/// One-shot commands working directly on the database.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum Operator {
    /// Manage push subscriptions.
    #[command(subcommand)]
    Subscription(Subscription),
    /// Query and update the delivery ledger.
    #[command(subcommand)]
    Ledger(Ledger),
    #[command(subcommand)]
    Broadcast(Broadcast),
    /// Probe every subscription with a silent push and remove the defunct ones.
    Sweep,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Server {
    /// Run the event scanner and the sweeper until interrupted.
    Run,
    /// Read and validate the configuration, open the database and exit.
    Verify,
    /// Write the default configuration.
    GenerateConfig {
        /// Destination, defaults to `herald.toml`.
        output: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Subscription {
    /// Register or refresh a subscription.
    Add {
        recipient_id: String,
        endpoint: String,
        /// Authentication secret of the subscription.
        #[arg(long)]
        auth: String,
        /// Public encryption key of the subscription.
        #[arg(long)]
        p256dh: String,
    },
    Remove {
        recipient_id: String,
        endpoint: String,
    },
    /// List subscriptions of a recipient, or all of them.
    List { recipient_id: Option<String> },
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Ledger {
    /// Check whether the notification identified by the tracking parts was sent.
    Check {
        recipient_id: String,
        /// Parts of the tracking key, e.g. `post_sale e42`.
        #[arg(required(true))]
        tracking_parts: Vec<String>,
    },
    /// Record the notification as sent.
    Mark {
        recipient_id: String,
        #[arg(required(true))]
        tracking_parts: Vec<String>,
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Newest delivery records of a recipient.
    History { recipient_id: String },
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Broadcast {
    /// Send a message to all subscriptions or to the listed recipients.
    Send(BroadcastSend),
    /// Show the most recent broadcasts.
    Log {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, clap::Args)]
#[command(group(
    ArgGroup::new("recipients")
        .args(&["all", "recipient"])
        .required(true)
        .multiple(false)
))]
pub(crate) struct BroadcastSend {
    pub(crate) text: String,
    /// Send to every subscription.
    #[arg(long)]
    pub(crate) all: bool,
    /// Recipient id, can be repeated.
    #[arg(long)]
    pub(crate) recipient: Vec<String>,
    #[arg(long)]
    pub(crate) issued_by: String,
}
