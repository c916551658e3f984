//! Command-line entry point: argument parsing, logging setup and the
//! file → descriptor → message → delivery loop.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use mailspool_core::core::config::{tags_match, Config};
use mailspool_core::core::error::AppError;
use mailspool_core::delivery::Mailer;
use mailspool_core::document::{Document, MailDescriptor, TemplateExpander};
use mailspool_core::message::Message;

/// Send mails with YAML.
#[derive(Parser, Debug)]
#[command(name = "mailspool", version, about = "Send mails with YAML.")]
struct Args {
    /// SMTP relay server
    #[arg(short = 'r', long)]
    relay: Option<String>,

    /// Remote server port
    #[arg(short = 'p', long, default_value_t = 25)]
    port: u16,

    /// Nameservers for MX record lookup (comma-separated)
    #[arg(short = 'n', long)]
    nameservers: Option<String>,

    /// Disable DNS cache
    #[arg(short = 'N', long)]
    no_cache: bool,

    /// Delay (in seconds) after each mail
    #[arg(short = 'd', long)]
    delay: Option<f64>,

    /// Print messages but do not send
    #[arg(short = 'P', long)]
    print_only: bool,

    /// HELO name for SMTP server connection
    #[arg(short = 'H', long)]
    helo: Option<String>,

    /// Keep the relay session open between messages
    #[arg(short = 'k', long)]
    keep_alive: bool,

    /// Check config files and exit
    #[arg(short = 'c', long)]
    check: bool,

    /// Tags for execution (comma-separated)
    #[arg(short = 't', long)]
    tags: Option<String>,

    /// Use STARTTLS
    #[arg(long)]
    starttls: bool,

    /// SMTP connection timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// MX query timeout in seconds
    #[arg(long, default_value_t = 10)]
    dns_timeout: u64,

    /// Increase verbosity
    #[arg(short = 'v', long, action = clap::ArgAction::Count, conflicts_with = "silent")]
    verbose: u8,

    /// Silent mode (only errors)
    #[arg(short = 's', long)]
    silent: bool,

    /// Path to one or more config files
    #[arg(required = true, value_name = "config")]
    path: Vec<PathBuf>,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            relay: self.relay.clone(),
            port: self.port,
            helo: self.helo.clone(),
            nameservers: self.nameservers.as_ref().map(|list| {
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            no_cache: self.no_cache,
            dns_timeout: Duration::from_secs(self.dns_timeout),
            smtp_timeout: Duration::from_secs(self.timeout),
            starttls: self.starttls,
            keep_alive: self.keep_alive,
            delay: self.delay,
            print_only: self.print_only,
            check_only: self.check,
            tags: self.tags.clone(),
        }
    }
}

fn init_tracing(verbose: u8, silent: bool) {
    let level = if silent {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose, args.silent);

    if let Err(err) = run(args).await {
        error!("Unexpected error occurred: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.to_config();

    let mut mailer = if config.check_only {
        None
    } else {
        Some(Mailer::new(&config)?)
    };

    for path in &args.path {
        if !path.is_file() {
            warn!("No such file, skipping. [path={}]", path.display());
            continue;
        }

        let document = match Document::load_path(path) {
            Ok(document) => document,
            Err(err) => {
                error!(
                    "Error while parsing config: {} [path={}]",
                    err,
                    path.display()
                );
                continue;
            }
        };

        let Some(mailer) = mailer.as_mut() else {
            continue; // validate-only mode
        };

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let total = document.mails.len();
        for (index, mail) in document.mails.iter().enumerate() {
            let tags = mail.tags.clone().unwrap_or_default();
            if !tags_match(config.tags.as_deref(), &tags) {
                debug!(
                    "Skipping message \"{}\", does not match tags: {:?}",
                    mail.display_name(),
                    config.tags
                );
                continue;
            }

            process_message(
                mailer,
                mail.clone(),
                &base_dir,
                document.expander(),
                &config,
                path,
            )
            .await?;

            if let Some(delay) = config.delay {
                if index < total - 1 {
                    debug!("Delaying next message by {:.2} seconds.", delay);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }

        mailer.shutdown().await;
    }

    Ok(())
}

/// Build and send a single message. Message-scoped failures are logged
/// and stay scoped to it; anything outside the taxonomy propagates as a
/// defect.
async fn process_message(
    mailer: &mut Mailer,
    mail: MailDescriptor,
    base_dir: &std::path::Path,
    expander: &TemplateExpander,
    config: &Config,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let name = mail.display_name().to_string();
    let attachments: Vec<String> = mail
        .attachments
        .as_ref()
        .map(|field| field.raw_items())
        .unwrap_or_default();

    let result = async {
        let mut msg = Message::from_descriptor(mail, base_dir, expander)?;
        for attachment in attachments {
            msg.attach(base_dir.join(attachment));
        }
        mailer.send(&msg, config.print_only).await
    }
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(
            err @ (AppError::Message(_)
            | AppError::AddressParse(_)
            | AppError::Template(_)
            | AppError::Validation(_)
            | AppError::Io(_)),
        ) => {
            error!(
                "Failed to create message: {} [name={}, path={}]",
                err,
                name,
                path.display()
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
