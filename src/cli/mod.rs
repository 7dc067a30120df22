//! Command-line interface for rulekeeper.
//!
//! Every command prints JSON. Business failures print
//! `{"ok": false, "error": <code>, "status": <http-style status>}` and exit
//! non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::adapters::{Collaborators, HttpWebhookTransport, LocalCollaborators};
use crate::config::{self, ResolvedConfig};
use crate::core::{ActionExecutor, ConfirmRequest, RuleEngine};
use crate::domain::LogEvent;
use crate::error::EngineError;
use crate::store::{Database, SqliteEventLog};

pub mod rules;

/// rulekeeper - tenant-scoped automation rule engine
#[derive(Parser, Debug)]
#[command(name = "rulekeeper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Tenant to operate on
    #[arg(short, long, global = true, env = "RULEKEEPER_TENANT")]
    pub tenant: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage rules
    Rules {
        #[command(subcommand)]
        command: rules::RuleCommands,
    },

    /// Append to the bundled event log
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Process new event-log entries for the tenant
    Process,

    /// Run the cron tick for the tenant
    Cron {
        /// Instant to tick for (RFC 3339, default now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Run processors for every tenant on an interval
    Worker {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect pending actions
    Pending {
        #[command(subcommand)]
        command: PendingCommands,
    },

    /// Confirm a pending action
    Confirm {
        pending_id: i64,

        /// Confirm token shown by `pending show`
        #[arg(long)]
        token: String,

        /// Acknowledge that a real effect will happen
        #[arg(long)]
        ack: bool,
    },

    /// Dry-run a rule against an event
    Simulate {
        rule_id: i64,

        /// Event id (default: most recent event the rule listens to)
        #[arg(long)]
        event_id: Option<i64>,
    },

    /// Show execution log rows
    Logs {
        /// Only rows of this rule
        #[arg(long)]
        rule_id: Option<i64>,

        /// Maximum number of rows
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Manage local CRM contacts
    Contacts {
        #[command(subcommand)]
        command: ContactCommands,
    },

    /// Manage local mail account credentials
    Oauth {
        #[command(subcommand)]
        command: OauthCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Append one event
    Append {
        /// Dotted event type, e.g. email.received
        event_type: String,

        #[arg(long, default_value = "email")]
        entity_type: String,

        #[arg(long)]
        entity_id: Option<String>,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PendingCommands {
    /// List pending actions
    List {
        /// Include already confirmed actions
        #[arg(long)]
        all: bool,
    },

    /// Show one pending action
    Show { pending_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ContactCommands {
    /// Add or rename a contact
    Add {
        email: String,
        #[arg(long, default_value = "")]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum OauthCommands {
    /// Add or update an account credential
    Add {
        account_id: String,

        /// Expiry (RFC 3339)
        #[arg(long)]
        expires_at: String,

        /// Whether an expired credential can be refreshed
        #[arg(long)]
        refreshable: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.run().await {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<EngineError>() {
                Some(engine_error) => {
                    print_json(&json!({
                        "ok": false,
                        "error": engine_error.code(),
                        "status": engine_error.status_code(),
                    }))?;
                    std::process::exit(1);
                }
                None => Err(e),
            },
        }
    }

    async fn run(self) -> Result<()> {
        let cfg = config::config()?;
        let tenant = self.tenant;

        match self.command {
            Commands::Config => show_config(cfg),
            Commands::Rules { command } => {
                let db = open_database(cfg)?;
                rules::execute(&db, require_tenant(&tenant)?, command)
            }
            Commands::Events { command } => {
                let db = open_database(cfg)?;
                append_event(&db, require_tenant(&tenant)?, command)
            }
            Commands::Process => {
                let engine = open_engine(cfg)?;
                let report = engine.process_eventlog(require_tenant(&tenant)?).await?;
                print_json(&report)
            }
            Commands::Cron { at } => {
                let engine = open_engine(cfg)?;
                let at = parse_instant(at.as_deref())?;
                let report = engine.run_cron_tick(require_tenant(&tenant)?, at).await?;
                print_json(&report)
            }
            Commands::Worker { once } => {
                let engine = open_engine(cfg)?;
                run_worker(&engine, cfg, once).await
            }
            Commands::Pending { command } => {
                let engine = open_engine(cfg)?;
                let tenant_id = require_tenant(&tenant)?;
                match command {
                    PendingCommands::List { all } => {
                        let pending = engine.list_pending(tenant_id, all)?;
                        print_json(&json!({"ok": true, "pending": pending}))
                    }
                    PendingCommands::Show { pending_id } => {
                        let pending = engine.get_pending(tenant_id, pending_id)?;
                        print_json(&json!({"ok": true, "pending": pending}))
                    }
                }
            }
            Commands::Confirm { pending_id, token, ack } => {
                let engine = open_engine(cfg)?;
                let request = ConfirmRequest { pending_id, token, ack };
                let result = engine.confirm(require_tenant(&tenant)?, &request).await?;
                print_json(&result)
            }
            Commands::Simulate { rule_id, event_id } => {
                let engine = open_engine(cfg)?;
                let result = engine
                    .simulate(require_tenant(&tenant)?, rule_id, event_id, Utc::now())
                    .await?;
                print_json(&result)
            }
            Commands::Logs { rule_id, limit } => {
                let db = open_database(cfg)?;
                let rows = db.list_executions(require_tenant(&tenant)?, rule_id, limit)?;
                print_json(&json!({"ok": true, "executions": rows}))
            }
            Commands::Contacts { command } => {
                let local = LocalCollaborators::new(open_database(cfg)?);
                match command {
                    ContactCommands::Add { email, name } => {
                        local.add_contact(require_tenant(&tenant)?, &email, &name)?;
                        print_json(&json!({"ok": true}))
                    }
                }
            }
            Commands::Oauth { command } => {
                let local = LocalCollaborators::new(open_database(cfg)?);
                match command {
                    OauthCommands::Add {
                        account_id,
                        expires_at,
                        refreshable,
                    } => {
                        let expires_at = parse_instant(Some(&expires_at))?;
                        local.add_oauth_account(require_tenant(&tenant)?, &account_id, expires_at, refreshable)?;
                        print_json(&json!({"ok": true}))
                    }
                }
            }
        }
    }
}

/// Pretty-print a value as JSON on stdout
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn require_tenant(tenant: &Option<String>) -> Result<&str> {
    tenant
        .as_deref()
        .context("No tenant given. Use --tenant <id> or set RULEKEEPER_TENANT")
}

fn parse_instant(text: Option<&str>) -> Result<DateTime<Utc>> {
    match text {
        Some(text) => Ok(DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("Invalid RFC 3339 timestamp: {}", text))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn open_database(cfg: &ResolvedConfig) -> Result<Database> {
    Database::open_at(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))
}

/// Wire the engine with the bundled event log and collaborators.
fn open_engine(cfg: &ResolvedConfig) -> Result<RuleEngine> {
    let db = open_database(cfg)?;
    let local = Arc::new(LocalCollaborators::new(db.clone()));
    let webhooks = Arc::new(HttpWebhookTransport::new(cfg.webhook_timeout).context("Failed to build HTTP client")?);
    let collaborators = Collaborators::local(local, webhooks);
    let executor = ActionExecutor::new(db.clone(), collaborators, cfg.executor.clone());
    let events = Arc::new(SqliteEventLog::new(db.clone()));
    Ok(RuleEngine::new(db, events, executor, cfg.engine.clone()))
}

fn append_event(db: &Database, tenant_id: &str, command: EventCommands) -> Result<()> {
    match command {
        EventCommands::Append {
            event_type,
            entity_type,
            entity_id,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let stored = SqliteEventLog::new(db.clone()).append(&LogEvent::new(
                tenant_id,
                event_type,
                entity_type,
                entity_id,
                payload,
            ))?;
            print_json(&json!({"ok": true, "event_id": stored.id}))
        }
    }
}

/// Reference scheduler: one pass per interval until interrupted.
async fn run_worker(engine: &RuleEngine, cfg: &ResolvedConfig, once: bool) -> Result<()> {
    if once {
        let passes = engine.run_scheduled_pass(Utc::now()).await?;
        return print_json(&passes);
    }

    info!(interval_secs = cfg.worker_interval.as_secs(), "Worker started");
    let mut interval = tokio::time::interval(cfg.worker_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.run_scheduled_pass(Utc::now()).await {
                    Ok(passes) => info!(tenants = passes.len(), "Scheduler pass finished"),
                    Err(e) => error!(error = %e, "Scheduler pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Worker stopping");
                return Ok(());
            }
        }
    }
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let config_file: Option<PathBuf> = cfg.config_file.clone();
    print_json(&json!({
        "home": cfg.home,
        "database": cfg.database,
        "config_file": config_file,
        "batch_size": cfg.engine.effective_batch_size(),
        "storage_retry_delay_ms": cfg.engine.storage_retry_delay.as_millis() as u64,
        "worker_interval_seconds": cfg.worker_interval.as_secs(),
        "webhook_timeout_seconds": cfg.webhook_timeout.as_secs(),
        "limits": cfg.executor.limits,
        "webhook_retry": cfg.executor.webhook_retry,
        "collaborator_retry": cfg.executor.collaborator_retry,
    }))
}
