//! Rule management subcommands.
//!
//! Rule documents use the import/export JSON format and are read from
//! `--file` or stdin.

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;

use super::print_json;
use crate::domain::{RuleDocument, RulePatchDocument};
use crate::error::EngineError;
use crate::store::Database;

/// Rule-related subcommands
#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// Create a rule from a rule document
    Create {
        /// Rule document (reads from stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List the tenant's rules
    List,

    /// Show one rule with its children and fingerprint
    Show { rule_id: i64 },

    /// Apply a partial update document
    Update {
        rule_id: i64,

        /// Patch document (reads from stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a rule and everything it owns
    Delete { rule_id: i64 },

    /// Print the canonical export document
    Export { rule_id: i64 },

    /// Import a rule document
    Import {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Enable a rule (clears any auto-disable reason)
    Enable { rule_id: i64 },

    /// Disable a rule
    Disable { rule_id: i64 },
}

/// Read a document from a file, or stdin when no file is given
pub(super) fn read_input(file: Option<PathBuf>) -> Result<String> {
    let input = if let Some(path) = file {
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    };

    if input.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }
    Ok(input)
}

/// Execute rule subcommands
pub fn execute(db: &Database, tenant_id: &str, command: RuleCommands) -> Result<()> {
    match command {
        RuleCommands::Create { file } => {
            let draft = RuleDocument::from_json(&read_input(file)?)?.into_draft()?;
            let rule = db.create_rule(tenant_id, &draft)?;
            print_json(&json!({"ok": true, "rule": rule}))
        }
        RuleCommands::List => {
            let rules = db.list_rules(tenant_id)?;
            print_json(&json!({"ok": true, "rules": rules}))
        }
        RuleCommands::Show { rule_id } => {
            let rule = db.get_rule(tenant_id, rule_id)?;
            let fingerprint = rule.fingerprint()?;
            print_json(&json!({"ok": true, "rule": rule, "fingerprint": fingerprint}))
        }
        RuleCommands::Update { rule_id, file } => {
            let document: RulePatchDocument = serde_json::from_str(&read_input(file)?)
                .map_err(|e| EngineError::Validation(format!("patch document: {}", e)))?;
            let rule = db.update_rule(tenant_id, rule_id, &document.into_patch()?)?;
            print_json(&json!({"ok": true, "rule": rule}))
        }
        RuleCommands::Delete { rule_id } => {
            db.delete_rule(tenant_id, rule_id)?;
            print_json(&json!({"ok": true, "deleted": rule_id}))
        }
        RuleCommands::Export { rule_id } => {
            let document = db.export_rule(tenant_id, rule_id)?;
            print_json(&document)
        }
        RuleCommands::Import { file } => {
            let document = RuleDocument::from_json(&read_input(file)?)?;
            let outcome = db.import_rule(tenant_id, document)?;
            print_json(&json!({"ok": true, "created": outcome.created, "rule": outcome.rule}))
        }
        RuleCommands::Enable { rule_id } => {
            let rule = db.set_rule_enabled(tenant_id, rule_id, true)?;
            print_json(&json!({"ok": true, "rule": rule}))
        }
        RuleCommands::Disable { rule_id } => {
            let rule = db.set_rule_enabled(tenant_id, rule_id, false)?;
            print_json(&json!({"ok": true, "rule": rule}))
        }
    }
}
