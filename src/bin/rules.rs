//! CLI tool for managing mock rules
//!
//! Usage:
//!   mockproxy-rules add <url> [options]
//!   mockproxy-rules list [--json]
//!   mockproxy-rules delete <id>
//!   mockproxy-rules enable <id>
//!   mockproxy-rules disable <id>

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mockproxy::{MatchType, MockResponse, MockRule, RuleStore};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// CLI tool for managing MockProxy rules
#[derive(Parser, Debug)]
#[command(name = "mockproxy-rules")]
#[command(author = "MockProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage mock rules for MockProxy")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/rules.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a new rule (lowest priority)
    Add {
        /// URL pattern (e.g., https://api.example.com/users)
        url: String,

        /// How the pattern is matched: exact, prefix or regex
        #[arg(short = 'm', long = "match", default_value = "prefix")]
        match_type: MatchType,

        /// Response status code
        #[arg(short = 's', long, default_value = "200")]
        status: u16,

        /// Response body
        #[arg(short = 'b', long, default_value = "")]
        body: String,

        /// Response header as Name:Value (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Delay before responding, in milliseconds
        #[arg(short = 'd', long, default_value = "0")]
        delay: u64,

        /// Display name
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Store the rule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List all rules in match order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a rule
    Delete {
        /// Rule id
        id: String,
    },

    /// Enable a rule
    Enable {
        /// Rule id
        id: String,
    },

    /// Disable a rule
    Disable {
        /// Rule id
        id: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize database
    let store = RuleStore::open(&args.db_path)?;

    match args.command {
        Commands::Add {
            url,
            match_type,
            status,
            body,
            headers,
            delay,
            name,
            disabled,
        } => {
            let rule = MockRule {
                id: String::new(),
                enabled: !disabled,
                name: name.unwrap_or_else(|| url.clone()),
                url_pattern: url,
                match_type,
                response: MockResponse {
                    status_code: status,
                    headers: parse_headers(&headers)?,
                    body,
                    delay_millis: delay,
                },
            };

            let rule = store.add(rule)?;

            println!("Added rule:");
            print_rule(&rule);
        }

        Commands::List { json } => {
            let rules = store.load_rules()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }

            if rules.is_empty() {
                println!("No rules found");
                return Ok(());
            }

            println!(
                "{:<38} {:<8} {:<7} {:<6} {:<7} {:<50}",
                "ID", "ENABLED", "MATCH", "STATUS", "DELAY", "URL"
            );
            println!("{}", "-".repeat(120));

            for rule in &rules {
                println!(
                    "{:<38} {:<8} {:<7} {:<6} {:<7} {:<50}",
                    rule.id,
                    if rule.enabled { "yes" } else { "no" },
                    rule.match_type,
                    rule.response.status_code,
                    format!("{}ms", rule.response.delay_millis),
                    rule.url_pattern
                );
            }

            println!("\nTotal: {} rule(s)", rules.len());
        }

        Commands::Delete { id } => {
            if store.delete(&id)? {
                println!("Deleted rule {}", id);
            } else {
                eprintln!("No rule found with id {}", id);
                std::process::exit(1);
            }
        }

        Commands::Enable { id } => set_enabled(&store, &id, true)?,

        Commands::Disable { id } => set_enabled(&store, &id, false)?,
    }

    Ok(())
}

fn set_enabled(store: &RuleStore, id: &str, enabled: bool) -> Result<()> {
    if store.set_enabled(id, enabled)? {
        println!("Rule {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    } else {
        eprintln!("No rule found with id {}", id);
        std::process::exit(1);
    }
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| anyhow!("Invalid header '{}', expected Name:Value", header))
        })
        .collect()
}

fn print_rule(rule: &MockRule) {
    println!("  ID:       {}", rule.id);
    println!("  Name:     {}", rule.name);
    println!("  URL:      {}", rule.url_pattern);
    println!("  Match:    {}", rule.match_type);
    println!("  Status:   {}", rule.response.status_code);
    println!("  Delay:    {}ms", rule.response.delay_millis);
    println!("  Enabled:  {}", rule.enabled);
    for (name, value) in &rule.response.headers {
        println!("  Header:   {}: {}", name, value);
    }
}
