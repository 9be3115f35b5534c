use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use console::style;
use hawkeye::config::{Config, SecurityConfig};
use hawkeye::security::{
    ActionSource, ConfirmationHandler, ExecutionContext, ExportFormat, FileOperation,
    StaticConfirmation, ToolCategory, UnifiedSecurityManager,
};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("HAWKEYE_GIT_SHA"),
    ", built ",
    env!("HAWKEYE_BUILD_TIME"),
    ")"
);

/// Security gate, audit trail and rollback ledger for the Hawkeye agent.
#[derive(Parser, Debug)]
#[command(name = "hawkeye", version = VERSION, about)]
struct Cli {
    /// Config file (defaults to $HAWKEYE_CONFIG, then ~/.hawkeye/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an action through the full security gate
    Check {
        #[arg(long)]
        tool: String,
        #[arg(long, default_value = "shell")]
        category: ToolCategory,
        #[arg(long)]
        action: String,
        /// Parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "user")]
        source: ActionSource,
        /// Answer every confirmation with yes
        #[arg(long, conflicts_with = "no")]
        yes: bool,
        /// Answer every confirmation with no
        #[arg(long)]
        no: bool,
        /// Print the audit log afterwards
        #[arg(long)]
        export: Option<ExportFormat>,
    },
    /// Scan text for injection signatures
    Scan { text: String },
    /// Neutralize shell substitutions and traversal sequences
    Sanitize { text: String },
    /// Validate a tool name
    Validate { name: String },
    /// Score a shell command
    Command { command: String },
    /// Check a filesystem access
    Path {
        path: String,
        #[arg(long, default_value = "read")]
        op: FileOperation,
    },
    /// Inspect or apply persisted rollback points
    Rollback {
        #[command(subcommand)]
        command: RollbackCommands,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum RollbackCommands {
    List,
    Show { id: String },
    Apply { id: String },
    Delete { id: String },
    Clear,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

/// Asks on the terminal; runs the blocking prompt off the async workers.
struct TerminalConfirmation;

#[async_trait]
impl ConfirmationHandler for TerminalConfirmation {
    async fn confirm(&self, context: &ExecutionContext) -> bool {
        let prompt = format!(
            "Allow {} ({}) to run `{}`?",
            context.tool_id,
            context.category,
            context.match_target()
        );
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await;
        match answer {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(e)) => {
                tracing::warn!("Confirmation prompt failed: {e}");
                false
            }
            Err(e) => {
                tracing::warn!("Confirmation task failed: {e}");
                false
            }
        }
    }
}

fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config
            .logging
            .level
            .parse()
            .unwrap_or(tracing::Level::INFO),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn verdict(allowed: bool) -> console::StyledObject<&'static str> {
    if allowed {
        style("ALLOWED").green().bold()
    } else {
        style("BLOCKED").red().bold()
    }
}

/// Rollback commands always work against the on-disk ledger.
fn persistent(security: &SecurityConfig) -> SecurityConfig {
    let mut security = security.clone();
    security.rollback.persist_rollback_points = true;
    security
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Check {
            tool,
            category,
            action,
            params,
            session,
            source,
            yes,
            no,
            export,
        } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            let handler: Arc<dyn ConfirmationHandler> = if yes {
                Arc::new(StaticConfirmation(true))
            } else if no {
                Arc::new(StaticConfirmation(false))
            } else {
                Arc::new(TerminalConfirmation)
            };
            gate.permission_manager().set_confirmation_handler(handler);

            let parameters: Map<String, Value> = params
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let mut context = ExecutionContext::new(tool, category, action)
                .with_parameters(parameters)
                .with_source(source);
            if let Some(session) = session {
                context = context.with_session(session);
            }

            let result = gate.check_security(&context).await;
            println!(
                "{} {}",
                verdict(result.allowed),
                result.reason.as_deref().unwrap_or_default()
            );
            if let Some(stage) = result.denied_by {
                println!("  {} {stage}", style("stage:").dim());
            }
            print_json(&result)?;

            if let Some(format) = export {
                println!("{}", gate.audit_logger().export(format)?);
            }
        }
        Commands::Scan { text } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            let result = gate.injection_detector().detect(&text);
            println!("{}", verdict(!result.detected));
            print_json(&result)?;
        }
        Commands::Sanitize { text } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            println!("{}", gate.injection_detector().sanitize(&text));
        }
        Commands::Validate { name } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            let result = gate.tool_validator().validate_name(&name);
            println!("{}", verdict(result.valid));
            for warning in &result.warnings {
                println!("  {} {warning}", style("warning:").yellow());
            }
            for error in &result.errors {
                println!("  {} {error}", style("error:").red());
            }
            if let Some(normalized) = &result.normalized_name {
                println!("  {} {normalized}", style("normalized:").dim());
            }
        }
        Commands::Command { command } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            let result = gate.check_command(&command);
            println!("{} risk={}", verdict(result.allowed), result.risk);
            print_json(&result)?;
        }
        Commands::Path { path, op } => {
            let gate = UnifiedSecurityManager::from_config(&config.security)?;
            let result = gate.check_path(&path, op);
            println!("{} risk={}", verdict(result.allowed), result.risk);
            print_json(&result)?;
        }
        Commands::Rollback { command } => {
            let gate = UnifiedSecurityManager::from_config(&persistent(&config.security))?;
            let rollback = gate.rollback_manager();
            match command {
                RollbackCommands::List => {
                    let points = rollback.list_rollback_points();
                    if points.is_empty() {
                        println!("No rollback points");
                    }
                    for point in points {
                        println!(
                            "{}  {}  {} ops  {}",
                            style(&point.id).cyan(),
                            point.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            point.operations.len(),
                            point.description
                        );
                    }
                }
                RollbackCommands::Show { id } => {
                    let point = rollback
                        .get_rollback_point(&id)
                        .with_context(|| format!("No rollback point {id}"))?;
                    print_json(&point)?;
                }
                RollbackCommands::Apply { id } => {
                    let result = gate.rollback(&id)?;
                    println!(
                        "{} {} operation(s) rolled back in {} ms",
                        verdict(result.success),
                        result.operations_rolled_back,
                        result.duration_ms
                    );
                    for failure in &result.failures {
                        println!(
                            "  {} {} {}: {}",
                            style("failed:").red(),
                            failure.op_type,
                            failure.path.display(),
                            failure.error
                        );
                    }
                }
                RollbackCommands::Delete { id } => {
                    if rollback.delete_rollback_point(&id)? {
                        println!("Deleted {id}");
                    } else {
                        anyhow::bail!("No rollback point {id}");
                    }
                }
                RollbackCommands::Clear => {
                    rollback.clear_rollback_points()?;
                    println!("Cleared all rollback points");
                }
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn params_parse() {
        assert_eq!(
            parse_param("command=ls -la").unwrap(),
            ("command".to_string(), "ls -la".to_string())
        );
        assert_eq!(parse_param("url=a=b").unwrap().1, "a=b");
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn check_arguments_parse() {
        let cli = Cli::try_parse_from([
            "hawkeye",
            "check",
            "--tool",
            "hawkeye__shell__run",
            "--action",
            "run",
            "--param",
            "command=sudo rm",
            "--no",
        ])
        .unwrap();
        match cli.command {
            Commands::Check {
                category, params, no, ..
            } => {
                assert_eq!(category, ToolCategory::Shell);
                assert_eq!(params.len(), 1);
                assert!(no);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn path_op_parses() {
        let cli = Cli::try_parse_from(["hawkeye", "path", "/etc/passwd", "--op", "write"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Path {
                op: FileOperation::Write,
                ..
            }
        ));
    }
}
