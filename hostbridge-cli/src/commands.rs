//! Command execution.

use crate::Commands;
use colored::Colorize;
use hostbridge_client::Client;
use hostbridge_protocol::ReloadResult;
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => {
            let info = client.info().await?;
            Ok(format!(
                "{} {} (protocol v{})\n{}: {}",
                info.server_name.cyan(),
                info.server_version,
                info.protocol_version,
                "Commands".bold(),
                info.commands.join(", ")
            ))
        }

        Commands::Query { target } => {
            let state = client.query_state(target.as_deref()).await?;
            Ok(format_json(&state))
        }

        Commands::Mutate {
            target,
            action,
            args,
        } => {
            let args = args.as_deref().map(parse_json_arg).transpose()?;
            let result = client.apply_mutation(&target, &action, args).await?;
            Ok(format!(
                "{} {} on {}\n{}",
                "Applied".green(),
                action.cyan(),
                target.cyan(),
                format_json(&result)
            ))
        }

        Commands::Reload => {
            let summary = client.trigger_reload().await?;
            let headline = match summary.result {
                ReloadResult::NoChanges => "Reload completed with no changes".yellow(),
                _ => "Reload completed".green(),
            };
            let mut output = format!("{} in {} ms", headline, summary.duration_ms);
            for d in &summary.diagnostics {
                output.push_str(&format!(
                    "\n  [{:?}] {}: {}",
                    d.verbosity,
                    d.category.dimmed(),
                    d.message
                ));
            }
            Ok(output)
        }

        Commands::Status => {
            let status = client.reload_status().await?;
            let state = if status.in_progress {
                status.state.yellow()
            } else {
                status.state.green()
            };
            let mut output = format!("{}: {}", "Reload".bold(), state);
            if let Some(result) = status.last_result {
                output.push_str(&format!("\n{}: {}", "Last result".bold(), result));
            }
            if !status.message.is_empty() {
                output.push_str(&format!("\n{}", status.message));
            }
            Ok(output)
        }

        Commands::Raw { kind, payload } => {
            let payload = parse_json_arg(&payload)?;
            let response = client.raw(&kind, payload).await?;
            let label = if response.is_ok() {
                "OK".green()
            } else {
                "FAILED".red()
            };
            let body = serde_json::to_value(&response)?;
            Ok(format!("{}\n{}", label, format_json(&body)))
        }
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_inline_json() {
        assert_eq!(
            parse_json_arg(r#"{"text": "Hi"}"#).unwrap(),
            json!({ "text": "Hi" })
        );
        assert!(parse_json_arg("{not json").is_err());
    }

    #[test]
    fn test_parse_json_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(parse_json_arg(&arg).unwrap(), json!([1, 2, 3]));
    }
}
