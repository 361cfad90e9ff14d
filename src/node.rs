//! Node identity discovery.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

/// Longest serial number the center accepts.
const MAX_SERIAL_LEN: usize = 48;

/// The configured serial number, or the one printed by `serial_cmd` when none is configured.
/// Returns an empty string when neither yields a value.
pub async fn resolve_serial_number(
    configured: &str,
    serial_cmd: Option<&str>,
    timeout: Duration,
) -> String {
    if !configured.trim().is_empty() {
        return configured.trim().to_string();
    }
    let Some(cmd) = serial_cmd else {
        warn!("No serial number configured and no discovery command set");
        return String::new();
    };

    let mut command = Command::new("sh");
    command
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(out)) if out.status.success() => {
            let serial = parse_serial_number(&String::from_utf8_lossy(&out.stdout));
            info!(serial_number = %serial, "Serial number discovered");
            serial
        }
        Ok(Ok(out)) => {
            warn!(
                command = cmd,
                code = out.status.code().unwrap_or(-1),
                "Serial number command failed"
            );
            String::new()
        }
        Ok(Err(e)) => {
            warn!(command = cmd, error = %e, "Failed to run serial number command");
            String::new()
        }
        Err(_) => {
            warn!(command = cmd, ?timeout, "Serial number command timed out");
            String::new()
        }
    }
}

/// Extract the serial from command output such as `Serial Number: AB 12 CD`: the text after
/// the first `:` with all whitespace removed, capped at 48 characters.
pub fn parse_serial_number(output: &str) -> String {
    let value = output
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(output);
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .take(MAX_SERIAL_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labelled_output() {
        assert_eq!(parse_serial_number("Serial Number: AB 12 CD\n"), "AB12CD");
        assert_eq!(parse_serial_number("  XYZ-1 \n"), "XYZ-1");
    }

    #[test]
    fn truncates_long_serials() {
        let long = format!("sn: {}", "A".repeat(60));
        assert_eq!(parse_serial_number(&long).len(), MAX_SERIAL_LEN);
    }

    #[tokio::test]
    async fn configured_value_wins() {
        let sn =
            resolve_serial_number(" SN1 ", Some("echo sn: other"), Duration::from_secs(5)).await;
        assert_eq!(sn, "SN1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discovers_from_command() {
        let sn = resolve_serial_number("", Some("echo 'Serial: EDGE 42'"), Duration::from_secs(5))
            .await;
        assert_eq!(sn, "EDGE42");
    }

    #[tokio::test]
    async fn nothing_configured_is_empty() {
        assert_eq!(resolve_serial_number("", None, Duration::from_secs(1)).await, "");
    }
}
