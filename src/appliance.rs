//! Appliance CLI vocabulary used by the lifecycle controller and the results
//! collector, plus parsing of the few outputs the driver interprets.

use std::fmt;

use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::session::ApplianceSession;

/// Commands the driver issues against a test group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    ImportTestGroup { group: &'a str, file: &'a str },
    ListFreeInterfaces,
    BindInterface { group: &'a str, interface: &'a str },
    StartTestGroup { group: &'a str },
    StopTestGroup { group: &'a str },
    TestGroupState { group: &'a str },
    ExportStatistics { group: &'a str },
    DeleteTestGroup { group: &'a str },
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ImportTestGroup { group, file } => {
                write!(f, "cli importTestGroup //{group} {file}")
            }
            Command::ListFreeInterfaces => f.write_str("cli listInterfaces --free"),
            Command::BindInterface { group, interface } => {
                write!(f, "cli bindInterface //{group} {interface}")
            }
            Command::StartTestGroup { group } => write!(f, "cli startTestGroup //{group}"),
            Command::StopTestGroup { group } => write!(f, "cli stopTestGroup //{group}"),
            Command::TestGroupState { group } => write!(f, "cli showTestGroupState //{group}"),
            Command::ExportStatistics { group } => {
                write!(f, "cli exportTestGroupStatistics //{group}")
            }
            Command::DeleteTestGroup { group } => write!(f, "cli deleteTestGroup //{group}"),
        }
    }
}

/// Run `command` on `session`, rejecting outputs that report an error.
pub async fn execute(session: &mut dyn ApplianceSession, command: &Command<'_>) -> DriverResult<String> {
    let rendered = command.to_string();
    debug!(command = %rendered, "sending appliance command");
    let output = session.send_command(&rendered).await?;
    check_output(&rendered, &output)?;
    Ok(output)
}

fn check_output(command: &str, output: &str) -> DriverResult<()> {
    let rejected = output.lines().map(str::trim).find(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("error") || lower.starts_with("failed") || lower.contains("command not found")
    });
    match rejected {
        Some(line) => Err(DriverError::ApplianceCommand {
            command: command.to_string(),
            output: line.to_string(),
        }),
        None => Ok(()),
    }
}

/// Interface names from `listInterfaces --free` output, one per line.
pub fn parse_free_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Execution state of a test group as reported by the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Running,
    Finished,
    Unknown,
}

impl GroupState {
    pub fn parse(output: &str) -> Self {
        let lower = output.to_ascii_lowercase();
        if lower.contains("running") || lower.contains("starting") {
            GroupState::Running
        } else if ["stopped", "completed", "finished", "idle"]
            .iter()
            .any(|s| lower.contains(s))
        {
            GroupState::Finished
        } else {
            GroupState::Unknown
        }
    }
}
