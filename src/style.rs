//! Terminal styling for CLI output
//!
//! Uses crossterm for cross-platform terminal colors.

use crate::broker::Approval;
use crate::coordinator::TaskStatus;
use crate::priority::Priority;
use crate::registry::AgentStatus;
use crossterm::style::{StyledContent, Stylize};

/// Priority colors
/// - EMERGENCY/URGENT: Red/Orange
/// - HIGH: Yellow
/// - NORMAL/LOW: Default/Dim
pub fn priority_style(priority: Priority) -> StyledContent<String> {
    let label = priority.to_string();
    match priority {
        Priority::Emergency => label.red().bold(),
        Priority::Urgent => label.dark_yellow().bold(),
        Priority::High => label.yellow(),
        Priority::Normal => label.white(),
        Priority::Low => label.dark_grey(),
    }
}

pub fn task_status_style(status: TaskStatus) -> StyledContent<String> {
    let label = status.to_string();
    match status {
        TaskStatus::Pending => label.white(),
        TaskStatus::InProgress => label.yellow(),
        TaskStatus::Completed => label.green(),
        TaskStatus::Failed => label.red(),
    }
}

/// Status indicator (circle)
pub fn task_status_indicator(status: TaskStatus) -> StyledContent<&'static str> {
    match status {
        TaskStatus::Pending => "○".white(),
        TaskStatus::InProgress => "◐".yellow(),
        TaskStatus::Completed => "✓".green(),
        TaskStatus::Failed => "✗".red(),
    }
}

pub fn agent_status_style(status: AgentStatus) -> StyledContent<String> {
    let label = status.to_string();
    match status {
        AgentStatus::Idle => label.green(),
        AgentStatus::Busy => label.yellow(),
        AgentStatus::Error => label.red(),
        AgentStatus::Offline => label.dark_grey(),
    }
}

pub fn approval_style(approval: Approval) -> StyledContent<String> {
    let label = approval.as_str().to_string();
    match approval {
        Approval::Pending => label.yellow(),
        Approval::AutoApproved | Approval::Approved => label.green(),
        Approval::Rejected => label.red(),
    }
}

/// Count styling: zero is dim, anything else uses the warning color
pub fn count_warning(n: i64) -> StyledContent<String> {
    if n == 0 {
        n.to_string().dark_grey()
    } else {
        n.to_string().yellow()
    }
}

pub fn count_normal(n: i64) -> StyledContent<String> {
    n.to_string().white()
}

/// Section headers
pub fn header(text: &str) -> StyledContent<String> {
    text.to_string().bold()
}

/// Dim/muted text
pub fn dim(text: &str) -> StyledContent<String> {
    text.to_string().dark_grey()
}

pub fn success(text: &str) -> StyledContent<String> {
    text.to_string().green()
}

pub fn warning(text: &str) -> StyledContent<String> {
    text.to_string().yellow()
}

pub fn error(text: &str) -> StyledContent<String> {
    text.to_string().red()
}

/// Task, entry and message ids
pub fn id(id: &str) -> StyledContent<String> {
    id.to_string().cyan()
}

/// Unread messages stand out
pub fn unread(text: &str) -> StyledContent<String> {
    text.to_string().bold()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_colors() {
        for priority in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
            Priority::Emergency,
        ] {
            assert!(priority_style(priority).content().contains(priority.as_str().to_uppercase().as_str()));
        }
    }

    #[test]
    fn test_status_colors() {
        assert_eq!(task_status_style(TaskStatus::InProgress).content(), "in_progress");
        assert_eq!(*task_status_indicator(TaskStatus::Completed).content(), "✓");
        let _ = agent_status_style(AgentStatus::Offline);
        let _ = approval_style(Approval::Rejected);
    }
}
