//! Tag-delimited action grammar: parsing (component D) and the result type
//! tool execution fills in (component E consumes this).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of action tags the model may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Execute,
    ExecuteCommand,
    ReadFile,
    WriteToFile,
    CreateFile,
    ApplyDiff,
    Search,
    PerplexitySearch,
    SpawnSubAgent,
    Delegate,
    StopSubAgent,
    ResumeSubAgent,
    FinishResponse,
    FinishTask,
}

impl ActionType {
    fn tag_name(self) -> &'static str {
        match self {
            ActionType::Execute => "execute",
            ActionType::ExecuteCommand => "execute_command",
            ActionType::ReadFile => "read_file",
            ActionType::WriteToFile => "write_to_file",
            ActionType::CreateFile => "create_file",
            ActionType::ApplyDiff => "apply_diff",
            ActionType::Search => "search",
            ActionType::PerplexitySearch => "perplexity_search",
            ActionType::SpawnSubAgent => "spawn_sub_agent",
            ActionType::Delegate => "delegate",
            ActionType::StopSubAgent => "stop_sub_agent",
            ActionType::ResumeSubAgent => "resume_sub_agent",
            ActionType::FinishResponse => "finish_response",
            ActionType::FinishTask => "finish_task",
        }
    }

    fn from_tag(tag: &str) -> Option<ActionType> {
        match tag {
            "execute" => Some(ActionType::Execute),
            "execute_command" => Some(ActionType::ExecuteCommand),
            "read_file" => Some(ActionType::ReadFile),
            "write_to_file" => Some(ActionType::WriteToFile),
            "create_file" => Some(ActionType::CreateFile),
            "apply_diff" => Some(ActionType::ApplyDiff),
            "search" => Some(ActionType::Search),
            "perplexity_search" => Some(ActionType::PerplexitySearch),
            "spawn_sub_agent" => Some(ActionType::SpawnSubAgent),
            "delegate" => Some(ActionType::Delegate),
            "stop_sub_agent" => Some(ActionType::StopSubAgent),
            "resume_sub_agent" => Some(ActionType::ResumeSubAgent),
            "finish_response" => Some(ActionType::FinishResponse),
            "finish_task" => Some(ActionType::FinishTask),
            _ => None,
        }
    }

    /// Whether this tag's payload is documented as a JSON object rather
    /// than raw text (spec section 6's payload schema table).
    fn expects_json(self) -> bool {
        matches!(
            self,
            ActionType::ReadFile
                | ActionType::WriteToFile
                | ActionType::CreateFile
                | ActionType::Search
                | ActionType::PerplexitySearch
                | ActionType::SpawnSubAgent
                | ActionType::Delegate
        )
    }

    const ALL: [ActionType; 14] = [
        ActionType::Execute,
        ActionType::ExecuteCommand,
        ActionType::ReadFile,
        ActionType::WriteToFile,
        ActionType::CreateFile,
        ActionType::ApplyDiff,
        ActionType::Search,
        ActionType::PerplexitySearch,
        ActionType::SpawnSubAgent,
        ActionType::Delegate,
        ActionType::StopSubAgent,
        ActionType::ResumeSubAgent,
        ActionType::FinishResponse,
        ActionType::FinishTask,
    ];
}

#[derive(Debug, Clone)]
pub struct Action {
    pub action_type: ActionType,
    /// Parsed payload: a JSON object for JSON-schema tags, or a single
    /// string value for raw-text tags. `None` means the payload failed to
    /// parse as JSON when JSON was required — execution fills in the
    /// resulting `status=error`, parsing itself never fails outright.
    pub payload: Option<Value>,
    pub raw_payload: String,
    pub raw_span: (usize, usize),
}

impl Action {
    pub fn tag_name(&self) -> &'static str {
        self.action_type.tag_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Error,
    Denied,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_name: String,
    pub status: ActionStatus,
    pub output: String,
    pub artifacts: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Scans assistant text left-to-right for balanced `<tag>payload</tag>`
/// pairs drawn from the closed [`ActionType`] set. Unknown tags are
/// ignored; malformed JSON payloads still produce an `Action` (with
/// `payload = None`) rather than failing the parse, so a partially-correct
/// model response never stalls the loop.
pub struct ActionParser {
    patterns: Vec<(ActionType, Regex)>,
}

impl Default for ActionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionParser {
    pub fn new() -> Self {
        let patterns = ActionType::ALL
            .iter()
            .map(|&action_type| {
                let tag = action_type.tag_name();
                let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
                (action_type, Regex::new(&pattern).expect("static pattern compiles"))
            })
            .collect();
        ActionParser { patterns }
    }

    pub fn parse(&self, text: &str) -> Vec<Action> {
        let mut matches: Vec<Action> = Vec::new();

        for (action_type, regex) in &self.patterns {
            for capture in regex.captures_iter(text) {
                let whole = capture.get(0).expect("group 0 always matches");
                let body = capture.get(1).map(|m| m.as_str()).unwrap_or("").trim().to_string();

                let payload = if action_type.expects_json() {
                    serde_json::from_str::<Value>(&body).ok()
                } else {
                    Some(Value::String(body.clone()))
                };

                matches.push(Action {
                    action_type: *action_type,
                    payload,
                    raw_payload: body,
                    raw_span: (whole.start(), whole.end()),
                });
            }
        }

        matches.sort_by_key(|action| action.raw_span.0);
        dedupe_overlaps(matches)
    }
}

/// Keeps the matches in document order while dropping any that overlap a
/// previously accepted span, matching "non-overlapping" scanning.
fn dedupe_overlaps(matches: Vec<Action>) -> Vec<Action> {
    let mut accepted: Vec<Action> = Vec::with_capacity(matches.len());
    let mut cursor = 0usize;
    for action in matches {
        if action.raw_span.0 >= cursor {
            cursor = action.raw_span.1;
            accepted.push(action);
        }
    }
    accepted
}

/// Extracts the machine-readable finish status embedded in `finish_task`
/// tool output, e.g. `"done [FINISH_STATUS:pending_review]"`.
pub fn extract_finish_status(tool_output: &str) -> Option<String> {
    let re = Regex::new(r"\[FINISH_STATUS:(\w+)\]").expect("static pattern compiles");
    re.captures(tool_output).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_action_with_surrounding_prose() {
        let parser = ActionParser::new();
        let text = "I will update the file. <apply_diff>--- a/x.txt\n+++ b/x.txt\n@@\n-foo\n+bar</apply_diff>";
        let actions = parser.parse(text);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::ApplyDiff);
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let parser = ActionParser::new();
        let actions = parser.parse("<thinking>not a real action</thinking>");
        assert!(actions.is_empty());
    }

    #[test]
    fn malformed_json_payload_still_produces_an_action() {
        let parser = ActionParser::new();
        let actions = parser.parse("<read_file>{not valid json</read_file>");
        assert_eq!(actions.len(), 1);
        assert!(actions[0].payload.is_none());
    }

    #[test]
    fn multiple_actions_are_returned_in_document_order() {
        let parser = ActionParser::new();
        let text = "<create_file>{\"path\":\"a.txt\",\"content\":\"x\"}</create_file> then <execute_command>ls</execute_command>";
        let actions = parser.parse(text);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, ActionType::CreateFile);
        assert_eq!(actions[1].action_type, ActionType::ExecuteCommand);
    }

    #[test]
    fn finish_status_marker_is_extracted() {
        assert_eq!(extract_finish_status("summary text [FINISH_STATUS:pending_review]"), Some("pending_review".to_string()));
        assert_eq!(extract_finish_status("no marker here"), None);
    }
}
