//! Category-budgeted token accounting with trim policies (component F).

use std::collections::HashMap;

use crate::session::{Message, MessageCategory};

/// Coarse character/4 heuristic, matching the teacher's `count_tokens`
/// estimator in `llm_session.rs`. Swappable per spec section 4.F's
/// "estimator interface" — this crate ships only the default.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

pub struct CharDiv4Estimator;

impl TokenEstimator for CharDiv4Estimator {
    fn estimate(&self, text: &str) -> usize {
        (text.len() / 4).max(1)
    }
}

const TOOL_PLACEHOLDER_CONTENT: &str = "[earlier tool output omitted]";

fn is_tool_placeholder(message: &Message) -> bool {
    message.content == TOOL_PLACEHOLDER_CONTENT
}

fn category_fraction(category: MessageCategory) -> f64 {
    match category {
        MessageCategory::System => 0.10,
        MessageCategory::SystemOutput => 0.10,
        MessageCategory::Context => 0.20,
        MessageCategory::Dialog => 0.55,
        MessageCategory::ToolResult => 0.20,
    }
}

/// Per-category token-budgeted projection of a session. `admit` is
/// idempotent per message id: calling it again with a message already
/// tracked is a no-op, so callers can re-admit a session's full history on
/// every `get_formatted_messages` call without double counting.
pub struct ContextWindow {
    max_history_tokens: usize,
    uncategorized_budget_fraction: f64,
    shared_cw_max_tokens: Option<usize>,
    estimator: Box<dyn TokenEstimator>,
    active: HashMap<MessageCategory, Vec<Message>>,
    seen_ids: std::collections::HashSet<u64>,
    max_images: usize,
    images: Vec<String>,
}

impl std::fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWindow")
            .field("max_history_tokens", &self.max_history_tokens)
            .field("uncategorized_budget_fraction", &self.uncategorized_budget_fraction)
            .field("shared_cw_max_tokens", &self.shared_cw_max_tokens)
            .field("active", &self.active)
            .field("seen_ids", &self.seen_ids)
            .field("max_images", &self.max_images)
            .field("images", &self.images)
            .finish()
    }
}

impl ContextWindow {
    pub fn new(max_history_tokens: usize) -> Self {
        ContextWindow {
            max_history_tokens,
            uncategorized_budget_fraction: 0.05,
            shared_cw_max_tokens: None,
            estimator: Box::new(CharDiv4Estimator),
            active: HashMap::new(),
            seen_ids: std::collections::HashSet::new(),
            max_images: 8,
            images: Vec::new(),
        }
    }

    pub fn with_shared_clamp(mut self, clamp: usize) -> Self {
        self.shared_cw_max_tokens = Some(clamp);
        self
    }

    fn budget_for(&self, category: MessageCategory) -> usize {
        let total = self.shared_cw_max_tokens.unwrap_or(self.max_history_tokens);
        (total as f64 * category_fraction(category)) as usize
    }

    fn token_count(&self, message: &Message) -> usize {
        message.token_count.unwrap_or_else(|| self.estimator.estimate(&message.content))
    }

    fn category_tokens(&self, category: MessageCategory) -> usize {
        self.active
            .get(&category)
            .map(|messages| messages.iter().map(|m| self.token_count(m)).sum())
            .unwrap_or(0)
    }

    pub fn total_tokens(&self) -> usize {
        self.active.values().flatten().map(|m| self.token_count(m)).sum()
    }

    /// Admits `message` into its category's active list, then evicts from
    /// the head of that category (oldest-first) until within budget. SYSTEM
    /// is never evicted. TOOL_RESULT eviction collapses every evicted
    /// message into a single zero-cost `[earlier tool output omitted]`
    /// placeholder (tied to the first-evicted message's parent id) so
    /// repeated admits keep freeing real tokens instead of replacing one
    /// placeholder with an equally expensive one. DIALOG eviction removes
    /// the oldest user+assistant pair together.
    pub fn admit(&mut self, message: &Message) {
        if self.seen_ids.contains(&message.id) {
            return;
        }
        self.seen_ids.insert(message.id);

        let bucket = self.active.entry(message.category).or_default();
        bucket.push(message.clone());

        let budget = self.budget_for(message.category);
        match message.category {
            MessageCategory::System => {}
            MessageCategory::ToolResult => {
                while self.category_tokens(MessageCategory::ToolResult) > budget {
                    let bucket = self.active.entry(MessageCategory::ToolResult).or_default();
                    let has_placeholder = bucket.first().map(is_tool_placeholder).unwrap_or(false);
                    let evict_index = if has_placeholder { 1 } else { 0 };
                    if evict_index >= bucket.len() {
                        break;
                    }
                    let evicted = bucket.remove(evict_index);
                    if !has_placeholder {
                        let placeholder = Message {
                            content: TOOL_PLACEHOLDER_CONTENT.to_string(),
                            token_count: Some(0),
                            ..evicted
                        };
                        bucket.insert(0, placeholder);
                    }
                }
            }
            MessageCategory::Dialog => {
                while self.category_tokens(MessageCategory::Dialog) > budget {
                    let bucket = self.active.entry(MessageCategory::Dialog).or_default();
                    if bucket.len() < 2 {
                        break;
                    }
                    bucket.remove(0);
                    bucket.remove(0);
                }
            }
            MessageCategory::Context | MessageCategory::SystemOutput => {
                while self.category_tokens(message.category) > budget {
                    let bucket = self.active.entry(message.category).or_default();
                    if bucket.is_empty() {
                        break;
                    }
                    bucket.remove(0);
                }
            }
        }

        if self.total_tokens() > self.max_history_tokens {
            while self.total_tokens() > self.max_history_tokens {
                let bucket = self.active.entry(MessageCategory::Dialog).or_default();
                if bucket.len() < 2 {
                    break;
                }
                bucket.remove(0);
                bucket.remove(0);
            }
        }

        if message.content.contains("[image:") {
            self.images.push(message.content.clone());
            while self.images.len() > self.max_images {
                self.images.remove(0);
            }
        }
    }

    pub fn is_over_budget(&self) -> bool {
        self.total_tokens() > self.max_history_tokens
    }

    /// Returns the active projection in session order.
    pub fn active_messages(&self) -> Vec<Message> {
        let mut all: Vec<Message> = self.active.values().flatten().cloned().collect();
        all.sort_by_key(|m| m.id);
        all
    }

    pub fn uncategorized_budget(&self) -> usize {
        (self.max_history_tokens as f64 * self.uncategorized_budget_fraction) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::session::Role;

    fn msg(id: u64, category: MessageCategory, content: &str) -> Message {
        Message {
            id,
            role: Role::User,
            content: content.to_string(),
            category,
            timestamp: Utc::now(),
            agent_id: "a".to_string(),
            recipient_id: None,
            channel: None,
            metadata: Default::default(),
            token_count: None,
            parent_message_id: None,
        }
    }

    #[test]
    fn system_messages_are_never_evicted() {
        let mut cw = ContextWindow::new(40);
        cw.admit(&msg(1, MessageCategory::System, &"x".repeat(400)));
        cw.admit(&msg(2, MessageCategory::Dialog, &"y".repeat(400)));
        cw.admit(&msg(3, MessageCategory::Dialog, &"z".repeat(400)));
        let active = cw.active_messages();
        assert!(active.iter().any(|m| m.id == 1));
    }

    #[test]
    fn dialog_evicts_in_pairs() {
        let mut cw = ContextWindow::new(1000);
        for i in 1..=10u64 {
            cw.admit(&msg(i, MessageCategory::Dialog, &"word ".repeat(60)));
        }
        let dialog_count = cw.active_messages().iter().filter(|m| m.category == MessageCategory::Dialog).count();
        assert_eq!(dialog_count % 2, 0);
    }

    #[test]
    fn budget_never_exceeded_per_category_after_admit() {
        let mut cw = ContextWindow::new(2000);
        for i in 1..=50u64 {
            cw.admit(&msg(i, MessageCategory::ToolResult, &"data ".repeat(20)));
        }
        let budget = cw.budget_for(MessageCategory::ToolResult);
        assert!(cw.category_tokens(MessageCategory::ToolResult) <= budget || budget == 0);
    }
}
