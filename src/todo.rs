//! Work items and goal decomposition.
//!
//! [`TodoList`] owns the items of one loop and enforces their status rules:
//! items only move forward, and cancelled items stay in the list for audit.
//! [`TodoPlanner`] breaks a free-text goal into a structured list of
//! [`TodoItem`]s using keyword heuristics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TodoStatus::Completed | TodoStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub status: TodoStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub finding_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TodoItem {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            priority,
            status: TodoStatus::Pending,
            depends_on: Vec::new(),
            finding_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depending_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.depends_on.extend(ids);
        self
    }
}

/// Items owned by one loop, in creation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item; an item whose id is already present is ignored.
    pub fn push(&mut self, item: TodoItem) -> bool {
        if self.get(&item.id).is_some() {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = TodoItem>) {
        for item in items {
            self.push(item);
        }
    }

    pub fn get(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|t| t.id == id)
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn dependencies_met(&self, item: &TodoItem) -> bool {
        item.depends_on.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|d| d.status == TodoStatus::Completed)
        })
    }

    /// Pending items whose dependencies are all completed, highest priority
    /// first, then creation order.
    pub fn ready(&self) -> Vec<TodoItem> {
        let mut ready: Vec<TodoItem> = self
            .items
            .iter()
            .filter(|t| t.status == TodoStatus::Pending && self.dependencies_met(t))
            .cloned()
            .collect();
        ready.sort_by_key(|t| t.priority);
        ready
    }

    /// Items that are neither completed nor cancelled.
    pub fn unresolved(&self) -> usize {
        self.items.iter().filter(|t| !t.status.is_terminal()).count()
    }

    pub fn count(&self, status: TodoStatus) -> usize {
        self.items.iter().filter(|t| t.status == status).count()
    }

    /// Moves an item forward. Terminal items never change again.
    pub fn set_status(&mut self, id: &str, status: TodoStatus) -> bool {
        let Some(item) = self.items.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if item.status.is_terminal() || item.status == status {
            return false;
        }
        if item.status == TodoStatus::InProgress && status == TodoStatus::Pending {
            return false;
        }
        item.status = status;
        true
    }

    /// Puts an in-progress item back to pending so it can be dispatched again.
    pub fn requeue(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|t| t.id == id) {
            Some(item) if item.status == TodoStatus::InProgress => {
                item.status = TodoStatus::Pending;
                true
            }
            _ => false,
        }
    }

    pub fn attach_findings(&mut self, id: &str, finding_ids: impl IntoIterator<Item = String>) {
        if let Some(item) = self.items.iter_mut().find(|t| t.id == id) {
            for fid in finding_ids {
                if !item.finding_ids.contains(&fid) {
                    item.finding_ids.push(fid);
                }
            }
        }
    }

    /// Replaces `previous` with `current` in every item's finding ids. An
    /// item that already holds `current` just drops `previous`.
    pub fn repoint_finding(&mut self, previous: &str, current: &str) {
        for item in &mut self.items {
            let Some(pos) = item.finding_ids.iter().position(|f| f == previous) else {
                continue;
            };
            if item.finding_ids.iter().any(|f| f == current) {
                item.finding_ids.remove(pos);
            } else {
                item.finding_ids[pos] = current.to_string();
            }
        }
    }
}

/// Breaks a goal into todo items.
pub struct TodoPlanner;

impl TodoPlanner {
    /// Explicit list markers win; otherwise the goal is split on
    /// conjunctions; a single task becomes plan / do / verify, each step
    /// depending on the previous one.
    pub fn plan(goal: &str) -> Vec<TodoItem> {
        let explicit = split_explicit_list(goal);
        if explicit.len() >= 2 {
            return Self::from_clauses(explicit);
        }

        let clauses = split_on_conjunctions(goal);
        if clauses.len() >= 2 {
            return Self::from_clauses(clauses);
        }

        let desc = capitalize_first(goal.trim());
        if desc.is_empty() {
            return Vec::new();
        }
        let plan = TodoItem::new(format!("Plan approach for: {desc}"), Priority::High);
        let work = TodoItem::new(desc.clone(), infer_priority(&desc))
            .depending_on([plan.id.clone()]);
        let verify = TodoItem::new("Verify changes and run tests", Priority::Medium)
            .depending_on([work.id.clone()]);
        vec![plan, work, verify]
    }

    /// A single todo with a priority inferred from its wording.
    pub fn item(description: &str) -> TodoItem {
        let desc = capitalize_first(description.trim());
        let priority = infer_priority(&desc);
        TodoItem::new(desc, priority)
    }

    fn from_clauses(clauses: Vec<String>) -> Vec<TodoItem> {
        clauses
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .map(|c| {
                let priority = infer_priority(&c);
                TodoItem::new(capitalize_first(&c), priority)
            })
            .collect()
    }
}

/// Splits text on explicit list markers: "1.", "2)", "-", "*".
fn split_explicit_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if let Some(rest) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            {
                return Some(rest.to_string());
            }
            if trimmed.len() > 2 && trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                let pos = trimmed.find(['.', ')'])?;
                let after = trimmed[pos + 1..].trim();
                if !after.is_empty() {
                    return Some(after.to_string());
                }
            }
            None
        })
        .collect()
}

/// Splits a sentence on "and", "then" and ", then".
fn split_on_conjunctions(text: &str) -> Vec<String> {
    let delimiters = [", then ", " and then ", " then ", " and "];

    let mut parts = vec![text.to_string()];
    for delim in delimiters {
        let mut next = Vec::new();
        for part in &parts {
            let lower = part.to_lowercase();
            match lower.find(delim) {
                Some(pos) if lower.len() == part.len() => {
                    let left = part[..pos].trim();
                    let right = part[pos + delim.len()..].trim();
                    if !left.is_empty() {
                        next.push(left.to_string());
                    }
                    if !right.is_empty() {
                        next.push(right.to_string());
                    }
                }
                _ => next.push(part.clone()),
            }
        }
        parts = next;
    }
    parts
}

fn infer_priority(text: &str) -> Priority {
    let lower = text.to_lowercase();

    let high_keywords = [
        "critical", "urgent", "block", "break", "crash", "security", "fix", "vulnerab",
    ];
    let low_keywords = ["doc", "readme", "comment", "format", "style", "typo", "rename"];

    if high_keywords.iter().any(|kw| lower.contains(kw)) {
        return Priority::High;
    }
    if low_keywords.iter().any(|kw| lower.contains(kw)) {
        return Priority::Low;
    }
    Priority::Medium
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- planner ---

    #[test]
    fn plan_numbered_list() {
        let items = TodoPlanner::plan("1. Write the model\n2. Add tests\n3. Update docs");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].description, "Write the model");
        assert_eq!(items[2].priority, Priority::Low);
        assert!(items.iter().all(|t| t.depends_on.is_empty()));
    }

    #[test]
    fn plan_bullets() {
        let items = TodoPlanner::plan("- Create user table\n- Fix the login crash");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].priority, Priority::High);
    }

    #[test]
    fn plan_conjunctions() {
        let items = TodoPlanner::plan("create the database, then add the API layer");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "Create the database");
        assert_eq!(items[1].description, "Add the API layer");
    }

    #[test]
    fn plan_single_task_chains_dependencies() {
        let items = TodoPlanner::plan("implement user authentication");
        assert_eq!(items.len(), 3);
        assert!(items[0].description.starts_with("Plan approach for:"));
        assert_eq!(items[1].depends_on, vec![items[0].id.clone()]);
        assert_eq!(items[2].depends_on, vec![items[1].id.clone()]);
    }

    #[test]
    fn plan_empty_goal_is_empty() {
        assert!(TodoPlanner::plan("   ").is_empty());
    }

    #[test]
    fn infer_priority_levels() {
        assert_eq!(infer_priority("critical security issue"), Priority::High);
        assert_eq!(infer_priority("update the documentation"), Priority::Low);
        assert_eq!(infer_priority("implement new feature"), Priority::Medium);
    }

    #[test]
    fn split_no_list() {
        assert!(split_explicit_list("implement a login page").is_empty());
        assert_eq!(split_on_conjunctions("implement user authentication").len(), 1);
    }

    #[test]
    fn capitalize_first_handles_empty() {
        assert_eq!(capitalize_first("hello"), "Hello");
        assert_eq!(capitalize_first(""), "");
    }

    // --- list ---

    #[test]
    fn ready_respects_dependencies_and_priority() {
        let mut list = TodoList::new();
        let a = TodoItem::new("low task", Priority::Low).with_id("a");
        let b = TodoItem::new("high task", Priority::High).with_id("b");
        let c = TodoItem::new("after a", Priority::High)
            .with_id("c")
            .depending_on(["a".to_string()]);
        list.extend([a, b, c]);

        let ready: Vec<String> = list.ready().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["b", "a"]);

        list.set_status("a", TodoStatus::Completed);
        let ready: Vec<String> = list.ready().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn terminal_status_is_final_and_cancelled_items_are_kept() {
        let mut list = TodoList::new();
        list.push(TodoItem::new("x", Priority::Medium).with_id("x"));
        assert!(list.set_status("x", TodoStatus::InProgress));
        assert!(!list.set_status("x", TodoStatus::Pending));
        assert!(list.set_status("x", TodoStatus::Cancelled));
        assert!(!list.set_status("x", TodoStatus::Completed));

        assert_eq!(list.len(), 1);
        assert_eq!(list.count(TodoStatus::Cancelled), 1);
        assert_eq!(list.unresolved(), 0);
    }

    #[test]
    fn requeue_only_from_in_progress() {
        let mut list = TodoList::new();
        list.push(TodoItem::new("x", Priority::Medium).with_id("x"));
        assert!(!list.requeue("x"));
        list.set_status("x", TodoStatus::InProgress);
        assert!(list.requeue("x"));
        assert_eq!(list.ready().len(), 1);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let mut list = TodoList::new();
        assert!(list.push(TodoItem::new("x", Priority::Medium).with_id("x")));
        assert!(!list.push(TodoItem::new("y", Priority::Medium).with_id("x")));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn repoint_finding_swaps_or_drops_stale_ids() {
        let mut list = TodoList::new();
        list.push(TodoItem::new("a", Priority::High).with_id("a"));
        list.push(TodoItem::new("b", Priority::High).with_id("b"));
        list.attach_findings("a", ["old".to_string(), "f9".to_string()]);
        list.attach_findings("b", ["old".to_string(), "new".to_string()]);

        list.repoint_finding("old", "new");
        assert_eq!(list.get("a").unwrap().finding_ids, vec!["new", "f9"]);
        assert_eq!(list.get("b").unwrap().finding_ids, vec!["new"]);
    }

    #[test]
    fn attach_findings_dedupes() {
        let mut list = TodoList::new();
        list.push(TodoItem::new("x", Priority::Medium).with_id("x"));
        list.attach_findings("x", ["f1".to_string(), "f1".to_string(), "f2".to_string()]);
        assert_eq!(list.get("x").unwrap().finding_ids, vec!["f1", "f2"]);
    }
}
