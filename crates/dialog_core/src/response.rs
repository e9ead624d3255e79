//! Assistant turns holding several alternative completions.

use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TreeError};
use crate::node::estimate_tokens;

/// Token and cost accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub price: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, price: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            price,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.price == 0.0
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(rhs.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(rhs.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
        self.price += rhs.price;
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

/// One alternative completion inside a [`ResponseSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseItem {
    pub id: Uuid,
    /// Name of the backend that produced (or is producing) this item.
    pub backend: String,
    pub content: String,
    pub tokens: u32,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub responding: bool,
    #[serde(default)]
    pub is_interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResponseItem {
    /// A placeholder for a completion that is about to stream in.
    pub fn pending(backend: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend: backend.into(),
            content: String::new(),
            tokens: 0,
            usage: Usage::default(),
            latency_ms: 0,
            responding: true,
            is_interrupted: false,
            error_message: None,
            finish_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn completed(backend: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            tokens: estimate_tokens(&content),
            content,
            responding: false,
            ..Self::pending(backend)
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// Finished without error and with text. Partial output of a failed turn
    /// stays on the item for display but never counts as an answer.
    pub fn is_usable(&self) -> bool {
        !self.responding && !self.is_interrupted && self.error_message.is_none() && self.has_content()
    }
}

/// Final data for a pending item once its turn has finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemCompletion {
    pub content: String,
    pub tokens: Option<u32>,
    pub usage: Usage,
    pub latency_ms: u64,
    pub finish_reason: Option<String>,
}

/// Side-by-side view of one alternative, produced by [`ResponseSet::compare_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseComparison {
    pub index: usize,
    pub item_id: Uuid,
    pub backend: String,
    pub content: String,
    pub tokens: u32,
    pub usage: Usage,
    pub latency_ms: u64,
    pub accepted: bool,
    pub responding: bool,
    pub error_message: Option<String>,
}

/// Outcome of removing an item, used by the tree to publish notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRemoval {
    pub index: usize,
    pub accepted_changed: bool,
}

/// Alternative completions for one assistant turn.
///
/// `accepted` distinguishes "never chosen" (`None`, resolves to the first item)
/// from an explicit choice (`Some(i)`), so both survive a save/load cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSet {
    items: Vec<ResponseItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accepted: Option<usize>,
}

impl ResponseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(item: ResponseItem) -> Self {
        Self {
            items: vec![item],
            accepted: None,
        }
    }

    pub fn items(&self) -> &[ResponseItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The explicitly accepted index, if any.
    pub fn explicit_accepted(&self) -> Option<usize> {
        self.accepted
    }

    /// The index whose content the node exposes.
    pub fn accepted_index(&self) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.accepted.filter(|&i| i < self.items.len()).unwrap_or(0))
    }

    pub fn accepted_item(&self) -> Option<&ResponseItem> {
        self.accepted_index().map(|i| &self.items[i])
    }

    pub fn position(&self, item_id: Uuid) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }

    pub fn item(&self, item_id: Uuid) -> Option<&ResponseItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub(crate) fn item_mut(&mut self, item_id: Uuid) -> Option<&mut ResponseItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn is_responding(&self) -> bool {
        self.items.iter().any(|item| item.responding)
    }

    pub fn is_available_in_context(&self) -> bool {
        self.accepted_item().is_some_and(ResponseItem::is_usable)
    }

    /// Returns `true` when the effective selection changed.
    pub fn accept(&mut self, index: usize) -> Result<bool> {
        if index >= self.items.len() {
            return Err(TreeError::AcceptedIndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        let before = self.accepted_index();
        self.accepted = Some(index);
        Ok(before != Some(index))
    }

    /// Appends an item without changing the selection. Returns its index.
    pub fn push(&mut self, item: ResponseItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Appends a responding placeholder and makes it the accepted alternative.
    pub fn begin_item(&mut self, backend: impl Into<String>) -> Uuid {
        let item = ResponseItem::pending(backend);
        let id = item.id;
        let index = self.push(item);
        self.accepted = Some(index);
        id
    }

    /// Regenerates `item_id` as a new alternative from the same backend.
    pub fn retry(&mut self, item_id: Uuid) -> Result<Uuid> {
        let backend = self
            .item(item_id)
            .map(|item| item.backend.clone())
            .ok_or(TreeError::ItemNotFound {
                node_id: Uuid::nil(),
                item_id,
            })?;
        Ok(self.begin_item(backend))
    }

    pub fn compare_all(&self) -> Vec<ResponseComparison> {
        let accepted = self.accepted_index();
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| ResponseComparison {
                index,
                item_id: item.id,
                backend: item.backend.clone(),
                content: item.content.clone(),
                tokens: item.tokens,
                usage: item.usage,
                latency_ms: item.latency_ms,
                accepted: accepted == Some(index),
                responding: item.responding,
                error_message: item.error_message.clone(),
            })
            .collect()
    }

    /// Removes one alternative. The last remaining item can never be removed;
    /// callers that want the turn gone delete the whole node instead.
    pub fn remove(&mut self, item_id: Uuid) -> Result<ItemRemoval> {
        let index = self.position(item_id).ok_or(TreeError::ItemNotFound {
            node_id: Uuid::nil(),
            item_id,
        })?;
        if self.items.len() == 1 {
            return Err(TreeError::LastResponseItem(item_id));
        }

        let before = self.accepted_index();
        self.items.remove(index);
        let remaining = self.items.len();
        self.accepted = match self.accepted {
            Some(current) if index < current => Some(current - 1),
            Some(current) if index == current => Some(current.min(remaining - 1)),
            other => other,
        };

        let accepted_changed = before == Some(index);
        Ok(ItemRemoval {
            index,
            accepted_changed,
        })
    }

    pub fn complete_item(&mut self, item_id: Uuid, completion: ItemCompletion) -> Result<()> {
        let item = self.item_mut(item_id).ok_or(TreeError::ItemNotFound {
            node_id: Uuid::nil(),
            item_id,
        })?;
        item.tokens = completion
            .tokens
            .unwrap_or_else(|| estimate_tokens(&completion.content));
        item.content = completion.content;
        item.usage = completion.usage;
        item.latency_ms = completion.latency_ms;
        item.finish_reason = completion.finish_reason;
        item.responding = false;
        item.is_interrupted = false;
        item.error_message = None;
        Ok(())
    }

    /// Clears partial output so a new attempt can stream into the same item.
    pub fn restart_item(&mut self, item_id: Uuid) -> Result<()> {
        let item = self.item_mut(item_id).ok_or(TreeError::ItemNotFound {
            node_id: Uuid::nil(),
            item_id,
        })?;
        item.content.clear();
        item.tokens = 0;
        item.responding = true;
        item.is_interrupted = false;
        item.error_message = None;
        Ok(())
    }

    pub fn fail_item(&mut self, item_id: Uuid, error: impl Into<String>, usage: Usage) -> Result<()> {
        let item = self.item_mut(item_id).ok_or(TreeError::ItemNotFound {
            node_id: Uuid::nil(),
            item_id,
        })?;
        item.responding = false;
        item.error_message = Some(error.into());
        item.usage = usage;
        Ok(())
    }

    /// Marks items that were still streaming as interrupted. Returns how many changed.
    pub(crate) fn settle_responding(&mut self, reason: &str) -> usize {
        let mut settled = 0;
        for item in self.items.iter_mut().filter(|item| item.responding) {
            item.responding = false;
            item.is_interrupted = true;
            item.error_message = Some(reason.to_string());
            settled += 1;
        }
        settled
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.items.is_empty() {
            return Err("response set has no items".to_string());
        }
        if let Some(index) = self.accepted {
            if index >= self.items.len() {
                return Err(format!(
                    "accepted index {index} out of range for {} items",
                    self.items.len()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(contents: &[&str]) -> ResponseSet {
        let mut set = ResponseSet::new();
        for content in contents {
            set.push(ResponseItem::completed("test", *content));
        }
        set
    }

    #[test]
    fn unset_acceptance_resolves_to_first_item() {
        let set = set_of(&["x", "y"]);
        assert_eq!(set.explicit_accepted(), None);
        assert_eq!(set.accepted_index(), Some(0));
        assert_eq!(set.accepted_item().unwrap().content, "x");
    }

    #[test]
    fn accept_rejects_out_of_range() {
        let mut set = set_of(&["x"]);
        let err = set.accept(3).unwrap_err();
        assert!(matches!(
            err,
            TreeError::AcceptedIndexOutOfRange { index: 3, len: 1 }
        ));
    }

    #[test]
    fn accept_reports_whether_selection_changed() {
        let mut set = set_of(&["x", "y"]);
        assert!(!set.accept(0).unwrap());
        assert_eq!(set.explicit_accepted(), Some(0));
        assert!(set.accept(1).unwrap());
    }

    #[test]
    fn removing_accepted_last_item_clamps_to_previous() {
        let mut set = set_of(&["x", "y"]);
        set.accept(1).unwrap();
        let y = set.items()[1].id;

        let removal = set.remove(y).unwrap();

        assert!(removal.accepted_changed);
        assert_eq!(set.explicit_accepted(), Some(0));
        assert_eq!(set.accepted_item().unwrap().content, "x");
        assert!(set.is_available_in_context());
    }

    #[test]
    fn removing_earlier_item_keeps_same_accepted_content() {
        let mut set = set_of(&["x", "y", "z"]);
        set.accept(2).unwrap();
        let x = set.items()[0].id;

        let removal = set.remove(x).unwrap();

        assert!(!removal.accepted_changed);
        assert_eq!(set.explicit_accepted(), Some(1));
        assert_eq!(set.accepted_item().unwrap().content, "z");
    }

    #[test]
    fn last_item_cannot_be_removed() {
        let mut set = set_of(&["only"]);
        let id = set.items()[0].id;
        assert!(matches!(set.remove(id), Err(TreeError::LastResponseItem(_))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn retry_appends_pending_item_from_same_backend() {
        let mut set = ResponseSet::with_item(ResponseItem::completed("gpt", "first"));
        let first = set.items()[0].id;

        let retried = set.retry(first).unwrap();

        assert_eq!(set.len(), 2);
        let item = set.item(retried).unwrap();
        assert_eq!(item.backend, "gpt");
        assert!(item.responding);
        assert_eq!(set.accepted_index(), Some(1));
        assert!(!set.is_available_in_context());
    }

    #[test]
    fn compare_all_marks_accepted_alternative() {
        let mut set = set_of(&["x", "y"]);
        set.accept(1).unwrap();
        let comparison = set.compare_all();
        assert_eq!(comparison.len(), 2);
        assert!(!comparison[0].accepted);
        assert!(comparison[1].accepted);
        assert_eq!(comparison[1].content, "y");
    }

    #[test]
    fn complete_item_clears_responding_flag() {
        let mut set = ResponseSet::new();
        let id = set.begin_item("gpt");
        set.complete_item(
            id,
            ItemCompletion {
                content: "done".to_string(),
                usage: Usage::new(10, 2, 0.01),
                ..Default::default()
            },
        )
        .unwrap();

        let item = set.item(id).unwrap();
        assert!(!item.responding);
        assert_eq!(item.tokens, 1);
        assert_eq!(item.usage.total_tokens, 12);
        assert!(set.is_available_in_context());
    }

    #[test]
    fn restart_discards_partial_output() {
        let mut set = ResponseSet::new();
        let id = set.begin_item("gpt");
        set.item_mut(id).unwrap().content.push_str("half an ans");

        set.restart_item(id).unwrap();

        let item = set.item(id).unwrap();
        assert!(item.content.is_empty());
        assert!(item.responding);
    }

    #[test]
    fn failed_item_with_partial_text_is_not_an_answer() {
        let mut set = ResponseSet::new();
        let id = set.begin_item("gpt");
        set.item_mut(id).unwrap().content.push_str("partial garb");

        set.fail_item(id, "reset", Usage::new(2, 1, 0.0)).unwrap();

        let item = set.item(id).unwrap();
        assert_eq!(item.content, "partial garb");
        assert!(!item.is_usable());
        assert!(!set.is_available_in_context());
    }

    #[test]
    fn interrupted_item_is_not_an_answer() {
        let mut item = ResponseItem::completed("gpt", "half");
        item.is_interrupted = true;
        assert!(!ResponseSet::with_item(item).is_available_in_context());
    }

    #[test]
    fn settle_responding_marks_streaming_items_interrupted() {
        let mut set = ResponseSet::with_item(ResponseItem::completed("gpt", "done"));
        let pending = set.begin_item("claude");

        assert_eq!(set.settle_responding("lost"), 1);

        let item = set.item(pending).unwrap();
        assert!(!item.responding);
        assert!(item.is_interrupted);
        assert_eq!(item.error_message.as_deref(), Some("lost"));
        assert!(!set.is_responding());
        assert_eq!(set.items()[0].error_message, None);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage::new(3, 4, 0.5);
        total += Usage::new(1, 1, 0.25);
        assert_eq!(total.total_tokens, 9);
        assert!((total.price - 0.75).abs() < f64::EPSILON);
    }
}
