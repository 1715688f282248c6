//! Subtasks
//!
//! Planned work units produced in the planning stage and consumed one at a
//! time by the implementation stage. The whole list is stored as a single
//! `subtasks.json` per plan.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses_files: Vec<String>,
    #[serde(default)]
    pub is_finished: bool,
    /// Implementation attempts spent on this subtask so far
    #[serde(default)]
    pub num_tries: usize,
}

impl Subtask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            uses_files: Vec::new(),
            is_finished: false,
            num_tries: 0,
        }
    }
}

/// The current subtask is the first unfinished one in insertion order.
/// There is at most one.
pub fn current_subtask(subtasks: &[Subtask]) -> Option<&Subtask> {
    subtasks.iter().find(|t| !t.is_finished)
}

pub fn current_subtask_mut(subtasks: &mut [Subtask]) -> Option<&mut Subtask> {
    subtasks.iter_mut().find(|t| !t.is_finished)
}

pub fn all_subtasks_finished(subtasks: &[Subtask]) -> bool {
    subtasks.iter().all(|t| t.is_finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_subtask_is_first_unfinished() {
        let mut tasks = vec![
            Subtask::new("A"),
            Subtask::new("B"),
            Subtask::new("C"),
        ];
        tasks[0].is_finished = true;

        assert_eq!(current_subtask(&tasks).unwrap().title, "B");
        assert!(!all_subtasks_finished(&tasks));

        tasks[1].is_finished = true;
        tasks[2].is_finished = true;
        assert!(current_subtask(&tasks).is_none());
        assert!(all_subtasks_finished(&tasks));
    }

    #[test]
    fn test_empty_list_is_finished() {
        assert!(all_subtasks_finished(&[]));
        assert!(current_subtask(&[]).is_none());
    }
}
