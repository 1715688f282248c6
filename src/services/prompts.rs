//! Prompt Assembly
//!
//! Templates and builders for the model calls the core makes. Wording here
//! is intentionally minimal; deployments tune it through configuration, and
//! the pipelines only depend on the control tokens.

use crate::models::Subtask;

/// Wrapper applied to every user prompt in the planner conversation.
pub fn wrapped_prompt(prompt: &str) -> String {
    format!(
        "## User prompt\n\n{}\n\n\
         Respond in markdown. Wrap any file you write in \
         <PlandexBlock lang=\"...\" path=\"...\">...</PlandexBlock> tags, list moves, \
         removals, and resets under '### Move Files', '### Remove Files', and \
         '### Reset Changes' sections closed with <EndPlandexFileOps/>, and emit \
         <PlandexFinish/> when the response is complete.",
        prompt
    )
}

/// Prompt for continuing the plan without new user input.
pub const USER_CONTINUE_PROMPT: &str =
    "Continue the plan from where the last response left off.";

/// Prompt for the next auto-continue iteration.
pub const AUTO_CONTINUE_PROMPT: &str =
    "Continue the plan. Work on the current task and say when it has been completed.";

/// Suffix for debugging a failing command.
pub const DEBUG_PROMPT_SUFFIX: &str =
    "\n\nThe command above failed. Diagnose the failure and fix it.";

/// Suffix for debugging a failed apply.
pub const APPLY_DEBUG_PROMPT_SUFFIX: &str =
    "\n\nApplying the plan failed with the output above. Diagnose and fix it.";

/// Preamble for follow-up prompts on an existing plan.
pub const FOLLOW_UP_CLASSIFIER_PREAMBLE: &str =
    "This is a follow-up to an existing plan. First decide whether the current \
     context still fits: if the follow-up changes direction, say 'clear all context' \
     or 'decide what context I need' before planning.";

/// Notice appended when the user chose to skip generating files.
pub fn skipped_paths_prompt(paths: impl Iterator<Item = String>) -> String {
    let mut out = String::from(
        "\n\nThe user chose to skip writing these files; do not generate them again:\n",
    );
    for path in paths {
        out.push_str(&format!("- {}\n", path));
    }
    out
}

/// Prompt after the user skipped a missing file mid-stream.
pub fn skip_missing_file_prompt(path: &str) -> String {
    format!(
        "The file `{}` was skipped. Continue the response from after that file, \
         without writing it.",
        path
    )
}

/// Prompt after the user allowed overwriting or loading a missing file.
pub const MISSING_FILE_CONTINUE_PROMPT: &str =
    "Continue the response from exactly where it left off.";

/// System prompt asking the builder to validate a proposed update.
#[allow(clippy::too_many_arguments)]
pub fn validation_replacements_prompt(
    path: &str,
    original_with_line_nums: &str,
    proposed_with_line_nums: &str,
    desc: &str,
    diff: &str,
    syntax_errors: &[String],
    problems: &[String],
) -> String {
    let mut prompt = format!(
        "You are verifying a proposed update to `{}`.\n\n\
         ## Original (with pdx line numbers)\n\n{}\n\n\
         ## Proposed update (with pdx line numbers)\n\n{}\n\n\
         ## Change description\n\n{}\n\n\
         ## Diff\n\n{}\n",
        path, original_with_line_nums, proposed_with_line_nums, desc, diff
    );

    if !syntax_errors.is_empty() {
        prompt.push_str("\n## Syntax errors in the current result\n\n");
        for err in syntax_errors {
            prompt.push_str(&format!("- {}\n", err));
        }
    }
    if !problems.is_empty() {
        prompt.push_str("\n## Problems found in earlier attempts\n\n");
        for problem in problems {
            prompt.push_str(&format!("- {}\n", problem));
        }
    }

    prompt.push_str(
        "\nIf the update is correct, reply with <PlandexCorrect/>. Otherwise reply \
         with <PlandexIncorrect/>, explain the problems inside \
         <PlandexComments>...</PlandexComments>, then list fixes as \
         <PlandexReplacements><Replacement><Old>...</Old><New>...</New></Replacement>\
         </PlandexReplacements>. Every <Old> block must quote lines from the \
         original including their pdx-N prefixes; a multi-line <Old> must carry \
         the prefix on its last line too. Finish with <PlandexFinish/>.",
    );

    prompt
}

/// System prompt for the whole-file fallback.
pub fn whole_file_prompt(
    path: &str,
    original_with_line_nums: &str,
    proposed_with_line_nums: &str,
    desc: &str,
    comments: &str,
) -> String {
    let mut prompt = format!(
        "Apply the proposed update to `{}` and return the complete corrected file.\n\n\
         ## Original (with pdx line numbers)\n\n{}\n\n\
         ## Proposed update (with pdx line numbers)\n\n{}\n\n\
         ## Change description\n\n{}\n",
        path, original_with_line_nums, proposed_with_line_nums, desc
    );
    if !comments.is_empty() {
        prompt.push_str(&format!("\n## Known problems\n\n{}\n", comments));
    }
    prompt.push_str(
        "\nReturn the full file, without line number prefixes, inside \
         <PlandexWholeFile>...</PlandexWholeFile>.",
    );
    prompt
}

/// Prompt for the commit-message / description call.
pub fn describe_prompt(reply: &str) -> String {
    format!(
        "Summarize the following assistant response. Reply with JSON: \
         {{\"commitMsg\": \"...\", \"wroteFiles\": true|false}}.\n\n{}",
        reply
    )
}

/// Prompt for the exec-status classifier.
pub fn exec_status_prompt(
    user_prompt: &str,
    subtask: &str,
    current_message: &str,
    previous_messages: &[String],
) -> String {
    let mut prompt = format!(
        "The user asked:\n\n{}\n\n\
         The current task is:\n\n{}\n\n",
        user_prompt, subtask
    );
    if !previous_messages.is_empty() {
        prompt.push_str("Earlier attempts at this task:\n\n");
        for msg in previous_messages {
            prompt.push_str(&format!("---\n{}\n", msg));
        }
    }
    prompt.push_str(&format!(
        "The latest response is:\n\n{}\n\n\
         Did the latest response finish the current task? Reply with JSON: \
         {{\"subtaskFinished\": true|false}}.",
        current_message
    ));
    prompt
}

/// Prompt for naming a draft plan.
pub fn plan_name_prompt(user_prompt: &str) -> String {
    format!(
        "Generate a short (2-8 word) name for a coding plan based on this prompt. \
         Reply with the name only.\n\n{}",
        user_prompt
    )
}

/// Prompt for the rolling conversation summary.
pub fn summarize_prompt(previous_summary: &str, messages: &str) -> String {
    let mut prompt = String::from(
        "Summarize the conversation so far for use as context in later requests. \
         Keep decisions, file paths, and task status; drop pleasantries.\n\n",
    );
    if !previous_summary.is_empty() {
        prompt.push_str(&format!("## Previous summary\n\n{}\n\n", previous_summary));
    }
    prompt.push_str(&format!("## New messages\n\n{}", messages));
    prompt
}

/// Render the current task list for the implementation prompt.
pub fn subtasks_prompt(subtasks: &[Subtask], current: Option<&Subtask>) -> String {
    if subtasks.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n## Task list\n\n");
    for (i, task) in subtasks.iter().enumerate() {
        let marker = if task.is_finished { "x" } else { " " };
        out.push_str(&format!("{}. [{}] {}\n", i + 1, marker, task.title));
    }
    if let Some(current) = current {
        out.push_str(&format!(
            "\nThe current task is **{}**. When it is done, say \"**{}** has been completed\".\n",
            current.title, current.title
        ));
    }
    out
}

/// Marker sentence scanned for in implementation replies.
pub fn subtask_completion_marker(title: &str) -> String {
    format!("**{}** has been completed", title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_prompt_carries_control_tokens() {
        let p = wrapped_prompt("add a main function");
        assert!(p.contains("add a main function"));
        assert!(p.contains("<PlandexFinish/>"));
        assert!(p.contains("<EndPlandexFileOps/>"));
    }

    #[test]
    fn test_validation_prompt_mentions_pdx_prefixes() {
        let p = validation_replacements_prompt(
            "main.rs",
            "pdx-1: fn main() {}",
            "pdx-1: fn main() { run() }",
            "call run",
            "- fn main() {}\n+ fn main() { run() }",
            &[],
            &[],
        );
        assert!(p.contains("<PlandexCorrect/>"));
        assert!(p.contains("pdx-N"));
    }

    #[test]
    fn test_subtasks_prompt_marks_current() {
        let mut tasks = vec![Subtask::new("A"), Subtask::new("B")];
        tasks[0].is_finished = true;
        let current = tasks[1].clone();
        let p = subtasks_prompt(&tasks, Some(&current));
        assert!(p.contains("1. [x] A"));
        assert!(p.contains("2. [ ] B"));
        assert!(p.contains("**B** has been completed"));
    }
}
