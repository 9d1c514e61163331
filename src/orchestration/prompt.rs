//! Prompt rendering for the implementer and reviewer roles.

use std::path::Path;

use crate::core::task::Task;

/// Render the implementer prompt for one attempt.
///
/// `feedback` is the previous reviewer's reason when this attempt is a
/// revision.
pub fn implementer_prompt(
    task: &Task,
    attempt: u32,
    max_attempts: u32,
    workspace: &Path,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are implementing task {id}: {title}\n\
         Attempt {attempt} of {max_attempts}.\n\
         Work only inside the directory {dir}. Do not commit; your changes are committed for you.\n\n\
         ## Task\n{description}\n",
        id = task.id,
        title = task.title,
        attempt = attempt,
        max_attempts = max_attempts,
        dir = workspace.display(),
        description = non_empty(&task.description, "(no description)"),
    );

    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        prompt.push_str("\n## Reviewer feedback on the previous attempt\n");
        prompt.push_str(feedback.trim());
        prompt.push('\n');
        prompt.push_str("\nAddress every point above before finishing.\n");
    }

    prompt
}

/// Render the reviewer prompt for one attempt's diff.
pub fn reviewer_prompt(task: &Task, attempt: u32, diff: &str) -> String {
    format!(
        "You are reviewing attempt {attempt} of task {id}: {title}\n\n\
         ## Acceptance criteria\n{description}\n\n\
         ## Changes\n```diff\n{diff}\n```\n\n\
         Explain any problems you find. Then end your reply with exactly one line \
         containing only the verdict:\n\
         APPROVED\n\
         or\n\
         REVISION_REQUIRED\n",
        attempt = attempt,
        id = task.id,
        title = task.title,
        description = non_empty(&task.description, "(no description)"),
        diff = non_empty(diff, "(no changes)"),
    )
}

fn non_empty<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    if text.trim().is_empty() {
        fallback
    } else {
        text
    }
}
