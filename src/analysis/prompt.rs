//! The fixed analysis prompt.

use crate::scheduler::job::{AnalysisFocus, AnalysisParams};
use crate::storage::RepoSnapshot;

/// System prompt for repository analysis.
pub const SYSTEM_PROMPT: &str =
    "You are an AI assistant specialized in analyzing code repositories. \
     You answer with a single JSON object and nothing else.";

fn focus_instruction(focus: AnalysisFocus) -> &'static str {
    match focus {
        AnalysisFocus::Complexity => {
            "- **complexity**: identify overly complex functions or areas needing refactoring."
        }
        AnalysisFocus::Security => "- **security**: highlight potential vulnerabilities.",
        AnalysisFocus::BestPractices => {
            "- **best_practices**: suggest improvements based on coding standards."
        }
        AnalysisFocus::Documentation => {
            "- **documentation**: identify missing or inadequate documentation."
        }
    }
}

/// Focus areas of normalized parameters; all of them when none are listed.
pub fn focus_areas(params: &AnalysisParams) -> Vec<AnalysisFocus> {
    if params.focus.is_empty() {
        AnalysisFocus::ALL.to_vec()
    } else {
        params.focus.clone()
    }
}

/// Builds the user prompt for `snapshot`.
///
/// File contents are included in path order until `max_bytes` is reached;
/// the file that crosses the limit is cut and the rest are listed as omitted.
pub fn build_prompt(snapshot: &RepoSnapshot, params: &AnalysisParams, max_bytes: usize) -> String {
    let focus = focus_areas(params);

    let mut prompt = String::from(
        "Analyze the provided repository contents and provide structured insights, including:\n",
    );
    for area in &focus {
        prompt.push_str(focus_instruction(*area));
        prompt.push('\n');
    }

    let keys = focus
        .iter()
        .map(|f| format!("\"{}\": [\"finding\", ...]", f.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    prompt.push_str(&format!(
        "\nRespond with JSON of the form {{\"summary\": \"...\", {}}}.\n\nRepository contents:\n",
        keys
    ));

    let mut budget = max_bytes;
    let mut omitted = 0usize;
    for (path, content) in &snapshot.files {
        if budget == 0 {
            omitted += 1;
            continue;
        }
        let header = format!("\n### {}\n```\n", path);
        let body = cut_at_char_boundary(content, budget);
        prompt.push_str(&header);
        prompt.push_str(body);
        if body.len() < content.len() {
            prompt.push_str("\n[truncated]");
        }
        prompt.push_str("\n```\n");
        budget = budget.saturating_sub(body.len());
    }

    if omitted > 0 {
        prompt.push_str(&format!("\n[{} more files omitted]\n", omitted));
    }
    if snapshot.skipped > 0 {
        prompt.push_str(&format!(
            "[{} binary or oversized files were not fetched]\n",
            snapshot.skipped
        ));
    }

    prompt
}

fn cut_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_lists_requested_focus_only() {
        let snapshot = RepoSnapshot::new().with_file("src/lib.rs", "pub fn a() {}");
        let params = AnalysisParams::default().with_focus([AnalysisFocus::Security]);

        let prompt = build_prompt(&snapshot, &params, 10_000);
        assert!(prompt.contains("**security**"));
        assert!(!prompt.contains("**complexity**"));
        assert!(prompt.contains("\"security\": ["));
        assert!(prompt.contains("### src/lib.rs"));
        assert!(prompt.contains("pub fn a() {}"));
    }

    #[test]
    fn test_prompt_covers_all_areas_by_default() {
        let prompt = build_prompt(&RepoSnapshot::new(), &AnalysisParams::default(), 100);
        for focus in AnalysisFocus::ALL {
            assert!(prompt.contains(&format!("**{}**", focus.as_str())));
        }
    }

    #[test]
    fn test_prompt_respects_byte_budget() {
        let snapshot = RepoSnapshot::new()
            .with_file("a.rs", "a".repeat(80))
            .with_file("b.rs", "b".repeat(80))
            .with_file("c.rs", "c".repeat(80));

        let prompt = build_prompt(&snapshot, &AnalysisParams::default(), 100);
        assert!(prompt.contains(&"a".repeat(80)));
        assert!(prompt.contains("[truncated]"));
        assert!(!prompt.contains(&"b".repeat(21)));
        assert!(prompt.contains("[1 more files omitted]"));
    }

    #[test]
    fn test_cut_at_char_boundary() {
        assert_eq!(cut_at_char_boundary("héllo", 2), "h");
        assert_eq!(cut_at_char_boundary("abc", 10), "abc");
    }
}
