//! Structured-output parser: extracts `FILE`, `EXEC`, and `SUBTASK`
//! blocks from raw model text by literal line-oriented delimiters.
//! Matching is non-overlapping and order-independent; malformed blocks
//! (missing header or terminator) are left in place and ignored.

use crate::models::{CommandIntent, FileIntent, PreferredAgent, SubtaskIntent};

#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub files: Vec<FileIntent>,
    pub commands: Vec<CommandIntent>,
    pub subtasks: Vec<SubtaskIntent>,
    pub explanation: String,
}

/// A recognized block's half-open line range `[start, end)`, removed
/// from the residual explanation text.
struct Consumed {
    start: usize,
    end: usize,
}

pub fn parse(raw: &str) -> ParseResult {
    let lines: Vec<&str> = raw.split('\n').collect();
    let mut result = ParseResult::default();
    let mut consumed: Vec<Consumed> = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i].trim_end_matches('\r');
        if line == "FILE" {
            if let Some((intent, end)) = try_parse_file(&lines, i) {
                result.files.push(intent);
                consumed.push(Consumed { start: i, end });
                i = end;
                continue;
            }
        } else if line == "EXEC" {
            if let Some((intent, end)) = try_parse_exec(&lines, i) {
                result.commands.push(intent);
                consumed.push(Consumed { start: i, end });
                i = end;
                continue;
            }
        } else if line == "SUBTASK" {
            if let Some((intent, end)) = try_parse_subtask(&lines, i) {
                result.subtasks.push(intent);
                consumed.push(Consumed { start: i, end });
                i = end;
                continue;
            }
        }
        i += 1;
    }

    result.explanation = build_residual(&lines, &consumed);
    result
}

fn line_at<'a>(lines: &[&'a str], idx: usize) -> Option<&'a str> {
    lines.get(idx).map(|l| l.trim_end_matches('\r'))
}

/// `FILE` / `path: <rel>` / `CONTENT` / ...bytes... / `END_FILE`
fn try_parse_file(lines: &[&str], start: usize) -> Option<(FileIntent, usize)> {
    let path_line = line_at(lines, start + 1)?;
    let path = path_line.strip_prefix("path: ")?.to_string();
    let content_marker = line_at(lines, start + 2)?;
    if content_marker != "CONTENT" {
        return None;
    }
    let body_start = start + 3;
    let mut j = body_start;
    while j < lines.len() {
        if line_at(lines, j)? == "END_FILE" {
            let content = lines[body_start..j].join("\n");
            return Some((FileIntent { path, content }, j + 1));
        }
        j += 1;
    }
    None
}

/// `EXEC` / `cwd: <rel>` / `cmd: <single-line>` / `END_EXEC`
fn try_parse_exec(lines: &[&str], start: usize) -> Option<(CommandIntent, usize)> {
    let cwd_line = line_at(lines, start + 1)?;
    let cwd = cwd_line.strip_prefix("cwd: ")?.to_string();
    let cmd_line = line_at(lines, start + 2)?;
    let cmd = cmd_line.strip_prefix("cmd: ")?.to_string();
    let terminator = line_at(lines, start + 3)?;
    if terminator != "END_EXEC" {
        return None;
    }
    Some((CommandIntent { cwd, cmd }, start + 4))
}

/// `SUBTASK` / `title: <line>` / `agent: <id-or-"auto">` /
/// `description: <multi-line>` / ... / `END_SUBTASK`
fn try_parse_subtask(lines: &[&str], start: usize) -> Option<(SubtaskIntent, usize)> {
    let title_line = line_at(lines, start + 1)?;
    let title = title_line.strip_prefix("title: ")?.to_string();
    let agent_line = line_at(lines, start + 2)?;
    let agent_raw = agent_line.strip_prefix("agent: ")?;
    let agent = PreferredAgent::from_str_field(agent_raw);
    let desc_header = line_at(lines, start + 3)?;
    let first_desc_line = desc_header.strip_prefix("description: ")?;

    let body_start = start + 3;
    let mut j = body_start;
    while j < lines.len() {
        if line_at(lines, j)? == "END_SUBTASK" {
            let mut desc_lines: Vec<String> = vec![first_desc_line.to_string()];
            for l in &lines[body_start + 1..j] {
                desc_lines.push(l.trim_end_matches('\r').to_string());
            }
            let description = desc_lines.join("\n");
            return Some((
                SubtaskIntent {
                    title,
                    agent,
                    description,
                },
                j + 1,
            ));
        }
        j += 1;
    }
    None
}

/// Residual explanation: everything outside recognized blocks, with
/// runs of consecutive blank lines collapsed to a single blank line.
fn build_residual(lines: &[&str], consumed: &[Consumed]) -> String {
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut idx = 0usize;
    for c in consumed {
        while idx < c.start {
            kept.push(lines[idx]);
            idx += 1;
        }
        idx = c.end;
    }
    while idx < lines.len() {
        kept.push(lines[idx]);
        idx += 1;
    }

    let mut collapsed: Vec<&str> = Vec::with_capacity(kept.len());
    let mut prev_blank = false;
    for l in kept {
        let is_blank = l.trim().is_empty();
        if is_blank && prev_blank {
            continue;
        }
        collapsed.push(l);
        prev_blank = is_blank;
    }

    collapsed.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_file_block() {
        let raw = "Here you go:\n\nFILE\npath: hello.js\nCONTENT\nconsole.log(\"hi\");\nEND_FILE\n\nDone.";
        let result = parse(raw);
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].path, "hello.js");
        assert_eq!(result.files[0].content, "console.log(\"hi\");");
        assert!(result.explanation.contains("Here you go:"));
        assert!(result.explanation.contains("Done."));
        assert!(!result.explanation.contains("FILE"));
    }

    #[test]
    fn parses_exec_and_subtask_blocks_in_any_order() {
        let raw = "SUBTASK\ntitle: add test\nagent: auto\ndescription: write a unit test\nEND_SUBTASK\nEXEC\ncwd: .\ncmd: npm test\nEND_EXEC\n";
        let result = parse(raw);
        assert_eq!(result.subtasks.len(), 1);
        assert_eq!(result.subtasks[0].title, "add test");
        assert_eq!(result.subtasks[0].agent, PreferredAgent::Auto);
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].cmd, "npm test");
    }

    #[test]
    fn multiline_subtask_description_is_preserved() {
        let raw = "SUBTASK\ntitle: add docs\nagent: auto\ndescription: line one\nline two\nEND_SUBTASK\n";
        let result = parse(raw);
        assert_eq!(result.subtasks[0].description, "line one\nline two");
    }

    #[test]
    fn malformed_file_block_missing_terminator_is_ignored() {
        let raw = "FILE\npath: a.js\nCONTENT\nconsole.log(1);\n";
        let result = parse(raw);
        assert!(result.files.is_empty());
        assert!(result.explanation.contains("FILE"));
    }

    #[test]
    fn malformed_exec_block_missing_cmd_line_is_ignored() {
        let raw = "EXEC\ncwd: .\nEND_EXEC\n";
        let result = parse(raw);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn raw_text_with_no_blocks_is_trimmed_explanation() {
        let raw = "  just some prose  \n";
        let result = parse(raw);
        assert_eq!(result.explanation, "just some prose");
        assert!(result.files.is_empty());
    }

    #[test]
    fn multiple_blank_lines_are_collapsed() {
        let raw = "first\n\n\n\nsecond";
        let result = parse(raw);
        assert_eq!(result.explanation, "first\n\nsecond");
    }

    #[test]
    fn two_file_blocks_parse_independently() {
        let raw = "FILE\npath: a.js\nCONTENT\na\nEND_FILE\nFILE\npath: b.js\nCONTENT\nb\nEND_FILE\n";
        let result = parse(raw);
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files[0].path, "a.js");
        assert_eq!(result.files[1].path, "b.js");
    }
}
