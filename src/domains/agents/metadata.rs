//! Stateful-looking but chunk-stateless parsing of assistant PTY output.
//!
//! Each output chunk is scanned independently for a handful of patterns the
//! assistants are known to emit (window-title escapes, dim prompt text, model
//! banners, percentage readouts). The result is a partial patch; the
//! supervisor merges it field-by-field into the session metadata.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Fields the extractor could confidently detect in one chunk. Earlier rules
/// win: a rule only assigns a field the rules before it left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub model: Option<String>,
    pub context_used: Option<String>,
    pub last_message: Option<String>,
    pub waiting_for_input: Option<bool>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.context_used.is_none()
            && self.last_message.is_none()
            && self.waiting_for_input.is_none()
    }
}

/// Spinner glyphs the claude CLI rotates through in its OSC 0 window title.
const SPINNER_GLYPHS: [&str; 11] = [
    "\u{2810}", // ⠐
    "\u{2802}", // ⠂
    "\u{2733}", // ✳
    "\u{2736}", // ✶
    "\u{273b}", // ✻
    "\u{273d}", // ✽
    "\u{2722}", // ✢
    "\u{b7}",   // ·
    "\u{2808}", // ⠈
    "\u{2801}", // ⠁
    "\u{2803}", // ⠃
];

static OSC0_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\]0;([^\x07]*)\x07").expect("osc0 regex"));
static OSC2_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\]2;([^\x07]*)\x07").expect("osc2 regex"));
static DIM_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[2m([^\x1b]*)\x1b\[22m").expect("dim regex"));
static MODEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(opus|sonnet|haiku)[- ]?(\d+(?:[.-]\d+)*)").expect("model regex"));
static CONTEXT_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("context regex"));
static COPILOT_INPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new("\u{276f}\\s*\x1b\\[39m([^\x1b\r\n]*)").expect("copilot regex"));
static ANSI_SEQUENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[^A-Za-z]*[A-Za-z]|\x1b\][^\x07]*\x07|\r").expect("strip regex"));

/// Remove CSI and OSC escape sequences plus carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ANSI_SEQUENCES.replace_all(text, "").into_owned()
}

/// Parse a raw PTY chunk into a metadata patch.
pub fn extract_metadata(chunk: &[u8]) -> MetadataPatch {
    let text = String::from_utf8_lossy(chunk);
    let mut patch = MetadataPatch::default();

    apply_claude_title(&text, &mut patch);
    apply_copilot_title(&text, &mut patch);
    apply_dim_prompt(&text, &mut patch);

    let stripped = strip_ansi(&text);
    apply_model_and_context(&stripped, &mut patch);
    apply_copilot_prompt(&text, &mut patch);
    apply_thinking_fallback(&stripped, &mut patch);

    patch
}

/// Rule 1: `ESC ] 0 ; <spinner> <title> BEL` from the claude CLI. A title of
/// `Claude Code` means the prompt is back at rest.
fn apply_claude_title(text: &str, patch: &mut MetadataPatch) {
    let Some(captures) = OSC0_TITLE.captures(text) else {
        return;
    };
    let payload = &captures[1];
    let Some(title) = SPINNER_GLYPHS
        .iter()
        .find_map(|glyph| payload.strip_prefix(glyph))
    else {
        return;
    };
    let title = title.strip_prefix(' ').unwrap_or(title).trim_end();

    if title == "Claude Code" {
        if patch.waiting_for_input.is_none() {
            patch.waiting_for_input = Some(true);
        }
        return;
    }

    let len = title.chars().count();
    if len > 2 && len < 80 {
        if patch.last_message.is_none() {
            patch.last_message = Some(title.to_string());
        }
        if patch.waiting_for_input.is_none() {
            patch.waiting_for_input = Some(false);
        }
    }
}

/// Rule 2: `ESC ] 2 ; <title> BEL`; the copilot CLI titles its window with
/// its own product name.
fn apply_copilot_title(text: &str, patch: &mut MetadataPatch) {
    if patch.model.is_some() {
        return;
    }
    if let Some(captures) = OSC2_TITLE.captures(text) {
        if &captures[1] == "GitHub Copilot" {
            patch.model = Some("GitHub Copilot".to_string());
        }
    }
}

/// Rule 3: dim text (`ESC [ 2 m … ESC [ 22 m`) carries either the input
/// placeholder or a status line.
fn apply_dim_prompt(text: &str, patch: &mut MetadataPatch) {
    let Some(captures) = DIM_TEXT.captures(text) else {
        return;
    };
    let inner = captures[1].trim();

    if inner.starts_with("Type @") {
        if patch.waiting_for_input.is_none() {
            patch.waiting_for_input = Some(true);
        }
        return;
    }

    let len = inner.chars().count();
    if len > 2 && len < 100 && !inner.starts_with('\u{2500}') && patch.last_message.is_none() {
        patch.last_message = Some(inner.to_string());
    }
}

/// Rule 4: model banner and context percentage, read off the stripped text.
fn apply_model_and_context(stripped: &str, patch: &mut MetadataPatch) {
    if patch.model.is_none() {
        if let Some(captures) = MODEL_NAME.captures(stripped) {
            let name = &captures[1];
            let mut capitalized = String::with_capacity(name.len());
            let mut chars = name.chars();
            if let Some(first) = chars.next() {
                capitalized.extend(first.to_uppercase());
                capitalized.push_str(chars.as_str());
            }
            let version = captures[2].replace('-', ".");
            patch.model = Some(format!("{capitalized} {version}"));
        }
    }

    if patch.context_used.is_none() {
        if let Some(captures) = CONTEXT_PERCENT.captures(stripped) {
            patch.context_used = Some(format!("{}%", &captures[1]));
        }
    }
}

/// Rule 5: the copilot input line `❯ ESC [ 39 m <input>`; a bare `❯` with
/// nothing typed means the CLI is waiting.
fn apply_copilot_prompt(text: &str, patch: &mut MetadataPatch) {
    if let Some(captures) = COPILOT_INPUT.captures(text) {
        let input = captures[1].trim();
        if !input.is_empty() && !input.starts_with("Type @") {
            if patch.last_message.is_none() {
                patch.last_message = Some(input.to_string());
            }
            return;
        }
    }
    if text.contains('\u{276f}') && patch.waiting_for_input.is_none() {
        patch.waiting_for_input = Some(true);
    }
}

/// Rule 6: a visible `thinking` with nothing better to report.
fn apply_thinking_fallback(stripped: &str, patch: &mut MetadataPatch) {
    if patch.last_message.is_some() || !stripped.contains("thinking") {
        return;
    }
    patch.last_message = Some("Thinking...".to_string());
    if patch.waiting_for_input.is_none() {
        patch.waiting_for_input = Some(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_title_sets_last_message() {
        let patch = extract_metadata("\x1b]0;\u{2733} Refactoring module\x07".as_bytes());
        assert_eq!(patch.last_message.as_deref(), Some("Refactoring module"));
        assert_eq!(patch.waiting_for_input, Some(false));
    }

    #[test]
    fn claude_idle_title_sets_waiting() {
        let patch = extract_metadata("\x1b]0;\u{2733} Claude Code\x07".as_bytes());
        assert_eq!(patch.waiting_for_input, Some(true));
        assert_eq!(patch.last_message, None);
    }

    #[test]
    fn claude_title_without_spinner_is_ignored() {
        let patch = extract_metadata(b"\x1b]0;plain window title\x07");
        assert_eq!(patch.last_message, None);
        assert_eq!(patch.waiting_for_input, None);
    }

    #[test]
    fn overlong_titles_are_dropped() {
        let long = "x".repeat(90);
        let chunk = format!("\x1b]0;\u{2733} {long}\x07");
        let patch = extract_metadata(chunk.as_bytes());
        assert_eq!(patch.last_message, None);
    }

    #[test]
    fn copilot_title_sets_model() {
        let patch = extract_metadata(b"\x1b]2;GitHub Copilot\x07");
        assert_eq!(patch.model.as_deref(), Some("GitHub Copilot"));
    }

    #[test]
    fn dim_placeholder_sets_waiting() {
        let patch = extract_metadata(b"\x1b[2mType @ to mention a file\x1b[22m");
        assert_eq!(patch.waiting_for_input, Some(true));
        assert_eq!(patch.last_message, None);
    }

    #[test]
    fn dim_status_line_sets_last_message() {
        let patch = extract_metadata(b"\x1b[2mRunning the test suite\x1b[22m");
        assert_eq!(patch.last_message.as_deref(), Some("Running the test suite"));
    }

    #[test]
    fn dim_box_drawing_is_ignored() {
        let chunk = format!("\x1b[2m{}\x1b[22m", "\u{2500}".repeat(10));
        let patch = extract_metadata(chunk.as_bytes());
        assert_eq!(patch.last_message, None);
    }

    #[test]
    fn model_banner_is_normalized() {
        let patch = extract_metadata(b"model: claude-opus-4-5 ready");
        assert_eq!(patch.model.as_deref(), Some("Opus 4.5"));
    }

    #[test]
    fn sonnet_with_space_and_dot_version() {
        let patch = extract_metadata(b"using sonnet 4.5 today");
        assert_eq!(patch.model.as_deref(), Some("Sonnet 4.5"));
    }

    #[test]
    fn context_percentage_is_captured() {
        let patch = extract_metadata(b"context left until auto-compact: 37%");
        assert_eq!(patch.context_used.as_deref(), Some("37%"));
    }

    #[test]
    fn context_percentage_inside_escape_is_still_found_after_strip() {
        let patch = extract_metadata(b"\x1b[2K 12.5 % used");
        assert_eq!(patch.context_used.as_deref(), Some("12.5%"));
    }

    #[test]
    fn copilot_typed_input_becomes_last_message() {
        let patch = extract_metadata("\u{276f} \x1b[39mfix the flaky test".as_bytes());
        assert_eq!(patch.last_message.as_deref(), Some("fix the flaky test"));
    }

    #[test]
    fn copilot_bare_prompt_sets_waiting() {
        let patch = extract_metadata("\u{276f} ".as_bytes());
        assert_eq!(patch.waiting_for_input, Some(true));
    }

    #[test]
    fn copilot_placeholder_input_counts_as_waiting() {
        let patch = extract_metadata("\u{276f} \x1b[39mType @ for context".as_bytes());
        assert_eq!(patch.last_message, None);
        assert_eq!(patch.waiting_for_input, Some(true));
    }

    #[test]
    fn thinking_fallback_applies_only_without_message() {
        let patch = extract_metadata(b"(thinking)");
        assert_eq!(patch.last_message.as_deref(), Some("Thinking..."));
        assert_eq!(patch.waiting_for_input, Some(false));

        let chunk = "\x1b]0;\u{2733} Planning thinking steps\x07".to_string();
        let patch = extract_metadata(chunk.as_bytes());
        assert_eq!(patch.last_message.as_deref(), Some("Planning thinking steps"));
    }

    #[test]
    fn earlier_rules_keep_their_fields() {
        // Rule 1 sets waiting=true; the bare copilot prompt further down the
        // chunk must not flip it, and rule 6 must not overwrite the message.
        let chunk = "\x1b]0;\u{2733} Claude Code\x07 \u{276f} thinking";
        let patch = extract_metadata(chunk.as_bytes());
        assert_eq!(patch.waiting_for_input, Some(true));
        assert_eq!(patch.last_message.as_deref(), Some("Thinking..."));
    }

    #[test]
    fn strip_ansi_removes_csi_osc_and_cr() {
        let text = "a\x1b[31mred\x1b[0m\rb\x1b]0;title\x07c";
        assert_eq!(strip_ansi(text), "aredbc");
    }

    #[test]
    fn empty_chunk_produces_empty_patch() {
        let patch = extract_metadata(b"");
        assert!(patch.is_empty());
    }
}
