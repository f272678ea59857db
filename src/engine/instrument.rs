//! Script instrumentation: raw test script text in, standalone runnable
//! Node program text out.
//!
//! The input is authored against the `@playwright/test` convention: a single
//! `test(name, async ({ page }) => { ... })` wrapper containing a flat
//! sequence of awaited action/assertion calls. The transformation:
//!
//! 1. Extracts the wrapper body (whole input is used as the body when no
//!    wrapper is recognized — never refuse to run).
//! 2. Strips import/require statements from the body.
//! 3. Injects a `STEP_RESULT` log line after every awaited `page`/`expect`
//!    statement, tagged with a counter that increments per instrumented
//!    statement. Index 0 is reserved for the initial navigation, so the
//!    body counter starts at 1.
//! 4. Wraps the body in a driver that connects to the shared browser over
//!    the remote-debugging port, navigates, supplies an `expect` polyfill,
//!    and converts an uncaught exception into a screenshot plus a single
//!    `"CURRENT"` failure line.
//!
//! Splitting is done with a character-level scanner that understands
//! strings, template literals, comments, and delimiter nesting. Regex-style
//! text substitution is deliberately not used: a statement boundary inside
//! a string literal must not be treated as one.

use std::path::Path;

use crate::config::EngineSettings;
use crate::engine::types::{EngineError, EngineResult};

/// Prefix of a step-result line in the child's stdout
pub const STEP_RESULT_PREFIX: &str = "STEP_RESULT:";

/// Prefix of the completion line in the child's stdout
pub const TEST_COMPLETE_PREFIX: &str = "TEST_COMPLETE:";

/// A fully instrumented, standalone program
#[derive(Debug, Clone)]
pub struct InstrumentedProgram {
    /// Program text, runnable with a bare Node invocation
    pub text: String,

    /// Number of instrumented body statements (navigation not included)
    pub step_count: usize,
}

/// Transform raw script text into a standalone instrumented program.
///
/// `evidence_dir` is where the child writes failure screenshots; it must
/// exist before the program runs.
pub fn instrument(
    code: &str,
    url: &str,
    evidence_dir: &Path,
    settings: &EngineSettings,
) -> EngineResult<InstrumentedProgram> {
    let body = extract_test_body(code).unwrap_or(code);
    let body = strip_imports(body)?;
    let (instrumented_body, step_count) = inject_step_logs(&body)?;

    let text = build_driver(&instrumented_body, url, evidence_dir, settings);
    Ok(InstrumentedProgram { text, step_count })
}

// ============================================================================
// Body extraction
// ============================================================================

/// Extract the inner body of a `test(name, async ({ page }) => { ... })`
/// wrapper. Returns `None` when no recognizable wrapper exists; the caller
/// falls back to using the whole input as the body.
fn extract_test_body(code: &str) -> Option<&str> {
    let test_at = find_call_start(code, "test")?;
    let after_call = &code[test_at..];

    // The callback opens at the first `=>` followed by `{` inside the call.
    let arrow = after_call.find("=>")?;
    let rest = &after_call[arrow + 2..];
    let brace_off = rest.find(|c: char| !c.is_whitespace())?;
    if rest.as_bytes().get(brace_off) != Some(&b'{') {
        return None;
    }

    let open = test_at + arrow + 2 + brace_off;
    let close = find_matching_brace(code, open).ok()??;
    Some(&code[open + 1..close])
}

/// Find the byte offset of a `name(` call at identifier position
fn find_call_start(src: &str, name: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut from = 0;
    while let Some(rel) = src[from..].find(name) {
        let at = from + rel;
        let before_ok = at == 0
            || !bytes[at - 1].is_ascii_alphanumeric() && bytes[at - 1] != b'_' && bytes[at - 1] != b'.';
        let after = src[at + name.len()..].trim_start();
        if before_ok && after.starts_with('(') {
            return Some(at);
        }
        from = at + name.len();
    }
    None
}

// ============================================================================
// Character-level scanner
// ============================================================================

/// Scanner state outside plain code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    LineComment,
    BlockComment,
    /// Quoted string with its quote character
    Str(char),
    /// Template literal; the nested value is `${...}` brace depth, `None`
    /// outside an interpolation
    Template(Option<u32>),
}

/// Walk `src`, invoking `on_code` for every character that is executable
/// code (not inside a string, template, or comment) together with the
/// delimiter depth *before* the character is applied.
///
/// Returns an error for unterminated strings/comments or unbalanced
/// delimiters — input the instrumenter cannot safely rewrite.
fn scan_code<F: FnMut(usize, char, i32)>(src: &str, mut on_code: F) -> Result<(), String> {
    let mut state = Lexical::Code;
    let mut depth: i32 = 0;
    let mut escaped = false;
    let mut prev: Option<char> = None;

    for (i, ch) in src.char_indices() {
        match state {
            Lexical::Code => match ch {
                '/' if prev == Some('/') => {
                    state = Lexical::LineComment;
                    prev = None;
                }
                '*' if prev == Some('/') => {
                    state = Lexical::BlockComment;
                    prev = None;
                }
                '\'' | '"' => {
                    state = Lexical::Str(ch);
                    prev = None;
                }
                '`' => {
                    state = Lexical::Template(None);
                    prev = None;
                }
                '{' | '(' | '[' => {
                    on_code(i, ch, depth);
                    depth += 1;
                    prev = Some(ch);
                }
                '}' | ')' | ']' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("unbalanced '{ch}' at byte {i}"));
                    }
                    on_code(i, ch, depth);
                    prev = Some(ch);
                }
                _ => {
                    on_code(i, ch, depth);
                    prev = Some(ch);
                }
            },
            Lexical::LineComment => {
                if ch == '\n' {
                    state = Lexical::Code;
                    on_code(i, ch, depth);
                    prev = None;
                }
            }
            Lexical::BlockComment => {
                if ch == '/' && prev == Some('*') {
                    state = Lexical::Code;
                    prev = None;
                } else {
                    prev = Some(ch);
                }
            }
            Lexical::Str(quote) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == quote {
                    state = Lexical::Code;
                    prev = None;
                } else if ch == '\n' {
                    return Err(format!("unterminated string literal at byte {i}"));
                }
            }
            Lexical::Template(interp) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else {
                    match interp {
                        None => {
                            if ch == '`' {
                                state = Lexical::Code;
                                prev = None;
                            } else if ch == '{' && prev == Some('$') {
                                state = Lexical::Template(Some(0));
                            } else {
                                prev = Some(ch);
                            }
                        }
                        Some(d) => {
                            // Inside `${...}`: only track its closing brace
                            if ch == '{' {
                                state = Lexical::Template(Some(d + 1));
                            } else if ch == '}' {
                                state = if d == 0 {
                                    Lexical::Template(None)
                                } else {
                                    Lexical::Template(Some(d - 1))
                                };
                            }
                            prev = None;
                        }
                    }
                }
            }
        }
    }

    match state {
        Lexical::Code | Lexical::LineComment if depth == 0 => Ok(()),
        Lexical::Code | Lexical::LineComment => Err(format!("unbalanced delimiters (depth {depth})")),
        Lexical::BlockComment => Err("unterminated block comment".to_string()),
        Lexical::Str(_) => Err("unterminated string literal".to_string()),
        Lexical::Template(_) => Err("unterminated template literal".to_string()),
    }
}

/// Find the byte offset of the `}` matching the `{` at `open`.
///
/// Outer `Result` is a scan failure; inner `Option` is "no match found".
fn find_matching_brace(src: &str, open: usize) -> Result<Option<usize>, String> {
    let mut open_depth: Option<i32> = None;
    let mut close: Option<usize> = None;
    scan_code(src, |i, ch, depth| {
        if i == open && ch == '{' {
            open_depth = Some(depth);
        } else if close.is_none() && ch == '}' {
            if let Some(d) = open_depth {
                if depth == d && i > open {
                    close = Some(i);
                }
            }
        }
    })?;
    Ok(close)
}

/// Split `src` into top-level statements (semicolons at delimiter depth 0).
/// A trailing fragment without a semicolon is kept as a statement.
fn split_statements(src: &str) -> Result<Vec<&str>, String> {
    let mut bounds = Vec::new();
    scan_code(src, |i, ch, depth| {
        if ch == ';' && depth == 0 {
            bounds.push(i);
        }
    })?;

    let mut statements = Vec::with_capacity(bounds.len() + 1);
    let mut start = 0;
    for end in bounds {
        statements.push(&src[start..=end]);
        start = end + 1;
    }
    if !src[start..].trim().is_empty() {
        statements.push(&src[start..]);
    }
    Ok(statements)
}

// ============================================================================
// Transformation passes
// ============================================================================

/// First code text of a statement, skipping leading comments. Statement
/// slices keep surrounding trivia, so a comment line between two calls
/// attaches to the following statement.
fn statement_head(stmt: &str) -> &str {
    let mut s = stmt.trim_start();
    loop {
        if let Some(rest) = s.strip_prefix("//") {
            match rest.find('\n') {
                Some(i) => s = rest[i + 1..].trim_start(),
                None => return "",
            }
        } else if let Some(rest) = s.strip_prefix("/*") {
            match rest.find("*/") {
                Some(i) => s = rest[i + 2..].trim_start(),
                None => return "",
            }
        } else {
            return s;
        }
    }
}

/// Whether a statement is a module-import/dependency declaration
fn is_import_statement(stmt: &str) -> bool {
    let head = statement_head(stmt);
    if head.starts_with("import ") || head.starts_with("import{") {
        return true;
    }
    (head.starts_with("const ") || head.starts_with("let ") || head.starts_with("var "))
        && head.contains("require(")
}

/// Remove import/require statements from the body
fn strip_imports(body: &str) -> EngineResult<String> {
    let statements = split_statements(body).map_err(EngineError::Transform)?;
    Ok(statements
        .into_iter()
        .filter(|s| !is_import_statement(s))
        .collect::<Vec<_>>()
        .join(""))
}

/// Whether a statement is an awaited page action or assertion call
fn is_instrumentable(stmt: &str) -> bool {
    let head = statement_head(stmt);
    head.starts_with("await page.") || head.starts_with("await expect(")
}

/// Insert a step-passed log line after every instrumentable statement.
///
/// The counter starts at 1; index 0 is reserved for the driver's initial
/// navigation. Returns the rewritten body and the number of instrumented
/// statements.
fn inject_step_logs(body: &str) -> EngineResult<(String, usize)> {
    let statements = split_statements(body).map_err(EngineError::Transform)?;

    let mut out = String::with_capacity(body.len() + statements.len() * 96);
    let mut counter = 0usize;
    for stmt in statements {
        out.push_str(stmt);
        if is_instrumentable(stmt) {
            counter += 1;
            out.push_str(&format!(
                "\n    console.log('{STEP_RESULT_PREFIX}', JSON.stringify({{ stepIndex: {counter}, status: 'passed' }}));"
            ));
        }
    }
    Ok((out, counter))
}

// ============================================================================
// Driver assembly
// ============================================================================

/// Escape a value for splicing into a single-quoted JS string literal
fn escape_js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

/// Wrap an instrumented body in the standalone driver program.
///
/// The driver owns connection setup, target-page selection, the reserved
/// navigation step, the `expect` polyfill, failure evidence capture, and
/// connection release on every exit path.
fn build_driver(body: &str, url: &str, evidence_dir: &Path, settings: &EngineSettings) -> String {
    let url_js = escape_js_string(url);
    let evidence_js = escape_js_string(&evidence_dir.to_string_lossy());
    let port = settings.cdp_port;
    let env_port = crate::config::ENV_CDP_PORT;
    let markers_js = settings
        .ui_markers
        .iter()
        .map(|m| format!("'{}'", escape_js_string(m)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"import {{ chromium }} from 'playwright-core';
import path from 'path';

// Minimal expect polyfill for standalone execution
function expect(locator) {{
    return {{
        toBeVisible: async () => {{
            const isVisible = await locator.isVisible();
            if (!isVisible) throw new Error("Element not visible: " + locator.toString());
        }},
        toHaveText: async (expected) => {{
            const text = await locator.innerText();
            if (typeof expected === 'string' && text !== expected) throw new Error("Expected " + expected + " but got " + text);
        }}
    }}
}}

(async () => {{
    const cdpPort = process.env.{env_port} || '{port}';
    const browser = await chromium.connectOverCDP(`http://localhost:${{cdpPort}}`);
    const context = browser.contexts()[0];

    // Select the page under test, never the host application's own UI
    const uiMarkers = [{markers_js}];
    let page = context.pages().find(p => {{
        const u = p.url();
        return u && !uiMarkers.some(m => u.includes(m));
    }});
    if (!page) {{
        page = context.pages()[0] || await context.newPage();
    }}

    try {{
        await page.goto('{url_js}');
        console.log('{STEP_RESULT_PREFIX}', JSON.stringify({{ stepIndex: 0, status: 'passed' }}));
{body}

        console.log('{TEST_COMPLETE_PREFIX}', JSON.stringify({{ success: true }}));
    }} catch (error) {{
        const screenshotPath = path.join('{evidence_js}', `step-CURRENT-${{Date.now()}}.png`);
        await page.screenshot({{ path: screenshotPath }});
        console.log('{STEP_RESULT_PREFIX}', JSON.stringify({{ stepIndex: 'CURRENT', status: 'failed', error: error.message, screenshotPath }}));
    }} finally {{
        await browser.close();
    }}
}})();
"#
    )
}
