//! Per-line markup decoration of raw script output.
//!
//! Device-login prompts from the Azure CLI are turned into callouts so the user
//! can spot the URL and code in a scrolling log. Everything else is passed
//! through with a line-break marker.

use std::sync::LazyLock;

use regex::Regex;

pub const DEVICE_LOGIN_URL: &str = "https://microsoft.com/devicelogin";
pub const LINE_BREAK: &str = "<br>";

const SIGN_IN_PHRASE: &str = "sign in";
const CONTINUATION_PHRASES: [&str; 2] = ["Continuing will", "complete the authentication"];

/// Uppercase words the CLI prints that look like codes but never are.
const CODE_DENYLIST: [&str; 10] = [
    "RUNNING",
    "COMPLETE",
    "COMPLETED",
    "SUCCEEDED",
    "SUCCESS",
    "FAILED",
    "ERROR",
    "WARNING",
    "ENABLED",
    "DISABLED",
];

static SIGN_IN_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)enter the code\s+([A-Za-z0-9]{6,12})\b").expect("sign-in code pattern")
});

static CODE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(code|enter)\b").expect("code keyword pattern"));

static BARE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z0-9]{6,12}\b").expect("bare code pattern"));

/// Decorates one raw output line (without its terminator).
pub fn transform(line: &str) -> String {
    if line.trim().is_empty() {
        return line.to_string();
    }

    if let Some(code) = sign_in_code(line) {
        return render_sign_in(code);
    }

    if line.contains(DEVICE_LOGIN_URL) {
        return render_login_link();
    }

    if let Some(code) = bare_code(line) {
        return render_code(code);
    }

    if CONTINUATION_PHRASES
        .iter()
        .any(|phrase| line.contains(phrase))
    {
        return format!("<em>{}</em>{LINE_BREAK}", line.trim());
    }

    format!("{line}{LINE_BREAK}")
}

fn sign_in_code(line: &str) -> Option<&str> {
    if !line.contains(DEVICE_LOGIN_URL) || !line.to_ascii_lowercase().contains(SIGN_IN_PHRASE) {
        return None;
    }
    SIGN_IN_CODE
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|code| code.as_str())
}

fn bare_code(line: &str) -> Option<&str> {
    if !CODE_KEYWORD.is_match(line) {
        return None;
    }

    BARE_CODE
        .find_iter(line)
        .map(|token| token.as_str())
        .find(|token| is_plausible_code(token))
}

fn is_plausible_code(token: &str) -> bool {
    if CODE_DENYLIST.contains(&token) {
        return false;
    }
    let has_letter = token.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    has_letter && has_digit
}

fn login_anchor() -> String {
    format!(r#"<a href="{DEVICE_LOGIN_URL}" target="_blank" rel="noopener">{DEVICE_LOGIN_URL}</a>"#)
}

fn code_span(code: &str) -> String {
    format!(r#"<span class="device-code">{code}</span>"#)
}

fn render_sign_in(code: &str) -> String {
    format!(
        r#"<div class="device-login"><strong>Step 1:</strong> Open {anchor}{LINE_BREAK}<strong>Step 2:</strong> Enter the code {span}</div>"#,
        anchor = login_anchor(),
        span = code_span(code),
    )
}

fn render_login_link() -> String {
    format!(
        r#"<div class="device-login"><strong>Open: {anchor}</strong></div>"#,
        anchor = login_anchor(),
    )
}

fn render_code(code: &str) -> String {
    format!("{} &lt;- YOUR DEVICE CODE{LINE_BREAK}", code_span(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGN_IN_LINE: &str = "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code ABC123XY to authenticate.";

    #[test]
    fn plain_line_gets_single_line_break() {
        for line in [
            "hello",
            "Verifying authentication...",
            "  indented output  ",
            "{\"name\": \"rg-prod\"}",
        ] {
            assert_eq!(transform(line), format!("{line}<br>"));
        }
    }

    #[test]
    fn blank_lines_pass_through() {
        assert_eq!(transform(""), "");
        assert_eq!(transform("   \t"), "   \t");
    }

    #[test]
    fn sign_in_line_yields_url_and_highlighted_code() {
        let rendered = transform(SIGN_IN_LINE);

        assert!(rendered.contains(DEVICE_LOGIN_URL));
        assert!(rendered.contains(r#"<span class="device-code">ABC123XY</span>"#));
        assert!(rendered.contains("Step 1:"));
        assert!(rendered.contains("Step 2:"));
        assert!(!rendered.contains("to authenticate"));
    }

    #[test]
    fn sign_in_marker_is_case_insensitive() {
        let line = "To Sign In, open https://microsoft.com/devicelogin and Enter The Code q7w8e9r0";
        let rendered = transform(line);
        assert!(rendered.contains(r#"<span class="device-code">q7w8e9r0</span>"#));
    }

    #[test]
    fn lone_url_renders_link_callout() {
        let rendered = transform("Open https://microsoft.com/devicelogin in your browser");
        assert!(rendered.contains(r#"href="https://microsoft.com/devicelogin""#));
        assert!(!rendered.contains("device-code"));
    }

    #[test]
    fn sign_in_without_extractable_code_falls_back_to_link() {
        let line = "To sign in, use a web browser to open the page https://microsoft.com/devicelogin";
        let rendered = transform(line);
        assert!(rendered.contains("Open: "));
        assert!(!rendered.contains("device-code"));
    }

    #[test]
    fn bare_code_near_keyword_is_highlighted() {
        let rendered = transform("Your one-time code is F4KE9Z2Q");
        assert_eq!(
            rendered,
            r#"<span class="device-code">F4KE9Z2Q</span> &lt;- YOUR DEVICE CODE<br>"#
        );
    }

    #[test]
    fn status_words_are_not_codes() {
        let line = "Deployment code path RUNNING";
        assert_eq!(transform(line), format!("{line}<br>"));
    }

    #[test]
    fn tokens_without_letters_and_digits_are_ignored() {
        let line = "Please enter 12345678 or ABCDEFGH";
        assert_eq!(transform(line), format!("{line}<br>"));
    }

    #[test]
    fn bare_code_requires_keyword() {
        let line = "Subscription A1B2C3D4 selected";
        assert_eq!(transform(line), format!("{line}<br>"));
    }

    #[test]
    fn keywords_inside_longer_words_do_not_qualify() {
        for line in [
            "Scanning Security Center assessments for WESTUS2",
            "Resources in datacenter EASTUS2",
            "Payload encoded as B64ZZ9 chunks",
            "User entered region NORTHEU1",
        ] {
            assert_eq!(transform(line), format!("{line}<br>"));
        }
    }

    #[test]
    fn keyword_match_is_whole_word_and_case_insensitive() {
        let rendered = transform("ENTER Q1W2E3R4 when prompted");
        assert!(rendered.contains(r#"<span class="device-code">Q1W2E3R4</span>"#));
    }

    #[test]
    fn denylisted_word_is_skipped_for_later_candidate() {
        let rendered = transform("code RUNNING then Z9Y8X7W6");
        assert!(rendered.contains(r#"<span class="device-code">Z9Y8X7W6</span>"#));
    }

    #[test]
    fn continuation_prompt_is_emphasized() {
        assert_eq!(
            transform("  Continuing will open the browser  "),
            "<em>Continuing will open the browser</em><br>"
        );
        assert_eq!(
            transform("Waiting for you to complete the authentication"),
            "<em>Waiting for you to complete the authentication</em><br>"
        );
    }
}
