//! Per-channel markdown rendering.
//!
//! The platform speaks CommonMark-flavoured markdown internally; each
//! channel gets the subset its surface understands. The renderers here
//! are line-oriented and deliberately conservative: unknown constructs
//! pass through as plain text rather than breaking the message.

/// Render markdown as Telegram HTML (`parse_mode: "HTML"`).
pub fn to_telegram_html(markdown: &str) -> String {
    let escaped = escape_html(markdown);
    let mut out = replace_fenced_blocks(&escaped, "<pre>", "</pre>");
    out = replace_inline(&out, "**", "<b>", "</b>");
    out = replace_inline(&out, "__", "<b>", "</b>");
    out = replace_inline(&out, "*", "<i>", "</i>");
    out = replace_inline(&out, "_", "<i>", "</i>");
    out = replace_inline(&out, "`", "<code>", "</code>");
    replace_links(&out, |text, url| format!("<a href=\"{url}\">{text}</a>"))
}

/// Render markdown as Slack mrkdwn.
pub fn to_slack_mrkdwn(markdown: &str) -> String {
    let mut out = replace_inline(markdown, "**", "*", "*");
    out = replace_inline(&out, "__", "*", "*");
    replace_links(&out, |text, url| format!("<{url}|{text}>"))
}

/// GitHub comments take markdown as-is.
pub fn to_github_markdown(markdown: &str) -> String {
    markdown.to_string()
}

/// Strip inline markup for plain-text surfaces.
pub fn to_plain_text(markdown: &str) -> String {
    let mut out = replace_inline(markdown, "**", "", "");
    out = replace_inline(&out, "__", "", "");
    out = replace_inline(&out, "*", "", "");
    out = replace_inline(&out, "_", "", "");
    out = replace_inline(&out, "`", "", "");
    replace_links(&out, |text, _| text.to_string())
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Replace paired occurrences of `delim` with open/close tags. Unpaired
/// delimiters are left untouched.
fn replace_inline(input: &str, delim: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find(delim) else {
            out.push_str(rest);
            return out;
        };
        let after = &rest[start + delim.len()..];
        let Some(end) = after.find(delim) else {
            out.push_str(rest);
            return out;
        };
        if end == 0 {
            // Adjacent delimiters carry no content; leave them alone.
            out.push_str(&rest[..start + delim.len()]);
            rest = after;
            continue;
        }
        out.push_str(&rest[..start]);
        out.push_str(open);
        out.push_str(&after[..end]);
        out.push_str(close);
        rest = &after[end + delim.len()..];
    }
}

/// Replace ```fenced blocks``` with the given wrapper.
fn replace_fenced_blocks(input: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find("```") else {
            out.push_str(rest);
            return out;
        };
        let after = &rest[start + 3..];
        let Some(end) = after.find("```") else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        out.push_str(open);
        // Drop the optional language tag on the opening fence.
        let body = &after[..end];
        let body = match body.split_once('\n') {
            Some((first_line, remainder))
                if !first_line.is_empty() && !first_line.contains(' ') =>
            {
                remainder
            }
            _ => body,
        };
        out.push_str(body.trim_end_matches('\n'));
        out.push_str(close);
        rest = &after[end + 3..];
    }
}

/// Rewrite `[text](url)` links through the given formatter.
fn replace_links(input: &str, format: impl Fn(&str, &str) -> String) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(open_bracket) = rest.find('[') else {
            out.push_str(rest);
            return out;
        };
        let candidate = &rest[open_bracket..];
        let parsed = candidate.find("](").and_then(|close_bracket| {
            let text = &candidate[1..close_bracket];
            let after_paren = &candidate[close_bracket + 2..];
            after_paren
                .find(')')
                .map(|close_paren| (text, &after_paren[..close_paren], close_bracket + 2 + close_paren + 1))
        });
        match parsed {
            Some((text, url, consumed)) if !url.contains(' ') => {
                out.push_str(&rest[..open_bracket]);
                out.push_str(&format(text, url));
                rest = &rest[open_bracket + consumed..];
            }
            _ => {
                out.push_str(&rest[..open_bracket + 1]);
                rest = &rest[open_bracket + 1..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_bold() {
        assert_eq!(to_telegram_html("**bold**"), "<b>bold</b>");
    }

    #[test]
    fn telegram_escapes_html_before_tagging() {
        assert_eq!(
            to_telegram_html("a < b and **x & y**"),
            "a &lt; b and <b>x &amp; y</b>"
        );
    }

    #[test]
    fn telegram_inline_code_and_links() {
        assert_eq!(to_telegram_html("`let x`"), "<code>let x</code>");
        assert_eq!(
            to_telegram_html("[docs](https://example.com)"),
            "<a href=\"https://example.com\">docs</a>"
        );
    }

    #[test]
    fn telegram_fenced_block_drops_language_tag() {
        assert_eq!(
            to_telegram_html("```rust\nfn main() {}\n```"),
            "<pre>fn main() {}</pre>"
        );
    }

    #[test]
    fn slack_bold_and_links() {
        assert_eq!(to_slack_mrkdwn("**bold**"), "*bold*");
        assert_eq!(
            to_slack_mrkdwn("[docs](https://example.com)"),
            "<https://example.com|docs>"
        );
    }

    #[test]
    fn unpaired_delimiters_pass_through() {
        assert_eq!(to_telegram_html("2 ** 3"), "2 ** 3");
        assert_eq!(to_slack_mrkdwn("a ** b"), "a ** b");
    }

    #[test]
    fn plain_text_strips_markup() {
        assert_eq!(
            to_plain_text("**bold** and [docs](https://x)"),
            "bold and docs"
        );
    }
}
