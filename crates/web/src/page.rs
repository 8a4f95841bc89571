//! HTML for the callback page.
//!
//! Every variant carries the manual fallback block: the exact callback URL, a
//! copy button and paste instructions, so the user can always finish the flow
//! from the main window.

use std::fmt::Write as _;
use stowage_auth::{CallbackReport, CallbackState};

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render the result page for `report`.
pub fn render(report: &CallbackReport) -> String {
    let provider = report.provider;
    let (title, detail) = match &report.state {
        CallbackState::Succeeded => (
            "Authorization complete",
            "The main window has received the result. You can close this window.".to_string(),
        ),
        CallbackState::Failed(e) => (
            "Authorization failed",
            format!("{e}. Start the connection again from the main window."),
        ),
        CallbackState::HandedOff => (
            "Finish in the main window",
            "This window cannot reach the page that started the connection. \
             Copy the address below and paste it into the main window."
                .to_string(),
        ),
    };

    let mut html = String::new();
    let _ = write!(
        html,
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
</head>
<body>
<main data-provider="{provider}">
<h1>{title}</h1>
<p id="detail">{detail}</p>
<section id="manual-fallback">
<p>If the main window did not update, copy this callback URL and paste it into the
{provider} connection dialog of the main window.</p>
<input id="callback-url" type="text" readonly size="80" value="{url}">
<button type="button" onclick="navigator.clipboard.writeText(document.getElementById('callback-url').value)">Copy URL</button>
</section>
</main>
</body>
</html>
"#,
        title = escape(title),
        detail = escape(&detail),
        url = escape(&report.callback_url),
    );
    html
}
