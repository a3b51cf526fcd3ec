//! Minimal server-rendered HTML. The real template layer is an external
//! collaborator; these helpers keep the dashboard self-contained.

/// Escapes text for safe interpolation into HTML.
pub fn esc(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Wraps a body fragment in the shared page chrome.
pub fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title} — weft</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; color: #1a1a1a; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ text-align: left; padding: .4rem .8rem; border-bottom: 1px solid #ddd; }}
nav a {{ margin-right: 1rem; }}
.status-completed {{ color: #0a7d32; }}
.status-failed {{ color: #b3261e; }}
.status-running {{ color: #8a6d00; }}
.badge {{ padding: .1rem .4rem; border-radius: .3rem; background: #eee; }}
</style>
</head>
<body>
<nav>
  <a href="/workflows">runs</a>
  <a href="/agents">agents</a>
  <a href="/optimization/experiments">experiments</a>
</nav>
<h1>{title}</h1>
{body}
</body>
</html>"#,
        title = esc(title),
        body = body,
    )
}
