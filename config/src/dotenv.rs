//! Parse a `.env` file into a key-value map. Application to the process
//! environment (and the existing-env-wins rule) lives in the crate root.

use std::collections::HashMap;
use std::path::Path;

/// Location of `.env`: `override_dir` when given, else the current directory.
fn dotenv_path(override_dir: Option<&Path>) -> Option<std::path::PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    (path.is_file()).then_some(path)
}

/// Line-oriented `KEY=VALUE` parser.
///
/// * `export KEY=value` is accepted (the prefix is dropped).
/// * Lines starting with `#` and lines without `=` are skipped.
/// * Double-quoted values unescape `\"`; single-quoted values are taken
///   verbatim; a `#` inside an unquoted value is kept.
/// * No multiline values or line continuations.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let raw = raw.trim();
        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            raw[1..raw.len() - 1].replace("\\\"", "\"")
        } else if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
            raw[1..raw.len() - 1].to_string()
        } else {
            raw.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Loads `.env` into a map; a missing file is an empty map, not an error.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    match dotenv_path(override_dir) {
        Some(path) => Ok(parse_dotenv(&std::fs::read_to_string(path)?)),
        None => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_pairs() {
        let m = parse_dotenv("OPENAI_API_KEY=sk-test\nWEFT_DB=weft.db\n");
        assert_eq!(m.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(m.get("WEFT_DB").map(String::as_str), Some("weft.db"));
    }

    #[test]
    fn skips_comments_blanks_and_non_pairs() {
        let m = parse_dotenv("# a comment\n\nnot-a-pair\nKEY=v\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY").map(String::as_str), Some("v"));
    }

    #[test]
    fn export_prefix_is_dropped() {
        let m = parse_dotenv("export KEY=value\n");
        assert_eq!(m.get("KEY").map(String::as_str), Some("value"));
    }

    #[test]
    fn quoted_values() {
        let m = parse_dotenv(
            "A=\"hello world\"\nB='literal $x'\nC=\"say \\\"hi\\\"\"\nD=\"\"\n",
        );
        assert_eq!(m.get("A").map(String::as_str), Some("hello world"));
        assert_eq!(m.get("B").map(String::as_str), Some("literal $x"));
        assert_eq!(m.get("C").map(String::as_str), Some("say \"hi\""));
        assert_eq!(m.get("D").map(String::as_str), Some(""));
    }

    #[test]
    fn empty_key_is_skipped_and_empty_value_kept() {
        let m = parse_dotenv("=orphan\nK=\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("K").map(String::as_str), Some(""));
    }

    #[test]
    fn load_env_map_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_map(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn load_env_map_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "X=1\nY=two\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("X").map(String::as_str), Some("1"));
        assert_eq!(m.get("Y").map(String::as_str), Some("two"));
    }
}
