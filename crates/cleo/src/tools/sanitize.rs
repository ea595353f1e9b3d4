//! Tool parameter validation.
//!
//! Runs before every tool execution. A failure returns an error string
//! instead of the sanitized map; the worker feeds that string back to the
//! model as the tool's result so it can retry with corrected parameters.

use serde_json::{Map, Value};

use super::Tool;

/// Filenames that tools must never touch, matched on the basename.
const SENSITIVE_FILES: &[&str] = &[
    "agents.yaml",
    "exec_approvals.json",
    "chain_contracts.json",
    "id_rsa",
    "id_ed25519",
    "authorized_keys",
    ".netrc",
    ".npmrc",
    ".pypirc",
];

/// Directory fragments that mark credential stores.
const SENSITIVE_DIRS: &[&str] = &["/.ssh/", "/.aws/", "/.gnupg/"];

const FS_READ_TOOLS: &[&str] = &["read_file", "list_dir"];
const FS_WRITE_TOOLS: &[&str] = &["write_file", "edit_file"];
const NET_TOOLS: &[&str] = &["web_fetch"];

/// Validate and coerce tool parameters.
///
/// Returns the sanitized parameter map, or a human-readable rejection.
/// The input map is copied, never mutated.
pub fn sanitize_params(
    tool_name: &str,
    params: &Value,
    tool: Option<&Tool>,
) -> Result<Map<String, Value>, String> {
    let Some(obj) = params.as_object() else {
        return Err("params must be a JSON object".to_string());
    };
    let mut out = obj.clone();

    let is_fs_read = FS_READ_TOOLS.contains(&tool_name);
    let is_fs_write = FS_WRITE_TOOLS.contains(&tool_name);

    if is_fs_read || is_fs_write {
        // list_dir may omit the path (defaults to the project root).
        let path_required = tool_name != "list_dir";
        match out.get("path") {
            None | Some(Value::Null) => {
                if path_required {
                    return Err("missing or empty 'path' parameter".to_string());
                }
            }
            Some(Value::String(path)) => {
                if path.is_empty() {
                    return Err("missing or empty 'path' parameter".to_string());
                }
                check_path(path, is_fs_write)?;
            }
            Some(_) => return Err("'path' must be a string".to_string()),
        }
    }

    if NET_TOOLS.contains(&tool_name) {
        match out.get("url") {
            Some(Value::String(url)) => check_url(url)?,
            Some(_) => return Err("'url' must be a string".to_string()),
            None => return Err("missing 'url' parameter".to_string()),
        }
    }

    if let Some(tool) = tool {
        coerce_types(tool, &mut out)?;
    }

    Ok(out)
}

fn check_path(raw: &str, is_write: bool) -> Result<(), String> {
    // Decode %XX escapes first so encoded traversal cannot slip past the
    // checks below.
    let decoded = percent_decode(raw);
    for candidate in [raw, decoded.as_str()] {
        if candidate.contains('\u{0}') {
            return Err("path contains a null byte".to_string());
        }
        let basename = candidate
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(candidate);
        if basename.starts_with(".env") || SENSITIVE_FILES.contains(&basename) {
            return Err(format!("sensitive file blocked: {basename}"));
        }
        if SENSITIVE_DIRS.iter().any(|d| candidate.contains(d)) {
            return Err("path blocked: sensitive directory".to_string());
        }
        if is_write && basename.starts_with('.') {
            return Err(format!("dotfile writes are blocked: {basename}"));
        }
    }
    Ok(())
}

fn check_url(raw: &str) -> Result<(), String> {
    let lower = raw.to_lowercase();
    let rest = if let Some(r) = lower.strip_prefix("https://") {
        r
    } else if let Some(r) = lower.strip_prefix("http://") {
        r
    } else {
        return Err("url scheme must be http or https".to_string());
    };
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .next_back()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");
    let private = host == "localhost"
        || host == "0.0.0.0"
        || host.starts_with("127.0.0.")
        || host.starts_with("169.254.");
    if private {
        return Err(format!("private network host blocked: {host}"));
    }
    Ok(())
}

fn coerce_types(tool: &Tool, out: &mut Map<String, Value>) -> Result<(), String> {
    for param in &tool.params {
        let Some(value) = out.get(param.name) else {
            continue;
        };
        let coerced = match (param.param_type, value) {
            ("integer", Value::String(s)) => Some(
                s.trim()
                    .parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .map_err(|_| format!("'{}' must be an integer", param.name))?,
            ),
            ("number", Value::String(s)) => {
                let f: f64 = s
                    .trim()
                    .parse()
                    .map_err(|_| format!("'{}' must be a number", param.name))?;
                Some(
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| format!("'{}' must be a finite number", param.name))?,
                )
            }
            ("boolean", Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "yes" | "true" | "1" => Some(Value::Bool(true)),
                "no" | "false" | "0" => Some(Value::Bool(false)),
                _ => return Err(format!("'{}' must be a boolean", param.name)),
            },
            ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
            ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
            _ => None,
        };
        if let Some(v) = coerced {
            out.insert(param.name.to_string(), v);
        }
    }
    Ok(())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ToolCategory;
    use crate::tools::ToolParam;
    use serde_json::json;

    fn test_tool(params: Vec<ToolParam>) -> Tool {
        Tool {
            name: "test",
            description: "test tool",
            params,
            category: ToolCategory::Task,
            requires_env: &[],
            handler: |_, _| Ok(json!({"ok": true})),
        }
    }

    // ── Path safety ─────────────────────────────────────────────────────

    #[test]
    fn test_blocks_sensitive_filenames_write() {
        for name in [
            ".env",
            ".env.local",
            ".env.production",
            "agents.yaml",
            "exec_approvals.json",
            "chain_contracts.json",
            ".netrc",
            ".npmrc",
            ".pypirc",
            "id_rsa",
            "id_ed25519",
            "authorized_keys",
        ] {
            let result =
                sanitize_params("write_file", &json!({"path": name, "content": "x"}), None);
            assert!(result.is_err(), "expected rejection for {name}");
        }
    }

    #[test]
    fn test_blocks_sensitive_filenames_read() {
        for name in [".env", "agents.yaml", "id_rsa"] {
            assert!(sanitize_params("read_file", &json!({"path": name}), None).is_err());
        }
    }

    #[test]
    fn test_blocks_sensitive_in_subdirectory() {
        // The check applies to the basename, not just the full path.
        let result =
            sanitize_params("write_file", &json!({"path": "config/.env", "content": "x"}), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_blocks_sensitive_dir_fragments() {
        assert!(
            sanitize_params("read_file", &json!({"path": "/home/user/.ssh/id_rsa"}), None)
                .is_err()
        );
        assert!(
            sanitize_params("read_file", &json!({"path": "../../.aws/credentials"}), None)
                .is_err()
        );
        assert!(sanitize_params(
            "read_file",
            &json!({"path": "/home/user/.gnupg/private-keys"}),
            None
        )
        .is_err());
    }

    #[test]
    fn test_blocks_null_byte() {
        let err =
            sanitize_params("read_file", &json!({"path": "test\u{0}.txt"}), None).unwrap_err();
        assert!(err.contains("null"));
    }

    #[test]
    fn test_decodes_url_encoded_path() {
        assert!(
            sanitize_params("read_file", &json!({"path": "%2e%2e/%2e%2e/.ssh/id_rsa"}), None)
                .is_err()
        );
    }

    #[test]
    fn test_blocks_dotfile_write_allows_dotfile_read() {
        let err = sanitize_params(
            "write_file",
            &json!({"path": ".gitignore", "content": "x"}),
            None,
        )
        .unwrap_err();
        assert!(err.contains("dotfile"));

        assert!(sanitize_params("read_file", &json!({"path": ".gitignore"}), None).is_ok());
    }

    #[test]
    fn test_allows_normal_workspace_paths() {
        let out = sanitize_params(
            "write_file",
            &json!({"path": "workspace/report.txt", "content": "hello"}),
            None,
        )
        .unwrap();
        assert_eq!(out["path"], "workspace/report.txt");
        assert!(sanitize_params("read_file", &json!({"path": "workspace/data.json"}), None)
            .is_ok());
        assert!(sanitize_params("list_dir", &json!({"path": "workspace"}), None).is_ok());
        assert!(sanitize_params("list_dir", &json!({}), None).is_ok());
    }

    #[test]
    fn test_rejects_missing_or_bad_path() {
        assert!(sanitize_params("read_file", &json!({"path": ""}), None).is_err());
        let err = sanitize_params("read_file", &json!({}), None).unwrap_err();
        assert!(err.contains("missing") || err.contains("empty"));
        assert!(sanitize_params("read_file", &json!({"path": 123}), None).is_err());
    }

    // ── URL safety ──────────────────────────────────────────────────────

    #[test]
    fn test_blocks_private_urls() {
        for url in [
            "http://127.0.0.1:8080/admin",
            "http://localhost/api",
            "http://0.0.0.0/",
            "https://169.254.169.254/latest/meta-data/",
        ] {
            let err = sanitize_params("web_fetch", &json!({"url": url}), None).unwrap_err();
            assert!(err.contains("private") || err.contains("blocked"), "{url}: {err}");
        }
    }

    #[test]
    fn test_blocks_non_http_schemes() {
        let err =
            sanitize_params("web_fetch", &json!({"url": "ftp://example.com/file"}), None)
                .unwrap_err();
        assert!(err.contains("scheme"));
        assert!(
            sanitize_params("web_fetch", &json!({"url": "file:///etc/passwd"}), None).is_err()
        );
    }

    #[test]
    fn test_allows_public_urls() {
        assert!(
            sanitize_params("web_fetch", &json!({"url": "https://example.com/api"}), None)
                .is_ok()
        );
        // Some APIs are http-only; external http is allowed.
        assert!(
            sanitize_params("web_fetch", &json!({"url": "http://example.com/api"}), None).is_ok()
        );
        assert!(sanitize_params("web_fetch", &json!({"url": 12345}), None).is_err());
    }

    // ── Type coercion ───────────────────────────────────────────────────

    #[test]
    fn test_coerces_string_scalars() {
        let tool = test_tool(vec![
            ToolParam::required("count", "integer", "n"),
            ToolParam::optional("temp", "number", "t"),
            ToolParam::optional("flag", "boolean", "f"),
            ToolParam::optional("name", "string", "s"),
        ]);
        let out = sanitize_params(
            "test",
            &json!({"count": "5", "temp": "3.14", "flag": "true", "name": 42}),
            Some(&tool),
        )
        .unwrap();
        assert_eq!(out["count"], 5);
        assert!((out["temp"].as_f64().unwrap() - 3.14).abs() < 1e-3);
        assert_eq!(out["flag"], true);
        assert_eq!(out["name"], "42");
    }

    #[test]
    fn test_bool_word_forms() {
        let tool = test_tool(vec![ToolParam::optional("flag", "boolean", "f")]);
        let out = sanitize_params("test", &json!({"flag": "no"}), Some(&tool)).unwrap();
        assert_eq!(out["flag"], false);
        let out = sanitize_params("test", &json!({"flag": "1"}), Some(&tool)).unwrap();
        assert_eq!(out["flag"], true);
    }

    #[test]
    fn test_rejects_non_coercible() {
        let tool = test_tool(vec![ToolParam::required("count", "integer", "n")]);
        let err =
            sanitize_params("test", &json!({"count": "not_a_number"}), Some(&tool)).unwrap_err();
        assert!(err.contains("integer"));
    }

    #[test]
    fn test_correct_types_pass_through() {
        let tool = test_tool(vec![ToolParam::required("count", "integer", "n")]);
        let out = sanitize_params("test", &json!({"count": 10}), Some(&tool)).unwrap();
        assert_eq!(out["count"], 10);
    }

    // ── Edge cases ──────────────────────────────────────────────────────

    #[test]
    fn test_non_object_params_rejected() {
        let err = sanitize_params("read_file", &json!("not a dict"), None).unwrap_err();
        assert!(err.contains("object"));
    }

    #[test]
    fn test_unscoped_tool_passes_through() {
        let out =
            sanitize_params("memory_search", &json!({"query": "test", "limit": 5}), None).unwrap();
        assert_eq!(out["query"], "test");
    }

    #[test]
    fn test_params_not_mutated() {
        let original = json!({"path": "workspace/test.txt"});
        let snapshot = original.clone();
        let _ = sanitize_params("read_file", &original, None);
        assert_eq!(original, snapshot);
    }
}
