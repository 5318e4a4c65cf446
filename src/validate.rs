//! Pre-flight validation of submitted code.
//!
//! Pure static checks run before any session is contacted: an empty-input
//! check, a denylist substring scan, and a syntax parse. The denylist is a
//! best-effort filter against obviously dangerous calls, not a security
//! boundary — the execution environment is responsible for isolation.

use tree_sitter::{Node, Parser};

/// Substrings that reject a submission outright.
const DENYLIST: &[&str] = &["os.system", "subprocess.", "__import__", "eval(", "exec("];

/// Check code before submission.
///
/// Returns `Err(reason)` when the code must not reach a session. No side
/// effects; safe to call concurrently.
pub fn check(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("empty".to_string());
    }

    for pattern in DENYLIST {
        if code.contains(pattern) {
            return Err(format!(
                "potentially dangerous operation detected: {pattern}"
            ));
        }
    }

    syntax_check(code)
}

/// Parse the submission and report the first syntax error, if any.
fn syntax_check(code: &str) -> Result<(), String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| format!("validation error: {e}"))?;

    let tree = parser
        .parse(code, None)
        .ok_or_else(|| "validation error: parser produced no tree".to_string())?;

    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }

    let diagnostic = first_error(root).map_or_else(
        || "unknown location".to_string(),
        |node| {
            let pos = node.start_position();
            if node.is_missing() {
                format!(
                    "missing {} at line {}, column {}",
                    node.kind(),
                    pos.row + 1,
                    pos.column + 1
                )
            } else {
                format!("invalid syntax at line {}, column {}", pos.row + 1, pos.column + 1)
            }
        },
    );
    Err(format!("syntax error: {diagnostic}"))
}

/// Depth-first search for the first error or missing node.
fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if !child.has_error() && !child.is_missing() {
            continue;
        }
        if let Some(found) = first_error(child) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_code() {
        assert!(check("print('Hello, API!')").is_ok());
        assert!(check("x = [i * i for i in range(10)]\nsum(x)").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(check("").unwrap_err(), "empty");
        assert_eq!(check("   \n\t  ").unwrap_err(), "empty");
    }

    #[test]
    fn rejects_denylisted_patterns() {
        for pattern in DENYLIST {
            let code = format!("import os\n{pattern}'ls')");
            let reason = check(&code).unwrap_err();
            assert!(
                reason.contains(pattern),
                "reason {reason:?} should name {pattern:?}"
            );
        }
    }

    #[test]
    fn denylist_wins_over_valid_syntax() {
        // Perfectly parseable code still fails on the substring scan
        let reason = check("result = eval('1 + 1')").unwrap_err();
        assert!(reason.contains("eval("));
    }

    #[test]
    fn rejects_syntax_errors_with_diagnostic() {
        let reason = check("def broken(:\n    pass").unwrap_err();
        assert!(reason.starts_with("syntax error:"), "{reason}");
        assert!(reason.contains("line"), "{reason}");
    }

    #[test]
    fn rejects_unterminated_block() {
        let reason = check("if True:").unwrap_err();
        assert!(reason.starts_with("syntax error:"), "{reason}");
    }
}
