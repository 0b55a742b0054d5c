use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Structured explanation of an abnormal exit.
///
/// Derived purely from the log buffer captured at exit, so it stays
/// available after the process is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    /// What went wrong.
    pub error: String,
    /// Recommended fix.
    pub solution: String,
    /// Background on the failure class.
    pub context: String,
    /// Source file from the innermost traceback frame, when present.
    pub file: Option<String>,
    /// Line number within `file`, when present.
    pub line: Option<u32>,
    /// When the crash was observed.
    pub crashed_at: Option<DateTime<Utc>>,
}

/// One crash signature: a pattern plus message templates.
///
/// Templates may reference capture groups with `$1`, `$2`, ...
/// The rule set is data, not code: new signatures are added by
/// extending the table, never by touching the matching engine.
#[derive(Debug, Clone)]
pub struct CrashRule {
    /// Pattern matched against individual output lines.
    pub pattern: Regex,
    /// Template for [`Diagnosis::error`].
    pub error: String,
    /// Template for [`Diagnosis::solution`].
    pub solution: String,
    /// Template for [`Diagnosis::context`].
    pub context: String,
}

impl CrashRule {
    /// Builds a rule, panicking on an invalid pattern. Intended for
    /// static tables assembled at startup.
    pub fn new(pattern: &str, error: &str, solution: &str, context: &str) -> Self {
        Self {
            pattern: Regex::new(pattern).unwrap_or_else(|e| {
                panic!("invalid crash rule pattern {:?}: {}", pattern, e)
            }),
            error: error.to_string(),
            solution: solution.to_string(),
            context: context.to_string(),
        }
    }
}

/// Parses captured failure output into a [`Diagnosis`].
///
/// Rules are evaluated in order; within a rule the most recent matching
/// line wins. When nothing matches, the diagnosis carries the raw final
/// lines and says so explicitly; a cause is never fabricated.
pub struct CrashDiagnoser {
    rules: Vec<CrashRule>,
    location: Regex,
}

impl CrashDiagnoser {
    /// Diagnoser with the built-in rule table.
    pub fn new() -> Self {
        Self::with_rules(built_in_rules())
    }

    /// Diagnoser over a custom rule table, evaluated in the given order.
    pub fn with_rules(rules: Vec<CrashRule>) -> Self {
        Self {
            rules,
            location: Regex::new(r#"File "([^"]+)", line (\d+)"#)
                .unwrap_or_else(|e| panic!("invalid location pattern: {}", e)),
        }
    }

    /// Diagnoses `lines` (oldest first, as captured at exit).
    pub fn diagnose(&self, lines: &[String], crashed_at: Option<DateTime<Utc>>) -> Diagnosis {
        let (file, line) = self.last_location(lines);

        for rule in &self.rules {
            // Newest line first: the bottom of the traceback is the cause.
            for candidate in lines.iter().rev() {
                if let Some(caps) = rule.pattern.captures(candidate) {
                    let mut error = String::new();
                    caps.expand(&rule.error, &mut error);
                    let mut solution = String::new();
                    caps.expand(&rule.solution, &mut solution);
                    let mut context = String::new();
                    caps.expand(&rule.context, &mut context);

                    return Diagnosis {
                        error,
                        solution,
                        context,
                        file,
                        line,
                        crashed_at,
                    };
                }
            }
        }

        let last_lines: Vec<&str> = lines
            .iter()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(5)
            .map(String::as_str)
            .collect();
        let error = if last_lines.is_empty() {
            "No error output captured".to_string()
        } else {
            last_lines
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n")
        };

        Diagnosis {
            error,
            solution: "Check the full logs for more information".to_string(),
            context: "no known crash pattern matched".to_string(),
            file,
            line,
            crashed_at,
        }
    }

    // Innermost traceback frame is the last location printed.
    fn last_location(&self, lines: &[String]) -> (Option<String>, Option<u32>) {
        for line in lines.iter().rev() {
            if let Some(caps) = self.location.captures(line) {
                let file = caps.get(1).map(|m| m.as_str().to_string());
                let line_no = caps.get(2).and_then(|m| m.as_str().parse().ok());
                return (file, line_no);
            }
        }
        (None, None)
    }
}

impl Default for CrashDiagnoser {
    fn default() -> Self {
        Self::new()
    }
}

/// The built-in crash signature table, in evaluation order.
pub fn built_in_rules() -> Vec<CrashRule> {
    vec![
        CrashRule::new(
            r"ModuleNotFoundError: No module named '([^']+)'",
            "Missing module: $1",
            "Run: pip install $1",
            "Module is not installed in the current environment",
        ),
        CrashRule::new(
            r"ImportError: cannot import name '([^']+)' from '([^']+)'",
            "Import failure: '$1' from '$2'",
            "Fix the import of '$1' in module '$2'",
            "The name does not exist in the target module",
        ),
        CrashRule::new(
            r"ImportError: (.+)",
            "Import failure: $1",
            "Check the imports at the reported location",
            "A module or name could not be imported",
        ),
        CrashRule::new(
            r"Address already in use",
            "Port already in use",
            "The port is occupied by another process",
            "The runner should have prevented this - please report this bug",
        ),
        CrashRule::new(
            r"SyntaxError: (.+)",
            "Syntax error: $1",
            "Fix the syntax error at the reported location",
            "The application source failed to parse",
        ),
        CrashRule::new(
            r"IndentationError: (.+)",
            "Indentation error: $1",
            "Fix the indentation at the reported location",
            "The application source failed to parse",
        ),
        CrashRule::new(
            r"PermissionError: (.+)",
            "Permission denied: $1",
            "Check filesystem permissions for the reported path",
            "The process lacks access to a required file or directory",
        ),
    ]
}
