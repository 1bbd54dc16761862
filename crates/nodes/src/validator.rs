use std::path::{Component, Path, PathBuf};

use regex::RegexSet;

use atc_protocol::defaults::MAX_ARGV_LENGTH;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("argv exceeds maximum length of {0} bytes")]
    ArgvTooLong(usize),
    #[error("command matches blocked pattern: {0}")]
    BlockedPattern(String),
    #[error("command '{0}' is not on the allowlist")]
    CommandNotAllowed(String),
    #[error("cwd contains a parent-directory traversal segment")]
    CwdTraversal,
    #[error("cwd escapes the allowed base directory")]
    CwdOutsideBase,
    #[error("environment variable '{0}' is not permitted")]
    ForbiddenEnvVar(String),
    #[error("environment value for '{0}' contains a disallowed character")]
    ForbiddenEnvValue(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Base commands that are always safe to allow: developer tools, language
/// runtimes, git, read-only inspection, and limited networking utilities.
const ALLOWLISTED_COMMANDS: &[&str] = &[
    // Developer tools
    "git", "cargo", "rustc", "npm", "npx", "yarn", "pnpm", "make", "cmake", "go", "gofmt",
    // Runtimes
    "node", "python", "python3", "ruby", "bun", "deno", "java",
    // Read-only inspection
    "ls", "cat", "head", "tail", "wc", "grep", "find", "pwd", "echo", "which", "file", "stat",
    "diff", "sort", "uniq", "env", "printenv", "basename", "dirname", "uname", "hostname", "date",
    // Limited networking
    "curl", "ping", "dig", "nslookup", "whois",
];

static BLOCKLIST_PATTERN_DEFS: &[(&str, &str)] = &[
    (r"rm\s+-[a-zA-Z]*r[a-zA-Z]*f", "rm -rf (destructive deletion)"),
    (r"\bsudo\b", "privilege escalation via sudo"),
    (r"\bsu\s+-", "privilege escalation via su"),
    (r"\|\s*sh\b", "pipe to shell"),
    (r"\|\s*bash\b", "pipe to shell"),
    (r"`[^`]*`", "command substitution via backticks"),
    (r"\$\([^)]*\)", "command substitution via $()"),
    (r"\.\./", "path traversal"),
    (r"\.\.\\", "path traversal"),
];

static BLOCKLIST_SET: std::sync::LazyLock<RegexSet> = std::sync::LazyLock::new(|| {
    RegexSet::new(BLOCKLIST_PATTERN_DEFS.iter().map(|(p, _)| *p))
        .unwrap_or_else(|e| panic!("built-in blocklist patterns must be valid regex: {e}"))
});

const FORBIDDEN_ENV_VARS: &[&str] = &["PATH", "LD_PRELOAD", "DYLD_INSERT_LIBRARIES"];

pub struct NodeCommandValidator {
    max_argv_length: usize,
    extra_allowlist: Vec<String>,
}

impl Default for NodeCommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCommandValidator {
    pub fn new() -> Self {
        Self {
            max_argv_length: MAX_ARGV_LENGTH,
            extra_allowlist: Vec::new(),
        }
    }

    pub fn with_extra_allowlist(mut self, extra: Vec<String>) -> Self {
        self.extra_allowlist = extra;
        self
    }

    /// Validate a node-exec argv vector against length, blocklist, and
    /// allowlist rules (spec §4.8).
    pub fn validate_arguments(&self, argv: &[String]) -> Result<()> {
        let flattened = argv.join(" ");
        if flattened.len() > self.max_argv_length {
            return Err(ValidationError::ArgvTooLong(self.max_argv_length));
        }

        if let Some(idx) = BLOCKLIST_SET.matches(&flattened).iter().next() {
            return Err(ValidationError::BlockedPattern(
                BLOCKLIST_PATTERN_DEFS[idx].1.to_string(),
            ));
        }

        let base = argv
            .first()
            .map(|s| base_command(s))
            .unwrap_or_default();
        let allowed = ALLOWLISTED_COMMANDS.contains(&base.as_str())
            || self.extra_allowlist.iter().any(|c| c == &base);
        if !allowed {
            return Err(ValidationError::CommandNotAllowed(base));
        }

        Ok(())
    }

    /// Reject any `..` segment; with `allowed_base`, also require
    /// containment within it.
    pub fn validate_cwd(&self, cwd: &Path, allowed_base: Option<&Path>) -> Result<()> {
        if cwd
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ValidationError::CwdTraversal);
        }
        if let Some(base) = allowed_base {
            let normalized_base = normalize(base);
            let normalized_cwd = normalize(cwd);
            if !normalized_cwd.starts_with(&normalized_base) {
                return Err(ValidationError::CwdOutsideBase);
            }
        }
        Ok(())
    }

    /// Forbid PATH/LD_PRELOAD/DYLD_INSERT_LIBRARIES and any value
    /// containing `..`, `|`, or `;`.
    pub fn validate_env(&self, env: &[(String, String)]) -> Result<()> {
        for (key, value) in env {
            if FORBIDDEN_ENV_VARS.contains(&key.as_str()) {
                return Err(ValidationError::ForbiddenEnvVar(key.clone()));
            }
            if value.contains("..") || value.contains('|') || value.contains(';') {
                return Err(ValidationError::ForbiddenEnvValue(key.clone()));
            }
        }
        Ok(())
    }

    /// Strip ASCII control characters from each argument.
    pub fn sanitize_arguments(&self, argv: &[String]) -> Vec<String> {
        argv.iter()
            .map(|arg| arg.chars().filter(|c| !c.is_control()).collect())
            .collect()
    }
}

fn base_command(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Lexical normalization (no filesystem access) so containment checks work
/// against paths that may not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            },
            Component::CurDir => {},
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_rm_rf() {
        let v = NodeCommandValidator::new();
        assert_eq!(
            v.validate_arguments(&argv(&["rm", "-rf", "/tmp/x"])),
            Err(ValidationError::BlockedPattern(
                "rm -rf (destructive deletion)".into()
            ))
        );
    }

    #[test]
    fn rejects_sudo() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_arguments(&argv(&["sudo", "ls"])),
            Err(ValidationError::BlockedPattern(_))
        ));
    }

    #[test]
    fn rejects_pipe_to_shell() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_arguments(&argv(&["curl", "http://x", "|", "sh"])),
            Err(ValidationError::BlockedPattern(_))
        ));
    }

    #[test]
    fn rejects_command_substitution() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_arguments(&argv(&["echo", "`whoami`"])),
            Err(ValidationError::BlockedPattern(_))
        ));
    }

    #[test]
    fn rejects_path_traversal_in_command_text() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_arguments(&argv(&["cat", "../../etc/passwd"])),
            Err(ValidationError::BlockedPattern(_))
        ));
    }

    #[test]
    fn accepts_allowlisted_command() {
        let v = NodeCommandValidator::new();
        assert!(v.validate_arguments(&argv(&["git", "status"])).is_ok());
    }

    #[test]
    fn rejects_command_not_on_allowlist() {
        let v = NodeCommandValidator::new();
        assert_eq!(
            v.validate_arguments(&argv(&["nc", "-l", "1234"])),
            Err(ValidationError::CommandNotAllowed("nc".into()))
        );
    }

    #[test]
    fn argv_length_ceiling_enforced() {
        let v = NodeCommandValidator::new();
        let long_arg = "a".repeat(MAX_ARGV_LENGTH + 1);
        assert_eq!(
            v.validate_arguments(&argv(&["echo", &long_arg])),
            Err(ValidationError::ArgvTooLong(MAX_ARGV_LENGTH))
        );
    }

    #[test]
    fn cwd_traversal_rejected() {
        let v = NodeCommandValidator::new();
        assert_eq!(
            v.validate_cwd(Path::new("../etc"), None),
            Err(ValidationError::CwdTraversal)
        );
    }

    #[test]
    fn cwd_containment_enforced() {
        let v = NodeCommandValidator::new();
        let base = Path::new("/home/user/workspace");
        assert!(v.validate_cwd(Path::new("/home/user/workspace/sub"), Some(base)).is_ok());
        assert_eq!(
            v.validate_cwd(Path::new("/etc"), Some(base)),
            Err(ValidationError::CwdOutsideBase)
        );
    }

    #[test]
    fn env_forbids_path_and_preload_vars() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_env(&[("PATH".into(), "/usr/bin".into())]),
            Err(ValidationError::ForbiddenEnvVar(_))
        ));
        assert!(matches!(
            v.validate_env(&[("LD_PRELOAD".into(), "evil.so".into())]),
            Err(ValidationError::ForbiddenEnvVar(_))
        ));
    }

    #[test]
    fn env_forbids_dangerous_value_characters() {
        let v = NodeCommandValidator::new();
        assert!(matches!(
            v.validate_env(&[("FOO".into(), "bar;rm -rf /".into())]),
            Err(ValidationError::ForbiddenEnvValue(_))
        ));
        assert!(matches!(
            v.validate_env(&[("FOO".into(), "../secret".into())]),
            Err(ValidationError::ForbiddenEnvValue(_))
        ));
    }

    #[test]
    fn sanitize_strips_control_characters() {
        let v = NodeCommandValidator::new();
        let sanitized = v.sanitize_arguments(&argv(&["hello\u{0007}world"]));
        assert_eq!(sanitized[0], "helloworld");
    }
}
