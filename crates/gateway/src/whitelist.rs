//! Command whitelist — the single authoriser for remote execution.
//!
//! A closed registry maps `action_type` to a command pattern. Parameterized
//! patterns use `{name}` placeholders; each extracted parameter must satisfy
//! its own regex. Exact-match entries (no placeholders) must equal the fixed
//! command byte-for-byte. Every rejection is logged at warn level with the
//! command, action type, and reason.

use std::collections::HashMap;

use regex::Regex;

/// Characters that enable shell injection. Checked against the whole command
/// for parameterized patterns (exact-match commands are fixed strings and
/// may legitimately contain `&&`).
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '>', '<'];

/// Service names: conservative systemd-unit charset, capped at 64.
const SERVICE_NAME_PATTERN: &str = "^[A-Za-z0-9_-]{1,64}$";

struct WhitelistEntry {
    pattern: &'static str,
    /// Compiled from `pattern`: literal text escaped, `{name}` → `(\S+)`.
    matcher: Regex,
    /// Placeholder names in order of appearance.
    param_names: Vec<String>,
    /// Per-parameter validation regexes.
    param_validation: HashMap<&'static str, Regex>,
}

impl WhitelistEntry {
    fn is_exact(&self) -> bool {
        self.param_names.is_empty()
    }
}

pub struct CommandWhitelist {
    entries: HashMap<&'static str, WhitelistEntry>,
}

impl CommandWhitelist {
    /// The standard registry: `restart_service`, `apply_updates`,
    /// `clear_logs`.
    pub fn standard() -> Self {
        let mut entries = HashMap::new();

        entries.insert(
            "restart_service",
            entry(
                "systemctl restart {service_name}",
                &[("service_name", SERVICE_NAME_PATTERN)],
            ),
        );
        entries.insert(
            "apply_updates",
            entry("apt-get update && apt-get upgrade -y", &[]),
        );
        entries.insert("clear_logs", entry("journalctl --vacuum-time=7d", &[]));

        Self { entries }
    }

    /// Validate `command` against the registered pattern for `action_type`.
    /// Returns the extracted parameters on success, the rejection reason on
    /// failure. This is the only authoriser for execution.
    pub fn check(
        &self,
        command: &str,
        action_type: &str,
    ) -> Result<HashMap<String, String>, String> {
        let entry = match self.entries.get(action_type) {
            Some(entry) => entry,
            None => {
                let reason = format!("unknown action type '{action_type}'");
                self.log_rejection(command, action_type, &reason);
                return Err(reason);
            }
        };

        if entry.is_exact() {
            if command == entry.pattern {
                return Ok(HashMap::new());
            }
            let reason = format!("command must exactly match '{}'", entry.pattern);
            self.log_rejection(command, action_type, &reason);
            return Err(reason);
        }

        if let Some(bad) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            let reason = format!("command contains shell metacharacter '{bad}'");
            self.log_rejection(command, action_type, &reason);
            return Err(reason);
        }

        let captures = match entry.matcher.captures(command) {
            Some(captures) => captures,
            None => {
                let reason = format!("command doesn't match pattern '{}'", entry.pattern);
                self.log_rejection(command, action_type, &reason);
                return Err(reason);
            }
        };

        let mut params = HashMap::new();
        for (i, name) in entry.param_names.iter().enumerate() {
            let value = captures
                .get(i + 1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            if let Some(validation) = entry.param_validation.get(name.as_str()) {
                if !validation.is_match(&value) {
                    let reason = format!("parameter '{name}' failed validation");
                    self.log_rejection(command, action_type, &reason);
                    return Err(reason);
                }
            }
            params.insert(name.clone(), value);
        }

        Ok(params)
    }

    pub fn action_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.entries.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn log_rejection(&self, command: &str, action_type: &str, reason: &str) {
        tracing::warn!(command, action_type, reason, "command rejected by whitelist");
    }
}

fn entry(pattern: &'static str, params: &[(&'static str, &'static str)]) -> WhitelistEntry {
    let (matcher, param_names) = compile_pattern(pattern);
    let param_validation = params
        .iter()
        .map(|(name, regex)| {
            (
                *name,
                Regex::new(regex).expect("whitelist param regex is valid"),
            )
        })
        .collect();
    WhitelistEntry {
        pattern,
        matcher,
        param_names,
        param_validation,
    }
}

/// Turn a `{name}`-templated pattern into an anchored regex with one capture
/// group per placeholder. Returns the regex and the placeholder names.
pub fn compile_pattern(pattern: &str) -> (Regex, Vec<String>) {
    let mut regex_text = String::from("^");
    let mut names = Vec::new();
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        regex_text.push_str(&regex::escape(literal));
        let close = tail.find('}').expect("unbalanced placeholder in pattern");
        names.push(tail[1..close].to_string());
        regex_text.push_str(r"(\S+)");
        rest = &tail[close + 1..];
    }
    regex_text.push_str(&regex::escape(rest));
    regex_text.push('$');

    (
        Regex::new(&regex_text).expect("compiled whitelist pattern is valid"),
        names,
    )
}

/// Extract named parameters from a command using a `{name}` pattern.
/// `None` when the command does not match the pattern shape.
pub fn extract_params(command: &str, pattern: &str) -> Option<HashMap<String, String>> {
    let (matcher, names) = compile_pattern(pattern);
    let captures = matcher.captures(command)?;
    Some(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    name.clone(),
                    captures
                        .get(i + 1)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                )
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> CommandWhitelist {
        CommandWhitelist::standard()
    }

    #[test]
    fn valid_restart_service_passes() {
        let params = whitelist()
            .check("systemctl restart nginx", "restart_service")
            .unwrap();
        assert_eq!(params.get("service_name").unwrap(), "nginx");
    }

    #[test]
    fn unknown_action_type_rejected() {
        let err = whitelist().check("ls", "list_files").unwrap_err();
        assert!(err.contains("unknown action type"));
    }

    #[test]
    fn wrong_shape_rejected() {
        let err = whitelist()
            .check("service nginx restart", "restart_service")
            .unwrap_err();
        assert!(err.contains("pattern"));
    }

    #[test]
    fn exact_match_commands() {
        assert!(whitelist()
            .check("apt-get update && apt-get upgrade -y", "apply_updates")
            .is_ok());
        assert!(whitelist()
            .check("journalctl --vacuum-time=7d", "clear_logs")
            .is_ok());
        // Truncated or modified fixed commands fail.
        assert!(whitelist().check("apt-get update", "apply_updates").is_err());
        assert!(whitelist()
            .check("journalctl --vacuum-time=30d", "clear_logs")
            .is_err());
    }

    #[test]
    fn metacharacters_rejected() {
        let cases = [
            "systemctl restart nginx; rm -rf /",
            "systemctl restart nginx|cat /etc/passwd",
            "systemctl restart $(whoami)",
            "systemctl restart `whoami`",
            "systemctl restart nginx & echo pwned",
            "systemctl restart nginx > /tmp/out",
            "systemctl restart nginx < /tmp/in",
        ];
        for command in cases {
            let err = whitelist().check(command, "restart_service").unwrap_err();
            assert!(
                err.contains("metacharacter"),
                "{command}: unexpected reason {err}"
            );
        }
    }

    #[test]
    fn service_name_charset_and_length() {
        let wl = whitelist();
        assert!(wl.check("systemctl restart docker-compose", "restart_service").is_ok());
        assert!(wl.check("systemctl restart my_service", "restart_service").is_ok());

        // Two tokens fail the pattern shape.
        assert!(wl.check("systemctl restart my service", "restart_service").is_err());

        let sixty_four = "a".repeat(64);
        assert!(wl
            .check(&format!("systemctl restart {sixty_four}"), "restart_service")
            .is_ok());
        let sixty_five = "a".repeat(65);
        let err = wl
            .check(&format!("systemctl restart {sixty_five}"), "restart_service")
            .unwrap_err();
        assert!(err.contains("service_name"));
    }

    #[test]
    fn empty_service_name_rejected() {
        assert!(whitelist().check("systemctl restart ", "restart_service").is_err());
    }

    #[test]
    fn extract_params_single_and_multiple() {
        let params = extract_params("systemctl restart nginx", "systemctl restart {service_name}")
            .unwrap();
        assert_eq!(params.get("service_name").unwrap(), "nginx");

        let params = extract_params(
            "cp /src/file.txt /dst/file.txt",
            "cp {source} {destination}",
        )
        .unwrap();
        assert_eq!(params.get("source").unwrap(), "/src/file.txt");
        assert_eq!(params.get("destination").unwrap(), "/dst/file.txt");
    }

    #[test]
    fn extract_params_none_on_mismatch() {
        assert!(extract_params("reboot now", "systemctl restart {service_name}").is_none());
    }

    #[test]
    fn action_types_are_closed_and_sorted() {
        assert_eq!(
            whitelist().action_types(),
            vec!["apply_updates", "clear_logs", "restart_service"]
        );
    }
}
