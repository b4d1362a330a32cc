//! Sandbox environment construction.

use skillguard_core::EnvPolicy;
use std::collections::BTreeMap;

/// Name fragments that mark a variable as credential-like. Matched
/// case-insensitively anywhere in the name.
pub const SENSITIVE_NAME_FRAGMENTS: &[&str] = &[
    "KEY",
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
    "PRIVATE",
    "AUTH",
    "SESSION",
    "COOKIE",
];

pub fn is_sensitive_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_NAME_FRAGMENTS.iter().any(|f| upper.contains(f))
}

/// The environment a skill runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxEnv {
    pub vars: BTreeMap<String, String>,
    /// Allow-listed names refused because they look like credentials.
    pub withheld: Vec<String>,
}

/// Build the environment from an empty map: allow-listed host values that
/// are not sensitive, then forced injections on top.
///
/// `host` looks up a host variable; production callers pass [`host_var`].
pub fn build_env(policy: &EnvPolicy, host: impl Fn(&str) -> Option<String>) -> SandboxEnv {
    let mut env = SandboxEnv::default();

    for name in &policy.allow_list {
        if is_sensitive_name(name) {
            env.withheld.push(name.clone());
            continue;
        }
        if let Some(value) = host(name) {
            env.vars.insert(name.clone(), value);
        }
    }

    for (name, value) in &policy.inject {
        env.vars.insert(name.clone(), value.clone());
    }

    env
}

pub fn host_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> Option<String> {
        match name {
            "PATH" => Some("/usr/bin:/bin".to_owned()),
            "HOME" => Some("/home/skill".to_owned()),
            "SECRET_API_KEY" => Some("sk-live".to_owned()),
            "OPENAI_TOKEN" => Some("tok".to_owned()),
            "DB_PASSWORD" => Some("hunter2".to_owned()),
            "LANG" => Some("C.UTF-8".to_owned()),
            _ => None,
        }
    }

    fn policy(allow: &[&str], inject: &[(&str, &str)]) -> EnvPolicy {
        EnvPolicy {
            allow_list: allow.iter().map(|s| (*s).to_owned()).collect(),
            inject: inject
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    #[test]
    fn sensitive_names_never_propagate_even_when_allow_listed() {
        let env = build_env(
            &policy(&["PATH", "SECRET_API_KEY", "OPENAI_TOKEN", "DB_PASSWORD"], &[]),
            host,
        );
        assert_eq!(env.vars.len(), 1);
        assert!(env.vars.contains_key("PATH"));
        assert_eq!(env.withheld, ["SECRET_API_KEY", "OPENAI_TOKEN", "DB_PASSWORD"]);
    }

    #[test]
    fn only_present_host_values_are_copied() {
        let env = build_env(&policy(&["PATH", "TZ"], &[]), host);
        assert!(env.vars.contains_key("PATH"));
        assert!(!env.vars.contains_key("TZ"));
        assert!(env.withheld.is_empty());
    }

    #[test]
    fn injected_values_always_win() {
        let env = build_env(
            &policy(&["HOME"], &[("HOME", "/tmp"), ("SKILLGUARD_SANDBOX", "1")]),
            host,
        );
        assert_eq!(env.vars["HOME"], "/tmp");
        assert_eq!(env.vars["SKILLGUARD_SANDBOX"], "1");
    }

    #[test]
    fn injection_bypasses_the_sensitive_filter() {
        let env = build_env(&policy(&[], &[("SKILL_TOKEN", "scoped")]), host);
        assert_eq!(env.vars["SKILL_TOKEN"], "scoped");
    }

    #[test]
    fn unlisted_host_variables_are_absent() {
        let env = build_env(&policy(&["PATH"], &[]), host);
        assert!(!env.vars.contains_key("LANG"));
    }

    #[test]
    fn sensitivity_is_case_insensitive() {
        assert!(is_sensitive_name("github_token"));
        assert!(is_sensitive_name("Aws_Secret_Access_Key"));
        assert!(is_sensitive_name("SSH_AUTH_SOCK"));
        assert!(!is_sensitive_name("PATH"));
        assert!(!is_sensitive_name("LC_ALL"));
    }
}
