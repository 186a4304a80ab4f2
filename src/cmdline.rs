//! Synthesis of the command line handed to the child or to the system
//! interpreter: whitespace quoting, metacharacter escaping, and the policy
//! for when a launch must be wrapped in the interpreter at all.

use std::path::Path;

/// Bytes the interpreter assigns meaning to. Each is prefixed with the
/// escape marker by [`shell_escape`].
const SHELL_CHARS: &[u8] = br#""'`$\|&;<>()*?[]#~!{}"#;

/// The extension that reroutes a direct program launch through the
/// interpreter.
const SCRIPT_EXTENSION: &str = "sh";

/// Whether `s` must be wrapped in quotes to survive as a single token.
pub fn needs_quoting(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_whitespace())
}

/// Concatenate `argv0` and `args` into one command line.
///
/// `argv0` is quoted when it contains whitespace; each argument is quoted
/// when it contains whitespace or is empty. Tokens are separated by a
/// single space. Embedded quote characters are not escaped at this layer;
/// callers that need literal quotes must pre-escape.
pub fn build_command_line<S: AsRef<str>>(argv0: &str, args: &[S]) -> String {
    let mut line = String::with_capacity(argv0.len());
    push_token(&mut line, argv0, needs_quoting(argv0));

    for arg in args {
        let arg = arg.as_ref();
        line.push(' ');
        push_token(&mut line, arg, needs_quoting(arg) || arg.is_empty());
    }
    line
}

/// Append one token, quoted or bare.
fn push_token(line: &mut String, token: &str, quote: bool) {
    if quote {
        line.push('"');
        line.push_str(token);
        line.push('"');
    } else {
        line.push_str(token);
    }
}

/// Join `argv0` and `args` with single spaces and no quoting at all; the
/// form handed to interpreters that lack quote support.
pub fn join_unquoted<S: AsRef<str>>(argv0: &str, args: &[S]) -> String {
    let mut line = argv0.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}

/// Escape an already-built command line for the interpreter.
///
/// Every shell-significant character is prefixed with the escape marker,
/// including any quote characters the quoting layer inserted, so this must
/// be applied exactly once. Carriage returns and line feeds become a single
/// space; the native launch call treats them as whitespace at best and a
/// command boundary at worst, so they never pass through.
pub fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(2 * s.len());
    for ch in s.chars() {
        if ch == '\r' || ch == '\n' {
            escaped.push(' ');
            continue;
        }
        if ch.is_ascii() && SHELL_CHARS.contains(&(ch as u8)) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Strip one surrounding pair of quote characters, if present.
pub fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Whether a resolved program is a script the interpreter must run.
pub fn is_script(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SCRIPT_EXTENSION))
}

/// Whether the interpreter is one of the legacy variants without quote
/// support, detected by its name.
pub fn legacy_interpreter(shell: &str) -> bool {
    Path::new(shell)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with("csh"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens() {
        assert_eq!(build_command_line("prog", &["a", "b"]), "prog a b");
    }

    #[test]
    fn whitespace_quoted() {
        assert_eq!(
            build_command_line("my prog", &["one two", "three"]),
            "\"my prog\" \"one two\" three"
        );
    }

    #[test]
    fn empty_argument_quoted() {
        assert_eq!(build_command_line("prog", &[""]), "prog \"\"");
    }

    #[test]
    fn quotes_pass_through_unescaped() {
        assert_eq!(build_command_line("prog", &["say \"hi\""]), "prog \"say \"hi\"\"");
    }

    #[test]
    fn no_quotes_without_whitespace() {
        let line = build_command_line("prog", &["plain"]);
        assert!(!line.contains('"'));
    }

    #[test]
    fn escape_metacharacters_once() {
        assert_eq!(shell_escape("a|b"), "a\\|b");
        assert_eq!(shell_escape("$(x)"), "\\$\\(x\\)");
        assert_eq!(shell_escape("\"quoted\""), "\\\"quoted\\\"");
    }

    #[test]
    fn escape_maps_line_breaks_to_spaces() {
        assert_eq!(shell_escape("a\r\nb"), "a  b");
        assert_eq!(shell_escape("a\nb"), "a b");
    }

    #[test]
    fn escape_leaves_plain_text_alone() {
        assert_eq!(shell_escape("/tmp/plain-file_1.sh"), "/tmp/plain-file_1.sh");
    }

    #[test]
    fn strip_surrounding_quotes() {
        assert_eq!(strip_quotes("\"/bin/a prog\""), "/bin/a prog");
        assert_eq!(strip_quotes("/bin/plain"), "/bin/plain");
        assert_eq!(strip_quotes("\"unbalanced"), "\"unbalanced");
    }

    #[test]
    fn script_detection() {
        assert!(is_script("/srv/task.sh"));
        assert!(is_script("/srv/task.SH"));
        assert!(!is_script("/srv/task"));
        assert!(!is_script("/srv/task.shx"));
    }

    #[test]
    fn legacy_interpreters() {
        assert!(legacy_interpreter("/bin/csh"));
        assert!(legacy_interpreter("/usr/bin/tcsh"));
        assert!(!legacy_interpreter("/bin/sh"));
        assert!(!legacy_interpreter("/bin/bash"));
    }
}
