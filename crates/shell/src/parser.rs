//! Command-line tokenization (spec §6): redirection syntax `<`, `>`, `>>`,
//! and trailing `&` for background jobs.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing redirection target")]
    MissingTarget,
    #[error("empty command")]
    EmptyCommand,
}

/// A single parsed command line, ready to hand to [`crate::builtins::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub argv: Vec<String>,
    pub stdin_path: Option<String>,
    pub stdout_path: Option<String>,
    pub append: bool,
    pub background: bool,
}

/// Splits `line` on whitespace, pulling out `<file`, `>file`/`>>file`, and a
/// trailing `&` as they're encountered; everything else accumulates into
/// `argv` in order. `argv[0]` is the command name.
pub fn parse_line(line: &str) -> Result<ParsedLine, ParseError> {
    let mut argv = Vec::new();
    let mut stdin_path = None;
    let mut stdout_path = None;
    let mut append = false;
    let mut background = false;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token == "&" {
            background = true;
            continue;
        }
        if let Some(rest) = token.strip_prefix(">>") {
            append = true;
            stdout_path = Some(take_operand(rest, &mut iter)?);
            continue;
        }
        if let Some(rest) = token.strip_prefix('>') {
            stdout_path = Some(take_operand(rest, &mut iter)?);
            continue;
        }
        if let Some(rest) = token.strip_prefix('<') {
            stdin_path = Some(take_operand(rest, &mut iter)?);
            continue;
        }
        argv.push(token.to_string());
    }

    if argv.is_empty() {
        return Err(ParseError::EmptyCommand);
    }

    Ok(ParsedLine {
        argv,
        stdin_path,
        stdout_path,
        append,
        background,
    })
}

/// A redirection operator's operand is either glued to it (`>out.txt`) or
/// the next whitespace-separated token (`> out.txt`).
fn take_operand<'a>(
    glued: &'a str,
    iter: &mut std::iter::Peekable<std::vec::IntoIter<&'a str>>,
) -> Result<String, ParseError> {
    if !glued.is_empty() {
        return Ok(glued.to_string());
    }
    iter.next().map(str::to_string).ok_or(ParseError::MissingTarget)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_has_no_redirection() {
        let parsed = parse_line("ls -l").unwrap();
        assert_eq!(parsed.argv, vec!["ls", "-l"]);
        assert_eq!(parsed.stdin_path, None);
        assert_eq!(parsed.stdout_path, None);
        assert!(!parsed.append);
        assert!(!parsed.background);
    }

    #[test]
    fn output_redirection_glued_and_spaced() {
        let glued = parse_line("cat a.txt >b.txt").unwrap();
        assert_eq!(glued.stdout_path, Some("b.txt".to_string()));
        assert!(!glued.append);

        let spaced = parse_line("cat a.txt > b.txt").unwrap();
        assert_eq!(spaced.stdout_path, Some("b.txt".to_string()));
    }

    #[test]
    fn append_redirection_sets_append_flag() {
        let parsed = parse_line("cat a.txt >> b.txt").unwrap();
        assert_eq!(parsed.stdout_path, Some("b.txt".to_string()));
        assert!(parsed.append);
    }

    #[test]
    fn input_redirection_and_background_compose() {
        let parsed = parse_line("busy < in.txt &").unwrap();
        assert_eq!(parsed.argv, vec!["busy"]);
        assert_eq!(parsed.stdin_path, Some("in.txt".to_string()));
        assert!(parsed.background);
    }

    #[test]
    fn both_redirections_together() {
        let parsed = parse_line("cp -h < in.txt > out.txt").unwrap();
        assert_eq!(parsed.argv, vec!["cp", "-h"]);
        assert_eq!(parsed.stdin_path, Some("in.txt".to_string()));
        assert_eq!(parsed.stdout_path, Some("out.txt".to_string()));
    }

    #[test]
    fn dangling_redirection_operator_is_an_error() {
        assert_eq!(parse_line("cat a.txt >").unwrap_err(), ParseError::MissingTarget);
    }

    #[test]
    fn blank_line_is_an_empty_command_error() {
        assert_eq!(parse_line("   ").unwrap_err(), ParseError::EmptyCommand);
    }
}
