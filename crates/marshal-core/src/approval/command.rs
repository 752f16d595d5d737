//! Shell command splitting for allow-list matching.
//!
//! A chained command (`ls && rm -rf x`) is only as safe as its least safe
//! segment, so matching works per segment.

/// Split a command on `&&`, `||`, `;`, `|`, `&` and line breaks, ignoring
/// separators inside single or double quotes. Empty segments are dropped.
pub fn split_segments(command: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut chars = command.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '&' | '|' if chars.peek().map(|&(_, n)| n) == Some(c) => {
                parts.push(&command[start..i]);
                chars.next();
                start = i + 2;
            }
            ';' | '|' | '&' | '\n' | '\r' => {
                parts.push(&command[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&command[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// True when a segment runs or redirects something beyond its own tokens:
/// command substitution, process substitution or file redirection.
/// Quoting is not considered, since `"$(...)"` still expands.
pub fn has_side_channel(segment: &str) -> bool {
    segment.contains("$(") || segment.contains(['`', '>', '<'])
}

/// Tokenize one segment the way a POSIX shell would, falling back to plain
/// whitespace splitting for unbalanced quotes.
pub fn tokenize(segment: &str) -> Vec<String> {
    shlex::split(segment)
        .unwrap_or_else(|| segment.split_whitespace().map(str::to_string).collect())
}

/// Candidate allow-list keys for a segment: the segment itself, its first
/// token, and its first two tokens.
pub fn match_keys(segment: &str) -> Vec<String> {
    let mut keys = vec![segment.trim().to_string()];
    let tokens = tokenize(segment);
    if let Some(first) = tokens.first() {
        keys.push(first.clone());
    }
    if tokens.len() >= 2 {
        keys.push(format!("{} {}", tokens[0], tokens[1]));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    mod split_segments {
        use super::*;

        #[test]
        fn single_command() {
            assert_eq!(split_segments("ls -la"), vec!["ls -la"]);
        }

        #[test]
        fn chained_commands() {
            assert_eq!(
                split_segments("git status && npm test || echo fail; cat x | wc -l"),
                vec!["git status", "npm test", "echo fail", "cat x", "wc -l"]
            );
        }

        #[test]
        fn separators_inside_quotes_are_kept() {
            assert_eq!(
                split_segments("echo 'a && b' && echo \"c; d\""),
                vec!["echo 'a && b'", "echo \"c; d\""]
            );
        }

        #[test]
        fn empty_segments_dropped() {
            assert_eq!(split_segments(";; ls ;"), vec!["ls"]);
            assert!(split_segments("   ").is_empty());
        }

        #[test]
        fn line_breaks_and_background_operator_split() {
            assert_eq!(split_segments("ls\nrm -rf x"), vec!["ls", "rm -rf x"]);
            assert_eq!(split_segments("ls\r\npwd"), vec!["ls", "pwd"]);
            assert_eq!(split_segments("sleep 1 & rm x"), vec!["sleep 1", "rm x"]);
            assert_eq!(split_segments("ls |& rm x"), vec!["ls", "rm x"]);
        }

        #[test]
        fn quoted_line_break_stays_in_segment() {
            assert_eq!(split_segments("echo 'a\nb'"), vec!["echo 'a\nb'"]);
        }

        #[test]
        fn multibyte_text_is_sliced_safely() {
            assert_eq!(split_segments("echo héllo; ls"), vec!["echo héllo", "ls"]);
        }
    }

    mod has_side_channel {
        use super::*;

        #[test]
        fn substitution_and_redirection() {
            assert!(has_side_channel("echo $(id)"));
            assert!(has_side_channel("echo \"$(id)\""));
            assert!(has_side_channel("cat `id`"));
            assert!(has_side_channel("echo hi > ~/.bashrc"));
            assert!(has_side_channel("cat < /etc/shadow"));
            assert!(has_side_channel("diff <(ls) <(ls -a)"));
        }

        #[test]
        fn plain_commands() {
            assert!(!has_side_channel("ls -la"));
            assert!(!has_side_channel("echo $HOME"));
            assert!(!has_side_channel("git log --oneline"));
        }
    }

    mod tokenize {
        use super::*;

        #[test]
        fn respects_quotes() {
            assert_eq!(tokenize("git commit -m 'a b'"), vec!["git", "commit", "-m", "a b"]);
        }

        #[test]
        fn unbalanced_quotes_fall_back_to_whitespace() {
            assert_eq!(tokenize("echo 'oops"), vec!["echo", "'oops"]);
        }
    }

    mod match_keys {
        use super::*;

        #[test]
        fn exact_first_and_first_two() {
            assert_eq!(
                match_keys("git status --short"),
                vec!["git status --short", "git", "git status"]
            );
        }

        #[test]
        fn single_token() {
            assert_eq!(match_keys("pwd"), vec!["pwd", "pwd"]);
        }
    }
}
