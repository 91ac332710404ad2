//! Argument tokenizer.
//!
//! Splits a command line into tokens. Runs of spaces separate tokens;
//! leading/trailing spaces are discarded. A token starting with `"` extends
//! to the next `"`, with the quotes stripped; an unterminated quote
//! discards the partial token and ends parsing. Empty input yields zero
//! tokens.

/// Tokenizes `line`, returning owned tokens in order.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        // Skip runs of spaces.
        while matches!(chars.peek(), Some(' ')) {
            chars.next();
        }

        let Some(&first) = chars.peek() else {
            break;
        };

        if first == '"' {
            chars.next(); // consume opening quote
            let mut tok = String::new();
            let mut terminated = false;

            for c in chars.by_ref() {
                if c == '"' {
                    terminated = true;
                    break;
                }
                tok.push(c);
            }

            if !terminated {
                // Unterminated quote: discard the partial token and stop.
                break;
            }
            tokens.push(tok);
        } else {
            let mut tok = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                tok.push(c);
                chars.next();
            }
            tokens.push(tok);
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn splits_on_runs_of_spaces() {
        assert_eq!(
            tokenize("  follow   alice@x   bob@x  "),
            vec!["follow", "alice@x", "bob@x"]
        );
    }

    #[test]
    fn strips_quotes_and_keeps_interior_spaces() {
        assert_eq!(
            tokenize(r#"cip "hello #world""#),
            vec!["cip", "hello #world"]
        );
    }

    #[test]
    fn unterminated_quote_discards_partial_token() {
        assert_eq!(tokenize(r#"cip "hello"#), vec!["cip"]);
    }

    #[test]
    fn multiple_quoted_tokens() {
        assert_eq!(
            tokenize(r#""a b" "c d""#),
            vec!["a b", "c d"]
        );
    }
}
