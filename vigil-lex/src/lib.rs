#![forbid(unsafe_code)]

mod lexer;
mod token;

pub use lexer::{LexError, Lexer};
pub use token::{Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .lex()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lex_indent_and_dedent_blocks() {
        let ks = kinds("def f(x):\n    return x\ny = 1\n");
        assert_eq!(
            ks,
            vec![
                TokenKind::KwDef,
                TokenKind::Name("f".into()),
                TokenKind::LParen,
                TokenKind::Name("x".into()),
                TokenKind::RParen,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::KwReturn,
                TokenKind::Name("x".into()),
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::Name("y".into()),
                TokenKind::Eq,
                TokenKind::Number("1".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_skips_blank_and_comment_lines() {
        let ks = kinds("x = 1\n\n    # indented comment\n\ny = 2  # trailing\n");
        assert!(!ks.contains(&TokenKind::Indent));
        assert_eq!(ks.iter().filter(|k| **k == TokenKind::Newline).count(), 2);
    }

    #[test]
    fn lex_joins_lines_inside_brackets() {
        let ks = kinds("x = f(1,\n      2)\n");
        assert_eq!(ks.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
        assert!(!ks.contains(&TokenKind::Indent));
    }

    #[test]
    fn lex_backslash_continuation() {
        let ks = kinds("x = 1 + \\\n    2\n");
        assert_eq!(ks.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
        assert!(!ks.contains(&TokenKind::Indent));
    }

    #[test]
    fn lex_keeps_string_literals_raw() {
        let ks = kinds("s = rb'a\\'b' + f\"{x}\" + \"\"\"doc\nstring\"\"\"\n");
        let strings: Vec<String> = ks
            .into_iter()
            .filter_map(|k| match k {
                TokenKind::String(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            strings,
            vec![
                "rb'a\\'b'".to_string(),
                "f\"{x}\"".to_string(),
                "\"\"\"doc\nstring\"\"\"".to_string(),
            ]
        );
    }

    #[test]
    fn lex_numbers_keep_source_text() {
        let ks = kinds("n = [1_000, 0xFF, 1.5e3, .5, 2j, 3.]\n");
        let nums: Vec<String> = ks
            .into_iter()
            .filter_map(|k| match k {
                TokenKind::Number(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(nums, vec!["1_000", "0xFF", "1.5e3", ".5", "2j", "3."]);
    }

    #[test]
    fn lex_augmented_assignment_operators() {
        let ks = kinds("x //= 2\ny **= 3\n");
        assert!(ks.contains(&TokenKind::AugAssign("//".into())));
        assert!(ks.contains(&TokenKind::AugAssign("**".into())));
    }

    #[test]
    fn lex_rejects_inconsistent_dedent() {
        let err = Lexer::new("if x:\n        a = 1\n    b = 2\n").lex().unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn lex_rejects_unterminated_string() {
        let err = Lexer::new("x = 'abc\n").lex().unwrap_err();
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn lex_closes_open_indents_at_eof() {
        let ks = kinds("class A:\n    def f(self):\n        pass");
        let tail: Vec<_> = ks.iter().rev().take(4).cloned().collect();
        assert_eq!(
            tail,
            vec![
                TokenKind::Eof,
                TokenKind::Dedent,
                TokenKind::Dedent,
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn lex_long_literals_on_a_small_stack() {
        let doc = "quotes ' and \" inside, an escaped \\\" and a \\\\ pair\n".repeat(4000);
        let src = format!("def f():\n    \"\"\"{doc}\"\"\"\n    return '{}'\n", "x\\'".repeat(20000));
        let strings = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                Lexer::new(&src)
                    .lex()
                    .unwrap()
                    .into_iter()
                    .filter(|t| matches!(t.kind, TokenKind::String(_)))
                    .count()
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(strings, 2);
    }

    #[test]
    fn lex_string_terminators() {
        let ks = kinds("a = \"\"\"\"\"\"\nb = '' ''\nc = '''x''''y'\n");
        let strings: Vec<String> = ks
            .into_iter()
            .filter_map(|k| match k {
                TokenKind::String(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(strings, vec!["\"\"\"\"\"\"", "''", "''", "'''x'''", "'y'"]);

        let err = Lexer::new("s = '''open\n").lex().unwrap_err();
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn lex_skips_leading_byte_order_mark() {
        let toks = Lexer::new("\u{feff}x = 1\n").lex().unwrap();
        assert_eq!(toks[0].kind, TokenKind::Name("x".into()));
        assert_eq!(toks[0].span.offset(), 3);
        assert!(!toks.iter().any(|t| t.kind == TokenKind::Indent));
    }

    #[test]
    fn lex_rejects_byte_order_mark_after_start() {
        let err = Lexer::new("x = 1\n\u{feff}y = 2\n").lex().unwrap_err();
        assert!(err.message.contains("U+FEFF"));
        assert_eq!(err.span.offset(), 6);
    }

    #[test]
    fn lex_identifiers_follow_xid_classes() {
        assert_eq!(kinds("\u{e9}t\u{e9} = 1\n")[0], TokenKind::Name("\u{e9}t\u{e9}".into()));
        assert_eq!(kinds("_x1 = 1\n")[0], TokenKind::Name("_x1".into()));

        // No-break space and the euro sign are not identifier characters.
        assert!(Lexer::new("a\u{a0}= 1\n").lex().is_err());
        assert!(Lexer::new("\u{20ac} = 1\n").lex().is_err());
    }
}
