//! Hand-written lexer. One pass over `&str`, no intermediate token vector
//! held by the parser — tokens are pulled one at a time, the same shape the
//! teacher's compiler front end uses.


#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    // literals
    Number(f64),
    Str(String),
    /// A string literal containing `${expr}` interpolation; each `Expr`
    /// part holds the raw, not-yet-lexed source of the embedded expression.
    InterpStr(Vec<InterpPart>),
    Ident(String),

    // keywords
    KwLet,
    KwFn,
    KwIf,
    KwElse,
    KwWhile,
    KwFor,
    KwIn,
    KwBreak,
    KwContinue,
    KwReturn,
    KwTry,
    KwCatch,
    KwFinally,
    KwThrow,
    KwClass,
    KwExtends,
    KwNew,
    KwThis,
    KwSuper,
    KwTrue,
    KwFalse,
    KwNil,
    KwAnd,
    KwOr,
    KwNot,
    KwImport,

    // punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,
    Eq,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Literal(String),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub line: u32,
    pub col: u32,
}

/// Owns its source as a `Vec<char>` (rather than borrowing `&str`) so a
/// nested `Lexer` can be built over a temporary, shorter-lived string slice
/// — needed for compiling `${...}` string-interpolation segments without
/// threading an extra lifetime through the compiler. `Clone` lets the
/// compiler snapshot a position and re-lex a span later (see
/// `Compiler::replay_finally`).
#[derive(Clone)]
pub struct Lexer {
    chars: Vec<char>,
    lines: Vec<String>,
    pos: usize,
    line: u32,
    col: u32,
}

fn keyword(ident: &str) -> Option<TokKind> {
    Some(match ident {
        "let" => TokKind::KwLet,
        "fn" => TokKind::KwFn,
        "if" => TokKind::KwIf,
        "else" => TokKind::KwElse,
        "while" => TokKind::KwWhile,
        "for" => TokKind::KwFor,
        "in" => TokKind::KwIn,
        "break" => TokKind::KwBreak,
        "continue" => TokKind::KwContinue,
        "return" => TokKind::KwReturn,
        "try" => TokKind::KwTry,
        "catch" => TokKind::KwCatch,
        "finally" => TokKind::KwFinally,
        "throw" => TokKind::KwThrow,
        "class" => TokKind::KwClass,
        "extends" => TokKind::KwExtends,
        "new" => TokKind::KwNew,
        "this" => TokKind::KwThis,
        "super" => TokKind::KwSuper,
        "true" => TokKind::KwTrue,
        "false" => TokKind::KwFalse,
        "nil" => TokKind::KwNil,
        "and" => TokKind::KwAnd,
        "or" => TokKind::KwOr,
        "not" => TokKind::KwNot,
        "import" => TokKind::KwImport,
        _ => return None,
    })
}

impl Lexer {
    pub fn new(src: &str) -> Self {
        Lexer { chars: src.chars().collect(), lines: src.lines().map(str::to_string).collect(), pos: 0, line: 1, col: 1 }
    }

    fn bump(&mut self) -> Option<char> {
        let c = *self.chars.get(self.pos)?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn tok(&self, kind: TokKind, line: u32, col: u32) -> Token {
        Token { kind, line, col }
    }

    pub fn next_token(&mut self) -> Result<Token, (String, u32, u32)> {
        self.skip_trivia();
        let (line, col) = (self.line, self.col);
        let c = match self.bump() {
            Some(c) => c,
            None => return Ok(self.tok(TokKind::Eof, line, col)),
        };

        match c {
            '+' => Ok(self.tok(TokKind::Plus, line, col)),
            '-' => Ok(self.tok(TokKind::Minus, line, col)),
            '*' => Ok(self.tok(TokKind::Star, line, col)),
            '/' => Ok(self.tok(TokKind::Slash, line, col)),
            '%' => Ok(self.tok(TokKind::Percent, line, col)),
            '(' => Ok(self.tok(TokKind::LParen, line, col)),
            ')' => Ok(self.tok(TokKind::RParen, line, col)),
            '{' => Ok(self.tok(TokKind::LBrace, line, col)),
            '}' => Ok(self.tok(TokKind::RBrace, line, col)),
            '[' => Ok(self.tok(TokKind::LBracket, line, col)),
            ']' => Ok(self.tok(TokKind::RBracket, line, col)),
            ',' => Ok(self.tok(TokKind::Comma, line, col)),
            ';' => Ok(self.tok(TokKind::Semicolon, line, col)),
            ':' => Ok(self.tok(TokKind::Colon, line, col)),
            '.' => Ok(self.tok(TokKind::Dot, line, col)),
            '=' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Ok(self.tok(TokKind::EqEq, line, col))
                } else {
                    Ok(self.tok(TokKind::Eq, line, col))
                }
            }
            '!' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Ok(self.tok(TokKind::NotEq, line, col))
                } else {
                    Err(("unexpected character '!'".to_string(), line, col))
                }
            }
            '<' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Ok(self.tok(TokKind::LtEq, line, col))
                } else {
                    Ok(self.tok(TokKind::Lt, line, col))
                }
            }
            '>' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    Ok(self.tok(TokKind::GtEq, line, col))
                } else {
                    Ok(self.tok(TokKind::Gt, line, col))
                }
            }
            '"' => self.lex_string(line, col),
            c if c.is_ascii_digit() => self.lex_number(c, line, col),
            c if c == '_' || c.is_alphabetic() => self.lex_ident(c, line, col),
            other => Err((format!("unexpected character '{other}'"), line, col)),
        }
    }

    fn lex_number(&mut self, first: char, line: u32, col: u32) -> Result<Token, (String, u32, u32)> {
        let mut buf = String::new();
        buf.push(first);
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '_' {
                buf.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.') && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            buf.push('.');
            self.bump();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() || c == '_' {
                    buf.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let cleaned: String = buf.chars().filter(|c| *c != '_').collect();
        match cleaned.parse::<f64>() {
            Ok(n) => Ok(self.tok(TokKind::Number(n), line, col)),
            Err(_) => Err((format!("invalid number literal '{buf}'"), line, col)),
        }
    }

    fn lex_ident(&mut self, first: char, line: u32, col: u32) -> Result<Token, (String, u32, u32)> {
        let mut buf = String::new();
        buf.push(first);
        while let Some(c) = self.peek_char() {
            if c == '_' || c.is_alphanumeric() {
                buf.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = keyword(&buf).unwrap_or_else(|| TokKind::Ident(buf));
        Ok(self.tok(kind, line, col))
    }

    fn lex_string(&mut self, line: u32, col: u32) -> Result<Token, (String, u32, u32)> {
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut literal = String::new();
        loop {
            match self.bump() {
                None => return Err(("unterminated string literal".to_string(), line, col)),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => literal.push('\n'),
                    Some('t') => literal.push('\t'),
                    Some('r') => literal.push('\r'),
                    Some('"') => literal.push('"'),
                    Some('\\') => literal.push('\\'),
                    Some('$') => literal.push('$'),
                    Some(other) => literal.push(other),
                    None => return Err(("unterminated escape sequence".to_string(), line, col)),
                },
                Some('$') if self.peek_char() == Some('{') => {
                    self.bump(); // consume '{'
                    if !literal.is_empty() {
                        parts.push(InterpPart::Literal(std::mem::take(&mut literal)));
                    }
                    let mut depth = 1usize;
                    let mut expr_src = String::new();
                    loop {
                        match self.bump() {
                            None => return Err(("unterminated interpolation".to_string(), line, col)),
                            Some('{') => {
                                depth += 1;
                                expr_src.push('{');
                            }
                            Some('}') => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                                expr_src.push('}');
                            }
                            Some(c) => expr_src.push(c),
                        }
                    }
                    parts.push(InterpPart::Expr(expr_src));
                }
                Some(c) => literal.push(c),
            }
        }
        if parts.is_empty() {
            Ok(self.tok(TokKind::Str(literal), line, col))
        } else {
            if !literal.is_empty() {
                parts.push(InterpPart::Literal(literal));
            }
            Ok(self.tok(TokKind::InterpStr(parts), line, col))
        }
    }

    pub fn line_text(&self, line: u32) -> String {
        self.lines.get((line.saturating_sub(1)) as usize).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lexer.next_token().unwrap();
            let done = t.kind == TokKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn lexes_arithmetic_expression() {
        let k = kinds("1 + 2 * 3;");
        assert_eq!(
            k,
            vec![
                TokKind::Number(1.0),
                TokKind::Plus,
                TokKind::Number(2.0),
                TokKind::Star,
                TokKind::Number(3.0),
                TokKind::Semicolon,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_keywords_and_identifiers() {
        let k = kinds("let x = true;");
        assert_eq!(
            k,
            vec![TokKind::KwLet, TokKind::Ident("x".into()), TokKind::Eq, TokKind::KwTrue, TokKind::Semicolon, TokKind::Eof]
        );
    }

    #[test]
    fn lexes_string_interpolation() {
        let k = kinds(r#""hi ${1 + 1}!""#);
        assert_eq!(
            k,
            vec![
                TokKind::InterpStr(vec![
                    InterpPart::Literal("hi ".into()),
                    InterpPart::Expr(" 1 + 1 ".into()),
                    InterpPart::Literal("!".into()),
                ]),
                TokKind::Eof,
            ]
        );
    }
}
