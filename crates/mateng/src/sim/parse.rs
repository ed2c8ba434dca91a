//! Lexer and parser for the statement subset the simulated engine runs

use super::SimError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Newline,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    DotStar,
    DotSlash,
    DotCaret,
    Dot,
    Tilde,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    space_before: bool,
}

fn parse_error(message: impl Into<String>) -> SimError {
    SimError::new("MATLAB:m_invalid_syntax", message)
}

fn lex(src: &str) -> Result<Vec<Token>, SimError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out: Vec<Token> = Vec::new();
    let mut i = 0;
    let mut space = false;

    while i < chars.len() {
        let c = chars[i];
        if c == ' ' || c == '\t' || c == '\r' {
            space = true;
            i += 1;
            continue;
        }
        if c == '%' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        let tok = if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                // `1.*x` is `1 .* x`
                if chars[i] == '.' && matches!(chars.get(i + 1), Some('*' | '/' | '^')) {
                    break;
                }
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| parse_error(format!("Invalid number '{}'.", text)))?;
            out.push(Token { tok: Tok::Num(value), space_before: space });
            space = false;
            continue;
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Token { tok: Tok::Ident(text), space_before: space });
            space = false;
            continue;
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None | Some('\n') => return Err(parse_error("String is not terminated properly.")),
                    Some(&q) if q == quote => {
                        if chars.get(i + 1) == Some(&quote) {
                            text.push(quote);
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            out.push(Token { tok: Tok::Str(text), space_before: space });
            space = false;
            continue;
        } else {
            let next = chars.get(i + 1).copied();
            let (tok, width) = match (c, next) {
                ('.', Some('*')) => (Tok::DotStar, 2),
                ('.', Some('/')) => (Tok::DotSlash, 2),
                ('.', Some('^')) => (Tok::DotCaret, 2),
                ('.', _) => (Tok::Dot, 1),
                ('(', _) => (Tok::LParen, 1),
                (')', _) => (Tok::RParen, 1),
                ('[', _) => (Tok::LBracket, 1),
                (']', _) => (Tok::RBracket, 1),
                (',', _) => (Tok::Comma, 1),
                (';', _) => (Tok::Semi, 1),
                ('\n', _) => (Tok::Newline, 1),
                ('=', Some('=')) => return Err(parse_error("Comparison operators are not supported.")),
                ('=', _) => (Tok::Assign, 1),
                ('+', _) => (Tok::Plus, 1),
                ('-', _) => (Tok::Minus, 1),
                ('*', _) => (Tok::Star, 1),
                ('/', _) => (Tok::Slash, 1),
                ('^', _) => (Tok::Caret, 1),
                ('~', _) => (Tok::Tilde, 1),
                _ => return Err(parse_error(format!("Invalid character '{}'.", c))),
            };
            i += width;
            tok
        };
        out.push(Token { tok, space_before: space });
        space = false;
    }
    Ok(out)
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    MatMul,
    Div,
    Pow,
    Mul,
    ElemDiv,
    ElemPow,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Num(f64),
    Str(String),
    /// `a` or `a.b.c`
    Path(Vec<String>),
    /// `f(args)` or `a.b(args)`
    Call(Vec<String>, Vec<Expr>),
    Matrix(Vec<Vec<Expr>>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    /// `x = e`, `s.f = e`
    Assign { target: Vec<String>, expr: Expr, display: bool },
    /// `[a, ~, c] = f(...)`; `None` marks an ignored output
    MultiAssign { targets: Vec<Option<String>>, expr: Expr, display: bool },
    Expr { expr: Expr, display: bool },
    /// `clear` / `clear a b`
    Clear(Vec<String>),
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    matrix_depth: usize,
}

pub(crate) fn parse(src: &str) -> Result<Vec<Stmt>, SimError> {
    let mut p = Parser {
        toks: lex(src)?,
        pos: 0,
        matrix_depth: 0,
    };
    let mut stmts = Vec::new();
    loop {
        while p.eat_separator().is_some() {}
        if p.peek().is_none() {
            break;
        }
        let mut stmt = p.statement()?;
        let silent = match p.eat_separator() {
            Some(Tok::Semi) => true,
            Some(_) => false,
            None if p.peek().is_none() => false,
            None => return Err(parse_error("Unexpected token after statement.")),
        };
        if silent {
            match &mut stmt {
                Stmt::Assign { display, .. }
                | Stmt::MultiAssign { display, .. }
                | Stmt::Expr { display, .. } => *display = false,
                Stmt::Clear(_) => {}
            }
        }
        stmts.push(stmt);
    }
    Ok(stmts)
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.toks.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: Tok) -> Result<(), SimError> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            other => Err(parse_error(format!("Expected {:?}, found {:?}.", tok, other))),
        }
    }

    fn eat_separator(&mut self) -> Option<Tok> {
        match self.peek() {
            Some(Tok::Semi | Tok::Comma | Tok::Newline) => self.bump(),
            _ => None,
        }
    }

    fn statement(&mut self) -> Result<Stmt, SimError> {
        if let Some(Tok::Ident(name)) = self.peek() {
            if name == "clear" {
                let next = self.peek_at(1).map(|t| &t.tok);
                if !matches!(next, Some(Tok::Assign | Tok::LParen)) {
                    self.bump();
                    let mut names = Vec::new();
                    while let Some(Tok::Ident(n)) = self.peek() {
                        names.push(n.clone());
                        self.bump();
                    }
                    return Ok(Stmt::Clear(names));
                }
            }
        }

        if self.peek() == Some(&Tok::LBracket) {
            if let Some(targets) = self.try_output_list()? {
                let expr = self.expr()?;
                return Ok(Stmt::MultiAssign { targets, expr, display: true });
            }
        }

        if let Some(target) = self.try_assign_target() {
            let expr = self.expr()?;
            return Ok(Stmt::Assign { target, expr, display: true });
        }

        let expr = self.expr()?;
        Ok(Stmt::Expr { expr, display: true })
    }

    /// `[a, b] =` at the cursor; rewinds and returns `None` otherwise.
    fn try_output_list(&mut self) -> Result<Option<Vec<Option<String>>>, SimError> {
        let start = self.pos;
        self.bump();
        let mut targets = Vec::new();
        loop {
            match self.bump() {
                Some(Tok::Ident(n)) => targets.push(Some(n)),
                Some(Tok::Tilde) => targets.push(None),
                Some(Tok::Comma) => continue,
                Some(Tok::RBracket) => break,
                _ => {
                    self.pos = start;
                    return Ok(None);
                }
            }
        }
        if self.peek() == Some(&Tok::Assign) {
            self.bump();
            if targets.is_empty() {
                return Err(parse_error("Empty output list."));
            }
            return Ok(Some(targets));
        }
        self.pos = start;
        Ok(None)
    }

    /// `name =` or `name.field =` at the cursor.
    fn try_assign_target(&mut self) -> Option<Vec<String>> {
        let start = self.pos;
        let mut path = Vec::new();
        loop {
            match self.bump() {
                Some(Tok::Ident(n)) => path.push(n),
                _ => break,
            }
            match self.peek() {
                Some(Tok::Dot) => {
                    self.bump();
                }
                Some(Tok::Assign) => {
                    self.bump();
                    return Some(path);
                }
                _ => break,
            }
        }
        self.pos = start;
        None
    }

    fn expr(&mut self) -> Result<Expr, SimError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            if self.element_boundary() {
                break;
            }
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// Inside `[...]`, `1 -2` is two elements while `1 - 2` is one.
    fn element_boundary(&self) -> bool {
        if self.matrix_depth == 0 {
            return false;
        }
        let op_spaced = self.peek_at(0).is_some_and(|t| t.space_before);
        let operand_spaced = self.peek_at(1).is_some_and(|t| t.space_before);
        op_spaced && !operand_spaced
    }

    fn term(&mut self) -> Result<Expr, SimError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::MatMul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::DotStar) => BinOp::Mul,
                Some(Tok::DotSlash) => BinOp::ElemDiv,
                _ => break,
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, SimError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Tok::Plus) => {
                self.bump();
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, SimError> {
        let base = self.primary()?;
        let op = match self.peek() {
            Some(Tok::Caret) => BinOp::Pow,
            Some(Tok::DotCaret) => BinOp::ElemPow,
            _ => return Ok(base),
        };
        self.bump();
        let exponent = match self.peek() {
            Some(Tok::Minus) => {
                self.bump();
                Expr::Neg(Box::new(self.primary()?))
            }
            _ => self.primary()?,
        };
        Ok(Expr::Binary(op, Box::new(base), Box::new(exponent)))
    }

    fn primary(&mut self) -> Result<Expr, SimError> {
        match self.bump() {
            Some(Tok::Num(v)) => Ok(Expr::Num(v)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::LParen) => {
                let saved = self.matrix_depth;
                self.matrix_depth = 0;
                let e = self.expr();
                self.matrix_depth = saved;
                let e = e?;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            Some(Tok::LBracket) => self.matrix(),
            Some(Tok::Ident(first)) => {
                let mut path = vec![first];
                while self.peek() == Some(&Tok::Dot) {
                    self.bump();
                    match self.bump() {
                        Some(Tok::Ident(n)) => path.push(n),
                        other => {
                            return Err(parse_error(format!("Expected field name, found {:?}.", other)))
                        }
                    }
                }
                if self.peek() == Some(&Tok::LParen) && !self.element_spaced() {
                    self.bump();
                    let args = self.arguments()?;
                    return Ok(Expr::Call(path, args));
                }
                Ok(Expr::Path(path))
            }
            other => Err(parse_error(format!("Unexpected token {:?}.", other))),
        }
    }

    /// In a matrix row, `a (1)` is two elements.
    fn element_spaced(&self) -> bool {
        self.matrix_depth > 0 && self.peek_at(0).is_some_and(|t| t.space_before)
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, SimError> {
        let saved = self.matrix_depth;
        self.matrix_depth = 0;
        let mut args = Vec::new();
        let result = loop {
            if self.peek() == Some(&Tok::RParen) {
                self.bump();
                break Ok(args);
            }
            match self.expr() {
                Ok(e) => args.push(e),
                Err(e) => break Err(e),
            }
            match self.bump() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break Ok(args),
                other => break Err(parse_error(format!("Expected ',' or ')', found {:?}.", other))),
            }
        };
        self.matrix_depth = saved;
        result
    }

    fn matrix(&mut self) -> Result<Expr, SimError> {
        self.matrix_depth += 1;
        let mut rows: Vec<Vec<Expr>> = vec![Vec::new()];
        let result = loop {
            match self.peek() {
                Some(Tok::RBracket) => {
                    self.bump();
                    break Ok(());
                }
                Some(Tok::Semi | Tok::Newline) => {
                    self.bump();
                    rows.push(Vec::new());
                }
                Some(Tok::Comma) => {
                    self.bump();
                }
                None => break Err(parse_error("Unterminated matrix literal.")),
                _ => match self.expr() {
                    Ok(e) => {
                        if let Some(row) = rows.last_mut() {
                            row.push(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };
        self.matrix_depth -= 1;
        result?;
        rows.retain(|r| !r.is_empty());
        Ok(Expr::Matrix(rows))
    }
}
