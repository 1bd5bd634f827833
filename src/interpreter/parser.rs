use std::rc::Rc;

use super::ast::{
    BinOp, Block, Chunk, Expr, Field, FuncBody, Name, Stmt, StmtKind, UNARY_PRIORITY, UnOp,
};
use super::lexer::{Keyword, Spanned, Token, tokenize};
use super::{Result, ScriptError};

/// Maximum syntactic nesting (blocks and sub-expressions) accepted.
pub const MAX_NESTING: usize = 100;

/// Parse script source text into a [`Chunk`].
pub fn parse_chunk(source: &str) -> Result<Chunk> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
    };
    let block = parser.parse_block()?;
    if parser.current() != &Token::Eof {
        return Err(parser.unexpected("end of input"));
    }
    Ok(Chunk { block })
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        self.tokens
            .get(self.index)
            .map(|spanned| &spanned.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.index + 1)
            .map(|spanned| &spanned.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|spanned| spanned.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn check_symbol(&self, symbol: &str) -> bool {
        matches!(self.current(), Token::Symbol(s) if *s == symbol)
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.current() == &Token::Keyword(keyword)
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if self.check_symbol(symbol) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{symbol}'")))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword, spelling: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{spelling}'")))
        }
    }

    fn expect_name(&mut self) -> Result<Name> {
        match self.current() {
            Token::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("name")),
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            message: message.into(),
            line: self.line(),
        }
    }

    fn unexpected(&self, expected: &str) -> ScriptError {
        let found = match self.current() {
            Token::Name(name) => format!("'{name}'"),
            Token::Number(n) => format!("'{n}'"),
            Token::Str(_) => "string".to_string(),
            Token::Keyword(keyword) => format!("'{}'", format!("{keyword:?}").to_lowercase()),
            Token::Symbol(symbol) => format!("'{symbol}'"),
            Token::Eof => "end of input".to_string(),
        };
        self.error(format!("expected {expected}, found {found}"))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.current(),
            Token::Eof
                | Token::Keyword(Keyword::End | Keyword::Else | Keyword::Elseif | Keyword::Until)
        )
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.enter()?;
        let mut stmts = Vec::new();
        while !self.block_follows() {
            if self.eat_symbol(";") {
                continue;
            }
            let line = self.line();
            if self.eat_keyword(Keyword::Return) {
                let exprs = if self.block_follows() || self.check_symbol(";") {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.eat_symbol(";");
                stmts.push(Stmt {
                    kind: StmtKind::Return(exprs),
                    line,
                });
                if !self.block_follows() {
                    return Err(self.unexpected("end of block after 'return'"));
                }
                break;
            }
            let kind = self.parse_statement()?;
            stmts.push(Stmt { kind, line });
        }
        self.leave();
        Ok(Block { stmts })
    }

    fn parse_statement(&mut self) -> Result<StmtKind> {
        match self.current() {
            Token::Keyword(Keyword::Break) => {
                self.advance();
                Ok(StmtKind::Break)
            }
            Token::Keyword(Keyword::Do) => {
                self.advance();
                let block = self.parse_block()?;
                self.expect_keyword(Keyword::End, "end")?;
                Ok(StmtKind::Do(block))
            }
            Token::Keyword(Keyword::While) => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect_keyword(Keyword::Do, "do")?;
                let body = self.parse_block()?;
                self.expect_keyword(Keyword::End, "end")?;
                Ok(StmtKind::While { cond, body })
            }
            Token::Keyword(Keyword::Repeat) => {
                self.advance();
                let body = self.parse_block()?;
                self.expect_keyword(Keyword::Until, "until")?;
                let cond = self.parse_expr()?;
                Ok(StmtKind::Repeat { body, cond })
            }
            Token::Keyword(Keyword::If) => self.parse_if(),
            Token::Keyword(Keyword::For) => self.parse_for(),
            Token::Keyword(Keyword::Function) => self.parse_function_statement(),
            Token::Keyword(Keyword::Local) => {
                self.advance();
                if self.eat_keyword(Keyword::Function) {
                    let name = self.expect_name()?;
                    let body = self.parse_func_body(Some(name.to_string()), false)?;
                    return Ok(StmtKind::LocalFunction { name, body });
                }
                let mut names = vec![self.expect_name()?];
                while self.eat_symbol(",") {
                    names.push(self.expect_name()?);
                }
                let exprs = if self.eat_symbol("=") {
                    self.parse_expr_list()?
                } else {
                    Vec::new()
                };
                Ok(StmtKind::Local { names, exprs })
            }
            _ => self.parse_expr_statement(),
        }
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        self.advance();
        let mut arms = Vec::new();
        let cond = self.parse_expr()?;
        self.expect_keyword(Keyword::Then, "then")?;
        arms.push((cond, self.parse_block()?));
        let mut otherwise = None;
        loop {
            if self.eat_keyword(Keyword::Elseif) {
                let cond = self.parse_expr()?;
                self.expect_keyword(Keyword::Then, "then")?;
                arms.push((cond, self.parse_block()?));
            } else if self.eat_keyword(Keyword::Else) {
                otherwise = Some(self.parse_block()?);
                self.expect_keyword(Keyword::End, "end")?;
                break;
            } else {
                self.expect_keyword(Keyword::End, "end")?;
                break;
            }
        }
        Ok(StmtKind::If { arms, otherwise })
    }

    fn parse_for(&mut self) -> Result<StmtKind> {
        self.advance();
        let first = self.expect_name()?;
        if self.eat_symbol("=") {
            let start = self.parse_expr()?;
            self.expect_symbol(",")?;
            let limit = self.parse_expr()?;
            let step = if self.eat_symbol(",") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_keyword(Keyword::Do, "do")?;
            let body = self.parse_block()?;
            self.expect_keyword(Keyword::End, "end")?;
            return Ok(StmtKind::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }
        let mut names = vec![first];
        while self.eat_symbol(",") {
            names.push(self.expect_name()?);
        }
        self.expect_keyword(Keyword::In, "'=' or 'in'")?;
        let exprs = self.parse_expr_list()?;
        self.expect_keyword(Keyword::Do, "do")?;
        let body = self.parse_block()?;
        self.expect_keyword(Keyword::End, "end")?;
        Ok(StmtKind::GenericFor { names, exprs, body })
    }

    /// `function a.b.c:m() ... end` desugars into an assignment.
    fn parse_function_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let root = self.expect_name()?;
        let mut display = root.to_string();
        let mut target = Expr::Name(root);
        let mut is_method = false;
        loop {
            if self.eat_symbol(".") {
                let field = self.expect_name()?;
                display.push('.');
                display.push_str(&field);
                target = Expr::Index {
                    obj: Box::new(target),
                    key: Box::new(Expr::Str(field)),
                };
            } else if self.eat_symbol(":") {
                let field = self.expect_name()?;
                display.push(':');
                display.push_str(&field);
                target = Expr::Index {
                    obj: Box::new(target),
                    key: Box::new(Expr::Str(field)),
                };
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let body = self.parse_func_body(Some(display), is_method)?;
        Ok(StmtKind::Assign {
            targets: vec![target],
            exprs: vec![Expr::Function(body)],
        })
    }

    fn parse_func_body(&mut self, name: Option<String>, is_method: bool) -> Result<Rc<FuncBody>> {
        let line = self.line();
        self.expect_symbol("(")?;
        let mut params: Vec<Name> = Vec::new();
        if is_method {
            params.push(Rc::from("self"));
        }
        if !self.check_symbol(")") {
            loop {
                if self.check_symbol("...") {
                    return Err(self.error("variadic functions are not supported"));
                }
                params.push(self.expect_name()?);
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }
        self.expect_symbol(")")?;
        let block = self.parse_block()?;
        self.expect_keyword(Keyword::End, "end")?;
        Ok(Rc::new(FuncBody {
            params,
            block,
            name,
            line,
        }))
    }

    fn parse_expr_statement(&mut self) -> Result<StmtKind> {
        let first = self.parse_suffixed_expr()?;
        if self.check_symbol("=") || self.check_symbol(",") {
            let mut targets = vec![first];
            while self.eat_symbol(",") {
                targets.push(self.parse_suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index { .. }) {
                    return Err(self.error("cannot assign to this expression"));
                }
            }
            self.expect_symbol("=")?;
            let exprs = self.parse_expr_list()?;
            return Ok(StmtKind::Assign { targets, exprs });
        }
        if first.is_multi() {
            Ok(StmtKind::Call(first))
        } else {
            Err(self.error("syntax error: expression is not a statement"))
        }
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.eat_symbol(",") {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_subexpr(0)
    }

    /// Precedence climbing: consume operators whose left priority exceeds
    /// `limit`.
    fn parse_subexpr(&mut self, limit: u8) -> Result<Expr> {
        self.enter()?;
        let mut lhs = match unary_op(self.current()) {
            Some(op) => {
                self.advance();
                let operand = self.parse_subexpr(UNARY_PRIORITY)?;
                fold_unary(op, operand)
            }
            None => self.parse_simple_expr()?,
        };
        while let Some(op) = binary_op(self.current()) {
            let (left, right) = op.priority();
            if left <= limit {
                break;
            }
            self.advance();
            let rhs = self.parse_subexpr(right)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.leave();
        Ok(lhs)
    }

    fn parse_simple_expr(&mut self) -> Result<Expr> {
        let expr = match self.current() {
            Token::Number(n) => Expr::Number(*n),
            Token::Str(text) => Expr::Str(text.clone()),
            Token::Keyword(Keyword::Nil) => Expr::Nil,
            Token::Keyword(Keyword::True) => Expr::True,
            Token::Keyword(Keyword::False) => Expr::False,
            Token::Symbol("{") => return self.parse_table(),
            Token::Symbol("...") => {
                return Err(self.error("variadic expressions are not supported"));
            }
            Token::Keyword(Keyword::Function) => {
                self.advance();
                return Ok(Expr::Function(self.parse_func_body(None, false)?));
            }
            _ => return self.parse_suffixed_expr(),
        };
        self.advance();
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        match self.current() {
            Token::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Name(name))
            }
            Token::Symbol("(") => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_symbol(")")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_suffixed_expr(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.current() {
                Token::Symbol(".") => {
                    self.advance();
                    let field = self.expect_name()?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(Expr::Str(field)),
                    };
                }
                Token::Symbol("[") => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect_symbol("]")?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                Token::Symbol(":") => {
                    self.advance();
                    let name = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::Method {
                        obj: Box::new(expr),
                        name,
                        args,
                    };
                }
                Token::Symbol("(") | Token::Symbol("{") | Token::Str(_) => {
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        match self.current() {
            Token::Str(text) => {
                let arg = Expr::Str(text.clone());
                self.advance();
                Ok(vec![arg])
            }
            Token::Symbol("{") => Ok(vec![self.parse_table()?]),
            Token::Symbol("(") => {
                self.advance();
                if self.eat_symbol(")") {
                    return Ok(Vec::new());
                }
                let args = self.parse_expr_list()?;
                self.expect_symbol(")")?;
                Ok(args)
            }
            _ => Err(self.unexpected("function arguments")),
        }
    }

    fn parse_table(&mut self) -> Result<Expr> {
        self.expect_symbol("{")?;
        let mut fields = Vec::new();
        while !self.check_symbol("}") {
            if self.eat_symbol("[") {
                let key = self.parse_expr()?;
                self.expect_symbol("]")?;
                self.expect_symbol("=")?;
                fields.push(Field::Keyed(key, self.parse_expr()?));
            } else if matches!(self.current(), Token::Name(_)) && self.peek() == &Token::Symbol("=")
            {
                let name = self.expect_name()?;
                self.advance();
                fields.push(Field::Named(name, self.parse_expr()?));
            } else {
                fields.push(Field::Positional(self.parse_expr()?));
            }
            if !self.eat_symbol(",") && !self.eat_symbol(";") {
                break;
            }
        }
        self.expect_symbol("}")?;
        Ok(Expr::Table(fields))
    }
}

fn unary_op(token: &Token) -> Option<UnOp> {
    match token {
        Token::Keyword(Keyword::Not) => Some(UnOp::Not),
        Token::Symbol("-") => Some(UnOp::Neg),
        Token::Symbol("#") => Some(UnOp::Len),
        _ => None,
    }
}

/// Negative literals become constants so `-1` costs no extra step.
fn fold_unary(op: UnOp, operand: Expr) -> Expr {
    match (op, operand) {
        (UnOp::Neg, Expr::Number(n)) => Expr::Number(-n),
        (op, operand) => Expr::Unary {
            op,
            operand: Box::new(operand),
        },
    }
}

fn binary_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::Keyword(Keyword::And) => BinOp::And,
        Token::Keyword(Keyword::Or) => BinOp::Or,
        Token::Symbol(symbol) => match *symbol {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Mod,
            "^" => BinOp::Pow,
            ".." => BinOp::Concat,
            "==" => BinOp::Eq,
            "~=" => BinOp::Ne,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            _ => return None,
        },
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_return(source: &str) -> Expr {
        let chunk = parse_chunk(source).expect("parse");
        match chunk.block.stmts.into_iter().last().map(|stmt| stmt.kind) {
            Some(StmtKind::Return(mut exprs)) => exprs.remove(0),
            other => panic!("expected return, got {other:?}"),
        }
    }

    #[test]
    fn parses_return_of_sum() {
        let expr = single_return("return 1+1");
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Number(1.0)),
                rhs: Box::new(Expr::Number(1.0)),
            }
        );
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = single_return("return 1 + 2 * 3");
        let Expr::Binary { op, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn concat_and_pow_are_right_associative() {
        let expr = single_return("return a .. b .. c");
        let Expr::Binary { lhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(*lhs, Expr::Name(Rc::from("a")));

        let expr = single_return("return -2 ^ 2");
        assert!(matches!(expr, Expr::Unary { op: UnOp::Neg, .. }));
    }

    #[test]
    fn parses_table_constructor_fields() {
        let expr = single_return("return {1, x = 2, [3] = 4; 'five'}");
        let Expr::Table(fields) = expr else {
            panic!("expected table");
        };
        assert_eq!(fields.len(), 4);
        assert!(matches!(fields[1], Field::Named(..)));
        assert!(matches!(fields[2], Field::Keyed(..)));
    }

    #[test]
    fn method_definition_gets_self_parameter() {
        let chunk = parse_chunk("function obj.inner:get(x) return self end").expect("parse");
        let StmtKind::Assign { exprs, .. } = &chunk.block.stmts[0].kind else {
            panic!("expected assignment");
        };
        let Expr::Function(body) = &exprs[0] else {
            panic!("expected function");
        };
        assert_eq!(body.params.len(), 2);
        assert_eq!(&*body.params[0], "self");
        assert_eq!(body.name.as_deref(), Some("obj.inner:get"));
    }

    #[test]
    fn code_may_omit_return() {
        let chunk = parse_chunk("local x = 1\nx = x + 1").expect("parse");
        assert_eq!(chunk.block.stmts.len(), 2);
        assert_eq!(chunk.block.stmts[1].line, 2);
    }

    #[test]
    fn return_must_end_block() {
        let err = parse_chunk("return 1 x = 2").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { .. }));
    }

    #[test]
    fn bare_expressions_are_not_statements() {
        assert!(parse_chunk("1 + 1").is_err());
        assert!(parse_chunk("x").is_err());
    }

    #[test]
    fn reports_unbalanced_delimiters() {
        let err = parse_chunk("return (1").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("expected ')'"), "{message}");
    }

    #[test]
    fn rejects_excessive_nesting() {
        let source = format!("return {}1{}", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        let err = parse_chunk(&source).unwrap_err();
        assert!(err.to_string().contains("nesting too deep"));
    }

    #[test]
    fn call_sugar_with_string_and_table() {
        let chunk = parse_chunk("print 'hi' f{1}").expect("parse");
        assert_eq!(chunk.block.stmts.len(), 2);
    }
}
