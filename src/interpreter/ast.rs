use std::rc::Rc;

/// Identifier as written in source.
pub type Name = Rc<str>;

/// A parsed request: the top-level block of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Statements executed in order.
    pub block: Block,
}

/// Sequence of statements sharing one lexical scope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// Statements, with a `return` only ever in last position.
    pub stmts: Vec<Stmt>,
}

/// Statement with the source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Statement payload.
    pub kind: StmtKind,
    /// 1-based line number.
    pub line: u32,
}

/// Statement forms.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `local a, b = e1, e2`
    Local {
        /// Declared names.
        names: Vec<Name>,
        /// Initializers, possibly fewer than names.
        exprs: Vec<Expr>,
    },
    /// `local function f() ... end`
    LocalFunction {
        /// Bound name, visible inside the body for recursion.
        name: Name,
        /// Function definition.
        body: Rc<FuncBody>,
    },
    /// `a, t[k] = e1, e2`
    Assign {
        /// Assignment targets (names or index expressions).
        targets: Vec<Expr>,
        /// Right-hand sides.
        exprs: Vec<Expr>,
    },
    /// Function call used as a statement.
    Call(Expr),
    /// `do ... end`
    Do(Block),
    /// `while cond do ... end`
    While {
        /// Loop condition.
        cond: Expr,
        /// Loop body.
        body: Block,
    },
    /// `repeat ... until cond`
    Repeat {
        /// Loop body; its locals are visible in `cond`.
        body: Block,
        /// Exit condition.
        cond: Expr,
    },
    /// `if ... elseif ... else ... end`
    If {
        /// Condition/body pairs tried in order.
        arms: Vec<(Expr, Block)>,
        /// Optional `else` body.
        otherwise: Option<Block>,
    },
    /// `for i = start, limit, step do ... end`
    NumericFor {
        /// Control variable.
        var: Name,
        /// Initial value.
        start: Expr,
        /// Inclusive limit.
        limit: Expr,
        /// Increment, defaulting to 1.
        step: Option<Expr>,
        /// Loop body.
        body: Block,
    },
    /// `for k, v in explist do ... end`
    GenericFor {
        /// Loop variables.
        names: Vec<Name>,
        /// Iterator triple expressions.
        exprs: Vec<Expr>,
        /// Loop body.
        body: Block,
    },
    /// `return e1, e2`
    Return(Vec<Expr>),
    /// `break`
    Break,
}

/// Expression forms.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `nil`
    Nil,
    /// `true`
    True,
    /// `false`
    False,
    /// Numeric literal.
    Number(f64),
    /// String literal.
    Str(Rc<str>),
    /// Table constructor.
    Table(Vec<Field>),
    /// Anonymous function.
    Function(Rc<FuncBody>),
    /// Variable reference.
    Name(Name),
    /// `obj[key]` or `obj.key`
    Index {
        /// Indexed object.
        obj: Box<Expr>,
        /// Key expression.
        key: Box<Expr>,
    },
    /// `callee(args)`
    Call {
        /// Called expression.
        callee: Box<Expr>,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// `obj:name(args)`
    Method {
        /// Receiver, passed as the implicit first argument.
        obj: Box<Expr>,
        /// Method name.
        name: Name,
        /// Explicit arguments.
        args: Vec<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Parenthesized expression; truncates multiple results to one.
    Paren(Box<Expr>),
}

impl Expr {
    /// Whether the expression can yield more than one value.
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Method { .. })
    }
}

/// Entry of a table constructor.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `expr`, stored at the next positional index.
    Positional(Expr),
    /// `name = expr`
    Named(Name, Expr),
    /// `[key] = expr`
    Keyed(Expr, Expr),
}

/// Parameters and body of a function definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    /// Parameter names; methods get an implicit leading `self`.
    pub params: Vec<Name>,
    /// Function body.
    pub block: Block,
    /// Name the function was declared with, for diagnostics.
    pub name: Option<String>,
    /// Line of the `function` keyword.
    pub line: u32,
}

/// Binary operators.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Left and right binding priorities.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Concat => (5, 4),
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9),
        }
    }

    /// Source spelling, for error messages.
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

/// Priority of unary operators; binds tighter than everything except `^`.
pub const UNARY_PRIORITY: u8 = 8;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Logical not.
    Not,
    /// Length operator `#`.
    Len,
}
