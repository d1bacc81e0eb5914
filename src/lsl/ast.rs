use super::types::Type;

/// Byte range in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A complete parsed script.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub globals: Vec<DeclVar>,
    pub functions: Vec<DeclFunc>,
    /// `default` is always first.
    pub states: Vec<DeclState>,
    /// Set when the source enabled the array extension.
    pub arrays_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct DeclVar {
    pub name: String,
    pub ty: Type,
    pub init: Option<Expr>,
    /// Declared after another statement of the same block.
    pub hoisted: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

/// A function or an event handler.
#[derive(Debug, Clone)]
pub struct DeclFunc {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DeclState {
    pub name: String,
    pub handlers: Vec<DeclFunc>,
    pub span: Span,
}

/// A `{ … }` block. `id` is unique within the script.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: usize,
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Decl(DeclVar),
    Expr(Expr),
    Block(Block),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
        span: Span,
    },
    For {
        init: Vec<Expr>,
        cond: Option<Expr>,
        step: Vec<Expr>,
        body: Box<Stmt>,
        span: Span,
    },
    ForEach {
        key: Option<(String, Span)>,
        value: Option<(String, Span)>,
        array: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    Jump {
        label: String,
        span: Span,
    },
    Label {
        name: String,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    State {
        name: String,
        span: Span,
    },
    Null(Span),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Decl(d) => d.span,
            Stmt::Expr(e) => e.span,
            Stmt::Block(b) => b.span,
            Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::For { span, .. }
            | Stmt::ForEach { span, .. }
            | Stmt::Jump { span, .. }
            | Stmt::Label { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::State { span, .. }
            | Stmt::Null(span) => *span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i32),
    FloatLit(f64),
    StringLit(String),
    Ident(String),
    Undef,
    ListLit(Vec<Expr>),
    VectorLit(Vec<Expr>),
    RotationLit(Vec<Expr>),
    Cast {
        ty: Type,
        operand: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `target = value`, or `target op= value` when `op` is set.
    Assign {
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    IncDec {
        target: Box<Expr>,
        increment: bool,
        prefix: bool,
    },
    Field {
        object: Box<Expr>,
        field: String,
    },
    Index {
        array: Box<Expr>,
        key: Box<Expr>,
    },
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    IsType {
        operand: Box<Expr>,
        ty: Type,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}
