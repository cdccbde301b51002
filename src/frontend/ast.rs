use serde::Serialize;

use super::lexer::Span;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum AssignOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl From<AssignOp> for BinaryOp {
    fn from(op: AssignOp) -> Self {
        match op {
            AssignOp::Add => BinaryOp::Add,
            AssignOp::Sub => BinaryOp::Sub,
            AssignOp::Mul => BinaryOp::Mul,
            AssignOp::Div => BinaryOp::Div,
            AssignOp::Mod => BinaryOp::Mod,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum UnaryOp {
    Not,
    Neg,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitAnd,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub enum Access {
    Public,
    #[default]
    Private,
    Protected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
}

/// A type annotation such as `int` or `int[]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeName {
    pub name: String,
    pub array: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeName>,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
pub struct FnDecl {
    pub name: String,
    pub access: Access,
    pub params: Vec<Param>,
    pub varargs: Option<Param>,
    pub ret: Option<TypeName>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
pub enum ObjectKey {
    Name(String),
    Computed(Expr),
}

#[derive(Debug, Clone, Serialize)]
pub enum ExprKind {
    Literal(Literal),
    Ident(String),
    This,
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Assign(Option<AssignOp>, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(ObjectKey, Expr)>),
    Lambda(Box<FnDecl>),
    Cast(TypeName, Box<Expr>),
    Generator(Vec<Stmt>),
}

impl ExprKind {
    pub fn at(self, span: Span) -> Expr {
        Expr { kind: self, span }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
pub enum Pattern {
    Ident(String),
    Object(Vec<String>),
    Array(Vec<String>),
}

impl Pattern {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Pattern::Ident(name) => vec![name.as_str()],
            Pattern::Object(names) | Pattern::Array(names) => {
                names.iter().map(|n| n.as_str()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VarDecl {
    pub access: Access,
    pub using: bool,
    pub pattern: Pattern,
    pub ty: Option<TypeName>,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IfStmt(pub Expr, pub Vec<Stmt>, pub Option<Box<Stmt>>);

#[derive(Debug, Clone, Serialize)]
pub struct SwitchArm {
    pub value: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TryStmt {
    pub body: Vec<Stmt>,
    pub catch: Option<(String, Vec<Stmt>)>,
    pub finally: Option<Vec<Stmt>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ClassKind {
    Struct,
    Class,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDecl {
    pub name: String,
    pub access: Access,
    pub is_static: bool,
    pub ty: Option<TypeName>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodDecl {
    pub decl: FnDecl,
    pub is_static: bool,
    pub is_meta: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassDecl {
    pub name: String,
    pub kind: ClassKind,
    pub access: Access,
    pub inherits: Vec<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub span: Span,
}

/// A declaration evaluated while compiling.
#[derive(Debug, Clone, Serialize)]
pub enum CompileTimeDecl {
    Var(VarDecl),
    Fn(FnDecl),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, Serialize)]
pub enum StmtKind {
    Module(String),
    Var(VarDecl),
    Expr(Expr),
    Return(Option<Expr>),
    Block(Vec<Stmt>),
    If(IfStmt),
    While(Expr, Vec<Stmt>),
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForEach(Pattern, Expr, Vec<Stmt>),
    Switch(Expr, Vec<SwitchArm>, Option<Vec<Stmt>>),
    Break,
    Continue,
    Throw(Expr),
    Try(TryStmt),
    Out(Expr),
    Fn(FnDecl),
    Class(ClassDecl),
    Test(String, Vec<Stmt>),
    CompileTime(CompileTimeDecl),
}

impl StmtKind {
    pub fn at(self, span: Span) -> Stmt {
        Stmt { kind: self, span }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}
