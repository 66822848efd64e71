//! compiler.rs — compilateur Pratt à passe unique, source → `Chunk` (§4.4).
//!
//! Un `Context` (ici [`FuncState`]) par fonction en cours de compilation ;
//! la pile `states` du [`Compiler`] joue le rôle de la chaîne de parents
//! de la spec (`ctx.enclosing`) — plus simple à exprimer en Rust qu'une
//! chaîne de pointeurs, puisque `resolve_upvalue` doit pouvoir marquer un
//! local d'un état parent comme capturé pendant qu'on travaille sur
//! l'enfant.

use raven_core::bytecode::{Chunk, Op};
use raven_core::object::{FunctionProto, UpvalueDesc, PARAMS_LIMIT};
use raven_core::{CoreError, Heap, ObjRef, Value};

use crate::error::{CompileError, CompileErrors, Result};
use crate::lexer::{Lexer, Token, TokenKind};

/// Table des précédences (§4.4), du plus faible au plus fort.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Cons,
    Concat,
    Term,
    Factor,
    Unary,
    Call,
    Highest,
}

impl Precedence {
    const fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Cons,
            Precedence::Cons => Precedence::Concat,
            Precedence::Concat => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Highest => Precedence::Highest,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Eq => Precedence::Assignment,
        Or => Precedence::Or,
        And => Precedence::And,
        EqEq | NotEq => Precedence::Equality,
        Lt | Gt | Le | Ge => Precedence::Comparison,
        Pipe => Precedence::Cons,
        At => Precedence::Concat,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        LParen | LBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

/// Un local de la fonction en cours : nom, profondeur de déclaration
/// (`-1` = non initialisé), capturé par une fermeture ou non (§4.4).
struct Local<'src> {
    name: &'src str,
    depth: i32,
    captured: bool,
}

struct LoopCtx {
    start: u32,
    depth: i32,
    break_jumps: Vec<u32>,
}

/// État de compilation d'une fonction : équivalent du `Context` de la
/// spec. Empilé/dépilé par le [`Compiler`] à chaque `fn(...) ... end`.
struct FuncState<'src> {
    chunk: Chunk,
    arity: u8,
    name: Option<String>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl<'src> FuncState<'src> {
    fn new(name: Option<String>) -> Self {
        let mut locals = Vec::new();
        // Le slot 0 est réservé par la VM (équivalent du "self"/callee
        // implicite pour l'ABI d'appel).
        locals.push(Local { name: "", depth: 0, captured: false });
        Self {
            chunk: Chunk::new(),
            arity: 0,
            name,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Compilateur Pratt à passe unique. Consomme une source complète et
/// produit une [`FunctionProto`] top-level (la spec appelle cela "the
/// top level is wrapped in an anonymous function of zero arity", §4.4).
pub struct Compiler<'src, 'heap> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    file: String,
    heap: &'heap mut Heap,
    states: Vec<FuncState<'src>>,
    errors: Vec<CompileError>,
    panic_mode: bool,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(src: &'src str, file: String, heap: &'heap mut Heap) -> Self {
        let mut lexer = Lexer::new(src);
        let first = lexer.next_token();
        Self {
            lexer,
            previous: first.clone(),
            current: first,
            file,
            heap,
            states: vec![FuncState::new(None)],
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    // ------------------------------ flux de tokens ------------------------------

    fn advance(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn skip_newlines(&mut self) {
        while self.current.kind == TokenKind::Nl {
            self.advance();
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(msg);
    }

    /// Accepte `;` ou une ou plusieurs fins de ligne comme terminateur de
    /// déclaration, ou l'absence de token consommé si le prochain est un
    /// délimiteur de bloc (`end`, `elif`, `else`) ou `EOF` (Open Question
    /// résolue dans le document de spécification étendu : accepter les deux
    /// interchangeablement).
    fn consume_terminator(&mut self) {
        if self.match_token(TokenKind::Semicolon) {
            self.skip_newlines();
            return;
        }
        if self.current.kind == TokenKind::Nl {
            self.skip_newlines();
            return;
        }
        if matches!(self.current.kind, TokenKind::End | TokenKind::Elif | TokenKind::Else | TokenKind::Eof) {
            return;
        }
        self.error_at_current("expected ';' or newline after statement");
    }

    // ------------------------------- diagnostics -------------------------------

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current.clone();
        self.error_at(&tok, msg);
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous.clone();
        self.error_at(&tok, msg);
    }

    fn error_at(&mut self, tok: &Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError {
            file: self.file.clone(),
            line: tok.line,
            lexeme: tok.lexeme.to_string(),
            message: msg.to_string(),
        });
    }

    fn core_error(&mut self, err: CoreError) {
        let msg = err.to_string();
        self.error(&msg);
    }

    /// Avance jusqu'au prochain token de début de déclaration (§4.4 —
    /// synchronisation en mode panique).
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if matches!(
                self.current.kind,
                TokenKind::Let | TokenKind::Fn | TokenKind::Return | TokenKind::Break | TokenKind::Continue
            ) {
                return;
            }
            self.advance();
        }
    }

    // ------------------------------ état courant --------------------------------

    fn func(&mut self) -> &mut FuncState<'src> {
        self.states.last_mut().expect("at least the script state is always present")
    }

    fn emit(&mut self, op: Op) -> u32 {
        let line = self.previous.line;
        self.func().chunk.push_op(op, line)
    }

    fn emit_const(&mut self, value: Value) -> Option<u8> {
        match self.func().chunk.add_const(value) {
            Ok(idx) => Some(idx),
            Err(e) => {
                self.core_error(e);
                None
            }
        }
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.heap.intern(s, |_| {})
    }

    // -------------------------------- sauts --------------------------------

    fn emit_jump(&mut self, make: impl FnOnce(u16) -> Op) -> u32 {
        self.emit(make(0))
    }

    fn patch_jump(&mut self, at: u32) {
        let target = self.func().chunk.len() as u32;
        let offset = target - at - 1;
        let offset: u16 = match u16::try_from(offset) {
            Ok(v) => v,
            Err(_) => {
                self.core_error(CoreError::JumpTooFar { offset: i64::from(offset) });
                return;
            }
        };
        if let Some(op) = self.func().chunk.op_mut(at) {
            *op = match op {
                Op::Jump(_) => Op::Jump(offset),
                Op::JumpFalse(_) => Op::JumpFalse(offset),
                Op::JumpPopFalse(_) => Op::JumpPopFalse(offset),
                other => other.clone(),
            };
        }
    }

    fn emit_loop_back(&mut self, loop_start: u32) {
        let current = self.func().chunk.len() as u32;
        let offset = current - loop_start + 1;
        match u16::try_from(offset) {
            Ok(v) => {
                self.emit(Op::JumpBack(v));
            }
            Err(_) => self.core_error(CoreError::JumpTooFar { offset: i64::from(offset) }),
        }
    }

    // ------------------------------- scopes/locaux -------------------------------

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.func().scope_depth;
        let mut popped = 0u16;
        loop {
            let should_pop = matches!(self.func().locals.last(), Some(l) if l.depth >= depth);
            if !should_pop {
                break;
            }
            let captured = self.func().locals.last().unwrap().captured;
            self.func().locals.pop();
            if captured {
                if popped > 0 {
                    self.emit(Op::PopN(popped));
                    popped = 0;
                }
                self.emit(Op::CloseUpvalue);
            } else {
                popped += 1;
            }
        }
        if popped > 0 {
            self.emit(Op::PopN(popped));
        }
        self.func().scope_depth -= 1;
    }

    fn declare_local(&mut self, name: &'src str) {
        let depth = self.func().scope_depth;
        if self
            .func()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name)
        {
            self.error("a variable with this name is already declared in this scope");
            return;
        }
        self.func().locals.push(Local { name, depth: -1, captured: false });
    }

    fn mark_initialized(&mut self) {
        let depth = self.func().scope_depth;
        if let Some(local) = self.func().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(state: &FuncState<'src>, name: &str) -> Option<u8> {
        state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name && l.depth != -1)
            .map(|(i, _)| i as u8)
    }

    fn add_upvalue(state: &mut FuncState<'src>, is_local: bool, index: u8) -> Option<u8> {
        if let Some(pos) = state.upvalues.iter().position(|u| u.is_local == is_local && u.index == index) {
            return Some(pos as u8);
        }
        if state.upvalues.len() > usize::from(PARAMS_LIMIT) {
            return None;
        }
        state.upvalues.push(UpvalueDesc { is_local, index });
        Some((state.upvalues.len() - 1) as u8)
    }

    /// Résout `name` comme upvalue en remontant la chaîne d'états englobants
    /// (§4.4 — `resolve_upvalue`). `depth` est l'index dans `self.states` de
    /// la fonction dont on cherche l'upvalue.
    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Option<u8> {
        if depth == 0 {
            return None;
        }
        let parent_depth = depth - 1;
        if let Some(local_idx) = Self::resolve_local(&self.states[parent_depth], name) {
            self.states[parent_depth].locals[local_idx as usize].captured = true;
            return Self::add_upvalue(&mut self.states[depth], true, local_idx);
        }
        if let Some(up_idx) = self.resolve_upvalue(parent_depth, name) {
            return Self::add_upvalue(&mut self.states[depth], false, up_idx);
        }
        None
    }

    // ------------------------------- expressions --------------------------------

    fn parse_precedence(&mut self, min_prec: Precedence) {
        self.advance();
        let can_assign = min_prec <= Precedence::Assignment;
        let kind = self.previous.kind;
        if !self.prefix(kind, can_assign) {
            self.error("expected an expression");
            return;
        }

        while precedence_of(self.current.kind) >= min_prec {
            self.advance();
            let kind = self.previous.kind;
            self.infix(kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Eq) {
            self.error("invalid assignment target");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            Int => self.number_int(),
            Float => self.number_float(),
            Str => self.string_lit(false),
            RawStr => self.string_lit(true),
            True => {
                self.emit(Op::PushTrue);
            }
            False => {
                self.emit(Op::PushFalse);
            }
            Nil => {
                self.emit(Op::PushNil);
            }
            Ident => self.variable(can_assign),
            LParen => {
                self.expression();
                self.consume(RParen, "expected ')' after expression");
            }
            Minus => {
                self.parse_precedence(Precedence::Unary);
                self.emit(Op::Neg);
            }
            Not => {
                self.parse_precedence(Precedence::Unary);
                self.emit(Op::Not);
            }
            LBracket => self.array_literal(),
            LBrace => self.map_literal(),
            Fn => self.function_literal(None),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus => {
                self.parse_precedence(Precedence::Term.next());
                self.emit(Op::Add);
            }
            Minus => {
                self.parse_precedence(Precedence::Term.next());
                self.emit(Op::Sub);
            }
            Star => {
                self.parse_precedence(Precedence::Factor.next());
                self.emit(Op::Mul);
            }
            Slash => {
                self.parse_precedence(Precedence::Factor.next());
                self.emit(Op::Div);
            }
            Percent => {
                self.parse_precedence(Precedence::Factor.next());
                self.emit(Op::Mod);
            }
            EqEq => {
                self.parse_precedence(Precedence::Equality.next());
                self.emit(Op::Eq);
            }
            NotEq => {
                self.parse_precedence(Precedence::Equality.next());
                self.emit(Op::Neq);
            }
            Lt => {
                self.parse_precedence(Precedence::Comparison.next());
                self.emit(Op::Lt);
            }
            Le => {
                self.parse_precedence(Precedence::Comparison.next());
                self.emit(Op::Ltq);
            }
            Gt => {
                self.parse_precedence(Precedence::Comparison.next());
                self.emit(Op::Gt);
            }
            Ge => {
                self.parse_precedence(Precedence::Comparison.next());
                self.emit(Op::Gtq);
            }
            At => {
                self.parse_precedence(Precedence::Concat.next());
                self.emit(Op::Concatenate);
            }
            // `|` (cons) est associatif à droite : on recourt à
            // `Precedence::Cons` plutôt que `.next()` (§4.4).
            Pipe => {
                self.parse_precedence(Precedence::Cons);
                self.emit(Op::Cons);
            }
            And => self.and_expr(),
            Or => self.or_expr(),
            LParen => self.call_expr(),
            LBracket => self.index_expr(can_assign),
            _ => unreachable!("no infix rule registered for {kind:?}"),
        }
    }

    fn number_int(&mut self) {
        let text = self.previous.lexeme;
        let n = if let Some(hex) = text.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).unwrap_or(0) as f64
        } else if let Some(oct) = text.strip_prefix("0o") {
            i64::from_str_radix(oct, 8).unwrap_or(0) as f64
        } else if let Some(bin) = text.strip_prefix("0b") {
            i64::from_str_radix(bin, 2).unwrap_or(0) as f64
        } else {
            text.parse::<f64>().unwrap_or(0.0)
        };
        if let Some(idx) = self.emit_const(Value::Number(n)) {
            self.emit(Op::PushConst(idx));
        }
    }

    fn number_float(&mut self) {
        let n: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        if let Some(idx) = self.emit_const(Value::Number(n)) {
            self.emit(Op::PushConst(idx));
        }
    }

    fn unescape(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn string_lit(&mut self, raw: bool) {
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        let content = if raw { body.to_string() } else { Self::unescape(body) };
        let objref = self.intern(&content);
        if let Some(idx) = self.emit_const(Value::Object(objref)) {
            self.emit(Op::PushConst(idx));
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let depth = self.states.len() - 1;
        let (get, set): (Op, fn(u8) -> Op) = if let Some(slot) = Self::resolve_local(&self.states[depth], name) {
            (Op::GetLocal(slot), Op::SetLocal)
        } else if let Some(slot) = self.resolve_upvalue(depth, name) {
            (Op::GetUpvalue(slot), Op::SetUpvalue)
        } else {
            let objref = self.intern(name);
            match self.emit_const(Value::Object(objref)) {
                Some(idx) => (Op::GetGlobal(idx), Op::SetGlobal),
                None => return,
            }
        };

        if can_assign && self.match_token(TokenKind::Eq) {
            self.expression();
            self.emit(set(Self::operand_of(&get)));
        } else {
            self.emit(get);
        }
    }

    fn operand_of(op: &Op) -> u8 {
        match op {
            Op::GetLocal(i) | Op::GetUpvalue(i) | Op::GetGlobal(i) => *i,
            _ => unreachable!("named_variable only builds Get* ops"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(Op::JumpFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And.next());
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(Op::JumpFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or.next());
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after arguments");
        match u8::try_from(argc) {
            Ok(n) => {
                self.emit(Op::Call(n));
            }
            Err(_) => self.error("too many arguments (limit is 255)"),
        }
    }

    fn index_expr(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RBracket, "expected ']' after index");
        if can_assign && self.match_token(TokenKind::Eq) {
            self.expression();
            self.emit(Op::IndexSet);
        } else {
            self.emit(Op::IndexGet);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBracket) {
            loop {
                self.skip_newlines();
                self.expression();
                count += 1;
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RBracket, "expected ']' after array literal");
        self.emit(Op::Array(count));
    }

    fn map_literal(&mut self) {
        let mut pairs: u16 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBrace) {
            loop {
                self.skip_newlines();
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after map key");
                self.expression();
                pairs += 1;
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RBrace, "expected '}' after map literal");
        self.emit(Op::Map(pairs));
    }

    /// Compile un `fn(params) body end`, l'alloue comme fermeture et émet
    /// `CLOSURE` dans le contexte appelant (§4.4).
    fn function_literal(&mut self, name: Option<String>) {
        self.states.push(FuncState::new(name));
        self.begin_scope();

        self.consume(TokenKind::LParen, "expected '(' after 'fn'");
        if !self.check(TokenKind::RParen) {
            loop {
                if self.func().arity == PARAMS_LIMIT {
                    self.error("too many parameters (limit is 255)");
                } else {
                    self.func().arity += 1;
                }
                self.consume(TokenKind::Ident, "expected parameter name");
                let pname = self.previous.lexeme;
                self.declare_local(pname);
                self.mark_initialized();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after parameters");

        self.skip_newlines();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.consume(TokenKind::End, "expected 'end' after function body");

        self.emit(Op::PushNil);
        self.emit(Op::Return);

        let finished = self.states.pop().expect("function state pushed above");
        let upvalue_count = finished.upvalues.len();
        let name_ref = finished.name.as_deref().map(|n| self.intern(n));
        let proto = FunctionProto {
            arity: finished.arity,
            chunk: finished.chunk,
            name: name_ref,
            upvalue_count,
        };
        let func_ref = self.heap.alloc_function(proto, |_| {});
        if let Some(idx) = self.emit_const(Value::Object(func_ref)) {
            self.emit(Op::Closure(idx, finished.upvalues));
        }
    }

    // ------------------------------- déclarations -------------------------------

    fn declaration(&mut self) {
        self.skip_newlines();
        if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else if self.match_token(TokenKind::Fn) {
            self.fn_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    /// `let name [= expr];` (§4.4).
    fn let_declaration(&mut self) {
        self.consume(TokenKind::Ident, "expected variable name");
        let name = self.previous.lexeme;
        let is_local = self.func().scope_depth > 0;
        if is_local {
            self.declare_local(name);
        }

        if self.match_token(TokenKind::Eq) {
            self.expression();
        } else {
            self.emit(Op::PushNil);
        }
        self.consume_terminator();

        if is_local {
            self.mark_initialized();
        } else {
            let objref = self.intern(name);
            if let Some(idx) = self.emit_const(Value::Object(objref)) {
                self.emit(Op::DefGlobal(idx));
            }
        }
    }

    /// `fn name(params) body end` — sucre pour `let name = fn(params) body end;` (§4.4).
    fn fn_declaration(&mut self) {
        self.consume(TokenKind::Ident, "expected function name");
        let name = self.previous.lexeme;
        let is_local = self.func().scope_depth > 0;
        if is_local {
            self.declare_local(name);
            self.mark_initialized();
        }
        self.function_literal(Some(name.to_string()));
        if !is_local {
            let objref = self.intern(name);
            if let Some(idx) = self.emit_const(Value::Object(objref)) {
                self.emit(Op::DefGlobal(idx));
            }
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
            self.finish_value_statement();
        } else if self.match_token(TokenKind::Cond) {
            self.cond_statement();
            self.finish_value_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Do) {
            self.begin_scope();
            self.skip_newlines();
            while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
                self.declaration();
                self.skip_newlines();
            }
            self.consume(TokenKind::End, "expected 'end' to close block");
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Au niveau global (profondeur de fonction 0, c'est-à-dire le script
    /// lui-même), le résultat de chaque expression-instruction est conservé
    /// dans le registre X plutôt que dépilé : c'est ce qui permet à
    /// `import` (§4.6) d'exposer "la valeur exportée du module" sans
    /// syntaxe d'export dédiée — X porte toujours la dernière expression de
    /// haut niveau évaluée.
    fn expression_statement(&mut self) {
        self.expression();
        self.finish_value_statement();
        self.consume_terminator();
    }

    /// `cond` and `while` always leave exactly one value on the stack
    /// (`cond`: every clause is a single `expression()`, plus a `PushNil`
    /// fallback; `while`: an unconditional trailing `PushNil` once the
    /// loop exits). Dispose of it the same way `expression_statement`
    /// disposes of an expression's value, so a local's compile-time slot
    /// index never drifts from the runtime stack height.
    fn finish_value_statement(&mut self) {
        if self.states.len() == 1 {
            self.emit(Op::SaveX);
        } else {
            self.emit(Op::Pop);
        }
    }

    /// `if cond do then-block [elif cond do ...] [else else-block] end`
    /// (§4.4). A pure control-flow statement, never a value: every branch
    /// body is a statement sequence that balances its own stack via
    /// `expression_statement`/`finish_value_statement`, so `if` itself
    /// must never push anything (no implicit `else` arm either).
    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Do, "expected 'do' after 'if' condition");
        let then_jump = self.emit_jump(Op::JumpPopFalse);
        self.begin_scope();
        self.skip_newlines();
        while !matches!(self.current.kind, TokenKind::End | TokenKind::Elif | TokenKind::Else) && !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.end_scope();
        let mut end_jumps = vec![self.emit_jump(Op::Jump)];
        self.patch_jump(then_jump);

        while self.match_token(TokenKind::Elif) {
            self.expression();
            self.consume(TokenKind::Do, "expected 'do' after 'elif' condition");
            let elif_jump = self.emit_jump(Op::JumpPopFalse);
            self.begin_scope();
            self.skip_newlines();
            while !matches!(self.current.kind, TokenKind::End | TokenKind::Elif | TokenKind::Else) && !self.check(TokenKind::Eof) {
                self.declaration();
                self.skip_newlines();
            }
            self.end_scope();
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(elif_jump);
        }

        if self.match_token(TokenKind::Else) {
            self.begin_scope();
            self.skip_newlines();
            while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
                self.declaration();
                self.skip_newlines();
            }
            self.end_scope();
        }
        self.consume(TokenKind::End, "expected 'end' to close 'if'");
        for j in end_jumps.drain(..) {
            self.patch_jump(j);
        }
    }

    /// `cond c1 -> e1, c2 -> e2, ... end` (§4.4).
    fn cond_statement(&mut self) {
        let mut end_jumps = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.expression();
            self.consume(TokenKind::Arrow, "expected '->' after 'cond' condition");
            let next_jump = self.emit_jump(Op::JumpPopFalse);
            self.expression();
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(next_jump);
            self.skip_newlines();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.emit(Op::PushNil);
        self.consume(TokenKind::End, "expected 'end' to close 'cond'");
        for j in end_jumps {
            self.patch_jump(j);
        }
    }

    /// `while cond do body end` (§4.4). Le résultat d'une boucle est
    /// toujours `nil`.
    fn while_statement(&mut self) {
        let loop_start = self.func().chunk.len() as u32;
        let depth = self.func().scope_depth;
        self.func().loops.push(LoopCtx { start: loop_start, depth, break_jumps: Vec::new() });

        self.expression();
        self.consume(TokenKind::Do, "expected 'do' after 'while' condition");
        let exit_jump = self.emit_jump(Op::JumpPopFalse);

        self.begin_scope();
        self.skip_newlines();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.end_scope();
        self.consume(TokenKind::End, "expected 'end' to close 'while'");

        self.emit_loop_back(loop_start);
        self.patch_jump(exit_jump);

        let ctx = self.func().loops.pop().expect("pushed above");
        for j in ctx.break_jumps {
            self.patch_jump(j);
        }
        self.emit(Op::PushNil);
    }

    fn continue_statement(&mut self) {
        let Some((start, loop_depth)) = self.func().loops.last().map(|c| (c.start, c.depth)) else {
            self.error("'continue' outside of a loop");
            return;
        };
        self.unwind_locals_to(loop_depth);
        self.emit_loop_back(start);
        self.consume_terminator();
    }

    fn break_statement(&mut self) {
        if self.func().loops.is_empty() {
            self.error("'break' outside of a loop");
            return;
        }
        let loop_depth = self.func().loops.last().unwrap().depth;
        self.unwind_locals_to(loop_depth);
        let j = self.emit_jump(Op::Jump);
        self.func().loops.last_mut().unwrap().break_jumps.push(j);
        self.consume_terminator();
    }

    fn unwind_locals_to(&mut self, depth: i32) {
        let count = self.func().locals.iter().rev().take_while(|l| l.depth > depth).count();
        if count > 0 {
            self.emit(Op::PopN(count as u16));
        }
    }

    fn return_statement(&mut self) {
        if matches!(self.current.kind, TokenKind::Semicolon | TokenKind::Nl | TokenKind::End | TokenKind::Eof) {
            self.emit(Op::PushNil);
        } else {
            self.expression();
        }
        self.consume_terminator();
        self.emit(Op::Return);
    }

    // ---------------------------------- driver ----------------------------------

    fn run(&mut self) {
        self.skip_newlines();
        while !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.emit(Op::PushNil);
        self.emit(Op::Return);
    }
}

/// Compile une source complète en un prototype de fonction top-level
/// (anonyme, arité 0), alloué dans `heap`. Les erreurs accumulées durant
/// la passe sont renvoyées ensemble ; la fonction n'est *pas* livrée en
/// cas d'échec (§7 — propagation policy).
pub fn compile(source: &str, file: impl Into<String>, heap: &mut Heap) -> Result<ObjRef> {
    let mut compiler = Compiler::new(source, file.into(), heap);
    compiler.run();

    if !compiler.errors.is_empty() {
        return Err(CompileErrors(compiler.errors));
    }

    let finished = compiler.states.pop().expect("script state always present");
    let proto = FunctionProto {
        arity: finished.arity,
        chunk: finished.chunk,
        name: None,
        upvalue_count: finished.upvalues.len(),
    };
    Ok(compiler.heap.alloc_function(proto, |_| {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use raven_core::Object;

    fn compiles(src: &str) -> Result<ObjRef> {
        let mut heap = Heap::new();
        compile(src, "<test>", &mut heap)
    }

    #[test]
    fn scenario_arithmetic_prints() {
        assert!(compiles("let x = 2 + 3 * 4; println(x);").is_ok());
    }

    #[test]
    fn scenario_function_call() {
        assert!(compiles("fn add(a, b) return a + b; end println(add(40, 2));").is_ok());
    }

    #[test]
    fn scenario_closure_over_mutable_local() {
        let src = "let make = fn(n) return fn() n = n + 1; return n; end; end; let c = make(10);";
        assert!(compiles(src).is_ok());
    }

    #[test]
    fn scenario_array_push_len_index() {
        assert!(compiles("let a = [1, 2, 3]; push(a, 4); println(len(a)); println(a[3]);").is_ok());
    }

    #[test]
    fn scenario_while_loop() {
        assert!(compiles("let i = 0; while i < 3 do println(i); i = i + 1; end").is_ok());
    }

    #[test]
    fn scenario_if_else() {
        assert!(compiles("if 1 == 1 do println('yes'); else println('no'); end").is_ok());
    }

    #[test]
    fn redeclaration_in_same_scope_is_an_error() {
        let result = compiles("do let x = 1; let x = 2; end");
        assert!(result.is_err());
    }

    #[test]
    fn assigning_to_a_literal_is_an_error() {
        let result = compiles("1 = 2;");
        assert!(result.is_err());
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        assert!(compiles("continue;").is_err());
    }

    #[test]
    fn constant_pool_overflow_is_a_compile_error() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("let v{i} = {i};\n"));
        }
        let err = compiles(&src).unwrap_err();
        assert!(err.0.iter().any(|e| e.message.contains("constant pool overflow")));
    }

    #[test]
    fn cond_chain_compiles() {
        assert!(compiles("cond 1 == 2 -> 'a', 1 == 1 -> 'b', end").is_ok());
    }
}
