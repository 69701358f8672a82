//! Single-pass recursive-descent / Pratt compiler (spec §4.D).
//!
//! There is no separate AST stage: every production emits bytecode directly
//! into the current function's [`ChunkBuilder`] as it is recognized. Local
//! resolution, jump patching, and closure upvalue capture all happen inline
//! during this one pass.

use std::rc::Rc;

use super::diagnostics::Diagnostics;
use super::lexer::{InterpPart, Lexer, TokKind, Token};
use crate::bytecode::chunk::{ConstValue, FunctionProto, UpvalueSource};
use crate::bytecode::{Chunk, ChunkBuilder, OpCode};
use crate::error::EmberError;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Primary,
            Prec::Primary => Prec::Primary,
        }
    }
}

fn infix_prec(kind: &TokKind) -> Prec {
    use TokKind::*;
    match kind {
        KwOr => Prec::Or,
        KwAnd => Prec::And,
        EqEq | NotEq => Prec::Equality,
        Lt | LtEq | Gt | GtEq => Prec::Comparison,
        Plus | Minus => Prec::Term,
        Star | Slash | Percent => Prec::Factor,
        LParen | Dot | LBracket => Prec::Call,
        _ => Prec::None,
    }
}

struct Local {
    name: String,
    depth: i32,
}

struct LoopCtx {
    loop_start: usize,
    break_jumps: Vec<usize>,
    scope_depth: i32,
}

/// A `break`/`continue`/`return` compiled while a `try`'s handler is still
/// on the runtime handler stack (i.e. lexically inside its `try` or `catch`
/// body) can't just jump to its usual target — the handler needs popping and
/// any `finally` needs to run first (spec §4.F: "finally ordering"). Each
/// open `try` gets one of these; the jump is left unpatched and recorded
/// here until the `try` finishes compiling and knows whether it has a
/// `finally` clause to run before routing the jump onward.
struct TryFrame {
    /// `loops.len()` when this `try` began. A `break`/`continue` whose
    /// target loop already existed at that depth is leaving this `try`'s
    /// dynamic extent; one nested entirely inside the `try` is not.
    loops_len_at_start: usize,
    exits: Vec<TryExit>,
}

enum TryExit {
    Break(usize),
    Continue(usize, usize),
    Return(usize),
    /// A throw executed directly inside the `catch` block (or raised by
    /// anything it calls): `usize` is the patch site for the protective
    /// handler's `catch_target` operand, `u8` is the catch binding's local
    /// slot — the rethrown value lands one slot above it.
    Rethrow(usize, u8),
}

struct FuncState {
    builder: ChunkBuilder,
    locals: Vec<Local>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    try_stack: Vec<TryFrame>,
    upvalues: Vec<UpvalueSource>,
    name: String,
    arity: u8,
}

impl FuncState {
    fn new(name: String) -> Self {
        // Slot 0 is reserved: in methods it holds `this`; in plain functions
        // it is simply never referenced.
        FuncState {
            builder: ChunkBuilder::new(),
            locals: vec![Local { name: String::new(), depth: 0 }],
            scope_depth: 0,
            loops: Vec::new(),
            try_stack: Vec::new(),
            upvalues: Vec::new(),
            name,
            arity: 0,
        }
    }
}

/// Compiles one source string into a top-level [`Chunk`].
pub struct Compiler {
    lexer: Lexer,
    current: Token,
    previous: Token,
    diagnostics: Diagnostics,
    funcs: Vec<FuncState>,
    source_name: String,
    class_has_superclass: Vec<bool>,
}

type PResult<T> = Result<T, EmberError>;

impl Compiler {
    pub fn compile(source: &str, source_name: &str) -> PResult<Rc<Chunk>> {
        let bogus = Token { kind: TokKind::Eof, line: 0, col: 0 };
        let mut compiler = Compiler {
            lexer: Lexer::new(source),
            current: bogus.clone(),
            previous: bogus,
            diagnostics: Diagnostics::new(),
            funcs: vec![FuncState::new("<script>".to_string())],
            source_name: source_name.to_string(),
            class_has_superclass: Vec::new(),
        };
        compiler.advance()?;
        while !compiler.check(&TokKind::Eof) {
            if let Err(e) = compiler.declaration() {
                compiler.diagnostics.record(e);
                compiler.synchronize();
            }
        }
        compiler.emit_op(OpCode::LoadNil);
        compiler.emit_op(OpCode::Return);
        compiler.diagnostics.clone().bail_if_errors()?;
        let func = compiler.funcs.pop().expect("script function state");
        Ok(Rc::new(func.builder.finish()))
    }

    /// Panic-mode recovery: skips tokens until a likely statement boundary
    /// so one compile can surface more than its first syntax error (the
    /// first one is still what `bail_if_errors` ultimately returns, per
    /// spec §7, but later ones are at least not silently swallowed — a
    /// malformed lexer byte mid-skip is itself just skipped, not re-raised).
    fn synchronize(&mut self) {
        loop {
            if self.previous.kind == TokKind::Semicolon || self.check(&TokKind::Eof) {
                return;
            }
            match self.current.kind {
                TokKind::KwLet
                | TokKind::KwFn
                | TokKind::KwClass
                | TokKind::KwImport
                | TokKind::KwIf
                | TokKind::KwWhile
                | TokKind::KwFor
                | TokKind::KwReturn
                | TokKind::KwThrow
                | TokKind::KwTry
                | TokKind::KwBreak
                | TokKind::KwContinue => return,
                _ => {}
            }
            self.previous = self.current.clone();
            match self.lexer.next_token() {
                Ok(tok) => self.current = tok,
                Err(_) => continue,
            }
        }
    }

    // --- token stream helpers -------------------------------------------

    fn advance(&mut self) -> PResult<()> {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            match self.lexer.next_token() {
                Ok(tok) => {
                    self.current = tok;
                    break;
                }
                Err((msg, line, col)) => return Err(self.error_at(line, col, msg)),
            }
        }
        Ok(())
    }

    fn check(&self, kind: &TokKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_tok(&mut self, kind: &TokKind) -> PResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, kind: &TokKind, message: &str) -> PResult<()> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: &str) -> EmberError {
        self.error_at(self.current.line, self.current.col, message.to_string())
    }

    fn error_at(&self, line: u32, col: u32, message: String) -> EmberError {
        let loc = crate::error::SourceLoc::new(self.source_name.clone(), line, col, self.lexer.line_text(line));
        EmberError::syntax(message, Some(loc))
    }

    // --- emission helpers -------------------------------------------------

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("at least the script function is always present")
    }

    fn set_line(&mut self) {
        let line = self.previous.line;
        self.func().builder.set_line(line);
    }

    fn emit_op(&mut self, op: OpCode) -> usize {
        self.set_line();
        self.func().builder.emit_op(op)
    }

    fn emit_u8(&mut self, b: u8) {
        self.func().builder.emit_u8(b);
    }

    fn emit_u16(&mut self, v: u16) {
        self.func().builder.emit_u16(v);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let at = self.emit_op(op);
        self.emit_u16(0xFFFF);
        at + 1
    }

    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.func().builder.offset() as u16;
        self.func().builder.patch_u16(operand_at, target);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        self.emit_u16(loop_start as u16);
    }

    fn add_constant(&mut self, value: ConstValue) -> u16 {
        self.func().builder.add_constant(value)
    }

    fn string_constant(&mut self, s: &str) -> u16 {
        self.add_constant(ConstValue::Str(s.to_string()))
    }

    // --- scope / locals -----------------------------------------------

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.func().scope_depth - 1;
        self.func().scope_depth = depth;
        while let Some(local) = self.func().locals.last() {
            if local.depth > depth {
                self.emit_op(OpCode::Pop);
                self.func().locals.pop();
            } else {
                break;
            }
        }
    }

    fn declare_local(&mut self, name: &str) {
        let depth = self.func().scope_depth;
        self.func().locals.push(Local { name: name.to_string(), depth });
    }

    fn resolve_local(&self, func_idx: usize, name: &str) -> Option<u8> {
        self.funcs[func_idx].locals.iter().rposition(|l| l.name == name).map(|i| i as u8)
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            return Some(self.add_upvalue(func_idx, UpvalueSource::Local(local_idx)));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, UpvalueSource::Upvalue(up_idx)));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, source: UpvalueSource) -> u8 {
        let ups = &mut self.funcs[func_idx].upvalues;
        if let Some(existing) = ups.iter().position(|u| *u == source) {
            return existing as u8;
        }
        ups.push(source);
        (ups.len() - 1) as u8
    }

    // --- declarations -------------------------------------------------

    fn declaration(&mut self) -> PResult<()> {
        if self.match_tok(&TokKind::KwLet)? {
            self.let_declaration()
        } else if self.match_tok(&TokKind::KwFn)? {
            self.fn_declaration()
        } else if self.match_tok(&TokKind::KwClass)? {
            self.class_declaration()
        } else if self.match_tok(&TokKind::KwImport)? {
            self.import_statement()
        } else {
            self.statement()
        }
    }

    fn let_declaration(&mut self) -> PResult<()> {
        let name = self.expect_identifier()?;
        if self.match_tok(&TokKind::Eq)? {
            self.expression()?;
        } else {
            self.emit_op(OpCode::LoadNil);
        }
        self.consume(&TokKind::Semicolon, "expected ';' after let declaration")?;
        self.define_variable(&name);
        Ok(())
    }

    fn define_variable(&mut self, name: &str) {
        if self.func().scope_depth > 0 {
            self.declare_local(name);
        } else {
            let idx = self.string_constant(name);
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(idx);
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.current.kind.clone() {
            TokKind::Ident(name) => {
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn fn_declaration(&mut self) -> PResult<()> {
        let name = self.expect_identifier()?;
        self.define_global_slot_for_function(&name);
        self.compile_function(name.clone())?;
        self.define_variable(&name);
        Ok(())
    }

    /// Globals are defined by name, so (unlike locals) a function can refer
    /// to itself and to siblings declared later — no pre-declaration step is
    /// needed beyond the bytecode compiling to a global lookup by name.
    fn define_global_slot_for_function(&mut self, _name: &str) {}

    fn compile_function(&mut self, name: String) -> PResult<()> {
        self.funcs.push(FuncState::new(name.clone()));
        self.begin_scope();
        self.consume(&TokKind::LParen, "expected '(' after function name")?;
        let mut arity: u8 = 0;
        if !self.check(&TokKind::RParen) {
            loop {
                let param = self.expect_identifier()?;
                self.declare_local(&param);
                arity += 1;
                if !self.match_tok(&TokKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(&TokKind::RParen, "expected ')' after parameters")?;
        self.func().arity = arity;
        self.consume(&TokKind::LBrace, "expected '{' before function body")?;
        self.block()?;
        self.emit_op(OpCode::LoadNil);
        self.emit_op(OpCode::Return);

        let finished = self.funcs.pop().expect("pushed function state");
        let chunk = Rc::new(finished.builder.finish());
        let proto = FunctionProto { name, arity: finished.arity, chunk, upvalues: finished.upvalues.clone() };
        let proto_idx = self.add_constant(ConstValue::Function(proto));
        self.emit_op(OpCode::MakeClosure);
        self.emit_u16(proto_idx);
        Ok(())
    }

    fn class_declaration(&mut self) -> PResult<()> {
        let name = self.expect_identifier()?;
        let name_idx = self.string_constant(&name);
        self.emit_op(OpCode::Class);
        self.emit_u16(name_idx);
        self.define_variable(&name);

        let mut has_superclass = false;
        if self.match_tok(&TokKind::KwExtends)? {
            let super_name = self.expect_identifier()?;
            self.variable_get(&super_name);
            self.variable_get(&name);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }
        self.class_has_superclass.push(has_superclass);

        self.variable_get(&name);
        self.consume(&TokKind::LBrace, "expected '{' before class body")?;
        while !self.check(&TokKind::RBrace) && !self.check(&TokKind::Eof) {
            self.consume(&TokKind::KwFn, "expected 'fn' before method name")?;
            let method_name = self.expect_identifier()?;
            self.compile_function(method_name.clone())?;
            let method_idx = self.string_constant(&method_name);
            self.emit_op(OpCode::Method);
            self.emit_u16(method_idx);
        }
        self.consume(&TokKind::RBrace, "expected '}' after class body")?;
        self.emit_op(OpCode::Pop); // pop the class value pushed for METHOD binding
        self.class_has_superclass.pop();
        Ok(())
    }

    fn import_statement(&mut self) -> PResult<()> {
        // `import "path";` compiles to a call of the `__import__` native
        // (spec's ambient addition — see SPEC_FULL.md's [ADDED] import note).
        let path = self.expect_string_literal()?;
        let name_idx = self.string_constant("__import__");
        self.emit_op(OpCode::GetGlobal);
        self.emit_u16(name_idx);
        let path_idx = self.string_constant(&path);
        self.emit_op(OpCode::LoadConst);
        self.emit_u16(path_idx);
        self.emit_op(OpCode::Call);
        self.emit_u8(1);
        self.emit_op(OpCode::Pop);
        self.consume(&TokKind::Semicolon, "expected ';' after import")?;
        Ok(())
    }

    fn expect_string_literal(&mut self) -> PResult<String> {
        match self.current.kind.clone() {
            TokKind::Str(s) => {
                self.advance()?;
                Ok(s)
            }
            _ => Err(self.error("expected string literal")),
        }
    }

    // --- statements -----------------------------------------------------

    fn statement(&mut self) -> PResult<()> {
        if self.match_tok(&TokKind::LBrace)? {
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        } else if self.match_tok(&TokKind::KwIf)? {
            self.if_statement()
        } else if self.match_tok(&TokKind::KwWhile)? {
            self.while_statement()
        } else if self.match_tok(&TokKind::KwFor)? {
            self.for_statement()
        } else if self.match_tok(&TokKind::KwReturn)? {
            self.return_statement()
        } else if self.match_tok(&TokKind::KwBreak)? {
            self.break_statement()
        } else if self.match_tok(&TokKind::KwContinue)? {
            self.continue_statement()
        } else if self.match_tok(&TokKind::KwThrow)? {
            self.throw_statement()
        } else if self.match_tok(&TokKind::KwTry)? {
            self.try_statement()
        } else {
            self.expr_statement()
        }
    }

    fn block(&mut self) -> PResult<()> {
        while !self.check(&TokKind::RBrace) && !self.check(&TokKind::Eof) {
            self.declaration()?;
        }
        self.consume(&TokKind::RBrace, "expected '}' to close block")
    }

    fn expr_statement(&mut self) -> PResult<()> {
        self.expression()?;
        self.consume(&TokKind::Semicolon, "expected ';' after expression")?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> PResult<()> {
        self.consume(&TokKind::LParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.consume(&TokKind::RParen, "expected ')' after condition")?;
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        if self.match_tok(&TokKind::KwElse)? {
            self.statement()?;
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> PResult<()> {
        let loop_start = self.func().builder.offset();
        self.consume(&TokKind::LParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.consume(&TokKind::RParen, "expected ')' after condition")?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);

        let scope_depth = self.func().scope_depth;
        self.func().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth });
        self.statement()?;
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        let loop_ctx = self.func().loops.pop().expect("loop context pushed above");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        Ok(())
    }

    /// C-style `for (init; cond; step) { body }` (spec §4.D). `init` is a
    /// `let` declaration, an expression statement, or empty (`;`); an
    /// omitted `cond` means always-true; `step` runs once per iteration,
    /// after the body and before the next `cond` check. Desugars the same
    /// way a `while` with a hoisted initializer and an appended step would.
    fn for_statement(&mut self) -> PResult<()> {
        self.begin_scope();
        self.consume(&TokKind::LParen, "expected '(' after 'for'")?;

        if self.match_tok(&TokKind::Semicolon)? {
            // no initializer clause
        } else if self.match_tok(&TokKind::KwLet)? {
            self.let_declaration()?;
        } else {
            self.expr_statement()?;
        }

        let mut loop_start = self.func().builder.offset();
        let mut exit_jump = None;
        if !self.match_tok(&TokKind::Semicolon)? {
            self.expression()?;
            self.consume(&TokKind::Semicolon, "expected ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
        }

        if !self.check(&TokKind::RParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.func().builder.offset();
            self.expression()?;
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.consume(&TokKind::RParen, "expected ')' after for clauses")?;

        let scope_depth = self.func().scope_depth;
        self.func().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth });
        self.statement()?;
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }

        let loop_ctx = self.func().loops.pop().expect("loop context pushed above");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
        Ok(())
    }

    fn break_statement(&mut self) -> PResult<()> {
        self.consume(&TokKind::Semicolon, "expected ';' after 'break'")?;
        if self.func().loops.is_empty() {
            return Err(self.error("'break' used outside of a loop"));
        }
        let target_depth = self.func().loops.last().unwrap().scope_depth;
        let pops = self.func().locals.iter().filter(|l| l.depth > target_depth).count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }
        self.compile_break();
        Ok(())
    }

    fn continue_statement(&mut self) -> PResult<()> {
        self.consume(&TokKind::Semicolon, "expected ';' after 'continue'")?;
        if self.func().loops.is_empty() {
            return Err(self.error("'continue' used outside of a loop"));
        }
        let loop_ctx_depth = self.func().loops.last().unwrap().scope_depth;
        let loop_start = self.func().loops.last().unwrap().loop_start;
        let pops = self.func().locals.iter().filter(|l| l.depth > loop_ctx_depth).count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }
        self.compile_continue(loop_start);
        Ok(())
    }

    fn return_statement(&mut self) -> PResult<()> {
        if self.match_tok(&TokKind::Semicolon)? {
            self.emit_op(OpCode::LoadNil);
        } else {
            self.expression()?;
            self.consume(&TokKind::Semicolon, "expected ';' after return value")?;
        }
        self.compile_return();
        Ok(())
    }

    /// True if the innermost still-open `try`'s handler needs to be popped
    /// (and its `finally`, if any, run) to reach the target loop of a
    /// `break`/`continue` compiled right now — i.e. that loop already
    /// existed when the `try` began, so it lies outside the `try`'s body
    /// rather than nested inside it.
    fn crosses_innermost_try(&mut self) -> bool {
        match self.func().try_stack.last() {
            Some(frame) => frame.loops_len_at_start == self.func().loops.len(),
            None => false,
        }
    }

    /// Emits a `break` jump. If it would leave an open `try`'s handler
    /// dangling, routes it through that `try`'s deferred exit list instead
    /// of straight to the loop (see `compile_try_exits`).
    fn compile_break(&mut self) {
        if self.crosses_innermost_try() {
            self.emit_op(OpCode::PopHandler);
            let jump = self.emit_jump(OpCode::Jump);
            self.func().try_stack.last_mut().unwrap().exits.push(TryExit::Break(jump));
        } else {
            let jump = self.emit_jump(OpCode::Jump);
            self.func().loops.last_mut().unwrap().break_jumps.push(jump);
        }
    }

    fn compile_continue(&mut self, loop_start: usize) {
        if self.crosses_innermost_try() {
            self.emit_op(OpCode::PopHandler);
            let jump = self.emit_jump(OpCode::Jump);
            self.func().try_stack.last_mut().unwrap().exits.push(TryExit::Continue(jump, loop_start));
        } else {
            self.emit_loop(loop_start);
        }
    }

    /// `return` always leaves every `try` still open in this function, so it
    /// routes through the innermost one unconditionally (no loop-depth check
    /// — unlike `break`/`continue` there's no "nested inside the try" case).
    fn compile_return(&mut self) {
        if self.func().try_stack.is_empty() {
            self.emit_op(OpCode::Return);
        } else {
            self.emit_op(OpCode::PopHandler);
            let jump = self.emit_jump(OpCode::Jump);
            self.func().try_stack.last_mut().unwrap().exits.push(TryExit::Return(jump));
        }
    }

    /// Re-lexes and re-compiles a `finally` block's source from a checkpoint
    /// taken right after its opening `{`, appending a fresh copy of its
    /// bytecode at the current position. Used to run a `finally` a second
    /// time for each abnormal exit (`break`/`continue`/`return`) that skips
    /// over its normal, single, fallthrough copy.
    fn replay_finally(&mut self, checkpoint: &(Lexer, Token, Token)) {
        let (saved_lexer, saved_current, saved_previous) = checkpoint.clone();
        let real_lexer = std::mem::replace(&mut self.lexer, saved_lexer);
        let real_current = std::mem::replace(&mut self.current, saved_current);
        let real_previous = std::mem::replace(&mut self.previous, saved_previous);
        self.begin_scope();
        if let Err(e) = self.block() {
            // The real pass already parsed this exact span successfully;
            // getting here would be a compiler bug, not a user error.
            self.diagnostics.record(e);
        }
        self.end_scope();
        self.lexer = real_lexer;
        self.current = real_current;
        self.previous = real_previous;
    }

    /// Patches each deferred exit recorded while compiling `frame`'s `try`
    /// (or `catch`) body: land here, replay the `finally` if this `try` has
    /// one, then route the exit onward — to an enclosing `try` if it also
    /// needs crossing, or otherwise to its original target.
    fn compile_try_exits(&mut self, frame: TryFrame, finally_checkpoint: Option<&(Lexer, Token, Token)>) {
        for exit in frame.exits {
            match exit {
                TryExit::Break(jump) => {
                    self.patch_jump(jump);
                    if let Some(ck) = finally_checkpoint {
                        self.replay_finally(ck);
                    }
                    self.compile_break();
                }
                TryExit::Continue(jump, loop_start) => {
                    self.patch_jump(jump);
                    if let Some(ck) = finally_checkpoint {
                        self.replay_finally(ck);
                    }
                    self.compile_continue(loop_start);
                }
                TryExit::Return(jump) => {
                    self.patch_jump(jump);
                    if let Some(ck) = finally_checkpoint {
                        self.replay_finally(ck);
                    }
                    self.compile_return();
                }
                TryExit::Rethrow(handler_patch_site, binding_slot) => {
                    self.patch_jump(handler_patch_site);
                    // The VM just unwound to here with a fresh exception in
                    // the slot above `binding`'s — two runtime stack slots
                    // this pass's bookkeeping no longer knows about (the
                    // binding's, kept by the unwind, and the rethrown value
                    // on top of it). Restore it so a replayed `finally`'s
                    // own locals land on the slots the VM actually has.
                    let depth = self.func().scope_depth;
                    self.func().locals.push(Local { name: String::new(), depth });
                    self.func().locals.push(Local { name: String::new(), depth });
                    if let Some(ck) = finally_checkpoint {
                        self.replay_finally(ck);
                    }
                    self.emit_op(OpCode::GetLocal);
                    self.emit_u8(binding_slot + 1);
                    self.emit_op(OpCode::Throw);
                    let restored = self.func().locals.len() - 2;
                    self.func().locals.truncate(restored);
                }
            }
        }
    }

    fn throw_statement(&mut self) -> PResult<()> {
        self.expression()?;
        self.consume(&TokKind::Semicolon, "expected ';' after throw value")?;
        self.emit_op(OpCode::Throw);
        Ok(())
    }

    /// `try { ... } catch (e) { ... } finally { ... }`. `PUSH_HANDLER` takes
    /// the catch target and the finally target (0 meaning absent); the VM's
    /// handler stack does the actual unwinding (spec §4.F).
    ///
    /// The catch block gets its own, second handler around it: by the time
    /// catch code runs, the handler that caught the original exception is
    /// already gone (`throw` pops it on the way in), so without this a
    /// throw raised directly inside catch — a re-throw of the same value, a
    /// different throw, or any runtime error — would skip straight past
    /// this try's own `finally` to the next enclosing one. This second
    /// handler's target is one of this try's deferred exits (`TryExit::
    /// Rethrow`, handled in `compile_try_exits`) so it replays the
    /// `finally` before re-raising, the same way a `break`/`continue`/
    /// `return` out of try or catch does.
    fn try_statement(&mut self) -> PResult<()> {
        let handler_at = self.emit_jump(OpCode::PushHandler);
        let finally_operand_at = handler_at + 2;
        self.emit_u16(0); // finally target placeholder; patched below if a 'finally' clause follows
        self.consume(&TokKind::LBrace, "expected '{' after 'try'")?;

        let loops_len_at_start = self.func().loops.len();
        self.func().try_stack.push(TryFrame { loops_len_at_start, exits: Vec::new() });

        self.begin_scope();
        self.block()?;
        self.end_scope();
        self.emit_op(OpCode::PopHandler);
        let skip_catch = self.emit_jump(OpCode::Jump);

        self.patch_jump(handler_at);
        self.consume(&TokKind::KwCatch, "expected 'catch' after 'try' block")?;
        self.consume(&TokKind::LParen, "expected '(' after 'catch'")?;
        let binding = self.expect_identifier()?;
        self.consume(&TokKind::RParen, "expected ')' after catch binding")?;
        self.consume(&TokKind::LBrace, "expected '{' after catch clause")?;
        self.begin_scope();
        self.declare_local(&binding); // VM pushes the caught exception before resuming here
        let binding_slot = (self.func().locals.len() - 1) as u8;

        let rethrow_handler_at = self.emit_jump(OpCode::PushHandler);
        self.emit_u16(0); // finally target unused here; finally is replayed directly instead

        self.block()?;
        self.end_scope();
        self.emit_op(OpCode::PopHandler);
        self.patch_jump(skip_catch);

        let mut frame = self.func().try_stack.pop().expect("try frame pushed above");
        frame.exits.push(TryExit::Rethrow(rethrow_handler_at, binding_slot));

        let mut finally_checkpoint = None;
        if self.match_tok(&TokKind::KwFinally)? {
            let finally_start = self.func().builder.offset() as u16;
            self.func().builder.patch_u16(finally_operand_at, finally_start);
            self.consume(&TokKind::LBrace, "expected '{' after 'finally'")?;
            finally_checkpoint = Some((self.lexer.clone(), self.current.clone(), self.previous.clone()));
            self.begin_scope();
            self.block()?;
            self.end_scope();
            self.emit_op(OpCode::EndFinally);
        }

        // Normal completion (no break/continue/return/rethrow) must jump
        // over the deferred exits compiled below, not fall into them.
        let normal_exit = self.emit_jump(OpCode::Jump);

        // Any break/continue/return compiled inside the try/catch body above
        // couldn't jump straight to its target without leaving this try's
        // handler on the stack and skipping its finally (spec §4.F); land
        // those jumps here, now that both are known. Likewise a throw
        // raised directly inside the catch block above.
        self.compile_try_exits(frame, finally_checkpoint.as_ref());
        self.patch_jump(normal_exit);
        Ok(())
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self) -> PResult<()> {
        self.parse_precedence(Prec::Assignment)
    }

    fn parse_precedence(&mut self, prec: Prec) -> PResult<()> {
        self.advance()?;
        let can_assign = prec <= Prec::Assignment;
        self.prefix(can_assign)?;
        while prec <= infix_prec(&self.current.kind) {
            self.advance()?;
            self.infix(can_assign)?;
        }
        if can_assign && self.check(&TokKind::Eq) {
            return Err(self.error("invalid assignment target"));
        }
        Ok(())
    }

    fn prefix(&mut self, can_assign: bool) -> PResult<()> {
        match self.previous.kind.clone() {
            TokKind::Number(n) => {
                let idx = self.add_constant(ConstValue::Number(n));
                self.emit_op(OpCode::LoadConst);
                self.emit_u16(idx);
                Ok(())
            }
            TokKind::Str(s) => {
                let idx = self.string_constant(&s);
                self.emit_op(OpCode::LoadConst);
                self.emit_u16(idx);
                Ok(())
            }
            TokKind::InterpStr(parts) => self.compile_interpolated_string(parts),
            TokKind::KwTrue => {
                self.emit_op(OpCode::LoadTrue);
                Ok(())
            }
            TokKind::KwFalse => {
                self.emit_op(OpCode::LoadFalse);
                Ok(())
            }
            TokKind::KwNil => {
                self.emit_op(OpCode::LoadNil);
                Ok(())
            }
            TokKind::Ident(name) => self.compile_named_variable(&name, can_assign),
            TokKind::KwThis => {
                self.compile_named_variable_slot(0);
                Ok(())
            }
            TokKind::KwSuper => self.compile_super_access(),
            TokKind::KwNew => self.compile_new_expression(),
            TokKind::LParen => {
                self.expression()?;
                self.consume(&TokKind::RParen, "expected ')' after expression")
            }
            TokKind::LBracket => self.compile_array_literal(),
            TokKind::LBrace => self.compile_map_literal(),
            TokKind::Minus => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(OpCode::Neg);
                Ok(())
            }
            TokKind::KwNot => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(OpCode::Not);
                Ok(())
            }
            TokKind::KwFn => self.compile_function_expression(),
            other => Err(self.error(&format!("unexpected token in expression: {other:?}"))),
        }
    }

    fn compile_function_expression(&mut self) -> PResult<()> {
        self.compile_function("<anonymous>".to_string())
    }

    fn infix(&mut self, can_assign: bool) -> PResult<()> {
        match self.previous.kind.clone() {
            TokKind::Plus => self.binary(Prec::Term, OpCode::Add),
            TokKind::Minus => self.binary(Prec::Term, OpCode::Sub),
            TokKind::Star => self.binary(Prec::Factor, OpCode::Mul),
            TokKind::Slash => self.binary(Prec::Factor, OpCode::Div),
            TokKind::Percent => self.binary(Prec::Factor, OpCode::Mod),
            TokKind::EqEq => self.binary(Prec::Equality, OpCode::Eq),
            TokKind::NotEq => self.binary(Prec::Equality, OpCode::NotEq),
            TokKind::Lt => self.binary(Prec::Comparison, OpCode::Lt),
            TokKind::LtEq => self.binary(Prec::Comparison, OpCode::Le),
            TokKind::Gt => self.binary(Prec::Comparison, OpCode::Gt),
            TokKind::GtEq => self.binary(Prec::Comparison, OpCode::Ge),
            TokKind::KwAnd => self.compile_and(),
            TokKind::KwOr => self.compile_or(),
            TokKind::LParen => self.compile_call(),
            TokKind::Dot => self.compile_property(can_assign),
            TokKind::LBracket => self.compile_index(can_assign),
            other => Err(self.error(&format!("unexpected infix token: {other:?}"))),
        }
    }

    fn binary(&mut self, prec: Prec, op: OpCode) -> PResult<()> {
        self.parse_precedence(prec.next())?;
        self.emit_op(op);
        Ok(())
    }

    /// `JUMP_IF_FALSE` pops its condition (spec §4.E), so short-circuit
    /// `and`/`or` duplicate the left operand first and let the fallthrough
    /// path pop the now-unneeded copy before evaluating the right operand.
    fn compile_and(&mut self) -> PResult<()> {
        self.emit_op(OpCode::Dup);
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::And)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn compile_or(&mut self) -> PResult<()> {
        self.emit_op(OpCode::Dup);
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::Or)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    // --- variables, calls, containers -------------------------------------

    fn compile_named_variable(&mut self, name: &str, can_assign: bool) -> PResult<()> {
        let func_idx = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(func_idx, name) {
            if can_assign && self.match_tok(&TokKind::Eq)? {
                self.expression()?;
                self.emit_op(OpCode::SetLocal);
                self.emit_u8(slot);
            } else {
                self.emit_op(OpCode::GetLocal);
                self.emit_u8(slot);
            }
        } else if let Some(up) = self.resolve_upvalue(func_idx, name) {
            if can_assign && self.check(&TokKind::Eq) {
                return Err(self.error("cannot assign to a captured (upvalue) variable"));
            }
            self.emit_op(OpCode::GetUpvalue);
            self.emit_u8(up);
        } else {
            let idx = self.string_constant(name);
            if can_assign && self.match_tok(&TokKind::Eq)? {
                self.expression()?;
                self.emit_op(OpCode::SetGlobal);
                self.emit_u16(idx);
            } else {
                self.emit_op(OpCode::GetGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn compile_named_variable_slot(&mut self, slot: u8) {
        self.emit_op(OpCode::GetLocal);
        self.emit_u8(slot);
    }

    /// Pushes the named variable's current value without considering
    /// assignment — used internally (e.g. re-reading the class being built).
    fn variable_get(&mut self, name: &str) {
        let func_idx = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(func_idx, name) {
            self.emit_op(OpCode::GetLocal);
            self.emit_u8(slot);
        } else if let Some(up) = self.resolve_upvalue(func_idx, name) {
            self.emit_op(OpCode::GetUpvalue);
            self.emit_u8(up);
        } else {
            let idx = self.string_constant(name);
            self.emit_op(OpCode::GetGlobal);
            self.emit_u16(idx);
        }
    }

    fn compile_super_access(&mut self) -> PResult<()> {
        self.consume(&TokKind::Dot, "expected '.' after 'super'")?;
        let method = self.expect_identifier()?;
        self.compile_named_variable_slot(0); // `this`
        let idx = self.string_constant(&method);
        self.emit_op(OpCode::GetSuper);
        self.emit_u16(idx);
        Ok(())
    }

    /// `new ClassName(args)`: constructing an instance is just calling the
    /// class value (the VM's `Call` on a `Class` allocates the instance and
    /// runs `init`), so `new` compiles to the same bytecode as a plain call
    /// expression on the class variable.
    fn compile_new_expression(&mut self) -> PResult<()> {
        let name = self.expect_identifier()?;
        self.variable_get(&name);
        self.consume(&TokKind::LParen, "expected '(' after class name in 'new' expression")?;
        let argc = self.compile_arg_list()?;
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
        Ok(())
    }

    fn compile_call(&mut self) -> PResult<()> {
        let argc = self.compile_arg_list()?;
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
        Ok(())
    }

    fn compile_arg_list(&mut self) -> PResult<u8> {
        let mut argc = 0u8;
        if !self.check(&TokKind::RParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.match_tok(&TokKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(&TokKind::RParen, "expected ')' after arguments")?;
        Ok(argc)
    }

    fn compile_property(&mut self, can_assign: bool) -> PResult<()> {
        let name = self.expect_identifier()?;
        let idx = self.string_constant(&name);
        if can_assign && self.match_tok(&TokKind::Eq)? {
            self.expression()?;
            self.emit_op(OpCode::SetProperty);
            self.emit_u16(idx);
        } else if self.check(&TokKind::LParen) {
            self.advance()?;
            let argc = self.compile_arg_list()?;
            self.emit_op(OpCode::Invoke);
            self.emit_u16(idx);
            self.emit_u8(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(idx);
        }
        Ok(())
    }

    fn compile_index(&mut self, can_assign: bool) -> PResult<()> {
        self.expression()?;
        self.consume(&TokKind::RBracket, "expected ']' after index")?;
        if can_assign && self.match_tok(&TokKind::Eq)? {
            self.expression()?;
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
        Ok(())
    }

    fn compile_array_literal(&mut self) -> PResult<()> {
        let mut count: u16 = 0;
        if !self.check(&TokKind::RBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.match_tok(&TokKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(&TokKind::RBracket, "expected ']' after array literal")?;
        self.emit_op(OpCode::NewArray);
        self.emit_u16(count);
        Ok(())
    }

    fn compile_map_literal(&mut self) -> PResult<()> {
        let mut count: u16 = 0;
        if !self.check(&TokKind::RBrace) {
            loop {
                self.expression()?;
                self.consume(&TokKind::Colon, "expected ':' between hash_map key and value")?;
                self.expression()?;
                count += 1;
                if !self.match_tok(&TokKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(&TokKind::RBrace, "expected '}' after hash_map literal")?;
        self.emit_op(OpCode::NewMap);
        self.emit_u16(count);
        Ok(())
    }

    fn compile_interpolated_string(&mut self, parts: Vec<InterpPart>) -> PResult<()> {
        let empty_idx = self.string_constant("");
        self.emit_op(OpCode::LoadConst);
        self.emit_u16(empty_idx);
        for part in parts {
            match part {
                InterpPart::Literal(s) => {
                    let idx = self.string_constant(&s);
                    self.emit_op(OpCode::LoadConst);
                    self.emit_u16(idx);
                }
                InterpPart::Expr(src) => self.compile_nested_expression(src)?,
            }
            self.emit_op(OpCode::Add);
        }
        Ok(())
    }

    /// Parses and compiles `src` as a standalone expression in the *current*
    /// function scope (so locals/upvalues still resolve), used for `${...}`
    /// interpolation segments. Swaps in a fresh lexer over `src` and restores
    /// the enclosing one afterward.
    fn compile_nested_expression(&mut self, src: String) -> PResult<()> {
        let saved_lexer = std::mem::replace(&mut self.lexer, Lexer::new(&src));
        let saved_current = std::mem::replace(&mut self.current, Token { kind: TokKind::Eof, line: 0, col: 0 });
        let saved_previous = std::mem::replace(&mut self.previous, Token { kind: TokKind::Eof, line: 0, col: 0 });
        self.advance()?;
        let result = self.expression();
        self.lexer = saved_lexer;
        self.current = saved_current;
        self.previous = saved_previous;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::OpCode as Op;

    fn compile(src: &str) -> Rc<Chunk> {
        Compiler::compile(src, "<test>").expect("compiles")
    }

    #[test]
    fn compiles_arithmetic_to_expected_opcodes() {
        let chunk = compile("1 + 2 * 3;");
        assert_eq!(chunk.read_u8(0), Op::LoadConst as u8);
    }

    #[test]
    fn compiles_let_and_global_lookup() {
        let chunk = compile("let x = 1; x;");
        assert!(chunk.code.contains(&(Op::DefineGlobal as u8)));
        assert!(chunk.code.contains(&(Op::GetGlobal as u8)));
    }

    #[test]
    fn compiles_while_loop_with_loop_opcode() {
        let chunk = compile("while (true) { break; }");
        assert!(chunk.code.contains(&(Op::Loop as u8)));
    }

    #[test]
    fn compiles_try_catch_finally() {
        let chunk = compile("try { throw 1; } catch (e) { } finally { }");
        assert!(chunk.code.contains(&(Op::PushHandler as u8)));
        assert!(chunk.code.contains(&(Op::EndFinally as u8)));
    }

    #[test]
    fn compiles_class_with_method() {
        let chunk = compile("class Foo { bar() { return 1; } }");
        assert!(chunk.code.contains(&(Op::Class as u8)));
        assert!(chunk.code.contains(&(Op::Method as u8)));
    }
}
