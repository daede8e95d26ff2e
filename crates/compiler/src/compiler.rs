//! Single-pass Pratt compiler: source text in, a bytecode-bearing top-level
//! function out. No AST — every construct is linearized as it is parsed.
//!
//! State is a stack of per-function compilers (one per enclosing function
//! literal, each with its locals, upvalues, loop contexts, and a constant
//! dedup table) plus an orthogonal stack of class contexts used to diagnose
//! `this`/`super` misuse. Errors are collected, panic mode suppresses the
//! cascade until a statement boundary, and compilation always runs to EOF
//! before reporting failure.

use std::fmt;

use lox_core::chunk::OpCode;
use lox_core::debug::disassemble_chunk;
use lox_core::heap::Heap;
use lox_core::object::{GcRef, ObjFunction, ObjString};
use lox_core::table::Table;
use lox_core::Value;

use crate::scanner::{Scanner, Token, TokenKind};

/// Per-function cap on local slots; slot operands are a single byte.
pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    /// Offending lexeme; `None` for scanner-produced error tokens.
    pub lexeme: Option<String>,
    pub at_end: bool,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        if self.at_end {
            write!(f, " at end")?;
        } else if let Some(lexeme) = &self.lexeme {
            write!(f, " at '{}'", lexeme)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// REPL mode: top-level expression statements print their non-nil value.
    pub eval_expr: bool,
    /// Dump every finished function's disassembly to stderr.
    pub print_code: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
    Static,
    Lambda,
    Try,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRec {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    /// Jump target for `continue`: the increment clause if there is one,
    /// otherwise the condition.
    start: usize,
    /// Locals above this depth are popped or closed on `break`/`continue`.
    scope_depth: i32,
    breaks: Vec<usize>,
    /// `(inner, loop_var)` slots when a `for` initializer variable is
    /// mirrored into the body.
    copy: Option<(u8, u8)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SuperKind {
    None,
    Single,
    Multiple,
}

struct ClassCtx {
    superclass: SuperKind,
}

struct FnCompiler<'src> {
    function: GcRef<ObjFunction>,
    ftype: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<UpvalueRec>,
    /// Constant value -> pool index, so identical constants share a slot.
    constants: Table,
    loops: Vec<LoopCtx>,
}

/// Ascending binding power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,  // = += -= *= /=
    Conditional, // ?:
    Or,          // or
    And,         // and
    Equality,    // == !=
    Comparison,  // < > <= >=
    Term,        // + -
    Factor,      // * /
    Unary,       // ! -
    Call,        // . () []
    Primary,
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::Dot => Precedence::Call,
        TokenKind::Query => Precedence::Conditional,
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash => Precedence::Factor,
        _ => Precedence::None,
    }
}

struct Compilation<'src, 'h> {
    heap: &'h mut Heap,
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compilers: Vec<FnCompiler<'src>>,
    classes: Vec<ClassCtx>,
    options: CompileOptions,
}

/// Compiles `source` to a top-level function. The function is well-formed
/// even on error, but errors win: the caller gets the full diagnostic list.
pub fn compile(
    heap: &mut Heap,
    source: &str,
    options: CompileOptions,
) -> Result<GcRef<ObjFunction>, Vec<CompileError>> {
    let dummy = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 0,
    };
    let mut c = Compilation {
        heap,
        scanner: Scanner::new(source),
        previous: dummy,
        current: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        compilers: Vec::new(),
        classes: Vec::new(),
        options,
    };

    c.init_compiler(FunctionType::Script);
    c.advance();
    while !c.matches(TokenKind::Eof) {
        c.declaration();
    }
    let compiler = c.end_compiler();
    c.heap.pop_root();

    if c.had_error {
        Err(c.errors)
    } else {
        Ok(compiler.function)
    }
}

impl<'src, 'h> Compilation<'src, 'h> {
    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // Panic mode suppresses the cascade until we resynchronize.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let (lexeme, at_end) = match token.kind {
            TokenKind::Eof => (None, true),
            TokenKind::Error => (None, false),
            _ => (Some(token.lexeme.to_string()), false),
        };
        self.errors.push(CompileError {
            line: token.line,
            lexeme,
            at_end,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Static => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Emit helpers
    // ------------------------------------------------------------------

    fn current_function(&self) -> GcRef<ObjFunction> {
        self.compilers[self.compilers.len() - 1].function
    }

    fn current_ftype(&self) -> FunctionType {
        self.compilers[self.compilers.len() - 1].ftype
    }

    fn current_offset(&self) -> usize {
        self.current_function().chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let mut function = self.current_function();
        function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.current_ftype() == FunctionType::Initializer {
            // An initializer always hands back its receiver.
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Interns `value` in the current chunk's constant pool, reusing the slot
    /// of an equal constant seen earlier.
    fn make_constant(&mut self, value: Value) -> u8 {
        let ci = self.compilers.len() - 1;
        if let Some(existing) = self.compilers[ci].constants.get(value) {
            return existing.as_number() as u8;
        }
        let mut function = self.compilers[ci].function;
        let index = function.chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.compilers[ci]
            .constants
            .set(value, Value::number(index as f64));
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Emits `op` with a two-byte placeholder operand; returns the offset of
    /// the operand for a later `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand itself.
        let jump = self.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much bytecode to jump over.");
        }
        let mut function = self.current_function();
        function.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        function.chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Collects before interning so a triggered collection cannot sweep the
    /// string it is about to produce.
    fn intern(&mut self, chars: &str) -> GcRef<ObjString> {
        self.heap.maybe_collect();
        self.heap.copy_string(chars)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.intern(name);
        self.make_constant(Value::from(string))
    }

    fn emit_invoke(&mut self, name: &str, arg_count: u8) {
        let constant = self.identifier_constant(name);
        self.emit_op_byte(OpCode::Invoke, constant);
        self.emit_byte(arg_count);
    }

    // ------------------------------------------------------------------
    // Compiler stack
    // ------------------------------------------------------------------

    fn init_compiler(&mut self, ftype: FunctionType) {
        self.heap.maybe_collect();
        let mut function = self.heap.new_function(None, ftype == FunctionType::Try);
        // Rooted until the enclosing compiler embeds it as a constant (or,
        // for the script, until `compile` returns it).
        self.heap.push_root(Value::from(function));
        function.name = match ftype {
            FunctionType::Script => None,
            FunctionType::Lambda => Some(self.heap.lambda_name()),
            FunctionType::Try => Some(self.heap.copy_string("try")),
            _ => Some(self.heap.copy_string(self.previous.lexeme)),
        };

        // Slot 0 belongs to the callee; methods expose it as `this`.
        let slot_zero = Local {
            name: match ftype {
                FunctionType::Method | FunctionType::Initializer => "this",
                _ => "",
            },
            depth: 0,
            captured: false,
        };
        self.compilers.push(FnCompiler {
            function,
            ftype,
            locals: vec![slot_zero],
            scope_depth: 0,
            upvalues: Vec::new(),
            constants: Table::new(),
            loops: Vec::new(),
        });
    }

    /// Finishes the current function and pops its compiler. The caller is
    /// responsible for popping the matching heap root once the function has
    /// been embedded somewhere reachable.
    fn end_compiler(&mut self) -> FnCompiler<'src> {
        self.emit_return();
        let compiler = self.compilers.pop().expect("compiler stack underflow");

        if self.options.print_code && !self.had_error {
            let function = compiler.function;
            let name = match function.name {
                Some(name) => name.chars.clone(),
                None => "<script>".to_string(),
            };
            eprintln!("{}", disassemble_chunk(&function.chunk, &name));
        }
        compiler
    }

    /// Embeds a finished function and emits the closure that captures its
    /// upvalues.
    fn finish_function(&mut self, compiler: FnCompiler<'src>) {
        let constant = self.make_constant(Value::from(compiler.function));
        self.heap.pop_root();
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &compiler.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    // ------------------------------------------------------------------
    // Scopes, locals, upvalues
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        let ci = self.compilers.len() - 1;
        self.compilers[ci].scope_depth += 1;
    }

    fn emit_pops(&mut self, count: usize) {
        match count {
            0 => {}
            1 => self.emit_op(OpCode::Pop),
            n => self.emit_op_byte(OpCode::PopN, n as u8),
        }
    }

    fn end_scope(&mut self) {
        let ci = self.compilers.len() - 1;
        self.compilers[ci].scope_depth -= 1;
        let depth = self.compilers[ci].scope_depth;

        let mut pending = 0;
        loop {
            let (local_depth, captured) = match self.compilers[ci].locals.last() {
                Some(local) => (local.depth, local.captured),
                None => break,
            };
            if local_depth <= depth {
                break;
            }
            self.compilers[ci].locals.pop();
            if captured {
                // A captured slot must be lifted off the stack, not dropped.
                self.emit_pops(pending);
                pending = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
        }
        self.emit_pops(pending);
    }

    /// Emits the pops/closes `break`/`continue` need without disturbing the
    /// compile-time locals, which the rest of the loop body still uses.
    fn discard_locals(&mut self, above: i32) {
        let ci = self.compilers.len() - 1;
        let mut pending = 0;
        for i in (0..self.compilers[ci].locals.len()).rev() {
            let (depth, captured) = {
                let local = &self.compilers[ci].locals[i];
                (local.depth, local.captured)
            };
            if depth <= above {
                break;
            }
            if captured {
                self.emit_pops(pending);
                pending = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
        }
        self.emit_pops(pending);
    }

    fn add_local(&mut self, name: &'src str) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compilers[ci].locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].scope_depth == 0 {
            return;
        }
        let depth = self.compilers[ci].scope_depth;
        if let Some(local) = self.compilers[ci].locals.last_mut() {
            local.depth = depth;
        }
    }

    fn declare_variable(&mut self) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for i in (0..self.compilers[ci].locals.len()).rev() {
            let local = &self.compilers[ci].locals[i];
            if local.depth != -1 && local.depth < self.compilers[ci].scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, ci: usize, name: &str) -> Option<u8> {
        for i in (0..self.compilers[ci].locals.len()).rev() {
            if self.compilers[ci].locals[i].name == name {
                if self.compilers[ci].locals[i].depth == -1 {
                    self.error("Cannot read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool) -> u8 {
        let record = UpvalueRec { index, is_local };
        for (i, existing) in self.compilers[ci].upvalues.iter().enumerate() {
            if *existing == record {
                return i as u8;
            }
        }
        if self.compilers[ci].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[ci].upvalues.push(record);
        let count = self.compilers[ci].upvalues.len();
        let mut function = self.compilers[ci].function;
        function.upvalue_count = count;
        (count - 1) as u8
    }

    /// Finds `name` in an enclosing compiler, threading an upvalue through
    /// every function in between.
    fn resolve_upvalue(&mut self, ci: usize, name: &str) -> Option<u8> {
        if ci == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(ci, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue, false));
        }
        None
    }

    fn match_compound(&mut self) -> Option<OpCode> {
        let op = match self.current.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let ci = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(ci, name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(ci, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign {
            if self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_op_byte(set_op, arg);
                return;
            }
            if let Some(op) = self.match_compound() {
                self.emit_op_byte(get_op, arg);
                self.expression();
                self.emit_op(op);
                self.emit_op_byte(set_op, arg);
                return;
            }
        }
        self.emit_op_byte(get_op, arg);
    }

    // ------------------------------------------------------------------
    // Pratt core
    // ------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        self.infix_loop(precedence, can_assign);
    }

    fn infix_loop(&mut self, precedence: Precedence, can_assign: bool) {
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }

        // An assignment operator still sitting here means no rule consumed
        // it: the target to the left was not assignable.
        if can_assign
            && matches!(
                self.current.kind,
                TokenKind::Equal
                    | TokenKind::PlusEqual
                    | TokenKind::MinusEqual
                    | TokenKind::StarEqual
                    | TokenKind::SlashEqual
            )
        {
            self.advance();
            self.error("Invalid assignment target.");
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::Minus | TokenKind::Plus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string_literal(),
            TokenKind::Interpolation => self.interpolation(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::Nil | TokenKind::True | TokenKind::False => self.literal(),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            TokenKind::Fun => self.lambda(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftBracket => self.subscript(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::Query => self.conditional(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            _ => self.binary(),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
    }

    fn string_literal(&mut self) {
        let string = self.intern(self.previous.lexeme);
        self.emit_constant(Value::from(string));
    }

    /// `"a${x}b"` lowers to `concatenate("a", string(x), "b")` with the
    /// callee and coercions fetched straight from the STL so user bindings
    /// cannot shadow them.
    fn interpolation(&mut self) {
        let concatenate = self.identifier_constant("concatenate");
        self.emit_op_byte(OpCode::GetStl, concatenate);

        let mut arg_count: u32 = 0;
        loop {
            let segment = self.intern(self.previous.lexeme);
            self.emit_constant(Value::from(segment));
            arg_count += 1;

            let string_name = self.identifier_constant("string");
            self.emit_op_byte(OpCode::GetStl, string_name);
            self.expression();
            self.emit_op_byte(OpCode::Call, 1);
            arg_count += 1;

            if !self.matches(TokenKind::Interpolation) {
                break;
            }
        }
        self.consume(TokenKind::String, "Expect end of string interpolation.");
        let tail = self.intern(self.previous.lexeme);
        self.emit_constant(Value::from(tail));
        arg_count += 1;

        if arg_count > 255 {
            self.error("Cannot have more than 255 arguments.");
        }
        self.emit_op_byte(OpCode::Call, arg_count as u8);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    /// `[a, b, c]` builds through the STL `Array` constructor.
    fn array_literal(&mut self) {
        let array = self.identifier_constant("Array");
        self.emit_op_byte(OpCode::GetStl, array);

        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_op_byte(OpCode::Call, arg_count.min(255) as u8);
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            // Unary plus parses and emits nothing.
            _ => {}
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let next = match infix_precedence(operator) {
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            other => other,
        };
        self.parse_precedence(next);

        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => {}
        }
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => {}
        }
    }

    /// Ternary `cond ? a : b` and elvis `cond ?: b`, both right-associative
    /// at `Conditional` precedence; mirrors if/else control flow.
    fn conditional(&mut self) {
        if self.matches(TokenKind::Colon) {
            // Elvis: keep the condition value when it is truthy.
            let then_jump = self.emit_jump(OpCode::JumpIfFalse);
            let else_jump = self.emit_jump(OpCode::Jump);
            self.patch_jump(then_jump);
            self.emit_op(OpCode::Pop);
            self.parse_precedence(Precedence::Conditional);
            self.patch_jump(else_jump);
        } else {
            let then_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.parse_precedence(Precedence::Conditional);
            let else_jump = self.emit_jump(OpCode::Jump);
            self.patch_jump(then_jump);
            self.consume(
                TokenKind::Colon,
                "Expect ':' after first branch of ternary conditional.",
            );
            self.emit_op(OpCode::Pop);
            self.parse_precedence(Precedence::Conditional);
            self.patch_jump(else_jump);
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot use 'this' outside of a class.");
            return;
        }
        if self.current_ftype() == FunctionType::Static {
            self.error("Cannot use 'this' in a static method.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self) {
        let super_kind = self.classes.last().map(|class| class.superclass);
        match super_kind {
            None => {
                self.error("Cannot use 'super' outside of a class.");
                return;
            }
            Some(SuperKind::None) => {
                self.error("Cannot use 'super' in a class with no superclass.");
                return;
            }
            _ => {}
        }

        if self.matches(TokenKind::LeftBracket) {
            // super[Expr].name picks the superclass explicitly; required
            // under multiple inheritance, allowed everywhere.
            self.named_variable("this", false);
            self.expression();
            self.consume(
                TokenKind::RightBracket,
                "Expect ']' after superclass expression.",
            );
            self.consume(TokenKind::Dot, "Expect '.' after superclass selector.");
            self.consume(TokenKind::Identifier, "Expect superclass method name.");
            let name = self.identifier_constant(self.previous.lexeme);
            self.emit_op_byte(OpCode::GetSuper, name);
            return;
        }

        if super_kind == Some(SuperKind::Multiple) {
            self.error("Cannot use 'super.' with multiple superclasses; use 'super[Class]'.");
            return;
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    /// `fun (params) { ... }` in expression position.
    fn lambda(&mut self) {
        self.function(FunctionType::Lambda);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    /// `a[i]` is sugar for `a.get(i)`, `a[i] = v` for `a.set(i, v)`.
    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_invoke("set", 2);
            return;
        }
        if can_assign {
            if let Some(op) = self.match_compound() {
                // Re-use receiver and index: get, apply, set.
                self.emit_op_byte(OpCode::Duplicate, 1);
                self.emit_op_byte(OpCode::Duplicate, 1);
                self.emit_invoke("get", 1);
                self.expression();
                self.emit_op(op);
                self.emit_invoke("set", 2);
                return;
            }
        }
        self.emit_invoke("get", 1);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
            return;
        }
        if can_assign {
            if let Some(op) = self.match_compound() {
                self.emit_op_byte(OpCode::Duplicate, 0);
                self.emit_op_byte(OpCode::GetProperty, name);
                self.expression();
                self.emit_op(op);
                self.emit_op_byte(OpCode::SetProperty, name);
                return;
            }
        }
        if self.matches(TokenKind::LeftParen) {
            // Fused property access + call.
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
            return;
        }
        self.emit_op_byte(OpCode::GetProperty, name);
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            if self.check(TokenKind::LeftParen) {
                // Anonymous function in statement position.
                self.lambda();
                self.infix_loop(Precedence::Assignment, true);
                self.finish_expression_statement();
            } else {
                self.fun_declaration();
            }
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        self.init_compiler(ftype);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let mut function = self.current_function();
                function.arity += 1;
                if function.arity > 255 {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let compiler = self.end_compiler();
        self.finish_function(compiler);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx {
            superclass: SuperKind::None,
        });
        let mut has_super_scope = false;

        if self.matches(TokenKind::Less) {
            if self.matches(TokenKind::LeftBracket) {
                // class C < [A, B]: copy from each, in declaration order,
                // later entries winning colliding names.
                self.array_literal();
                self.begin_scope();
                self.add_local("super");
                self.mark_initialized();
                has_super_scope = true;
                self.named_variable(class_name, false);
                self.emit_op(OpCode::InheritMultiple);
                if let Some(class) = self.classes.last_mut() {
                    class.superclass = SuperKind::Multiple;
                }
            } else {
                self.consume(TokenKind::Identifier, "Expect superclass name.");
                if self.previous.lexeme == class_name {
                    self.error("A class cannot inherit from itself.");
                }
                self.variable(false);
                self.begin_scope();
                self.add_local("super");
                self.mark_initialized();
                has_super_scope = true;
                self.named_variable(class_name, false);
                self.emit_op(OpCode::Inherit);
                if let Some(class) = self.classes.last_mut() {
                    class.superclass = SuperKind::Single;
                }
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Static) {
                self.static_method();
            } else {
                self.method();
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if has_super_scope {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let ftype = if self.previous.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ftype);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn static_method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        if self.previous.lexeme == "init" {
            self.error("Initializer cannot be a static method.");
        }
        let constant = self.identifier_constant(self.previous.lexeme);
        self.function(FunctionType::Static);
        self.emit_op_byte(OpCode::StaticMethod, constant);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn finish_expression_statement(&mut self) {
        // Lambda tail sugar: an expression right before the closing brace is
        // the return value.
        if self.current_ftype() == FunctionType::Lambda && self.check(TokenKind::RightBrace) {
            self.emit_op(OpCode::Return);
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        let ci = self.compilers.len() - 1;
        if self.options.eval_expr
            && self.compilers[ci].ftype == FunctionType::Script
            && self.compilers[ci].scope_depth == 0
        {
            self.emit_op(OpCode::PrintExpr);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.finish_expression_statement();
    }

    fn return_statement(&mut self) {
        if self.current_ftype() == FunctionType::Script {
            self.error("Cannot return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_ftype() == FunctionType::Initializer {
                self.error("Cannot return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after thrown value.");
        self.emit_op(OpCode::Throw);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let ci = self.compilers.len() - 1;
        let depth = self.compilers[ci].scope_depth;
        self.compilers[ci].loops.push(LoopCtx {
            start: loop_start,
            scope_depth: depth,
            breaks: Vec::new(),
            copy: None,
        });

        self.statement();
        self.emit_loop(loop_start);

        let ci = self.compilers.len() - 1;
        let ctx = self.compilers[ci].loops.pop().expect("loop stack underflow");
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        for break_jump in ctx.breaks {
            self.patch_jump(break_jump);
        }
    }

    fn for_statement(&mut self) {
        // The loop variable lives in its own scope.
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        let mut loop_var: Option<(u8, &'src str)> = None;
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
            let ci = self.compilers.len() - 1;
            let slot = self.compilers[ci].locals.len() - 1;
            loop_var = Some((slot as u8, self.compilers[ci].locals[slot].name));
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop initializer.");
            self.emit_op(OpCode::Pop);
        }

        let loop_start = self.current_offset();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        let mut incr_start = loop_start;
        if !self.matches(TokenKind::RightParen) {
            // Emitted order must be init | cond | body | incr | loop, so the
            // increment clause is compiled here and jumped around.
            let body_jump = self.emit_jump(OpCode::Jump);
            incr_start = self.current_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            self.patch_jump(body_jump);
        }

        let ci = self.compilers.len() - 1;
        let depth = self.compilers[ci].scope_depth;
        self.compilers[ci].loops.push(LoopCtx {
            start: incr_start,
            scope_depth: depth,
            breaks: Vec::new(),
            copy: None,
        });

        if let Some((slot, name)) = loop_var {
            // Mirror the loop variable into a fresh body binding so closures
            // created in the body capture this iteration's value; copy it
            // back before the increment clause runs.
            self.begin_scope();
            self.emit_op_byte(OpCode::GetLocal, slot);
            self.add_local(name);
            self.mark_initialized();
            let ci = self.compilers.len() - 1;
            let inner = (self.compilers[ci].locals.len() - 1) as u8;
            if let Some(ctx) = self.compilers[ci].loops.last_mut() {
                ctx.copy = Some((inner, slot));
            }
            self.statement();
            self.emit_op_byte(OpCode::GetLocal, inner);
            self.emit_op_byte(OpCode::SetLocal, slot);
            self.emit_op(OpCode::Pop);
            self.end_scope();
        } else {
            self.statement();
        }
        self.emit_loop(incr_start);

        let ci = self.compilers.len() - 1;
        let ctx = self.compilers[ci].loops.pop().expect("loop stack underflow");
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        for break_jump in ctx.breaks {
            self.patch_jump(break_jump);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
        } else {
            let depth = self.compilers[ci].loops[self.compilers[ci].loops.len() - 1].scope_depth;
            self.discard_locals(depth);
            let jump = self.emit_jump(OpCode::Jump);
            let ci = self.compilers.len() - 1;
            if let Some(ctx) = self.compilers[ci].loops.last_mut() {
                ctx.breaks.push(jump);
            }
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        let ci = self.compilers.len() - 1;
        if self.compilers[ci].loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
        } else {
            let last = self.compilers[ci].loops.len() - 1;
            let start = self.compilers[ci].loops[last].start;
            let depth = self.compilers[ci].loops[last].scope_depth;
            let copy = self.compilers[ci].loops[last].copy;
            if let Some((inner, slot)) = copy {
                self.emit_op_byte(OpCode::GetLocal, inner);
                self.emit_op_byte(OpCode::SetLocal, slot);
                self.emit_op(OpCode::Pop);
            }
            self.discard_locals(depth);
            self.emit_loop(start);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    /// The try body compiles as a zero-arity closure marked `from_try`; the
    /// VM unwinds a throw to the innermost such frame and resumes right
    /// after the `Pop`/`Jump` pair, with the payload on the stack where the
    /// catch binding expects it.
    fn try_statement(&mut self) {
        self.init_compiler(FunctionType::Try);
        self.begin_scope();
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        self.block();
        let compiler = self.end_compiler();
        self.finish_function(compiler);

        self.emit_op(OpCode::TryCall);
        self.emit_op(OpCode::Pop);
        let over_catch = self.emit_jump(OpCode::Jump);

        self.consume(TokenKind::Catch, "Expect 'catch' after try block.");
        self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
        self.consume(TokenKind::Identifier, "Expect catch parameter name.");
        self.begin_scope();
        self.add_local(self.previous.lexeme);
        self.mark_initialized();
        self.consume(TokenKind::RightParen, "Expect ')' after catch parameter.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before catch body.");
        self.block();
        self.end_scope();

        self.patch_jump(over_catch);
    }
}
