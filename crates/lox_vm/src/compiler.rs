//! Single-pass Pratt compiler: reads tokens from the scanner and emits
//! bytecode directly, with no intermediate AST.
//!
//! Grounded on the original implementation's `compiler.c` for the
//! parser/locals/jump machinery (the var/print/if/block subset of that
//! file maps over almost unchanged); functions, closures, and classes
//! are not in that file's surviving snapshot and are built from this
//! crate's own specification of `resolve_upvalue`/`add_upvalue` and the
//! class/function grammar, using a flattened `Vec<FnState>` in place of
//! a linked `enclosing` chain of compiler structs (simpler to express
//! under the borrow checker than a literal recursive struct).

use lox_lexer::{Scanner, Token, TokenKind};

use crate::chunk::Chunk;
use crate::error::CompileError;
use crate::memory::Heap;
use crate::opcode::OpCode;
use crate::value::{ObjFunction, ObjHeader, ObjRef, ObjType, Value};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
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

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` while the initializer is still being compiled (the "can't
    /// read a local in its own initializer" sentinel).
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// Per-function compiler state. One of these exists per nested
/// `fun`/method currently being compiled; `Compiler::fn_stack` holds the
/// whole enclosing chain, innermost last.
///
/// `function` is allocated eagerly (mirroring the original's
/// `current->function = newFunction()`) rather than assembled from loose
/// fields and allocated only once the function body finishes compiling.
/// That means the heap already has a traceable `ObjFunction` for every
/// entry on `fn_stack` at all times, so marking the compiler's root set
/// is just marking `function` for each stack entry — see
/// `Compiler::mark_compiler_roots`.
struct FnState<'src> {
    function_type: FunctionType,
    function: ObjRef,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FnState<'src> {
    fn new(heap: &mut Heap, function_type: FunctionType, name: Option<&'src str>) -> Self {
        // Slot 0 is reserved: `this` for methods/initializers, otherwise
        // an unnamed placeholder the user's code can never reference.
        let slot0_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        let name_ref = name.map(|n| heap.intern(n));
        let function = heap.alloc_function(ObjFunction {
            header: placeholder_header(),
            arity: 0,
            upvalue_count: 0,
            name: name_ref,
            chunk: Chunk::new(),
        });
        FnState {
            function_type,
            function,
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
}

pub struct Compiler<'src, 'heap> {
    parser: Parser<'src>,
    heap: &'heap mut Heap,
    fn_stack: Vec<FnState<'src>>,
    class_stack: Vec<ClassState>,
}

const UNINITIALIZED: i32 = -1;

pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    if heap.should_collect() {
        heap.collect_garbage();
    }
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let had_error = compiler.parser.had_error;
    let errors = std::mem::take(&mut compiler.parser.errors);
    let (function, _upvalues) = compiler.end_function();
    if had_error {
        Err(errors)
    } else {
        Ok(function)
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        let fn_stack = vec![FnState::new(heap, FunctionType::Script, None)];
        Compiler {
            parser: Parser {
                scanner,
                current: first,
                previous: first,
                had_error: false,
                panic_mode: false,
                errors: Vec::new(),
            },
            heap,
            fn_stack,
            class_stack: Vec::new(),
        }
    }

    // ---- token stream plumbing ----

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.parser.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let at = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.parser.errors.push(CompileError { line: token.line, at, message: message.to_string() });
        self.parser.had_error = true;
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- garbage collection ----

    /// Collects if the heap is over threshold (or under `--gc-stress`),
    /// marking the in-progress function chain as roots first. Called
    /// before every allocating operation (interning, pushing a new
    /// `FnState`), never mid-operation, so a fresh allocation is always
    /// either already linked under a marked root or not yet swept
    /// because nothing triggers a second collection before it's linked.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        self.mark_compiler_roots();
        self.heap.collect_garbage();
    }

    fn mark_compiler_roots(&mut self) {
        for state in &self.fn_stack {
            self.heap.mark_object(state.function);
        }
    }

    // ---- emission ----

    fn current_fn(&mut self) -> &mut FnState<'src> {
        self.fn_stack.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &'static mut Chunk {
        let function = self.current_fn().function;
        &mut function.as_function_mut().chunk
    }

    fn emit_word(&mut self, word: u16) {
        let line = self.parser.previous.line as i32;
        self.current_chunk().write(word, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_word(op as u16);
    }

    fn emit_ops(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.emit_word(operand);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let ix = self.current_chunk().add_constant(value);
        if ix > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        ix as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let ix = self.make_constant(value);
        self.emit_ops(OpCode::Constant, ix);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_word(0xffff);
        self.current_chunk().len() - 1
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 1;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.current_chunk().code[offset] = jump as u16;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 1;
        if offset > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.emit_word(offset as u16);
    }

    fn emit_return(&mut self) {
        if self.current_fn().function_type == FunctionType::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Interns `name` as a string constant and returns its constant-pool
    /// index, for `GET/SET/DEFINE_GLOBAL`, `GET/SET_PROPERTY`, `CLASS`,
    /// and `METHOD` operands.
    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.maybe_collect();
        let string = self.heap.intern(name);
        self.make_constant(Value::Obj(string))
    }

    fn identifiers_equal(a: &str, b: &str) -> bool {
        a == b
    }

    // ---- scopes & locals ----

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.current_fn().scope_depth - 1;
        self.current_fn().scope_depth = depth;

        while let Some(local) = self.current_fn().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.current_fn().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn().locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let depth = self.current_fn().scope_depth;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != UNINITIALIZED && local.depth < depth {
                break;
            }
            if Self::identifiers_equal(local.name, name) {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_fn().locals.len() >= u16::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn().locals.push(Local { name, depth: UNINITIALIZED, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        self.current_fn().locals.last_mut().unwrap().depth = depth;
    }

    fn resolve_local_at(&self, level: usize, name: &str) -> Option<u16> {
        let locals = &self.fn_stack[level].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if Self::identifiers_equal(local.name, name) {
                return Some(i as u16);
            }
        }
        None
    }

    fn resolve_local(&mut self, name: &str) -> Option<u16> {
        let level = self.fn_stack.len() - 1;
        match self.resolve_local_at(level, name) {
            Some(i) => {
                if self.fn_stack[level].locals[i as usize].depth == UNINITIALIZED {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(i)
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, level: usize, index: u16, is_local: bool) -> u16 {
        let upvalues = &mut self.fn_stack[level].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u16;
            }
        }
        if upvalues.len() >= u16::MAX as usize {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        (upvalues.len() - 1) as u16
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u16> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;
        if let Some(idx) = self.resolve_local_at(enclosing, name) {
            self.fn_stack[enclosing].locals[idx as usize].is_captured = true;
            return Some(self.add_upvalue(level, idx, true));
        }
        if let Some(idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(level, idx, false));
        }
        None
    }

    fn parse_variable(&mut self, error_message: &str) -> u16 {
        self.consume(TokenKind::Identifier, error_message);
        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u16) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(self.fn_stack.len() - 1, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let ix = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, ix)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_stack.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.parser.previous.lexeme;
            if Self::identifiers_equal(class_name, super_name) {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(super_name, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.class_stack.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class, pushed again above for method binding

        let class = self.class_stack.pop().unwrap();
        if class.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(name);

        let function_type = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(function_type, name);
        self.emit_ops(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.parser.previous.lexeme;
        self.function(FunctionType::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType, name: &'src str) {
        self.maybe_collect();
        self.fn_stack.push(FnState::new(self.heap, function_type, Some(name)));

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = &mut self.current_fn().function.as_function_mut().arity;
                *arity += 1;
                if *arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let ix = self.make_constant(Value::Obj(function));
        self.emit_ops(OpCode::Closure, ix);
        for up in &upvalues {
            self.emit_word(up.is_local as u16);
            self.emit_word(up.index);
        }
    }

    /// Pops the innermost `FnState`, whose `ObjFunction` was already
    /// allocated by `FnState::new`.
    ///
    /// The caller (everywhere except top-level `compile`) still owes the
    /// `CLOSURE` instruction its per-upvalue `(is_local, index)` operand
    /// pairs — those must come *after* the `CLOSURE` opcode and constant
    /// index, which aren't emitted until after this returns, so the
    /// upvalue descriptors are handed back rather than emitted here.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let state = self.fn_stack.pop().unwrap();
        state.function.as_function_mut().upvalue_count = state.upvalues.len() as u16;
        (state.function, state.upvalues)
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
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

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.fn_stack.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
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

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.parser.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.parser.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.parser.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.parser.previous.kind;
        let rule = get_rule(op_kind);
        self.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
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
            _ => unreachable!(),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_ops(OpCode::Call, argc as u16);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc = 0u8;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_ops(OpCode::Invoke, constant);
            self.emit_word(argc as u16);
        } else {
            self.emit_ops(OpCode::GetProperty, constant);
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        self.maybe_collect();
        let lexeme = self.parser.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(contents);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_stack.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_ops(OpCode::SuperInvoke, constant);
            self.emit_word(argc as u16);
        } else {
            self.named_variable("super", false);
            self.emit_ops(OpCode::GetSuper, constant);
        }
    }
}

/// Placeholder header for an `ObjFunction` being assembled before it is
/// linked into the heap's object list by `Heap::alloc_function`.
fn placeholder_header() -> ObjHeader {
    ObjHeader { tag: ObjType::Function, is_marked: false, next: None }
}

fn get_rule<'src, 'heap>(kind: TokenKind) -> ParseRule<'src, 'heap> {
    use Precedence as P;
    use TokenKind as T;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'heap>>,
        Option<ParseFn<'src, 'heap>>,
        Precedence,
    ) = match kind {
        T::LeftParen => (Some(Compiler::grouping), Some(Compiler::call), P::Call),
        T::Dot => (None, Some(Compiler::dot), P::Call),
        T::Minus => (Some(Compiler::unary), Some(Compiler::binary), P::Term),
        T::Plus => (None, Some(Compiler::binary), P::Term),
        T::Slash => (None, Some(Compiler::binary), P::Factor),
        T::Star => (None, Some(Compiler::binary), P::Factor),
        T::Bang => (Some(Compiler::unary), None, P::None),
        T::BangEqual => (None, Some(Compiler::binary), P::Equality),
        T::EqualEqual => (None, Some(Compiler::binary), P::Equality),
        T::Greater => (None, Some(Compiler::binary), P::Comparison),
        T::GreaterEqual => (None, Some(Compiler::binary), P::Comparison),
        T::Less => (None, Some(Compiler::binary), P::Comparison),
        T::LessEqual => (None, Some(Compiler::binary), P::Comparison),
        T::Identifier => (Some(Compiler::variable), None, P::None),
        T::String => (Some(Compiler::string), None, P::None),
        T::Number => (Some(Compiler::number), None, P::None),
        T::And => (None, Some(Compiler::and_), P::And),
        T::Or => (None, Some(Compiler::or_), P::Or),
        T::False => (Some(Compiler::literal), None, P::None),
        T::Nil => (Some(Compiler::literal), None, P::None),
        T::True => (Some(Compiler::literal), None, P::None),
        T::This => (Some(Compiler::this), None, P::None),
        T::Super => (Some(Compiler::super_), None, P::None),
        _ => (None, None, P::None),
    };
    ParseRule { prefix, infix, precedence }
}
