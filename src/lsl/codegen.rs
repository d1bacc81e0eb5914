use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::debug;

use super::api::{lookup_api, lookup_constant, ConstValue};
use super::ast::*;
use super::error::CompileError;
use super::events::{EventKind, EVENT_TABLE_WIDTH};
use super::module::{
    fingerprint, CompiledModule, Component, Constant, Function, FunctionKind, GlobalSlot, Op,
    VarRef, MODULE_VERSION,
};
use super::operators::{self, BinEval};
use super::types::{can_cast, Type, CALL_FRAME_MEMUSE};

/// Generate a module from a parsed script. Every error is reported; no module
/// is produced if there were any.
pub fn generate(script: &Script, source: &str, name: &str) -> Result<CompiledModule, Vec<CompileError>> {
    let mut gen = Codegen::new(script, source);
    gen.register(script);

    let mut functions = Vec::new();
    for decl in &script.functions {
        let func = gen.gen_function(decl, FunctionKind::Script, decl.name.clone(), decl.ret);
        functions.push(func);
    }

    let mut dispatch = vec![vec![None; EVENT_TABLE_WIDTH]; script.states.len()];
    for (state_idx, state) in script.states.iter().enumerate() {
        let mut seen = HashSet::new();
        for handler in &state.handlers {
            let Some(event) = EventKind::from_name(&handler.name) else {
                gen.error(format!("unknown event handler {}", handler.name), handler.span);
                continue;
            };
            if !seen.insert(event) {
                gen.error(
                    format!("duplicate {} handler in state {}", handler.name, state.name),
                    handler.span,
                );
                continue;
            }
            let declared: Vec<Type> = handler.params.iter().map(|p| p.ty).collect();
            if declared != event.signature() {
                let expected: Vec<&str> = event.signature().iter().map(|t| t.name()).collect();
                gen.error(
                    format!("{} handler parameters must be ({})", event, expected.join(", ")),
                    handler.span,
                );
                continue;
            }
            let Ok(index) = u16::try_from(functions.len()) else {
                gen.error("too many functions", handler.span);
                continue;
            };
            let kind = FunctionKind::Handler {
                state: u16::try_from(state_idx).unwrap_or(u16::MAX),
                event,
            };
            let func = gen.gen_function(handler, kind, format!("{} {}", state.name, event), Type::Void);
            functions.push(func);
            if let (Some(row), Some(column)) = (dispatch.get_mut(state_idx), event.column()) {
                if let Some(cell) = row.get_mut(column) {
                    *cell = Some(index);
                }
            }
        }
    }

    let init = match u16::try_from(functions.len()) {
        Ok(index) => index,
        Err(_) => {
            gen.error("too many functions", Span::default());
            0
        }
    };
    functions.push(gen.gen_init(script));

    if !gen.errors.is_empty() {
        debug!(errors = gen.errors.len(), "code generation failed");
        return Err(gen.errors.into_iter().map(|e| e.locate(source)).collect());
    }

    debug!(
        functions = functions.len(),
        constants = gen.constants.len(),
        globals = gen.globals.len(),
        "generated module {name}"
    );
    Ok(CompiledModule {
        version: MODULE_VERSION,
        name: name.to_string(),
        fingerprint: fingerprint(source),
        arrays_enabled: script.arrays_enabled,
        constants: gen.constants,
        globals: gen
            .globals
            .into_iter()
            .map(|(name, g)| GlobalSlot { name, ty: g.ty })
            .collect(),
        init,
        functions,
        states: gen.states.into_keys().collect(),
        dispatch,
    })
}

// ── Symbol tables ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FuncSig {
    index: u16,
    params: Vec<Type>,
    ret: Type,
}

#[derive(Debug, Clone, Copy)]
struct GlobalVar {
    index: u16,
    ty: Type,
}

#[derive(Debug, Clone, Copy)]
struct LocalVar {
    slot: u16,
    ty: Type,
}

/// Variables owned by one block (or by the parameter list).
struct Scope {
    block: Option<usize>,
    visible: HashMap<String, LocalVar>,
    /// Declared in the block but not reached yet.
    pending: HashMap<String, LocalVar>,
    owned: Vec<LocalVar>,
    static_size: i32,
}

impl Scope {
    fn new(block: Option<usize>) -> Self {
        Self {
            block,
            visible: HashMap::new(),
            pending: HashMap::new(),
            owned: Vec::new(),
            static_size: 0,
        }
    }
}

struct LabelInfo {
    /// Innermost block containing the label.
    block: usize,
    pc: Option<usize>,
    /// A later jump targets this label, so it heads a loop.
    checkpoint: bool,
}

enum Resolved {
    Var(VarRef, Type),
    Const(ConstValue),
}

/// Per-function emission state.
struct FnState {
    ops: Vec<Op>,
    lines: Vec<(u32, u32)>,
    scopes: Vec<Scope>,
    local_count: u16,
    ret: Type,
    frame_static: i32,
    labels: HashMap<String, LabelInfo>,
    fixups: Vec<(usize, String)>,
    /// Globals visible while generating the initializer.
    init_limit: Option<usize>,
}

impl FnState {
    fn new(ret: Type) -> Self {
        Self {
            ops: Vec::new(),
            lines: Vec::new(),
            scopes: Vec::new(),
            local_count: 0,
            ret,
            frame_static: 0,
            labels: HashMap::new(),
            fixups: Vec::new(),
            init_limit: None,
        }
    }
}

struct Codegen {
    line_starts: Vec<usize>,
    constants: Vec<Constant>,
    globals: IndexMap<String, GlobalVar>,
    states: IndexMap<String, u16>,
    sigs: HashMap<String, FuncSig>,
    errors: Vec<CompileError>,
    func: FnState,
    pos: (u32, u32),
}

impl Codegen {
    fn new(script: &Script, source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        let mut states = IndexMap::new();
        for (i, state) in script.states.iter().enumerate() {
            states.insert(state.name.clone(), u16::try_from(i).unwrap_or(u16::MAX));
        }
        Self {
            line_starts,
            constants: Vec::new(),
            globals: IndexMap::new(),
            states,
            sigs: HashMap::new(),
            errors: Vec::new(),
            func: FnState::new(Type::Void),
            pos: (1, 1),
        }
    }

    /// Functions and globals are registered before any body is generated so
    /// forward references resolve.
    fn register(&mut self, script: &Script) {
        for (i, decl) in script.functions.iter().enumerate() {
            let Ok(index) = u16::try_from(i) else {
                self.error("too many functions", decl.span);
                break;
            };
            self.sigs.insert(
                decl.name.clone(),
                FuncSig {
                    index,
                    params: decl.params.iter().map(|p| p.ty).collect(),
                    ret: decl.ret,
                },
            );
        }
        for var in &script.globals {
            if self.globals.contains_key(&var.name) {
                self.error(format!("global {} already defined", var.name), var.span);
                continue;
            }
            let Ok(index) = u16::try_from(self.globals.len()) else {
                self.error("too many globals", var.span);
                break;
            };
            self.globals.insert(var.name.clone(), GlobalVar { index, ty: var.ty });
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors.push(CompileError::semantic(message, span));
    }

    fn set_pos(&mut self, span: Span) {
        let line = self.line_starts.partition_point(|&s| s <= span.start);
        let col = span.start - self.line_starts.get(line.saturating_sub(1)).copied().unwrap_or(0) + 1;
        self.pos = (
            u32::try_from(line).unwrap_or(u32::MAX),
            u32::try_from(col).unwrap_or(u32::MAX),
        );
    }

    fn emit(&mut self, op: Op) -> usize {
        self.func.ops.push(op);
        self.func.lines.push(self.pos);
        self.func.ops.len() - 1
    }

    fn here(&self) -> usize {
        self.func.ops.len()
    }

    fn add_constant(&mut self, value: Constant, span: Span) -> Result<u16, CompileError> {
        if let Some(i) = self.constants.iter().position(|c| same_constant(c, &value)) {
            return u16::try_from(i).map_err(|_| CompileError::semantic("too many constants", span));
        }
        let idx = u16::try_from(self.constants.len())
            .map_err(|_| CompileError::semantic("too many constants (max 65535)", span))?;
        self.constants.push(value);
        Ok(idx)
    }

    fn emit_const(&mut self, value: Constant, span: Span) -> Result<(), CompileError> {
        let idx = self.add_constant(value, span)?;
        self.emit(Op::PushConst(idx));
        Ok(())
    }

    fn patch(&mut self, idx: usize, target: usize) -> Result<(), CompileError> {
        let target = u32::try_from(target)
            .map_err(|_| CompileError::semantic("function too large", Span::default()))?;
        if let Some(
            Op::Jump(dest) | Op::JumpIfFalse(dest) | Op::JumpIfTrue(dest) | Op::JumpIfNoStateChange(dest),
        ) = self.func.ops.get_mut(idx)
        {
            *dest = target;
        }
        Ok(())
    }

    fn alloc_local(&mut self, span: Span) -> Result<u16, CompileError> {
        let slot = self.func.local_count;
        self.func.local_count = slot
            .checked_add(1)
            .ok_or_else(|| CompileError::semantic("too many local variables (max 65535)", span))?;
        Ok(slot)
    }

    /// Convert the value on top of the stack from `from` to `to`.
    fn coerce(&mut self, from: Type, to: Type, explicit: bool, span: Span) -> Result<(), CompileError> {
        if from == to {
            return Ok(());
        }
        if from == Type::Void {
            return Err(CompileError::semantic("expression has no value", span));
        }
        if !can_cast(from, to, explicit) {
            let verb = if explicit { "cast" } else { "convert" };
            return Err(CompileError::semantic(format!("cannot {verb} {from} to {to}"), span));
        }
        self.emit(Op::Cast(to));
        Ok(())
    }

    fn load(&mut self, var: VarRef) {
        match var {
            VarRef::Local(slot) => self.emit(Op::LoadLocal(slot)),
            VarRef::Global(idx) => self.emit(Op::LoadGlobal(idx)),
        };
    }

    /// Pop into `var`, keeping the memory count in step with its dynamic size.
    fn store(&mut self, var: VarRef, ty: Type) {
        if ty.has_dynamic_size() {
            self.emit(Op::MemDecr(var));
        }
        match var {
            VarRef::Local(slot) => self.emit(Op::StoreLocal(slot)),
            VarRef::Global(idx) => self.emit(Op::StoreGlobal(idx)),
        };
        if ty.has_dynamic_size() {
            self.emit(Op::MemIncr(var));
        }
    }

    fn resolve(&self, name: &str) -> Option<Resolved> {
        for scope in self.func.scopes.iter().rev() {
            if let Some(v) = scope.visible.get(name) {
                return Some(Resolved::Var(VarRef::Local(v.slot), v.ty));
            }
        }
        if let Some(g) = self.globals.get(name) {
            let limit = self.func.init_limit.unwrap_or(usize::MAX);
            if usize::from(g.index) < limit {
                return Some(Resolved::Var(VarRef::Global(g.index), g.ty));
            }
        }
        lookup_constant(name).map(Resolved::Const)
    }

    fn resolve_var(&self, name: &str, span: Span) -> Result<(VarRef, Type), CompileError> {
        match self.resolve(name) {
            Some(Resolved::Var(var, ty)) => Ok((var, ty)),
            Some(Resolved::Const(_)) => Err(CompileError::semantic(
                format!("cannot assign to constant {name}"),
                span,
            )),
            None => Err(CompileError::semantic(format!("undefined variable {name}"), span)),
        }
    }

    // ── Scopes and accounting ─────────────────────────────────────

    /// Allocate slots for every variable declared directly in `block`.
    fn declare_block(&mut self, block: &Block) -> Scope {
        let mut scope = Scope::new(Some(block.id));
        for stmt in &block.stmts {
            let Stmt::Decl(decl) = stmt else { continue };
            if scope.pending.contains_key(&decl.name) {
                self.error(format!("variable {} already defined", decl.name), decl.span);
                continue;
            }
            match self.alloc_local(decl.span) {
                Ok(slot) => {
                    let var = LocalVar { slot, ty: decl.ty };
                    scope.pending.insert(decl.name.clone(), var);
                    scope.owned.push(var);
                    scope.static_size += decl.ty.static_size();
                }
                Err(e) => self.errors.push(e),
            }
        }
        scope
    }

    fn default_init(&mut self, owned: &[LocalVar]) {
        for var in owned {
            self.emit(Op::PushDefault(var.ty));
            self.emit(Op::StoreLocal(var.slot));
        }
    }

    /// Accounting epilogue for an inner block scope.
    fn emit_scope_exit(&mut self, idx: usize) {
        let Some(scope) = self.func.scopes.get(idx) else { return };
        let dynamic: Vec<u16> = scope
            .owned
            .iter()
            .filter(|v| v.ty.has_dynamic_size())
            .map(|v| v.slot)
            .collect();
        let static_size = scope.static_size;
        for slot in dynamic {
            self.emit(Op::MemDecr(VarRef::Local(slot)));
        }
        if static_size != 0 {
            self.emit(Op::MemStatic(-static_size));
        }
    }

    /// Release every scope of the function, innermost first, and the frame itself.
    fn emit_frame_exit(&mut self) {
        for idx in (2..self.func.scopes.len()).rev() {
            self.emit_scope_exit(idx);
        }
        let dynamic: Vec<u16> = self
            .func
            .scopes
            .iter()
            .take(2)
            .rev()
            .flat_map(|s| s.owned.iter())
            .filter(|v| v.ty.has_dynamic_size())
            .map(|v| v.slot)
            .collect();
        for slot in dynamic {
            self.emit(Op::MemDecr(VarRef::Local(slot)));
        }
        self.emit(Op::MemStatic(-self.func.frame_static));
    }

    /// Return the function's default value through the full epilogue.
    fn emit_default_return(&mut self) {
        if self.func.ret != Type::Void {
            self.emit(Op::PushDefault(self.func.ret));
        }
        self.emit_frame_exit();
        self.emit(Op::Return);
    }

    // ── Functions ─────────────────────────────────────────────────

    fn gen_function(&mut self, decl: &DeclFunc, kind: FunctionKind, name: String, ret: Type) -> Function {
        self.func = FnState::new(ret);
        self.set_pos(decl.span);
        self.collect_labels(&decl.body);

        let mut params = Scope::new(None);
        for p in &decl.params {
            if params.visible.contains_key(&p.name) {
                self.error(format!("variable {} already defined", p.name), p.span);
                continue;
            }
            match self.alloc_local(p.span) {
                Ok(slot) => {
                    let var = LocalVar { slot, ty: p.ty };
                    params.visible.insert(p.name.clone(), var);
                    params.owned.push(var);
                    params.static_size += p.ty.static_size();
                }
                Err(e) => self.errors.push(e),
            }
        }
        let body = self.declare_block(&decl.body);
        self.func.frame_static = CALL_FRAME_MEMUSE + params.static_size + body.static_size;

        let dyn_params: Vec<u16> = params
            .owned
            .iter()
            .filter(|v| v.ty.has_dynamic_size())
            .map(|v| v.slot)
            .collect();
        let body_vars = body.owned.clone();
        self.func.scopes.push(params);
        self.func.scopes.push(body);

        self.emit(Op::MemStatic(self.func.frame_static));
        for slot in dyn_params {
            self.emit(Op::MemIncr(VarRef::Local(slot)));
        }
        self.default_init(&body_vars);
        self.emit(Op::CheckRun);

        for stmt in &decl.body.stmts {
            self.gen_stmt_reporting(stmt);
        }
        self.set_pos(Span::new(decl.body.span.end.saturating_sub(1), decl.body.span.end));
        self.emit_default_return();
        self.patch_labels();

        Function {
            name,
            kind,
            params: decl.params.iter().map(|p| p.ty).collect(),
            ret,
            local_count: self.func.local_count,
            ops: std::mem::take(&mut self.func.ops),
            lines: std::mem::take(&mut self.func.lines),
        }
    }

    fn gen_init(&mut self, script: &Script) -> Function {
        self.func = FnState::new(Type::Void);
        for (i, var) in script.globals.iter().enumerate() {
            let Some(global) = self.globals.get(&var.name).copied() else { continue };
            if usize::from(global.index) != i {
                continue;
            }
            self.func.init_limit = Some(i);
            self.set_pos(var.span);
            self.emit(Op::MemStatic(var.ty.static_size()));
            let value = match &var.init {
                Some(init) => self
                    .gen_expr(init)
                    .and_then(|t| self.coerce(t, var.ty, false, init.span)),
                None => {
                    self.emit(Op::PushDefault(var.ty));
                    Ok(())
                }
            };
            if let Err(e) = value {
                self.errors.push(e);
            }
            let slot = VarRef::Global(global.index);
            self.emit(Op::StoreGlobal(global.index));
            if var.ty.has_dynamic_size() {
                self.emit(Op::MemIncr(slot));
            }
        }
        self.emit(Op::Return);
        Function {
            name: "$globals".into(),
            kind: FunctionKind::Init,
            params: Vec::new(),
            ret: Type::Void,
            local_count: 0,
            ops: std::mem::take(&mut self.func.ops),
            lines: std::mem::take(&mut self.func.lines),
        }
    }

    /// Record every label of the function and whether a later jump targets it.
    fn collect_labels(&mut self, body: &Block) {
        let mut seq = 0usize;
        let mut labels: HashMap<String, usize> = HashMap::new();
        let mut jumps: Vec<(String, usize)> = Vec::new();
        let mut duplicates = Vec::new();
        walk_block(body, &mut seq, &mut labels, &mut jumps, &mut duplicates);
        for (name, span) in duplicates {
            self.error(format!("duplicate label {name}"), span);
        }
        let mut blocks = HashMap::new();
        label_blocks(body, &mut blocks);
        for (name, at) in labels {
            let checkpoint = jumps.iter().any(|(j, jseq)| *j == name && *jseq > at);
            let block = blocks.get(&name).copied().unwrap_or(body.id);
            self.func.labels.insert(name, LabelInfo { block, pc: None, checkpoint });
        }
    }

    fn patch_labels(&mut self) {
        let fixups = std::mem::take(&mut self.func.fixups);
        for (idx, label) in fixups {
            let target = self.func.labels.get(&label).and_then(|l| l.pc);
            if let Some(pc) = target {
                if let Err(e) = self.patch(idx, pc) {
                    self.errors.push(e);
                }
            }
        }
    }

    // ── Statements ────────────────────────────────────────────────

    /// Generate a statement; an error abandons only that statement.
    fn gen_stmt_reporting(&mut self, stmt: &Stmt) {
        if let Err(e) = self.gen_stmt(stmt) {
            self.errors.push(e);
        }
    }

    fn gen_block(&mut self, block: &Block) {
        let scope = self.declare_block(block);
        let static_size = scope.static_size;
        let owned = scope.owned.clone();
        self.set_pos(block.span);
        if static_size != 0 {
            self.emit(Op::MemStatic(static_size));
        }
        self.default_init(&owned);
        self.func.scopes.push(scope);
        for stmt in &block.stmts {
            self.gen_stmt_reporting(stmt);
        }
        self.set_pos(Span::new(block.span.end.saturating_sub(1), block.span.end));
        let idx = self.func.scopes.len() - 1;
        self.emit_scope_exit(idx);
        self.func.scopes.pop();
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.set_pos(stmt.span());
        match stmt {
            Stmt::Null(_) => Ok(()),
            Stmt::Decl(decl) => self.gen_decl(decl),
            Stmt::Expr(expr) => {
                let ty = self.gen_expr(expr)?;
                if ty != Type::Void {
                    self.emit(Op::Pop);
                }
                Ok(())
            }
            Stmt::Block(block) => {
                self.gen_block(block);
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                self.gen_cond(cond)?;
                let skip_then = self.emit(Op::JumpIfFalse(0));
                self.gen_stmt_reporting(then_branch);
                if let Some(else_branch) = else_branch {
                    let skip_else = self.emit(Op::Jump(0));
                    let here = self.here();
                    self.patch(skip_then, here)?;
                    self.gen_stmt_reporting(else_branch);
                    let here = self.here();
                    self.patch(skip_else, here)
                } else {
                    let here = self.here();
                    self.patch(skip_then, here)
                }
            }
            Stmt::While { cond, body, .. } => {
                let top = self.here();
                self.emit(Op::CheckRun);
                self.gen_cond(cond)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.gen_stmt_reporting(body);
                let back = self.emit(Op::Jump(0));
                self.patch(back, top)?;
                let here = self.here();
                self.patch(exit, here)
            }
            Stmt::DoWhile { body, cond, .. } => {
                let top = self.here();
                self.emit(Op::CheckRun);
                self.gen_stmt_reporting(body);
                self.set_pos(cond.span);
                self.gen_cond(cond)?;
                let back = self.emit(Op::JumpIfTrue(0));
                self.patch(back, top)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                for e in init {
                    self.gen_discard(e)?;
                }
                let top = self.here();
                self.emit(Op::CheckRun);
                let exit = match cond {
                    Some(c) => {
                        self.gen_cond(c)?;
                        Some(self.emit(Op::JumpIfFalse(0)))
                    }
                    None => None,
                };
                self.gen_stmt_reporting(body);
                for e in step {
                    self.set_pos(e.span);
                    self.gen_discard(e)?;
                }
                let back = self.emit(Op::Jump(0));
                self.patch(back, top)?;
                if let Some(exit) = exit {
                    let here = self.here();
                    self.patch(exit, here)?;
                }
                Ok(())
            }
            Stmt::ForEach {
                key,
                value,
                array,
                body,
                span,
            } => self.gen_foreach(key.as_ref(), value.as_ref(), array, body, *span),
            Stmt::Label { name, .. } => {
                let pc = self.here();
                let checkpoint = match self.func.labels.get_mut(name) {
                    Some(info) if info.pc.is_none() => {
                        info.pc = Some(pc);
                        info.checkpoint
                    }
                    _ => false,
                };
                if checkpoint {
                    self.emit(Op::CheckRun);
                }
                Ok(())
            }
            Stmt::Jump { label, span } => self.gen_jump(label, *span),
            Stmt::Return { value, span } => {
                let ret = self.func.ret;
                match (value, ret) {
                    (None, Type::Void) => {}
                    (Some(_), Type::Void) => {
                        return Err(CompileError::semantic("return value not allowed here", *span));
                    }
                    (None, _) => {
                        return Err(CompileError::semantic(
                            format!("return value of type {ret} expected"),
                            *span,
                        ));
                    }
                    (Some(v), _) => {
                        let ty = self.gen_expr(v)?;
                        self.coerce(ty, ret, false, v.span)?;
                    }
                }
                self.emit_frame_exit();
                self.emit(Op::Return);
                Ok(())
            }
            Stmt::State { name, span } => {
                let Some(&idx) = self.states.get(name) else {
                    return Err(CompileError::semantic(format!("undefined state {name}"), *span));
                };
                self.emit(Op::SetState(idx));
                self.emit_default_return();
                Ok(())
            }
        }
    }

    fn gen_decl(&mut self, decl: &DeclVar) -> Result<(), CompileError> {
        let var = self
            .func
            .scopes
            .last_mut()
            .and_then(|s| s.pending.remove(&decl.name));
        let Some(var) = var else {
            // Duplicate declaration, already reported.
            return Ok(());
        };
        let slot = VarRef::Local(var.slot);
        let result = if decl.hoisted {
            match &decl.init {
                Some(init) => self
                    .gen_expr(init)
                    .and_then(|t| self.coerce(t, var.ty, false, init.span)),
                None => {
                    self.emit(Op::PushDefault(var.ty));
                    Ok(())
                }
            }
            .map(|()| self.store(slot, var.ty))
        } else if let Some(init) = &decl.init {
            self.gen_expr(init)
                .and_then(|t| self.coerce(t, var.ty, false, init.span))
                .map(|()| {
                    self.emit(Op::StoreLocal(var.slot));
                    if var.ty.has_dynamic_size() {
                        self.emit(Op::MemIncr(slot));
                    }
                })
        } else {
            Ok(())
        };
        if let Some(scope) = self.func.scopes.last_mut() {
            scope.visible.insert(decl.name.clone(), var);
        }
        result
    }

    fn gen_cond(&mut self, cond: &Expr) -> Result<(), CompileError> {
        let ty = self.gen_expr(cond)?;
        if ty.is_truth_convertible() {
            Ok(())
        } else {
            Err(CompileError::semantic(
                format!("{ty} cannot be used as a condition"),
                cond.span,
            ))
        }
    }

    fn gen_discard(&mut self, expr: &Expr) -> Result<(), CompileError> {
        if self.gen_expr(expr)? != Type::Void {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn gen_jump(&mut self, label: &str, span: Span) -> Result<(), CompileError> {
        let Some(target_block) = self.func.labels.get(label).map(|l| l.block) else {
            return Err(CompileError::semantic(format!("undefined label {label}"), span));
        };
        let Some(target_scope) = self
            .func
            .scopes
            .iter()
            .rposition(|s| s.block == Some(target_block))
        else {
            return Err(CompileError::semantic("no lateral jumps allowed", span));
        };
        for idx in (target_scope + 1..self.func.scopes.len()).rev() {
            self.emit_scope_exit(idx);
        }
        let at = self.emit(Op::Jump(0));
        self.func.fixups.push((at, label.to_string()));
        Ok(())
    }

    fn gen_foreach(
        &mut self,
        key: Option<&(String, Span)>,
        value: Option<&(String, Span)>,
        array: &Expr,
        body: &Stmt,
        span: Span,
    ) -> Result<(), CompileError> {
        let aty = self.gen_expr(array)?;
        if aty != Type::Array {
            return Err(CompileError::semantic(format!("foreach needs an array, got {aty}"), array.span));
        }
        let key_var = key.map(|(n, s)| self.resolve_var(n, *s)).transpose()?;
        let value_var = value.map(|(n, s)| self.resolve_var(n, *s)).transpose()?;
        for (var, (_, s)) in key_var.iter().zip(key).chain(value_var.iter().zip(value)) {
            if !can_cast(Type::Object, var.1, false) {
                return Err(CompileError::semantic(
                    format!("cannot convert object to {}", var.1),
                    *s,
                ));
            }
        }

        let arr = self.alloc_local(span)?;
        let idx = self.alloc_local(span)?;
        self.emit(Op::StoreLocal(arr));
        self.emit_const(Constant::Integer(0), span)?;
        self.emit(Op::StoreLocal(idx));

        let top = self.here();
        self.emit(Op::CheckRun);
        self.emit(Op::LoadLocal(arr));
        self.emit(Op::ArrayCount);
        self.emit(Op::LoadLocal(idx));
        self.emit(Op::Binary(BinEval::IntLt));
        let exit = self.emit(Op::JumpIfFalse(0));

        for (var, fetch) in [(key_var, Op::ArrayKey), (value_var, Op::ArrayValue)] {
            if let Some((var, ty)) = var {
                self.emit(Op::LoadLocal(arr));
                self.emit(Op::LoadLocal(idx));
                self.emit(fetch);
                if ty != Type::Object {
                    self.emit(Op::Cast(ty));
                }
                self.store(var, ty);
            }
        }

        self.gen_stmt_reporting(body);
        self.emit_const(Constant::Integer(1), span)?;
        self.emit(Op::LoadLocal(idx));
        self.emit(Op::Binary(BinEval::IntAdd));
        self.emit(Op::StoreLocal(idx));
        let back = self.emit(Op::Jump(0));
        self.patch(back, top)?;
        let here = self.here();
        self.patch(exit, here)
    }

    // ── Expressions ───────────────────────────────────────────────

    fn gen_expr(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::IntLit(v) => {
                self.emit_const(Constant::Integer(*v), span)?;
                Ok(Type::Integer)
            }
            ExprKind::FloatLit(v) => {
                self.emit_const(Constant::Float(*v), span)?;
                Ok(Type::Float)
            }
            ExprKind::StringLit(s) => {
                self.emit_const(Constant::String(s.clone()), span)?;
                Ok(Type::String)
            }
            ExprKind::Undef => {
                self.emit(Op::PushUndef);
                Ok(Type::Object)
            }
            ExprKind::Ident(name) => match self.resolve(name) {
                Some(Resolved::Var(var, ty)) => {
                    self.load(var);
                    Ok(ty)
                }
                Some(Resolved::Const(c)) => {
                    self.emit_const(constant_from(c), span)?;
                    Ok(c.ty())
                }
                None => Err(CompileError::semantic(format!("undefined variable {name}"), span)),
            },
            ExprKind::ListLit(items) => {
                for item in items {
                    let ty = self.gen_expr(item)?;
                    match ty {
                        Type::List => {
                            return Err(CompileError::semantic("lists cannot contain lists", item.span));
                        }
                        Type::Void | Type::Array => {
                            return Err(CompileError::semantic(
                                format!("{ty} cannot be a list element"),
                                item.span,
                            ));
                        }
                        Type::Bool => {
                            self.emit(Op::Cast(Type::Integer));
                        }
                        _ => {}
                    }
                }
                let n = u16::try_from(items.len())
                    .map_err(|_| CompileError::semantic("list literal too long", span))?;
                self.emit(Op::MakeList(n));
                Ok(Type::List)
            }
            ExprKind::VectorLit(parts) | ExprKind::RotationLit(parts) => {
                for part in parts {
                    let ty = self.gen_expr(part)?;
                    self.coerce(ty, Type::Float, false, part.span)?;
                }
                if parts.len() == 3 {
                    self.emit(Op::MakeVector);
                    Ok(Type::Vector)
                } else {
                    self.emit(Op::MakeRotation);
                    Ok(Type::Rotation)
                }
            }
            ExprKind::Cast { ty, operand } => {
                let from = self.gen_expr(operand)?;
                self.coerce(from, *ty, true, span)?;
                Ok(*ty)
            }
            ExprKind::Call { name, args } => self.gen_call(name, args, span),
            ExprKind::BinOp { op, left, right } => {
                let rt = self.gen_expr(right)?;
                let lt = self.gen_expr(left)?;
                self.set_pos(span);
                self.emit_binary(lt, *op, rt, false, span)
            }
            ExprKind::UnaryOp { op, operand } => {
                let ty = self.gen_expr(operand)?;
                match (op, ty) {
                    (UnaryOp::Neg, Type::Integer | Type::Float | Type::Vector | Type::Rotation) => {
                        self.emit(Op::Neg);
                        Ok(ty)
                    }
                    (UnaryOp::BitNot, Type::Integer | Type::Bool) => {
                        self.coerce(ty, Type::Integer, false, span)?;
                        self.emit(Op::BitNot);
                        Ok(Type::Integer)
                    }
                    (UnaryOp::Not, t) if t.is_truth_convertible() => {
                        self.emit(Op::Not);
                        Ok(Type::Bool)
                    }
                    _ => Err(CompileError::semantic(
                        format!("operator {} not defined for {ty}", unary_symbol(*op)),
                        span,
                    )),
                }
            }
            ExprKind::Assign { op, target, value } => self.gen_assign(*op, target, value, span),
            ExprKind::IncDec {
                target,
                increment,
                prefix,
            } => self.gen_incdec(target, *increment, *prefix, span),
            ExprKind::Field { object, field } => {
                let ty = self.gen_expr(object)?;
                if ty == Type::Array && field == "count" {
                    self.emit(Op::ArrayCount);
                    return Ok(Type::Integer);
                }
                let comp = component(ty, field, span)?;
                self.emit(Op::GetField(comp));
                Ok(Type::Float)
            }
            ExprKind::Index { array, key } => {
                let aty = self.gen_expr(array)?;
                if aty != Type::Array {
                    return Err(CompileError::semantic(format!("cannot index {aty}"), array.span));
                }
                self.gen_array_key(key)?;
                self.emit(Op::ArrayGet);
                Ok(Type::Object)
            }
            ExprKind::MethodCall { object, method, args } => {
                let ty = self.gen_expr(object)?;
                let fetch = match (ty, method.as_str()) {
                    (Type::Array, "index") => Op::ArrayKey,
                    (Type::Array, "value") => Op::ArrayValue,
                    _ => {
                        return Err(CompileError::semantic(
                            format!("type {ty} has no method {method}"),
                            span,
                        ));
                    }
                };
                let [arg] = args.as_slice() else {
                    return Err(CompileError::semantic(
                        format!("{method} has 1 param(s), but call has {}", args.len()),
                        span,
                    ));
                };
                let at = self.gen_expr(arg)?;
                self.coerce(at, Type::Integer, false, arg.span)?;
                self.emit(fetch);
                Ok(Type::Object)
            }
            ExprKind::IsType { operand, ty } => {
                self.gen_expr(operand)?;
                self.emit(Op::IsType(*ty));
                Ok(Type::Bool)
            }
        }
    }

    /// Both operands are on the stack, left on top.
    fn emit_binary(&mut self, lt: Type, op: BinOp, rt: Type, compound: bool, span: Span) -> Result<Type, CompileError> {
        let entry = operators::lookup(lt, op, rt).filter(|e| !compound || (e.assignable && e.result == lt));
        let Some(entry) = entry else {
            let symbol = if compound {
                format!("{}=", op.symbol())
            } else {
                op.symbol().to_string()
            };
            return Err(CompileError::semantic(
                format!("operator not defined for these types: {lt} {symbol} {rt}"),
                span,
            ));
        };
        if rt != entry.right {
            self.emit(Op::CastSecond(entry.right));
        }
        if lt != entry.left {
            self.emit(Op::Cast(entry.left));
        }
        self.emit(Op::Binary(entry.eval));
        Ok(entry.result)
    }

    fn gen_array_key(&mut self, key: &Expr) -> Result<(), CompileError> {
        let kt = self.gen_expr(key)?;
        match kt {
            Type::Integer
            | Type::Float
            | Type::String
            | Type::Key
            | Type::Vector
            | Type::Rotation
            | Type::Object => Ok(()),
            Type::Bool => {
                self.emit(Op::Cast(Type::Integer));
                Ok(())
            }
            _ => Err(CompileError::semantic(format!("{kt} cannot be an array key"), key.span)),
        }
    }

    fn gen_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<Type, CompileError> {
        if self.func.init_limit.is_some() {
            return Err(CompileError::semantic("global initializer must be constant", span));
        }
        if let Some(sig) = self.sigs.get(name).cloned() {
            self.gen_args(name, &sig.params, args, span)?;
            self.set_pos(span);
            self.emit(Op::Call(sig.index));
            // The callee may have requested a state change: unwind this frame too.
            let skip = self.emit(Op::JumpIfNoStateChange(0));
            self.emit_default_return();
            let here = self.here();
            self.patch(skip, here)?;
            return Ok(sig.ret);
        }
        if let Some((index, api)) = lookup_api(name) {
            let params: Vec<Type> = api.params.iter().map(|&(_, t)| t).collect();
            self.gen_args(name, &params, args, span)?;
            let index = u16::try_from(index)
                .map_err(|_| CompileError::semantic("API table too large", span))?;
            self.set_pos(span);
            self.emit(Op::CallApi(index));
            self.emit(Op::CheckRun);
            return Ok(api.ret);
        }
        Err(CompileError::semantic(format!("undefined function {name}"), span))
    }

    fn gen_args(&mut self, name: &str, params: &[Type], args: &[Expr], span: Span) -> Result<(), CompileError> {
        if params.len() != args.len() {
            return Err(CompileError::semantic(
                format!("{name} has {} param(s), but call has {}", params.len(), args.len()),
                span,
            ));
        }
        for (i, (arg, &param)) in args.iter().zip(params).enumerate() {
            let ty = self.gen_expr(arg)?;
            if ty != param && !can_cast(ty, param, false) {
                return Err(CompileError::semantic(
                    format!("argument {} of {name}: cannot convert {ty} to {param}", i + 1),
                    arg.span,
                ));
            }
            self.coerce(ty, param, false, arg.span)?;
        }
        Ok(())
    }

    fn gen_assign(&mut self, op: Option<BinOp>, target: &Expr, value: &Expr, span: Span) -> Result<Type, CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let (var, ty) = self.resolve_var(name, target.span)?;
                match op {
                    None => {
                        let vt = self.gen_expr(value)?;
                        self.coerce(vt, ty, false, value.span)?;
                    }
                    Some(op) => {
                        let rt = self.gen_expr(value)?;
                        self.load(var);
                        self.emit_binary(ty, op, rt, true, span)?;
                    }
                }
                self.emit(Op::Dup);
                self.store(var, ty);
                Ok(ty)
            }
            ExprKind::Field { object, field } => {
                let ExprKind::Ident(name) = &object.kind else {
                    return Err(CompileError::semantic(
                        "component assignment needs a variable",
                        object.span,
                    ));
                };
                let (var, vty) = self.resolve_var(name, object.span)?;
                let comp = component(vty, field, target.span)?;
                match op {
                    None => {
                        let vt = self.gen_expr(value)?;
                        self.coerce(vt, Type::Float, false, value.span)?;
                    }
                    Some(op) => {
                        let rt = self.gen_expr(value)?;
                        self.load(var);
                        self.emit(Op::GetField(comp));
                        self.emit_binary(Type::Float, op, rt, true, span)?;
                    }
                }
                let tmp = self.alloc_local(span)?;
                self.emit(Op::StoreLocal(tmp));
                self.load(var);
                self.emit(Op::LoadLocal(tmp));
                self.emit(Op::SetField(comp));
                self.store(var, vty);
                self.emit(Op::LoadLocal(tmp));
                Ok(Type::Float)
            }
            ExprKind::Index { array, key } => {
                let ExprKind::Ident(name) = &array.kind else {
                    return Err(CompileError::semantic(
                        "array element assignment needs an array variable",
                        array.span,
                    ));
                };
                let (var, aty) = self.resolve_var(name, array.span)?;
                if aty != Type::Array {
                    return Err(CompileError::semantic(format!("{name} is not an array"), array.span));
                }
                if let Some(op) = op {
                    let rt = self.gen_expr(value)?;
                    return Err(CompileError::semantic(
                        format!("operator not defined for these types: object {}= {rt}", op.symbol()),
                        span,
                    ));
                }
                self.gen_array_key(key)?;
                let vt = self.gen_expr(value)?;
                match vt {
                    Type::Void | Type::Array => {
                        return Err(CompileError::semantic(
                            format!("{vt} cannot be stored in an array"),
                            value.span,
                        ));
                    }
                    Type::Bool => {
                        self.emit(Op::Cast(Type::Integer));
                    }
                    _ => {}
                }
                self.emit(Op::ArraySet(var));
                Ok(if vt == Type::Bool { Type::Integer } else { vt })
            }
            _ => Err(CompileError::semantic("invalid assignment target", target.span)),
        }
    }

    fn gen_incdec(&mut self, target: &Expr, increment: bool, prefix: bool, span: Span) -> Result<Type, CompileError> {
        let ExprKind::Ident(name) = &target.kind else {
            return Err(CompileError::semantic(
                "++ and -- only apply to integer or float variables",
                span,
            ));
        };
        let (var, ty) = self.resolve_var(name, target.span)?;
        let (one, eval) = match (ty, increment) {
            (Type::Integer, true) => (Constant::Integer(1), BinEval::IntAdd),
            (Type::Integer, false) => (Constant::Integer(1), BinEval::IntSub),
            (Type::Float, true) => (Constant::Float(1.0), BinEval::FloatAdd),
            (Type::Float, false) => (Constant::Float(1.0), BinEval::FloatSub),
            _ => {
                return Err(CompileError::semantic(
                    "++ and -- only apply to integer or float variables",
                    span,
                ));
            }
        };
        if !prefix {
            self.load(var);
        }
        self.emit_const(one, span)?;
        self.load(var);
        self.emit(Op::Binary(eval));
        if prefix {
            self.emit(Op::Dup);
        }
        self.store(var, ty);
        Ok(ty)
    }
}

// ── Label pre-pass ───────────────────────────────────────────────

fn walk_block(
    block: &Block,
    seq: &mut usize,
    labels: &mut HashMap<String, usize>,
    jumps: &mut Vec<(String, usize)>,
    duplicates: &mut Vec<(String, Span)>,
) {
    for stmt in &block.stmts {
        walk_stmt(stmt, seq, labels, jumps, duplicates);
    }
}

fn walk_stmt(
    stmt: &Stmt,
    seq: &mut usize,
    labels: &mut HashMap<String, usize>,
    jumps: &mut Vec<(String, usize)>,
    duplicates: &mut Vec<(String, Span)>,
) {
    *seq += 1;
    match stmt {
        Stmt::Label { name, span } => {
            if labels.insert(name.clone(), *seq).is_some() {
                duplicates.push((name.clone(), *span));
            }
        }
        Stmt::Jump { label, .. } => jumps.push((label.clone(), *seq)),
        Stmt::Block(b) => walk_block(b, seq, labels, jumps, duplicates),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            walk_stmt(then_branch, seq, labels, jumps, duplicates);
            if let Some(e) = else_branch {
                walk_stmt(e, seq, labels, jumps, duplicates);
            }
        }
        Stmt::While { body, .. }
        | Stmt::DoWhile { body, .. }
        | Stmt::For { body, .. }
        | Stmt::ForEach { body, .. } => walk_stmt(body, seq, labels, jumps, duplicates),
        _ => {}
    }
}

/// Innermost enclosing block id of every label.
fn label_blocks(block: &Block, out: &mut HashMap<String, usize>) {
    for stmt in &block.stmts {
        label_blocks_stmt(stmt, block.id, out);
    }
}

fn label_blocks_stmt(stmt: &Stmt, block: usize, out: &mut HashMap<String, usize>) {
    match stmt {
        Stmt::Label { name, .. } => {
            out.entry(name.clone()).or_insert(block);
        }
        Stmt::Block(b) => label_blocks(b, out),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            label_blocks_stmt(then_branch, block, out);
            if let Some(e) = else_branch {
                label_blocks_stmt(e, block, out);
            }
        }
        Stmt::While { body, .. }
        | Stmt::DoWhile { body, .. }
        | Stmt::For { body, .. }
        | Stmt::ForEach { body, .. } => label_blocks_stmt(body, block, out),
        _ => {}
    }
}

// ── Small helpers ────────────────────────────────────────────────

fn same_constant(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::Vector(x), Constant::Vector(y)) => x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits()),
        (Constant::Rotation(x), Constant::Rotation(y)) => {
            x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits())
        }
        _ => a == b,
    }
}

fn constant_from(value: ConstValue) -> Constant {
    match value {
        ConstValue::Integer(i) => Constant::Integer(i),
        ConstValue::Float(f) => Constant::Float(f),
        ConstValue::String(s) => Constant::String(s.to_string()),
        ConstValue::Key(k) => Constant::Key(k.to_string()),
        ConstValue::Vector(v) => Constant::Vector(v),
        ConstValue::Rotation(r) => Constant::Rotation(r),
    }
}

fn component(ty: Type, field: &str, span: Span) -> Result<Component, CompileError> {
    match (ty, Component::from_name(field)) {
        (Type::Vector, Some(c)) if c != Component::S => Ok(c),
        (Type::Rotation, Some(c)) => Ok(c),
        _ => Err(CompileError::semantic(format!("type {ty} has no field {field}"), span)),
    }
}

fn unary_symbol(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Not => "!",
        UnaryOp::BitNot => "~",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::lsl::lexer::lex;
    use crate::lsl::parser::parse;

    fn try_compile(src: &str) -> Result<CompiledModule, Vec<CompileError>> {
        let tokens = lex(src)?;
        let script = parse(tokens)?;
        generate(&script, src, "test")
    }

    fn compile_src(src: &str) -> CompiledModule {
        try_compile(src).unwrap()
    }

    fn errors_of(src: &str) -> Vec<String> {
        match try_compile(src) {
            Ok(_) => panic!("expected errors for {src}"),
            Err(errs) => errs.into_iter().map(|e| e.message).collect(),
        }
    }

    fn handler_ops<'a>(module: &'a CompiledModule, event: EventKind) -> &'a [Op] {
        let idx = module.handler(0, event).unwrap();
        &module.functions[usize::from(idx)].ops
    }

    #[test]
    fn minimal_script() {
        let module = compile_src("default { state_entry() { llSay(0, \"hi\"); } }");
        assert_eq!(module.states, vec!["default".to_string()]);
        let ops = handler_ops(&module, EventKind::StateEntry);
        assert_eq!(ops.first(), Some(&Op::MemStatic(CALL_FRAME_MEMUSE)));
        assert!(ops.iter().any(|op| matches!(op, Op::CallApi(_))));
        assert_eq!(ops.last(), Some(&Op::Return));
        assert_eq!(module.functions[usize::from(module.init)].kind, FunctionKind::Init);
    }

    #[test]
    fn frame_prolog_counts_params_and_locals() {
        let module = compile_src(
            "integer f(string s) { list l; return 1; }\n\
             default { state_entry() { f(\"x\"); } }",
        );
        let f = &module.functions[0];
        assert_eq!(f.ops[0], Op::MemStatic(CALL_FRAME_MEMUSE + 40 + 96));
        assert_eq!(f.ops[1], Op::MemIncr(VarRef::Local(0)));
        assert!(f.ops.contains(&Op::MemDecr(VarRef::Local(1))));
        assert!(f.ops.contains(&Op::MemStatic(-(CALL_FRAME_MEMUSE + 40 + 96))));
    }

    #[test]
    fn right_operand_is_generated_first() {
        let module = compile_src("default { state_entry() { integer x = 1 - 2; } }");
        let ops = handler_ops(&module, EventKind::StateEntry);
        let pushes: Vec<&Constant> = ops
            .iter()
            .filter_map(|op| match op {
                Op::PushConst(i) => module.constants.get(usize::from(*i)),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, vec![&Constant::Integer(2), &Constant::Integer(1)]);
        assert!(ops.contains(&Op::Binary(BinEval::IntSub)));
    }

    #[test]
    fn mixed_operands_are_coerced() {
        let module = compile_src("default { state_entry() { float f = 1 + 2.5; } }");
        let ops = handler_ops(&module, EventKind::StateEntry);
        assert!(ops.contains(&Op::Cast(Type::Float)));
        assert!(ops.contains(&Op::Binary(BinEval::FloatAdd)));
    }

    #[test]
    fn script_call_checks_for_state_change() {
        let module = compile_src(
            "go() { state two; }\n\
             default { state_entry() { go(); } }\n\
             state two { state_entry() { } }",
        );
        let ops = handler_ops(&module, EventKind::StateEntry);
        let call = ops.iter().position(|op| *op == Op::Call(0)).unwrap();
        assert!(matches!(ops[call + 1], Op::JumpIfNoStateChange(_)));
        assert!(module.functions[0].ops.contains(&Op::SetState(1)));
    }

    #[test]
    fn constants_are_deduplicated_and_named_constants_resolve() {
        let module = compile_src("default { state_entry() { float a = PI; float b = PI; integer t = TRUE; } }");
        let pis = module
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Float(f) if (*f - std::f64::consts::PI).abs() < 1e-6))
            .count();
        assert_eq!(pis, 1);
        assert!(module.constants.contains(&Constant::Integer(1)));
    }

    #[test]
    fn backward_jump_target_gets_checkpoint() {
        let module = compile_src("default { state_entry() { integer i; @top; if (++i < 5) jump top; } }");
        let ops = handler_ops(&module, EventKind::StateEntry);
        let jumps: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Jump(t) => Some(*t),
                _ => None,
            })
            .collect();
        let target = usize::try_from(*jumps.last().unwrap()).unwrap();
        assert_eq!(ops[target], Op::CheckRun);
    }

    #[test]
    fn jump_out_of_block_releases_its_variables() {
        let module = compile_src("default { state_entry() { @out; { string s = \"x\"; jump out; } } }");
        let ops = handler_ops(&module, EventKind::StateEntry);
        let jump = ops.iter().rposition(|op| matches!(op, Op::Jump(_))).unwrap();
        assert_eq!(ops[jump - 1], Op::MemStatic(-40));
        assert!(matches!(ops[jump - 2], Op::MemDecr(VarRef::Local(_))));
    }

    #[test]
    fn lateral_jump_is_rejected() {
        let errs = errors_of("default { state_entry() { { @a; } { jump a; } } }");
        assert!(errs.contains(&"no lateral jumps allowed".to_string()), "{errs:?}");
    }

    #[test]
    fn undefined_and_duplicate_labels() {
        let errs = errors_of("default { state_entry() { jump nowhere; @x; @x; } }");
        assert!(errs.contains(&"undefined label nowhere".to_string()), "{errs:?}");
        assert!(errs.contains(&"duplicate label x".to_string()), "{errs:?}");
    }

    #[test]
    fn operator_type_errors() {
        let errs = errors_of("default { state_entry() { integer i = \"a\" * 2; } }");
        assert_eq!(errs, vec!["operator not defined for these types: string * integer"]);
    }

    #[test]
    fn compound_assignment_must_keep_type() {
        compile_src("default { state_entry() { vector v; v *= 2.0; v.x += 1; } }");
        let errs = errors_of("default { state_entry() { integer i; i += \"x\"; } }");
        assert!(errs[0].starts_with("operator not defined"), "{errs:?}");
        let errs = errors_of("default { state_entry() { integer i; i += 1.5; } }");
        assert!(errs[0].starts_with("operator not defined"), "{errs:?}");
    }

    #[test]
    fn string_only_appends_strings_in_place() {
        compile_src("default { state_entry() { string s = \"a\"; s += \"b\"; s = s + 5; } }");
        let errs = errors_of("default { state_entry() { string s = \"a\"; s += 5; } }");
        assert_eq!(errs, vec!["operator not defined for these types: string += integer"]);
    }

    #[test]
    fn arity_mismatch() {
        let errs = errors_of("default { state_entry() { llSay(0); } }");
        assert_eq!(errs, vec!["llSay has 2 param(s), but call has 1"]);
    }

    #[test]
    fn handler_signature_must_match_event() {
        let errs = errors_of("default { touch_start(string s) { } }");
        assert_eq!(errs, vec!["touch_start handler parameters must be (integer)"]);
        let errs = errors_of("default { poke() { } }");
        assert_eq!(errs, vec!["unknown event handler poke"]);
    }

    #[test]
    fn unknown_state_and_variable() {
        let errs = errors_of("default { state_entry() { state nowhere; x = 1; } }");
        assert!(errs.contains(&"undefined state nowhere".to_string()), "{errs:?}");
        assert!(errs.contains(&"undefined variable x".to_string()), "{errs:?}");
    }

    #[test]
    fn errors_accumulate_per_statement() {
        let errs = errors_of("default { state_entry() { a = 1; b = 2; PI = 3.0; } }");
        assert_eq!(errs.len(), 3, "{errs:?}");
        assert!(errs.contains(&"cannot assign to constant PI".to_string()));
    }

    #[test]
    fn global_initializer_must_be_constant() {
        let errs = errors_of("integer g = llAbs(-1);\ndefault { state_entry() { } }");
        assert_eq!(errs, vec!["global initializer must be constant"]);
    }

    #[test]
    fn globals_seed_memory_in_initializer() {
        let module = compile_src("list x = [1];\nvector v;\ndefault { state_entry() { x = []; } }");
        let init = &module.functions[usize::from(module.init)].ops;
        assert_eq!(init[0], Op::MemStatic(96));
        assert!(init.contains(&Op::MemIncr(VarRef::Global(0))));
        assert!(init.contains(&Op::MemStatic(72)));
        let ops = handler_ops(&module, EventKind::StateEntry);
        assert!(ops.contains(&Op::MemDecr(VarRef::Global(0))));
    }

    #[test]
    fn return_type_rules() {
        let errs = errors_of("integer f() { return; }\ndefault { state_entry() { } }");
        assert_eq!(errs, vec!["return value of type integer expected"]);
        let errs = errors_of("default { state_entry() { return 1; } }");
        assert_eq!(errs, vec!["return value not allowed here"]);
    }

    #[test]
    fn line_table_tracks_every_op() {
        let module = compile_src("default {\n  state_entry() {\n    llSay(0, \"a\");\n  }\n}");
        let idx = module.handler(0, EventKind::StateEntry).unwrap();
        let func = &module.functions[usize::from(idx)];
        assert_eq!(func.lines.len(), func.ops.len());
        let api = func.ops.iter().position(|op| matches!(op, Op::CallApi(_))).unwrap();
        assert_eq!(func.position(api).map(|(l, _)| l), Some(3));
    }

    #[test]
    fn foreach_over_array() {
        let module = compile_src(
            "XMROption arrays;\n\
             default { state_entry() { array a; object k; object v; a[1] = \"x\"; foreach (k, v in a) { } } }",
        );
        assert!(module.arrays_enabled);
        let ops = handler_ops(&module, EventKind::StateEntry);
        assert!(ops.iter().any(|op| matches!(op, Op::ArraySet(VarRef::Local(_)))));
        assert!(ops.contains(&Op::ArrayKey));
        assert!(ops.contains(&Op::ArrayValue));
        assert!(ops.contains(&Op::ArrayCount));
    }
}
