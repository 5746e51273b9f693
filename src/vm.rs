//! The virtual machine: execution context, value stack, globals, native
//! registry, tracing, and the step/run loop.

use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use crate::disassembler::disassemble_one;
use crate::error::RuntimeError;
use crate::module::Module;
use crate::opcode::Op;
use crate::value::{coerce_pair, Numeric, Value};

/// Bitmask selecting which categories of event are written to the
/// context's output sink.
pub mod trace {
    pub const NONE: u8 = 0;
    pub const OP: u8 = 1 << 0;
    pub const STACK: u8 = 1 << 1;
    pub const GLOBAL: u8 = 1 << 2;
    pub const CALL: u8 = 1 << 3;
    pub const ALL: u8 = OP | STACK | GLOBAL | CALL;
}

/// Outcome of `step`/`run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The instruction executed normally; execution should continue.
    Running,
    /// `HALT` was reached; this is the only normal termination.
    Done,
    /// `run`'s step budget was exhausted before `Done` or an error.
    StepBudgetExhausted,
}

/// The argument slice handed to a native callback, deepest-first
/// (source-order): `args[0]` is the value that was pushed earliest of the
/// `argc` popped cells.
pub type NativeArgs<'a> = &'a [Value];

/// A native function: `(context, args, userdata) -> Result<Value, String>`.
/// Returning `Ok(Value::Nil)` suppresses the push, matching the ABI's
/// "writing `Nil` means no return value" contract. An `Err` is propagated
/// as [`RuntimeError::Native`].
pub type NativeFn = Rc<dyn Fn(&mut Context, &[Value], &mut dyn std::any::Any) -> Result<Value, String>>;

struct NativeEntry {
    name: String,
    pool_index: Option<u32>,
    func: NativeFn,
    userdata: Box<dyn std::any::Any>,
}

const DEFAULT_STACK_CAPACITY: usize = 256;
const DEFAULT_STACK_LIMIT: usize = 1 << 20;

/// Owns all mutable execution state for one running module. Not `Send`;
/// separate contexts may run concurrently in separate threads provided
/// they share no module data mutably (modules are logically immutable once
/// loaded).
pub struct Context {
    module: Option<Rc<Module>>,
    ip: usize,
    stack: Vec<Value>,
    stack_limit: usize,
    globals: Vec<Value>,
    natives: Vec<NativeEntry>,
    trace_mask: u8,
    sink: Box<dyn Write>,
    steps: u64,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("ip", &self.ip)
            .field("stack_depth", &self.stack.len())
            .field("globals", &self.globals.len())
            .field("steps", &self.steps)
            .finish()
    }
}

impl Context {
    /// Create a context with default stack capacity, no module attached,
    /// and output directed to stdout.
    pub fn new() -> Self {
        Context {
            module: None,
            ip: 0,
            stack: Vec::with_capacity(DEFAULT_STACK_CAPACITY),
            stack_limit: DEFAULT_STACK_LIMIT,
            globals: Vec::new(),
            natives: Vec::new(),
            trace_mask: trace::NONE,
            sink: Box::new(io::stdout()),
            steps: 0,
        }
    }

    /// Replace the output sink used by `PRINT` and tracing.
    pub fn with_sink(mut self, sink: Box<dyn Write>) -> Self {
        self.sink = sink;
        self
    }

    pub fn set_trace_mask(&mut self, mask: u8) {
        self.trace_mask = mask;
    }

    pub fn set_stack_limit(&mut self, limit: usize) {
        self.stack_limit = limit;
    }

    /// Register a native function. May be called before or after
    /// `attach`; if a module is already attached and its pool contains a
    /// string equal to `name`, the binding is resolved immediately.
    pub fn register_native<F>(&mut self, name: &str, userdata: Box<dyn std::any::Any>, func: F)
    where
        F: Fn(&mut Context, &[Value], &mut dyn std::any::Any) -> Result<Value, String> + 'static,
    {
        let pool_index = self.module.as_ref().and_then(|m| find_string_index(m, name));
        self.natives.push(NativeEntry {
            name: name.to_string(),
            pool_index,
            func: Rc::new(func),
            userdata,
        });
    }

    /// Bind a module to this context: resets `ip`, resizes the globals
    /// vector to the pool's size (all `Nil`), re-binds each native's name
    /// to its pool index, and clears the step counter.
    pub fn attach(&mut self, module: Rc<Module>) {
        self.globals = vec![Value::Nil; module.string_count() as usize];
        self.ip = 0;
        self.steps = 0;
        for native in &mut self.natives {
            native.pool_index = find_string_index(&module, &native.name);
        }
        self.module = Some(module);
    }

    /// Detach the current module: resets `ip` and globals but keeps the
    /// module (and native bindings) for re-attachment.
    pub fn detach(&mut self) -> Option<Rc<Module>> {
        self.ip = 0;
        self.globals.clear();
        self.module.take()
    }

    pub fn module(&self) -> Option<&Module> {
        self.module.as_deref()
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Move the instruction pointer directly. Used by the `repl` and
    /// `bench` sub-commands, which re-run or resume within an already
    /// attached module rather than stepping from offset 0.
    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    /// Overwrite the globals vector wholesale. Used by the `repl`
    /// sub-command to carry a prior line's global values forward into a
    /// freshly attached, larger module whose string-pool prefix (and thus
    /// whose global-slot layout) is unchanged from the previous line.
    pub fn set_globals(&mut self, globals: Vec<Value>) {
        self.globals = globals;
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Write raw bytes to this context's output sink — the same sink
    /// `PRINT` and tracing write to (§5: the sink is "owned by the context
    /// and is not synchronized"). Native callbacks that render output
    /// (e.g. the standard `print` native) use this instead of writing to
    /// the process's real stdout, so a context configured with
    /// [`Context::with_sink`] can capture everything a program produces.
    pub fn write_to_sink(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes)
    }

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.stack_limit {
            return Err(RuntimeError::StackOverflow { limit: self.stack_limit });
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn peek(&self) -> Result<Value, RuntimeError> {
        self.stack.last().copied().ok_or(RuntimeError::StackUnderflow)
    }

    fn module_ref(&self) -> Result<Rc<Module>, RuntimeError> {
        self.module.clone().ok_or(RuntimeError::BadBytecode {
            reason: "no module attached".to_string(),
        })
    }

    fn trace(&mut self, mask: u8, msg: &str) {
        if self.trace_mask & mask != 0 {
            let _ = writeln!(self.sink, "{msg}");
        }
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self) -> Result<Status, RuntimeError> {
        let module = self.module_ref()?;
        let code = module.code();

        if self.ip >= code.len() {
            return Err(RuntimeError::IpOutOfBounds { ip: self.ip, code_size: code.len() });
        }

        if self.trace_mask & trace::OP != 0 {
            if let Ok((line, _)) = disassemble_one(&module, self.ip) {
                self.trace(trace::OP, &line);
            }
        }

        let byte = code[self.ip];
        let op = Op::from_byte(byte).ok_or_else(|| RuntimeError::BadBytecode {
            reason: format!("unknown opcode byte 0x{byte:02X} at ip={}", self.ip),
        })?;
        self.ip += 1;

        let status = self.execute(op, &module)?;

        self.steps += 1;
        if self.trace_mask & trace::STACK != 0 {
            let depth = self.stack.len();
            self.trace(trace::STACK, &format!("  stack[{depth}]: {:?}", self.stack));
        }

        Ok(status)
    }

    fn read_u32(&mut self, code: &[u8]) -> Result<u32, RuntimeError> {
        let b = code.get(self.ip..self.ip + 4).ok_or_else(|| RuntimeError::BadBytecode {
            reason: "short read of u32 operand".to_string(),
        })?;
        self.ip += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u8(&mut self, code: &[u8]) -> Result<u8, RuntimeError> {
        let b = *code.get(self.ip).ok_or_else(|| RuntimeError::BadBytecode {
            reason: "short read of u8 operand".to_string(),
        })?;
        self.ip += 1;
        Ok(b)
    }

    fn read_u64(&mut self, code: &[u8]) -> Result<u64, RuntimeError> {
        let b = code.get(self.ip..self.ip + 8).ok_or_else(|| RuntimeError::BadBytecode {
            reason: "short read of u64 operand".to_string(),
        })?;
        self.ip += 8;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_f64(&mut self, code: &[u8]) -> Result<f64, RuntimeError> {
        let b = code.get(self.ip..self.ip + 8).ok_or_else(|| RuntimeError::BadBytecode {
            reason: "short read of f64 operand".to_string(),
        })?;
        self.ip += 8;
        Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn execute(&mut self, op: Op, module: &Module) -> Result<Status, RuntimeError> {
        let code = module.code();
        match op {
            Op::Nop => {}
            Op::Pushi => {
                let bits = self.read_u64(code)?;
                self.push(Value::Int(bits as i64))?;
            }
            Op::Pushf => {
                let f = self.read_f64(code)?;
                self.push(Value::Float(f))?;
            }
            Op::Pushs => {
                let idx = self.read_u32(code)?;
                self.push(Value::Str(idx))?;
            }
            Op::Add => self.binop(|a, b| a.wrapping_add(b), |a, b| a + b)?,
            Op::Sub => self.binop(|a, b| a.wrapping_sub(b), |a, b| a - b)?,
            Op::Mul => self.binop(|a, b| a.wrapping_mul(b), |a, b| a * b)?,
            Op::Div => self.div()?,
            Op::Eq => self.compare_eq(module, false)?,
            Op::Neq => self.compare_eq(module, true)?,
            Op::Lt => self.compare_ord(|o| o.is_lt())?,
            Op::Gt => self.compare_ord(|o| o.is_gt())?,
            Op::Le => self.compare_ord(|o| o.is_le())?,
            Op::Ge => self.compare_ord(|o| o.is_ge())?,
            Op::Print => {
                let v = self.peek()?;
                let rendered = v.render(module);
                let _ = writeln!(self.sink, "{rendered}");
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Storeg => {
                let idx = self.read_u32(code)?;
                let v = self.pop()?;
                let slot = self.globals.get_mut(idx as usize).ok_or_else(|| {
                    RuntimeError::BadBytecode { reason: format!("global index {idx} out of range") }
                })?;
                *slot = v;
                if self.trace_mask & trace::GLOBAL != 0 {
                    self.trace(trace::GLOBAL, &format!("  global[{idx}] = {v:?}"));
                }
            }
            Op::Loadg => {
                let idx = self.read_u32(code)?;
                let v = self.globals.get(idx as usize).copied().unwrap_or(Value::Nil);
                self.push(v)?;
            }
            Op::Calln => {
                let name_idx = self.read_u32(code)?;
                let argc = self.read_u8(code)? as usize;
                self.call_native(module, name_idx, argc)?;
            }
            Op::Halt => return Ok(Status::Done),
        }
        Ok(Status::Running)
    }

    fn binop(
        &mut self,
        int_op: impl Fn(i64, i64) -> i64,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (na, nb) = coerce_pair(a, b)?;
        let result = match (na, nb) {
            (Numeric::Int(x), Numeric::Int(y)) => Value::Int(int_op(x, y)),
            (Numeric::Float(x), Numeric::Float(y)) => Value::Float(float_op(x, y)),
            _ => unreachable!("coerce_pair always widens both operands uniformly"),
        };
        self.push(result)
    }

    fn div(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (na, nb) = coerce_pair(a, b)?;
        let result = match (na, nb) {
            (Numeric::Int(_), Numeric::Int(0)) => return Err(RuntimeError::DivisionByZero),
            (Numeric::Int(x), Numeric::Int(y)) => Value::Int(x / y),
            (Numeric::Float(x), Numeric::Float(y)) => Value::Float(x / y),
            _ => unreachable!("coerce_pair always widens both operands uniformly"),
        };
        self.push(result)
    }

    fn compare_eq(&mut self, module: &Module, negate: bool) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let eq = a.value_eq(&b, module);
        self.push(Value::Bool(eq != negate))
    }

    fn compare_ord(&mut self, accept: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (na, nb) = coerce_pair(a, b)?;
        let ordering = match (na, nb) {
            (Numeric::Int(x), Numeric::Int(y)) => x.cmp(&y),
            (Numeric::Float(x), Numeric::Float(y)) => {
                x.partial_cmp(&y).ok_or_else(|| RuntimeError::TypeMismatch {
                    reason: "comparison against NaN".to_string(),
                })?
            }
            _ => unreachable!("coerce_pair always widens both operands uniformly"),
        };
        self.push(Value::Bool(accept(ordering)))
    }

    /// `CALLN name argc`: pops `argc` values deepest-first (source order),
    /// resolves the native by pool-index binding or linear name scan, and
    /// invokes it. A non-`Nil` return value is pushed.
    fn call_native(&mut self, module: &Module, name_idx: u32, argc: usize) -> Result<(), RuntimeError> {
        if self.stack.len() < argc {
            return Err(RuntimeError::StackUnderflow);
        }
        let split = self.stack.len() - argc;
        let args: Vec<Value> = self.stack.drain(split..).collect();

        let name = module
            .string(name_idx)
            .map(|s| s.to_display().into_owned())
            .unwrap_or_default();

        let pos = self
            .natives
            .iter()
            .position(|n| n.pool_index == Some(name_idx))
            .or_else(|| self.natives.iter().position(|n| n.name == name))
            .ok_or_else(|| RuntimeError::UnknownNative(name.clone()))?;

        if self.trace_mask & trace::CALL != 0 {
            self.trace(trace::CALL, &format!("  call {name}({argc} args)"));
        }

        let func = self.natives[pos].func.clone();
        // SAFETY-free trick: temporarily take the userdata out to avoid a
        // double-borrow of `self` (the callback itself takes `&mut Context`).
        let mut userdata = std::mem::replace(&mut self.natives[pos].userdata, Box::new(()));
        let result = func(self, &args, userdata.as_mut());
        self.natives[pos].userdata = userdata;

        match result {
            Ok(Value::Nil) => Ok(()),
            Ok(v) => self.push(v),
            Err(msg) => Err(RuntimeError::Native(msg)),
        }
    }

    /// Run until `HALT`, an error, or (if `max_steps > 0`) the step budget
    /// is exhausted. The budget is advisory: a single instruction is never
    /// preempted mid-execution.
    pub fn run(&mut self, max_steps: usize) -> Result<Status, RuntimeError> {
        let mut executed = 0usize;
        loop {
            if max_steps > 0 && executed >= max_steps {
                return Ok(Status::StepBudgetExhausted);
            }
            match self.step()? {
                Status::Done => return Ok(Status::Done),
                Status::Running => executed += 1,
                Status::StepBudgetExhausted => unreachable!("step never returns this status"),
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn find_string_index(module: &Module, name: &str) -> Option<u32> {
    module
        .strings()
        .iter()
        .position(|s| s.as_bytes() == name.as_bytes())
        .map(|i| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;

    fn run_source(source: &str, max_steps: usize) -> (Context, Status) {
        let asm = assemble(source).unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.attach(Rc::new(asm.module));
        let status = ctx.run(max_steps).unwrap();
        (ctx, status)
    }

    #[test]
    fn halts_cleanly_on_arithmetic() {
        let (ctx, status) = run_source("PUSHI 2\nPUSHI 40\nADD\nPRINT\nHALT\n", 0);
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.stack().len(), 1);
    }

    #[test]
    fn globals_round_trip() {
        let (ctx, status) = run_source(
            "PUSHI 7\nSTOREG x\nLOADG x\nLOADG x\nMUL\nPRINT\nHALT\n",
            0,
        );
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.stack(), &[Value::Int(49)]);
    }

    #[test]
    fn float_int_coercion() {
        let (ctx, status) = run_source("PUSHI 3\nPUSHF 0.5\nADD\nPRINT\nHALT\n", 0);
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.stack(), &[Value::Float(3.5)]);
    }

    #[test]
    fn step_budget_is_honored() {
        let (ctx, status) = run_source(
            "NOP\nNOP\nNOP\nNOP\nNOP\nNOP\nNOP\nHALT\n",
            5,
        );
        assert_eq!(status, Status::StepBudgetExhausted);
        assert_eq!(ctx.ip(), 5); // each NOP is 1 byte; ip points at the 6th
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let asm = assemble("PUSHI 1\nPUSHI 0\nDIV\nHALT\n").unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.attach(Rc::new(asm.module));
        assert_eq!(ctx.run(0).unwrap_err(), RuntimeError::DivisionByZero);
    }

    #[test]
    fn calln_invokes_registered_native_with_deepest_first_args() {
        let asm = assemble("PUSHI 1\nPUSHI 2\nPUSHI 3\nCALLN sum3 3\nPRINT\nHALT\n").unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.register_native("sum3", Box::new(()), |_ctx, args, _| {
            assert_eq!(args, &[Value::Int(1), Value::Int(2), Value::Int(3)]);
            Ok(Value::Int(args.iter().map(|v| v.as_int().unwrap()).sum()))
        });
        ctx.attach(Rc::new(asm.module));
        let status = ctx.run(0).unwrap();
        assert_eq!(status, Status::Done);
        assert_eq!(ctx.stack(), &[Value::Int(6)]);
    }

    #[test]
    fn unknown_native_is_an_error() {
        let asm = assemble("CALLN nope 0\nHALT\n").unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.attach(Rc::new(asm.module));
        assert!(matches!(ctx.run(0), Err(RuntimeError::UnknownNative(_))));
    }

    #[test]
    fn running_off_the_end_is_an_error() {
        let asm = assemble("NOP\n").unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.attach(Rc::new(asm.module));
        assert!(matches!(ctx.run(0), Err(RuntimeError::IpOutOfBounds { .. })));
    }
}
