//! End-to-end scenarios from the VitteLight command surface (spec §8).

use std::io::Cursor;
use std::rc::Rc;

use vittelight::value::Value;
use vittelight::vm::{Context, Status};
use vittelight::{assemble, natives, RuntimeError};

/// `PRINT`'s output only goes through the context's sink, which we can't
/// get back out of a moved `Box<dyn Write>` without a shared handle. Use a
/// `Rc<RefCell<Vec<u8>>>`-backed writer so both the context and the test
/// can see the bytes.
struct SharedBuf(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn captured_stdout(source: &str) -> (String, Status) {
    let asm = assemble(source).unwrap();
    let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut ctx = Context::new().with_sink(Box::new(SharedBuf(buf.clone())));
    natives::install_standard_natives(&mut ctx);
    ctx.attach(Rc::new(asm.module));
    let status = ctx.run(0).unwrap();
    let text = String::from_utf8(buf.borrow().clone()).unwrap();
    (text, status)
}

#[test]
fn scenario_integer_arithmetic_and_print() {
    let (stdout, status) = captured_stdout("PUSHI 2\nPUSHI 40\nADD\nPRINT\nHALT\n");
    assert_eq!(stdout, "42\n");
    assert_eq!(status, Status::Done);
}

#[test]
fn scenario_string_literal_and_native_call() {
    // The standard `print` native writes through the context's own sink
    // (§5), so a context configured with `with_sink` captures its output
    // exactly like `PRINT`'s.
    let (stdout, status) = captured_stdout("PUSHS \"Hello\"\nCALLN print 1\nHALT\n");
    assert_eq!(stdout, "Hello\n");
    assert_eq!(status, Status::Done);
}

#[test]
fn scenario_globals() {
    let (stdout, status) = captured_stdout(
        "PUSHI 7\nSTOREG x\nLOADG x\nLOADG x\nMUL\nPRINT\nHALT\n",
    );
    assert_eq!(stdout, "49\n");
    assert_eq!(status, Status::Done);
}

#[test]
fn scenario_float_int_coercion() {
    let (stdout, status) = captured_stdout("PUSHI 3\nPUSHF 0.5\nADD\nPRINT\nHALT\n");
    assert_eq!(stdout, "3.5\n");
    assert_eq!(status, Status::Done);
}

#[test]
fn scenario_step_budget_exhaustion() {
    // 7 instructions before HALT (8 total), run with max_steps = 5.
    let source = "NOP\nNOP\nNOP\nNOP\nNOP\nNOP\nNOP\nHALT\n";
    let asm = assemble(source).unwrap();
    let mut ctx = Context::new().with_sink(Box::new(Cursor::new(Vec::new())));
    ctx.attach(Rc::new(asm.module));
    let status = ctx.run(5).unwrap();
    assert_eq!(status, Status::StepBudgetExhausted);
    assert_eq!(ctx.ip(), 5, "ip should point at the sixth instruction");
}

#[test]
fn scenario_calln_zero_args() {
    let asm = assemble("CALLN marker 0\nHALT\n").unwrap();
    let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
    ctx.register_native("marker", Box::new(()), |_ctx, args, _| {
        assert!(args.is_empty());
        Ok(Value::Nil)
    });
    ctx.attach(Rc::new(asm.module));
    assert_eq!(ctx.run(0).unwrap(), Status::Done);
}

#[test]
fn scenario_calln_max_argc_is_accepted() {
    let mut source = String::new();
    for i in 0..255 {
        source.push_str(&format!("PUSHI {i}\n"));
    }
    source.push_str("CALLN sink 255\nHALT\n");
    let asm = assemble(&source).unwrap();
    let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
    ctx.register_native("sink", Box::new(()), |_ctx, args, _| {
        assert_eq!(args.len(), 255);
        Ok(Value::Nil)
    });
    ctx.attach(Rc::new(asm.module));
    assert_eq!(ctx.run(0).unwrap(), Status::Done);
}

#[test]
fn scenario_calln_argc_256_rejected_by_assembler() {
    let err = assemble("CALLN sink 256\nHALT\n").unwrap_err();
    assert!(matches!(err, vittelight::AssembleError::LiteralOutOfRange { line: 1 }));
}

#[test]
fn scenario_empty_code_is_immediately_out_of_bounds() {
    let asm = assemble("").unwrap();
    let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
    ctx.attach(Rc::new(asm.module));
    // Documented choice: empty code has nothing to execute, so the very
    // first `step` reports `IpOutOfBounds` rather than treating absence of
    // code as an implicit `Done`.
    assert!(matches!(ctx.run(0), Err(RuntimeError::IpOutOfBounds { ip: 0, code_size: 0 })));
}

#[test]
fn running_off_the_end_without_halt_is_an_error() {
    let asm = assemble("PUSHI 1\nPOP\n").unwrap();
    let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
    ctx.attach(Rc::new(asm.module));
    assert!(matches!(ctx.run(0), Err(RuntimeError::IpOutOfBounds { .. })));
}
