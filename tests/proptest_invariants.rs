//! Property-based checks of the universal invariants in spec §8: every
//! instruction-boundary IP reached by the interpreter stays within the code
//! buffer, and arithmetic over arbitrary operands matches the documented
//! wrapping/coercion rules.

use std::rc::Rc;

use proptest::prelude::*;

use vittelight::vm::{Context, Status};
use vittelight::{assemble, Value};

fn run_arith(a: i64, b: i64, mnemonic: &str) -> (Value, u64) {
    let source = format!("PUSHI {a}\nPUSHI {b}\n{mnemonic}\nHALT\n");
    let asm = assemble(&source).expect("arithmetic program always assembles");
    let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
    ctx.attach(Rc::new(asm.module));
    let status = ctx.run(0).expect("two pushes and a binop never trap");
    assert_eq!(status, Status::Done);
    let result = ctx.stack()[0];
    (result, ctx.step_count())
}

proptest! {
    /// `ADD` on any two `i64` literals wraps exactly like `i64::wrapping_add`,
    /// matching the documented policy (spec §4.1's `ADD/SUB/MUL/DIV`
    /// semantics; arithmetic is two's-complement, not trapping, for `ADD`).
    #[test]
    fn add_matches_wrapping_add(a: i64, b: i64) {
        let (result, steps) = run_arith(a, b, "ADD");
        prop_assert_eq!(result, Value::Int(a.wrapping_add(b)));
        prop_assert_eq!(steps, 4); // PUSHI, PUSHI, ADD, HALT
    }

    #[test]
    fn sub_matches_wrapping_sub(a: i64, b: i64) {
        let (result, _) = run_arith(a, b, "SUB");
        prop_assert_eq!(result, Value::Int(a.wrapping_sub(b)));
    }

    #[test]
    fn mul_matches_wrapping_mul(a: i64, b: i64) {
        let (result, _) = run_arith(a, b, "MUL");
        prop_assert_eq!(result, Value::Int(a.wrapping_mul(b)));
    }

    /// Every well-formed module's final IP after a normal `HALT` lands
    /// exactly on the `HALT` byte plus its size — never past the code
    /// buffer's end, regardless of how many `NOP`s precede it.
    #[test]
    fn nop_padding_never_runs_the_ip_past_code_end(nop_count in 0usize..64) {
        let mut source = "NOP\n".repeat(nop_count);
        source.push_str("HALT\n");
        let asm = assemble(&source).unwrap();
        let mut ctx = Context::new().with_sink(Box::new(Vec::new()));
        ctx.attach(Rc::new(asm.module));
        let status = ctx.run(0).unwrap();
        prop_assert_eq!(status, Status::Done);
        prop_assert!(ctx.ip() <= asm.module.code_size());
    }

    /// String interning is idempotent: assembling the same quoted literal
    /// any number of times never grows the pool past one entry.
    #[test]
    fn duplicate_string_literals_intern_once(repeats in 1usize..32) {
        let mut source = "PUSHS \"same\"\n".repeat(repeats);
        source.push_str("HALT\n");
        let asm = assemble(&source).unwrap();
        prop_assert_eq!(asm.module.string_count(), 1);
    }
}
