//! Standard native functions, registered by [`install_standard_natives`].
//! These are convenience bindings, not part of the mandatory opcode set;
//! programs may call them via `CALLN`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Context;

/// Register `print` and `now_ms` on `ctx`. Call before or after `attach`;
/// natives registered before attach are rebound to pool indices at attach
/// time.
pub fn install_standard_natives(ctx: &mut Context) {
    ctx.register_native("print", Box::new(()), |ctx, args, _| {
        let module = ctx.module().ok_or("print: no module attached")?;
        let rendered: Vec<String> = args.iter().map(|v| v.render(module)).collect();
        let line = format!("{}\n", rendered.join(""));
        ctx.write_to_sink(line.as_bytes()).map_err(|e| e.to_string())?;
        Ok(Value::Nil)
    });

    ctx.register_native("now_ms", Box::new(()), |_ctx, _args, _| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| e.to_string())?;
        Ok(Value::Int(now.as_millis() as i64))
    });
}
