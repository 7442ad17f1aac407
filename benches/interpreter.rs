//! Benchmarks for the abstract interpreter.
//!
//! Measures a full analysis (decode, region model, fixed point, allocation)
//! for a few function shapes:
//! - A straight-line float kernel
//! - A counting loop that keeps its accumulator unboxed
//! - Nested try/except regions around calls
//! - A batch of independent functions on the rayon pool

extern crate jitscope;

use criterion::{criterion_group, criterion_main, Criterion};
use jitscope::{
    analysis::{analyze_batch, AbstractInterpreter},
    backend::SymbolicBackend,
    bytecode::{Assembler, CodeObject, Constant, Opcode},
    config::AnalysisConfig,
};
use std::hint::black_box;

fn analyse(code: &CodeObject) -> AbstractInterpreter {
    let mut interp = AbstractInterpreter::new(code.clone(), AnalysisConfig::default()).unwrap();
    interp.interpret(&mut SymbolicBackend::new()).unwrap();
    interp
}

/// `a*a + b*b` repeated over 64 statements.
fn straight_line() -> CodeObject {
    let mut asm = Assembler::new();
    for _ in 0..64 {
        asm.emit(Opcode::LoadFast, 0).unwrap();
        asm.emit(Opcode::LoadFast, 0).unwrap();
        asm.emit(Opcode::BinaryMultiply, 0).unwrap();
        asm.emit(Opcode::LoadFast, 1).unwrap();
        asm.emit(Opcode::LoadFast, 1).unwrap();
        asm.emit(Opcode::BinaryMultiply, 0).unwrap();
        asm.emit(Opcode::BinaryAdd, 0).unwrap();
        asm.emit(Opcode::StoreFast, 2).unwrap();
    }
    asm.emit(Opcode::LoadConst, 1).unwrap();
    asm.emit(Opcode::ReturnValue, 0).unwrap();
    CodeObject::new(
        "kernel",
        asm.finalize().unwrap(),
        vec![Constant::Float(1.5), Constant::None],
        3,
    )
    .with_params(vec![
        jitscope::analysis::AbstractValueKind::Float,
        jitscope::analysis::AbstractValueKind::Float,
    ])
}

/// `x = 0.0; while x < 1e6: x += 1.0`
fn counting_loop() -> CodeObject {
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadConst, 0).unwrap();
    asm.emit(Opcode::StoreFast, 0).unwrap();
    asm.emit_jump(Opcode::SetupLoop, "end").unwrap();
    asm.define_label("top").unwrap();
    asm.emit(Opcode::LoadFast, 0).unwrap();
    asm.emit(Opcode::LoadConst, 1).unwrap();
    asm.emit(Opcode::CompareOp, 0).unwrap();
    asm.emit_jump(Opcode::PopJumpIfFalse, "exit").unwrap();
    asm.emit(Opcode::LoadFast, 0).unwrap();
    asm.emit(Opcode::LoadConst, 2).unwrap();
    asm.emit(Opcode::InplaceAdd, 0).unwrap();
    asm.emit(Opcode::StoreFast, 0).unwrap();
    asm.emit_jump(Opcode::JumpAbsolute, "top").unwrap();
    asm.define_label("exit").unwrap();
    asm.emit(Opcode::PopBlock, 0).unwrap();
    asm.define_label("end").unwrap();
    asm.emit(Opcode::LoadConst, 3).unwrap();
    asm.emit(Opcode::ReturnValue, 0).unwrap();
    CodeObject::new(
        "count",
        asm.finalize().unwrap(),
        vec![
            Constant::Float(0.0),
            Constant::Float(1e6),
            Constant::Float(1.0),
            Constant::None,
        ],
        1,
    )
}

/// Eight nested try/except regions, each guarding a call.
fn nested_handlers() -> CodeObject {
    const DEPTH: usize = 8;
    let mut asm = Assembler::new();
    for level in 0..DEPTH {
        asm.emit_jump(Opcode::SetupExcept, &format!("h{level}")).unwrap();
        asm.emit(Opcode::LoadGlobal, 0).unwrap();
        asm.emit(Opcode::CallFunction, 0).unwrap();
        asm.emit(Opcode::PopTop, 0).unwrap();
    }
    for level in (0..DEPTH).rev() {
        asm.emit(Opcode::PopBlock, 0).unwrap();
        asm.emit_jump(Opcode::JumpForward, &format!("d{level}")).unwrap();
        asm.define_label(&format!("h{level}")).unwrap();
        asm.emit(Opcode::PopTop, 0).unwrap();
        asm.emit(Opcode::PopTop, 0).unwrap();
        asm.emit(Opcode::PopTop, 0).unwrap();
        asm.emit(Opcode::PopExcept, 0).unwrap();
        asm.emit_jump(Opcode::JumpForward, &format!("d{level}")).unwrap();
        asm.emit(Opcode::EndFinally, 0).unwrap();
        asm.define_label(&format!("d{level}")).unwrap();
    }
    asm.emit(Opcode::LoadConst, 0).unwrap();
    asm.emit(Opcode::ReturnValue, 0).unwrap();
    CodeObject::new("nested", asm.finalize().unwrap(), vec![Constant::None], 0)
}

fn bench_straight_line(c: &mut Criterion) {
    let code = straight_line();
    c.bench_function("absint_straight_line", |b| {
        b.iter(|| black_box(analyse(black_box(&code))));
    });
}

fn bench_counting_loop(c: &mut Criterion) {
    let code = counting_loop();
    c.bench_function("absint_counting_loop", |b| {
        b.iter(|| black_box(analyse(black_box(&code))));
    });
}

fn bench_nested_handlers(c: &mut Criterion) {
    let code = nested_handlers();
    c.bench_function("absint_nested_handlers", |b| {
        b.iter(|| black_box(analyse(black_box(&code))));
    });
}

fn bench_batch(c: &mut Criterion) {
    let codes: Vec<CodeObject> = (0..32)
        .flat_map(|_| [straight_line(), counting_loop(), nested_handlers()])
        .collect();
    c.bench_function("absint_batch_96", |b| {
        b.iter(|| {
            let results = analyze_batch(
                black_box(codes.clone()),
                AnalysisConfig::default(),
                SymbolicBackend::new,
            );
            black_box(results)
        });
    });
}

criterion_group!(
    benches,
    bench_straight_line,
    bench_counting_loop,
    bench_nested_handlers,
    bench_batch
);
criterion_main!(benches);
