//! Small built-in programs used by the `lpm` binary and the test suites.

use anyhow::{anyhow, bail, Context};

use super::{CodeAddr, Program};
use crate::engine::Reg;
use crate::error::Result;

/// Deterministic entry point that succeeds at once, pushing no choice
/// points.
pub fn succeed_once() -> Result<Program> {
    let mut builder = Program::builder();
    let entry = builder.label("succeed", |m| Ok(m.proceed()));
    builder.entry_point(entry);
    builder.build()
}

/// Entry point that fails without leaving any choice point.
pub fn always_fail() -> Result<Program> {
    let mut builder = Program::builder();
    let entry = builder.label("fail", |m| m.fail());
    builder.entry_point(entry);
    builder.build()
}

/// Nondeterministic generator of `lo..=hi`, one value per solution in `r1`.
pub fn between(lo: usize, hi: usize) -> Result<Program> {
    let mut builder = Program::builder();
    let next = builder.declare("between_next");

    let entry = builder.label("between", move |m| {
        m.mkframe("between", 1, next)?;
        if lo > hi {
            return Ok(CodeAddr::DO_FAIL);
        }
        m.set_framevar(0, lo)?;
        m.set_reg(Reg::R1, lo);
        if lo == hi {
            m.exhaust_frame()?;
        }
        m.succeed()
    });

    builder.define(next, move |m| {
        let current = m.framevar(0)? + 1;
        if current > hi {
            return Ok(CodeAddr::DO_FAIL);
        }
        m.set_framevar(0, current)?;
        m.set_reg(Reg::R1, current);
        if current == hi {
            m.exhaust_frame()?;
        }
        m.succeed()
    });

    builder.entry_point(entry);
    builder.build()
}

/// Select a built-in program by name: `succeed`, `fail` or `between:LO:HI`.
pub fn by_name(name: &str) -> anyhow::Result<Program> {
    match name {
        "succeed" => Ok(succeed_once()?),
        "fail" => Ok(always_fail()?),
        other => {
            let Some(range) = other.strip_prefix("between:") else {
                bail!("unknown program `{}`", other);
            };
            let (lo, hi) = range
                .split_once(':')
                .ok_or_else(|| anyhow!("expected between:LO:HI, got `{}`", other))?;
            let lo = lo.parse().context("invalid lower bound")?;
            let hi = hi.parse().context("invalid upper bound")?;
            Ok(between(lo, hi)?)
        }
    }
}
