//! Textual IR syntax (spec.md §4.3): "one instruction per line, block
//! labels terminated by a colon, values introduced as `%name`, types
//! always explicit." The round trip is lossless except for post-allocation
//! register assignments, which this format never represents.

use std::fmt::Write as _;

use super::{Arg, Const, Function, Instruction, Op, Type};

pub fn format_function(f: &Function) -> String {
    let mut out = String::new();
    if !f.locals.is_empty() {
        out.push_str("locals:\n");
        for (i, ty) in f.locals.iter().enumerate() {
            let _ = writeln!(out, "  l{i}: {ty}");
        }
    }
    out.push_str("blocks:\n");
    for block in &f.blocks {
        let _ = writeln!(out, "{}:", block.label);
        for instr in &block.instrs {
            let _ = writeln!(out, "  {}", format_instr(instr, f));
        }
    }
    out
}

fn format_instr(instr: &Instruction, f: &Function) -> String {
    let mut s = String::new();
    if let Some((id, ty)) = instr.result {
        let _ = write!(s, "%{id}:{ty} = ");
    }
    s.push_str(instr.op.as_str());
    let args: Vec<String> = instr.arg_iter().map(|a| format_arg(a, f)).collect();
    if !args.is_empty() {
        s.push(' ');
        s.push_str(&args.join(", "));
    }
    s
}

fn format_arg(arg: &Arg, f: &Function) -> String {
    match arg {
        Arg::Const(c) => format!("{}:{}", c.ty(), format_const_bits(c)),
        Arg::Value(id) => format!("%{id}"),
        Arg::Local(id) => format!("local:{id}"),
        Arg::Block(id) => format!("@{}", f.blocks.get(*id as usize).map(|b| b.label.as_str()).unwrap_or("?")),
        Arg::Sym(name) => format!("sym:{name:?}"),
        Arg::Imm(v) => format!("imm:{v}"),
    }
}

fn format_const_bits(c: &Const) -> String {
    match c {
        Const::I8(v) => format!("{v:#04x}"),
        Const::I16(v) => format!("{v:#06x}"),
        Const::I32(v) => format!("{v:#010x}"),
        Const::I64(v) => format!("{v:#018x}"),
        Const::F32(v) => v.to_bits().to_string(),
        Const::F64(v) => v.to_bits().to_string(),
    }
}

fn parse_const_bits(ty: Type, text: &str) -> Option<Const> {
    Some(match ty {
        Type::I8 => Const::I8(parse_int(text)? as u8),
        Type::I16 => Const::I16(parse_int(text)? as u16),
        Type::I32 => Const::I32(parse_int(text)? as u32),
        Type::I64 => Const::I64(parse_int(text)? as u64),
        Type::F32 => Const::F32(f32::from_bits(text.parse().ok()?)),
        Type::F64 => Const::F64(f64::from_bits(text.parse().ok()?)),
        Type::V128 | Type::Str | Type::Block => return None,
    })
}

fn parse_int(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[derive(Debug)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IR parse error: {}", self.0)
    }
}
impl std::error::Error for ParseError {}

pub fn parse_function(text: &str) -> Result<Function, ParseError> {
    let mut f = Function::new();
    let mut lines = text.lines().peekable();
    let mut labels: Vec<String> = Vec::new();

    if lines.peek().map(|l| l.trim() == "locals:").unwrap_or(false) {
        lines.next();
        while let Some(line) = lines.peek() {
            let trimmed = line.trim();
            if trimmed == "blocks:" || trimmed.is_empty() {
                break;
            }
            let line = lines.next().unwrap().trim();
            let (_name, ty_text) = line.split_once(':').ok_or_else(|| ParseError(format!("bad local decl {line:?}")))?;
            let ty = Type::from_str(ty_text.trim()).ok_or_else(|| ParseError(format!("bad local type {ty_text:?}")))?;
            f.alloc_local(ty);
        }
    }

    if lines.peek().map(|l| l.trim() == "blocks:").unwrap_or(false) {
        lines.next();
    }

    // First pass: discover block labels in order so forward branch
    // references resolve.
    let remaining: Vec<&str> = lines.collect();
    for line in &remaining {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('%') && trimmed.ends_with(':') && !trimmed.contains(' ') {
            labels.push(trimmed.trim_end_matches(':').to_string());
        }
    }
    for label in &labels {
        f.push_block(label.clone());
    }

    let mut current: Option<usize> = None;
    let mut max_value_seen: i64 = -1;
    for line in &remaining {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('%') && trimmed.ends_with(':') && !trimmed.contains(' ') {
            let label = trimmed.trim_end_matches(':');
            current = labels.iter().position(|l| l == label);
            continue;
        }
        let block = current.ok_or_else(|| ParseError(format!("instruction outside any block: {trimmed:?}")))?;
        let instr = parse_instr_line(trimmed, &labels, &mut max_value_seen)?;
        if instr.op == Op::Branch {
            if let Some(Arg::Block(t)) = &instr.args[0] {
                f.blocks[block].successors.push(*t as usize);
            }
        } else if instr.op == Op::CondBranch {
            for a in instr.args.iter().skip(1).flatten() {
                if let Arg::Block(t) = a {
                    f.blocks[block].successors.push(*t as usize);
                }
            }
        }
        f.blocks[block].instrs.push(instr);
    }

    if max_value_seen >= 0 {
        f.next_value = max_value_seen as u32 + 1;
    }

    Ok(f)
}

fn parse_instr_line(line: &str, labels: &[String], max_value_seen: &mut i64) -> Result<Instruction, ParseError> {
    let (result, rest) = match line.split_once('=') {
        Some((lhs, rhs)) if lhs.trim_start().starts_with('%') => {
            let lhs = lhs.trim();
            let (id_part, ty_part) = lhs
                .trim_start_matches('%')
                .split_once(':')
                .ok_or_else(|| ParseError(format!("bad result {lhs:?}")))?;
            let id: u32 = id_part.parse().map_err(|_| ParseError(format!("bad value id {id_part:?}")))?;
            let ty = Type::from_str(ty_part).ok_or_else(|| ParseError(format!("bad type {ty_part:?}")))?;
            *max_value_seen = (*max_value_seen).max(id as i64);
            (Some((id, ty)), rhs.trim())
        }
        _ => (None, line),
    };

    let mut parts = rest.splitn(2, ' ');
    let op_text = parts.next().unwrap_or("").trim();
    let op = Op::from_str(op_text).ok_or_else(|| ParseError(format!("unknown op {op_text:?}")))?;
    let args_text = parts.next().unwrap_or("").trim();
    let mut args = Vec::new();
    if !args_text.is_empty() {
        for raw in split_args(args_text) {
            args.push(parse_arg(raw.trim(), labels)?);
        }
    }
    let mut instr = Instruction::new(op, args.drain(..).collect(), result.map(|(id, ty)| (id, ty)));
    instr.ordinal = 0;
    Ok(instr)
}

fn split_args(text: &str) -> Vec<&str> {
    // Arguments are comma-separated; none of our argument forms embed a
    // literal comma, so a straightforward split suffices.
    text.split(',').collect()
}

fn parse_arg(text: &str, labels: &[String]) -> Result<Arg, ParseError> {
    if let Some(rest) = text.strip_prefix('%') {
        let id: u32 = rest.parse().map_err(|_| ParseError(format!("bad value ref {text:?}")))?;
        return Ok(Arg::Value(id));
    }
    if let Some(rest) = text.strip_prefix('@') {
        let idx = labels.iter().position(|l| l == rest).ok_or_else(|| ParseError(format!("unknown block {rest:?}")))?;
        return Ok(Arg::Block(idx as u32));
    }
    if let Some(rest) = text.strip_prefix("local:") {
        let id: u32 = rest.parse().map_err(|_| ParseError(format!("bad local ref {text:?}")))?;
        return Ok(Arg::Local(id));
    }
    if let Some(rest) = text.strip_prefix("sym:") {
        let name = rest.trim_matches('"').to_string();
        return Ok(Arg::Sym(name));
    }
    if let Some(rest) = text.strip_prefix("imm:") {
        let v: i64 = rest.parse().map_err(|_| ParseError(format!("bad imm {text:?}")))?;
        return Ok(Arg::Imm(v));
    }
    if let Some((ty_text, value_text)) = text.split_once(':') {
        if let Some(ty) = Type::from_str(ty_text) {
            let c = parse_const_bits(ty, value_text).ok_or_else(|| ParseError(format!("bad const {text:?}")))?;
            return Ok(Arg::Const(c));
        }
    }
    Err(ParseError(format!("unrecognized argument {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function as F, Op};

    fn sample() -> F {
        let mut f = F::new();
        let entry = f.push_block("entry");
        let a = f.push_block("loop_head");
        let v0 = f.push_instr(entry, Op::Add, vec![Arg::Const(Const::I32(1)), Arg::Const(Const::I32(2))], Some(Type::I32)).unwrap();
        f.push_instr(entry, Op::StoreContext, vec![Arg::Imm(16), Arg::Value(v0)], None);
        f.push_instr(entry, Op::Branch, vec![Arg::Block(a as u32)], None);
        let cmp = f.push_instr(a, Op::CmpEq, vec![Arg::Value(v0), Arg::Const(Const::I32(0))], Some(Type::I8)).unwrap();
        f.push_instr(a, Op::CondBranch, vec![Arg::Value(cmp), Arg::Block(entry as u32), Arg::Block(a as u32)], None);
        f
    }

    #[test]
    fn round_trips_losslessly() {
        let f = sample();
        let text = format_function(&f);
        let parsed = parse_function(&text).expect("parse");
        let text2 = format_function(&parsed);
        assert_eq!(text, text2);
    }

    #[test]
    fn round_trip_preserves_types_and_block_resolution() {
        let f = sample();
        let text = format_function(&f);
        let parsed = parse_function(&text).unwrap();
        assert_eq!(parsed.blocks.len(), f.blocks.len());
        assert_eq!(parsed.blocks[0].successors, f.blocks[0].successors);
        assert_eq!(parsed.blocks[1].successors, f.blocks[1].successors);
        for (pb, ob) in parsed.blocks.iter().zip(f.blocks.iter()) {
            for (pi, oi) in pb.instrs.iter().zip(ob.instrs.iter()) {
                assert_eq!(pi.result.map(|(_, ty)| ty), oi.result.map(|(_, ty)| ty));
                assert_eq!(pi.op, oi.op);
            }
        }
    }
}
