use std::fmt;

use crate::ir::program::{AttrValue, Block, Operator, Program, SlotMap, Variable};

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, "program {")?;
        for block in &self.blocks {
            fmt_block(block, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}({}) -> ({})",
            self.id,
            self.op_type,
            format_slots(&self.inputs),
            format_slots(&self.outputs)
        )?;
        if !self.attrs.is_empty() {
            let attrs: Vec<String> = self
                .attrs
                .iter()
                .map(|(name, value)| format!("{name}={}", format_attr(value)))
                .collect();
            write!(f, " {{{}}}", attrs.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(|dim| dim.to_string()).collect();
        write!(f, "{} : {}[{}]", self.name, self.dtype.as_str(), dims.join(", "))?;
        if self.is_persistable() {
            write!(f, " persistable")?;
        }
        Ok(())
    }
}

fn fmt_block(block: &Block, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parent = block
        .parent
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    write_line(f, indent, &format!("block {} (parent {parent}) {{", block.idx))?;
    if !block.vars.is_empty() {
        write_line(f, indent + 1, "vars:")?;
        for var in block.vars.values() {
            write_line(f, indent + 2, &var.to_string())?;
        }
    }
    if !block.ops.is_empty() {
        write_line(f, indent + 1, "ops:")?;
        for op in &block.ops {
            write_line(f, indent + 2, &op.to_string())?;
        }
    }
    write_line(f, indent, "}")
}

fn format_slots(slots: &SlotMap) -> String {
    slots
        .iter()
        .map(|(slot, names)| format!("{slot}=[{}]", names.join(", ")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_attr(value: &AttrValue) -> String {
    match value {
        AttrValue::Bool(v) => v.to_string(),
        AttrValue::Int(v) => v.to_string(),
        AttrValue::Float(v) => v.to_string(),
        AttrValue::Str(v) => format!("{v:?}"),
        AttrValue::Ints(v) => format!("{v:?}"),
        AttrValue::Strs(v) => format!("{v:?}"),
        AttrValue::Block(v) => format!("^{v}"),
        AttrValue::Blocks(v) => {
            let ids: Vec<String> = v.iter().map(|b| format!("^{b}")).collect();
            format!("[{}]", ids.join(", "))
        }
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    f.write_str(line)?;
    f.write_str("\n")
}
