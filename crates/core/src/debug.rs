//! Chunk disassembler. Renders to strings so the REPL, the `--print-code`
//! flag, and tests can all consume the same output.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::object::print_value;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

fn simple_instruction(name: &str, offset: usize) -> (String, usize) {
    (name.to_string(), offset + 1)
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let operand = chunk.code[offset + 1];
    (format!("{:<16} {:4}", name, operand), offset + 2)
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    (
        format!(
            "{:<16} {:4} '{}'",
            name,
            constant,
            print_value(chunk.constants[constant])
        ),
        offset + 2,
    )
}

fn jump_instruction(name: &str, sign: i64, chunk: &Chunk, offset: usize) -> (String, usize) {
    let jump = (chunk.code[offset + 1] as u16) << 8 | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    (
        format!("{:<16} {:04} -> {:04}", name, offset, target),
        offset + 3,
    )
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    (
        format!(
            "{:<16} {:4} '{}' ({} args)",
            name,
            constant,
            print_value(chunk.constants[constant]),
            arg_count
        ),
        offset + 3,
    )
}

fn closure_instruction(chunk: &Chunk, mut offset: usize) -> (String, usize) {
    offset += 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    let mut out = String::new();
    let _ = write!(
        out,
        "{:<16} {:4} {}",
        "OP_CLOSURE",
        constant,
        print_value(chunk.constants[constant])
    );
    let function = chunk.constants[constant].as_function();
    for _ in 0..function.upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        offset += 2;
        let _ = write!(
            out,
            "\n{:04}      |                     {} {}",
            offset - 2,
            if is_local != 0 { "local  " } else { "upvalue" },
            index
        );
    }
    (out, offset)
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut prefix = format!("{:04} ", offset);
    if offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1) {
        prefix.push_str("   | ");
    } else {
        prefix.push_str(&format!("{:4} ", chunk.get_line(offset)));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        return (
            format!("{}Unknown opcode 0x{:02x}", prefix, chunk.code[offset]),
            offset + 1,
        );
    };

    let (body, next) = match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Duplicate => byte_instruction("OP_DUPLICATE", chunk, offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::PopN => byte_instruction("OP_POPN", chunk, offset),

        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::GetStl => constant_instruction("OP_GET_STL", chunk, offset),

        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),

        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),

        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),

        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::PrintExpr => simple_instruction("OP_PRINT_EXPR", offset),

        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),

        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),

        OpCode::TryCall => simple_instruction("OP_TRY_CALL", offset),
        OpCode::Throw => simple_instruction("OP_THROW", offset),

        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset),
        OpCode::StaticMethod => constant_instruction("OP_STATIC_METHOD", chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset),
        OpCode::InheritMultiple => simple_instruction("OP_INHERIT_MULTIPLE", offset),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
    };

    (format!("{}{}", prefix, body), next)
}
