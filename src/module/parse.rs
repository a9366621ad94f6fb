// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The binary reader: walks the module sections in order and reports each
//! parse item to the lowering pass as an event with decoded immediates. This
//! is the only place that touches raw module bytes.

use crate::bytecode::Op;
use crate::lower::Lowering;
use crate::module::leb128::LEB128Reader;
use crate::module::{DecodeError, ExportKind, LoaderError, Module, SectionType};
use crate::opcode::{FcOpCode, OpCode};
use crate::ValueType;

pub(crate) const SECTION_ID_CUSTOM: u8 = 0;
pub(crate) const SECTION_ID_TYPE: u8 = 1;
pub(crate) const SECTION_ID_IMPORT: u8 = 2;
pub(crate) const SECTION_ID_FUNCTION: u8 = 3;
pub(crate) const SECTION_ID_TABLE: u8 = 4;
pub(crate) const SECTION_ID_MEMORY: u8 = 5;
pub(crate) const SECTION_ID_GLOBAL: u8 = 6;
pub(crate) const SECTION_ID_EXPORT: u8 = 7;
pub(crate) const SECTION_ID_START: u8 = 8;
pub(crate) const SECTION_ID_ELEMENT: u8 = 9;
pub(crate) const SECTION_ID_CODE: u8 = 10;
pub(crate) const SECTION_ID_DATA: u8 = 11;
pub(crate) const SECTION_ID_DATA_COUNT: u8 = 12;

const FUNC_TYPE_TAG: u8 = 0x60;
const BLOCK_TYPE_EMPTY: u8 = 0x40;

const IMPORT_KIND_FUNC: u8 = 0x00;
const IMPORT_KIND_TABLE: u8 = 0x01;
const IMPORT_KIND_MEMORY: u8 = 0x02;
const IMPORT_KIND_GLOBAL: u8 = 0x03;

pub(crate) fn parse(data: &[u8]) -> Result<Module, LoaderError> {
    if data.len() < 8 || &data[0..4] != b"\0asm" {
        return Err(LoaderError::InvalidMagicNumber);
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version != 1 {
        return Err(LoaderError::InvalidVersion);
    }

    let mut lower = Lowering::new();
    lower.begin_module(version);

    let mut reader = LEB128Reader::new(data, 8);
    let mut imported_functions = 0u32;

    while reader.remaining() > 0 {
        let section_id = reader.load_imm_u8()?;
        let section_len = reader.load_imm_varuint32()? as usize;
        let section_end = reader.position() + section_len;
        let section = SectionType::from_u8(section_id)?;

        match section {
            SectionType::Custom => reader.advance(section_len),
            SectionType::Type => {
                let count = reader.load_imm_varuint32()?;
                for _ in 0..count {
                    let tag = reader.load_imm_u8()?;
                    if tag != FUNC_TYPE_TAG {
                        return Err(DecodeError::InvalidSignature(tag as u32).into());
                    }
                    let params = read_value_types(&mut reader)?;
                    let results = read_value_types(&mut reader)?;
                    lower.on_func_type(params, results);
                }
            }
            SectionType::Import => {
                let count = reader.load_imm_varuint32()?;
                for _ in 0..count {
                    let module_name = reader.load_string()?;
                    let field_name = reader.load_string()?;
                    let kind = reader.load_imm_u8()?;
                    match kind {
                        IMPORT_KIND_FUNC => {
                            let type_index = reader.load_imm_varuint32()?;
                            lower.on_import_func(module_name, field_name, type_index)?;
                            imported_functions += 1;
                        }
                        IMPORT_KIND_TABLE | IMPORT_KIND_MEMORY | IMPORT_KIND_GLOBAL => {
                            return Err(LoaderError::UnsupportedImportKind(kind));
                        }
                        _ => return Err(LoaderError::InvalidImportKind(kind)),
                    }
                }
            }
            SectionType::Function => {
                let count = reader.load_imm_varuint32()?;
                for _ in 0..count {
                    let type_index = reader.load_imm_varuint32()?;
                    lower.on_function(type_index)?;
                }
            }
            SectionType::Export => {
                let count = reader.load_imm_varuint32()?;
                for _ in 0..count {
                    let name = reader.load_string()?;
                    let kind = ExportKind::from_u8(reader.load_imm_u8()?)?;
                    let index = reader.load_imm_varuint32()?;
                    lower.on_export(kind, name, index)?;
                }
            }
            SectionType::Start => {
                let func_index = reader.load_imm_varuint32()?;
                lower.on_start(func_index)?;
            }
            SectionType::Code => {
                let count = reader.load_imm_varuint32()?;
                for body in 0..count {
                    let body_size = reader.load_imm_varuint32()? as usize;
                    let body_end = reader.position() + body_size;
                    lower.begin_body(imported_functions + body)?;

                    let decl_count = reader.load_imm_varuint32()?;
                    for _ in 0..decl_count {
                        let run_length = reader.load_imm_varuint32()?;
                        let ty = read_value_type(&mut reader)?;
                        lower.on_local_decl(run_length, ty);
                    }

                    while reader.position() < body_end {
                        parse_instruction(&mut reader, &mut lower)?;
                    }
                    if reader.position() != body_end {
                        return Err(DecodeError::FailedToDecode(format!(
                            "function body {body} overran its size"
                        ))
                        .into());
                    }
                    lower.end_body()?;
                }
            }
            SectionType::Table
            | SectionType::Memory
            | SectionType::Global
            | SectionType::Element
            | SectionType::Data
            | SectionType::DataCount => {
                return Err(LoaderError::UnsupportedSectionType(section));
            }
        }

        if reader.position() != section_end {
            return Err(DecodeError::FailedToDecode(format!(
                "section {section:?} size mismatch"
            ))
            .into());
        }
    }

    Ok(lower.finish())
}

fn read_value_type(reader: &mut LEB128Reader) -> Result<ValueType, DecodeError> {
    let byte = reader.load_imm_u8()?;
    ValueType::from_byte(byte).ok_or(DecodeError::InvalidSignature(byte as u32))
}

fn read_value_types(reader: &mut LEB128Reader) -> Result<Vec<ValueType>, DecodeError> {
    let count = reader.load_imm_varuint32()? as usize;
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        types.push(read_value_type(reader)?);
    }
    Ok(types)
}

/// Block signatures are either empty or a single value type; the multi-value
/// type-index form is outside this engine's scope.
fn read_block_type(reader: &mut LEB128Reader) -> Result<Option<ValueType>, DecodeError> {
    let byte = reader.load_imm_u8()?;
    if byte == BLOCK_TYPE_EMPTY {
        return Ok(None);
    }
    ValueType::from_byte(byte)
        .map(Some)
        .ok_or(DecodeError::InvalidSignature(byte as u32))
}

fn parse_instruction(
    reader: &mut LEB128Reader,
    lower: &mut Lowering,
) -> Result<(), DecodeError> {
    let byte = reader.load_imm_u8()?;
    let opcode = OpCode::from_repr(byte).ok_or(DecodeError::InvalidOpcode(byte))?;

    match opcode {
        OpCode::Nop => lower.on_nop(),
        OpCode::Block => {
            let block_type = read_block_type(reader)?;
            lower.on_block(block_type);
        }
        OpCode::Loop => {
            let block_type = read_block_type(reader)?;
            lower.on_loop(block_type);
        }
        OpCode::If => {
            let block_type = read_block_type(reader)?;
            lower.on_if(block_type);
        }
        OpCode::Else => lower.on_else()?,
        OpCode::End => lower.on_end(),
        OpCode::Br => {
            let depth = reader.load_imm_varuint32()?;
            lower.on_br(depth)?;
        }
        OpCode::BrIf => {
            let depth = reader.load_imm_varuint32()?;
            lower.on_br_if(depth)?;
        }
        OpCode::Return => lower.on_return(),
        OpCode::Call => {
            let func_index = reader.load_imm_varuint32()?;
            lower.on_call(func_index)?;
        }
        OpCode::Drop => lower.on_drop(),
        OpCode::GetLocal => {
            let index = reader.load_imm_varuint32()?;
            lower.on_local_get(index)?;
        }
        OpCode::SetLocal => {
            let index = reader.load_imm_varuint32()?;
            lower.on_local_set(index)?;
        }

        OpCode::I32Const => {
            let value = reader.load_imm_varint32()?;
            lower.on_i32_const(value);
        }
        OpCode::I64Const => {
            let value = reader.load_imm_varint64()?;
            lower.on_i64_const(value);
        }
        OpCode::F32Const => {
            let value = reader.load_imm_f32()?;
            lower.on_f32_const(value.to_bits());
        }
        OpCode::F64Const => {
            let value = reader.load_imm_f64()?;
            lower.on_f64_const(value.to_bits());
        }

        OpCode::I32Eqz => lower.on_unary(Op::I32Eqz),
        OpCode::I32Eq => lower.on_binary(Op::I32Eq),
        OpCode::I32Ne => lower.on_binary(Op::I32Ne),
        OpCode::I32LtS => lower.on_binary(Op::I32LtS),
        OpCode::I32LtU => lower.on_binary(Op::I32LtU),
        OpCode::I32GtS => lower.on_binary(Op::I32GtS),
        OpCode::I32GtU => lower.on_binary(Op::I32GtU),
        OpCode::I32LeS => lower.on_binary(Op::I32LeS),
        OpCode::I32LeU => lower.on_binary(Op::I32LeU),
        OpCode::I32GeS => lower.on_binary(Op::I32GeS),
        OpCode::I32GeU => lower.on_binary(Op::I32GeU),

        OpCode::I64Eqz => lower.on_unary(Op::I64Eqz),
        OpCode::I64Eq => lower.on_binary(Op::I64Eq),
        OpCode::I64Ne => lower.on_binary(Op::I64Ne),
        OpCode::I64LtS => lower.on_binary(Op::I64LtS),
        OpCode::I64LtU => lower.on_binary(Op::I64LtU),
        OpCode::I64GtS => lower.on_binary(Op::I64GtS),
        OpCode::I64GtU => lower.on_binary(Op::I64GtU),
        OpCode::I64LeS => lower.on_binary(Op::I64LeS),
        OpCode::I64LeU => lower.on_binary(Op::I64LeU),
        OpCode::I64GeS => lower.on_binary(Op::I64GeS),
        OpCode::I64GeU => lower.on_binary(Op::I64GeU),

        OpCode::F32Eq => lower.on_binary(Op::F32Eq),
        OpCode::F32Ne => lower.on_binary(Op::F32Ne),
        OpCode::F32Lt => lower.on_binary(Op::F32Lt),
        OpCode::F32Gt => lower.on_binary(Op::F32Gt),
        OpCode::F32Le => lower.on_binary(Op::F32Le),
        OpCode::F32Ge => lower.on_binary(Op::F32Ge),

        OpCode::F64Eq => lower.on_binary(Op::F64Eq),
        OpCode::F64Ne => lower.on_binary(Op::F64Ne),
        OpCode::F64Lt => lower.on_binary(Op::F64Lt),
        OpCode::F64Gt => lower.on_binary(Op::F64Gt),
        OpCode::F64Le => lower.on_binary(Op::F64Le),
        OpCode::F64Ge => lower.on_binary(Op::F64Ge),

        OpCode::I32Clz => lower.on_unary(Op::I32Clz),
        OpCode::I32Ctz => lower.on_unary(Op::I32Ctz),
        OpCode::I32Popcnt => lower.on_unary(Op::I32Popcnt),
        OpCode::I32Add => lower.on_binary(Op::I32Add),
        OpCode::I32Sub => lower.on_binary(Op::I32Sub),
        OpCode::I32Mul => lower.on_binary(Op::I32Mul),
        OpCode::I32DivS => lower.on_binary(Op::I32DivS),
        OpCode::I32DivU => lower.on_binary(Op::I32DivU),
        OpCode::I32RemS => lower.on_binary(Op::I32RemS),
        OpCode::I32RemU => lower.on_binary(Op::I32RemU),
        OpCode::I32And => lower.on_binary(Op::I32And),
        OpCode::I32Or => lower.on_binary(Op::I32Or),
        OpCode::I32Xor => lower.on_binary(Op::I32Xor),
        OpCode::I32Shl => lower.on_binary(Op::I32Shl),
        OpCode::I32ShrS => lower.on_binary(Op::I32ShrS),
        OpCode::I32ShrU => lower.on_binary(Op::I32ShrU),
        OpCode::I32Rotl => lower.on_binary(Op::I32Rotl),
        OpCode::I32Rotr => lower.on_binary(Op::I32Rotr),

        OpCode::I64Clz => lower.on_unary(Op::I64Clz),
        OpCode::I64Ctz => lower.on_unary(Op::I64Ctz),
        OpCode::I64Popcnt => lower.on_unary(Op::I64Popcnt),
        OpCode::I64Add => lower.on_binary(Op::I64Add),
        OpCode::I64Sub => lower.on_binary(Op::I64Sub),
        OpCode::I64Mul => lower.on_binary(Op::I64Mul),
        OpCode::I64DivS => lower.on_binary(Op::I64DivS),
        OpCode::I64DivU => lower.on_binary(Op::I64DivU),
        OpCode::I64RemS => lower.on_binary(Op::I64RemS),
        OpCode::I64RemU => lower.on_binary(Op::I64RemU),
        OpCode::I64And => lower.on_binary(Op::I64And),
        OpCode::I64Or => lower.on_binary(Op::I64Or),
        OpCode::I64Xor => lower.on_binary(Op::I64Xor),
        OpCode::I64Shl => lower.on_binary(Op::I64Shl),
        OpCode::I64ShrS => lower.on_binary(Op::I64ShrS),
        OpCode::I64ShrU => lower.on_binary(Op::I64ShrU),
        OpCode::I64Rotl => lower.on_binary(Op::I64Rotl),
        OpCode::I64Rotr => lower.on_binary(Op::I64Rotr),

        OpCode::F32Abs => lower.on_unary(Op::F32Abs),
        OpCode::F32Neg => lower.on_unary(Op::F32Neg),
        OpCode::F32Ceil => lower.on_unary(Op::F32Ceil),
        OpCode::F32Floor => lower.on_unary(Op::F32Floor),
        OpCode::F32Trunc => lower.on_unary(Op::F32Trunc),
        OpCode::F32Nearest => lower.on_unary(Op::F32Nearest),
        OpCode::F32Sqrt => lower.on_unary(Op::F32Sqrt),
        OpCode::F32Add => lower.on_binary(Op::F32Add),
        OpCode::F32Sub => lower.on_binary(Op::F32Sub),
        OpCode::F32Mul => lower.on_binary(Op::F32Mul),
        OpCode::F32Div => lower.on_binary(Op::F32Div),
        OpCode::F32Min => lower.on_binary(Op::F32Min),
        OpCode::F32Max => lower.on_binary(Op::F32Max),
        OpCode::F32Copysign => lower.on_binary(Op::F32Copysign),

        OpCode::F64Abs => lower.on_unary(Op::F64Abs),
        OpCode::F64Neg => lower.on_unary(Op::F64Neg),
        OpCode::F64Ceil => lower.on_unary(Op::F64Ceil),
        OpCode::F64Floor => lower.on_unary(Op::F64Floor),
        OpCode::F64Trunc => lower.on_unary(Op::F64Trunc),
        OpCode::F64Nearest => lower.on_unary(Op::F64Nearest),
        OpCode::F64Sqrt => lower.on_unary(Op::F64Sqrt),
        OpCode::F64Add => lower.on_binary(Op::F64Add),
        OpCode::F64Sub => lower.on_binary(Op::F64Sub),
        OpCode::F64Mul => lower.on_binary(Op::F64Mul),
        OpCode::F64Div => lower.on_binary(Op::F64Div),
        OpCode::F64Min => lower.on_binary(Op::F64Min),
        OpCode::F64Max => lower.on_binary(Op::F64Max),
        OpCode::F64Copysign => lower.on_binary(Op::F64Copysign),

        OpCode::I32WrapI64 => lower.on_unary(Op::I32WrapI64),
        OpCode::I32TruncF32S => lower.on_unary(Op::I32TruncF32S),
        OpCode::I32TruncF32U => lower.on_unary(Op::I32TruncF32U),
        OpCode::I32TruncF64S => lower.on_unary(Op::I32TruncF64S),
        OpCode::I32TruncF64U => lower.on_unary(Op::I32TruncF64U),
        OpCode::I64ExtendI32S => lower.on_unary(Op::I64ExtendI32S),
        OpCode::I64ExtendI32U => lower.on_unary(Op::I64ExtendI32U),
        OpCode::I64TruncF32S => lower.on_unary(Op::I64TruncF32S),
        OpCode::I64TruncF32U => lower.on_unary(Op::I64TruncF32U),
        OpCode::I64TruncF64S => lower.on_unary(Op::I64TruncF64S),
        OpCode::I64TruncF64U => lower.on_unary(Op::I64TruncF64U),

        OpCode::F32ConvertI32S => lower.on_unary(Op::F32ConvertI32S),
        OpCode::F32ConvertI32U => lower.on_unary(Op::F32ConvertI32U),
        OpCode::F32ConvertI64S => lower.on_unary(Op::F32ConvertI64S),
        OpCode::F32ConvertI64U => lower.on_unary(Op::F32ConvertI64U),
        OpCode::F32DemoteF64 => lower.on_unary(Op::F32DemoteF64),
        OpCode::F64ConvertI32S => lower.on_unary(Op::F64ConvertI32S),
        OpCode::F64ConvertI32U => lower.on_unary(Op::F64ConvertI32U),
        OpCode::F64ConvertI64S => lower.on_unary(Op::F64ConvertI64S),
        OpCode::F64ConvertI64U => lower.on_unary(Op::F64ConvertI64U),
        OpCode::F64PromoteF32 => lower.on_unary(Op::F64PromoteF32),

        OpCode::I32ReinterpretF32 => lower.on_unary(Op::I32ReinterpretF32),
        OpCode::I64ReinterpretF64 => lower.on_unary(Op::I64ReinterpretF64),
        OpCode::F32ReinterpretI32 => lower.on_unary(Op::F32ReinterpretI32),
        OpCode::F64ReinterpretI64 => lower.on_unary(Op::F64ReinterpretI64),

        OpCode::I32Extend8S => lower.on_unary(Op::I32Extend8S),
        OpCode::I32Extend16S => lower.on_unary(Op::I32Extend16S),
        OpCode::I64Extend8S => lower.on_unary(Op::I64Extend8S),
        OpCode::I64Extend16S => lower.on_unary(Op::I64Extend16S),
        OpCode::I64Extend32S => lower.on_unary(Op::I64Extend32S),

        OpCode::FCExtension => {
            let subopcode = reader.load_imm_varuint32()?;
            let fc = u8::try_from(subopcode)
                .ok()
                .and_then(FcOpCode::from_repr)
                .ok_or_else(|| {
                    DecodeError::UnsupportedOpcode(
                        byte,
                        format!("0xFC subopcode {subopcode} not supported"),
                    )
                })?;
            let op = match fc {
                FcOpCode::I32TruncSatF32S => Op::I32TruncSatF32S,
                FcOpCode::I32TruncSatF32U => Op::I32TruncSatF32U,
                FcOpCode::I32TruncSatF64S => Op::I32TruncSatF64S,
                FcOpCode::I32TruncSatF64U => Op::I32TruncSatF64U,
                FcOpCode::I64TruncSatF32S => Op::I64TruncSatF32S,
                FcOpCode::I64TruncSatF32U => Op::I64TruncSatF32U,
                FcOpCode::I64TruncSatF64S => Op::I64TruncSatF64S,
                FcOpCode::I64TruncSatF64U => Op::I64TruncSatF64U,
            };
            lower.on_unary(op);
        }

        OpCode::Unreachable | OpCode::BrTable | OpCode::Select | OpCode::SelectT => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "control instruction not supported".to_string(),
            ));
        }
        OpCode::CallIndirect => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "indirect calls not supported".to_string(),
            ));
        }
        OpCode::Tee | OpCode::GetGlobal | OpCode::SetGlobal => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "globals and local.tee not supported".to_string(),
            ));
        }
        OpCode::LoadI32
        | OpCode::LoadI64
        | OpCode::LoadF32
        | OpCode::LoadF64
        | OpCode::Load8Se
        | OpCode::Load8Ze
        | OpCode::Load16Se
        | OpCode::Load16Ze
        | OpCode::Load8I64Se
        | OpCode::Load8I64Ze
        | OpCode::Load16I64Se
        | OpCode::Load16I64Ze
        | OpCode::Load32I64Se
        | OpCode::Load32I64Ze
        | OpCode::StoreI32
        | OpCode::StoreI64
        | OpCode::StoreF32
        | OpCode::StoreF64
        | OpCode::Store8_32
        | OpCode::Store16_32
        | OpCode::Store8_64
        | OpCode::Store16_64
        | OpCode::Store32_64
        | OpCode::CurrentMemorySize
        | OpCode::GrowMemory => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "memory instructions not supported".to_string(),
            ));
        }
        OpCode::SIMDExtension => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "SIMD proposal not supported".to_string(),
            ));
        }
        OpCode::ThreadsExtension => {
            return Err(DecodeError::UnsupportedOpcode(
                byte,
                "threads proposal not supported".to_string(),
            ));
        }
    }

    Ok(())
}
