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

//! The single linear lowering pass. The binary reader feeds it one event per
//! parse item; it populates the module IR, assigns frame offsets to
//! parameters and locals, emits the internal bytecode, resolves branches
//! through a control stack of open blocks, and computes each body's maximum
//! operand-stack depth.

use crate::bytecode::{CodeBuf, Op};
use crate::module::{
    DecodeError, ExportKind, FuncType, Module, ModuleExport, ModuleFunction, ModuleImport,
};
use crate::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    IfElse,
}

/// An open block while its body is being lowered. `position` is the offset
/// of the opening `JumpIfFalse` for an if/else, and the header offset for a
/// loop or block. Forward branches out of the block park their record
/// offsets in `pending_branches` until the block's end is known.
struct BlockInfo {
    kind: BlockKind,
    return_type: Option<ValueType>,
    position: usize,
    else_position: Option<usize>,
    pending_branches: Vec<usize>,
}

impl BlockInfo {
    fn new(kind: BlockKind, return_type: Option<ValueType>, position: usize) -> Self {
        BlockInfo {
            kind,
            return_type,
            position,
            else_position: None,
            pending_branches: vec![],
        }
    }
}

pub(crate) struct Lowering {
    module: Module,
    // Per-body state, valid between begin_body and end_body.
    cur_func: usize,
    stack_so_far: u32,
    last_result_size: u32,
    blocks: Vec<BlockInfo>,
}

impl Lowering {
    pub(crate) fn new() -> Self {
        Lowering {
            module: Module {
                version: 0,
                types: vec![],
                functions: vec![],
                imports: vec![],
                exports: vec![],
                start: None,
            },
            cur_func: 0,
            stack_so_far: 0,
            last_result_size: 0,
            blocks: vec![],
        }
    }

    pub(crate) fn finish(self) -> Module {
        self.module
    }

    // Section-level events.

    pub(crate) fn begin_module(&mut self, version: u32) {
        self.module.version = version;
    }

    pub(crate) fn on_func_type(&mut self, params: Vec<ValueType>, results: Vec<ValueType>) {
        self.module.types.push(FuncType::new(params, results));
    }

    pub(crate) fn on_import_func(
        &mut self,
        module: String,
        field: String,
        type_index: u32,
    ) -> Result<(), DecodeError> {
        self.check_type_index(type_index)?;
        self.module.functions.push(ModuleFunction::new(type_index));
        self.module.imports.push(ModuleImport {
            module,
            field,
            type_index,
        });
        Ok(())
    }

    pub(crate) fn on_function(&mut self, type_index: u32) -> Result<(), DecodeError> {
        self.check_type_index(type_index)?;
        self.module.functions.push(ModuleFunction::new(type_index));
        Ok(())
    }

    pub(crate) fn on_export(
        &mut self,
        kind: ExportKind,
        name: String,
        index: u32,
    ) -> Result<(), DecodeError> {
        if kind == ExportKind::Function {
            self.check_function_index(index)?;
        }
        self.module.exports.push(ModuleExport { name, kind, index });
        Ok(())
    }

    pub(crate) fn on_start(&mut self, func_index: u32) -> Result<(), DecodeError> {
        self.check_function_index(func_index)?;
        self.module.start = Some(func_index);
        Ok(())
    }

    // Body-level events.

    pub(crate) fn begin_body(&mut self, func_index: u32) -> Result<(), DecodeError> {
        self.check_function_index(func_index)?;
        self.cur_func = func_index as usize;
        self.stack_so_far = self.cur_type().param_stack_size();
        self.last_result_size = 0;
        self.blocks.clear();
        let func = &mut self.module.functions[self.cur_func];
        func.required_stack_size = self.stack_so_far;
        Ok(())
    }

    pub(crate) fn on_local_decl(&mut self, count: u32, ty: ValueType) {
        let size = ty.stack_size();
        let func = &mut self.module.functions[self.cur_func];
        for _ in 0..count {
            func.locals.push(ty);
            func.required_stack_size_due_to_local += size;
            self.stack_so_far += size;
        }
        if self.stack_so_far > func.required_stack_size {
            func.required_stack_size = self.stack_so_far;
        }
    }

    pub(crate) fn end_body(&mut self) -> Result<(), DecodeError> {
        if !self.blocks.is_empty() {
            return Err(DecodeError::MismatchedBlockStack);
        }
        Ok(())
    }

    pub(crate) fn on_nop(&mut self) {}

    pub(crate) fn on_i32_const(&mut self, value: i32) {
        let code = self.code();
        code.emit_op(Op::I32Const);
        code.emit_u32(value as u32);
        self.tick(0, 4);
        self.last_result_size = 4;
    }

    pub(crate) fn on_i64_const(&mut self, value: i64) {
        let code = self.code();
        code.emit_op(Op::I64Const);
        code.emit_u64(value as u64);
        self.tick(0, 8);
        self.last_result_size = 8;
    }

    pub(crate) fn on_f32_const(&mut self, bits: u32) {
        let code = self.code();
        code.emit_op(Op::F32Const);
        code.emit_u32(bits);
        self.tick(0, 4);
        self.last_result_size = 4;
    }

    pub(crate) fn on_f64_const(&mut self, bits: u64) {
        let code = self.code();
        code.emit_op(Op::F64Const);
        code.emit_u64(bits);
        self.tick(0, 8);
        self.last_result_size = 8;
    }

    pub(crate) fn on_local_get(&mut self, index: u32) -> Result<(), DecodeError> {
        let (offset, size) = self.resolve_local(index)?;
        let code = self.code();
        code.emit_op(Op::LocalGet);
        code.emit_u32(offset);
        code.emit_u32(size);
        self.tick(0, size);
        self.last_result_size = size;
        Ok(())
    }

    pub(crate) fn on_local_set(&mut self, index: u32) -> Result<(), DecodeError> {
        let (offset, size) = self.resolve_local(index)?;
        let code = self.code();
        code.emit_op(Op::LocalSet);
        code.emit_u32(offset);
        code.emit_u32(size);
        self.tick(size, 0);
        self.last_result_size = size;
        Ok(())
    }

    pub(crate) fn on_drop(&mut self) {
        let size = self.last_result_size;
        self.emit_drop(size);
        self.tick(size, 0);
        self.last_result_size = 0;
    }

    pub(crate) fn on_binary(&mut self, op: Op) {
        self.emit_numeric(op);
    }

    pub(crate) fn on_unary(&mut self, op: Op) {
        self.emit_numeric(op);
    }

    pub(crate) fn on_call(&mut self, func_index: u32) -> Result<(), DecodeError> {
        self.check_function_index(func_index)?;
        let ft = self.module.type_of_function(func_index);
        let (param_size, result_size) = (ft.param_stack_size(), ft.result_stack_size());
        let code = self.code();
        code.emit_op(Op::Call);
        code.emit_u32(func_index);
        self.tick(param_size, result_size);
        self.last_result_size = result_size;
        Ok(())
    }

    pub(crate) fn on_block(&mut self, return_type: Option<ValueType>) {
        let position = self.code().len();
        self.blocks
            .push(BlockInfo::new(BlockKind::Block, return_type, position));
    }

    pub(crate) fn on_loop(&mut self, return_type: Option<ValueType>) {
        let position = self.code().len();
        self.blocks
            .push(BlockInfo::new(BlockKind::Loop, return_type, position));
    }

    pub(crate) fn on_if(&mut self, return_type: Option<ValueType>) {
        // The condition is consumed here.
        self.tick(4, 0);
        let position = self.code().len();
        self.blocks
            .push(BlockInfo::new(BlockKind::IfElse, return_type, position));
        self.emit_branch(Op::JumpIfFalse, 0);
    }

    pub(crate) fn on_else(&mut self) -> Result<(), DecodeError> {
        // The then-branch skips over the else-branch.
        self.emit_branch(Op::Jump, 0);
        let here = self.code().len();
        let block = match self.blocks.last_mut() {
            Some(b) if b.kind == BlockKind::IfElse && b.else_position.is_none() => b,
            _ => return Err(DecodeError::MismatchedBlockStack),
        };
        block.else_position = Some(here);
        let position = block.position;
        let offset = (here - position) as i32;
        self.code().patch_branch(position, offset);
        Ok(())
    }

    pub(crate) fn on_br(&mut self, depth: u32) -> Result<(), DecodeError> {
        let target = self.branch_target(depth)?;
        let drop_size = self.branch_drop_size(target);
        if drop_size > 0 {
            self.emit_drop(drop_size);
            self.tick(drop_size, 0);
        }
        self.emit_branch_to(Op::Jump, target);
        Ok(())
    }

    pub(crate) fn on_br_if(&mut self, depth: u32) -> Result<(), DecodeError> {
        let target = self.branch_target(depth)?;
        // The condition is consumed either way.
        self.tick(4, 0);
        let drop_size = self.branch_drop_size(target);
        if drop_size == 0 {
            self.emit_branch_to(Op::JumpIfTrue, target);
        } else {
            // Drop only when the branch is taken: fall through past the
            // drop-and-jump pair when the condition is false.
            let fallthrough = self.emit_branch(Op::JumpIfFalse, 0);
            self.emit_drop(drop_size);
            self.emit_branch_to(Op::Jump, target);
            let here = self.code().len();
            self.code()
                .patch_branch(fallthrough, (here - fallthrough) as i32);
        }
        Ok(())
    }

    pub(crate) fn on_end(&mut self) {
        match self.blocks.pop() {
            Some(block) => {
                self.last_result_size = block.return_type.map_or(0, ValueType::stack_size);
                let here = self.code().len();
                if block.kind == BlockKind::IfElse {
                    match block.else_position {
                        Some(else_position) => {
                            // The then-branch's skip jump sits just before
                            // the else-branch's first record.
                            let jump_at = else_position - Op::Jump.size();
                            self.code().patch_branch(jump_at, (here - jump_at) as i32);
                        }
                        None => {
                            let position = block.position;
                            self.code().patch_branch(position, (here - position) as i32);
                        }
                    }
                }
                for at in block.pending_branches {
                    self.code().patch_branch(at, (here - at) as i32);
                }
            }
            None => {
                // The body's own end.
                self.code().emit_op(Op::End);
            }
        }
    }

    pub(crate) fn on_return(&mut self) {
        // Results are already on top of the operand stack; End returns from
        // the activation and the caller reads them relative to sp.
        self.code().emit_op(Op::End);
    }

    // Internals.

    /// Account one record's operand traffic. Operands leave the stack before
    /// the result lands, so the shrink applies first; the running depth's
    /// high-water mark is the body's required stack size.
    fn tick(&mut self, shrink: u32, grow: u32) {
        self.stack_so_far = self.stack_so_far.saturating_sub(shrink) + grow;
        let func = &mut self.module.functions[self.cur_func];
        if self.stack_so_far > func.required_stack_size {
            func.required_stack_size = self.stack_so_far;
        }
    }

    fn emit_numeric(&mut self, op: Op) {
        self.code().emit_op(op);
        self.tick(op.stack_shrink(), op.stack_grow());
        self.last_result_size = op.stack_grow();
    }

    fn emit_drop(&mut self, size: u32) {
        let code = self.code();
        code.emit_op(Op::Drop);
        code.emit_u32(size);
    }

    /// Emit a branch record, returning its offset in the buffer.
    fn emit_branch(&mut self, op: Op, offset: i32) -> usize {
        let code = self.code();
        let at = code.len();
        code.emit_op(op);
        code.emit_i32(offset);
        at
    }

    /// Emit a branch to the block at `target`: loops take an immediate
    /// backward offset to the header, everything else parks a forward
    /// placeholder to be patched when the block ends.
    fn emit_branch_to(&mut self, op: Op, target: usize) {
        if self.blocks[target].kind == BlockKind::Loop {
            let header = self.blocks[target].position;
            let at = self.code().len();
            self.emit_branch(op, header as i32 - at as i32);
        } else {
            let at = self.emit_branch(op, 0);
            self.blocks[target].pending_branches.push(at);
        }
    }

    fn branch_target(&self, depth: u32) -> Result<usize, DecodeError> {
        self.blocks
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(DecodeError::MismatchedBlockStack)
    }

    /// Bytes of intervening blocks' declared results discarded before a
    /// branch past them.
    fn branch_drop_size(&self, target: usize) -> u32 {
        self.blocks[target + 1..]
            .iter()
            .filter_map(|b| b.return_type)
            .map(ValueType::stack_size)
            .sum()
    }

    fn resolve_local(&self, index: u32) -> Result<(u32, u32), DecodeError> {
        let ft = self.cur_type();
        let params = ft.params();
        if (index as usize) < params.len() {
            let offset = params[..index as usize]
                .iter()
                .map(|t| t.stack_size())
                .sum();
            return Ok((offset, params[index as usize].stack_size()));
        }
        let local_index = index as usize - params.len();
        let locals = &self.module.functions[self.cur_func].locals;
        if local_index >= locals.len() {
            return Err(DecodeError::IndexOutOfRange(format!("local {index}")));
        }
        let offset = ft.param_stack_size()
            + locals[..local_index]
                .iter()
                .map(|t| t.stack_size())
                .sum::<u32>();
        Ok((offset, locals[local_index].stack_size()))
    }

    fn cur_type(&self) -> &FuncType {
        &self.module.types[self.module.functions[self.cur_func].type_index as usize]
    }

    fn code(&mut self) -> &mut CodeBuf {
        &mut self.module.functions[self.cur_func].code
    }

    fn check_type_index(&self, index: u32) -> Result<(), DecodeError> {
        if index as usize >= self.module.types.len() {
            return Err(DecodeError::IndexOutOfRange(format!("type {index}")));
        }
        Ok(())
    }

    fn check_function_index(&self, index: u32) -> Result<(), DecodeError> {
        if index as usize >= self.module.functions.len() {
            return Err(DecodeError::IndexOutOfRange(format!("function {index}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType::{I32, I64};

    fn one_function(params: Vec<ValueType>, results: Vec<ValueType>) -> Lowering {
        let mut lower = Lowering::new();
        lower.begin_module(1);
        lower.on_func_type(params, results);
        lower.on_function(0).unwrap();
        lower.begin_body(0).unwrap();
        lower
    }

    /// Every branch in every body must land on the first byte of a record.
    fn assert_branch_targets_on_record_boundaries(module: &Module) {
        for index in 0..module.function_count() {
            let code = module.function(index).code();
            let starts: Vec<usize> = code.records().map(|(at, _)| at).collect();
            for (at, op) in code.records() {
                if matches!(op, Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse) {
                    let target = (at as i64 + code.read_i32(at + 1) as i64) as usize;
                    assert!(
                        starts.contains(&target),
                        "branch at {at} lands inside a record (target {target})"
                    );
                }
            }
        }
    }

    #[test]
    fn add_function_lowering() {
        let mut lower = one_function(vec![I32, I32], vec![I32]);
        lower.on_local_get(0).unwrap();
        lower.on_local_get(1).unwrap();
        lower.on_binary(Op::I32Add);
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let func = module.function(0);
        let code = func.code();
        let records: Vec<_> = code.records().collect();
        assert_eq!(
            records,
            vec![
                (0, Op::LocalGet),
                (9, Op::LocalGet),
                (18, Op::I32Add),
                (19, Op::End)
            ]
        );
        // First parameter at offset 0, second at 4, both 4 bytes wide.
        assert_eq!((code.read_u32(1), code.read_u32(5)), (0, 4));
        assert_eq!((code.read_u32(10), code.read_u32(14)), (4, 4));
        // 8 bytes of parameters plus the two operands of the add.
        assert_eq!(func.required_stack_size(), 16);
        assert_eq!(func.required_stack_size_due_to_local(), 0);
    }

    #[test]
    fn local_declarations_raise_the_stack_floor() {
        let mut lower = one_function(vec![I64], vec![]);
        lower.on_local_decl(2, I32);
        lower.on_i64_const(0);
        lower.on_drop();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let func = module.function(0);
        assert_eq!(func.required_stack_size_due_to_local(), 8);
        // 8 (param) + 8 (locals) + 8 (the constant).
        assert_eq!(func.required_stack_size(), 24);
        assert!(
            func.required_stack_size()
                >= module.type_of_function(0).param_stack_size()
                    + func.required_stack_size_due_to_local()
        );
    }

    #[test]
    fn locals_resolve_after_parameters() {
        let mut lower = one_function(vec![I32, I64], vec![]);
        lower.on_local_decl(1, I32);
        assert_eq!(lower.resolve_local(0).unwrap(), (0, 4));
        assert_eq!(lower.resolve_local(1).unwrap(), (4, 8));
        assert_eq!(lower.resolve_local(2).unwrap(), (12, 4));
        assert!(lower.resolve_local(3).is_err());
    }

    #[test]
    fn if_else_patches_both_edges() {
        let mut lower = one_function(vec![I32], vec![I32]);
        lower.on_local_get(0).unwrap();
        lower.on_if(Some(I32));
        lower.on_i32_const(1);
        lower.on_else().unwrap();
        lower.on_i32_const(2);
        lower.on_end();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let code = module.function(0).code();
        let records: Vec<_> = code.records().collect();
        assert_eq!(
            records,
            vec![
                (0, Op::LocalGet),
                (9, Op::JumpIfFalse),
                (14, Op::I32Const),
                (19, Op::Jump),
                (24, Op::I32Const),
                (29, Op::End)
            ]
        );
        // False edge jumps to the else-branch's first record.
        assert_eq!(code.read_i32(10), 24 - 9);
        // The then-branch's jump skips to the block end.
        assert_eq!(code.read_i32(20), 29 - 19);
        assert_branch_targets_on_record_boundaries(&module);
    }

    #[test]
    fn if_without_else_targets_the_end() {
        let mut lower = one_function(vec![I32], vec![]);
        lower.on_local_get(0).unwrap();
        lower.on_if(None);
        lower.on_nop();
        lower.on_end();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let code = module.function(0).code();
        assert_eq!(code.op_at(9), Op::JumpIfFalse);
        assert_eq!(code.read_i32(10), 14 - 9);
        assert_eq!(code.op_at(14), Op::End);
        assert_branch_targets_on_record_boundaries(&module);
    }

    #[test]
    fn loop_gets_backward_branch_and_no_patch() {
        let mut lower = one_function(vec![I32], vec![]);
        lower.on_loop(None);
        lower.on_local_get(0).unwrap();
        lower.on_br_if(0).unwrap();
        lower.on_end();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let code = module.function(0).code();
        let records: Vec<_> = code.records().collect();
        assert_eq!(
            records,
            vec![(0, Op::LocalGet), (9, Op::JumpIfTrue), (14, Op::End)]
        );
        // Back to the loop header at offset 0, measured from the record.
        assert_eq!(code.read_i32(10), -9);
        assert_branch_targets_on_record_boundaries(&module);
    }

    #[test]
    fn branch_out_of_value_blocks_drops_their_results() {
        let mut lower = one_function(vec![], vec![]);
        lower.on_block(Some(I32));
        lower.on_block(Some(I32));
        lower.on_i32_const(7);
        lower.on_br(1).unwrap();
        lower.on_end();
        lower.on_end();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let code = module.function(0).code();
        let records: Vec<_> = code.records().collect();
        assert_eq!(
            records,
            vec![
                (0, Op::I32Const),
                (5, Op::Drop),
                (10, Op::Jump),
                (15, Op::End)
            ]
        );
        // One intervening i32 block result.
        assert_eq!(code.read_u32(6), 4);
        // Forward-patched to the outer block's end.
        assert_eq!(code.read_i32(11), 15 - 10);
        assert_branch_targets_on_record_boundaries(&module);
    }

    #[test]
    fn conditional_branch_with_drop_falls_through_past_the_jump() {
        let mut lower = one_function(vec![I32], vec![]);
        lower.on_block(None);
        lower.on_block(Some(I32));
        lower.on_i32_const(7);
        lower.on_local_get(0).unwrap();
        lower.on_br_if(1).unwrap();
        lower.on_drop();
        lower.on_end();
        lower.on_end();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let code = module.function(0).code();
        let records: Vec<_> = code.records().collect();
        assert_eq!(
            records,
            vec![
                (0, Op::I32Const),
                (5, Op::LocalGet),
                (14, Op::JumpIfFalse),
                (19, Op::Drop),
                (24, Op::Jump),
                (29, Op::Drop),
                (34, Op::End)
            ]
        );
        // Not taken: skip the drop-and-jump pair.
        assert_eq!(code.read_i32(15), 29 - 14);
        // Taken: drop the inner block's pending i32, then out.
        assert_eq!(code.read_u32(20), 4);
        assert_eq!(code.read_i32(25), 34 - 24);
        assert_branch_targets_on_record_boundaries(&module);
    }

    #[test]
    fn else_outside_if_is_rejected() {
        let mut lower = one_function(vec![], vec![]);
        assert_eq!(lower.on_else(), Err(DecodeError::MismatchedBlockStack));
        let mut lower = one_function(vec![], vec![]);
        assert_eq!(lower.on_br(3), Err(DecodeError::MismatchedBlockStack));
    }

    #[test]
    fn call_accounts_with_the_callee_signature() {
        let mut lower = Lowering::new();
        lower.on_func_type(vec![I32, I32], vec![I64]);
        lower.on_func_type(vec![], vec![]);
        lower.on_function(0).unwrap();
        lower.on_function(1).unwrap();
        lower.begin_body(1).unwrap();
        lower.on_i32_const(1);
        lower.on_i32_const(2);
        lower.on_call(0).unwrap();
        lower.on_drop();
        lower.on_end();
        lower.end_body().unwrap();
        let module = lower.finish();

        let func = module.function(1);
        // Two i32 args pushed (peak 8), call nets 8 - 8 = 8.
        assert_eq!(func.required_stack_size(), 8);
        let code = func.code();
        assert_eq!(code.op_at(10), Op::Call);
        assert_eq!(code.read_u32(11), 0);
        // The dropped value is the callee's 8-byte result.
        assert_eq!(code.op_at(15), Op::Drop);
        assert_eq!(code.read_u32(16), 8);
    }
}
