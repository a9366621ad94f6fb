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

//! Loading and lowering: section handling, error taxonomy, and the shape of
//! the emitted bytecode.

use waskit::{DecodeError, ExportKind, LoaderError, Module, Op};

fn load(wat: &str) -> Module {
    Module::load(&wat::parse_str(wat).expect("valid wat")).expect("module loads")
}

#[test]
fn rejects_bad_magic_and_version() {
    assert_eq!(
        Module::load(b"nope").unwrap_err(),
        LoaderError::InvalidMagicNumber
    );
    let mut binary = wat::parse_str("(module)").unwrap();
    binary[4] = 2;
    assert_eq!(Module::load(&binary).unwrap_err(), LoaderError::InvalidVersion);
}

#[test]
fn rejects_sections_outside_the_feature_set() {
    let binary = wat::parse_str("(module (memory 1))").unwrap();
    assert!(matches!(
        Module::load(&binary).unwrap_err(),
        LoaderError::UnsupportedSectionType(_)
    ));

    let binary = wat::parse_str("(module (table 1 funcref))").unwrap();
    assert!(matches!(
        Module::load(&binary).unwrap_err(),
        LoaderError::UnsupportedSectionType(_)
    ));
}

#[test]
fn rejects_unsupported_instructions_with_their_opcode() {
    let binary = wat::parse_str(
        r#"(module (func (result i32)
            (select (i32.const 1) (i32.const 2) (i32.const 1))))"#,
    )
    .unwrap();
    match Module::load(&binary).unwrap_err() {
        LoaderError::DecoderError(DecodeError::UnsupportedOpcode(opcode, _)) => {
            assert_eq!(opcode, 0x1B)
        }
        other => panic!("expected an unsupported opcode, got {other:?}"),
    }
}

#[test]
fn skips_custom_sections() {
    let mut binary = wat::parse_str(r#"(module (func (export "f")))"#).unwrap();
    // Append a custom section: id 0, 5 payload bytes, name "test".
    binary.extend_from_slice(&[0x00, 0x05, 0x04, b't', b'e', b's', b't']);
    let module = Module::load(&binary).unwrap();
    assert_eq!(module.export("f").map(|e| e.kind), Some(ExportKind::Function));
}

#[test]
fn imports_precede_defined_functions() {
    let module = load(
        r#"(module
            (import "env" "log" (func (param i64)))
            (func (export "f") (param i32) (result i32) (local.get 0)))"#,
    );
    assert_eq!(module.function_count(), 2);
    assert_eq!(module.imports().len(), 1);
    assert_eq!(module.imports()[0].module, "env");
    assert_eq!(module.imports()[0].field, "log");
    // Function 0 is the import, with its declared signature and no body.
    assert_eq!(
        module.type_of_function(0).params(),
        &[waskit::ValueType::I64]
    );
    assert!(module.function(0).code().is_empty());
    assert_eq!(module.export("f").unwrap().index, 1);
}

#[test]
fn version_is_recorded() {
    let module = load("(module)");
    assert_eq!(module.version(), 1);
}

#[test]
fn lowered_add_matches_the_expected_records() {
    let module = load(
        r#"(module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    );
    let code = module.function(0).code();
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
    assert_eq!((code.read_u32(1), code.read_u32(5)), (0, 4));
    assert_eq!((code.read_u32(10), code.read_u32(14)), (4, 4));
    assert_eq!(module.function(0).required_stack_size(), 16);
}

#[test]
fn every_branch_lands_on_a_record_boundary() {
    let module = load(
        r#"(module
            (func (export "classify") (param i32) (result i32) (local i32)
                (block $done
                    (if (i32.lt_s (local.get 0) (i32.const 0))
                        (then (local.set 1 (i32.const -1)) (br $done)))
                    (loop $halve
                        (local.set 1 (i32.add (local.get 1) (i32.const 1)))
                        (local.set 0 (i32.div_u (local.get 0) (i32.const 2)))
                        (br_if $halve (local.get 0))))
                (local.get 1)))"#,
    );
    for index in 0..module.function_count() {
        let code = module.function(index).code();
        let starts: Vec<usize> = code.records().map(|(at, _)| at).collect();
        for (at, op) in code.records() {
            if matches!(op, Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse) {
                let target = (at as i64 + code.read_i32(at + 1) as i64) as usize;
                assert!(
                    starts.contains(&target),
                    "branch at {at} targets {target}, not a record start"
                );
            }
        }
    }
}

#[test]
fn stack_budget_covers_parameters_and_locals() {
    let module = load(
        r#"(module
            (func (param i64 f64) (local i32 i64)
                (local.set 2 (i32.const 1)))
            (func (param f32) (result f64)
                (f64.promote_f32 (local.get 0))))"#,
    );
    for index in 0..module.function_count() {
        let func = module.function(index);
        let ft = module.type_of_function(index);
        assert!(
            func.required_stack_size()
                >= ft.param_stack_size() + func.required_stack_size_due_to_local(),
            "function {index} budget below its frame floor"
        );
    }
    // 16 bytes of params, 12 of locals, then a 4-byte constant.
    assert_eq!(module.function(0).required_stack_size_due_to_local(), 12);
    assert_eq!(module.function(0).required_stack_size(), 32);
}

#[test]
fn bytecode_debug_disassembles_records() {
    let module = load(
        r#"(module
            (func (result i32) (i32.add (i32.const 40) (i32.const 2))))"#,
    );
    let dump = format!("{:?}", module.function(0).code());
    assert!(dump.contains("I32Const"));
    assert!(dump.contains("I32Add"));
    assert!(dump.contains("End"));
}

#[test]
fn function_bodies_end_with_an_end_record() {
    let module = load(
        r#"(module
            (func)
            (func (param i32) (result i32) (local.get 0)))"#,
    );
    for index in 0..module.function_count() {
        let code = module.function(index).code();
        let last = code.records().last().unwrap();
        assert_eq!(last.1, Op::End);
    }
}
