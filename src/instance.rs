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

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

use crate::interp;
use crate::module::{ExportKind, FuncType, Module};
use crate::stack::OperandStack;
use crate::trap::Trap;
use crate::{Value, ValueType};

/// A host function an instance's imports can bind to: a signature plus a
/// closure over typed values.
pub struct HostFunc {
    ty: FuncType,
    func: Box<dyn Fn(&[Value]) -> Result<Vec<Value>, Trap>>,
}

impl HostFunc {
    pub fn new(
        ty: FuncType,
        func: impl Fn(&[Value]) -> Result<Vec<Value>, Trap> + 'static,
    ) -> Self {
        HostFunc {
            ty,
            func: Box::new(func),
        }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub(crate) fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, Trap> {
        (self.func)(args)
    }
}

impl Debug for HostFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostFunc({:?})", self.ty)
    }
}

/// The set of host functions offered to `Store::instantiate`, keyed by
/// (module name, field name).
#[derive(Debug, Default)]
pub struct Imports {
    functions: HashMap<(String, String), HostFunc>,
}

impl Imports {
    pub fn new() -> Self {
        Imports::default()
    }

    pub fn define(&mut self, module: impl Into<String>, field: impl Into<String>, func: HostFunc) {
        self.functions.insert((module.into(), field.into()), func);
    }

    fn take(&mut self, module: &str, field: &str) -> Option<HostFunc> {
        self.functions.remove(&(module.to_string(), field.to_string()))
    }
}

#[derive(Debug)]
pub enum InstantiateError {
    MissingImport(String, String),
    ImportSignatureMismatch(String, String),
    InvalidStartFunction(u32),
    Trap(Trap),
}

impl Display for InstantiateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InstantiateError::MissingImport(module, field) => {
                write!(f, "Missing import: {module}.{field}")
            }
            InstantiateError::ImportSignatureMismatch(module, field) => {
                write!(f, "Import signature mismatch: {module}.{field}")
            }
            InstantiateError::InvalidStartFunction(index) => {
                write!(f, "Start function {index} must take and return nothing")
            }
            InstantiateError::Trap(trap) => write!(f, "Start function trapped: {trap}"),
        }
    }
}

impl Error for InstantiateError {}

#[derive(Debug)]
pub enum InvokeError {
    ExportNotFound(String),
    NotAFunction(String),
    ArgumentCountMismatch { expected: usize, actual: usize },
    ArgumentTypeMismatch(usize, ValueType, ValueType),
    Trap(Trap),
}

impl Display for InvokeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::ExportNotFound(name) => write!(f, "Export not found: {name}"),
            InvokeError::NotAFunction(name) => write!(f, "Export is not a function: {name}"),
            InvokeError::ArgumentCountMismatch { expected, actual } => {
                write!(f, "Argument count mismatch: expected {expected}, got {actual}")
            }
            InvokeError::ArgumentTypeMismatch(index, expected, actual) => write!(
                f,
                "Argument type mismatch at index {}: expected {:?}, got {:?}",
                index, expected, actual
            ),
            InvokeError::Trap(trap) => write!(f, "Trap: {trap}"),
        }
    }
}

impl Error for InvokeError {}

impl From<Trap> for InvokeError {
    fn from(trap: Trap) -> Self {
        InvokeError::Trap(trap)
    }
}

/// One function slot of an instance: defined bodies run in the interpreter,
/// imported slots hold their resolved host function.
#[derive(Debug)]
enum Binding {
    Wasm,
    Host(HostFunc),
}

/// A module bound to its imports. Immutable once instantiated; every
/// invocation owns its own operand stack, so one instance can serve any
/// number of executions.
#[derive(Debug)]
pub struct Instance {
    module: Rc<Module>,
    bindings: Vec<Binding>,
}

impl Instance {
    pub(crate) fn new(module: Rc<Module>, mut imports: Imports) -> Result<Self, InstantiateError> {
        let mut bindings = Vec::with_capacity(module.function_count() as usize);
        for import in module.imports() {
            let host = imports.take(&import.module, &import.field).ok_or_else(|| {
                InstantiateError::MissingImport(import.module.clone(), import.field.clone())
            })?;
            let declared = &module.types()[import.type_index as usize];
            if host.ty() != declared {
                return Err(InstantiateError::ImportSignatureMismatch(
                    import.module.clone(),
                    import.field.clone(),
                ));
            }
            bindings.push(Binding::Host(host));
        }
        for _ in module.imports().len()..module.function_count() as usize {
            bindings.push(Binding::Wasm);
        }
        Ok(Instance { module, bindings })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub(crate) fn host_function(&self, func_index: u32) -> Option<&HostFunc> {
        match &self.bindings[func_index as usize] {
            Binding::Host(host) => Some(host),
            Binding::Wasm => None,
        }
    }

    pub(crate) fn run_start(&self) -> Result<(), InstantiateError> {
        let Some(start) = self.module.start() else {
            return Ok(());
        };
        let ft = self.module.type_of_function(start);
        if !ft.params().is_empty() || !ft.results().is_empty() {
            return Err(InstantiateError::InvalidStartFunction(start));
        }
        let mut stack = OperandStack::new();
        let mut sp = 0;
        interp::call_function(self, start, &mut sp, &mut stack)
            .map_err(InstantiateError::Trap)
    }

    /// Execute an exported function: arguments go onto a fresh operand stack
    /// at the frame base, results come back off the top.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let export = self
            .module
            .export(name)
            .ok_or_else(|| InvokeError::ExportNotFound(name.to_string()))?;
        if export.kind != ExportKind::Function {
            return Err(InvokeError::NotAFunction(name.to_string()));
        }
        let func_index = export.index;
        let ft = self.module.type_of_function(func_index);

        if args.len() != ft.params().len() {
            return Err(InvokeError::ArgumentCountMismatch {
                expected: ft.params().len(),
                actual: args.len(),
            });
        }
        for (index, (&expected, arg)) in ft.params().iter().zip(args).enumerate() {
            if arg.kind() != expected {
                return Err(InvokeError::ArgumentTypeMismatch(index, expected, arg.kind()));
            }
        }

        let mut stack = OperandStack::new();
        stack.ensure(ft.param_stack_size() as usize);
        let mut at = 0usize;
        for arg in args {
            arg.write_to(&mut stack, at);
            at += arg.kind().stack_size() as usize;
        }
        let mut sp = at;
        interp::call_function(self, func_index, &mut sp, &mut stack)?;

        let mut results = Vec::with_capacity(ft.results().len());
        let mut cursor = sp - ft.result_stack_size() as usize;
        for &ty in ft.results() {
            results.push(Value::read_from(ty, &stack, cursor));
            cursor += ty.stack_size() as usize;
        }
        Ok(results)
    }
}
