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

use std::rc::Rc;

use crate::instance::{Imports, Instance, InstantiateError};
use crate::module::{FuncType, LoaderError, Module};
use crate::ValueType;

/// Owner of everything long-lived: loaded modules, their instances, and the
/// lazily built default function types. Dropping the store releases them all.
#[derive(Debug, Default)]
pub struct Store {
    modules: Vec<Rc<Module>>,
    instances: Vec<Rc<Instance>>,
    default_types: [Option<Rc<FuncType>>; ValueType::COUNT],
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Decode and lower a binary module, keeping ownership in the store.
    pub fn load_module(&mut self, data: &[u8]) -> Result<Rc<Module>, LoaderError> {
        let module = Rc::new(Module::load(data)?);
        self.modules.push(module.clone());
        Ok(module)
    }

    /// Bind a module's imports and run its start function, if any.
    pub fn instantiate(
        &mut self,
        module: &Rc<Module>,
        imports: Imports,
    ) -> Result<Rc<Instance>, InstantiateError> {
        let instance = Instance::new(module.clone(), imports)?;
        instance.run_start()?;
        let instance = Rc::new(instance);
        self.instances.push(instance.clone());
        Ok(instance)
    }

    /// The `[] -> [kind]` signature for a value kind, built on first use and
    /// cached for the store's lifetime.
    pub fn default_function_type(&mut self, kind: ValueType) -> Rc<FuncType> {
        self.default_types[kind.index()]
            .get_or_insert_with(|| Rc::new(FuncType::new(vec![], vec![kind])))
            .clone()
    }

    pub fn modules(&self) -> &[Rc<Module>] {
        &self.modules
    }

    pub fn instances(&self) -> &[Rc<Instance>] {
        &self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_function_types_are_cached_per_store() {
        let mut store = Store::new();
        let first = store.default_function_type(ValueType::I64);
        let second = store.default_function_type(ValueType::I64);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.params(), &[]);
        assert_eq!(first.results(), &[ValueType::I64]);
        assert_eq!(first.result_stack_size(), 8);

        let other = store.default_function_type(ValueType::F32);
        assert_eq!(other.results(), &[ValueType::F32]);
        assert!(!Rc::ptr_eq(&first, &other));
    }
}
